//! branchoff tests, deploys and tears down every branch of a git repository.

mod cli;
mod config;
mod server;

use anyhow::{Context, Result};
use branchoff_deploy::{
    Branchoff, BranchoffBuilder, DeployRequest, DeploymentContext, FileRegistry, Launched, Mode,
    Registry, ResolveOptions, RestoreOptions, Settings, Supervisor,
};
use clap::Parser;
use comfy_table::{Table, presets::UTF8_FULL};

use cli::{Cli, Command, DeployArgs, DestroyArgs, ServeArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match cli.command {
        None => serve(&cli, &ServeArgs::default()).await,
        Some(Command::Serve(ref args)) => serve(&cli, args).await,
        Some(Command::Ignite) => {
            let code = ignite(&config::load(&cli, None)?).await?;
            std::process::exit(code);
        }
        Some(Command::Deploy(ref args)) => deploy(&config::load(&cli, None)?, args).await,
        Some(Command::Destroy(ref args)) => destroy(&config::load(&cli, None)?, args).await,
        Some(Command::Ecosystem) => ecosystem(&config::load(&cli, None)?).await,
    }
}

fn build(settings: &Settings) -> Result<Branchoff> {
    BranchoffBuilder::from_settings(settings.clone()).build()
}

async fn serve(cli: &Cli, args: &ServeArgs) -> Result<()> {
    let settings = config::load(cli, args.port)?;
    let branchoff = build(&settings)?;

    tracing::info!(
        state_dir = %settings.state_dir.display(),
        ports = ?settings.ports,
        "Starting branchoff server..."
    );

    if args.no_restore {
        tracing::info!("Skipping restore of the ecosystem");
    } else {
        // Replays are queued ahead of any webhook; the server does not wait for them.
        let _ = branchoff
            .restore(RestoreOptions::default())
            .await
            .context("Failed to restore the ecosystem")?;
    }

    let state = server::AppState::new(branchoff, settings.webhook_secret.clone());
    server::serve(state, settings.listen_port).await
}

async fn ignite(settings: &Settings) -> Result<i32> {
    let branchoff = build(settings)?;
    let cwd = std::env::current_dir().context("Failed to read the current directory")?;

    let workspace = branchoff.supervisor().workspace();
    let uri = workspace.current_remote(&cwd).await?;
    let branch = workspace.current_branch(&cwd).await?;
    let ctx = branchoff.resolve(
        &uri,
        &branch,
        ResolveOptions::default().mode(Mode::Local).dir(&cwd),
    )?;

    tracing::info!(context = %ctx, "Igniting local deployment");

    branchoff
        .registry()
        .save(&ctx)
        .await
        .context("Failed to register the local deployment")?;
    branchoff.supervisor().provision(&ctx).await?;
    branchoff.supervisor().run_attached(&ctx).await
}

async fn deploy(settings: &Settings, args: &DeployArgs) -> Result<()> {
    let branchoff = build(settings)?;
    let request = DeployRequest::from(args.clone());

    match branchoff.deploy(&request)? {
        Launched::Test(handle) => {
            let report = handle.wait().await?;
            println!("{}", report.output);
            if !report.passed() {
                anyhow::bail!("Tests failed with exit code {}", report.exit_code);
            }
            println!("Tests passed");
        }
        Launched::Deployment(handle) => {
            let ctx = handle.wait().await?;
            println!("Deployed {ctx}");

            // Instances belong to this process.
            let running = branchoff.supervisor().status().await;
            if running.contains_key(&ctx.id) {
                println!("Running until ctrl-c...");
                tokio::signal::ctrl_c()
                    .await
                    .context("Failed to listen for ctrl-c")?;
            }
        }
    }

    Ok(())
}

async fn destroy(settings: &Settings, args: &DestroyArgs) -> Result<()> {
    let branchoff = build(settings)?;
    branchoff
        .destroy(&args.uri, &args.branch, args.mode)?
        .wait()
        .await?;
    println!("Destroyed {}@{}", args.uri, args.branch);
    Ok(())
}

/// Reads the registry directly, so it also works while a server owns the state dir.
async fn ecosystem(settings: &Settings) -> Result<()> {
    let registered = FileRegistry::new(&settings.state_dir).list_all().await?;

    if registered.is_empty() {
        println!("No registered deployments");
        return Ok(());
    }

    // Running instances are only known to the owning process, see `/ecosystem`.
    println!("{}", ecosystem_table(registered.values()));
    Ok(())
}

fn ecosystem_table<'a>(contexts: impl IntoIterator<Item = &'a DeploymentContext>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["ID", "Repository", "Branch", "Mode", "Scale", "Directory"]);

    for ctx in contexts {
        table.add_row(vec![
            ctx.id.to_string(),
            ctx.uri.clone(),
            ctx.branch.clone(),
            ctx.mode.to_string(),
            ctx.instances().to_string(),
            ctx.dir.display().to_string(),
        ]);
    }

    table
}
