use std::path::PathBuf;

use branchoff_deploy::{DEFAULT_BRANCH, DeployRequest, Mode};
use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "branchoff")]
#[command(
    author,
    version,
    about = "Test, deploy and tear down every branch of a git repository"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "BRANCHOFF_VERBOSITY", default_value_t = LevelFilter::INFO, global = true)]
    pub verbosity: LevelFilter,

    /// Path to a settings file (or a directory containing `settings.toml`).
    ///
    /// Settings are layered: defaults, then this file, then `BRANCHOFF_*`
    /// environment variables, then command line flags.
    #[arg(short, long, env = "BRANCHOFF_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the ecosystem registry and the workspaces.
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// First port handed out to deployments.
    #[arg(short = 's', long, global = true)]
    pub start_port: Option<u16>,

    /// Last port handed out to deployments.
    #[arg(short = 'e', long, global = true)]
    pub end_port: Option<u16>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Serve the webhook and operator endpoints. This is the default command.
    Serve(ServeArgs),

    /// Deploy the checkout in the current directory in local mode and run it in the
    /// foreground.
    Ignite,

    /// Test a branch and deploy it if the tests pass.
    Deploy(DeployArgs),

    /// Tear down the deployment of a branch.
    Destroy(DestroyArgs),

    /// List the registered deployments.
    Ecosystem,
}

#[derive(Args, Default)]
pub struct ServeArgs {
    /// The port to listen on.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Do not replay the registered deployments on startup.
    #[arg(long)]
    pub no_restore: bool,
}

#[derive(Args, Clone)]
pub struct DeployArgs {
    /// Repository to deploy.
    pub uri: String,

    /// Branch to deploy.
    #[arg(short, long, default_value = DEFAULT_BRANCH)]
    pub branch: String,

    /// Number of instances to run.
    #[arg(long)]
    pub scale: Option<u32>,

    /// Deployment mode. `test` only runs the tests.
    #[arg(short, long)]
    pub mode: Option<Mode>,

    /// Update an existing deployment.
    #[arg(short, long)]
    pub update: bool,
}

impl From<DeployArgs> for DeployRequest {
    fn from(args: DeployArgs) -> Self {
        Self {
            uri: args.uri,
            branch: args.branch,
            scale: args.scale,
            mode: args.mode,
            update: args.update,
        }
    }
}

#[derive(Args)]
pub struct DestroyArgs {
    /// Repository of the deployment.
    pub uri: String,

    /// Branch of the deployment.
    #[arg(short, long, default_value = DEFAULT_BRANCH)]
    pub branch: String,

    /// Deployment mode.
    #[arg(short, long)]
    pub mode: Option<Mode>,
}
