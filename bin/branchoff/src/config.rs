//! Layered settings: defaults, settings file, environment, command line.

use anyhow::{Context, Result};
use branchoff_deploy::{SETTINGS_FILENAME, Settings};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::cli::Cli;

/// Prefix of the environment variables overriding settings, e.g.
/// `BRANCHOFF_LISTEN_PORT` or `BRANCHOFF_PORTS__START`.
const ENV_PREFIX: &str = "BRANCHOFF_";

pub fn load(cli: &Cli, listen_port: Option<u16>) -> Result<Settings> {
    let mut figment = Figment::from(Serialized::defaults(Settings::default()));

    if let Some(path) = &cli.config {
        let path = if path.is_dir() {
            path.join(SETTINGS_FILENAME)
        } else {
            path.clone()
        };
        anyhow::ensure!(path.exists(), "Settings file not found: {}", path.display());
        tracing::debug!(path = %path.display(), "Loading settings file");
        figment = figment.merge(Toml::file(path));
    }

    let mut settings: Settings = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("Failed to load settings")?;

    if let Some(state_dir) = &cli.state_dir {
        settings.state_dir = state_dir.clone();
    }
    if let Some(start) = cli.start_port {
        settings.ports.start = start;
    }
    if let Some(end) = cli.end_port {
        settings.ports.end = end;
    }
    if let Some(port) = listen_port {
        settings.listen_port = port;
    }

    settings.validate()?;
    Ok(settings)
}
