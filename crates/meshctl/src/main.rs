//! meshctl — schedule and deploy emulated network labs.
//!
//! ```text
//! meshctl schedule lab.toml --strategy hierarchical
//! meshctl deploy lab.toml
//! meshctl deploy lab.toml --device pc1
//! meshctl info lab.toml --format json
//! meshctl undeploy lab.toml --device r1 --device r2
//! meshctl wipe
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use meshlab_core::Settings;
use meshlab_deployer::Deployer;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod commands;
mod manifest;

#[derive(Parser)]
#[command(
    name = "meshctl",
    about = "MeshLab — network emulation labs spread over cluster nodes",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Settings file (default: $XDG_CONFIG_HOME/meshlab/meshlab.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the placement of a lab and print it as JSON
    Schedule {
        /// Lab manifest (TOML or JSON)
        manifest: PathBuf,
        /// Partition strategy (round_robin, spectral, hierarchical)
        #[arg(short, long)]
        strategy: Option<String>,
        /// Use the binary affinity matrix without protocol hints
        #[arg(long)]
        binary: bool,
    },
    /// Deploy a lab, or only some of its devices
    Deploy {
        manifest: PathBuf,
        #[arg(short, long)]
        strategy: Option<String>,
        #[arg(long)]
        binary: bool,
        /// Device to deploy; repeat for several
        #[arg(short, long = "device")]
        devices: Vec<String>,
    },
    /// Undeploy a lab, or only some of its devices
    Undeploy {
        manifest: PathBuf,
        /// Device to remove; repeat for several
        #[arg(short, long = "device")]
        devices: Vec<String>,
    },
    /// Undeploy every lab on the backend
    Wipe,
    /// Show the deployed devices of a lab
    Info {
        manifest: PathBuf,
        #[arg(short, long = "device")]
        devices: Vec<String>,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("meshctl=info,meshlab=info"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json)?;

    let settings = Settings::load(cli.config.as_deref())?;
    debug!(backend = %settings.general.backend, strategy = %settings.scheduler.strategy, "settings loaded");
    let backend = meshlab_deployer::connect_backend(&settings)?;
    let deployer = Deployer::new(backend, &settings);

    match cli.command {
        Commands::Schedule { manifest, strategy, binary } => {
            commands::schedule::schedule(&deployer, &manifest, strategy.as_deref(), binary).await
        }
        Commands::Deploy {
            manifest,
            strategy,
            binary,
            devices,
        } => commands::lab::deploy(&deployer, &manifest, strategy.as_deref(), binary, &devices).await,
        Commands::Undeploy { manifest, devices } => {
            commands::lab::undeploy(&deployer, &manifest, &devices).await
        }
        Commands::Wipe => commands::lab::wipe(&deployer).await,
        Commands::Info { manifest, devices, format } => {
            commands::lab::info(&deployer, &manifest, &devices, &format).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn undeploy_collects_repeated_devices() {
        let cli = Cli::parse_from(["meshctl", "undeploy", "lab.toml", "-d", "r1", "--device", "r2"]);
        match cli.command {
            Commands::Undeploy { devices, .. } => assert_eq!(devices, vec!["r1", "r2"]),
            _ => panic!("expected undeploy"),
        }
    }

    #[test]
    fn deploy_accepts_a_device_selection() {
        let cli = Cli::parse_from(["meshctl", "deploy", "lab.toml", "--binary", "-d", "pc1"]);
        match cli.command {
            Commands::Deploy { devices, binary, .. } => {
                assert_eq!(devices, vec!["pc1"]);
                assert!(binary);
            }
            _ => panic!("expected deploy"),
        }

        let cli = Cli::parse_from(["meshctl", "deploy", "lab.toml"]);
        assert!(matches!(cli.command, Commands::Deploy { devices, .. } if devices.is_empty()));
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::parse_from(["meshctl", "wipe", "--json", "--config", "/tmp/m.toml"]);
        assert!(cli.json);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/tmp/m.toml")));
    }
}
