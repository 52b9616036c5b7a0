//! Chat Relay
//!
//! Store-and-forward server for chat messages and file transfers.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use relay::config::{default_config_path, Config};
use relay::orchestrator::{RelayEvent, RelayOrchestrator};

/// Chat Relay - routes messages and files between connected clients.
#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the relay.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the relay server
    Start {
        /// Override the packet port
        #[arg(long)]
        port: Option<u16>,

        /// Override the file transfer port
        #[arg(long)]
        file_port: Option<u16>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Start { port, file_port } => {
            let mut config = load_config(&config_path)?;
            if let Some(port) = port {
                config.server.packet_port = port;
            }
            if file_port.is_some() {
                config.server.file_port = file_port;
            }
            config.validate()?;

            let _guard = init_tracing(&config, cli.verbose)?;
            tracing::info!("Chat relay starting...");
            tracing::info!("Using config file: {:?}", config_path);

            let mut orchestrator = RelayOrchestrator::new(config);
            run_headless(&mut orchestrator).await?;
        }
        Commands::Config(ConfigCommands::Show) => {
            let config = load_config(&config_path)?;
            config.validate()?;
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            init_config(&config_path, force)?;
        }
    }

    Ok(())
}

/// Load the config file and apply environment overrides.
fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut config = Config::load(path)?;
    config.apply_env_overrides();
    Ok(config)
}

/// Initialize tracing, adding a daily rolling file when `logging.log_dir` is set.
///
/// The returned guard flushes the file writer on drop.
fn init_tracing(
    config: &Config,
    verbose: bool,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::EnvFilter;

    let level = if verbose {
        "debug"
    } else {
        config.logging.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.logging.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "chat-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Run the relay until a shutdown signal arrives.
async fn run_headless(orchestrator: &mut RelayOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RelayEvent::StateChanged(state) => {
                    tracing::info!("Relay state: {:?}", state);
                }
                RelayEvent::UserOnline { user_id } => {
                    tracing::debug!("User online: {}", user_id);
                }
                RelayEvent::UserOffline { user_id, reason } => {
                    tracing::debug!("User offline: {} ({})", user_id, reason);
                }
                RelayEvent::FileStaged {
                    transfer_id,
                    delivered,
                } => {
                    tracing::debug!("File {} announced to {} recipients", transfer_id, delivered);
                }
                RelayEvent::TransfersSwept { count } => {
                    tracing::info!("Swept {} expired transfers", count);
                }
            }
        }
    });

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["chat-relay", "start"]).unwrap();
        match cli.command {
            Commands::Start { port, file_port } => {
                assert!(port.is_none());
                assert!(file_port.is_none());
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_start_with_ports() {
        let cli =
            Cli::try_parse_from(["chat-relay", "start", "--port", "7000", "--file-port", "7001"])
                .unwrap();
        match cli.command {
            Commands::Start { port, file_port } => {
                assert_eq!(port, Some(7000));
                assert_eq!(file_port, Some(7001));
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_config_show() {
        let cli = Cli::try_parse_from(["chat-relay", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Show)));
    }

    #[test]
    fn test_config_init_force() {
        let cli = Cli::try_parse_from(["chat-relay", "config", "init", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Init { force: true })
        ));
    }

    #[test]
    fn test_global_flags() {
        let cli =
            Cli::try_parse_from(["chat-relay", "-v", "-c", "/tmp/relay.toml", "start"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/relay.toml")));
    }

    #[test]
    fn test_init_config_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        init_config(&path, false).unwrap();
        assert!(path.exists());
        assert!(init_config(&path, false).is_err());
        init_config(&path, true).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, Config::default());
    }
}
