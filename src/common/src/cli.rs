use clap::{Args, Subcommand};
use std::path::PathBuf;

/// Common CLI arguments shared across all binaries
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Subcommands shared by every binary
#[derive(Subcommand, Debug, Clone)]
pub enum CommonCommands {
    /// Show the effective configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Default log level implied by the verbosity flags.
    pub fn default_log_level(args: &CommonArgs) -> &'static str {
        if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Initialize logging based on CLI arguments. `RUST_LOG` takes precedence.
    pub fn init_logging(args: &CommonArgs) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_log_level(args)));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        let config = match config_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading configuration");
                Configuration::load_from_path(path).context("Failed to load configuration")?
            }
            None => Configuration::load().context("Failed to load configuration")?,
        };

        validate_config(&config)?;
        Ok(config)
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("runpruner configuration:");
            println!("========================");
            println!("Instance ID: {}", config.pruner.resolved_instance_id());
            match &config.pruner.policy_path {
                Some(path) => println!("Policy path: {}", path.display()),
                None => println!("Policy path: <none>"),
            }
            println!("Dry run: {}", config.pruner.dry_run);
            println!("Lock timeout: {:?}", config.lock.timeout);
            println!("Dedup window: {:?}", config.dedup.window);
            println!("Dedup retention: {:?}", config.dedup.retention);
            println!("Dedup sweep interval: {:?}", config.dedup.sweep_interval);
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        config
            .validate()
            .map_err(|message| anyhow::anyhow!("Invalid configuration: {message}"))
    }

    /// Version line for a binary, e.g. `version_info(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))`.
    pub fn version_info(name: &str, version: &str) -> String {
        format!(
            "{name} {version} (rust {})",
            env!("CARGO_PKG_RUST_VERSION")
        )
    }

    /// Handle a shared subcommand.
    pub fn handle_common_command(
        command: &CommonCommands,
        config: &Configuration,
        name: &str,
        version: &str,
    ) -> Result<()> {
        match command {
            CommonCommands::Config { json } => display_config(config, *json),
            CommonCommands::Version => {
                println!("{}", version_info(name, version));
                Ok(())
            }
        }
    }
}
