//! docsync CLI
//!
//! Command-line editor surface for docsync - keeps a file synchronized with
//! a remote analysis service.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use docsync_core::Config;

mod commands;
mod output;
mod watcher;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "docsync")]
#[command(about = "docsync - keep a document in sync with a remote analysis service")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// WebSocket URL of the analysis service (overrides config)
    #[arg(long, global = true)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize a file and print the acknowledged state
    Sync {
        /// File to synchronize
        file: PathBuf,
    },
    /// Format a file, or a range of it
    Format {
        /// File to format
        file: PathBuf,
        /// Write the result back to the file
        #[arg(short, long)]
        write: bool,
        /// Start of the range to format (chars)
        #[arg(long, requires = "to")]
        from: Option<usize>,
        /// End of the range to format (chars)
        #[arg(long, requires = "from")]
        to: Option<usize>,
    },
    /// Show hover information at an offset
    Hover {
        file: PathBuf,
        /// Caret offset (chars)
        #[arg(short, long)]
        offset: usize,
    },
    /// List occurrences of the symbol at an offset
    Occurrences {
        file: PathBuf,
        /// Caret offset (chars)
        #[arg(short, long)]
        offset: usize,
    },
    /// List completion proposals at an offset
    Assist {
        file: PathBuf,
        /// Caret offset (chars)
        #[arg(short, long)]
        offset: usize,
        /// Maximum number of proposals
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Keep a file synchronized while it is being edited
    Watch { file: PathBuf },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (endpoint, log_level, connection.open_timeout_ms, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands don't need a connection
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(config_path, &output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, config_path, &output)
            }
        };
    }

    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = Some(endpoint);
    }
    init_logging(&config)?;

    if config.endpoint.is_none() {
        bail!(
            "No analysis service configured.\n\
             Pass --endpoint or run: docsync config set endpoint ws://localhost:1313/xtext-service"
        );
    }

    match cli.command {
        Commands::Sync { file } => commands::session::sync(&config, &file, &output).await,
        Commands::Format {
            file,
            write,
            from,
            to,
        } => {
            let range = from.zip(to);
            commands::session::format(&config, &file, range, write, &output).await
        }
        Commands::Hover { file, offset } => {
            commands::session::hover(&config, &file, offset, &output).await
        }
        Commands::Occurrences { file, offset } => {
            commands::session::occurrences(&config, &file, offset, &output).await
        }
        Commands::Assist {
            file,
            offset,
            limit,
        } => commands::session::assist(&config, &file, offset, limit, &output).await,
        Commands::Watch { file } => commands::session::watch(&config, &file, &output).await,
        Commands::Config { .. } => Ok(()), // Handled above
    }
}

/// Install the tracing subscriber
///
/// `RUST_LOG` wins over the configured level.
fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "docsync_core={},docsync_cli={}",
            config.log_level, config.log_level
        ))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    // Ignore errors if a subscriber is already set
    match config.log_file {
        Some(ref path) => {
            let log_file = File::create(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let _ = builder.with_ansi(false).with_writer(log_file).try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }

    Ok(())
}
