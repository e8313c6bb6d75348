use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::common::TrustArgs;

#[derive(Parser)]
#[command(name = "plugin-runtime")]
#[command(about = "Load, verify and hot reload host plugins", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ~/.plugin-runtime/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List plugin files and their metadata
    Discover {
        /// Plugin directory to scan
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Load every plugin and report load failures and dependency conflicts
    Check {
        #[arg(short, long)]
        dir: Option<PathBuf>,
        #[command(flatten)]
        trust: TrustArgs,
        /// Print the dependency graph in Graphviz format
        #[arg(long)]
        dot: bool,
    },
    /// Sign plugin files with a fresh key pair
    Sign {
        /// Plugin files to sign
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Where to write the signatures
        #[arg(short, long, default_value = "signatures.json")]
        out: PathBuf,
        /// Where to write the public key
        #[arg(long, default_value = "signer.pem")]
        key_out: PathBuf,
    },
    /// Load every plugin and reload plugins whose files change
    Watch {
        #[arg(short, long)]
        dir: Option<PathBuf>,
        #[command(flatten)]
        trust: TrustArgs,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Some(Commands::Version) | None => {
            println!("plugin-runtime {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Discover { dir }) => {
            cli::discover::cmd_discover(cli.config, dir)?;
        }
        Some(Commands::Check { dir, trust, dot }) => {
            cli::check::cmd_check(cli.config, dir, trust, dot).await?;
        }
        Some(Commands::Sign {
            files,
            out,
            key_out,
        }) => {
            cli::sign::cmd_sign(cli.config, files, out, key_out)?;
        }
        Some(Commands::Watch { dir, trust }) => {
            cli::watch::cmd_watch(cli.config, dir, trust).await?;
        }
    }

    Ok(())
}
