//! Helpers shared by the CLI commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::warn;

use plugin_runtime::hooks::NoopEngineFactory;
use plugin_runtime::plugins::LoadReport;
use plugin_runtime::{PluginManager, RuntimeConfig};

/// Options for trusting signatures made by another process.
#[derive(Args, Debug, Clone, Default)]
pub(crate) struct TrustArgs {
    /// Signatures JSON written by `sign`
    #[arg(long)]
    pub signatures: Option<PathBuf>,
    /// PEM public key of the signer
    #[arg(long)]
    pub public_key: Option<PathBuf>,
    /// Name the public key is trusted under
    #[arg(long, default_value = "plugin-runtime")]
    pub signer: String,
    /// Load plugins without checking signatures
    #[arg(long)]
    pub insecure: bool,
}

/// Load configuration from `config_path` or the default location, with
/// `plugin_dir` taking precedence over both.
pub(crate) fn load_config(
    config_path: Option<&Path>,
    plugin_dir: Option<PathBuf>,
) -> Result<RuntimeConfig> {
    let mut config = match config_path {
        Some(path) => RuntimeConfig::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => RuntimeConfig::load().with_context(|| "Failed to load configuration")?,
    };
    if let Some(dir) = plugin_dir {
        config.plugin_dir = dir;
    }
    Ok(config)
}

/// Build a manager and apply the trust options to its verifier.
pub(crate) fn create_manager(
    mut config: RuntimeConfig,
    trust: &TrustArgs,
) -> Result<Arc<PluginManager>> {
    if trust.insecure {
        warn!("Signature verification disabled");
        config.security.require_signatures = false;
    }

    let manager = PluginManager::new(config, Arc::new(NoopEngineFactory))
        .with_context(|| "Failed to create plugin manager")?;

    if let Some(path) = &trust.public_key {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read public key {}", path.display()))?;
        manager.verifier().add_trusted_key(&trust.signer, &pem)?;
    }
    if let Some(path) = &trust.signatures {
        manager
            .verifier()
            .import_signatures(path)
            .with_context(|| format!("Failed to import signatures from {}", path.display()))?;
    }
    Ok(manager)
}

pub(crate) fn print_load_report(report: &LoadReport) {
    println!("Loaded {} plugin(s)", report.loaded.len());
    for id in &report.loaded {
        println!("  + {}", id);
    }
    if !report.failed.is_empty() {
        println!("Failed to load {} plugin(s)", report.failed.len());
        for (path, error) in &report.failed {
            println!("  - {}: {}", path.display(), error);
        }
    }
}
