//! Sign command: sign plugin files with a fresh key pair.
//!
//! Writes the signatures and the public key, which `check --signatures
//! --public-key` and `watch` accept to trust them in another process.

use std::path::PathBuf;

use anyhow::{Context, Result};

use plugin_runtime::plugins::PluginLoader;
use plugin_runtime::security::SignatureVerifier;

use super::common::load_config;

pub(crate) fn cmd_sign(
    config_path: Option<PathBuf>,
    files: Vec<PathBuf>,
    out: PathBuf,
    key_out: PathBuf,
) -> Result<()> {
    let config = load_config(config_path.as_deref(), None)?;
    let loader = PluginLoader::from_config(&config);
    let verifier = SignatureVerifier::new(&config.security);
    verifier
        .generate_key_pair()
        .with_context(|| "Failed to generate signing key")?;

    for file in &files {
        let loaded = loader
            .load_plugin(file)
            .with_context(|| format!("Failed to read plugin {}", file.display()))?;
        let signature = verifier.sign_plugin(&loaded.metadata.id, file)?;
        println!(
            "Signed {} ({}) sha256:{}",
            loaded.metadata.id,
            file.display(),
            signature.hash
        );
    }

    verifier.export_signatures(&out)?;
    let pem = verifier
        .public_key_pem()
        .with_context(|| "Signing key disappeared")?;
    std::fs::write(&key_out, pem)
        .with_context(|| format!("Failed to write public key {}", key_out.display()))?;

    println!("Signatures written to {}", out.display());
    println!("Public key written to {}", key_out.display());
    Ok(())
}
