//! Discover command: list plugin files and their metadata.

use std::path::PathBuf;

use anyhow::{Context, Result};

use plugin_runtime::plugins::PluginLoader;

use super::common::load_config;

pub(crate) fn cmd_discover(config_path: Option<PathBuf>, dir: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path.as_deref(), dir)?;
    let loader = PluginLoader::from_config(&config);

    let results = loader
        .load_all()
        .with_context(|| format!("Failed to scan {}", loader.plugin_dir().display()))?;

    if results.is_empty() {
        println!("No plugins found in {}", loader.plugin_dir().display());
        return Ok(());
    }

    println!("Plugins in {}:", loader.plugin_dir().display());
    for entry in results {
        match entry.result {
            Ok(loaded) => {
                let m = &loaded.metadata;
                println!("  {} v{} by {} ({})", m.id, m.version, m.author, entry.path.display());
                if !m.description.is_empty() {
                    println!("      {}", m.description);
                }
                if !m.permissions.is_empty() {
                    println!("      permissions: {}", m.permissions.join(", "));
                }
                if !m.hooks.is_empty() {
                    println!("      hooks: {}", m.hooks.join(", "));
                }
                if !m.dependencies.is_empty() {
                    println!("      dependencies: {}", m.dependencies.join(", "));
                }
            }
            Err(e) => println!("  ! {}: {}", entry.path.display(), e),
        }
    }
    Ok(())
}
