//! Plugin discovery and loading
//!
//! This module finds plugin files in the configured directory, reads their
//! code, and extracts metadata. Metadata comes from a sidecar JSON manifest
//! next to the plugin (`backup.lua` -> `backup.json`) when one exists,
//! otherwise from the leading comment header of the plugin file:
//!
//! ```text
//! -- @id auto-backup
//! -- @name Auto Backup
//! -- @version 1.2.0
//! -- @author Jane
//! -- @description Writes a backup before every save
//! -- @permissions read_save, write_save
//! -- @hooks save:save
//! -- @dependencies core-utils@^1.0
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};

use super::types::PluginMetadata;

/// Matches one `-- @key value` header line.
static HEADER_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^--+\s*@([A-Za-z_]+)\s*(.*?)\s*$").expect("header regex is valid")
});

/// Sidecar manifest for the plugin at `path` (`backup.lua` -> `backup.json`).
///
/// `None` when `path` is itself a JSON file.
pub fn manifest_path(path: &Path) -> Option<PathBuf> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    (!is_json).then(|| path.with_extension("json"))
}

/// A plugin file read from disk together with its parsed metadata.
#[derive(Debug, Clone)]
pub struct LoadedPlugin {
    pub path: PathBuf,
    pub source: String,
    pub metadata: PluginMetadata,
}

/// Outcome of loading one discovered file during a bulk load.
#[derive(Debug)]
pub struct PluginLoadResult {
    pub path: PathBuf,
    pub result: Result<LoadedPlugin>,
}

impl PluginLoadResult {
    pub fn is_error(&self) -> bool {
        self.result.is_err()
    }
}

/// Discovers and reads plugin files from a single directory.
#[derive(Debug, Clone)]
pub struct PluginLoader {
    plugin_dir: PathBuf,
    extensions: Vec<String>,
    max_file_size: u64,
}

impl PluginLoader {
    pub fn new(plugin_dir: PathBuf, extensions: Vec<String>, max_file_size: u64) -> Self {
        Self {
            plugin_dir,
            extensions,
            max_file_size,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            config.plugin_dir.clone(),
            config.extensions.clone(),
            config.max_file_size,
        )
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    fn has_known_extension(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.extensions
            .iter()
            .any(|known| known.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }

    /// List plugin files in the plugin directory, sorted by path.
    ///
    /// A missing directory yields an empty list.
    pub fn discover_plugins(&self) -> Result<Vec<PathBuf>> {
        let dir = &self.plugin_dir;
        if !dir.exists() {
            info!(dir = %dir.display(), "Plugin directory does not exist, skipping");
            return Ok(Vec::new());
        }
        if !dir.is_dir() {
            return Err(RuntimeError::Config(format!(
                "Plugin path {} is not a directory",
                dir.display()
            )));
        }

        let entries = fs::read_dir(dir).map_err(|e| {
            RuntimeError::Config(format!(
                "Failed to read plugin directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && self.has_known_extension(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Check that `path` names a readable plugin file within the size limit.
    pub fn validate_plugin_file(&self, path: &Path) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(RuntimeError::InvalidMetadata(
                "plugin path is empty".to_string(),
            ));
        }
        let meta = fs::metadata(path).map_err(|e| {
            RuntimeError::InvalidMetadata(format!(
                "plugin file {} not found: {}",
                path.display(),
                e
            ))
        })?;
        if meta.is_dir() {
            return Err(RuntimeError::InvalidMetadata(format!(
                "plugin path {} is a directory, not a file",
                path.display()
            )));
        }
        if !self.has_known_extension(path) {
            return Err(RuntimeError::InvalidMetadata(format!(
                "plugin {} must have one of the extensions {:?}",
                path.display(),
                self.extensions
            )));
        }
        if meta.len() > self.max_file_size {
            return Err(RuntimeError::InvalidMetadata(format!(
                "plugin file {} is too large ({} bytes, max {})",
                path.display(),
                meta.len(),
                self.max_file_size
            )));
        }
        Ok(())
    }

    /// Read and validate a plugin file, then parse its metadata.
    pub fn load_plugin(&self, path: &Path) -> Result<LoadedPlugin> {
        self.validate_plugin_file(path)?;
        let source = fs::read_to_string(path)?;
        if source.trim().is_empty() {
            return Err(RuntimeError::InvalidMetadata(format!(
                "plugin {} is empty",
                path.display()
            )));
        }

        let metadata = match manifest_path(path).filter(|m| m.is_file()) {
            Some(manifest) => {
                let content = fs::read_to_string(&manifest)?;
                serde_json::from_str::<PluginMetadata>(&content)?
            }
            None => parse_metadata_header(&source),
        };
        metadata.validate()?;

        Ok(LoadedPlugin {
            path: path.to_path_buf(),
            source,
            metadata,
        })
    }

    /// Load every discovered plugin, keeping failures alongside successes.
    pub fn load_all(&self) -> Result<Vec<PluginLoadResult>> {
        let results = self
            .discover_plugins()?
            .into_iter()
            .map(|path| {
                let result = self.load_plugin(&path);
                if let Err(e) = &result {
                    warn!(path = %path.display(), error = %e, "Failed to load plugin, skipping");
                }
                PluginLoadResult { path, result }
            })
            .collect();
        Ok(results)
    }
}

/// Parse the leading `-- @key value` comment block of a plugin file.
///
/// Parsing stops at the first line that is neither blank nor a comment.
/// Unknown keys are ignored. List keys accept comma-separated values.
pub fn parse_metadata_header(source: &str) -> PluginMetadata {
    let mut metadata = PluginMetadata::default();

    for line in source.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if !line.starts_with("--") {
            break;
        }
        let Some(caps) = HEADER_LINE.captures(line) else {
            continue;
        };
        let key = caps[1].to_ascii_lowercase();
        let value = caps[2].to_string();

        match key.as_str() {
            "id" => metadata.id = value,
            "name" => metadata.name = value,
            "version" => metadata.version = value,
            "author" => metadata.author = value,
            "description" => metadata.description = value,
            "homepage" => metadata.homepage = Some(value),
            "license" => metadata.license = Some(value),
            "tags" => metadata.tags = split_list(&value),
            "permissions" => metadata.permissions = split_list(&value),
            "hooks" => metadata.hooks = split_list(&value),
            "dependencies" => metadata.dependencies = split_list(&value),
            "min_app_version" => metadata.min_app_version = Some(value),
            "max_app_version" => metadata.max_app_version = Some(value),
            _ => {}
        }
    }

    metadata
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
