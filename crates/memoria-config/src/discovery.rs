//! Config file discovery and layered merging.
//!
//! Resolution order (later overrides earlier):
//! 1. `~/.config/memoria/config.toml` (user config)
//! 2. `./memoria.toml` (project-local)
//! 3. CLI arguments (handled externally)
//!
//! Layers are merged as TOML tables before deserialization, so a key set in
//! the user config survives unless the project file sets the same key.

use std::path::{Path, PathBuf};

use crate::{ConfigError, MemoriaConfig, Result};

/// Default config filename for project-local config.
const PROJECT_CONFIG_FILE: &str = "memoria.toml";

/// Default config filename within the user config directory.
const USER_CONFIG_FILE: &str = "config.toml";

/// Application name for platform directory resolution.
const APP_NAME: &str = "memoria";

/// Environment variable to override the config directory.
const CONFIG_DIR_ENV: &str = "MEMORIA_CONFIG_DIR";

/// Environment variable to override the data directory.
const DATA_DIR_ENV: &str = "MEMORIA_DATA_DIR";

/// Tracks where each config layer was loaded from.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    /// Path to the config file.
    pub path: PathBuf,
    /// Whether the file was found and loaded.
    pub loaded: bool,
}

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The merged, validated configuration.
    pub config: MemoriaConfig,
    /// Sources that were checked, in order of precedence (lowest first).
    pub sources: Vec<ConfigSource>,
    /// Warnings generated during loading (e.g., plaintext API keys).
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Get paths of sources that were actually loaded.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// Load configuration by discovering and merging all config layers.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Load configuration with explicit control over the user config directory.
///
/// `config_dir` overrides both `MEMORIA_CONFIG_DIR` and the platform default.
/// Unlike a missing file, a malformed or invalid file is an error: the engine
/// refuses to start on a config it cannot fully understand.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut merged = toml::Table::new();
    let mut sources = Vec::new();

    let user_config_path = match config_dir {
        Some(dir) => Some(dir.join(USER_CONFIG_FILE)),
        None => user_config_path(),
    };
    if let Some(path) = user_config_path {
        sources.push(load_layer(&mut merged, &path)?);
    }

    let project_path = project_dir
        .map(|d| d.join(PROJECT_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));
    sources.push(load_layer(&mut merged, &project_path)?);

    let config: MemoriaConfig = toml::Value::Table(merged).try_into()?;
    config.validate()?;

    Ok(LoadedConfig {
        warnings: plaintext_key_warnings(&config),
        config,
        sources,
    })
}

/// Load config from a specific file path (no discovery).
pub fn load_config_file(path: &Path) -> Result<MemoriaConfig> {
    let contents = read_file(path)?;
    MemoriaConfig::from_toml(&contents)
}

/// Load a single explicit file, wrapped as a [`LoadedConfig`].
pub fn load_explicit(path: &Path) -> Result<LoadedConfig> {
    let config = load_config_file(path)?;
    Ok(LoadedConfig {
        warnings: plaintext_key_warnings(&config),
        config,
        sources: vec![ConfigSource {
            path: path.to_path_buf(),
            loaded: true,
        }],
    })
}

/// Save configuration to a file.
///
/// Creates parent directories if they don't exist.
pub fn save_config(config: &MemoriaConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
            path: parent.display().to_string(),
            source: e,
        })?;
    }

    let contents = config.to_toml()?;
    std::fs::write(path, contents).map_err(|e| ConfigError::WriteFile {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(())
}

/// Get the user config file path.
pub fn user_config_path() -> Option<PathBuf> {
    user_config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// Get the user config directory.
///
/// Checks `MEMORIA_CONFIG_DIR` first, then falls back to the platform default.
pub fn user_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

/// Resolve the data directory.
///
/// Priority: explicit override > `MEMORIA_DATA_DIR` > `storage.data_dir` >
/// platform data dir > `./.memoria`.
pub fn resolve_data_dir(config: &MemoriaConfig, explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Ok(dir) = std::env::var(DATA_DIR_ENV)
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    if let Some(dir) = &config.storage.data_dir {
        return expand_home(dir);
    }
    dirs::data_dir()
        .map(|d| d.join(APP_NAME))
        .unwrap_or_else(|| PathBuf::from(".memoria"))
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })
}

/// Parse a config file and deep-merge it into the accumulated table.
fn load_layer(merged: &mut toml::Table, path: &Path) -> Result<ConfigSource> {
    if !path.is_file() {
        return Ok(ConfigSource {
            path: path.to_path_buf(),
            loaded: false,
        });
    }

    let layer: toml::Table = read_file(path)?.parse()?;
    merge_tables(merged, layer);
    Ok(ConfigSource {
        path: path.to_path_buf(),
        loaded: true,
    })
}

/// Recursively merge `overlay` into `base`. Tables merge key by key; any
/// other value (arrays included) replaces the base value wholesale.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        let toml::Value::Table(incoming) = value else {
            base.insert(key, value);
            continue;
        };
        if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
            merge_tables(existing, incoming);
            continue;
        }
        base.insert(key, toml::Value::Table(incoming));
    }
}

fn plaintext_key_warnings(config: &MemoriaConfig) -> Vec<String> {
    config
        .plaintext_key_sections()
        .into_iter()
        .map(|section| {
            format!(
                "{} contains a plaintext API key. Consider api_key_env instead.",
                section
            )
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
