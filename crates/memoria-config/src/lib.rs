//! Configuration system for the Memoria memory engine.
//!
//! Provides a single explicit [`MemoriaConfig`] struct with:
//! - TOML parsing that rejects unknown keys
//! - Range and consistency validation at load time
//! - Config file layering (user config + project-local overrides)
//! - Data directory resolution (`MEMORIA_DATA_DIR`, config, platform default)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options,
    load_explicit, resolve_data_dir, save_config, user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
