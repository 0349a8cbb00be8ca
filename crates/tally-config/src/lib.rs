//! Configuration for tally.
//!
//! TOML files layered from the user config directory and the working
//! directory, with three sections: `[storage]`, `[flush]` and `[logging]`.

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options,
    save_config, xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
