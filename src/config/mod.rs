//! Configuration module for preset-fetch
//!
//! Loads config from `$XDG_CONFIG_HOME/preset-fetch/config.toml` or `~/.config/preset-fetch/config.toml`.
//! Falls back to defaults if the file doesn't exist.
//! Partial configs are merged with defaults using serde's default attributes.
//! `PRESET_FETCH_REGISTRY` and `PRESET_FETCH_TARGET` override the file; the preset
//! selection is read from the variable named by `selection.env` (`PRESET_DOWNLOAD`).
//!
//! # Example
//!
//! ```no_run
//! use preset_fetch::config::Config;
//!
//! let config = Config::load().expect("Failed to load config");
//! println!("Target root: {}", config.download.target_root.display());
//! println!("Concurrency: {}", config.download.concurrency);
//! ```

pub mod schema;

pub use schema::Config;
