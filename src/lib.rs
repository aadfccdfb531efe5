#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod download;
pub mod error;
pub mod integrity;
pub mod progress;
pub mod registry;
pub mod resolver;

pub use error::{PresetError, Result};
