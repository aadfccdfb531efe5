use crate::registry::ChecksumAlgorithm;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for preset-fetch
#[derive(Error, Debug)]
pub enum PresetError {
    #[error("Registry unavailable: fetch failed ({fetch}) and no usable cache ({cache})\n\nTroubleshooting:\n- Check network access to the registry source\n- Verify registry.source in config or PRESET_FETCH_REGISTRY\n- Run `preset-fetch sync` once while online to seed the cache")]
    RegistryUnavailable { fetch: String, cache: String },

    #[error("Invalid registry document: {0}")]
    RegistryInvalid(String),

    #[error("No cached registry at {}", .0.display())]
    NoCache(PathBuf),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/preset-fetch/config.toml\n- Run with RUST_LOG=debug for more details")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors that abort resolution before any download starts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Manifest conflict for '{path}': presets '{first_preset}' and '{second_preset}' declare different artifacts\n\nTroubleshooting:\n- The registry data is inconsistent; refresh it with `preset-fetch sync`\n- Report the conflicting presets to the registry maintainers")]
    ManifestConflict {
        path: String,
        first_preset: String,
        second_preset: String,
    },
}

/// Failure of a single transfer attempt
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Transfer interrupted: {0}")]
    Stream(String),

    #[error("Local write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cancelled")]
    Cancelled,
}

impl FetchError {
    /// Classify a reqwest error
    #[must_use]
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
                url: err.url().map(ToString::to_string).unwrap_or_default(),
            }
        } else {
            Self::Stream(err.to_string())
        }
    }

    /// Network-side failures are retried; local failures and cancellation are not
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Connect(_) | Self::Status { .. } | Self::Stream(_)
        )
    }

    /// True when the local filesystem ran out of space
    #[must_use]
    pub fn is_disk_full(&self) -> bool {
        match self {
            Self::Io(e) => e.raw_os_error() == Some(nix::libc::ENOSPC),
            _ => false,
        }
    }
}

/// Integrity verification failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Checksum mismatch ({algorithm}): expected {expected}, got {actual}")]
    ChecksumMismatch {
        algorithm: ChecksumAlgorithm,
        expected: String,
        actual: String,
    },

    #[error("IO error while verifying: {0}")]
    Io(String),
}

impl From<std::io::Error> for IntegrityError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PresetError>;
