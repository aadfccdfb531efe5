//! Preset catalog: data model, document validation, loading and sync.
//!
//! A [`Registry`] is parsed from a JSON document (see [`schema::parse`]) and is
//! immutable for the duration of a run. [`RegistryLoader`] fetches it from a
//! remote or local source and keeps a local cache for offline fallback.

pub mod loader;
pub mod schema;
pub mod sync;

pub use loader::{LoadedRegistry, RegistryLoader, RegistryOrigin, RegistrySource};
pub use sync::{sync, DriftEntry, HubRevisionProbe, RevisionProbe, SyncReport, UncheckedEntry};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Registry document header
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryMetadata {
    pub version: String,
    #[serde(default)]
    pub generated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Operator-facing notice carried by the registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alert {
    #[serde(default = "default_alert_level")]
    pub level: String,
    pub message: String,
}

fn default_alert_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    /// Length of the hex digest
    #[must_use]
    pub const fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => f.write_str("sha256"),
            Self::Sha512 => f.write_str("sha512"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub value: String,
}

/// Immutable upstream version identifier for a file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourcePin {
    pub revision: String,
}

/// One remote artifact and where it lands under the target root
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileSpec {
    pub path: String,
    pub url: String,
    /// Declared size in bytes, 0 when unknown
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourcePin>,
}

impl FileSpec {
    /// Final location of this file under `root`
    #[must_use]
    pub fn target_path(&self, root: &Path) -> PathBuf {
        root.join(&self.path)
    }

    #[must_use]
    pub fn revision(&self) -> Option<&str> {
        self.source.as_ref().map(|s| s.revision.as_str())
    }

    /// Whether two specs for the same path describe the same bytes
    #[must_use]
    pub fn same_artifact(&self, other: &Self) -> bool {
        if self.size != other.size || self.checksum != other.checksum {
            return false;
        }
        // Without a checksum the URL is the only identity we have
        self.checksum.is_some() || self.url == other.url
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Requirements {
    #[serde(default)]
    pub vram_gb: Option<f64>,
    #[serde(default)]
    pub disk_gb: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelVersion {
    #[serde(default)]
    pub upstream_version: Option<String>,
    #[serde(default)]
    pub update_available: bool,
}

/// A named bundle of files plus metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresetDescriptor {
    /// Filled from the registry key when omitted
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Human readable total size, e.g. "24.6 GB"
    pub size: String,
    pub update_available: bool,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<ModelVersion>,
}

impl PresetDescriptor {
    /// Sum of declared file sizes
    #[must_use]
    pub fn declared_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Either update flag is set
    #[must_use]
    pub fn has_update(&self) -> bool {
        self.update_available
            || self
                .model_version
                .as_ref()
                .is_some_and(|v| v.update_available)
    }
}

/// Versioned preset catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Registry {
    pub metadata: RegistryMetadata,
    pub categories: BTreeMap<String, Category>,
    pub presets: BTreeMap<String, PresetDescriptor>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

impl Registry {
    /// Parse and validate a registry document
    pub fn from_json(text: &str) -> crate::Result<Self> {
        schema::parse(text)
    }

    /// Find preset by id
    #[must_use]
    pub fn find(&self, id: &str) -> Option<&PresetDescriptor> {
        self.presets.get(id)
    }

    /// Get all preset ids
    #[must_use]
    pub fn all_ids(&self) -> Vec<&str> {
        self.presets.keys().map(String::as_str).collect()
    }

    /// Presets in a category, in id order
    #[must_use]
    pub fn by_category(&self, category: &str) -> Vec<&PresetDescriptor> {
        self.presets
            .values()
            .filter(|p| p.category == category)
            .collect()
    }

    /// Find closest preset id using Levenshtein distance
    #[must_use]
    pub fn suggest(&self, id: &str) -> Option<&str> {
        if id.is_empty() {
            return None;
        }

        self.presets
            .keys()
            .map(|candidate| (candidate.as_str(), levenshtein_distance(id, candidate)))
            .min_by_key(|(_, dist)| *dist)
            .filter(|(_, dist)| *dist <= 2) // Only suggest if within 2 edits
            .map(|(candidate, _)| candidate)
    }
}

/// Calculate Levenshtein distance between two strings
#[allow(clippy::needless_range_loop)]
fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let len1 = s1.chars().count();
    let len2 = s2.chars().count();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0; len2 + 1]; len1 + 1];

    for i in 0..=len1 {
        matrix[i][0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();

    for (i, c1) in s1_chars.iter().enumerate() {
        for (j, c2) in s2_chars.iter().enumerate() {
            let cost = usize::from(c1 != c2);
            matrix[i + 1][j + 1] = (matrix[i][j + 1] + 1)
                .min(matrix[i + 1][j] + 1)
                .min(matrix[i][j] + cost);
        }
    }

    matrix[len1][len2]
}
