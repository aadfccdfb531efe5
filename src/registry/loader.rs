use super::{schema, Registry};
use crate::config::schema::RegistryConfig;
use crate::error::{PresetError, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the registry document comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrySource {
    Remote(String),
    File(PathBuf),
}

impl RegistrySource {
    /// `http(s)://` values are remote, anything else is a local path
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.starts_with("http://") || value.starts_with("https://") {
            Self::Remote(value.to_string())
        } else {
            Self::File(PathBuf::from(value))
        }
    }
}

impl fmt::Display for RegistrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(url) => f.write_str(url),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryOrigin {
    /// Freshly fetched from the configured source
    Remote,
    /// Fallback to the last good local copy
    Cache,
}

#[derive(Debug, Clone)]
pub struct LoadedRegistry {
    pub registry: Registry,
    pub origin: RegistryOrigin,
    /// Why the fresh fetch failed when `origin` is `Cache`
    pub degraded_reason: Option<String>,
}

/// Registry loader with local cache fallback
pub struct RegistryLoader {
    client: reqwest::Client,
    source: Option<RegistrySource>,
    cache_path: PathBuf,
    timeout: Duration,
}

impl RegistryLoader {
    /// Create new loader
    #[must_use]
    pub fn new(source: Option<RegistrySource>, cache_path: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            source,
            cache_path,
            timeout: Duration::from_secs(30),
        }
    }

    /// Create loader from config
    pub fn from_config(config: &RegistryConfig) -> Result<Self> {
        let cache_path = config.resolved_cache_path()?;
        let source = config.source.as_deref().map(RegistrySource::parse);
        Ok(Self::new(source, cache_path).with_timeout(Duration::from_secs(config.timeout_secs)))
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    #[must_use]
    pub const fn source(&self) -> Option<&RegistrySource> {
        self.source.as_ref()
    }

    /// Fetch and validate the registry, falling back to the cache
    pub async fn load(&self) -> Result<LoadedRegistry> {
        match self.fetch_validated().await {
            Ok((registry, text)) => {
                // A failed cache write only costs us the offline fallback
                if let Err(e) = write_atomic(&self.cache_path, text.as_bytes()) {
                    tracing::warn!(
                        "Failed to update registry cache at {}: {e}",
                        self.cache_path.display()
                    );
                }
                tracing::info!(
                    "Loaded registry {} ({} presets)",
                    registry.metadata.version,
                    registry.presets.len()
                );
                Ok(LoadedRegistry {
                    registry,
                    origin: RegistryOrigin::Remote,
                    degraded_reason: None,
                })
            }
            Err(fetch_err) => {
                tracing::warn!("Registry fetch failed: {fetch_err}; trying local cache");
                match self.load_cached() {
                    Ok(registry) => {
                        tracing::warn!(
                            "Using cached registry {} from {}",
                            registry.metadata.version,
                            self.cache_path.display()
                        );
                        Ok(LoadedRegistry {
                            registry,
                            origin: RegistryOrigin::Cache,
                            degraded_reason: Some(fetch_err.to_string()),
                        })
                    }
                    Err(cache_err) => Err(PresetError::RegistryUnavailable {
                        fetch: fetch_err.to_string(),
                        cache: cache_err.to_string(),
                    }),
                }
            }
        }
    }

    /// Load only the cached copy
    pub fn load_cached(&self) -> Result<Registry> {
        if !self.cache_path.exists() {
            return Err(PresetError::NoCache(self.cache_path.clone()));
        }

        let text = fs::read_to_string(&self.cache_path)?;
        schema::parse(&text)
    }

    async fn fetch_validated(&self) -> Result<(Registry, String)> {
        let text = self.fetch_text().await?;
        let registry = schema::parse(&text)?;
        Ok((registry, text))
    }

    async fn fetch_text(&self) -> Result<String> {
        let Some(source) = &self.source else {
            return Err(PresetError::Config(
                "no registry source configured".to_string(),
            ));
        };

        tracing::debug!("Fetching registry from {source}");

        match source {
            RegistrySource::Remote(url) => {
                let response = self
                    .client
                    .get(url)
                    .timeout(self.timeout)
                    .send()
                    .await
                    .map_err(|e| PresetError::Http(format!("GET {url}: {e}")))?
                    .error_for_status()
                    .map_err(|e| PresetError::Http(format!("GET {url}: {e}")))?;

                response
                    .text()
                    .await
                    .map_err(|e| PresetError::Http(format!("Failed to read registry body: {e}")))
            }
            RegistrySource::File(path) => Ok(tokio::fs::read_to_string(path).await?),
        }
    }
}

/// Save bytes atomically (tmp + rename)
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Temp file lives next to the target so the rename stays on one filesystem
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    let tmp_path = path.with_file_name(tmp_name);

    fs::write(&tmp_path, bytes)?;

    // Atomic rename
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::SAMPLE;
    use tempfile::TempDir;

    #[test]
    fn test_source_parse() {
        assert_eq!(
            RegistrySource::parse("https://example.invalid/registry.json"),
            RegistrySource::Remote("https://example.invalid/registry.json".to_string())
        );
        assert_eq!(
            RegistrySource::parse("/etc/presets/registry.json"),
            RegistrySource::File(PathBuf::from("/etc/presets/registry.json"))
        );
    }

    #[tokio::test]
    async fn test_load_from_file_writes_cache() {
        let temp_dir = TempDir::new().unwrap();
        let doc = temp_dir.path().join("registry.json");
        let cache = temp_dir.path().join("cache/registry.json");
        fs::write(&doc, SAMPLE).unwrap();

        let loader = RegistryLoader::new(Some(RegistrySource::File(doc)), cache.clone());
        let loaded = loader.load().await.unwrap();

        assert_eq!(loaded.origin, RegistryOrigin::Remote);
        assert!(loaded.degraded_reason.is_none());
        assert!(cache.exists());
        assert_eq!(loader.load_cached().unwrap(), loaded.registry);
    }

    #[tokio::test]
    async fn test_falls_back_to_cache() {
        let temp_dir = TempDir::new().unwrap();
        let cache = temp_dir.path().join("registry.json");
        fs::write(&cache, SAMPLE).unwrap();

        let missing = temp_dir.path().join("missing.json");
        let loader = RegistryLoader::new(Some(RegistrySource::File(missing)), cache);
        let loaded = loader.load().await.unwrap();

        assert_eq!(loaded.origin, RegistryOrigin::Cache);
        assert!(loaded.degraded_reason.is_some());
        assert!(loaded.registry.find("wan-t2v").is_some());
    }

    #[tokio::test]
    async fn test_invalid_fetch_keeps_previous_cache() {
        let temp_dir = TempDir::new().unwrap();
        let doc = temp_dir.path().join("registry.json");
        let cache = temp_dir.path().join("cache.json");
        fs::write(&cache, SAMPLE).unwrap();
        fs::write(&doc, r#"{"metadata": {"version": "2.0"}}"#).unwrap();

        let loader = RegistryLoader::new(Some(RegistrySource::File(doc)), cache.clone());
        let loaded = loader.load().await.unwrap();

        assert_eq!(loaded.origin, RegistryOrigin::Cache);
        assert!(loaded
            .degraded_reason
            .unwrap()
            .contains("missing required sections"));
        assert_eq!(fs::read_to_string(&cache).unwrap(), SAMPLE);
    }

    #[tokio::test]
    async fn test_unavailable_without_cache() {
        let temp_dir = TempDir::new().unwrap();
        let loader = RegistryLoader::new(None, temp_dir.path().join("none.json"));

        let err = loader.load().await.unwrap_err();
        assert!(matches!(err, PresetError::RegistryUnavailable { .. }));
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/file.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
