use super::{Alert, FileSpec, RegistryLoader, RegistryOrigin};
use crate::error::{PresetError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Looks up the revision an upstream source currently serves
#[async_trait]
pub trait RevisionProbe: Send + Sync {
    /// `Ok(None)` when the source is not one this probe understands
    async fn upstream_revision(&self, spec: &FileSpec) -> Result<Option<String>>;
}

/// Probe for Hugging Face Hub style URLs
/// (`{endpoint}/{owner}/{repo}/resolve/{revision}/{file}`)
pub struct HubRevisionProbe {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    // repo -> current head revision
    cache: Mutex<HashMap<String, String>>,
}

impl HubRevisionProbe {
    #[must_use]
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
            cache: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Extract the repo id from a resolve URL
    #[must_use]
    pub fn repo_of(&self, url: &str) -> Option<String> {
        let rest = url.strip_prefix(&self.endpoint)?.strip_prefix('/')?;
        let (repo, tail) = rest.split_once("/resolve/")?;
        if repo.is_empty() || tail.is_empty() {
            return None;
        }
        Some(repo.to_string())
    }
}

#[async_trait]
impl RevisionProbe for HubRevisionProbe {
    async fn upstream_revision(&self, spec: &FileSpec) -> Result<Option<String>> {
        let Some(repo) = self.repo_of(&spec.url) else {
            return Ok(None);
        };

        let cached = self.cache.lock().get(&repo).cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let url = format!("{}/api/models/{repo}", self.endpoint);
        let body: serde_json::Value = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| PresetError::Http(format!("GET {url}: {e}")))?
            .error_for_status()
            .map_err(|e| PresetError::Http(format!("GET {url}: {e}")))?
            .json()
            .await
            .map_err(|e| PresetError::Http(format!("Failed to parse {url}: {e}")))?;

        let sha = body["sha"]
            .as_str()
            .ok_or_else(|| PresetError::Http(format!("Missing 'sha' field in {url}")))?
            .to_string();

        self.cache.lock().insert(repo, sha.clone());
        Ok(Some(sha))
    }
}

/// A pinned file whose upstream has moved on
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DriftEntry {
    pub preset_id: String,
    pub path: String,
    pub pinned: String,
    pub upstream: String,
}

/// A pinned file whose upstream could not be checked
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UncheckedEntry {
    pub preset_id: String,
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    /// False when the remote fetch failed and the cache was used
    pub refreshed: bool,
    pub version: String,
    pub generated_at: String,
    pub preset_count: usize,
    pub updates_available: Vec<String>,
    pub drift: Vec<DriftEntry>,
    pub unchecked: Vec<UncheckedEntry>,
    pub alerts: Vec<Alert>,
}

impl SyncReport {
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.drift.is_empty()
    }
}

/// Refresh the registry cache and report drift without downloading payloads
pub async fn sync(loader: &RegistryLoader, probe: &dyn RevisionProbe) -> Result<SyncReport> {
    let loaded = loader.load().await?;
    let registry = &loaded.registry;

    let mut drift = Vec::new();
    let mut unchecked = Vec::new();

    for preset in registry.presets.values() {
        for file in &preset.files {
            let Some(pinned) = file.revision() else {
                continue;
            };

            match probe.upstream_revision(file).await {
                Ok(Some(upstream)) if upstream != pinned => {
                    tracing::info!(
                        "Drift in {}/{}: pinned {pinned}, upstream {upstream}",
                        preset.id,
                        file.path
                    );
                    drift.push(DriftEntry {
                        preset_id: preset.id.clone(),
                        path: file.path.clone(),
                        pinned: pinned.to_string(),
                        upstream,
                    });
                }
                Ok(Some(_)) => {}
                Ok(None) => unchecked.push(UncheckedEntry {
                    preset_id: preset.id.clone(),
                    path: file.path.clone(),
                    reason: "source does not expose revisions".to_string(),
                }),
                Err(e) => {
                    tracing::warn!("Revision check failed for {}: {e}", file.url);
                    unchecked.push(UncheckedEntry {
                        preset_id: preset.id.clone(),
                        path: file.path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    let updates_available = registry
        .presets
        .values()
        .filter(|p| p.has_update())
        .map(|p| p.id.clone())
        .collect();

    Ok(SyncReport {
        refreshed: loaded.origin == RegistryOrigin::Remote,
        version: registry.metadata.version.clone(),
        generated_at: registry.metadata.generated_at.clone(),
        preset_count: registry.presets.len(),
        updates_available,
        drift,
        unchecked,
        alerts: registry.alerts.clone(),
    })
}
