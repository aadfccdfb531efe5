use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::net::TcpListener;

use preset_fetch::config::schema::RegistryConfig;
use preset_fetch::download::lease::{self, LeaseAttempt};
use preset_fetch::download::{FailureKind, Scheduler, SchedulerOptions, TaskState};
use preset_fetch::progress::{ProgressEvent, RunId, StateStore};
use preset_fetch::registry::{FileSpec, RegistryLoader, RegistryOrigin};
use preset_fetch::resolver;

/// Files served by the test server; `flaky` fails this many times first
#[derive(Default)]
struct ServerState {
    files: HashMap<String, Vec<u8>>,
    flaky: HashMap<String, u32>,
    hits: parking_lot::Mutex<HashMap<String, u32>>,
    registry: String,
    registry_hits: AtomicU32,
}

impl ServerState {
    fn hits(&self, name: &str) -> u32 {
        self.hits.lock().get(name).copied().unwrap_or(0)
    }
}

async fn serve_file(
    State(state): State<Arc<ServerState>>,
    UrlPath(name): UrlPath<String>,
) -> impl IntoResponse {
    let hit = {
        let mut hits = state.hits.lock();
        let count = hits.entry(name.clone()).or_insert(0);
        *count += 1;
        *count
    };

    if state.flaky.get(&name).is_some_and(|fails| hit <= *fails) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match state.files.get(&name) {
        Some(body) => (StatusCode::OK, body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve_registry(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    state.registry_hits.fetch_add(1, Ordering::SeqCst);
    (StatusCode::OK, state.registry.clone())
}

async fn start_server(state: Arc<ServerState>) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let app = Router::new()
        .route("/files/:name", get(serve_file))
        .route("/registry.json", get(serve_registry))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, handle)
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn options() -> SchedulerOptions {
    SchedulerOptions {
        concurrency: 2,
        max_attempts: 3,
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
        lease_wait: Duration::from_millis(200),
        min_free_bytes: 0,
        ..SchedulerOptions::default()
    }
}

fn file_json(addr: SocketAddr, path: &str, name: &str, body: &[u8]) -> String {
    format!(
        r#"{{"path": "{path}", "url": "http://{addr}/files/{name}", "size": {}, "checksum": {{"algorithm": "sha256", "value": "{}"}}}}"#,
        body.len(),
        sha256_hex(body)
    )
}

/// Two presets sharing a VAE, one depending on a third
fn registry_json(addr: SocketAddr) -> String {
    let vae = file_json(addr, "vae/shared.bin", "shared", b"shared-vae");
    format!(
        r#"{{
  "metadata": {{"version": "2.0", "generated_at": "2026-01-01T00:00:00Z"}},
  "categories": {{"image": {{"name": "Image"}}}},
  "presets": {{
    "alpha": {{"name": "Alpha", "category": "image", "size": "1 KB", "update_available": false,
      "depends_on": ["encoder"],
      "files": [{}, {vae}]}},
    "beta": {{"name": "Beta", "category": "image", "size": "1 KB", "update_available": true,
      "files": [{}, {vae}]}},
    "encoder": {{"name": "Encoder", "category": "image", "size": "1 KB", "update_available": false,
      "files": [{}]}}
  }},
  "alerts": []
}}"#,
        file_json(addr, "checkpoints/alpha.bin", "alpha", b"alpha-weights"),
        file_json(addr, "checkpoints/beta.bin", "beta", b"beta-weights"),
        file_json(addr, "text_encoders/enc.bin", "encoder", b"encoder"),
    )
}

fn payloads() -> HashMap<String, Vec<u8>> {
    [
        ("alpha", &b"alpha-weights"[..]),
        ("beta", b"beta-weights"),
        ("encoder", b"encoder"),
        ("shared", b"shared-vae"),
    ]
    .into_iter()
    .map(|(name, body)| (name.to_string(), body.to_vec()))
    .collect()
}

/// Bind once to learn the address, then serve the registry that points at it
async fn start_registry_server() -> (Arc<ServerState>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState {
        files: payloads(),
        registry: registry_json(addr),
        ..ServerState::default()
    });
    let app = Router::new()
        .route("/files/:name", get(serve_file))
        .route("/registry.json", get(serve_registry))
        .with_state(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, addr)
}

fn loader_for(addr: SocketAddr, cache: &Path) -> RegistryLoader {
    RegistryLoader::from_config(&RegistryConfig {
        source: Some(format!("http://{addr}/registry.json")),
        cache_path: Some(cache.to_path_buf()),
        ..RegistryConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_end_to_end_download_is_idempotent() {
    let (server, addr) = start_registry_server().await;
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("models");
    let loaded = loader_for(addr, &temp_dir.path().join("registry.json"))
        .load()
        .await
        .unwrap();
    assert_eq!(loaded.origin, RegistryOrigin::Remote);

    let resolution = resolver::resolve(&["alpha", "NOPE", "beta"], &loaded.registry).unwrap();
    assert_eq!(resolution.unknown.len(), 1);
    assert_eq!(resolution.unknown[0].id, "NOPE");
    // encoder, alpha, shared vae, beta: the VAE appears once
    assert_eq!(resolution.manifest.len(), 4);

    let scheduler = Scheduler::http(options(), StateStore::new()).unwrap();
    let first = scheduler
        .run(&resolution.manifest, &root)
        .await
        .with_resolution(&resolution);
    assert_eq!(first.counts.downloaded, 4);
    assert!(first.is_success());
    assert_eq!(server.hits("shared"), 1);
    assert_eq!(
        std::fs::read(root.join("vae/shared.bin")).unwrap(),
        b"shared-vae"
    );
    assert!(!root.join("vae/shared.bin.part").exists());

    let second = scheduler.run(&resolution.manifest, &root).await;
    assert_eq!(second.counts.skipped, 4);
    assert_eq!(second.counts.downloaded, 0);
    assert_eq!(server.hits("alpha"), 1);
}

#[tokio::test]
async fn test_registry_cache_fallback() {
    let (server, addr) = start_registry_server().await;
    let temp_dir = TempDir::new().unwrap();
    let cache = temp_dir.path().join("cache/registry.json");

    loader_for(addr, &cache).load().await.unwrap();
    assert_eq!(server.registry_hits.load(Ordering::SeqCst), 1);
    assert!(cache.exists());

    // Nothing listens on port 9 of localhost
    let offline = RegistryLoader::from_config(&RegistryConfig {
        source: Some("http://127.0.0.1:9/registry.json".to_string()),
        cache_path: Some(cache.clone()),
        ..RegistryConfig::default()
    })
    .unwrap();
    let loaded = offline.load().await.unwrap();
    assert_eq!(loaded.origin, RegistryOrigin::Cache);
    assert!(loaded.degraded_reason.is_some());
    assert_eq!(loaded.registry.presets.len(), 3);
}

#[tokio::test]
async fn test_terminal_report_names_corrupt_file() {
    let ok = b"0123456789".to_vec();
    let corrupt = b"not-the-declared-bytes".to_vec();
    let state = Arc::new(ServerState {
        files: [("ok".to_string(), ok), ("corrupt".to_string(), corrupt)]
            .into_iter()
            .collect(),
        ..ServerState::default()
    });
    let (addr, _handle) = start_server(Arc::clone(&state)).await;
    let temp_dir = TempDir::new().unwrap();

    let manifest = [
        FileSpec {
            path: "ok.bin".to_string(),
            url: format!("http://{addr}/files/ok"),
            size: 10,
            checksum: None,
            source: None,
        },
        FileSpec {
            path: "corrupt.bin".to_string(),
            url: format!("http://{addr}/files/corrupt"),
            size: 22,
            checksum: Some(preset_fetch::registry::Checksum {
                algorithm: preset_fetch::registry::ChecksumAlgorithm::Sha256,
                value: sha256_hex(b"the-declared-bytes-xyz"),
            }),
            source: None,
        },
    ]
    .into_iter()
    .map(|spec| resolver::ManifestEntry {
        preset_id: "p".to_string(),
        required_by: vec!["p".to_string()],
        spec,
    })
    .collect();

    let scheduler = Scheduler::http(options(), StateStore::new()).unwrap();
    let report = scheduler.run(&manifest, temp_dir.path()).await;

    assert_eq!(report.counts.downloaded, 1);
    assert_eq!(report.counts.failed, 1);
    let failure = report.failure("corrupt.bin").unwrap();
    assert_eq!(failure.kind, FailureKind::ChecksumMismatch);
    // One automatic re-fetch, then surfaced
    assert_eq!(state.hits("corrupt"), 2);
    assert!(!temp_dir.path().join("corrupt.bin").exists());
    assert!(!temp_dir.path().join("corrupt.bin.part").exists());
    assert!(report.to_string().contains("corrupt.bin [ChecksumMismatch]"));
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let state = Arc::new(ServerState {
        files: [("flaky".to_string(), b"eventually".to_vec())]
            .into_iter()
            .collect(),
        flaky: [("flaky".to_string(), 2)].into_iter().collect(),
        ..ServerState::default()
    });
    let (addr, _handle) = start_server(Arc::clone(&state)).await;
    let temp_dir = TempDir::new().unwrap();

    let manifest = std::iter::once(resolver::ManifestEntry {
        preset_id: "p".to_string(),
        required_by: vec!["p".to_string()],
        spec: FileSpec {
            path: "flaky.bin".to_string(),
            url: format!("http://{addr}/files/flaky"),
            size: 10,
            checksum: None,
            source: None,
        },
    })
    .collect();

    let store = StateStore::new();
    let mut events = store.subscribe();
    let scheduler = Scheduler::http(options(), store).unwrap();
    let report = scheduler.run(&manifest, temp_dir.path()).await;

    assert!(report.is_success());
    assert_eq!(state.hits("flaky"), 3);

    let mut errors = 0;
    let mut completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            ProgressEvent::Error { kind, .. } => {
                assert_eq!(kind, FailureKind::HttpStatus);
                errors += 1;
            }
            ProgressEvent::Complete { state: task_state, .. } => {
                completed = task_state == TaskState::Done;
            }
            _ => {}
        }
    }
    assert_eq!(errors, 2);
    assert!(completed);
}

#[tokio::test]
async fn test_missing_file_fails_without_touching_siblings() {
    let state = Arc::new(ServerState {
        files: [("present".to_string(), b"data".to_vec())]
            .into_iter()
            .collect(),
        ..ServerState::default()
    });
    let (addr, _handle) = start_server(Arc::clone(&state)).await;
    let temp_dir = TempDir::new().unwrap();

    let manifest = ["present", "gone"]
        .into_iter()
        .map(|name| resolver::ManifestEntry {
            preset_id: "p".to_string(),
            required_by: vec!["p".to_string()],
            spec: FileSpec {
                path: format!("{name}.bin"),
                url: format!("http://{addr}/files/{name}"),
                size: 4,
                checksum: None,
                source: None,
            },
        })
        .collect();

    let scheduler = Scheduler::http(options(), StateStore::new()).unwrap();
    let report = scheduler.run(&manifest, temp_dir.path()).await;

    assert_eq!(report.counts.downloaded, 1);
    let failure = report.failure("gone.bin").unwrap();
    assert_eq!(failure.kind, FailureKind::HttpStatus);
    assert_eq!(failure.attempts, 3);
    assert!(temp_dir.path().join("present.bin").exists());
}

#[tokio::test]
async fn test_path_held_by_other_process_is_deferred() {
    let state = Arc::new(ServerState {
        files: [("busy".to_string(), b"data".to_vec())]
            .into_iter()
            .collect(),
        ..ServerState::default()
    });
    let (addr, _handle) = start_server(Arc::clone(&state)).await;
    let temp_dir = TempDir::new().unwrap();

    let spec = FileSpec {
        path: "busy.bin".to_string(),
        url: format!("http://{addr}/files/busy"),
        size: 4,
        checksum: None,
        source: None,
    };
    // A separate store stands in for another process holding the file lock
    let other = StateStore::new();
    let held = match lease::try_acquire(&other, RunId::new(), temp_dir.path(), &spec).unwrap() {
        LeaseAttempt::Acquired(lease) => lease,
        LeaseAttempt::Held(holder) => panic!("lock unexpectedly held by {holder}"),
    };

    let manifest = std::iter::once(resolver::ManifestEntry {
        preset_id: "p".to_string(),
        required_by: vec!["p".to_string()],
        spec,
    })
    .collect();
    let scheduler = Scheduler::http(options(), StateStore::new()).unwrap();

    let report = scheduler.run(&manifest, temp_dir.path()).await;
    assert_eq!(report.counts.deferred, 1);
    assert!(report.is_success());
    assert_eq!(state.hits("busy"), 0);

    drop(held);
    let report = scheduler.run(&manifest, temp_dir.path()).await;
    assert_eq!(report.counts.downloaded, 1);
}
