//! Scheduler lifecycle tests
//!
//! Start the long-running scheduler against a mocked API, let it collect,
//! then shut it down and inspect what it left behind.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use halcyon_ingest::checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore};
use halcyon_ingest::config::ObjectTypeOverride;
use halcyon_ingest::error::{IngestError, Result};
use halcyon_ingest::health::{HealthReport, RunOutcome, STATUS_SOURCETYPE};
use halcyon_ingest::object_types::builtin_specs;
use halcyon_ingest::sink::MemorySink;
use halcyon_ingest::{App, Settings};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Settings with every object type disabled except `tags`.
fn tags_only(server: &MockServer, state_dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.api.base_url = server.uri();
    settings.api.token = "tok".into();
    settings.api.retry.base_delay_ms = 1;
    settings.api.retry.jitter_ms = 0;
    settings.collection.state_dir = state_dir.to_path_buf();

    for spec in builtin_specs() {
        settings.object_types.insert(
            spec.name.clone(),
            ObjectTypeOverride {
                enabled: Some(spec.name == "tags"),
                ..Default::default()
            },
        );
    }
    settings
}

fn build_app(settings: Settings, sink: Arc<MemorySink>) -> App {
    let checkpoints = Arc::new(FileCheckpointStore::new(&settings.collection.state_dir));
    App::with_parts(settings, sink, checkpoints).unwrap()
}

/// Enable one more object type on top of [`tags_only`].
fn enable(settings: &mut Settings, object_type: &str) {
    settings
        .object_types
        .entry(object_type.to_string())
        .or_default()
        .enabled = Some(true);
}

/// File store that refuses to read one object type.
struct UnreadableStore {
    inner: FileCheckpointStore,
    broken: &'static str,
}

#[async_trait]
impl CheckpointStore for UnreadableStore {
    async fn get(&self, object_type: &str) -> Result<Checkpoint> {
        if object_type == self.broken {
            return Err(IngestError::checkpoint(format!("{object_type}: unreadable")));
        }
        self.inner.get(object_type).await
    }

    async fn commit(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.inner.commit(checkpoint).await
    }
}

async fn requests_to(server: &MockServer, route: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == route)
        .count()
}

async fn mount_tags(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v2/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [
            {"id": "tag-1", "name": "prod"},
            {"id": "tag-2", "name": "lab"}
        ]})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_scheduler_collects_due_types_and_shuts_down() {
    let server = MockServer::start().await;
    let state = TempDir::new().unwrap();
    mount_tags(&server).await;

    let sink = Arc::new(MemorySink::new());
    let App { mut scheduler, .. } = build_app(tags_only(&server, state.path()), sink.clone());
    scheduler.start().await.unwrap();
    assert_eq!(scheduler.task_names().collect::<Vec<_>>(), vec!["tags"]);

    tokio::time::timeout(Duration::from_secs(10), async {
        while sink.by_sourcetype("halcyon:tag").len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tags were never collected");

    tokio::time::timeout(Duration::from_secs(10), scheduler.shutdown())
        .await
        .expect("shutdown hung");

    // the status event is written by the health consumer, drained on shutdown
    let status = sink.by_sourcetype(STATUS_SOURCETYPE);
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].event["collector"], json!("tags"));

    let report = HealthReport::load(state.path().join("health.json"))
        .unwrap()
        .expect("health snapshot written");
    assert!(report.healthy);
    assert_eq!(
        report.object_types["tags"].last_outcome,
        Some(RunOutcome::Success)
    );
    assert!(!report.object_types["alerts"].enabled);

    let checkpoint = FileCheckpointStore::new(state.path())
        .get("tags")
        .await
        .unwrap();
    assert!(checkpoint.last_run_time.is_some());
}

#[tokio::test]
async fn test_recently_run_type_waits_for_its_interval() {
    let server = MockServer::start().await;
    let state = TempDir::new().unwrap();
    mount_tags(&server).await;

    let mut previous = Checkpoint::new("tags");
    previous.last_run_time = Some(chrono::Utc::now());
    FileCheckpointStore::new(state.path())
        .commit(&previous)
        .await
        .unwrap();

    let sink = Arc::new(MemorySink::new());
    let App { mut scheduler, .. } = build_app(tags_only(&server, state.path()), sink.clone());
    scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(10), scheduler.shutdown())
        .await
        .expect("shutdown hung");

    assert!(sink.is_empty());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let server = MockServer::start().await;
    let state = TempDir::new().unwrap();
    mount_tags(&server).await;

    let App { mut scheduler, .. } =
        build_app(tags_only(&server, state.path()), Arc::new(MemorySink::new()));
    scheduler.start().await.unwrap();
    assert!(scheduler.start().await.is_err());
    scheduler.shutdown().await;
}

// ============================================================================
// Failure pacing and isolation
// ============================================================================

#[tokio::test]
async fn test_failing_type_waits_its_interval_between_attempts() {
    let server = MockServer::start().await;
    let state = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path("/v2/tags"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut settings = tags_only(&server, state.path());
    settings.api.retry.max_attempts = 1;
    settings.object_types.get_mut("tags").unwrap().interval_secs = Some(1);

    let sink = Arc::new(MemorySink::new());
    let App { mut scheduler, .. } = build_app(settings, sink.clone());
    scheduler.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;

    tokio::time::timeout(Duration::from_secs(10), scheduler.shutdown())
        .await
        .expect("shutdown hung");

    // due at 0s, 1s and 2s; a hot loop would have made hundreds of calls
    let attempts = requests_to(&server, "/v2/tags").await;
    assert!((2..=4).contains(&attempts), "unexpected attempts: {attempts}");

    let report = HealthReport::load(state.path().join("health.json"))
        .unwrap()
        .expect("health snapshot written");
    let tags = &report.object_types["tags"];
    assert_eq!(tags.runs_failed as usize, attempts);
    assert_eq!(tags.runs_succeeded, 0);
    assert!(!report.healthy);
    assert!(sink.by_sourcetype("halcyon:tag").is_empty());
}

#[tokio::test]
async fn test_stalled_type_does_not_delay_others() {
    let server = MockServer::start().await;
    let state = TempDir::new().unwrap();
    mount_tags(&server).await;
    Mock::given(method("GET"))
        .and(path("/v2/alerts"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"items": []}))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let mut settings = tags_only(&server, state.path());
    enable(&mut settings, "alerts");

    let sink = Arc::new(MemorySink::new());
    let App { mut scheduler, .. } = build_app(settings, sink.clone());
    scheduler.start().await.unwrap();
    assert_eq!(
        scheduler.task_names().collect::<Vec<_>>(),
        vec!["alerts", "tags"]
    );

    tokio::time::timeout(Duration::from_secs(5), async {
        while sink.by_sourcetype("halcyon:tag").len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tags waited behind the stalled alerts request");

    assert_eq!(requests_to(&server, "/v2/alerts").await, 1);
    assert!(sink.by_sourcetype("halcyon:alert").is_empty());

    tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown())
        .await
        .expect("shutdown hung");
}

// ============================================================================
// Cancellation and startup errors
// ============================================================================

#[tokio::test]
async fn test_shutdown_interrupts_in_flight_page_fetch() {
    let server = MockServer::start().await;
    let state = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path("/v2/tags"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"items": [{"id": "tag-1"}]}))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let sink = Arc::new(MemorySink::new());
    let App { mut scheduler, .. } = build_app(tags_only(&server, state.path()), sink.clone());
    scheduler.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while requests_to(&server, "/v2/tags").await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("page fetch never started");

    let started = std::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown())
        .await
        .expect("shutdown waited for the in-flight request");
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(sink.by_sourcetype("halcyon:tag").is_empty());
    let checkpoint = FileCheckpointStore::new(state.path())
        .get("tags")
        .await
        .unwrap();
    assert!(checkpoint.last_run_time.is_none());

    let report = HealthReport::load(state.path().join("health.json"))
        .unwrap()
        .expect("health snapshot written");
    let tags = &report.object_types["tags"];
    assert_eq!(tags.last_outcome, Some(RunOutcome::Failed));
    assert_eq!(tags.last_error.as_ref().unwrap().kind, "cancelled");
}

#[tokio::test]
async fn test_start_error_leaves_no_task_running() {
    let server = MockServer::start().await;
    let state = TempDir::new().unwrap();
    mount_tags(&server).await;
    Mock::given(method("GET"))
        .and(path("/v2/alerts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .mount(&server)
        .await;

    // alerts is scheduled before tags, whose checkpoint cannot be read
    let mut settings = tags_only(&server, state.path());
    enable(&mut settings, "alerts");
    let checkpoints = Arc::new(UnreadableStore {
        inner: FileCheckpointStore::new(state.path()),
        broken: "tags",
    });
    let App { mut scheduler, .. } =
        App::with_parts(settings, Arc::new(MemorySink::new()), checkpoints).unwrap();

    let err = scheduler.start().await.unwrap_err();
    assert_eq!(err.kind(), "checkpoint");
    assert_eq!(scheduler.task_names().count(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.received_requests().await.unwrap().is_empty());
    scheduler.shutdown().await;
}
