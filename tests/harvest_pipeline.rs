//! End-to-end harvests: stub HTTP sources, real adapters, SQLite catalog.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

use catalog_harvester::adapters::AdapterRegistry;
use catalog_harvester::app::App;
use catalog_harvester::config::{Config, HttpConfig};
use catalog_harvester::error::{CatalogError, HarvestError};
use catalog_harvester::harvest::HarvestMode;
use catalog_harvester::metrics::{InMemoryMetrics, HARVEST_OUTCOMES};
use catalog_harvester::models::{
    CheckpointStatus, HostType, RiskLevel, ServerFilter, ServerPatch,
};

#[derive(Clone, Default)]
struct Hits {
    manifest: Arc<AtomicUsize>,
    broken: Arc<AtomicUsize>,
    flaky: Arc<AtomicUsize>,
    packument: Arc<AtomicUsize>,
}

fn inventory_manifest() -> Value {
    json!({
        "name": "inventory",
        "description": "Warehouse lookups",
        "license": "Apache-2.0",
        "updated_at": "2026-03-01T00:00:00Z",
        "readme": "# Inventory",
        "tools": [{"name": "lookup", "inputSchema": {"type": "object"}}],
        "dependencies": {"zod": "^3"},
        "source_files": [
            {"path": "src/index.ts", "content": "import { execSync } from 'child_process';\n"}
        ]
    })
}

fn weather_packument() -> Value {
    json!({
        "name": "weather-mcp",
        "description": "Forecast tools",
        "license": "MIT",
        "readme": "# weather-mcp",
        "dist-tags": {"latest": "2.0.0"},
        "time": {"modified": "2026-02-01T00:00:00Z", "2.0.0": "2026-02-01T00:00:00Z"},
        "maintainers": [{"name": "alice"}],
        "versions": {
            "2.0.0": {
                "name": "weather-mcp",
                "version": "2.0.0",
                "scripts": {"test": "vitest run"},
                "dependencies": {"@modelcontextprotocol/sdk": "^1.0.0"}
            }
        }
    })
}

fn unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "try later").into_response()
}

async fn spawn_sources(hits: Hits) -> SocketAddr {
    let h = hits.clone();
    let manifest = get(move || {
        let h = h.clone();
        async move {
            h.manifest.fetch_add(1, Ordering::SeqCst);
            Json(inventory_manifest())
        }
    });
    let h = hits.clone();
    let broken = get(move || {
        let h = h.clone();
        async move {
            h.broken.fetch_add(1, Ordering::SeqCst);
            unavailable()
        }
    });
    let h = hits.clone();
    let flaky = get(move || {
        let h = h.clone();
        async move {
            if h.flaky.fetch_add(1, Ordering::SeqCst) == 0 {
                unavailable()
            } else {
                Json(inventory_manifest()).into_response()
            }
        }
    });
    let h = hits.clone();
    let packument = get(move || {
        let h = h.clone();
        async move {
            h.packument.fetch_add(1, Ordering::SeqCst);
            Json(weather_packument())
        }
    });

    let app = Router::new()
        .route("/manifest.json", manifest)
        .route("/broken.json", broken)
        .route("/flaky.json", flaky)
        .route("/registry/weather-mcp", packument);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn test_config(tmp: &TempDir, addr: SocketAddr) -> Config {
    let mut config = Config::with_db_path(tmp.path().join("data/catalog.sqlite"));
    config.http = HttpConfig {
        timeout_secs: 5,
        max_retries: 1,
        initial_backoff_ms: 10,
        min_interval_ms: 0,
        user_agent: "catalog-harvester-tests".to_string(),
    };
    config.harvest.max_attempts = 2;
    config.harvest.initial_backoff_secs = 0;
    config.harvest.max_backoff_secs = 0;
    config.sources.npm_registry = format!("http://{}/registry", addr);
    config
}

async fn open_app(tmp: &TempDir, addr: SocketAddr) -> (App, Arc<InMemoryMetrics>) {
    let config = test_config(tmp, addr);
    let registry = AdapterRegistry::from_config(&config).unwrap();
    let metrics = Arc::new(InMemoryMetrics::new());
    let app = App::open_with(config, registry, metrics.clone()).await.unwrap();
    (app, metrics)
}

#[tokio::test]
async fn test_http_manifest_harvest_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let hits = Hits::default();
    let addr = spawn_sources(hits.clone()).await;
    let (app, metrics) = open_app(&tmp, addr).await;
    let url = format!("http://{}/manifest.json", addr);

    let first = app
        .harvester
        .harvest(HostType::Http, &url, HarvestMode::Normal)
        .await
        .unwrap();
    assert!(first.is_harvested());
    let server = first.into_server();
    assert_eq!(server.name, "inventory");
    assert_eq!(server.risk_level, RiskLevel::High);
    assert!(server.risk_analyzed);
    assert!(server.has_license);
    assert_eq!(server.tools.len(), 1);

    let second = app
        .harvester
        .harvest(HostType::Http, &url, HarvestMode::Normal)
        .await
        .unwrap();
    assert!(!second.is_harvested());
    assert_eq!(second.server().id, server.id);
    assert_eq!(hits.manifest.load(Ordering::SeqCst), 1);

    let log = app.harvester.store().get_log(&url).await.unwrap().unwrap();
    assert_eq!(log.status, CheckpointStatus::Completed);
    assert_eq!(log.attempts, 1);

    assert_eq!(
        metrics.counter(HARVEST_OUTCOMES, &[("kind", "http"), ("outcome", "harvested")]),
        1
    );
    assert_eq!(
        metrics.counter(HARVEST_OUTCOMES, &[("kind", "http"), ("outcome", "skipped")]),
        1
    );

    // A forced refresh fetches again and keeps the identity.
    let refreshed = app.catalog.refresh(&url).await.unwrap();
    assert_eq!(refreshed.id, server.id);
    assert_eq!(hits.manifest.load(Ordering::SeqCst), 2);
    app.close().await;
}

#[tokio::test]
async fn test_transient_http_error_is_retried_inside_adapter() {
    let tmp = TempDir::new().unwrap();
    let hits = Hits::default();
    let addr = spawn_sources(hits.clone()).await;
    let (app, _metrics) = open_app(&tmp, addr).await;
    let url = format!("http://{}/flaky.json", addr);

    let outcome = app
        .harvester
        .harvest(HostType::Http, &url, HarvestMode::Normal)
        .await
        .unwrap();
    assert!(outcome.is_harvested());
    assert_eq!(hits.flaky.load(Ordering::SeqCst), 2);

    // The adapter absorbed the 503, so the orchestrator saw one attempt.
    let log = app.harvester.store().get_log(&url).await.unwrap().unwrap();
    assert_eq!(log.attempts, 1);
    app.close().await;
}

#[tokio::test]
async fn test_exhausted_retries_leave_failed_checkpoint() {
    let tmp = TempDir::new().unwrap();
    let hits = Hits::default();
    let addr = spawn_sources(hits.clone()).await;
    let (app, _metrics) = open_app(&tmp, addr).await;
    let url = format!("http://{}/broken.json", addr);

    let err = app
        .harvester
        .harvest(HostType::Http, &url, HarvestMode::Normal)
        .await
        .unwrap_err();
    match err {
        HarvestError::ExhaustedRetries {
            attempts,
            ref last_error,
            ..
        } => {
            assert_eq!(attempts, 2);
            assert!(last_error.contains("503"), "{}", last_error);
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }
    // 2 orchestrator attempts x (1 request + 1 adapter retry).
    assert_eq!(hits.broken.load(Ordering::SeqCst), 4);

    let log = app.harvester.store().get_log(&url).await.unwrap().unwrap();
    assert_eq!(log.status, CheckpointStatus::Failed);
    assert_eq!(log.attempts, 2);
    assert!(log.last_error.unwrap().contains("503"));
    assert!(app.catalog.get_by_url(&url).await.unwrap().is_none());
    app.close().await;
}

#[tokio::test]
async fn test_npm_and_http_catalog_operations() {
    let tmp = TempDir::new().unwrap();
    let hits = Hits::default();
    let addr = spawn_sources(hits.clone()).await;
    let (app, _metrics) = open_app(&tmp, addr).await;

    let http_url = format!("http://{}/manifest.json", addr);
    assert!(app.harvester.enqueue(HostType::Http, &http_url).await.unwrap());
    assert!(app.harvester.enqueue(HostType::Npm, "npm:weather-mcp").await.unwrap());
    let drained = app.harvester.harvest_pending(10).await.unwrap();
    assert_eq!(drained.succeeded, 2);
    assert!(drained.is_clean());
    assert_eq!(hits.packument.load(Ordering::SeqCst), 1);

    let npm = app
        .catalog
        .get_servers(&ServerFilter::host_type(HostType::Npm))
        .await
        .unwrap();
    assert_eq!(npm.len(), 1);
    assert_eq!(npm[0].name, "weather-mcp");
    assert_eq!(npm[0].risk_level, RiskLevel::Safe);
    assert!(npm[0].has_tests);

    let verified = app
        .catalog
        .bulk_update(&ServerFilter::default(), &ServerPatch::verified(true))
        .await
        .unwrap();
    assert_eq!(verified.succeeded, 2);

    let stats = app.catalog.get_statistics().await.unwrap();
    assert_eq!(stats.total_servers, 2);
    assert_eq!(stats.verified_servers, 2);
    assert_eq!(stats.by_risk_level.get("HIGH"), Some(&1));
    assert_eq!(stats.checkpoints.get("completed"), Some(&2));

    let id = npm[0].id.clone();
    app.catalog.delete(&id).await.unwrap();
    assert!(matches!(
        app.catalog.get(&id).await,
        Err(CatalogError::NotFound(_))
    ));
    app.close().await;
}
