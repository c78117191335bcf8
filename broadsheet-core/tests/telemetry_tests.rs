use broadsheet_core::{Database, EventKind, TelemetryEvent, TelemetryMode, TelemetryStore};
use broadsheet_scanner::{BackoffPolicy, SessionConfig, SessionCoordinator};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn store(mode: TelemetryMode) -> TelemetryStore {
    let db = Database::open(":memory:").await.unwrap();
    TelemetryStore::new(db.backend(), mode)
}

fn event(n: i64) -> TelemetryEvent {
    TelemetryEvent::new(EventKind::Verification, format!("https://example.com/news/{}", n), "verified")
        .with_host("example.com")
        .with_attempt(0)
}

#[tokio::test]
async fn test_full_queue_drops_instead_of_blocking() {
    let store = store(TelemetryMode::Async { capacity: 4 }).await;

    // The writer task cannot run until this loop yields
    let started = Instant::now();
    for n in 0..100 {
        store.record_nowait(event(n));
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    let stats = store.stats();
    assert_eq!(stats.enqueued + stats.dropped, 100);
    assert!(stats.dropped > 0);

    store.flush().await.unwrap();
    assert_eq!(
        store.reader().total_events().await.unwrap(),
        stats.enqueued as i64
    );
    store.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_events_round_trip_with_detail() {
    let store = store(TelemetryMode::Sync).await;
    store
        .record(
            event(1)
                .with_source(3)
                .with_duration_ms(120)
                .with_detail(serde_json::json!({ "status_code": 200 })),
        )
        .await
        .unwrap();

    let events = store
        .reader()
        .events_for_subject("https://example.com/news/1")
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, "verification");
    assert_eq!(events[0].source_id, Some(3));
    assert_eq!(events[0].duration_ms, Some(120));
    assert_eq!(events[0].detail.as_ref().unwrap()["status_code"], 200);
}

#[tokio::test]
async fn test_coordinator_events_are_mirrored() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .mount(&server)
        .await;

    let telemetry = Arc::new(store(TelemetryMode::Sync).await);
    let config = SessionConfig::default()
        .with_delay(Duration::ZERO, Duration::ZERO)
        .with_backoff(
            BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(60)),
            BackoffPolicy::challenge(),
        );
    let coordinator = SessionCoordinator::new(config)
        .unwrap()
        .with_event_callback(telemetry.session_callback());

    let url = Url::parse(&format!("{}/news/busy", server.uri())).unwrap();
    coordinator.fetch(&url).await.unwrap();
    // Second request lands inside the backoff window
    let outcome = coordinator.fetch(&url).await.unwrap();
    assert!(outcome.is_deferred());

    telemetry.flush().await.unwrap();
    let reader = telemetry.reader();
    let fetches = reader.events_of_kind(EventKind::Fetch).await.unwrap();
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0].outcome, "rate_limited");
    let backoffs = reader.events_of_kind(EventKind::Backoff).await.unwrap();
    assert_eq!(backoffs.len(), 1);
    assert_eq!(backoffs[0].attempt, Some(1));
    assert_eq!(reader.events_of_kind(EventKind::Deferred).await.unwrap().len(), 1);
}
