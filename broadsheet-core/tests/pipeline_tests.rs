use async_trait::async_trait;
use broadsheet_core::discovery::{FeedStrategy, HomepageStrategy, SourceContext, Strategy, StrategyError};
use broadsheet_core::model::{NewArticle, NewCandidate};
use broadsheet_core::text::content_hash;
use broadsheet_core::urls::normalize_url;
use broadsheet_core::{
    ArticleStatus, CandidateStatus, Classification, CollaboratorError, DatasetScope, EventKind,
    Gazetteer, NewSource, Pipeline, PipelineConfig, PipelineError, PlaceEntity, RunOptions, Source,
    StrategyKind, TelemetryMode, TextClassifier,
};
use broadsheet_scanner::{BackoffPolicy, SessionConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn session() -> SessionConfig {
    SessionConfig::default()
        .with_delay(Duration::ZERO, Duration::ZERO)
        .with_backoff(
            BackoffPolicy::new(Duration::ZERO, Duration::ZERO),
            BackoffPolicy::challenge(),
        )
        .with_timeout(Duration::from_secs(5))
}

fn config() -> PipelineConfig {
    PipelineConfig::default()
        .with_database_url(":memory:")
        .with_telemetry_mode(TelemetryMode::Sync)
        .with_concurrency(1)
        .with_session(session())
}

async fn pipeline(config: PipelineConfig) -> Pipeline {
    Pipeline::open(config).await.unwrap()
}

async fn mock_source(pipeline: &Pipeline, server: &MockServer, feeds: Vec<String>) -> Source {
    let id = pipeline
        .db()
        .upsert_source(
            0,
            &NewSource {
                host: "127.0.0.1".to_string(),
                name: "Mock Gazette".to_string(),
                base_url: format!("{}/", server.uri()),
                feeds,
                discovery_frequency_hours: 24,
            },
        )
        .await
        .unwrap();
    pipeline.db().get_source(id).await.unwrap().unwrap()
}

async fn candidate(pipeline: &Pipeline, source: &Source, url: &str, status: CandidateStatus) -> i64 {
    let id = pipeline
        .db()
        .insert_candidate(
            source,
            &NewCandidate {
                url: url.to_string(),
                normalized_url: normalize_url(url).unwrap(),
                discovered_by: StrategyKind::Feed,
                priority: StrategyKind::Feed.priority(),
            },
        )
        .await
        .unwrap()
        .unwrap();
    if matches!(status, CandidateStatus::Article | CandidateStatus::Extracted) {
        assert!(pipeline.db().transition_candidate(id, CandidateStatus::Article, None).await.unwrap());
    }
    if status == CandidateStatus::Extracted {
        assert!(pipeline.db().transition_candidate(id, CandidateStatus::Extracted, None).await.unwrap());
    }
    id
}

/// An extracted article row with its candidate.
async fn stored_article(pipeline: &Pipeline, source: &Source, slug: &str, body: &str) -> i64 {
    let url = format!("https://127.0.0.1/news/{}", slug);
    let candidate_id = candidate(pipeline, source, &url, CandidateStatus::Extracted).await;
    pipeline
        .db()
        .insert_article(&NewArticle {
            candidate_link_id: candidate_id,
            dataset_id: source.dataset_id,
            source_id: source.id,
            url,
            title: Some(slug.to_string()),
            authors: Vec::new(),
            body: Some(body.to_string()),
            published_at: None,
            content_hash: Some(content_hash(body)),
            wire_services: Vec::new(),
            status: ArticleStatus::Extracted,
            status_reason: None,
        })
        .await
        .unwrap()
        .unwrap()
}

fn article_html(headline: &str, body: &str) -> String {
    format!(
        r#"<html><head><title>{headline}</title>
        <script type="application/ld+json">
        {{"@context":"https://schema.org","@type":"NewsArticle","headline":"{headline}",
          "author":{{"@type":"Person","name":"Jane Doe"}},
          "datePublished":"2024-05-06T10:00:00Z","articleBody":"{body}"}}
        </script></head><body><h1>{headline}</h1></body></html>"#
    )
}

fn rss(server: &MockServer, paths: &[&str]) -> String {
    let items: String = paths
        .iter()
        .map(|p| format!("<item><title>{p}</title><link>{}{p}</link></item>", server.uri()))
        .collect();
    format!(r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Mock</title>{items}</channel></rss>"#)
}

const CHALLENGE_PAGE: &str = r#"<html><head><title>Just a moment...</title></head>
    <body><div id="cf-browser-verification">Checking your browser</div></body></html>"#;

fn options() -> RunOptions {
    RunOptions::new(DatasetScope::Default)
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn test_feed_and_homepage_links_become_candidates() {
    let server = MockServer::start().await;
    let feed_paths = [
        "/news/council-approves-new-budget",
        "/news/school-board-race-tightens",
        "/news/river-flood-warning-issued",
    ];
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/rss+xml")
                .set_body_string(rss(&server, &feed_paths)),
        )
        .mount(&server)
        .await;
    let homepage = r#"<html><body>
        <a href="/about">About us</a>
        <a href="/news/county-fair-opens-this-weekend">County fair</a>
        <a href="/local/new-bakery-opens-downtown-today">Bakery</a>
        <a href="/news/council-approves-new-budget">Budget</a>
        </body></html>"#;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string(homepage),
        )
        .mount(&server)
        .await;

    let pipeline = pipeline(config()).await.with_strategies(vec![
        Arc::new(FeedStrategy::new(30, 200)),
        Arc::new(HomepageStrategy::new(200)),
    ]);
    let source = mock_source(&pipeline, &server, vec![format!("{}/feed.xml", server.uri())]).await;

    let report = pipeline.discover(&options()).await.unwrap();
    assert_eq!(report.inserted(), 5);
    assert_eq!(report.failed_sources, 0);

    let stored = pipeline
        .db()
        .candidates_page(DatasetScope::Default, CandidateStatus::Discovered, Some(source.id), 0, 100)
        .await
        .unwrap();
    assert_eq!(stored.len(), 5);
    // Feed outranks homepage for the link both strategies found
    let by_feed = stored.iter().filter(|c| c.discovered_by == StrategyKind::Feed).count();
    assert_eq!(by_feed, 3);
    assert!(stored.windows(2).all(|w| w[0].priority >= w[1].priority));

    // Repeat discovery inserts nothing new
    let again = pipeline.discover(&options().with_force(true)).await.unwrap();
    assert_eq!(again.inserted(), 0);
    assert_eq!(again.sources[0].duplicates, 5);

    pipeline.telemetry().flush().await.unwrap();
    let stats = pipeline
        .telemetry()
        .reader()
        .strategy_effectiveness(Some(source.id))
        .await
        .unwrap();
    assert_eq!(stats.len(), 2);
    assert!(stats.iter().all(|s| s.runs == 2 && s.failures == 0));
}

struct BrokenStrategy;

#[async_trait]
impl Strategy for BrokenStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Classifier
    }

    async fn discover(&self, _ctx: &SourceContext) -> Result<Vec<Url>, StrategyError> {
        Err(StrategyError::Parse("model unavailable".to_string()))
    }
}

#[tokio::test]
async fn test_failing_strategy_is_isolated_and_deprioritised() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(
            &server,
            &["/news/first-story-of-the-day", "/news/second-story-of-the-day", "/news/third-story-of-the-day"],
        )))
        .mount(&server)
        .await;

    let pipeline = pipeline(config().with_strategy_skip_window(2)).await.with_strategies(vec![
        Arc::new(BrokenStrategy),
        Arc::new(FeedStrategy::new(30, 200)),
    ]);
    pipeline
        .db()
        .upsert_source(
            0,
            &NewSource {
                host: "127.0.0.1".to_string(),
                name: "Mock Gazette".to_string(),
                base_url: format!("{}/", server.uri()),
                feeds: vec![format!("{}/rss", server.uri())],
                // Due on every run
                discovery_frequency_hours: 0,
            },
        )
        .await
        .unwrap();

    let first = pipeline.discover(&options()).await.unwrap();
    assert_eq!(first.inserted(), 3);
    let outcomes = &first.sources[0].strategies;
    let broken = outcomes.iter().find(|o| o.strategy == StrategyKind::Classifier).unwrap();
    assert_eq!(broken.outcome, "failed");
    assert!(broken.error.as_deref().unwrap().contains("model unavailable"));
    let feed = outcomes.iter().find(|o| o.strategy == StrategyKind::Feed).unwrap();
    assert_eq!(feed.outcome, "ok");
    assert_eq!(feed.new_links, 3);
    pipeline.telemetry().flush().await.unwrap();

    pipeline.discover(&options()).await.unwrap();
    pipeline.telemetry().flush().await.unwrap();

    // Two empty runs in a row: the broken strategy sits the next one out
    let third = pipeline.discover(&options()).await.unwrap();
    let outcomes = &third.sources[0].strategies;
    assert_eq!(
        outcomes.iter().find(|o| o.strategy == StrategyKind::Classifier).unwrap().outcome,
        "skipped"
    );
    assert_eq!(
        outcomes.iter().find(|o| o.strategy == StrategyKind::Feed).unwrap().outcome,
        "ok"
    );

    // Forcing runs every strategy again
    let forced = pipeline.discover(&options().with_force(true)).await.unwrap();
    assert_eq!(
        forced.sources[0]
            .strategies
            .iter()
            .find(|o| o.strategy == StrategyKind::Classifier)
            .unwrap()
            .outcome,
        "failed"
    );
}

// ============================================================================
// Verification
// ============================================================================

#[tokio::test]
async fn test_timeouts_retry_then_verify() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/news/slow-loading-story"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<html><body>late</body></html>")
                .set_delay(Duration::from_secs(3)),
        )
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/news/slow-loading-story"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>story</body></html>"))
        .mount(&server)
        .await;

    let session = session().with_timeout(Duration::from_millis(500));
    let pipeline = pipeline(config().with_session(session)).await;
    let source = mock_source(&pipeline, &server, Vec::new()).await;
    let url = format!("{}/news/slow-loading-story", server.uri());
    let id = candidate(&pipeline, &source, &url, CandidateStatus::Discovered).await;

    let forced = options().with_force(true);
    for expected_retries in 1..=2 {
        let report = pipeline.verify(&forced).await.unwrap();
        assert_eq!(report.retried, 1);
        let link = pipeline.db().get_candidate(id).await.unwrap().unwrap();
        assert_eq!(link.status, CandidateStatus::Discovered);
        assert_eq!(link.retry_count, expected_retries);
    }
    let report = pipeline.verify(&forced).await.unwrap();
    assert_eq!(report.verified, 1);
    assert_eq!(
        pipeline.db().get_candidate(id).await.unwrap().unwrap().status,
        CandidateStatus::Article
    );

    pipeline.telemetry().flush().await.unwrap();
    let events: Vec<_> = pipeline
        .telemetry()
        .reader()
        .events_for_subject(&url)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EventKind::Verification.as_str())
        .collect();
    let outcomes: Vec<&str> = events.iter().map(|e| e.outcome.as_str()).collect();
    assert_eq!(outcomes, vec!["transient", "transient", "verified"]);
    assert_eq!(events[2].attempt, Some(2));
}

#[tokio::test]
async fn test_not_found_and_recent_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/news/removed-story-page"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/news/fine-story-page"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<p>fine</p>"))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = pipeline(config()).await;
    let source = mock_source(&pipeline, &server, Vec::new()).await;
    let gone = candidate(&pipeline, &source, &format!("{}/news/removed-story-page", server.uri()), CandidateStatus::Discovered).await;
    let fine = candidate(&pipeline, &source, &format!("{}/news/fine-story-page", server.uri()), CandidateStatus::Discovered).await;

    let report = pipeline.verify(&options()).await.unwrap();
    assert_eq!(report.dead, 1);
    assert_eq!(report.verified, 1);
    let dead = pipeline.db().get_candidate(gone).await.unwrap().unwrap();
    assert_eq!(dead.status, CandidateStatus::Dead);
    assert_eq!(dead.status_reason.as_deref(), Some("not_found"));
    assert_eq!(
        pipeline.db().get_candidate(fine).await.unwrap().unwrap().status,
        CandidateStatus::Article
    );

    // Nothing left that is due
    let report = pipeline.verify(&options()).await.unwrap();
    assert_eq!(report.examined, 0);
}

#[tokio::test]
async fn test_bot_challenge_during_verification_is_not_a_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/news/guarded-story-page"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CHALLENGE_PAGE))
        .mount(&server)
        .await;

    // No challenge backoff, so every forced run reaches the server
    let no_wait = BackoffPolicy::new(Duration::ZERO, Duration::ZERO);
    let pipeline = pipeline(config().with_session(session().with_backoff(no_wait, no_wait))).await;
    let source = mock_source(&pipeline, &server, Vec::new()).await;
    let url = format!("{}/news/guarded-story-page", server.uri());
    let id = candidate(&pipeline, &source, &url, CandidateStatus::Discovered).await;

    let forced = options().with_force(true);
    for _ in 0..4 {
        let report = pipeline.verify(&forced).await.unwrap();
        assert_eq!(report.challenged, 1);
        assert_eq!(report.dead, 0);
        let link = pipeline.db().get_candidate(id).await.unwrap().unwrap();
        assert_eq!(link.status, CandidateStatus::Discovered);
        assert_eq!(link.retry_count, 0);
        assert!(link.last_attempt_at.is_some());
    }

    pipeline.telemetry().flush().await.unwrap();
    let challenges = pipeline
        .telemetry()
        .reader()
        .events_of_kind(EventKind::BotChallenge)
        .await
        .unwrap();
    assert_eq!(challenges.len(), 4);
    assert_eq!(challenges[0].detail.as_ref().unwrap()["stage"], "verification");
}

#[tokio::test]
async fn test_verification_passes_over_host_in_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/news/guarded-story-page"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CHALLENGE_PAGE))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/news/open-story-page"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>open story</body></html>"))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = pipeline(config()).await;
    let source = mock_source(&pipeline, &server, Vec::new()).await;
    let guarded = candidate(
        &pipeline,
        &source,
        &format!("{}/news/guarded-story-page", server.uri()),
        CandidateStatus::Discovered,
    )
    .await;
    // Same server under a second host name
    let open_url = format!("http://localhost:{}/news/open-story-page", server.address().port());
    let open = candidate(&pipeline, &source, &open_url, CandidateStatus::Discovered).await;

    let one = options().with_force(true).with_limit(1);
    let report = pipeline.verify(&one).await.unwrap();
    assert_eq!(report.challenged, 1);

    let report = pipeline.verify(&one).await.unwrap();
    assert_eq!(report.skipped_backoff, 1);
    assert_eq!(report.verified, 1);

    let db = pipeline.db();
    assert_eq!(db.get_candidate(guarded).await.unwrap().unwrap().status, CandidateStatus::Discovered);
    assert_eq!(db.get_candidate(open).await.unwrap().unwrap().status, CandidateStatus::Article);
}

// ============================================================================
// Extraction
// ============================================================================

#[tokio::test]
async fn test_bot_challenge_keeps_link_and_backs_off_host() {
    let server = MockServer::start().await;
    let challenge = r#"<html><head><title>Just a moment...</title></head>
        <body><div id="cf-browser-verification">Checking your browser</div></body></html>"#;
    Mock::given(method("GET"))
        .and(path("/news/protected-story-page"))
        .respond_with(ResponseTemplate::new(200).set_body_string(challenge))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = pipeline(config()).await;
    let source = mock_source(&pipeline, &server, Vec::new()).await;
    let url = format!("{}/news/protected-story-page", server.uri());
    let id = candidate(&pipeline, &source, &url, CandidateStatus::Article).await;

    let report = pipeline.extract(&options()).await.unwrap();
    assert_eq!(report.challenged, 1);
    assert_eq!(report.extracted, 0);

    let link = pipeline.db().get_candidate(id).await.unwrap().unwrap();
    assert_eq!(link.status, CandidateStatus::Article);
    assert_eq!(link.retry_count, 0);
    assert!(pipeline.db().article_for_candidate(id).await.unwrap().is_none());

    let state = pipeline.coordinator().state("127.0.0.1").await.unwrap();
    let until = state.backoff_until.unwrap();
    assert!(until > chrono::Utc::now());

    pipeline.telemetry().flush().await.unwrap();
    let challenges = pipeline
        .telemetry()
        .reader()
        .events_of_kind(EventKind::BotChallenge)
        .await
        .unwrap();
    assert_eq!(challenges.len(), 1);
    assert_eq!(challenges[0].outcome, "bot_challenge");
    assert_eq!(challenges[0].host.as_deref(), Some("127.0.0.1"));

    // Host is in backoff: the next run passes the link over without a request
    let report = pipeline.extract(&options()).await.unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(report.skipped_backoff, 1);
    assert_eq!(
        pipeline.db().get_candidate(id).await.unwrap().unwrap().status,
        CandidateStatus::Article
    );
}

#[tokio::test]
async fn test_extraction_has_its_own_retry_budget() {
    let server = MockServer::start().await;
    let slow = ResponseTemplate::new(200)
        .set_body_string("<html><body>late</body></html>")
        .set_delay(Duration::from_secs(3));
    let story_path = "/news/slow-loading-story";
    // Mounted first, matched first: two slow verifications, one quick one,
    // one slow extraction, then the article
    Mock::given(method("GET"))
        .and(path(story_path))
        .respond_with(slow.clone())
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(story_path))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>story</body></html>"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(story_path))
        .respond_with(slow)
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(story_path))
        .respond_with(ResponseTemplate::new(200).set_body_string(article_html(
            "Slow story finally loads",
            "The county board met late on Thursday and approved the new road plan.",
        )))
        .mount(&server)
        .await;

    let session = session().with_timeout(Duration::from_millis(500));
    let pipeline = pipeline(config().with_session(session)).await;
    let source = mock_source(&pipeline, &server, Vec::new()).await;
    let url = format!("{}{}", server.uri(), story_path);
    let id = candidate(&pipeline, &source, &url, CandidateStatus::Discovered).await;

    let forced = options().with_force(true);
    for _ in 0..2 {
        assert_eq!(pipeline.verify(&forced).await.unwrap().retried, 1);
    }
    assert_eq!(pipeline.verify(&forced).await.unwrap().verified, 1);
    assert_eq!(pipeline.db().get_candidate(id).await.unwrap().unwrap().retry_count, 0);

    let report = pipeline.extract(&options()).await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(report.dead, 0);
    let link = pipeline.db().get_candidate(id).await.unwrap().unwrap();
    assert_eq!(link.status, CandidateStatus::Article);
    assert_eq!(link.retry_count, 1);

    let report = pipeline.extract(&options()).await.unwrap();
    assert_eq!(report.extracted, 1);

    pipeline.telemetry().flush().await.unwrap();
    let extraction: Vec<_> = pipeline
        .telemetry()
        .reader()
        .events_for_subject(&url)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EventKind::Extraction.as_str())
        .collect();
    let outcomes: Vec<&str> = extraction.iter().map(|e| e.outcome.as_str()).collect();
    assert_eq!(outcomes, vec!["transient", "extracted"]);
    assert_eq!(extraction[0].attempt, Some(1));
}

#[tokio::test]
async fn test_retry_limit_event_carries_final_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/news/broken-story-page"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let pipeline = pipeline(config().with_max_retries(2)).await;
    let source = mock_source(&pipeline, &server, Vec::new()).await;
    let url = format!("{}/news/broken-story-page", server.uri());
    let id = candidate(&pipeline, &source, &url, CandidateStatus::Article).await;

    assert_eq!(pipeline.extract(&options()).await.unwrap().retried, 1);
    assert_eq!(pipeline.extract(&options()).await.unwrap().dead, 1);
    let link = pipeline.db().get_candidate(id).await.unwrap().unwrap();
    assert_eq!(link.status, CandidateStatus::Dead);
    assert_eq!(link.status_reason.as_deref(), Some("max_retries"));

    pipeline.telemetry().flush().await.unwrap();
    let attempts: Vec<(String, Option<i64>)> = pipeline
        .telemetry()
        .reader()
        .events_for_subject(&url)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EventKind::Extraction.as_str())
        .map(|e| (e.outcome, e.attempt))
        .collect();
    assert_eq!(
        attempts,
        vec![
            ("transient".to_string(), Some(1)),
            ("max_retries".to_string(), Some(2)),
        ]
    );
}

#[tokio::test]
async fn test_host_in_backoff_does_not_hold_back_other_hosts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/news/guarded-story-page"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CHALLENGE_PAGE))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/news/open-story-page"))
        .respond_with(ResponseTemplate::new(200).set_body_string(article_html(
            "Library reopens after renovation",
            "The downtown library reopened on Monday after a year of renovation work.",
        )))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = pipeline(config()).await;
    let source = mock_source(&pipeline, &server, Vec::new()).await;
    let guarded = candidate(
        &pipeline,
        &source,
        &format!("{}/news/guarded-story-page", server.uri()),
        CandidateStatus::Article,
    )
    .await;
    let open_url = format!("http://localhost:{}/news/open-story-page", server.address().port());
    let open = candidate(&pipeline, &source, &open_url, CandidateStatus::Article).await;

    let one = options().with_limit(1);
    let report = pipeline.extract(&one).await.unwrap();
    assert_eq!(report.challenged, 1);

    for _ in 0..3 {
        let report = pipeline.extract(&one).await.unwrap();
        assert_eq!(report.deferred, 0);
        assert_eq!(report.skipped_backoff, 1);
    }

    let db = pipeline.db();
    assert_eq!(db.get_candidate(guarded).await.unwrap().unwrap().status, CandidateStatus::Article);
    assert_eq!(db.get_candidate(open).await.unwrap().unwrap().status, CandidateStatus::Extracted);
}

#[tokio::test]
async fn test_duplicate_content_kills_second_link() {
    let server = MockServer::start().await;
    let page = article_html(
        "Council approves budget",
        "The city council voted on Tuesday to approve a new budget for the coming year.",
    );
    for p in ["/news/council-budget-story", "/politics/council-budget-story-syndicated"] {
        Mock::given(method("GET"))
            .and(path(p))
            .respond_with(ResponseTemplate::new(200).set_body_string(page.clone()))
            .mount(&server)
            .await;
    }

    let pipeline = pipeline(config()).await;
    let source = mock_source(&pipeline, &server, Vec::new()).await;
    let first = candidate(&pipeline, &source, &format!("{}/news/council-budget-story", server.uri()), CandidateStatus::Article).await;
    let second = candidate(
        &pipeline,
        &source,
        &format!("{}/politics/council-budget-story-syndicated", server.uri()),
        CandidateStatus::Article,
    )
    .await;

    let report = pipeline.extract(&options()).await.unwrap();
    assert_eq!(report.extracted, 1);
    assert_eq!(report.duplicates, 1);

    assert_eq!(
        pipeline.db().get_candidate(first).await.unwrap().unwrap().status,
        CandidateStatus::Extracted
    );
    let dup = pipeline.db().get_candidate(second).await.unwrap().unwrap();
    assert_eq!(dup.status, CandidateStatus::Dead);
    assert_eq!(dup.status_reason.as_deref(), Some("duplicate_content"));

    let articles = pipeline.db().article_status_counts(DatasetScope::Default).await.unwrap();
    assert_eq!(articles.len(), 1);
    assert_eq!(articles[0].count, 1);
    let stored = pipeline.db().article_for_candidate(first).await.unwrap().unwrap();
    assert_eq!(stored.title.as_deref(), Some("Council approves budget"));
    assert_eq!(stored.authors, vec!["Jane Doe".to_string()]);
}

#[tokio::test]
async fn test_full_run_reaches_cleaned() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(&server, &["/news/library-reopens-after-repairs"])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/news/library-reopens-after-repairs"))
        .respond_with(ResponseTemplate::new(200).set_body_string(article_html(
            "Library reopens",
            "The main library reopened on Monday after months of repairs to its roof.",
        )))
        .mount(&server)
        .await;

    let pipeline = pipeline(config()).await.with_strategies(vec![Arc::new(FeedStrategy::new(30, 200))]);
    mock_source(&pipeline, &server, vec![format!("{}/feed", server.uri())]).await;

    let report = pipeline.run(&options()).await.unwrap();
    assert_eq!(report.discovery.inserted(), 1);
    assert_eq!(report.verification.verified, 1);
    assert_eq!(report.extraction.extracted, 1);
    assert_eq!(report.cleaning.cleaned, 1);
    // No classifier configured
    assert_eq!(report.classification.examined, 0);

    let articles = pipeline.db().articles_in_status(DatasetScope::Default, ArticleStatus::Cleaned, 10).await.unwrap();
    assert_eq!(articles.len(), 1);
    assert!(articles[0].cleaned_text.as_deref().unwrap().contains("main library reopened"));
}

// ============================================================================
// Cleaning and classification
// ============================================================================

#[tokio::test]
async fn test_clean_pauses_boilerplate_only_articles() {
    let server = MockServer::start().await;
    let pipeline = pipeline(config()).await;
    let source = mock_source(&pipeline, &server, Vec::new()).await;
    let real = stored_article(
        &pipeline,
        &source,
        "real-story",
        "The bridge will close for repairs next week.\nAdvertisement\nDetours are posted.",
    )
    .await;
    let empty = stored_article(
        &pipeline,
        &source,
        "empty-story",
        "Advertisement\nSubscribe now for unlimited access\nAll rights reserved.",
    )
    .await;

    let report = pipeline.clean(&options()).await.unwrap();
    assert_eq!(report.cleaned, 1);
    assert_eq!(report.null_text, 1);

    let cleaned = pipeline.db().get_article(real).await.unwrap().unwrap();
    assert_eq!(cleaned.status, ArticleStatus::Cleaned);
    assert_eq!(
        cleaned.cleaned_text.as_deref(),
        Some("The bridge will close for repairs next week.\n\nDetours are posted.")
    );
    let paused = pipeline.db().get_article(empty).await.unwrap().unwrap();
    assert_eq!(paused.status, ArticleStatus::Paused);
    assert_eq!(paused.status_reason.as_deref(), Some("null_text"));
}

struct KeywordClassifier;

#[async_trait]
impl TextClassifier for KeywordClassifier {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn classify(&self, text: &str) -> Result<Classification, CollaboratorError> {
        if text.contains("unreadable") {
            return Err("model timeout".into());
        }
        Ok(Classification {
            primary_label: "local_government".to_string(),
            primary_confidence: 0.87,
            secondary_label: Some("budget".to_string()),
            secondary_confidence: Some(0.31),
        })
    }
}

struct HintGazetteer;

#[async_trait]
impl Gazetteer for HintGazetteer {
    fn name(&self) -> &str {
        "hints"
    }

    async fn match_places(
        &self,
        _text: &str,
        hints: &[String],
    ) -> Result<Vec<PlaceEntity>, CollaboratorError> {
        Ok(hints
            .iter()
            .map(|h| PlaceEntity {
                name: h.clone(),
                kind: "newsroom".to_string(),
                latitude: None,
                longitude: None,
                confidence: Some(1.0),
            })
            .collect())
    }
}

#[tokio::test]
async fn test_classify_labels_and_enriches() {
    let server = MockServer::start().await;
    let pipeline = pipeline(config())
        .await
        .with_text_classifier(Arc::new(KeywordClassifier))
        .with_gazetteer(Arc::new(HintGazetteer));
    let source = mock_source(&pipeline, &server, Vec::new()).await;
    let good = stored_article(&pipeline, &source, "budget", "The council approved the budget.").await;
    let bad = stored_article(&pipeline, &source, "garbled", "This text is unreadable for the model.").await;
    pipeline.clean(&options()).await.unwrap();

    let report = pipeline.classify(&options()).await.unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.classified, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.entities, 1);

    let labelled = pipeline.db().get_article(good).await.unwrap().unwrap();
    assert_eq!(labelled.status, ArticleStatus::Classified);
    assert_eq!(labelled.primary_label.as_deref(), Some("local_government"));
    assert_eq!(labelled.secondary_confidence, Some(0.31));
    let places = pipeline.db().entities_for_article(good).await.unwrap();
    assert_eq!(places.len(), 1);
    assert_eq!(places[0].name, "Mock Gazette");

    // Classifier failure leaves the article cleaned without labels
    let failed = pipeline.db().get_article(bad).await.unwrap().unwrap();
    assert_eq!(failed.status, ArticleStatus::Cleaned);
    assert!(failed.primary_label.is_none());

    pipeline.telemetry().flush().await.unwrap();
    let events = pipeline
        .telemetry()
        .reader()
        .events_of_kind(EventKind::Classification)
        .await
        .unwrap();
    let mut outcomes: Vec<&str> = events.iter().map(|e| e.outcome.as_str()).collect();
    outcomes.sort();
    assert_eq!(outcomes, vec!["classified", "failed"]);
}

// ============================================================================
// Housekeeping and administration
// ============================================================================

#[tokio::test]
async fn test_housekeeping_reports_stalls() {
    let server = MockServer::start().await;
    let pipeline = pipeline(
        config().with_housekeeping(Duration::from_secs(7 * 24 * 3600), Duration::ZERO),
    )
    .await;
    let source = mock_source(&pipeline, &server, Vec::new()).await;
    candidate(&pipeline, &source, "https://127.0.0.1/news/waiting-for-extraction", CandidateStatus::Article).await;
    stored_article(&pipeline, &source, "waiting-for-cleaning", "Body text.").await;
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let report = pipeline.housekeeping(DatasetScope::Default).await.unwrap();
    assert_eq!(report.paused, 0);
    let stages: Vec<(&str, i64)> = report.stalled.iter().map(|s| (s.stage.as_str(), s.count)).collect();
    assert_eq!(stages, vec![("candidate:article", 1), ("article:extracted", 1)]);
}

#[tokio::test]
async fn test_housekeeping_pauses_expired_links() {
    let server = MockServer::start().await;
    let pipeline = pipeline(config().with_housekeeping(Duration::ZERO, Duration::from_secs(3600))).await;
    let source = mock_source(&pipeline, &server, Vec::new()).await;
    let fresh = candidate(&pipeline, &source, "https://127.0.0.1/news/never-verified", CandidateStatus::Discovered).await;
    let verified = candidate(&pipeline, &source, "https://127.0.0.1/news/never-extracted", CandidateStatus::Article).await;
    let done = candidate(&pipeline, &source, "https://127.0.0.1/news/all-done-here", CandidateStatus::Extracted).await;
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let report = pipeline.housekeeping(DatasetScope::Default).await.unwrap();
    assert_eq!(report.paused, 2);
    assert!(report.stalled.is_empty());
    for id in [fresh, verified] {
        let link = pipeline.db().get_candidate(id).await.unwrap().unwrap();
        assert_eq!(link.status, CandidateStatus::Paused);
        assert_eq!(link.status_reason.as_deref(), Some("expired"));
    }
    assert_eq!(
        pipeline.db().get_candidate(done).await.unwrap().unwrap().status,
        CandidateStatus::Extracted
    );
}

#[tokio::test]
async fn test_unknown_dataset_fails_before_work() {
    let pipeline = pipeline(config()).await;
    let result = pipeline.resolve_scope(Some("no-such-dataset")).await;
    assert!(matches!(result, Err(PipelineError::UnknownDataset(slug)) if slug == "no-such-dataset"));

    let id = pipeline.db().create_dataset("pilot", "Pilot", true).await.unwrap();
    assert_eq!(
        pipeline.resolve_scope(Some("pilot")).await.unwrap(),
        DatasetScope::Dataset(id)
    );
    assert_eq!(pipeline.resolve_scope(None).await.unwrap(), DatasetScope::Default);
}

#[tokio::test]
async fn test_reset_candidate() {
    let server = MockServer::start().await;
    let pipeline = pipeline(config()).await;
    let source = mock_source(&pipeline, &server, Vec::new()).await;
    let id = candidate(&pipeline, &source, "https://127.0.0.1/news/wrongly-killed", CandidateStatus::Discovered).await;
    pipeline
        .db()
        .transition_candidate(id, CandidateStatus::Dead, Some("client_error"))
        .await
        .unwrap();

    assert!(pipeline.reset_candidate(id).await.unwrap());
    let link = pipeline.db().get_candidate(id).await.unwrap().unwrap();
    assert_eq!(link.status, CandidateStatus::Discovered);
    assert!(link.status_reason.is_none());
    assert!(!pipeline.reset_candidate(id + 1000).await.unwrap());

    pipeline.telemetry().flush().await.unwrap();
    let events = pipeline
        .telemetry()
        .reader()
        .events_of_kind(EventKind::Housekeeping)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, "reset");
}

#[tokio::test]
async fn test_session_state_survives_restart() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/news/protected-story-page"))
        .respond_with(ResponseTemplate::new(403).insert_header("cf-mitigated", "challenge"))
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let state_file = dir.path().join("sessions.json");

    let first = pipeline(config()).await;
    let source = mock_source(&first, &server, Vec::new()).await;
    candidate(&first, &source, &format!("{}/news/protected-story-page", server.uri()), CandidateStatus::Article).await;
    first.extract(&options()).await.unwrap();
    assert_eq!(first.save_sessions(&state_file).await.unwrap(), 1);
    first.shutdown(true).await.unwrap();

    let second = pipeline(config()).await;
    assert_eq!(second.restore_sessions(&state_file).await.unwrap(), 1);
    let state = second.coordinator().state("127.0.0.1").await.unwrap();
    assert!(state.backoff_until.is_some_and(|until| until > chrono::Utc::now()));
    assert_eq!(state.consecutive_challenges, 1);
}
