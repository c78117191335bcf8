//! Discovery engine.
//!
//! Every source is handed to a set of independent [`Strategy`]
//! implementations. Their results are merged by normalized URL, the highest
//! priority strategy keeping the tag, and written one by one; the unique
//! constraint on `(dataset_id, normalized_url)` turns repeats into no-ops.
//! A failing strategy never takes the others down with it: its error is
//! recorded as a `discovery_strategy` telemetry event keyed by source and
//! strategy, and that same telemetry drives deprioritisation of strategies
//! that keep coming back empty.

pub mod classifier;
pub mod feed;
pub mod heuristic;
pub mod homepage;
pub mod page;
pub mod patterns;

pub use classifier::{ClassifierStrategy, LexicalUrlModel, LinkContext, UrlClassifier};
pub use feed::FeedStrategy;
pub use heuristic::HeuristicStrategy;
pub use homepage::HomepageStrategy;
pub use page::{Page, PageLink, SourceContext};
pub use patterns::PatternStrategy;

use crate::config::{PipelineConfig, RunOptions};
use crate::data::Database;
use crate::error::{PipelineError, Result};
use crate::model::{NewCandidate, Source, StrategyKind};
use crate::telemetry::{EventKind, TelemetryEvent, TelemetryStore};
use crate::urls::normalize_url;
use async_trait::async_trait;
use broadsheet_scanner::{ResponseClass, ScanError, SessionCoordinator};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

const KNOWN_URL_SAMPLE: i64 = 500;

#[derive(Error, Debug, Clone)]
pub enum StrategyError {
    #[error("host {host} deferred until {until}")]
    Deferred { host: String, until: DateTime<Utc> },

    #[error("{url} answered {status} ({})", .class.as_str())]
    Http {
        url: String,
        class: ResponseClass,
        status: u16,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("fetch error: {0}")]
    Scan(String),
}

impl From<ScanError> for StrategyError {
    fn from(e: ScanError) -> Self {
        StrategyError::Scan(e.to_string())
    }
}

impl StrategyError {
    /// Telemetry outcome for a strategy that ended with this error.
    pub fn outcome(&self) -> &'static str {
        match self {
            StrategyError::Deferred { .. } => "deferred",
            _ => "failed",
        }
    }
}

/// One independent way of finding article URLs for a source.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn discover(&self, ctx: &SourceContext) -> std::result::Result<Vec<Url>, StrategyError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyOutcome {
    pub strategy: StrategyKind,
    /// ok, failed, deferred or skipped
    pub outcome: String,
    pub found: usize,
    /// Links this strategy contributed that were not stored before.
    pub new_links: usize,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceDiscovery {
    pub source_id: i64,
    pub host: String,
    pub strategies: Vec<StrategyOutcome>,
    pub unique_links: usize,
    pub inserted: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryReport {
    pub sources: Vec<SourceDiscovery>,
    pub skipped_not_due: usize,
    pub failed_sources: usize,
}

impl DiscoveryReport {
    pub fn inserted(&self) -> usize {
        self.sources.iter().map(|s| s.inserted).sum()
    }
}

/// The standard strategy set, built from configuration.
pub fn default_strategies(
    config: &PipelineConfig,
    url_classifier: Arc<dyn UrlClassifier>,
) -> Vec<Arc<dyn Strategy>> {
    let max = config.max_links_per_strategy;
    vec![
        Arc::new(FeedStrategy::new(config.feed_max_age_days, max)),
        Arc::new(HomepageStrategy::new(max)),
        Arc::new(HeuristicStrategy::new(max)),
        Arc::new(ClassifierStrategy::new(
            url_classifier,
            config.classifier_threshold,
            max,
        )),
        Arc::new(PatternStrategy::new(
            config.pattern_min_frequency,
            config.pattern_max_depth,
            max,
        )),
    ]
}

pub struct DiscoveryEngine {
    db: Database,
    telemetry: Arc<TelemetryStore>,
    coordinator: Arc<SessionCoordinator>,
    config: PipelineConfig,
    strategies: Vec<Arc<dyn Strategy>>,
}

impl DiscoveryEngine {
    pub fn new(
        db: Database,
        telemetry: Arc<TelemetryStore>,
        coordinator: Arc<SessionCoordinator>,
        config: PipelineConfig,
    ) -> Self {
        let strategies = default_strategies(&config, Arc::new(LexicalUrlModel::default()));
        Self {
            db,
            telemetry,
            coordinator,
            config,
            strategies,
        }
    }

    pub fn with_strategies(mut self, strategies: Vec<Arc<dyn Strategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Swap the model behind the classifier strategy.
    pub fn with_url_classifier(mut self, classifier: Arc<dyn UrlClassifier>) -> Self {
        let replacement: Arc<dyn Strategy> = Arc::new(ClassifierStrategy::new(
            classifier,
            self.config.classifier_threshold,
            self.config.max_links_per_strategy,
        ));
        match self
            .strategies
            .iter()
            .position(|s| s.kind() == StrategyKind::Classifier)
        {
            Some(index) => self.strategies[index] = replacement,
            None => self.strategies.push(replacement),
        }
        self
    }

    pub fn strategy_kinds(&self) -> Vec<StrategyKind> {
        self.strategies.iter().map(|s| s.kind()).collect()
    }

    /// Zero new links across the whole skip window.
    async fn is_exhausted(&self, source_id: i64, kind: StrategyKind) -> Result<bool> {
        let window = self.config.strategy_skip_window;
        if window == 0 {
            return Ok(false);
        }
        let yields = self
            .telemetry
            .reader()
            .recent_yields(source_id, kind, window)
            .await?;
        Ok(yields.len() >= window && yields.iter().all(|n| *n == 0))
    }

    /// Run every strategy for one source and persist the merged result.
    pub async fn discover_source(&self, source: &Source, force: bool) -> Result<SourceDiscovery> {
        let base_url = source
            .homepage()
            .ok_or_else(|| PipelineError::InvalidUrl(source.base_url.clone()))?;
        let known_urls = self
            .db
            .known_article_urls(source.id, KNOWN_URL_SAMPLE)
            .await?
            .iter()
            .filter_map(|u| Url::parse(u).ok())
            .collect();
        let ctx = SourceContext::new(
            source.clone(),
            base_url,
            known_urls,
            self.coordinator.clone(),
        );

        let mut active = Vec::new();
        let mut outcomes = Vec::new();
        for strategy in &self.strategies {
            let kind = strategy.kind();
            if !force && self.is_exhausted(source.id, kind).await? {
                debug!(
                    host = %source.host,
                    strategy = kind.as_str(),
                    window = self.config.strategy_skip_window,
                    "Skipping strategy: no new links in recent runs"
                );
                self.telemetry.record_nowait(
                    TelemetryEvent::new(EventKind::StrategySkipped, &source.host, "skipped")
                        .with_host(&source.host)
                        .with_source(source.id)
                        .with_strategy(kind)
                        .with_detail(json!({ "reason": "zero_yield_window" })),
                );
                outcomes.push(StrategyOutcome {
                    strategy: kind,
                    outcome: "skipped".to_string(),
                    found: 0,
                    new_links: 0,
                    error: None,
                    duration_ms: 0,
                });
                continue;
            }
            active.push(strategy.clone());
        }

        // Strategies run concurrently; only the writes below are serialized
        let ctx_ref = &ctx;
        let results = futures::future::join_all(active.iter().map(|strategy| async move {
            let started = Instant::now();
            let result = strategy.discover(ctx_ref).await;
            (strategy.kind(), result, started.elapsed().as_millis() as u64)
        }))
        .await;

        let mut merged: HashMap<String, (Url, StrategyKind)> = HashMap::new();
        let mut order = Vec::new();
        let mut found_by: HashMap<StrategyKind, usize> = HashMap::new();
        let mut errors: HashMap<StrategyKind, StrategyError> = HashMap::new();
        let mut durations: HashMap<StrategyKind, u64> = HashMap::new();
        for (kind, result, duration_ms) in results {
            durations.insert(kind, duration_ms);
            match result {
                Ok(urls) => {
                    found_by.insert(kind, urls.len());
                    for url in urls {
                        let Some(normalized) = normalize_url(url.as_str()) else {
                            continue;
                        };
                        match merged.get_mut(&normalized) {
                            Some(existing) => {
                                if kind.priority() > existing.1.priority() {
                                    *existing = (url, kind);
                                }
                            }
                            None => {
                                order.push(normalized.clone());
                                merged.insert(normalized, (url, kind));
                            }
                        }
                    }
                }
                Err(e) => {
                    if matches!(e, StrategyError::Deferred { .. }) {
                        debug!(host = %source.host, strategy = kind.as_str(), error = %e, "Strategy deferred");
                    } else {
                        warn!(host = %source.host, strategy = kind.as_str(), error = %e, "Strategy failed");
                    }
                    errors.insert(kind, e);
                }
            }
        }

        let mut inserted = 0;
        let mut duplicates = 0;
        let mut new_by: HashMap<StrategyKind, usize> = HashMap::new();
        for normalized in &order {
            let Some((url, kind)) = merged.get(normalized) else {
                continue;
            };
            let candidate = NewCandidate {
                url: url.to_string(),
                normalized_url: normalized.clone(),
                discovered_by: *kind,
                priority: kind.priority(),
            };
            match self.db.insert_candidate(source, &candidate).await? {
                Some(_) => {
                    inserted += 1;
                    *new_by.entry(*kind).or_default() += 1;
                }
                None => duplicates += 1,
            }
        }

        for strategy in &active {
            let kind = strategy.kind();
            let duration_ms = durations.get(&kind).copied().unwrap_or_default();
            let found = found_by.get(&kind).copied().unwrap_or_default();
            let new_links = new_by.get(&kind).copied().unwrap_or_default();
            let error = errors.get(&kind);
            let outcome = error.map_or("ok", |e| e.outcome());

            let mut detail = json!({ "found": found });
            if let Some(e) = error {
                detail["error"] = json!(e.to_string());
            }
            self.telemetry.record_nowait(
                TelemetryEvent::new(EventKind::DiscoveryStrategy, &source.host, outcome)
                    .with_host(&source.host)
                    .with_source(source.id)
                    .with_strategy(kind)
                    .with_items(new_links as i64)
                    .with_duration_ms(duration_ms)
                    .with_detail(detail),
            );
            outcomes.push(StrategyOutcome {
                strategy: kind,
                outcome: outcome.to_string(),
                found,
                new_links,
                error: error.map(|e| e.to_string()),
                duration_ms,
            });
        }
        outcomes.sort_by_key(|o| o.strategy);

        self.db.mark_source_discovered(source.id).await?;
        info!(
            host = %source.host,
            unique = order.len(),
            inserted,
            duplicates,
            "Discovery finished for source"
        );

        Ok(SourceDiscovery {
            source_id: source.id,
            host: source.host.clone(),
            strategies: outcomes,
            unique_links: order.len(),
            inserted,
            duplicates,
        })
    }

    /// Discover every due, active source in scope.
    pub async fn run(&self, options: &RunOptions) -> Result<DiscoveryReport> {
        let sources = match &options.source_host {
            Some(host) => {
                let source = self
                    .db
                    .source_by_host(options.scope.write_id(), &crate::urls::normalize_host(host))
                    .await?
                    .ok_or_else(|| PipelineError::UnknownSource(host.clone()))?;
                vec![source]
            }
            None => self.db.list_sources(options.scope, false).await?,
        };

        let now = Utc::now();
        let limit = options.limit.unwrap_or(self.config.batch_size);
        let mut report = DiscoveryReport::default();
        let mut due = Vec::new();
        for source in sources {
            if due.len() >= limit {
                break;
            }
            if !options.force && !source.is_due(now) {
                debug!(
                    host = %source.host,
                    last_discovery_at = ?source.last_discovery_at,
                    frequency_hours = source.discovery_frequency_hours,
                    "Skipping source: discovery not due"
                );
                report.skipped_not_due += 1;
                continue;
            }
            due.push(source);
        }

        let results: Vec<(String, Result<SourceDiscovery>)> = stream::iter(due)
            .map(|source| async move {
                if options.expired() {
                    debug!(host = %source.host, "Deadline reached, source left for next run");
                    return (source.host.clone(), Err(PipelineError::DeadlineReached));
                }
                let result = self.discover_source(&source, options.force).await;
                (source.host, result)
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        for (host, result) in results {
            match result {
                Ok(discovery) => report.sources.push(discovery),
                Err(PipelineError::DeadlineReached) => {}
                Err(e) => {
                    warn!(host = %host, error = %e, "Discovery failed for source");
                    self.telemetry.record_nowait(
                        TelemetryEvent::new(EventKind::StageError, &host, "error")
                            .with_host(&host)
                            .with_detail(json!({ "stage": "discovery", "error": e.to_string() })),
                    );
                    report.failed_sources += 1;
                }
            }
        }
        report.sources.sort_by(|a, b| a.host.cmp(&b.host));
        Ok(report)
    }
}
