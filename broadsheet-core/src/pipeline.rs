//! Orchestrator: wires the stages to one store, one telemetry sink and one
//! session coordinator, and owns the article-side transitions plus
//! housekeeping.
//!
//! Candidate links flow `discovered → article → extracted`; articles flow
//! `extracted → cleaned → classified`. Every transition here is forward-only
//! and guarded in SQL. The only backwards move is [`Pipeline::reset_candidate`],
//! an explicit operator action.

use crate::collaborators::{Gazetteer, TextClassifier};
use crate::config::{PipelineConfig, RunOptions};
use crate::data::Database;
use crate::discovery::{DiscoveryEngine, DiscoveryReport, Strategy, UrlClassifier};
use crate::error::{PipelineError, Result};
use crate::extraction::{ExtractionEngine, ExtractionReport};
use crate::model::{
    Article, ArticleStatus, CandidateStatus, DatasetScope, PauseReason, current_timestamp,
};
use crate::telemetry::{EventKind, TelemetryEvent, TelemetryStore};
use crate::text::clean_body;
use crate::verification::{VerificationReport, VerificationService};
use broadsheet_scanner::SessionCoordinator;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StalledStage {
    pub stage: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HousekeepingReport {
    /// Candidates moved to `paused` (`expired`).
    pub paused: u64,
    /// Non-empty stall warnings only.
    pub stalled: Vec<StalledStage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleaningReport {
    pub examined: usize,
    pub cleaned: usize,
    pub null_text: usize,
    pub superseded: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationReport {
    pub examined: usize,
    pub classified: usize,
    pub failed: usize,
    pub entities: usize,
}

/// Result of a full `run`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub discovery: DiscoveryReport,
    pub verification: VerificationReport,
    pub extraction: ExtractionReport,
    pub cleaning: CleaningReport,
    pub classification: ClassificationReport,
}

enum CleanOutcome {
    Cleaned,
    NullText,
    Superseded,
}

enum ClassifyOutcome {
    Classified { entities: usize },
    Failed,
}

pub struct Pipeline {
    db: Database,
    telemetry: Arc<TelemetryStore>,
    coordinator: Arc<SessionCoordinator>,
    config: PipelineConfig,
    discovery: DiscoveryEngine,
    verification: VerificationService,
    extraction: ExtractionEngine,
    classifier: Option<Arc<dyn TextClassifier>>,
    gazetteer: Option<Arc<dyn Gazetteer>>,
}

impl Pipeline {
    /// Open the configured database and build every stage on top of it.
    pub async fn open(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let db = Database::open(&config.database_url).await?;
        Self::new(db, config)
    }

    /// Build on an already opened database. Must run inside a tokio runtime
    /// when telemetry is asynchronous.
    pub fn new(db: Database, config: PipelineConfig) -> Result<Self> {
        let telemetry = Arc::new(TelemetryStore::new(db.backend(), config.telemetry_mode));
        let coordinator = Arc::new(
            SessionCoordinator::new(config.session.clone())?
                .with_event_callback(telemetry.session_callback()),
        );
        Ok(Self::with_parts(db, telemetry, coordinator, config))
    }

    /// Build from caller-owned parts, e.g. a coordinator shared with other
    /// pipelines in the same process.
    pub fn with_parts(
        db: Database,
        telemetry: Arc<TelemetryStore>,
        coordinator: Arc<SessionCoordinator>,
        config: PipelineConfig,
    ) -> Self {
        let discovery = DiscoveryEngine::new(
            db.clone(),
            telemetry.clone(),
            coordinator.clone(),
            config.clone(),
        );
        let verification = VerificationService::new(
            db.clone(),
            telemetry.clone(),
            coordinator.clone(),
            config.clone(),
        );
        let extraction = ExtractionEngine::new(
            db.clone(),
            telemetry.clone(),
            coordinator.clone(),
            config.clone(),
        );
        Self {
            db,
            telemetry,
            coordinator,
            config,
            discovery,
            verification,
            extraction,
            classifier: None,
            gazetteer: None,
        }
    }

    pub fn with_text_classifier(mut self, classifier: Arc<dyn TextClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_gazetteer(mut self, gazetteer: Arc<dyn Gazetteer>) -> Self {
        self.gazetteer = Some(gazetteer);
        self
    }

    pub fn with_url_classifier(mut self, classifier: Arc<dyn UrlClassifier>) -> Self {
        self.discovery = self.discovery.with_url_classifier(classifier);
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<Arc<dyn Strategy>>) -> Self {
        self.discovery = self.discovery.with_strategies(strategies);
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn telemetry(&self) -> &Arc<TelemetryStore> {
        &self.telemetry
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Map an optional `--dataset` slug onto a scope. Fails before any
    /// network activity when the slug is unknown.
    pub async fn resolve_scope(&self, dataset: Option<&str>) -> Result<DatasetScope> {
        match dataset {
            None => Ok(DatasetScope::Default),
            Some(slug) => {
                let dataset = self
                    .db
                    .dataset_by_slug(slug)
                    .await?
                    .ok_or_else(|| PipelineError::UnknownDataset(slug.to_string()))?;
                Ok(DatasetScope::Dataset(dataset.id))
            }
        }
    }

    pub async fn discover(&self, options: &RunOptions) -> Result<DiscoveryReport> {
        self.discovery.run(options).await
    }

    pub async fn verify(&self, options: &RunOptions) -> Result<VerificationReport> {
        self.verification.run(options).await
    }

    pub async fn extract(&self, options: &RunOptions) -> Result<ExtractionReport> {
        self.extraction.run(options).await
    }

    /// Discovery, verification, extraction, cleaning and (when a classifier
    /// is configured) classification, one after another.
    pub async fn run(&self, options: &RunOptions) -> Result<RunReport> {
        let started = Instant::now();
        let mut report = RunReport {
            discovery: self.discover(options).await?,
            ..Default::default()
        };
        report.verification = self.verify(options).await?;
        report.extraction = self.extract(options).await?;
        report.cleaning = self.clean(options).await?;
        report.classification = self.classify(options).await?;
        info!(
            inserted = report.discovery.inserted(),
            verified = report.verification.verified,
            extracted = report.extraction.extracted,
            cleaned = report.cleaning.cleaned,
            classified = report.classification.classified,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline run finished"
        );
        Ok(report)
    }

    fn batch_limit(&self, options: &RunOptions) -> i64 {
        options.limit.unwrap_or(self.config.batch_size) as i64
    }

    /// Move `extracted` articles to `cleaned`. Articles whose text is nothing
    /// but boilerplate are paused with `null_text`.
    pub async fn clean(&self, options: &RunOptions) -> Result<CleaningReport> {
        let batch = self
            .db
            .articles_in_status(options.scope, ArticleStatus::Extracted, self.batch_limit(options))
            .await?;
        let mut report = CleaningReport::default();
        for article in batch {
            if options.expired() {
                debug!(article_id = article.id, "Deadline reached, article left for next run");
                break;
            }
            report.examined += 1;
            match self.clean_article(&article).await? {
                CleanOutcome::Cleaned => report.cleaned += 1,
                CleanOutcome::NullText => report.null_text += 1,
                CleanOutcome::Superseded => report.superseded += 1,
            }
        }
        if report.examined > 0 {
            info!(
                examined = report.examined,
                cleaned = report.cleaned,
                null_text = report.null_text,
                "Cleaning batch finished"
            );
        }
        Ok(report)
    }

    async fn clean_article(&self, article: &Article) -> Result<CleanOutcome> {
        let cleaned = clean_body(article.body.as_deref().unwrap_or_default());
        if cleaned.is_empty() {
            let moved = self
                .db
                .transition_article(
                    article.id,
                    ArticleStatus::Paused,
                    Some(PauseReason::NullText.as_str()),
                )
                .await?;
            if !moved {
                return Ok(CleanOutcome::Superseded);
            }
            warn!(article_id = article.id, url = %article.url, "Nothing left after cleaning, article paused");
            self.telemetry.record_nowait(
                TelemetryEvent::new(EventKind::StageError, &article.url, PauseReason::NullText.as_str())
                    .with_source(article.source_id)
                    .with_detail(json!({ "stage": "cleaning", "article_id": article.id })),
            );
            return Ok(CleanOutcome::NullText);
        }
        if self.db.mark_article_cleaned(article.id, &cleaned).await? {
            debug!(article_id = article.id, chars = cleaned.len(), "Article cleaned");
            Ok(CleanOutcome::Cleaned)
        } else {
            Ok(CleanOutcome::Superseded)
        }
    }

    /// Label `cleaned` articles through the configured classifier, then
    /// enrich them with place entities when a gazetteer is set. Classifier
    /// failures leave the article `cleaned` with empty labels.
    pub async fn classify(&self, options: &RunOptions) -> Result<ClassificationReport> {
        let mut report = ClassificationReport::default();
        let Some(classifier) = self.classifier.clone() else {
            debug!("No text classifier configured, skipping classification");
            return Ok(report);
        };
        let batch = self
            .db
            .articles_in_status(options.scope, ArticleStatus::Cleaned, self.batch_limit(options))
            .await?;

        let outcomes: Vec<Option<ClassifyOutcome>> = stream::iter(batch)
            .map(|article| {
                let classifier = classifier.clone();
                async move {
                    if options.expired() {
                        return None;
                    }
                    match self.classify_article(classifier.as_ref(), &article).await {
                        Ok(outcome) => Some(outcome),
                        Err(e) => {
                            warn!(article_id = article.id, error = %e, "Classification failed");
                            Some(ClassifyOutcome::Failed)
                        }
                    }
                }
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        for outcome in outcomes.into_iter().flatten() {
            report.examined += 1;
            match outcome {
                ClassifyOutcome::Classified { entities } => {
                    report.classified += 1;
                    report.entities += entities;
                }
                ClassifyOutcome::Failed => report.failed += 1,
            }
        }
        if report.examined > 0 {
            info!(
                examined = report.examined,
                classified = report.classified,
                failed = report.failed,
                "Classification batch finished"
            );
        }
        Ok(report)
    }

    async fn classify_article(
        &self,
        classifier: &dyn TextClassifier,
        article: &Article,
    ) -> Result<ClassifyOutcome> {
        let text = article
            .cleaned_text
            .as_deref()
            .or(article.body.as_deref())
            .unwrap_or_default();
        let started = Instant::now();
        let classification = match classifier.classify(text).await {
            Ok(classification) => classification,
            Err(e) => {
                warn!(
                    article_id = article.id,
                    classifier = classifier.name(),
                    error = %e,
                    "Text classifier failed, labels left empty"
                );
                self.telemetry.record_nowait(
                    TelemetryEvent::new(EventKind::Classification, &article.url, "failed")
                        .with_source(article.source_id)
                        .with_duration_ms(started.elapsed().as_millis() as u64)
                        .with_detail(json!({
                            "article_id": article.id,
                            "classifier": classifier.name(),
                            "error": e.to_string(),
                        })),
                );
                return Ok(ClassifyOutcome::Failed);
            }
        };

        if !self.db.mark_article_classified(article.id, &classification).await? {
            debug!(article_id = article.id, "Article moved on before labels were stored");
            return Ok(ClassifyOutcome::Failed);
        }
        self.telemetry.record_nowait(
            TelemetryEvent::new(EventKind::Classification, &article.url, "classified")
                .with_source(article.source_id)
                .with_duration_ms(started.elapsed().as_millis() as u64)
                .with_detail(json!({
                    "article_id": article.id,
                    "classifier": classifier.name(),
                    "primary_label": classification.primary_label,
                    "primary_confidence": classification.primary_confidence,
                })),
        );

        let entities = self.enrich(article, text).await;
        Ok(ClassifyOutcome::Classified { entities })
    }

    /// Gazetteer pass. Errors are logged and otherwise ignored.
    async fn enrich(&self, article: &Article, text: &str) -> usize {
        let Some(gazetteer) = &self.gazetteer else {
            return 0;
        };
        let hints = match self.db.get_source(article.source_id).await {
            Ok(Some(source)) => vec![source.name],
            _ => Vec::new(),
        };
        let places = match gazetteer.match_places(text, &hints).await {
            Ok(places) => places,
            Err(e) => {
                warn!(article_id = article.id, gazetteer = gazetteer.name(), error = %e, "Gazetteer lookup failed");
                return 0;
            }
        };
        match self.db.insert_entities(article.id, &places).await {
            Ok(n) => n,
            Err(e) => {
                warn!(article_id = article.id, error = %e, "Could not store place entities");
                0
            }
        }
    }

    /// Pause links with no progress inside the expiration window and warn
    /// about stages holding items past the stall threshold. Nothing else is
    /// changed.
    pub async fn housekeeping(&self, scope: DatasetScope) -> Result<HousekeepingReport> {
        let now = current_timestamp();
        let expiration_cutoff = now.saturating_sub(seconds(self.config.expiration_window));
        let stall_cutoff = now.saturating_sub(seconds(self.config.stall_threshold));

        let paused = self.db.pause_stale_candidates(scope, expiration_cutoff).await?;
        if paused > 0 {
            info!(
                paused,
                window_days = self.config.expiration_window.as_secs() / 86_400,
                "Paused candidates with no progress"
            );
        }

        let mut stalled = Vec::new();
        let article_links = self
            .db
            .stalled_candidates(scope, CandidateStatus::Article, stall_cutoff)
            .await?;
        stalled.push(StalledStage {
            stage: format!("candidate:{}", CandidateStatus::Article),
            count: article_links,
        });
        for status in [ArticleStatus::Extracted, ArticleStatus::Cleaned] {
            let count = self.db.stalled_articles(scope, status, stall_cutoff).await?;
            stalled.push(StalledStage {
                stage: format!("article:{}", status),
                count,
            });
        }
        stalled.retain(|s| s.count > 0);
        for stage in &stalled {
            warn!(
                stage = %stage.stage,
                count = stage.count,
                threshold_hours = self.config.stall_threshold.as_secs() / 3600,
                "Items stalled beyond threshold"
            );
        }

        self.telemetry.record_nowait(
            TelemetryEvent::new(EventKind::Housekeeping, "housekeeping", "completed")
                .with_items(paused as i64)
                .with_detail(json!({ "paused": paused, "stalled": stalled })),
        );
        Ok(HousekeepingReport { paused, stalled })
    }

    /// Operator reset of one candidate back to `discovered`.
    pub async fn reset_candidate(&self, id: i64) -> Result<bool> {
        let Some(candidate) = self.db.get_candidate(id).await? else {
            return Ok(false);
        };
        let reset = self.db.reset_candidate(id).await?;
        if reset {
            info!(candidate_id = id, from = %candidate.status, url = %candidate.url, "Candidate reset to discovered");
            self.telemetry.record_nowait(
                TelemetryEvent::new(EventKind::Housekeeping, &candidate.url, "reset")
                    .with_source(candidate.source_id)
                    .with_detail(json!({ "candidate_id": id, "from": candidate.status })),
            );
        }
        Ok(reset)
    }

    /// Write per-host session state to `path` as JSON.
    pub async fn save_sessions(&self, path: &Path) -> Result<usize> {
        let states = self.coordinator.checkpoint().await;
        let json = serde_json::to_string_pretty(&states)?;
        std::fs::write(path, json)?;
        Ok(states.len())
    }

    /// Load per-host session state saved by [`Pipeline::save_sessions`].
    pub async fn restore_sessions(&self, path: &Path) -> Result<usize> {
        let json = std::fs::read_to_string(path)?;
        Ok(self.coordinator.restore_json(&json).await?)
    }

    /// Stop the telemetry writer, applying queued events when `drain`.
    pub async fn shutdown(&self, drain: bool) -> Result<()> {
        self.telemetry.shutdown(drain).await?;
        Ok(())
    }
}

fn seconds(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}
