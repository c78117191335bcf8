//! Extraction engine: turns verified (`article`) candidates into stored
//! articles.
//!
//! Bot challenges are not failures here. The coordinator has already put
//! the host into long backoff when it classified the response, so the link
//! simply stays in `article` and is picked up again once the host recovers.
//! Links on hosts still in backoff are passed over when a batch is filled,
//! so they never hold back links on healthy hosts.
//! Pages that parse but yield no body text are stored as `paused` articles
//! with reason `null_text` so they stay visible for diagnosis.

pub mod parser;
pub mod wire;

pub use parser::{ParsedArticle, parse_article};
pub use wire::detect_wire_services;

use crate::config::{PipelineConfig, RunOptions};
use crate::data::Database;
use crate::error::{PipelineError, Result};
use crate::model::{
    ArticleStatus, CandidateLink, CandidateStatus, DeadReason, NewArticle, PauseReason,
};
use crate::telemetry::{EventKind, TelemetryEvent, TelemetryStore};
use crate::text::content_hash;
use crate::urls::normalize_host;
use crate::verification::host_backoff;
use broadsheet_scanner::{FetchOutcome, FetchResponse, ResponseClass, SessionCoordinator};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionVerdict {
    Extracted { article_id: i64 },
    /// Stored as a paused article with no text.
    NullText { article_id: i64 },
    Duplicate { existing_article_id: i64 },
    Challenged,
    Retry(ResponseClass),
    Dead(DeadReason),
    Deferred,
    Superseded,
}

impl ExtractionVerdict {
    fn outcome(&self) -> &'static str {
        match self {
            ExtractionVerdict::Extracted { .. } => "extracted",
            ExtractionVerdict::NullText { .. } => "null_text",
            ExtractionVerdict::Duplicate { .. } => "duplicate_content",
            ExtractionVerdict::Challenged => "bot_challenge",
            ExtractionVerdict::Retry(class) => class.as_str(),
            ExtractionVerdict::Dead(reason) => reason.as_str(),
            ExtractionVerdict::Deferred => "deferred",
            ExtractionVerdict::Superseded => "superseded",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionReport {
    pub examined: usize,
    pub extracted: usize,
    pub null_text: usize,
    pub duplicates: usize,
    pub challenged: usize,
    pub retried: usize,
    pub dead: usize,
    pub deferred: usize,
    pub superseded: usize,
    pub skipped_backoff: usize,
}

impl ExtractionReport {
    fn tally(&mut self, verdict: ExtractionVerdict) {
        self.examined += 1;
        match verdict {
            ExtractionVerdict::Extracted { .. } => self.extracted += 1,
            ExtractionVerdict::NullText { .. } => self.null_text += 1,
            ExtractionVerdict::Duplicate { .. } => self.duplicates += 1,
            ExtractionVerdict::Challenged => self.challenged += 1,
            ExtractionVerdict::Retry(_) => self.retried += 1,
            ExtractionVerdict::Dead(_) => self.dead += 1,
            ExtractionVerdict::Deferred => self.deferred += 1,
            ExtractionVerdict::Superseded => self.superseded += 1,
        }
    }
}

pub struct ExtractionEngine {
    db: Database,
    telemetry: Arc<TelemetryStore>,
    coordinator: Arc<SessionCoordinator>,
    config: PipelineConfig,
}

impl ExtractionEngine {
    pub fn new(
        db: Database,
        telemetry: Arc<TelemetryStore>,
        coordinator: Arc<SessionCoordinator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            db,
            telemetry,
            coordinator,
            config,
        }
    }

    pub async fn run(&self, options: &RunOptions) -> Result<ExtractionReport> {
        let source_id = match &options.source_host {
            Some(host) => Some(
                self.db
                    .source_by_host(options.scope.write_id(), &normalize_host(host))
                    .await?
                    .ok_or_else(|| PipelineError::UnknownSource(host.clone()))?
                    .id,
            ),
            None => None,
        };
        let limit = options.limit.unwrap_or(self.config.batch_size);
        let (batch, skipped_backoff) = self.ready_batch(options, source_id, limit).await?;

        let mut report = ExtractionReport {
            skipped_backoff,
            ..Default::default()
        };
        if batch.is_empty() {
            debug!("No verified candidates waiting for extraction");
            return Ok(report);
        }

        let verdicts: Vec<Option<ExtractionVerdict>> = stream::iter(batch)
            .map(|candidate| async move {
                if options.expired() {
                    debug!(candidate_id = candidate.id, "Deadline reached, candidate left for next run");
                    return None;
                }
                match self.extract(&candidate).await {
                    Ok(verdict) => Some(verdict),
                    Err(e) => {
                        warn!(candidate_id = candidate.id, url = %candidate.url, error = %e, "Extraction failed");
                        self.telemetry.record_nowait(
                            TelemetryEvent::new(EventKind::StageError, &candidate.url, "error")
                                .with_source(candidate.source_id)
                                .with_detail(json!({ "stage": "extraction", "error": e.to_string() })),
                        );
                        None
                    }
                }
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        for verdict in verdicts.into_iter().flatten() {
            report.tally(verdict);
        }
        info!(
            examined = report.examined,
            extracted = report.extracted,
            duplicates = report.duplicates,
            null_text = report.null_text,
            challenged = report.challenged,
            skipped_backoff = report.skipped_backoff,
            "Extraction batch finished"
        );
        Ok(report)
    }

    /// Verified candidates, at most `limit`, passing over the ones whose host
    /// is still in backoff.
    async fn ready_batch(
        &self,
        options: &RunOptions,
        source_id: Option<i64>,
        limit: usize,
    ) -> Result<(Vec<CandidateLink>, usize)> {
        let page_size = (limit as i64).clamp(1, 500);
        let mut offset = 0;
        let mut ready = Vec::new();
        let mut skipped = 0;
        while ready.len() < limit {
            let page = self
                .db
                .candidates_page(options.scope, CandidateStatus::Article, source_id, offset, page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as i64;
            for candidate in page {
                if ready.len() >= limit {
                    break;
                }
                match host_backoff(&self.coordinator, &candidate).await {
                    Some(until) => {
                        debug!(
                            candidate_id = candidate.id,
                            url = %candidate.url,
                            until = %until,
                            "Skipping candidate: host in backoff"
                        );
                        skipped += 1;
                    }
                    None => ready.push(candidate),
                }
            }
        }
        Ok((ready, skipped))
    }

    /// Fetch, parse and store one verified candidate.
    pub async fn extract(&self, candidate: &CandidateLink) -> Result<ExtractionVerdict> {
        let url = Url::parse(&candidate.url)
            .map_err(|e| PipelineError::InvalidUrl(format!("{}: {}", candidate.url, e)))?;
        let host = url.host_str().unwrap_or_default().to_string();

        let started = Instant::now();
        let response = match self.coordinator.fetch(&url).await? {
            FetchOutcome::Deferred { host, until } => {
                debug!(host = %host, until = %until, url = %url, "Extraction deferred by host backoff");
                self.emit(candidate, &host, ExtractionVerdict::Deferred, json!({ "until": until.to_rfc3339() }));
                return Ok(ExtractionVerdict::Deferred);
            }
            FetchOutcome::Fetched(response) => response,
        };
        let mut detail = json!({
            "status_code": response.status_code,
            "elapsed_ms": started.elapsed().as_millis() as u64,
        });

        let mut attempt = candidate.retry_count;
        let verdict = match response.class {
            ResponseClass::Success => self.store(candidate, &response, &mut detail).await?,
            ResponseClass::BotChallenge => self.challenged(candidate, &host, &response).await?,
            ResponseClass::NotFound => self.kill(candidate, DeadReason::NotFound).await?,
            ResponseClass::ClientError => self.kill(candidate, DeadReason::ClientError).await?,
            class => {
                let error = response
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("HTTP {} ({})", response.status_code, class.as_str()));
                detail["error"] = json!(error);
                let (verdict, retries) = self.retry(candidate, class, &error).await?;
                attempt = retries;
                verdict
            }
        };
        self.emit_attempt(candidate, &host, verdict, attempt, detail);
        Ok(verdict)
    }

    async fn challenged(
        &self,
        candidate: &CandidateLink,
        host: &str,
        response: &FetchResponse,
    ) -> Result<ExtractionVerdict> {
        let until = self
            .coordinator
            .state(host)
            .await
            .and_then(|s| s.backoff_until);
        warn!(
            host,
            url = %candidate.url,
            status = response.status_code,
            backoff_until = ?until,
            "Bot challenge during extraction, link requeued"
        );
        self.db.record_candidate_attempt(candidate.id, None).await?;
        self.telemetry.record_nowait(
            TelemetryEvent::new(EventKind::BotChallenge, &candidate.url, "bot_challenge")
                .with_host(host)
                .with_source(candidate.source_id)
                .with_detail(json!({
                    "stage": "extraction",
                    "status_code": response.status_code,
                    "backoff_until": until.map(|u| u.to_rfc3339()),
                })),
        );
        Ok(ExtractionVerdict::Challenged)
    }

    async fn store(
        &self,
        candidate: &CandidateLink,
        response: &FetchResponse,
        detail: &mut serde_json::Value,
    ) -> Result<ExtractionVerdict> {
        let parsed = parse_article(&response.body);
        let wire_services = detect_wire_services(
            parsed.byline.as_deref(),
            &parsed.authors,
            parsed.body.as_deref(),
        );
        detail["layers"] = json!(parsed.sources);
        if !wire_services.is_empty() {
            detail["wire_services"] = json!(wire_services);
        }

        let body = parsed
            .body
            .as_deref()
            .map(crate::text::normalize_whitespace)
            .filter(|b| !b.is_empty());
        let hash = body.as_deref().map(content_hash);

        if let Some(hash) = &hash
            && let Some(existing) = self
                .db
                .article_by_content_hash(candidate.dataset_id, hash)
                .await?
            && existing.candidate_link_id != candidate.id
        {
            debug!(
                candidate_id = candidate.id,
                existing_article_id = existing.id,
                "Body identical to an existing article"
            );
            return self.duplicate(candidate, existing.id).await;
        }

        let (status, status_reason) = match body {
            Some(_) => (ArticleStatus::Extracted, None),
            None => (ArticleStatus::Paused, Some(PauseReason::NullText.as_str().to_string())),
        };
        let article = NewArticle {
            candidate_link_id: candidate.id,
            dataset_id: candidate.dataset_id,
            source_id: candidate.source_id,
            url: response.final_url.clone(),
            title: parsed.title,
            authors: parsed.authors,
            body: parsed.body,
            published_at: parsed.published_at,
            content_hash: hash,
            wire_services,
            status,
            status_reason,
        };

        let article_id = match self.db.insert_article(&article).await? {
            Some(id) => id,
            None => {
                // Either this candidate already has an article (admin reset)
                // or another worker stored the same text first
                if let Some(existing) = self.db.article_for_candidate(candidate.id).await? {
                    existing.id
                } else if let Some(hash) = &article.content_hash
                    && let Some(existing) = self
                        .db
                        .article_by_content_hash(candidate.dataset_id, hash)
                        .await?
                {
                    return self.duplicate(candidate, existing.id).await;
                } else {
                    return Ok(ExtractionVerdict::Superseded);
                }
            }
        };

        if !self
            .db
            .transition_candidate(candidate.id, CandidateStatus::Extracted, None)
            .await?
        {
            return Ok(ExtractionVerdict::Superseded);
        }
        if status == ArticleStatus::Paused {
            warn!(candidate_id = candidate.id, article_id, url = %candidate.url, "Extracted page has no body text");
            Ok(ExtractionVerdict::NullText { article_id })
        } else {
            Ok(ExtractionVerdict::Extracted { article_id })
        }
    }

    async fn duplicate(&self, candidate: &CandidateLink, existing_article_id: i64) -> Result<ExtractionVerdict> {
        if self
            .db
            .transition_candidate(
                candidate.id,
                CandidateStatus::Dead,
                Some(DeadReason::DuplicateContent.as_str()),
            )
            .await?
        {
            Ok(ExtractionVerdict::Duplicate { existing_article_id })
        } else {
            Ok(ExtractionVerdict::Superseded)
        }
    }

    async fn kill(&self, candidate: &CandidateLink, reason: DeadReason) -> Result<ExtractionVerdict> {
        if self
            .db
            .transition_candidate(candidate.id, CandidateStatus::Dead, Some(reason.as_str()))
            .await?
        {
            Ok(ExtractionVerdict::Dead(reason))
        } else {
            Ok(ExtractionVerdict::Superseded)
        }
    }

    async fn retry(
        &self,
        candidate: &CandidateLink,
        class: ResponseClass,
        error: &str,
    ) -> Result<(ExtractionVerdict, i64)> {
        let Some(retries) = self
            .db
            .record_candidate_retry(candidate.id, CandidateStatus::Article, error)
            .await?
        else {
            return Ok((ExtractionVerdict::Superseded, candidate.retry_count));
        };
        if retries >= i64::from(self.config.max_retries) {
            warn!(candidate_id = candidate.id, retries, "Extraction retry limit reached");
            let verdict = self.kill(candidate, DeadReason::MaxRetries).await?;
            return Ok((verdict, retries));
        }
        Ok((ExtractionVerdict::Retry(class), retries))
    }

    fn emit(&self, candidate: &CandidateLink, host: &str, verdict: ExtractionVerdict, detail: serde_json::Value) {
        self.emit_attempt(candidate, host, verdict, candidate.retry_count, detail);
    }

    fn emit_attempt(
        &self,
        candidate: &CandidateLink,
        host: &str,
        verdict: ExtractionVerdict,
        attempt: i64,
        mut detail: serde_json::Value,
    ) {
        detail["candidate_id"] = json!(candidate.id);
        if let ExtractionVerdict::Extracted { article_id } | ExtractionVerdict::NullText { article_id } = verdict {
            detail["article_id"] = json!(article_id);
        }
        self.telemetry.record_nowait(
            TelemetryEvent::new(EventKind::Extraction, &candidate.url, verdict.outcome())
                .with_host(host)
                .with_source(candidate.source_id)
                .with_attempt(attempt)
                .with_detail(detail),
        );
    }
}
