//! Verification service: confirms discovered links are live, unique
//! articles before extraction spends effort on them.
//!
//! Links are taken in bounded batches of `discovered` candidates, highest
//! priority first. A link is due once `verification_interval` has passed
//! since its last attempt (or immediately with `force`). Outcomes map onto
//! the candidate state machine as follows:
//!
//! | Response | Result |
//! |----------|--------|
//! | 2xx/3xx, unique | `discovered → article` |
//! | 2xx/3xx, final URL or page hash of another verified link | `dead` (`duplicate_url` / `duplicate_content`) |
//! | 404, 410 | `dead` (`not_found`) |
//! | other 4xx | `dead` (`client_error`) |
//! | timeout, 5xx, 429 | retry count + 1, `dead` (`max_retries`) at the limit |
//! | bot challenge | attempt recorded, stays `discovered`, host in long backoff |
//! | host in backoff | left out of the batch, no attempt counted |

use crate::config::{PipelineConfig, RunOptions};
use crate::data::Database;
use crate::error::{PipelineError, Result};
use crate::model::{CandidateLink, CandidateStatus, DatasetScope, DeadReason};
use crate::telemetry::{EventKind, TelemetryEvent, TelemetryStore};
use crate::text::content_hash;
use crate::urls::{normalize_host, normalize_url};
use broadsheet_scanner::{Admission, FetchOutcome, ResponseClass, SessionCoordinator, host_key};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// What happened to one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Verified,
    Dead(DeadReason),
    /// Recoverable failure; the link stays `discovered`.
    Retry(ResponseClass),
    /// Bot challenge; the link stays `discovered` without using a retry.
    Challenged,
    Deferred,
    /// Another worker moved the link first.
    Superseded,
}

impl Verdict {
    fn outcome(&self) -> &'static str {
        match self {
            Verdict::Verified => "verified",
            Verdict::Dead(reason) => reason.as_str(),
            Verdict::Retry(class) => class.as_str(),
            Verdict::Challenged => "bot_challenge",
            Verdict::Deferred => "deferred",
            Verdict::Superseded => "superseded",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub examined: usize,
    pub verified: usize,
    pub dead: usize,
    pub retried: usize,
    pub challenged: usize,
    pub deferred: usize,
    pub superseded: usize,
    pub skipped_not_due: usize,
    pub skipped_backoff: usize,
}

impl VerificationReport {
    fn tally(&mut self, verdict: Verdict) {
        self.examined += 1;
        match verdict {
            Verdict::Verified => self.verified += 1,
            Verdict::Dead(_) => self.dead += 1,
            Verdict::Retry(_) => self.retried += 1,
            Verdict::Challenged => self.challenged += 1,
            Verdict::Deferred => self.deferred += 1,
            Verdict::Superseded => self.superseded += 1,
        }
    }
}

/// End of the backoff window of the candidate's host, if it is in one.
pub(crate) async fn host_backoff(
    coordinator: &SessionCoordinator,
    candidate: &CandidateLink,
) -> Option<DateTime<Utc>> {
    let url = Url::parse(&candidate.url).ok()?;
    let host = host_key(&url).ok()?;
    match coordinator.admission(&host).await {
        Admission::Deferred { until } => Some(until),
        Admission::Ready => None,
    }
}

/// Candidates picked for one batch, plus how many were passed over.
#[derive(Debug, Default)]
struct Batch {
    due: Vec<CandidateLink>,
    skipped_not_due: usize,
    skipped_backoff: usize,
}

pub struct VerificationService {
    db: Database,
    telemetry: Arc<TelemetryStore>,
    coordinator: Arc<SessionCoordinator>,
    config: PipelineConfig,
}

impl VerificationService {
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

    /// Whether a candidate may be attempted now.
    pub fn is_due(&self, candidate: &CandidateLink, force: bool) -> bool {
        if force {
            return true;
        }
        let interval = chrono::Duration::from_std(self.config.verification_interval)
            .unwrap_or(chrono::Duration::MAX);
        match candidate.last_attempt_at {
            None => true,
            Some(last) => last
                .checked_add_signed(interval)
                .is_none_or(|next| next <= Utc::now()),
        }
    }

    async fn resolve_source_filter(&self, options: &RunOptions) -> Result<Option<i64>> {
        let Some(host) = &options.source_host else {
            return Ok(None);
        };
        let source = self
            .db
            .source_by_host(options.scope.write_id(), &normalize_host(host))
            .await?
            .ok_or_else(|| PipelineError::UnknownSource(host.clone()))?;
        Ok(Some(source.id))
    }

    /// Due `discovered` candidates, at most `limit`, skipping (and logging)
    /// the ones attempted too recently or whose host is in backoff.
    async fn due_batch(
        &self,
        options: &RunOptions,
        source_id: Option<i64>,
        limit: usize,
    ) -> Result<Batch> {
        let page_size = (limit as i64).clamp(1, 500);
        let mut offset = 0;
        let mut batch = Batch::default();
        while batch.due.len() < limit {
            let page = self
                .db
                .candidates_page(
                    options.scope,
                    CandidateStatus::Discovered,
                    source_id,
                    offset,
                    page_size,
                )
                .await?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as i64;
            for candidate in page {
                if batch.due.len() >= limit {
                    break;
                }
                if !self.is_due(&candidate, options.force) {
                    debug!(
                        candidate_id = candidate.id,
                        url = %candidate.url,
                        last_attempt_at = ?candidate.last_attempt_at,
                        interval_secs = self.config.verification_interval.as_secs(),
                        "Skipping candidate: verification not due"
                    );
                    batch.skipped_not_due += 1;
                } else if let Some(until) = host_backoff(&self.coordinator, &candidate).await {
                    debug!(
                        candidate_id = candidate.id,
                        url = %candidate.url,
                        until = %until,
                        "Skipping candidate: host in backoff"
                    );
                    batch.skipped_backoff += 1;
                } else {
                    batch.due.push(candidate);
                }
            }
        }
        Ok(batch)
    }

    pub async fn run(&self, options: &RunOptions) -> Result<VerificationReport> {
        let source_id = self.resolve_source_filter(options).await?;
        let limit = options.limit.unwrap_or(self.config.batch_size);
        let batch = self.due_batch(options, source_id, limit).await?;

        let mut report = VerificationReport {
            skipped_not_due: batch.skipped_not_due,
            skipped_backoff: batch.skipped_backoff,
            ..Default::default()
        };
        if batch.due.is_empty() {
            debug!("No candidates due for verification");
            return Ok(report);
        }

        let verdicts: Vec<Option<Verdict>> = stream::iter(batch.due)
            .map(|candidate| async move {
                if options.expired() {
                    debug!(candidate_id = candidate.id, "Deadline reached, candidate left for next run");
                    return None;
                }
                match self.verify(&candidate).await {
                    Ok(verdict) => Some(verdict),
                    Err(e) => {
                        warn!(candidate_id = candidate.id, url = %candidate.url, error = %e, "Verification failed");
                        self.telemetry.record_nowait(
                            TelemetryEvent::new(EventKind::StageError, &candidate.url, "error")
                                .with_source(candidate.source_id)
                                .with_detail(json!({ "stage": "verification", "error": e.to_string() })),
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
            verified = report.verified,
            dead = report.dead,
            retried = report.retried,
            challenged = report.challenged,
            deferred = report.deferred,
            skipped_backoff = report.skipped_backoff,
            "Verification batch finished"
        );
        Ok(report)
    }

    /// Verify a single candidate and apply the resulting transition.
    pub async fn verify(&self, candidate: &CandidateLink) -> Result<Verdict> {
        let Ok(url) = Url::parse(&candidate.url) else {
            let verdict = self
                .kill(candidate, DeadReason::ClientError, "unparseable URL")
                .await?;
            self.emit(candidate, verdict, None, json!({ "error": "unparseable URL" }));
            return Ok(verdict);
        };

        let started = Instant::now();
        let outcome = self.coordinator.fetch(&url).await?;
        let response = match outcome {
            FetchOutcome::Deferred { host, until } => {
                debug!(host = %host, until = %until, url = %url, "Verification deferred by host backoff");
                self.emit(candidate, Verdict::Deferred, None, json!({ "until": until.to_rfc3339() }));
                return Ok(Verdict::Deferred);
            }
            FetchOutcome::Fetched(response) => response,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let mut detail = json!({
            "status_code": response.status_code,
            "elapsed_ms": elapsed_ms,
        });

        let mut attempt = candidate.retry_count;
        let verdict = match response.class {
            ResponseClass::Success => self.accept(candidate, &response.final_url, &response.body).await?,
            ResponseClass::NotFound => {
                self.kill(candidate, DeadReason::NotFound, &format!("HTTP {}", response.status_code))
                    .await?
            }
            ResponseClass::ClientError => {
                self.kill(candidate, DeadReason::ClientError, &format!("HTTP {}", response.status_code))
                    .await?
            }
            ResponseClass::BotChallenge => self.challenged(candidate, &url, response.status_code).await?,
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

        self.emit(candidate, verdict, Some(attempt), detail);
        Ok(verdict)
    }

    /// The coordinator has already put the host into long backoff; only the
    /// attempt time is recorded so the link waits out the due interval.
    async fn challenged(&self, candidate: &CandidateLink, url: &Url, status_code: u16) -> Result<Verdict> {
        let host = url.host_str().unwrap_or_default();
        let until = self.coordinator.state(host).await.and_then(|s| s.backoff_until);
        warn!(
            host,
            url = %candidate.url,
            status = status_code,
            backoff_until = ?until,
            "Bot challenge during verification, link requeued"
        );
        self.db.record_candidate_attempt(candidate.id, None).await?;
        self.telemetry.record_nowait(
            TelemetryEvent::new(EventKind::BotChallenge, &candidate.url, "bot_challenge")
                .with_host(host)
                .with_source(candidate.source_id)
                .with_detail(json!({
                    "stage": "verification",
                    "status_code": status_code,
                    "backoff_until": until.map(|u| u.to_rfc3339()),
                })),
        );
        Ok(Verdict::Challenged)
    }

    async fn accept(&self, candidate: &CandidateLink, final_url: &str, body: &str) -> Result<Verdict> {
        let scope = DatasetScope::Dataset(candidate.dataset_id);
        if let Some(final_normalized) = normalize_url(final_url)
            && final_normalized != candidate.normalized_url
            && let Some(existing) = self
                .db
                .verified_by_normalized_url(scope, &final_normalized, candidate.id)
                .await?
        {
            debug!(candidate_id = candidate.id, existing, final_url, "Redirects onto a verified link");
            return self.kill(candidate, DeadReason::DuplicateUrl, final_url).await;
        }

        let page_hash = content_hash(body);
        if let Some(existing) = self
            .db
            .verified_by_page_hash(candidate.dataset_id, &page_hash, candidate.id)
            .await?
        {
            debug!(candidate_id = candidate.id, existing, "Page identical to a verified link");
            self.db.record_candidate_attempt(candidate.id, Some(&page_hash)).await?;
            return self.kill(candidate, DeadReason::DuplicateContent, &page_hash).await;
        }

        self.db.record_candidate_attempt(candidate.id, Some(&page_hash)).await?;
        if self
            .db
            .transition_candidate(candidate.id, CandidateStatus::Article, None)
            .await?
        {
            Ok(Verdict::Verified)
        } else {
            Ok(Verdict::Superseded)
        }
    }

    async fn kill(&self, candidate: &CandidateLink, reason: DeadReason, error: &str) -> Result<Verdict> {
        debug!(candidate_id = candidate.id, reason = reason.as_str(), error, "Marking candidate dead");
        if self
            .db
            .transition_candidate(candidate.id, CandidateStatus::Dead, Some(reason.as_str()))
            .await?
        {
            Ok(Verdict::Dead(reason))
        } else {
            Ok(Verdict::Superseded)
        }
    }

    /// Count a recoverable failure. Returns the verdict and the attempt
    /// number it used.
    async fn retry(
        &self,
        candidate: &CandidateLink,
        class: ResponseClass,
        error: &str,
    ) -> Result<(Verdict, i64)> {
        let Some(retries) = self
            .db
            .record_candidate_retry(candidate.id, CandidateStatus::Discovered, error)
            .await?
        else {
            return Ok((Verdict::Superseded, candidate.retry_count));
        };
        if retries >= i64::from(self.config.max_retries) {
            warn!(
                candidate_id = candidate.id,
                url = %candidate.url,
                retries,
                last_class = class.as_str(),
                "Retry limit reached"
            );
            let verdict = self.kill(candidate, DeadReason::MaxRetries, error).await?;
            return Ok((verdict, retries));
        }
        debug!(candidate_id = candidate.id, retries, class = class.as_str(), "Will retry later");
        Ok((Verdict::Retry(class), retries))
    }

    fn emit(
        &self,
        candidate: &CandidateLink,
        verdict: Verdict,
        attempt: Option<i64>,
        mut detail: serde_json::Value,
    ) {
        detail["candidate_id"] = json!(candidate.id);
        let mut event = TelemetryEvent::new(EventKind::Verification, &candidate.url, verdict.outcome())
            .with_source(candidate.source_id)
            .with_detail(detail);
        if let Ok(url) = Url::parse(&candidate.url)
            && let Some(host) = url.host_str()
        {
            event = event.with_host(host);
        }
        if let Some(attempt) = attempt {
            event = event.with_attempt(attempt);
        }
        self.telemetry.record_nowait(event);
    }
}
