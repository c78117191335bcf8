//! Telemetry store: an append-only event sink shared by every stage.
//!
//! Writes are jobs carrying the statement plus the schema definitions it
//! needs. In [`TelemetryMode::Async`] a single background task drains a
//! bounded queue; callers never wait on the database unless they ask to via
//! [`TelemetryStore::flush`]. [`TelemetryMode::Sync`] applies each job before
//! returning and is meant for short-lived tooling and tests.
//!
//! Aggregates are read through a [`TelemetryReader`] that shares the writer's
//! backend, so readers and writers always see the same connection settings.

use crate::db::{Backend, SqlRow, SqlValue};
use crate::error::{StoreResult, TelemetryError};
use crate::model::{StrategyKind, from_timestamp};
use crate::sql_args;
use broadsheet_scanner::{SessionCallback, SessionEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

const EVENTS_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS telemetry_events (
        id {auto_id},
        kind TEXT NOT NULL,
        subject TEXT NOT NULL,
        host TEXT,
        source_id BIGINT,
        strategy TEXT,
        outcome TEXT NOT NULL,
        attempt BIGINT,
        items BIGINT,
        duration_ms BIGINT,
        detail TEXT,
        created_at BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_telemetry_kind ON telemetry_events(kind, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_telemetry_strategy ON telemetry_events(source_id, strategy)",
];

const EVENTS_TABLE: &str = "telemetry_events";

const EVENT_COLUMNS: &str =
    "kind, subject, host, source_id, strategy, outcome, attempt, items, duration_ms, detail, created_at";

/// Outcomes that count as failures in [`TelemetryReader::recent_failures`].
const FAILURE_OUTCOMES: &str = "'failed', 'transient', 'rate_limited', 'bot_challenge', \
    'not_found', 'client_error', 'max_retries', 'error'";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryMode {
    Sync,
    Async { capacity: usize },
}

impl Default for TelemetryMode {
    fn default() -> Self {
        TelemetryMode::Async { capacity: 1024 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Fetch,
    Backoff,
    Deferred,
    IdentityRotated,
    DiscoveryStrategy,
    StrategySkipped,
    Verification,
    Extraction,
    BotChallenge,
    Housekeeping,
    Classification,
    StageError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Fetch => "fetch",
            EventKind::Backoff => "backoff",
            EventKind::Deferred => "deferred",
            EventKind::IdentityRotated => "identity_rotated",
            EventKind::DiscoveryStrategy => "discovery_strategy",
            EventKind::StrategySkipped => "strategy_skipped",
            EventKind::Verification => "verification",
            EventKind::Extraction => "extraction",
            EventKind::BotChallenge => "bot_challenge",
            EventKind::Housekeeping => "housekeeping",
            EventKind::Classification => "classification",
            EventKind::StageError => "stage_error",
        }
    }
}

/// One observable fact. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub kind: String,
    pub subject: String,
    pub host: Option<String>,
    pub source_id: Option<i64>,
    pub strategy: Option<String>,
    pub outcome: String,
    pub attempt: Option<i64>,
    pub items: Option<i64>,
    pub duration_ms: Option<i64>,
    pub detail: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(kind: EventKind, subject: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            subject: subject.into(),
            host: None,
            source_id: None,
            strategy: None,
            outcome: outcome.into(),
            attempt: None,
            items: None,
            duration_ms: None,
            detail: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_source(mut self, source_id: i64) -> Self {
        self.source_id = Some(source_id);
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = Some(strategy.as_str().to_string());
        self
    }

    pub fn with_attempt(mut self, attempt: i64) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_items(mut self, items: i64) -> Self {
        self.items = Some(items);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms as i64);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    fn into_job(self) -> WriteJob {
        let detail = self.detail.as_ref().map(|d| d.to_string());
        WriteJob {
            label: self.kind.clone(),
            ddl: EVENTS_DDL,
            sql: format!(
                "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                EVENTS_TABLE, EVENT_COLUMNS
            ),
            params: sql_args![
                self.kind,
                self.subject,
                self.host,
                self.source_id,
                self.strategy,
                self.outcome,
                self.attempt,
                self.items,
                self.duration_ms,
                detail,
                self.created_at.timestamp()
            ],
        }
    }

    fn from_row(row: &SqlRow) -> StoreResult<Self> {
        Ok(Self {
            kind: row.text("kind")?,
            subject: row.text("subject")?,
            host: row.opt_text("host")?,
            source_id: row.opt_int("source_id")?,
            strategy: row.opt_text("strategy")?,
            outcome: row.text("outcome")?,
            attempt: row.opt_int("attempt")?,
            items: row.opt_int("items")?,
            duration_ms: row.opt_int("duration_ms")?,
            detail: row
                .opt_text("detail")?
                .and_then(|raw| serde_json::from_str(&raw).ok()),
            created_at: from_timestamp(row.int("created_at")?),
        })
    }
}

/// A statement plus the schema templates (`{auto_id}` placeholders) it
/// depends on.
#[derive(Debug, Clone)]
pub struct WriteJob {
    pub label: String,
    pub ddl: &'static [&'static str],
    pub sql: String,
    pub params: Vec<SqlValue>,
}

enum Command {
    Write(WriteJob),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TelemetryStats {
    pub enqueued: u64,
    pub written: u64,
    pub failed: u64,
    pub dropped: u64,
    pub discarded: u64,
}

/// Applies jobs, running each schema statement at most once per process.
struct Applier {
    backend: Arc<dyn Backend>,
    applied_ddl: StdMutex<HashSet<String>>,
    counters: Counters,
}

impl Applier {
    async fn apply(&self, job: &WriteJob) -> StoreResult<()> {
        let dialect = self.backend.dialect();
        for template in job.ddl {
            let statement = dialect.render_ddl(template);
            let known = self
                .applied_ddl
                .lock()
                .map(|cache| cache.contains(&statement))
                .unwrap_or(false);
            if known {
                continue;
            }
            self.backend.execute_batch(&statement).await?;
            if let Ok(mut cache) = self.applied_ddl.lock() {
                cache.insert(statement);
            }
        }
        self.backend.execute(&job.sql, &job.params).await?;
        Ok(())
    }

    async fn apply_logged(&self, job: &WriteJob) -> StoreResult<()> {
        match self.apply(job).await {
            Ok(()) => {
                self.counters.written.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(kind = %job.label, sql = %job.sql, error = %e, "Telemetry write failed");
                Err(e)
            }
        }
    }
}

pub struct TelemetryStore {
    applier: Arc<Applier>,
    mode: TelemetryMode,
    sender: Option<mpsc::Sender<Command>>,
    worker: StdMutex<Option<JoinHandle<()>>>,
    // Sync mode buffer for writes issued from non-async callers
    pending: StdMutex<Vec<WriteJob>>,
    discard: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl TelemetryStore {
    /// Create the store. Async mode spawns the writer task, so this must be
    /// called inside a tokio runtime.
    pub fn new(backend: Arc<dyn Backend>, mode: TelemetryMode) -> Self {
        let applier = Arc::new(Applier {
            backend,
            applied_ddl: StdMutex::new(HashSet::new()),
            counters: Counters::default(),
        });
        let discard = Arc::new(AtomicBool::new(false));

        let (sender, worker) = match mode {
            TelemetryMode::Sync => (None, None),
            TelemetryMode::Async { capacity } => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                let handle = tokio::spawn(run_worker(applier.clone(), rx, discard.clone()));
                (Some(tx), Some(handle))
            }
        };

        Self {
            applier,
            mode,
            sender,
            worker: StdMutex::new(worker),
            pending: StdMutex::new(Vec::new()),
            discard,
            closed: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> TelemetryMode {
        self.mode
    }

    pub fn reader(&self) -> TelemetryReader {
        TelemetryReader {
            backend: self.applier.backend.clone(),
        }
    }

    pub fn stats(&self) -> TelemetryStats {
        let c = &self.applier.counters;
        TelemetryStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            written: c.written.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }

    pub async fn record(&self, event: TelemetryEvent) -> Result<(), TelemetryError> {
        self.submit(event.into_job()).await
    }

    /// Submit an arbitrary job. In async mode this returns once the job is
    /// queued, waiting for queue capacity if necessary; in sync mode it
    /// returns after the write.
    pub async fn submit(&self, job: WriteJob) -> Result<(), TelemetryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TelemetryError::Closed);
        }
        match &self.sender {
            None => {
                self.drain_pending().await?;
                self.applier.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                self.applier.apply_logged(&job).await?;
                Ok(())
            }
            Some(sender) => {
                sender
                    .send(Command::Write(job))
                    .await
                    .map_err(|_| TelemetryError::Closed)?;
                self.applier.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Fire-and-forget from synchronous code. A full queue drops the event
    /// with a warning rather than blocking. In sync mode the job is buffered
    /// until the next `record` or `flush`.
    pub fn record_nowait(&self, event: TelemetryEvent) {
        if self.closed.load(Ordering::SeqCst) {
            debug!(kind = %event.kind, "Telemetry closed, event ignored");
            return;
        }
        let job = event.into_job();
        match &self.sender {
            None => self.pending().push(job),
            Some(sender) => match sender.try_send(Command::Write(job)) {
                Ok(()) => {
                    self.applier.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(Command::Write(job))) => {
                    self.applier.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(kind = %job.label, "Telemetry queue full, event dropped");
                }
                Err(_) => {
                    self.applier.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("Telemetry writer gone, event dropped");
                }
            },
        }
    }

    // A panic while holding the lock leaves the buffer itself intact
    fn pending(&self) -> MutexGuard<'_, Vec<WriteJob>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn drain_pending(&self) -> Result<(), TelemetryError> {
        let jobs: Vec<WriteJob> = self.pending().drain(..).collect();
        for job in jobs {
            self.applier.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            // Logged and counted by the applier; one bad event must not
            // block the rest of the buffer.
            let _ = self.applier.apply_logged(&job).await;
        }
        Ok(())
    }

    /// Block until every job queued before this call has been applied.
    pub async fn flush(&self) -> Result<(), TelemetryError> {
        match &self.sender {
            None => self.drain_pending().await,
            Some(sender) => {
                let (tx, rx) = oneshot::channel();
                sender
                    .send(Command::Flush(tx))
                    .await
                    .map_err(|_| TelemetryError::Closed)?;
                rx.await.map_err(|_| TelemetryError::Closed)
            }
        }
    }

    /// Stop accepting writes. With `drain_remaining` every queued job is
    /// applied first; without it queued jobs are discarded and counted.
    /// Returns once the writer task has exited.
    pub async fn shutdown(&self, drain_remaining: bool) -> Result<(), TelemetryError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !drain_remaining {
            self.discard.store(true, Ordering::SeqCst);
        }
        match &self.sender {
            None => {
                if drain_remaining {
                    self.drain_pending().await?;
                } else if let Ok(mut pending) = self.pending.lock() {
                    let n = pending.len() as u64;
                    pending.clear();
                    self.applier.counters.discarded.fetch_add(n, Ordering::Relaxed);
                }
            }
            Some(sender) => {
                // A send error means the worker already stopped
                let _ = sender.send(Command::Shutdown).await;
                let handle = self.worker.lock().ok().and_then(|mut w| w.take());
                if let Some(handle) = handle
                    && let Err(e) = handle.await
                {
                    error!(error = %e, "Telemetry writer task ended abnormally");
                }
            }
        }
        let stats = self.stats();
        debug!(
            written = stats.written,
            failed = stats.failed,
            dropped = stats.dropped,
            discarded = stats.discarded,
            "Telemetry store shut down"
        );
        Ok(())
    }

    /// Callback that mirrors session coordinator events into the store.
    pub fn session_callback(self: &Arc<Self>) -> SessionCallback {
        let store = Arc::clone(self);
        Arc::new(move |event| store.record_nowait(session_event(event)))
    }
}

async fn run_worker(
    applier: Arc<Applier>,
    mut rx: mpsc::Receiver<Command>,
    discard: Arc<AtomicBool>,
) {
    debug!("Telemetry writer started");
    while let Some(command) = rx.recv().await {
        match command {
            Command::Write(job) => {
                if discard.load(Ordering::SeqCst) {
                    applier.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let _ = applier.apply_logged(&job).await;
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
            Command::Shutdown => {
                // Jobs that raced in behind the shutdown marker
                while let Ok(command) = rx.try_recv() {
                    match command {
                        Command::Write(job) if !discard.load(Ordering::SeqCst) => {
                            let _ = applier.apply_logged(&job).await;
                        }
                        Command::Write(_) => {
                            applier.counters.discarded.fetch_add(1, Ordering::Relaxed);
                        }
                        Command::Flush(ack) => {
                            let _ = ack.send(());
                        }
                        Command::Shutdown => {}
                    }
                }
                break;
            }
        }
    }
    debug!("Telemetry writer stopped");
}

fn session_event(event: SessionEvent) -> TelemetryEvent {
    match event {
        SessionEvent::Fetched {
            host,
            url,
            status_code,
            class,
            elapsed_ms,
            via_proxy,
            error,
        } => TelemetryEvent::new(EventKind::Fetch, url, class.as_str())
            .with_host(host)
            .with_duration_ms(elapsed_ms)
            .with_detail(serde_json::json!({
                "status_code": status_code,
                "via_proxy": via_proxy,
                "error": error,
            })),
        SessionEvent::BackoffApplied {
            host,
            class,
            consecutive,
            delay,
            until,
        } => TelemetryEvent::new(EventKind::Backoff, host.clone(), class.as_str())
            .with_host(host)
            .with_attempt(consecutive as i64)
            .with_duration_ms(delay.as_millis() as u64)
            .with_detail(serde_json::json!({ "until": until.to_rfc3339() })),
        SessionEvent::Deferred { host, url, until } => {
            TelemetryEvent::new(EventKind::Deferred, url, "deferred")
                .with_host(host)
                .with_detail(serde_json::json!({ "until": until.to_rfc3339() }))
        }
        SessionEvent::IdentityRotated {
            host,
            after_requests,
        } => TelemetryEvent::new(EventKind::IdentityRotated, host.clone(), "rotated")
            .with_host(host)
            .with_items(after_requests as i64),
    }
}

/// Yield and failure totals for one `(source, strategy)` pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyStats {
    pub source_id: i64,
    pub strategy: String,
    pub runs: i64,
    pub failures: i64,
    pub yielded: i64,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindCount {
    pub kind: String,
    pub count: i64,
}

/// Read side of the store. Every query returns empty results until the
/// first event has created the table.
#[derive(Clone)]
pub struct TelemetryReader {
    backend: Arc<dyn Backend>,
}

impl TelemetryReader {
    async fn ready(&self) -> StoreResult<bool> {
        self.backend.table_exists(EVENTS_TABLE).await
    }

    pub async fn strategy_effectiveness(
        &self,
        source_id: Option<i64>,
    ) -> StoreResult<Vec<StrategyStats>> {
        if !self.ready().await? {
            return Ok(Vec::new());
        }
        let mut sql = String::from(
            "SELECT source_id, strategy, COUNT(*) AS runs,
                    CAST(SUM(CASE WHEN outcome = 'failed' THEN 1 ELSE 0 END) AS BIGINT) AS failures,
                    CAST(COALESCE(SUM(items), 0) AS BIGINT) AS yielded,
                    MAX(created_at) AS last_run_at
             FROM telemetry_events
             WHERE kind = ? AND source_id IS NOT NULL AND strategy IS NOT NULL",
        );
        let mut params = sql_args![EventKind::DiscoveryStrategy.as_str()];
        if let Some(source_id) = source_id {
            sql.push_str(" AND source_id = ?");
            params.push(SqlValue::from(source_id));
        }
        sql.push_str(" GROUP BY source_id, strategy ORDER BY source_id, strategy");
        let rows = self.backend.query(&sql, &params).await?;
        rows.iter()
            .map(|r| {
                Ok(StrategyStats {
                    source_id: r.int("source_id")?,
                    strategy: r.text("strategy")?,
                    runs: r.int("runs")?,
                    failures: r.int("failures")?,
                    yielded: r.int("yielded")?,
                    last_run_at: r.opt_int("last_run_at")?.map(from_timestamp),
                })
            })
            .collect()
    }

    /// New-link counts of the last `n` runs of a strategy for a source, most
    /// recent first. Failed runs count as zero; deferred runs are ignored.
    pub async fn recent_yields(
        &self,
        source_id: i64,
        strategy: StrategyKind,
        n: usize,
    ) -> StoreResult<Vec<i64>> {
        if !self.ready().await? {
            return Ok(Vec::new());
        }
        let rows = self
            .backend
            .query(
                "SELECT outcome, items FROM telemetry_events
                 WHERE kind = ? AND source_id = ? AND strategy = ? AND outcome <> 'deferred'
                 ORDER BY created_at DESC, id DESC LIMIT ?",
                &sql_args![
                    EventKind::DiscoveryStrategy.as_str(),
                    source_id,
                    strategy.as_str(),
                    n as i64
                ],
            )
            .await?;
        rows.iter()
            .map(|r| {
                let items = r.opt_int("items")?.unwrap_or(0);
                Ok(if r.text("outcome")? == "failed" { 0 } else { items })
            })
            .collect()
    }

    pub async fn recent_failures(&self, limit: i64) -> StoreResult<Vec<TelemetryEvent>> {
        if !self.ready().await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM telemetry_events WHERE outcome IN ({})
             ORDER BY created_at DESC, id DESC LIMIT ?",
            EVENT_COLUMNS, FAILURE_OUTCOMES
        );
        let rows = self.backend.query(&sql, &sql_args![limit]).await?;
        rows.iter().map(TelemetryEvent::from_row).collect()
    }

    pub async fn event_counts_by_kind(&self) -> StoreResult<Vec<KindCount>> {
        if !self.ready().await? {
            return Ok(Vec::new());
        }
        let rows = self
            .backend
            .query(
                "SELECT kind, COUNT(*) AS n FROM telemetry_events GROUP BY kind ORDER BY kind",
                &[],
            )
            .await?;
        rows.iter()
            .map(|r| {
                Ok(KindCount {
                    kind: r.text("kind")?,
                    count: r.int("n")?,
                })
            })
            .collect()
    }

    /// Every event about `subject` (a URL, host or job), oldest first.
    pub async fn events_for_subject(&self, subject: &str) -> StoreResult<Vec<TelemetryEvent>> {
        if !self.ready().await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM telemetry_events WHERE subject = ? ORDER BY created_at, id",
            EVENT_COLUMNS
        );
        let rows = self.backend.query(&sql, &sql_args![subject]).await?;
        rows.iter().map(TelemetryEvent::from_row).collect()
    }

    pub async fn events_of_kind(&self, kind: EventKind) -> StoreResult<Vec<TelemetryEvent>> {
        if !self.ready().await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM telemetry_events WHERE kind = ? ORDER BY created_at, id",
            EVENT_COLUMNS
        );
        let rows = self.backend.query(&sql, &sql_args![kind.as_str()]).await?;
        rows.iter().map(TelemetryEvent::from_row).collect()
    }

    pub async fn total_events(&self) -> StoreResult<i64> {
        if !self.ready().await? {
            return Ok(0);
        }
        let row = self
            .backend
            .query_one("SELECT COUNT(*) AS n FROM telemetry_events", &[])
            .await?;
        row.map(|r| r.int("n")).unwrap_or(Ok(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteBackend;

    fn backend() -> Arc<dyn Backend> {
        Arc::new(SqliteBackend::open_in_memory().unwrap())
    }

    fn event(n: i64) -> TelemetryEvent {
        TelemetryEvent::new(EventKind::Fetch, format!("https://example.com/{}", n), "success")
            .with_host("example.com")
            .with_attempt(n)
    }

    #[tokio::test]
    async fn test_sync_mode_writes_before_returning() {
        let store = TelemetryStore::new(backend(), TelemetryMode::Sync);
        store.record(event(1)).await.unwrap();
        assert_eq!(store.reader().total_events().await.unwrap(), 1);
        assert_eq!(store.stats().written, 1);
    }

    #[tokio::test]
    async fn test_async_flush_makes_events_visible() {
        let store = TelemetryStore::new(backend(), TelemetryMode::Async { capacity: 64 });
        for n in 0..20 {
            store.record(event(n)).await.unwrap();
        }
        store.flush().await.unwrap();
        assert_eq!(store.reader().total_events().await.unwrap(), 20);
        store.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_buffer_survives_poisoned_lock() {
        let store = TelemetryStore::new(backend(), TelemetryMode::Sync);
        std::thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = store.pending.lock().unwrap();
                    panic!("writer panicked mid-push");
                })
                .join();
        });
        assert!(store.pending.is_poisoned());

        store.record_nowait(event(1));
        store.flush().await.unwrap();
        assert_eq!(store.reader().total_events().await.unwrap(), 1);
        assert_eq!(store.stats().dropped, 0);
    }

    #[tokio::test]
    async fn test_schema_created_once() {
        let store = TelemetryStore::new(backend(), TelemetryMode::Sync);
        for n in 0..3 {
            store.record(event(n)).await.unwrap();
        }
        let cached = store.applier.applied_ddl.lock().unwrap().len();
        assert_eq!(cached, EVENTS_DDL.len());
    }

    #[tokio::test]
    async fn test_nowait_buffers_in_sync_mode_until_flush() {
        let store = TelemetryStore::new(backend(), TelemetryMode::Sync);
        store.record_nowait(event(1));
        assert_eq!(store.reader().total_events().await.unwrap(), 0);
        store.flush().await.unwrap();
        assert_eq!(store.reader().total_events().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_without_drain_discards() {
        let store = TelemetryStore::new(backend(), TelemetryMode::Sync);
        store.record_nowait(event(1));
        store.record_nowait(event(2));
        store.shutdown(false).await.unwrap();
        assert_eq!(store.stats().discarded, 2);
        assert_eq!(store.reader().total_events().await.unwrap(), 0);
        assert!(matches!(
            store.record(event(3)).await,
            Err(TelemetryError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_with_drain_writes_everything() {
        let store = TelemetryStore::new(backend(), TelemetryMode::Async { capacity: 8 });
        for n in 0..8 {
            store.record(event(n)).await.unwrap();
        }
        store.shutdown(true).await.unwrap();
        assert_eq!(store.reader().total_events().await.unwrap(), 8);
        assert!(store.record(event(9)).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_write_is_counted_not_fatal() {
        let store = TelemetryStore::new(backend(), TelemetryMode::Async { capacity: 8 });
        store
            .submit(WriteJob {
                label: "broken".to_string(),
                ddl: &[],
                sql: "INSERT INTO missing_table (x) VALUES (?)".to_string(),
                params: sql_args![1i64],
            })
            .await
            .unwrap();
        store.record(event(1)).await.unwrap();
        store.flush().await.unwrap();
        let stats = store.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.written, 1);
    }

    #[tokio::test]
    async fn test_reader_empty_before_first_write() {
        let store = TelemetryStore::new(backend(), TelemetryMode::Sync);
        let reader = store.reader();
        assert!(reader.event_counts_by_kind().await.unwrap().is_empty());
        assert!(reader.strategy_effectiveness(None).await.unwrap().is_empty());
        assert!(reader.recent_yields(1, StrategyKind::Feed, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_strategy_aggregates() {
        let store = TelemetryStore::new(backend(), TelemetryMode::Sync);
        for (outcome, items) in [("ok", 3), ("ok", 0), ("failed", 0)] {
            store
                .record(
                    TelemetryEvent::new(EventKind::DiscoveryStrategy, "example.com", outcome)
                        .with_source(7)
                        .with_strategy(StrategyKind::Feed)
                        .with_items(items),
                )
                .await
                .unwrap();
        }
        let stats = store.reader().strategy_effectiveness(Some(7)).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].runs, 3);
        assert_eq!(stats[0].failures, 1);
        assert_eq!(stats[0].yielded, 3);

        let yields = store
            .reader()
            .recent_yields(7, StrategyKind::Feed, 2)
            .await
            .unwrap();
        assert_eq!(yields, vec![0, 0]);
    }
}
