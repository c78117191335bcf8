// Status reports built from the pipeline tables and telemetry aggregates

use crate::config::PipelineConfig;
use crate::data::{Database, StatusCount};
use crate::error::StoreResult;
use crate::model::{ArticleStatus, CandidateStatus, DatasetScope, current_timestamp};
use crate::telemetry::{KindCount, StrategyStats, TelemetryEvent, TelemetryReader};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Text,
    Json,
}

impl ReportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Some(ReportFormat::Text),
            "json" => Some(ReportFormat::Json),
            _ => None,
        }
    }
}

/// Items waiting for a stage right now.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DueCounts {
    pub verification: i64,
    pub extraction: i64,
    pub cleaning: i64,
    pub classification: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySummary {
    pub total_events: i64,
    pub by_kind: Vec<KindCount>,
    pub strategies: Vec<StrategyStats>,
    pub recent_failures: Vec<TelemetryEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub scope: String,
    pub generated_at: DateTime<Utc>,
    pub sources: usize,
    pub candidates: Vec<StatusCount>,
    pub articles: Vec<StatusCount>,
    pub due: DueCounts,
    pub telemetry: TelemetrySummary,
}

impl StatusReport {
    pub fn candidate_total(&self, status: CandidateStatus) -> i64 {
        total(&self.candidates, status.as_str())
    }

    pub fn article_total(&self, status: ArticleStatus) -> i64 {
        total(&self.articles, status.as_str())
    }
}

fn total(counts: &[StatusCount], status: &str) -> i64 {
    counts
        .iter()
        .filter(|c| c.status == status)
        .map(|c| c.count)
        .sum()
}

/// Collect everything the status commands show. `scope_label` is only used
/// for display.
pub async fn gather_status_report(
    db: &Database,
    telemetry: &TelemetryReader,
    config: &PipelineConfig,
    scope: DatasetScope,
    scope_label: &str,
    failure_limit: i64,
) -> StoreResult<StatusReport> {
    let now = current_timestamp();
    let interval = i64::try_from(config.verification_interval.as_secs()).unwrap_or(i64::MAX);

    let candidates = db.candidate_status_counts(scope).await?;
    let articles = db.article_status_counts(scope).await?;
    let due = DueCounts {
        verification: db
            .due_candidates(scope, CandidateStatus::Discovered, now.saturating_sub(interval))
            .await?,
        extraction: db.due_candidates(scope, CandidateStatus::Article, now).await?,
        cleaning: total(&articles, ArticleStatus::Extracted.as_str()),
        classification: total(&articles, ArticleStatus::Cleaned.as_str()),
    };

    Ok(StatusReport {
        scope: scope_label.to_string(),
        generated_at: Utc::now(),
        sources: db.list_sources(scope, true).await?.len(),
        candidates,
        articles,
        due,
        telemetry: TelemetrySummary {
            total_events: telemetry.total_events().await?,
            by_kind: telemetry.event_counts_by_kind().await?,
            strategies: telemetry.strategy_effectiveness(None).await?,
            recent_failures: telemetry.recent_failures(failure_limit).await?,
        },
    })
}

fn section(report: &mut String, title: &str) {
    report.push_str(RULE);
    report.push_str(title);
    report.push('\n');
    report.push_str(RULE);
    report.push('\n');
}

/// One row per source, one column per status.
fn status_table(counts: &[StatusCount], statuses: &[&str]) -> String {
    if counts.is_empty() {
        return "  (none)\n".to_string();
    }
    let mut rows: BTreeMap<&str, BTreeMap<&str, i64>> = BTreeMap::new();
    for cell in counts {
        *rows
            .entry(cell.source.as_str())
            .or_default()
            .entry(cell.status.as_str())
            .or_default() += cell.count;
    }
    let width = rows.keys().map(|s| s.len()).max().unwrap_or(6).max(6);

    let mut table = format!("  {:<width$}", "source", width = width);
    for status in statuses {
        table.push_str(&format!(" {:>10}", status));
    }
    table.push('\n');
    for (source, cells) in &rows {
        table.push_str(&format!("  {:<width$}", source, width = width));
        for status in statuses {
            table.push_str(&format!(" {:>10}", cells.get(status).copied().unwrap_or(0)));
        }
        table.push('\n');
    }
    table.push_str(&format!("  {:<width$}", "total", width = width));
    for status in statuses {
        table.push_str(&format!(" {:>10}", total(counts, status)));
    }
    table.push('\n');
    table
}

pub fn generate_text_report(data: &StatusReport) -> String {
    let mut report = String::new();

    report.push_str(RULE);
    report.push_str("                         BROADSHEET PIPELINE STATUS\n");
    report.push_str(RULE);
    report.push('\n');

    report.push_str(&format!("Scope:        {}\n", data.scope));
    report.push_str(&format!(
        "Generated:    {}\n",
        data.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    report.push_str(&format!("Sources:      {}\n\n", data.sources));

    section(&mut report, "CANDIDATE LINKS");
    let candidate_statuses: Vec<&str> = CandidateStatus::ALL.iter().map(|s| s.as_str()).collect();
    report.push_str(&status_table(&data.candidates, &candidate_statuses));
    report.push('\n');

    section(&mut report, "ARTICLES");
    let article_statuses: Vec<&str> = ArticleStatus::ALL.iter().map(|s| s.as_str()).collect();
    report.push_str(&status_table(&data.articles, &article_statuses));
    report.push('\n');

    section(&mut report, "DUE FOR PROCESSING");
    report.push_str(&format!("  verification    {}\n", data.due.verification));
    report.push_str(&format!("  extraction      {}\n", data.due.extraction));
    report.push_str(&format!("  cleaning        {}\n", data.due.cleaning));
    report.push_str(&format!("  classification  {}\n\n", data.due.classification));

    report.push_str(&generate_telemetry_text(&data.telemetry));

    report.push_str(RULE);
    report.push_str("                               End of Report\n");
    report.push_str(RULE);
    report
}

/// Telemetry sections alone, used by the `telemetry` command.
pub fn generate_telemetry_text(summary: &TelemetrySummary) -> String {
    let mut report = String::new();

    section(&mut report, "TELEMETRY");
    report.push_str(&format!("Total events: {}\n\n", summary.total_events));
    for kind in &summary.by_kind {
        report.push_str(&format!("  {:<20} {}\n", kind.kind, kind.count));
    }
    if !summary.by_kind.is_empty() {
        report.push('\n');
    }

    if !summary.strategies.is_empty() {
        section(&mut report, "STRATEGY EFFECTIVENESS");
        report.push_str(&format!(
            "  {:>6}  {:<12} {:>6} {:>8} {:>8}\n",
            "source", "strategy", "runs", "failed", "yield"
        ));
        for s in &summary.strategies {
            report.push_str(&format!(
                "  {:>6}  {:<12} {:>6} {:>8} {:>8}\n",
                s.source_id, s.strategy, s.runs, s.failures, s.yielded
            ));
        }
        report.push('\n');
    }

    if !summary.recent_failures.is_empty() {
        section(&mut report, "RECENT FAILURES");
        for event in &summary.recent_failures {
            report.push_str(&format!(
                "  {}  {:<14} {:<14} {}\n",
                event.created_at.format("%Y-%m-%d %H:%M:%S"),
                event.kind,
                event.outcome,
                event.subject
            ));
        }
        report.push('\n');
    }
    report
}

pub fn generate_json_report(data: &StatusReport) -> Result<String, serde_json::Error> {
    let json_report = serde_json::json!({
        "report": {
            "metadata": {
                "generator": "Broadsheet",
                "version": env!("CARGO_PKG_VERSION"),
                "generated_at": data.generated_at.to_rfc3339(),
                "format": "json",
            },
            "scope": data.scope,
            "summary": {
                "sources": data.sources,
                "candidates": CandidateStatus::ALL
                    .iter()
                    .map(|s| (s.as_str().to_string(), serde_json::json!(data.candidate_total(*s))))
                    .collect::<serde_json::Map<_, _>>(),
                "articles": ArticleStatus::ALL
                    .iter()
                    .map(|s| (s.as_str().to_string(), serde_json::json!(data.article_total(*s))))
                    .collect::<serde_json::Map<_, _>>(),
                "due": data.due,
            },
            "candidates_by_source": data.candidates,
            "articles_by_source": data.articles,
            "telemetry": data.telemetry,
        }
    });

    serde_json::to_string_pretty(&json_report)
}

pub fn save_report(content: &str, path: &Path) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}
