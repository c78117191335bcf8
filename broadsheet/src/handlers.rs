use anyhow::{Context as _, Result, anyhow, bail};
use broadsheet_core::config::{PipelineConfig, RunOptions};
use broadsheet_core::data::Database;
use broadsheet_core::model::{DatasetScope, NewSource, SourceStatus};
use broadsheet_core::pipeline::Pipeline;
use broadsheet_core::report::{
    ReportFormat, StatusReport, TelemetrySummary, gather_status_report, generate_json_report,
    generate_telemetry_text, generate_text_report, save_report,
};
use broadsheet_core::urls::normalize_host;
use clap::ArgMatches;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Settings every handler needs, resolved once from the global flags.
pub struct Context {
    pub config: PipelineConfig,
    pub dataset: Option<String>,
    pub quiet: bool,
    pub session_state: Option<PathBuf>,
}

impl Context {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let mut config = PipelineConfig::from_env()?;
        if let Some(database) = matches.get_one::<String>("database") {
            config.database_url = expand_database_url(database);
        }
        if let Some(batch_size) = matches.get_one::<usize>("batch-size") {
            config.batch_size = *batch_size;
        }
        config.validate()?;
        Ok(Self {
            config,
            dataset: matches.get_one::<String>("dataset").cloned(),
            quiet: matches.get_flag("quiet"),
            session_state: matches.get_one::<PathBuf>("session-state").cloned(),
        })
    }

    async fn open(&self) -> Result<Pipeline> {
        let pipeline = Pipeline::open(self.config.clone())
            .await
            .with_context(|| format!("Failed to open database {}", self.config.database_url))?;
        if let Some(path) = &self.session_state
            && path.exists()
        {
            let restored = pipeline.restore_sessions(path).await?;
            tracing::debug!(hosts = restored, path = %path.display(), "Restored session state");
        }
        Ok(pipeline)
    }

    async fn close(&self, pipeline: &Pipeline) -> Result<()> {
        if let Some(path) = &self.session_state {
            let saved = pipeline.save_sessions(path).await?;
            tracing::debug!(hosts = saved, path = %path.display(), "Saved session state");
        }
        pipeline.shutdown(true).await?;
        Ok(())
    }

    fn spinner(&self, message: &str) -> Result<ProgressBar> {
        let spinner = if self.quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };
        spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner.set_message(message.to_string());
        Ok(spinner)
    }
}

/// Expand `~` in filesystem paths; URLs are passed through untouched.
pub fn expand_database_url(database: &str) -> String {
    if database.contains("://") || database == ":memory:" {
        database.to_string()
    } else {
        shellexpand::tilde(database).into_owned()
    }
}

/// SQLite file behind a database URL, if it is one.
pub fn sqlite_file(database_url: &str) -> Option<PathBuf> {
    if database_url == ":memory:" || database_url.starts_with("postgres") {
        return None;
    }
    let path = database_url.strip_prefix("sqlite://").unwrap_or(database_url);
    Some(PathBuf::from(path))
}

// Source list parsing

/// Parse one `host,name[,feed1|feed2]` line. The host may be given as a bare
/// host or a homepage URL. Returns `None` for blanks and comments.
pub fn parse_source_line(line: &str, frequency_hours: i64) -> Option<NewSource> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut fields = line.splitn(3, ',').map(str::trim);
    let host_field = fields.next().filter(|h| !h.is_empty())?;

    let base_url = if host_field.contains("://") {
        Url::parse(host_field).ok()?
    } else {
        Url::parse(&format!("https://{}/", host_field)).ok()?
    };
    let host = normalize_host(base_url.host_str()?);
    if host.is_empty() {
        eprintln!("{} Skipping invalid source '{}'", "⚠".yellow(), line);
        return None;
    }

    let name = fields
        .next()
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| host.clone());
    let feeds = fields
        .next()
        .map(|f| {
            f.split('|')
                .map(str::trim)
                .filter(|feed| Url::parse(feed).is_ok())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(NewSource {
        host,
        name,
        base_url: base_url.to_string(),
        feeds,
        discovery_frequency_hours: frequency_hours,
    })
}

pub fn load_sources_from_file(path: &Path, frequency_hours: i64) -> Result<Vec<NewSource>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read source list {}", path.display()))?;
    let sources: Vec<NewSource> = content
        .lines()
        .filter_map(|line| parse_source_line(line, frequency_hours))
        .collect();
    if sources.is_empty() {
        bail!("No valid sources found in {}", path.display());
    }
    Ok(sources)
}

// Output helpers

fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

fn print_heading(title: &str) {
    print_divider();
    println!("{}", format!("  {}", title).bright_white().bold());
    print_divider();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn count_line(label: &str, value: usize) {
    let value = if value > 0 {
        value.to_string().bright_white().bold()
    } else {
        value.to_string().dimmed()
    };
    println!("  {:<20} {}", label, value);
}

fn run_options(ctx: &Context, scope: DatasetScope, args: &ArgMatches) -> RunOptions {
    let mut options = RunOptions::new(scope).with_force(args.get_flag("force"));
    if let Some(limit) = args.get_one::<usize>("limit") {
        options = options.with_limit(*limit);
    }
    if let Some(host) = args.get_one::<String>("source") {
        options = options.with_source(host);
    }
    if let Some(seconds) = args.get_one::<u64>("deadline") {
        options = options
            .with_deadline(tokio::time::Instant::now() + Duration::from_secs(*seconds));
    }
    tracing::debug!(
        batch_size = ctx.config.batch_size,
        limit = ?options.limit,
        force = options.force,
        "Stage options resolved"
    );
    options
}

// Handlers

pub async fn handle_init(ctx: &Context, args: &ArgMatches) -> Result<()> {
    let database_url = &ctx.config.database_url;
    if !ctx.quiet {
        print_heading("BROADSHEET INITIALIZATION");
        println!();
    }

    if let Some(path) = sqlite_file(database_url) {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        if path.exists() && args.get_flag("force") {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
            println!("{} Existing database removed", "✓".green().bold());
        }
    }

    let spinner = ctx.spinner("Creating schema...")?;
    let db = Database::open(database_url).await;
    spinner.finish_and_clear();
    db.with_context(|| format!("Failed to initialise {}", database_url))?;

    println!(
        "{} Database initialized: {}",
        "✓".green().bold(),
        database_url.bright_white()
    );
    Ok(())
}

pub async fn handle_source_import(ctx: &Context, args: &ArgMatches) -> Result<()> {
    let file = args
        .get_one::<PathBuf>("FILE")
        .ok_or_else(|| anyhow!("FILE is required"))?;
    let frequency = args
        .get_one::<i64>("frequency")
        .copied()
        .unwrap_or(ctx.config.discovery_frequency_hours);
    let sources = load_sources_from_file(file, frequency)?;

    let pipeline = ctx.open().await?;
    let scope = pipeline.resolve_scope(ctx.dataset.as_deref()).await?;
    for source in &sources {
        pipeline.db().upsert_source(scope.write_id(), source).await?;
        println!("  {} {} ({})", "✓".green(), source.host.bright_white(), source.name);
    }
    println!(
        "\n{} Imported {} source(s)",
        "✓".green().bold(),
        sources.len().to_string().cyan()
    );
    ctx.close(&pipeline).await
}

pub async fn handle_source_list(ctx: &Context, args: &ArgMatches) -> Result<()> {
    let pipeline = ctx.open().await?;
    let scope = pipeline.resolve_scope(ctx.dataset.as_deref()).await?;
    let sources = pipeline.db().list_sources(scope, args.get_flag("all")).await?;
    if sources.is_empty() {
        println!("No sources. Import some with `broadsheet source import <FILE>`.");
    }
    for source in &sources {
        let status = match source.status {
            SourceStatus::Active => source.status.as_str().green(),
            SourceStatus::Disabled => source.status.as_str().red(),
        };
        let last = source
            .last_discovery_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {:<32} {:<9} feeds={:<2} every {}h  last discovery: {}",
            source.host.bright_white(),
            status,
            source.feeds.len(),
            source.discovery_frequency_hours,
            last.dimmed()
        );
    }
    ctx.close(&pipeline).await
}

pub async fn handle_source_status(ctx: &Context, args: &ArgMatches, status: SourceStatus) -> Result<()> {
    let host = args
        .get_one::<String>("HOST")
        .ok_or_else(|| anyhow!("HOST is required"))?;
    let pipeline = ctx.open().await?;
    let scope = pipeline.resolve_scope(ctx.dataset.as_deref()).await?;
    let host = normalize_host(host);
    if !pipeline
        .db()
        .set_source_status(scope.write_id(), &host, status)
        .await?
    {
        bail!("Unknown source: {}", host);
    }
    println!("{} {} is now {}", "✓".green().bold(), host.bright_white(), status.as_str());
    ctx.close(&pipeline).await
}

pub async fn handle_dataset_create(ctx: &Context, args: &ArgMatches) -> Result<()> {
    let slug = args
        .get_one::<String>("SLUG")
        .ok_or_else(|| anyhow!("SLUG is required"))?;
    let name = args.get_one::<String>("name").unwrap_or(slug);
    let isolated = args.get_flag("isolated");

    let pipeline = ctx.open().await?;
    let id = pipeline.db().create_dataset(slug, name, isolated).await?;
    println!(
        "{} Dataset {} (id {}){}",
        "✓".green().bold(),
        slug.bright_white(),
        id,
        if isolated { ", isolated" } else { "" }
    );
    ctx.close(&pipeline).await
}

pub async fn handle_dataset_list(ctx: &Context) -> Result<()> {
    let pipeline = ctx.open().await?;
    let datasets = pipeline.db().list_datasets().await?;
    if datasets.is_empty() {
        println!("No datasets. Records without one belong to the default scope.");
    }
    for dataset in &datasets {
        println!(
            "  {:>4}  {:<20} {:<30} {}",
            dataset.id,
            dataset.slug.bright_white(),
            dataset.name,
            if dataset.isolated {
                "isolated".yellow()
            } else {
                "default scope".dimmed()
            }
        );
    }
    ctx.close(&pipeline).await
}

/// Which batch stage to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discover,
    Verify,
    Extract,
    Clean,
    Run,
}

impl Stage {
    fn label(&self) -> &'static str {
        match self {
            Stage::Discover => "Discovering article links...",
            Stage::Verify => "Verifying candidate links...",
            Stage::Extract => "Extracting articles...",
            Stage::Clean => "Cleaning articles...",
            Stage::Run => "Running the pipeline...",
        }
    }
}

pub async fn handle_stage(ctx: &Context, args: &ArgMatches, stage: Stage) -> Result<()> {
    let pipeline = ctx.open().await?;
    // Dataset errors surface here, before any fetch
    let scope = pipeline.resolve_scope(ctx.dataset.as_deref()).await?;
    let options = run_options(ctx, scope, args);
    let json = args.get_flag("json");

    let spinner = ctx.spinner(stage.label())?;
    let outcome = run_stage(&pipeline, &options, stage, json).await;
    spinner.finish_and_clear();
    let close = ctx.close(&pipeline).await;
    outcome?;
    close
}

async fn run_stage(pipeline: &Pipeline, options: &RunOptions, stage: Stage, json: bool) -> Result<()> {
    match stage {
        Stage::Discover => {
            let report = pipeline.discover(options).await?;
            if json {
                return print_json(&report);
            }
            print_heading("DISCOVERY");
            for source in &report.sources {
                println!(
                    "  {} {} new, {} duplicate",
                    source.host.bright_white(),
                    source.inserted.to_string().green(),
                    source.duplicates
                );
                for outcome in &source.strategies {
                    let tag = match outcome.outcome.as_str() {
                        "failed" => outcome.outcome.red(),
                        "skipped" | "deferred" => outcome.outcome.yellow(),
                        _ => outcome.outcome.green(),
                    };
                    println!(
                        "      {:<11} {:<8} found {:>4}  new {:>4}",
                        outcome.strategy.as_str(),
                        tag,
                        outcome.found,
                        outcome.new_links
                    );
                }
            }
            count_line("inserted", report.inserted());
            count_line("not due", report.skipped_not_due);
            count_line("failed sources", report.failed_sources);
        }
        Stage::Verify => {
            let report = pipeline.verify(options).await?;
            if json {
                return print_json(&report);
            }
            print_heading("VERIFICATION");
            count_line("examined", report.examined);
            count_line("verified", report.verified);
            count_line("dead", report.dead);
            count_line("bot challenges", report.challenged);
            count_line("retry later", report.retried);
            count_line("deferred", report.deferred);
            count_line("not due", report.skipped_not_due);
            count_line("host in backoff", report.skipped_backoff);
        }
        Stage::Extract => {
            let report = pipeline.extract(options).await?;
            if json {
                return print_json(&report);
            }
            print_heading("EXTRACTION");
            count_line("examined", report.examined);
            count_line("extracted", report.extracted);
            count_line("duplicates", report.duplicates);
            count_line("null text", report.null_text);
            count_line("bot challenges", report.challenged);
            count_line("retry later", report.retried);
            count_line("dead", report.dead);
            count_line("deferred", report.deferred);
            count_line("host in backoff", report.skipped_backoff);
        }
        Stage::Clean => {
            let report = pipeline.clean(options).await?;
            if json {
                return print_json(&report);
            }
            print_heading("CLEANING");
            count_line("examined", report.examined);
            count_line("cleaned", report.cleaned);
            count_line("null text", report.null_text);
        }
        Stage::Run => {
            let report = pipeline.run(options).await?;
            if json {
                return print_json(&report);
            }
            print_heading("PIPELINE RUN");
            count_line("links inserted", report.discovery.inserted());
            count_line("links verified", report.verification.verified);
            count_line("links dead", report.verification.dead + report.extraction.dead);
            count_line("articles extracted", report.extraction.extracted);
            count_line("duplicates", report.extraction.duplicates);
            count_line(
                "bot challenges",
                report.verification.challenged + report.extraction.challenged,
            );
            count_line("articles cleaned", report.cleaning.cleaned);
            count_line("articles classified", report.classification.classified);
        }
    }
    Ok(())
}

pub async fn handle_housekeeping(ctx: &Context, args: &ArgMatches) -> Result<()> {
    let pipeline = ctx.open().await?;
    let scope = pipeline.resolve_scope(ctx.dataset.as_deref()).await?;
    let report = pipeline.housekeeping(scope).await;
    let close = ctx.close(&pipeline).await;
    let report = report?;
    close?;

    if args.get_flag("json") {
        return print_json(&report);
    }
    print_heading("HOUSEKEEPING");
    count_line("paused (expired)", report.paused as usize);
    if report.stalled.is_empty() {
        println!("  {} No stalled stages", "✓".green());
    }
    for stalled in &report.stalled {
        println!(
            "  {} {} item(s) stalled in {}",
            "⚠".yellow().bold(),
            stalled.count.to_string().yellow(),
            stalled.stage
        );
    }
    Ok(())
}

fn emit_report(args: &ArgMatches, text: String, json: impl FnOnce() -> Result<String>) -> Result<()> {
    let format = args
        .get_one::<String>("format")
        .and_then(|f| ReportFormat::parse(f))
        .unwrap_or(ReportFormat::Text);
    let content = match format {
        ReportFormat::Text => text,
        ReportFormat::Json => json()?,
    };
    match args.get_one::<PathBuf>("output") {
        Some(path) => {
            save_report(&content, path)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            println!("{} Report saved to {}", "✓".green().bold(), path.display());
        }
        None => print!("{}", content),
    }
    Ok(())
}

async fn status_report(ctx: &Context, pipeline: &Pipeline, failures: i64) -> Result<StatusReport> {
    let scope = pipeline.resolve_scope(ctx.dataset.as_deref()).await?;
    let label = ctx.dataset.as_deref().unwrap_or("default");
    pipeline.telemetry().flush().await?;
    Ok(gather_status_report(
        pipeline.db(),
        &pipeline.telemetry().reader(),
        pipeline.config(),
        scope,
        label,
        failures,
    )
    .await?)
}

pub async fn handle_status(ctx: &Context, args: &ArgMatches) -> Result<()> {
    let pipeline = ctx.open().await?;
    let report = status_report(ctx, &pipeline, 10).await;
    let close = ctx.close(&pipeline).await;
    let report = report?;
    close?;
    emit_report(args, generate_text_report(&report), || {
        Ok(generate_json_report(&report)?)
    })
}

pub async fn handle_telemetry(ctx: &Context, args: &ArgMatches) -> Result<()> {
    let failures = args.get_one::<i64>("failures").copied().unwrap_or(20);
    let pipeline = ctx.open().await?;
    let report = status_report(ctx, &pipeline, failures).await;
    let close = ctx.close(&pipeline).await;
    let summary: TelemetrySummary = report?.telemetry;
    close?;
    emit_report(args, generate_telemetry_text(&summary), || {
        Ok(serde_json::to_string_pretty(&summary)?)
    })
}

pub async fn handle_reset(ctx: &Context, args: &ArgMatches) -> Result<()> {
    let id = *args
        .get_one::<i64>("ID")
        .ok_or_else(|| anyhow!("ID is required"))?;
    let pipeline = ctx.open().await?;
    let reset = pipeline.reset_candidate(id).await;
    let close = ctx.close(&pipeline).await;
    let reset = reset?;
    close?;
    if !reset {
        bail!("No candidate link with id {}", id);
    }
    println!("{} Candidate {} reset to discovered", "✓".green().bold(), id);
    Ok(())
}
