use crate::error::{PipelineError, Result};
use crate::model::DatasetScope;
use crate::telemetry::TelemetryMode;
use broadsheet_scanner::{BackoffPolicy, ProxyConfig, SessionConfig};
use std::str::FromStr;
use std::time::Duration;

/// Every pipeline tunable. Defaults suit a long-running worker against a
/// mixed set of publishers.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub batch_size: usize,
    pub concurrency: usize,
    pub max_retries: u32,
    pub verification_interval: Duration,
    pub discovery_frequency_hours: i64,
    pub pattern_min_frequency: usize,
    pub pattern_max_depth: usize,
    pub strategy_skip_window: usize,
    pub max_links_per_strategy: usize,
    pub feed_max_age_days: i64,
    pub classifier_threshold: f64,
    pub expiration_window: Duration,
    pub stall_threshold: Duration,
    pub telemetry_mode: TelemetryMode,
    pub session: SessionConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: "broadsheet.db".to_string(),
            batch_size: 50,
            concurrency: 8,
            max_retries: 3,
            verification_interval: Duration::from_secs(6 * 3600),
            discovery_frequency_hours: 24,
            pattern_min_frequency: 3,
            pattern_max_depth: 4,
            strategy_skip_window: 5,
            max_links_per_strategy: 200,
            feed_max_age_days: 30,
            classifier_threshold: 0.5,
            expiration_window: Duration::from_secs(7 * 24 * 3600),
            stall_threshold: Duration::from_secs(24 * 3600),
            telemetry_mode: TelemetryMode::default(),
            session: SessionConfig::default(),
        }
    }
}

/// Per-invocation options shared by every batch stage.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub scope: DatasetScope,
    /// Restrict the run to one source host.
    pub source_host: Option<String>,
    /// Upper bound on items handled; the stage's batch size when unset.
    pub limit: Option<usize>,
    /// Ignore due predicates and strategy deprioritisation.
    pub force: bool,
    /// Stop picking up new items after this instant. Items already in
    /// flight are allowed to finish.
    pub deadline: Option<tokio::time::Instant>,
}

impl RunOptions {
    pub fn new(scope: DatasetScope) -> Self {
        Self {
            scope,
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_source(mut self, host: &str) -> Self {
        self.source_host = Some(host.to_string());
        self
    }

    pub fn with_deadline(mut self, deadline: tokio::time::Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| tokio::time::Instant::now() >= deadline)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PipelineError::InvalidConfig(format!("{} has invalid value '{}'", name, raw))),
        _ => Ok(None),
    }
}

impl PipelineConfig {
    /// Defaults overridden by `BROADSHEET_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = env_parse::<String>("BROADSHEET_DATABASE_URL")? {
            config.database_url = url;
        }
        if let Some(v) = env_parse("BROADSHEET_BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = env_parse("BROADSHEET_CONCURRENCY")? {
            config.concurrency = v;
        }
        if let Some(v) = env_parse("BROADSHEET_MAX_RETRIES")? {
            config.max_retries = v;
        }
        if let Some(hours) = env_parse::<u64>("BROADSHEET_VERIFY_INTERVAL_HOURS")? {
            config.verification_interval = Duration::from_secs(hours * 3600);
        }
        if let Some(v) = env_parse("BROADSHEET_DISCOVERY_FREQUENCY_HOURS")? {
            config.discovery_frequency_hours = v;
        }
        if let Some(v) = env_parse("BROADSHEET_PATTERN_MIN_FREQUENCY")? {
            config.pattern_min_frequency = v;
        }
        if let Some(v) = env_parse("BROADSHEET_PATTERN_MAX_DEPTH")? {
            config.pattern_max_depth = v;
        }
        if let Some(v) = env_parse("BROADSHEET_STRATEGY_SKIP_WINDOW")? {
            config.strategy_skip_window = v;
        }
        if let Some(v) = env_parse("BROADSHEET_FEED_MAX_AGE_DAYS")? {
            config.feed_max_age_days = v;
        }
        if let Some(v) = env_parse("BROADSHEET_CLASSIFIER_THRESHOLD")? {
            config.classifier_threshold = v;
        }
        if let Some(days) = env_parse::<u64>("BROADSHEET_EXPIRATION_DAYS")? {
            config.expiration_window = Duration::from_secs(days * 24 * 3600);
        }
        if let Some(hours) = env_parse::<u64>("BROADSHEET_STALL_HOURS")? {
            config.stall_threshold = Duration::from_secs(hours * 3600);
        }
        match env_parse::<String>("BROADSHEET_TELEMETRY_MODE")?.as_deref() {
            None => {}
            Some("sync") => config.telemetry_mode = TelemetryMode::Sync,
            Some("async") => {
                let capacity = env_parse("BROADSHEET_TELEMETRY_QUEUE")?.unwrap_or(1024);
                config.telemetry_mode = TelemetryMode::Async { capacity };
            }
            Some(other) => {
                return Err(PipelineError::InvalidConfig(format!(
                    "BROADSHEET_TELEMETRY_MODE must be sync or async, got '{}'",
                    other
                )));
            }
        }

        config.session = session_from_env(config.session)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_database_url(mut self, url: &str) -> Self {
        self.database_url = url.to_string();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_verification_interval(mut self, interval: Duration) -> Self {
        self.verification_interval = interval;
        self
    }

    pub fn with_pattern_learning(mut self, min_frequency: usize, max_depth: usize) -> Self {
        self.pattern_min_frequency = min_frequency;
        self.pattern_max_depth = max_depth;
        self
    }

    pub fn with_strategy_skip_window(mut self, runs: usize) -> Self {
        self.strategy_skip_window = runs;
        self
    }

    pub fn with_housekeeping(mut self, expiration: Duration, stall: Duration) -> Self {
        self.expiration_window = expiration;
        self.stall_threshold = stall;
        self
    }

    pub fn with_telemetry_mode(mut self, mode: TelemetryMode) -> Self {
        self.telemetry_mode = mode;
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.classifier_threshold) {
            return Err(PipelineError::InvalidConfig(
                "classifier_threshold must be within 0..=1".to_string(),
            ));
        }
        if let TelemetryMode::Async { capacity: 0 } = self.telemetry_mode {
            return Err(PipelineError::InvalidConfig(
                "telemetry queue capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn session_from_env(mut session: SessionConfig) -> Result<SessionConfig> {
    let min = env_parse::<u64>("BROADSHEET_MIN_DELAY_MS")?;
    let max = env_parse::<u64>("BROADSHEET_MAX_DELAY_MS")?;
    if min.is_some() || max.is_some() {
        let min = min.map(Duration::from_millis).unwrap_or(session.min_delay);
        let max = max.map(Duration::from_millis).unwrap_or(session.max_delay);
        session = session.with_delay(min, max);
    }
    if let Some(secs) = env_parse::<u64>("BROADSHEET_REQUEST_TIMEOUT_SECS")? {
        session = session.with_timeout(Duration::from_secs(secs));
    }
    if let Some(n) = env_parse::<u32>("BROADSHEET_ROTATE_AFTER")? {
        let jitter = session.rotate_jitter;
        session = session.with_rotation(n, jitter);
    }
    let short_base = env_parse::<u64>("BROADSHEET_BACKOFF_BASE_SECS")?;
    let challenge_base = env_parse::<u64>("BROADSHEET_CHALLENGE_BACKOFF_BASE_SECS")?;
    if short_base.is_some() || challenge_base.is_some() {
        let short = short_base
            .map(|s| BackoffPolicy::new(Duration::from_secs(s), session.short_backoff.ceiling))
            .unwrap_or(session.short_backoff);
        let challenge = challenge_base
            .map(|s| BackoffPolicy::new(Duration::from_secs(s), session.challenge_backoff.ceiling))
            .unwrap_or(session.challenge_backoff);
        session = session.with_backoff(short, challenge);
    }
    if let Some(endpoint) = env_parse::<String>("BROADSHEET_PROXY_URL")? {
        let mut proxy = ProxyConfig::new(&endpoint)?;
        if let Some(user) = env_parse::<String>("BROADSHEET_PROXY_USERNAME")? {
            let password = env_parse::<String>("BROADSHEET_PROXY_PASSWORD")?.unwrap_or_default();
            proxy = proxy.with_credentials(&user, &password);
        }
        if let Some(param) = env_parse::<String>("BROADSHEET_PROXY_PARAM")? {
            proxy = proxy.with_target_param(&param);
        }
        session = session.with_proxy(proxy);
    }
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.verification_interval, Duration::from_secs(21_600));
        assert_eq!(config.pattern_min_frequency, 3);
        assert_eq!(config.pattern_max_depth, 4);
        assert_eq!(config.strategy_skip_window, 5);
        assert_eq!(config.expiration_window, Duration::from_secs(604_800));
        assert_eq!(config.stall_threshold, Duration::from_secs(86_400));
        assert_eq!(config.telemetry_mode, TelemetryMode::Async { capacity: 1024 });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = PipelineConfig::default().with_batch_size(0);
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_builders() {
        let config = PipelineConfig::default()
            .with_database_url(":memory:")
            .with_max_retries(5)
            .with_telemetry_mode(TelemetryMode::Sync);
        assert_eq!(config.database_url, ":memory:");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.telemetry_mode, TelemetryMode::Sync);
    }
}
