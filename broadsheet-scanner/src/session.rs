use crate::backoff::BackoffPolicy;
use crate::classify::{classify_response, classify_transport_error};
use crate::error::{Result, ScanError};
use crate::identity::{DEFAULT_USER_AGENTS, Identity, RefererWeights, synthesize_referer};
use crate::proxy::ProxyConfig;
use crate::result::{FetchOutcome, FetchResponse, ResponseClass};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::Client;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

pub type SessionCallback = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Observable facts emitted by the coordinator. Nothing here is required for
/// correctness; the callback is for telemetry.
#[derive(Debug, Clone, Serialize)]
pub enum SessionEvent {
    Fetched {
        host: String,
        url: String,
        status_code: u16,
        class: ResponseClass,
        elapsed_ms: u64,
        via_proxy: bool,
        error: Option<String>,
    },
    BackoffApplied {
        host: String,
        class: ResponseClass,
        consecutive: u32,
        delay: Duration,
        until: DateTime<Utc>,
    },
    Deferred {
        host: String,
        url: String,
        until: DateTime<Utc>,
    },
    IdentityRotated {
        host: String,
        after_requests: u32,
    },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub user_agents: Vec<String>,
    pub rotate_after: u32,
    pub rotate_jitter: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub short_backoff: BackoffPolicy,
    pub challenge_backoff: BackoffPolicy,
    pub sustained_success: u32,
    pub per_host_concurrency: usize,
    pub request_timeout: Duration,
    pub do_not_track_probability: f64,
    pub referer_weights: RefererWeights,
    pub proxy: Option<ProxyConfig>,
    pub max_redirects: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            rotate_after: 25,
            rotate_jitter: 10,
            min_delay: Duration::from_millis(1500),
            max_delay: Duration::from_millis(4000),
            short_backoff: BackoffPolicy::short(),
            challenge_backoff: BackoffPolicy::challenge(),
            sustained_success: 3,
            per_host_concurrency: 1,
            request_timeout: Duration::from_secs(20),
            do_not_track_probability: 0.3,
            referer_weights: RefererWeights::default(),
            proxy: None,
            max_redirects: 5,
        }
    }
}

impl SessionConfig {
    pub fn with_delay(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay = min;
        self.max_delay = max;
        self
    }

    pub fn with_backoff(mut self, short: BackoffPolicy, challenge: BackoffPolicy) -> Self {
        self.short_backoff = short;
        self.challenge_backoff = challenge;
        self
    }

    pub fn with_rotation(mut self, after: u32, jitter: u32) -> Self {
        self.rotate_after = after;
        self.rotate_jitter = jitter;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_user_agents(mut self, user_agents: Vec<String>) -> Self {
        self.user_agents = user_agents;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_delay < self.min_delay {
            return Err(ScanError::InvalidConfig(
                "max_delay must not be shorter than min_delay".to_string(),
            ));
        }
        if self.per_host_concurrency == 0 {
            return Err(ScanError::InvalidConfig(
                "per_host_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    None,
    RateLimited,
    BotChallenge,
    Transient,
}

/// Per-host pacing, identity and backoff state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSessionState {
    pub host: String,
    pub identity: Identity,
    pub requests_with_identity: u32,
    pub rotate_at: u32,
    pub total_requests: u64,
    pub consecutive_failures: u32,
    pub consecutive_challenges: u32,
    pub consecutive_successes: u32,
    pub backoff_until: Option<DateTime<Utc>>,
    pub last_failure: FailureKind,
    #[serde(skip)]
    pub last_request_at: Option<Instant>,
}

impl DomainSessionState {
    pub fn in_backoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.backoff_until.filter(|until| *until > now)
    }
}

/// Whether a host may be contacted right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Ready,
    Deferred { until: DateTime<Utc> },
}

/// A host-bound view of the coordinator. Cheap to create, safe to reuse.
pub struct HostSession<'a> {
    coordinator: &'a SessionCoordinator,
    host: String,
}

impl HostSession<'_> {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn identity(&self) -> Identity {
        self.coordinator.slot(&self.host).await.state.lock().await.identity.clone()
    }

    pub async fn admission(&self) -> Admission {
        self.coordinator.admission(&self.host).await
    }

    pub async fn fetch(&self, url: &Url) -> Result<FetchOutcome> {
        if host_key(url)? != self.host {
            return Err(ScanError::InvalidUrl(format!(
                "{} does not belong to session host {}",
                url, self.host
            )));
        }
        self.coordinator.fetch(url).await
    }
}

struct HostSlot {
    state: Mutex<DomainSessionState>,
    permits: Semaphore,
}

pub struct SessionCoordinator {
    client: Client,
    config: SessionConfig,
    hosts: Mutex<HashMap<String, Arc<HostSlot>>>,
    rng: StdMutex<StdRng>,
    event_callback: Option<SessionCallback>,
}

/// Lower-cased host used as the key for per-host state.
pub fn host_key(url: &Url) -> Result<String> {
    url.host_str()
        .map(|h| h.to_ascii_lowercase())
        .ok_or_else(|| ScanError::InvalidUrl(format!("{} has no host", url)))
}

impl SessionCoordinator {
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout / 2)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        Ok(Self {
            client,
            config,
            hosts: Mutex::new(HashMap::new()),
            rng: StdMutex::new(StdRng::from_os_rng()),
            event_callback: None,
        })
    }

    pub fn with_event_callback(mut self, callback: SessionCallback) -> Self {
        self.event_callback = Some(callback);
        self
    }

    /// Deterministic identity, pacing and referer choices.
    pub fn with_seed(self, seed: u64) -> Self {
        if let Ok(mut rng) = self.rng.lock() {
            *rng = StdRng::seed_from_u64(seed);
        }
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn session(&self, host: &str) -> HostSession<'_> {
        HostSession {
            coordinator: self,
            host: host.to_ascii_lowercase(),
        }
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        match self.rng.lock() {
            Ok(mut rng) => f(&mut rng),
            // A poisoned RNG is still a usable RNG
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn fresh_state(&self, host: &str) -> DomainSessionState {
        let (identity, rotate_at) = self.with_rng(|rng| {
            (
                Identity::generate(
                    &self.config.user_agents,
                    self.config.do_not_track_probability,
                    rng,
                ),
                next_rotation(&self.config, rng),
            )
        });
        DomainSessionState {
            host: host.to_string(),
            identity,
            requests_with_identity: 0,
            rotate_at,
            total_requests: 0,
            consecutive_failures: 0,
            consecutive_challenges: 0,
            consecutive_successes: 0,
            backoff_until: None,
            last_failure: FailureKind::None,
            last_request_at: None,
        }
    }

    async fn slot(&self, host: &str) -> Arc<HostSlot> {
        let mut hosts = self.hosts.lock().await;
        if let Some(slot) = hosts.get(host) {
            return slot.clone();
        }
        debug!(host, "Creating session state");
        let slot = Arc::new(HostSlot {
            state: Mutex::new(self.fresh_state(host)),
            permits: Semaphore::new(self.config.per_host_concurrency),
        });
        hosts.insert(host.to_string(), slot.clone());
        slot
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(ref callback) = self.event_callback {
            callback(event);
        }
    }

    /// Check backoff without creating state for unknown hosts.
    pub async fn admission(&self, host: &str) -> Admission {
        let host = host.to_ascii_lowercase();
        let slot = {
            let hosts = self.hosts.lock().await;
            hosts.get(&host).cloned()
        };
        let Some(slot) = slot else {
            return Admission::Ready;
        };
        let state = slot.state.lock().await;
        match state.in_backoff(Utc::now()) {
            Some(until) => Admission::Deferred { until },
            None => Admission::Ready,
        }
    }

    pub async fn state(&self, host: &str) -> Option<DomainSessionState> {
        let slot = self.hosts.lock().await.get(&host.to_ascii_lowercase()).cloned()?;
        let state = slot.state.lock().await.clone();
        Some(state)
    }

    pub async fn fetch(&self, url: &Url) -> Result<FetchOutcome> {
        self.fetch_with_headers(url, HeaderMap::new()).await
    }

    /// Fetch `url` with the host's identity. Caller headers override generated ones.
    pub async fn fetch_with_headers(&self, url: &Url, extra: HeaderMap) -> Result<FetchOutcome> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ScanError::InvalidUrl(format!("unsupported scheme in {}", url)));
        }
        let host = host_key(url)?;
        let slot = self.slot(&host).await;

        if let Some(until) = slot.state.lock().await.in_backoff(Utc::now()) {
            return Ok(self.deferred(&host, url, until));
        }

        let _permit = slot
            .permits
            .acquire()
            .await
            .map_err(|e| ScanError::InvalidConfig(format!("host semaphore closed: {}", e)))?;

        // Backoff may have started while we queued behind another request
        let wait = {
            let state = slot.state.lock().await;
            if let Some(until) = state.in_backoff(Utc::now()) {
                return Ok(self.deferred(&host, url, until));
            }
            let gap = self.with_rng(|rng| pacing_gap(&self.config, rng));
            state
                .last_request_at
                .map(|last| (last + gap).saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::ZERO)
        };
        if !wait.is_zero() {
            debug!(host = %host, wait_ms = wait.as_millis() as u64, "Pacing request");
            tokio::time::sleep(wait).await;
        }

        let (headers, rotated) = {
            let mut state = slot.state.lock().await;
            let mut rotated = None;
            if state.requests_with_identity >= state.rotate_at {
                rotated = Some(state.requests_with_identity);
                let (identity, rotate_at) = self.with_rng(|rng| {
                    (
                        Identity::generate(
                            &self.config.user_agents,
                            self.config.do_not_track_probability,
                            rng,
                        ),
                        next_rotation(&self.config, rng),
                    )
                });
                state.identity = identity;
                state.rotate_at = rotate_at;
                state.requests_with_identity = 0;
            }
            state.requests_with_identity += 1;
            state.total_requests += 1;
            state.last_request_at = Some(Instant::now());

            let referer = self.with_rng(|rng| {
                let kind = self.config.referer_weights.choose(rng);
                synthesize_referer(kind, url, rng)
            });
            let mut headers = state.identity.headers(url, referer.as_deref())?;
            for (name, value) in extra.iter() {
                headers.insert(name.clone(), value.clone());
            }
            (headers, rotated)
        };
        if let Some(after_requests) = rotated {
            debug!(host = %host, after_requests, "Rotated identity");
            self.emit(SessionEvent::IdentityRotated {
                host: host.clone(),
                after_requests,
            });
        }

        let response = self.send(url, headers).await?;
        self.record_outcome(&host, response.class, response.retry_after)
            .await;

        self.emit(SessionEvent::Fetched {
            host: host.clone(),
            url: url.to_string(),
            status_code: response.status_code,
            class: response.class,
            elapsed_ms: response.response_time.as_millis() as u64,
            via_proxy: self.config.proxy.is_some(),
            error: response.error.clone(),
        });

        Ok(FetchOutcome::Fetched(response))
    }

    fn deferred(&self, host: &str, url: &Url, until: DateTime<Utc>) -> FetchOutcome {
        debug!(host, url = %url, until = %until, "Host in backoff, deferring");
        self.emit(SessionEvent::Deferred {
            host: host.to_string(),
            url: url.to_string(),
            until,
        });
        FetchOutcome::Deferred {
            host: host.to_string(),
            until,
        }
    }

    async fn send(&self, url: &Url, mut headers: HeaderMap) -> Result<FetchResponse> {
        let target = match &self.config.proxy {
            Some(proxy) => {
                proxy.apply_auth(&mut headers)?;
                proxy.rewrite(url)
            }
            None => url.clone(),
        };

        debug!(url = %url, "Fetching");
        let mut result = FetchResponse::new(url.to_string());
        let start = std::time::Instant::now();

        let response = match self.client.get(target).headers(headers).send().await {
            Ok(response) => response,
            Err(e) => {
                result.response_time = start.elapsed();
                result.class = classify_transport_error(&e);
                result.error = Some(e.to_string());
                warn!(url = %url, error = %e, "Request failed");
                return Ok(result);
            }
        };

        result.status_code = response.status().as_u16();
        if self.config.proxy.is_none() {
            result.final_url = response.url().to_string();
        }
        let response_headers = response.headers().clone();
        result.content_type = response_headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        result.retry_after = parse_retry_after(&response_headers);

        match response.text().await {
            Ok(body) => {
                result.response_time = start.elapsed();
                result.class = classify_response(result.status_code, &response_headers, &body);
                result.body = body;
            }
            Err(e) => {
                result.response_time = start.elapsed();
                result.class = ResponseClass::Transient;
                result.error = Some(e.to_string());
                warn!(url = %url, error = %e, "Failed reading response body");
            }
        }
        Ok(result)
    }

    /// Apply the backoff policy for an observed outcome. Returns the delay
    /// imposed on the host, if any. Extraction calls this directly when it
    /// recognises a challenge page.
    pub async fn record_outcome(
        &self,
        host: &str,
        class: ResponseClass,
        retry_after: Option<Duration>,
    ) -> Option<Duration> {
        let host = host.to_ascii_lowercase();
        let slot = self.slot(&host).await;
        let now = Utc::now();

        let applied = {
            let mut state = slot.state.lock().await;
            let imposed = match class {
                ResponseClass::Success => {
                    state.consecutive_failures = 0;
                    state.consecutive_successes += 1;
                    if state.consecutive_successes >= self.config.sustained_success {
                        state.consecutive_challenges = 0;
                        state.last_failure = FailureKind::None;
                    }
                    None
                }
                ResponseClass::NotFound | ResponseClass::ClientError => None,
                ResponseClass::RateLimited | ResponseClass::Transient => {
                    state.consecutive_successes = 0;
                    state.consecutive_failures += 1;
                    state.last_failure = if class == ResponseClass::RateLimited {
                        FailureKind::RateLimited
                    } else {
                        FailureKind::Transient
                    };
                    let delay = self
                        .config
                        .short_backoff
                        .delay_with_hint(state.consecutive_failures, retry_after);
                    Some((state.consecutive_failures, delay))
                }
                ResponseClass::BotChallenge => {
                    state.consecutive_successes = 0;
                    state.consecutive_challenges += 1;
                    state.last_failure = FailureKind::BotChallenge;
                    let delay = self
                        .config
                        .challenge_backoff
                        .delay(state.consecutive_challenges);
                    Some((state.consecutive_challenges, delay))
                }
            };
            imposed.map(|(consecutive, delay)| {
                let until = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(now);
                let until = state.backoff_until.map_or(until, |current| current.max(until));
                state.backoff_until = Some(until);
                (consecutive, delay, until)
            })
        };

        let (consecutive, delay, until) = applied?;
        if class == ResponseClass::BotChallenge {
            warn!(host = %host, consecutive, delay_secs = delay.as_secs(), "Bot challenge, long backoff");
        } else {
            info!(host = %host, class = class.as_str(), consecutive, delay_secs = delay.as_secs(), "Backing off host");
        }
        self.emit(SessionEvent::BackoffApplied {
            host,
            class,
            consecutive,
            delay,
            until,
        });
        Some(delay)
    }

    /// Snapshot every host's state. Only called on explicit checkpoint.
    pub async fn checkpoint(&self) -> Vec<DomainSessionState> {
        let slots: Vec<Arc<HostSlot>> = self.hosts.lock().await.values().cloned().collect();
        let mut states = Vec::with_capacity(slots.len());
        for slot in slots {
            states.push(slot.state.lock().await.clone());
        }
        states.sort_by(|a, b| a.host.cmp(&b.host));
        states
    }

    pub async fn checkpoint_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.checkpoint().await)?)
    }

    pub async fn restore(&self, states: Vec<DomainSessionState>) {
        let mut hosts = self.hosts.lock().await;
        for state in states {
            let host = state.host.to_ascii_lowercase();
            hosts.insert(
                host,
                Arc::new(HostSlot {
                    state: Mutex::new(state),
                    permits: Semaphore::new(self.config.per_host_concurrency),
                }),
            );
        }
    }

    pub async fn restore_json(&self, json: &str) -> Result<usize> {
        let states: Vec<DomainSessionState> = serde_json::from_str(json)?;
        let count = states.len();
        self.restore(states).await;
        Ok(count)
    }
}

fn next_rotation(config: &SessionConfig, rng: &mut StdRng) -> u32 {
    let low = config.rotate_after.saturating_sub(config.rotate_jitter).max(1);
    let high = config.rotate_after.saturating_add(config.rotate_jitter).max(low);
    rng.random_range(low..=high)
}

fn pacing_gap(config: &SessionConfig, rng: &mut StdRng) -> Duration {
    let min = config.min_delay.as_millis() as u64;
    let max = config.max_delay.as_millis() as u64;
    if max <= min {
        return config.min_delay;
    }
    Duration::from_millis(rng.random_range(min..=max))
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    (date.with_timezone(&Utc) - Utc::now()).to_std().ok()
}
