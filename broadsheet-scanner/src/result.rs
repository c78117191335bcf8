use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a response (or a failed attempt) is interpreted by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseClass {
    Success,
    /// 404 or 410. Never retried.
    NotFound,
    /// Any other 4xx that is neither a rate limit nor a challenge.
    ClientError,
    RateLimited,
    BotChallenge,
    /// Timeouts, connection resets, 5xx.
    Transient,
}

impl ResponseClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseClass::Success => "success",
            ResponseClass::NotFound => "not_found",
            ResponseClass::ClientError => "client_error",
            ResponseClass::RateLimited => "rate_limited",
            ResponseClass::BotChallenge => "bot_challenge",
            ResponseClass::Transient => "transient",
        }
    }

    /// Whether a later attempt may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ResponseClass::RateLimited | ResponseClass::BotChallenge | ResponseClass::Transient
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub url: String,
    pub final_url: String,
    pub status_code: u16,
    pub content_type: Option<String>,
    pub retry_after: Option<Duration>,
    pub response_time: Duration,
    pub body: String,
    pub class: ResponseClass,
    pub error: Option<String>,
}

impl FetchResponse {
    pub fn new(url: String) -> Self {
        Self {
            final_url: url.clone(),
            url,
            status_code: 0,
            content_type: None,
            retry_after: None,
            response_time: Duration::from_secs(0),
            body: String::new(),
            class: ResponseClass::Transient,
            error: None,
        }
    }

    pub fn with_error(url: String, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::new(url)
        }
    }

    pub fn is_html(&self) -> bool {
        self.content_type
            .as_ref()
            .map(|ct| ct.contains("text/html") || ct.contains("application/xhtml"))
            .unwrap_or(true)
    }
}

/// Result of asking the coordinator to fetch a URL.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fetched(FetchResponse),
    /// The host is backing off; nothing was sent.
    Deferred { host: String, until: DateTime<Utc> },
}

impl FetchOutcome {
    pub fn response(&self) -> Option<&FetchResponse> {
        match self {
            FetchOutcome::Fetched(response) => Some(response),
            FetchOutcome::Deferred { .. } => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, FetchOutcome::Deferred { .. })
    }
}
