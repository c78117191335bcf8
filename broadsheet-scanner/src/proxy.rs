// Query-parameter forwarding proxy support

use crate::error::{Result, ScanError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use url::Url;

/// An upstream proxy that receives the real destination as a query parameter,
/// e.g. `https://proxy.internal/fetch?url=https%3A%2F%2Fnews.example.com%2F`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub endpoint: Url,
    pub target_param: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub auth_header: String,
}

impl ProxyConfig {
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| ScanError::InvalidProxy(format!("{}: {}", endpoint, e)))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(ScanError::InvalidProxy(format!(
                "unsupported proxy scheme {}",
                endpoint.scheme()
            )));
        }
        Ok(Self {
            endpoint,
            target_param: "url".to_string(),
            username: None,
            password: None,
            auth_header: "proxy-authorization".to_string(),
        })
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn with_target_param(mut self, param: &str) -> Self {
        self.target_param = param.to_string();
        self
    }

    /// Destination URL actually dialed for `target`. Existing query pairs on
    /// the endpoint are kept.
    pub fn rewrite(&self, target: &Url) -> Url {
        let mut rewritten = self.endpoint.clone();
        rewritten
            .query_pairs_mut()
            .append_pair(&self.target_param, target.as_str());
        rewritten
    }

    /// Adds proxy credentials without touching any other header.
    pub fn apply_auth(&self, headers: &mut HeaderMap) -> Result<()> {
        let Some(username) = &self.username else {
            return Ok(());
        };
        let password = self.password.as_deref().unwrap_or("");
        let token = STANDARD.encode(format!("{}:{}", username, password));
        let name = HeaderName::from_bytes(self.auth_header.as_bytes()).map_err(|_| {
            ScanError::InvalidHeader {
                name: self.auth_header.clone(),
                value: "<credentials>".to_string(),
            }
        })?;
        let value = HeaderValue::from_str(&format!("Basic {}", token)).map_err(|_| {
            ScanError::InvalidHeader {
                name: self.auth_header.clone(),
                value: "<credentials>".to_string(),
            }
        })?;
        headers.insert(name, value);
        Ok(())
    }
}
