// Browser identity and header synthesis

use crate::error::{Result, ScanError};
use rand::Rng;
use rand::seq::IndexedRandom;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/127.0.0.0 Safari/537.36 Edg/127.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:129.0) Gecko/20100101 Firefox/129.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_5 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Mobile/15E148 Safari/604.1",
];

const ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-US,en;q=0.8",
    "en-US,en;q=0.9,es;q=0.7",
    "en-GB,en;q=0.9,en-US;q=0.8",
    "en-US,en;q=0.7,fr;q=0.3",
];

const ACCEPT_ENCODINGS: &[&str] = &["gzip, deflate, br", "gzip, deflate", "br, gzip, deflate"];

const SEARCH_ENGINES: &[&str] = &[
    "https://www.google.com/",
    "https://www.bing.com/",
    "https://duckduckgo.com/",
];

const SECTION_PATHS: &[&str] = &[
    "/news/",
    "/local/",
    "/sports/",
    "/politics/",
    "/business/",
    "/opinion/",
    "/weather/",
    "/community/",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefererKind {
    HostRoot,
    SameHostPath,
    SearchEngine,
    Absent,
}

/// Relative weights used when picking a referer for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefererWeights {
    pub host_root: u32,
    pub same_host_path: u32,
    pub search_engine: u32,
    pub absent: u32,
}

impl Default for RefererWeights {
    fn default() -> Self {
        Self {
            host_root: 40,
            same_host_path: 30,
            search_engine: 20,
            absent: 10,
        }
    }
}

impl RefererWeights {
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> RefererKind {
        let total = self.host_root + self.same_host_path + self.search_engine + self.absent;
        if total == 0 {
            return RefererKind::Absent;
        }
        let mut roll = rng.random_range(0..total);
        for (weight, kind) in [
            (self.host_root, RefererKind::HostRoot),
            (self.same_host_path, RefererKind::SameHostPath),
            (self.search_engine, RefererKind::SearchEngine),
        ] {
            if roll < weight {
                return kind;
            }
            roll -= weight;
        }
        RefererKind::Absent
    }
}

/// Build a referer URL of the given kind for a request to `target`.
pub fn synthesize_referer<R: Rng + ?Sized>(
    kind: RefererKind,
    target: &Url,
    rng: &mut R,
) -> Option<String> {
    let root = format!("{}://{}/", target.scheme(), target.host_str()?);
    match kind {
        RefererKind::HostRoot => Some(root),
        RefererKind::SameHostPath => {
            let path = SECTION_PATHS.choose(rng).copied().unwrap_or("/");
            Some(format!("{}{}", root.trim_end_matches('/'), path))
        }
        RefererKind::SearchEngine => SEARCH_ENGINES.choose(rng).map(|s| s.to_string()),
        RefererKind::Absent => None,
    }
}

/// The browser persona presented to one host until the next rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_agent: String,
    pub accept_language: String,
    pub accept_encoding: String,
    pub do_not_track: bool,
}

impl Identity {
    pub fn generate<R: Rng + ?Sized>(
        user_agents: &[String],
        do_not_track_probability: f64,
        rng: &mut R,
    ) -> Self {
        let user_agent = user_agents
            .choose(rng)
            .cloned()
            .unwrap_or_else(|| DEFAULT_USER_AGENTS[0].to_string());
        Self {
            user_agent,
            accept_language: ACCEPT_LANGUAGES.choose(rng).copied().unwrap_or("en-US").to_string(),
            accept_encoding: ACCEPT_ENCODINGS
                .choose(rng)
                .copied()
                .unwrap_or("gzip")
                .to_string(),
            do_not_track: rng.random_bool(do_not_track_probability.clamp(0.0, 1.0)),
        }
    }

    /// Header set for one navigation request.
    pub fn headers(&self, target: &Url, referer: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        insert(&mut headers, "user-agent", &self.user_agent)?;
        insert(&mut headers, "accept", ACCEPT)?;
        insert(&mut headers, "accept-language", &self.accept_language)?;
        insert(&mut headers, "accept-encoding", &self.accept_encoding)?;
        insert(&mut headers, "upgrade-insecure-requests", "1")?;
        insert(&mut headers, "sec-fetch-dest", "document")?;
        insert(&mut headers, "sec-fetch-mode", "navigate")?;
        insert(&mut headers, "sec-fetch-user", "?1")?;

        let site = match referer.and_then(|r| Url::parse(r).ok()) {
            None => "none",
            Some(r) if r.host_str() == target.host_str() => "same-origin",
            Some(_) => "cross-site",
        };
        insert(&mut headers, "sec-fetch-site", site)?;

        if let Some(referer) = referer {
            insert(&mut headers, "referer", referer)?;
        }
        if self.do_not_track {
            insert(&mut headers, "dnt", "1")?;
        }
        Ok(headers)
    }
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<()> {
    let header_value = HeaderValue::from_str(value).map_err(|_| ScanError::InvalidHeader {
        name: name.to_string(),
        value: value.to_string(),
    })?;
    headers.insert(HeaderName::from_static(name), header_value);
    Ok(())
}
