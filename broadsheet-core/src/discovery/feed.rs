// Syndication feed strategy: configured feeds, advertised feeds, then well-known paths

use super::{SourceContext, Strategy, StrategyError};
use crate::model::StrategyKind;
use crate::urls::{is_non_article, is_same_site, resolve_link};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::debug;
use url::Url;

const COMMON_FEED_PATHS: &[&str] = &["/feed", "/rss", "/feed/", "/rss.xml"];

pub struct FeedStrategy {
    max_age: chrono::Duration,
    max_links: usize,
}

impl FeedStrategy {
    pub fn new(max_age_days: i64, max_links: usize) -> Self {
        Self {
            max_age: chrono::Duration::days(max_age_days),
            max_links,
        }
    }

    async fn feed_urls(&self, ctx: &SourceContext) -> (Vec<Url>, bool) {
        let configured: Vec<Url> = ctx
            .source
            .feeds
            .iter()
            .filter_map(|feed| resolve_link(&ctx.base_url, feed))
            .collect();
        if !configured.is_empty() {
            return (configured, false);
        }
        if let Ok(page) = ctx.homepage().await
            && !page.feeds.is_empty()
        {
            return (page.feeds.clone(), false);
        }
        let guessed = COMMON_FEED_PATHS
            .iter()
            .filter_map(|p| ctx.base_url.join(p).ok())
            .collect();
        (guessed, true)
    }
}

/// Article links from one feed document. Off-site entries, media pages and
/// entries older than `max_age` are dropped.
pub fn parse_entries(
    body: &str,
    feed_url: &Url,
    host: &str,
    now: DateTime<Utc>,
    max_age: chrono::Duration,
) -> Result<Vec<Url>, StrategyError> {
    let feed = feed_rs::parser::parse(body.as_bytes())
        .map_err(|e| StrategyError::Parse(format!("{}: {}", feed_url, e)))?;

    let mut links = Vec::new();
    for entry in feed.entries {
        let href = entry
            .links
            .first()
            .map(|link| link.href.clone())
            .unwrap_or_else(|| entry.id.clone());
        let Some(url) = resolve_link(feed_url, &href) else {
            continue;
        };
        if let Some(published) = entry.published.or(entry.updated)
            && now - published > max_age
        {
            debug!(url = %url, published = %published, "Skipping stale feed entry");
            continue;
        }
        if !is_same_site(&url, host) || is_non_article(&url) {
            continue;
        }
        links.push(url);
    }
    Ok(links)
}

#[async_trait]
impl Strategy for FeedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Feed
    }

    async fn discover(&self, ctx: &SourceContext) -> Result<Vec<Url>, StrategyError> {
        let (feeds, probing) = self.feed_urls(ctx).await;
        let now = Utc::now();

        let mut links = Vec::new();
        let mut seen = HashSet::new();
        let mut parsed_any = false;
        let mut last_error = None;

        for feed_url in feeds {
            let entries = match ctx.fetch(&feed_url).await {
                Ok(response) => {
                    parse_entries(&response.body, &feed_url, ctx.host(), now, self.max_age)
                }
                Err(e) => Err(e),
            };
            match entries {
                Ok(entries) => {
                    parsed_any = true;
                    for url in entries {
                        if seen.insert(url.to_string()) {
                            links.push(url);
                        }
                    }
                    if probing {
                        break;
                    }
                }
                // No point trying the other feeds of a host in backoff
                Err(e @ StrategyError::Deferred { .. }) if links.is_empty() => return Err(e),
                Err(e) => {
                    debug!(feed = %feed_url, error = %e, "Feed unavailable");
                    last_error = Some(e);
                }
            }
        }

        if !parsed_any {
            return Err(last_error.unwrap_or(StrategyError::NotFound("no feed".to_string())));
        }
        links.truncate(self.max_links);
        Ok(links)
    }
}
