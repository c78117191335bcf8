// Parsed HTML pages and the per-source context shared by strategies

use super::StrategyError;
use crate::model::Source;
use crate::urls::resolve_link;
use broadsheet_scanner::{FetchOutcome, FetchResponse, ResponseClass, SessionCoordinator};
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::OnceCell;
use url::Url;

#[derive(Debug, Clone, PartialEq)]
pub struct PageLink {
    pub url: Url,
    pub text: String,
    /// Inside a `<nav>` or `<header>` element.
    pub in_nav: bool,
}

/// Links and feed advertisements of one fetched HTML page.
#[derive(Debug, Clone)]
pub struct Page {
    pub url: Url,
    pub links: Vec<PageLink>,
    pub feeds: Vec<Url>,
    /// Absolute URLs found anywhere in the raw markup, including scripts
    /// and data attributes.
    pub raw_urls: Vec<Url>,
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

impl Page {
    /// Parse synchronously; `Html` is not `Send` and must not live across
    /// an await point.
    pub fn parse(url: Url, body: &str) -> Self {
        let document = Html::parse_document(body);

        let mut nav_hrefs = HashSet::new();
        if let Some(nav) = selector("nav a[href], header a[href]") {
            for element in document.select(&nav) {
                if let Some(href) = element.value().attr("href") {
                    nav_hrefs.insert(href.to_string());
                }
            }
        }

        let mut links = Vec::new();
        let mut seen = HashSet::new();
        if let Some(anchors) = selector("a[href]") {
            for element in document.select(&anchors) {
                let Some(href) = element.value().attr("href") else {
                    continue;
                };
                let Some(resolved) = resolve_link(&url, href) else {
                    continue;
                };
                if !seen.insert(resolved.to_string()) {
                    continue;
                }
                let text = element
                    .text()
                    .collect::<Vec<_>>()
                    .join(" ")
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ");
                links.push(PageLink {
                    url: resolved,
                    text,
                    in_nav: nav_hrefs.contains(href),
                });
            }
        }

        let mut feeds = Vec::new();
        if let Some(alternates) = selector("link[rel=alternate][href]") {
            for element in document.select(&alternates) {
                let kind = element.value().attr("type").unwrap_or_default();
                if !(kind.contains("rss") || kind.contains("atom")) {
                    continue;
                }
                if let Some(feed) = element
                    .value()
                    .attr("href")
                    .and_then(|href| resolve_link(&url, href))
                {
                    feeds.push(feed);
                }
            }
        }

        let raw_urls = super::heuristic::embedded_urls(body)
            .into_iter()
            .filter_map(|raw| Url::parse(&raw).ok())
            .collect();

        Self {
            url,
            links,
            feeds,
            raw_urls,
        }
    }
}

/// Fetch through the coordinator, mapping anything but a successful HTML
/// page to a strategy error.
pub async fn fetch_ok(
    coordinator: &SessionCoordinator,
    url: &Url,
) -> Result<FetchResponse, StrategyError> {
    match coordinator.fetch(url).await? {
        FetchOutcome::Deferred { host, until } => Err(StrategyError::Deferred { host, until }),
        FetchOutcome::Fetched(response) if response.class == ResponseClass::Success => {
            Ok(response)
        }
        FetchOutcome::Fetched(response) => Err(StrategyError::Http {
            url: url.to_string(),
            class: response.class,
            status: response.status_code,
        }),
    }
}

/// What a strategy knows about the source it is working on. The homepage is
/// fetched at most once per run, by whichever strategy asks first.
pub struct SourceContext {
    pub source: Source,
    pub base_url: Url,
    /// URLs of this source already confirmed as articles.
    pub known_urls: Vec<Url>,
    coordinator: Arc<SessionCoordinator>,
    homepage: OnceCell<Result<Arc<Page>, StrategyError>>,
}

impl SourceContext {
    pub fn new(
        source: Source,
        base_url: Url,
        known_urls: Vec<Url>,
        coordinator: Arc<SessionCoordinator>,
    ) -> Self {
        Self {
            source,
            base_url,
            known_urls,
            coordinator,
            homepage: OnceCell::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.source.host
    }

    pub async fn fetch(&self, url: &Url) -> Result<FetchResponse, StrategyError> {
        fetch_ok(&self.coordinator, url).await
    }

    pub async fn fetch_page(&self, url: &Url) -> Result<Page, StrategyError> {
        let response = self.fetch(url).await?;
        let final_url = Url::parse(&response.final_url).unwrap_or_else(|_| url.clone());
        Ok(Page::parse(final_url, &response.body))
    }

    pub async fn homepage(&self) -> Result<Arc<Page>, StrategyError> {
        self.homepage
            .get_or_init(|| async { self.fetch_page(&self.base_url).await.map(Arc::new) })
            .await
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_links_nav_and_feeds() {
        let html = r#"<html><head>
            <link rel="alternate" type="application/rss+xml" href="/feed.xml">
            <link rel="stylesheet" href="/site.css">
            </head><body>
            <nav><a href="/news">News</a><a href="/sports">Sports</a></nav>
            <a href="/news/city-hall-story#comments">City   hall
                story</a>
            <a href="/news/city-hall-story">Duplicate</a>
            <a href="mailto:desk@example.com">Email</a>
            <script>var next = "https://example.com/news/2024/05/embedded-story";</script>
            </body></html>"#;
        let page = Page::parse(Url::parse("https://example.com/").unwrap(), html);

        assert_eq!(page.links.len(), 3);
        assert!(page.links[0].in_nav);
        assert_eq!(page.links[2].text, "City hall story");
        assert!(!page.links[2].in_nav);
        assert_eq!(page.feeds.len(), 1);
        assert_eq!(page.feeds[0].as_str(), "https://example.com/feed.xml");
        assert!(
            page.raw_urls
                .iter()
                .any(|u| u.path() == "/news/2024/05/embedded-story")
        );
    }
}
