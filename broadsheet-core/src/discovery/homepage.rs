// Homepage strategy: follow navigation into section pages and collect
// article links from the homepage and those sections

use super::heuristic::{article_likelihood, is_candidate_link};
use super::page::PageLink;
use super::{SourceContext, Strategy, StrategyError};
use crate::model::StrategyKind;
use crate::urls::{is_feed_url, is_same_site, path_segments};
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::debug;
use url::Url;

/// Section names common to news sites.
pub const SECTION_VOCABULARY: &[&str] = &[
    "news", "local", "politics", "business", "sports", "world", "nation", "national", "opinion",
    "entertainment", "lifestyle", "health", "education", "crime", "weather", "community",
    "science", "technology", "economy", "region", "state", "metro", "features",
];

const SECTION_SIMILARITY: f64 = 0.88;
const MIN_ARTICLE_LIKELIHOOD: f64 = 0.3;

/// Closest vocabulary entry for a piece of navigation text, if close enough.
pub fn match_section(text: &str) -> Option<&'static str> {
    let text = text.trim().to_lowercase();
    if text.is_empty() || text.len() > 32 {
        return None;
    }
    SECTION_VOCABULARY
        .iter()
        .map(|word| (*word, strsim::jaro_winkler(&text, word)))
        .filter(|(_, score)| *score >= SECTION_SIMILARITY)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(word, _)| word)
}

/// Navigation-like links whose text or final path segment names a section.
pub fn section_links<'a>(links: &'a [PageLink], host: &str) -> Vec<&'a PageLink> {
    links
        .iter()
        .filter(|link| is_same_site(&link.url, host) && !is_feed_url(&link.url))
        .filter(|link| {
            let segments = path_segments(&link.url);
            let by_segment = segments.len() <= 2
                && segments
                    .last()
                    .is_some_and(|s| match_section(&s.replace(['-', '_'], " ")).is_some());
            let by_text = (link.in_nav || segments.len() <= 1) && match_section(&link.text).is_some();
            by_segment || by_text
        })
        .collect()
}

pub struct HomepageStrategy {
    max_sections: usize,
    max_links: usize,
}

impl HomepageStrategy {
    pub fn new(max_links: usize) -> Self {
        Self {
            max_sections: 3,
            max_links,
        }
    }

    pub fn with_max_sections(mut self, max_sections: usize) -> Self {
        self.max_sections = max_sections;
        self
    }
}

fn collect_articles(
    links: &[PageLink],
    host: &str,
    sections: &HashSet<String>,
    seen: &mut HashSet<String>,
    out: &mut Vec<Url>,
) {
    for link in links {
        if sections.contains(link.url.as_str())
            || !is_candidate_link(&link.url, host)
            || article_likelihood(&link.url) < MIN_ARTICLE_LIKELIHOOD
        {
            continue;
        }
        if seen.insert(link.url.to_string()) {
            out.push(link.url.clone());
        }
    }
}

#[async_trait]
impl Strategy for HomepageStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Homepage
    }

    async fn discover(&self, ctx: &SourceContext) -> Result<Vec<Url>, StrategyError> {
        let homepage = ctx.homepage().await?;
        let sections: Vec<Url> = section_links(&homepage.links, ctx.host())
            .into_iter()
            .map(|link| link.url.clone())
            .collect();
        let section_set: HashSet<String> = sections.iter().map(|u| u.to_string()).collect();

        let mut seen = HashSet::new();
        let mut found = Vec::new();
        collect_articles(&homepage.links, ctx.host(), &section_set, &mut seen, &mut found);

        for section in sections.iter().take(self.max_sections) {
            match ctx.fetch_page(section).await {
                Ok(page) => {
                    collect_articles(&page.links, ctx.host(), &section_set, &mut seen, &mut found)
                }
                Err(e @ StrategyError::Deferred { .. }) => {
                    debug!(section = %section, "Host deferred, stopping section walk");
                    if found.is_empty() {
                        return Err(e);
                    }
                    break;
                }
                Err(e) => debug!(section = %section, error = %e, "Section page unavailable"),
            }
        }

        found.truncate(self.max_links);
        Ok(found)
    }
}
