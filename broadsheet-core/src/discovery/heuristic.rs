// Full-homepage link extraction scored by article-likelihood heuristics

use super::{SourceContext, Strategy, StrategyError};
use crate::model::StrategyKind;
use crate::urls::{is_feed_url, is_non_article, is_same_site, path_segments};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use url::Url;

static DATE_IN_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(19|20)\d{2}/(0?[1-9]|1[0-2])(/|$)|(19|20)\d{2}-\d{2}-\d{2}").unwrap()
});

static NUMERIC_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{5,}").unwrap());

static EMBEDDED_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>\\)]+"#).unwrap());

pub(crate) fn has_date(url: &Url) -> bool {
    DATE_IN_PATH.is_match(url.path())
}

pub(crate) fn has_numeric_id(segment: &str) -> bool {
    NUMERIC_ID.is_match(segment)
}

/// Words in a slug segment, ignoring any file extension.
pub(crate) fn slug_words(segment: &str) -> usize {
    let stem = segment.rsplit_once('.').map_or(segment, |(stem, _)| stem);
    stem.split(['-', '_'])
        .filter(|w| !w.is_empty() && w.chars().any(|c| c.is_ascii_alphabetic()))
        .count()
}

/// Absolute URLs anywhere in the raw markup.
pub fn embedded_urls(body: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    EMBEDDED_URL
        .find_iter(body)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';']).to_string())
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

/// Rough probability that a URL is an article page, from its shape alone.
pub fn article_likelihood(url: &Url) -> f64 {
    let segments = path_segments(url);
    let Some(last) = segments.last() else {
        return 0.0;
    };
    let last = last.to_ascii_lowercase();

    let mut score: f64 = 0.0;
    if has_date(url) {
        score += 0.35;
    }
    let words = slug_words(&last);
    if words >= 3 {
        score += 0.3;
    }
    if has_numeric_id(&last) {
        score += 0.2;
    }
    if [".html", ".htm", ".shtml"].iter().any(|ext| last.ends_with(ext)) {
        score += 0.15;
    }
    if segments.len() >= 2 {
        score += 0.1;
    }
    if segments.len() == 1 && words < 3 {
        score -= 0.2;
    }
    score.clamp(0.0, 1.0)
}

/// True for same-site links worth scoring at all.
pub(crate) fn is_candidate_link(url: &Url, host: &str) -> bool {
    is_same_site(url, host) && !is_feed_url(url) && !is_non_article(url)
}

pub struct HeuristicStrategy {
    threshold: f64,
    max_links: usize,
}

impl HeuristicStrategy {
    pub fn new(max_links: usize) -> Self {
        Self {
            threshold: 0.45,
            max_links,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

#[async_trait]
impl Strategy for HeuristicStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Heuristic
    }

    async fn discover(&self, ctx: &SourceContext) -> Result<Vec<Url>, StrategyError> {
        let page = ctx.homepage().await?;
        let mut seen = HashSet::new();
        let found = page
            .links
            .iter()
            .map(|link| &link.url)
            .chain(page.raw_urls.iter())
            .filter(|url| is_candidate_link(url, ctx.host()))
            .filter(|url| article_likelihood(url) >= self.threshold)
            .filter(|url| seen.insert(url.as_str().to_string()))
            .take(self.max_links)
            .cloned()
            .collect();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_compile() {
        LazyLock::force(&DATE_IN_PATH);
        LazyLock::force(&NUMERIC_ID);
        assert_eq!(
            embedded_urls(r#"<script>var u = "https://example.com/news/a-b-c";</script>"#),
            vec!["https://example.com/news/a-b-c".to_string()]
        );
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_dated_slug_scores_high() {
        let score = article_likelihood(&url(
            "https://example.com/news/2024/05/council-passes-new-budget",
        ));
        assert!(score >= 0.7, "score was {}", score);
    }

    #[test]
    fn test_section_page_scores_low() {
        assert!(article_likelihood(&url("https://example.com/sports")) < 0.1);
        assert_eq!(article_likelihood(&url("https://example.com/")), 0.0);
    }

    #[test]
    fn test_numeric_id_and_extension() {
        let score = article_likelihood(&url("https://example.com/local/story-1234567.html"));
        assert!(score > 0.4, "score was {}", score);
    }

    #[test]
    fn test_slug_words_ignores_extension_and_digits() {
        assert_eq!(slug_words("mayor-wins-race.html"), 3);
        assert_eq!(slug_words("2024-05-01"), 0);
    }

    #[test]
    fn test_embedded_urls() {
        let body = r#"<div data-href="https://example.com/a/b-c-d">x</div>
            <script>{"u":"https://example.com/x/y-z-w"}</script> https://example.com/a/b-c-d."#;
        let urls = embedded_urls(body);
        assert_eq!(
            urls,
            vec![
                "https://example.com/a/b-c-d".to_string(),
                "https://example.com/x/y-z-w".to_string()
            ]
        );
    }
}
