// Pattern learning: infer path templates from a source's known article URLs
// and propose unseen links that fit them

use super::heuristic::{has_numeric_id, is_candidate_link, slug_words};
use super::{SourceContext, Strategy, StrategyError};
use crate::model::StrategyKind;
use crate::urls::{is_same_site, normalize_url, path_segments};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Literal(String),
    Year,
    Number,
    Slug,
}

impl Segment {
    fn classify(segment: &str) -> Self {
        let lower = segment.to_ascii_lowercase();
        let stem = lower.rsplit_once('.').map_or(lower.as_str(), |(stem, _)| stem);
        if stem.len() == 4
            && stem.chars().all(|c| c.is_ascii_digit())
            && (stem.starts_with("19") || stem.starts_with("20"))
        {
            Segment::Year
        } else if !stem.is_empty() && stem.chars().all(|c| c.is_ascii_digit()) {
            Segment::Number
        } else if slug_words(stem) >= 2 || has_numeric_id(stem) {
            Segment::Slug
        } else {
            Segment::Literal(lower)
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Literal(s) => f.write_str(s),
            Segment::Year => f.write_str("{year}"),
            Segment::Number => f.write_str("{n}"),
            Segment::Slug => f.write_str("{slug}"),
        }
    }
}

/// A path shape such as `/news/{year}/{n}/{slug}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathPattern {
    pub segments: Vec<Segment>,
}

impl PathPattern {
    pub fn of(url: &Url) -> Option<Self> {
        let segments: Vec<Segment> = path_segments(url)
            .iter()
            .map(|s| Segment::classify(s))
            .collect();
        // A pattern without a variable part would only ever match one URL
        segments
            .iter()
            .any(|s| !matches!(s, Segment::Literal(_)))
            .then_some(Self { segments })
    }

    pub fn matches(&self, url: &Url) -> bool {
        PathPattern::of(url).is_some_and(|other| other == *self)
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Path of the listing page that most likely links to siblings: the
    /// leading literal segments.
    pub fn listing_path(&self) -> Option<String> {
        let literals: Vec<&str> = self
            .segments
            .iter()
            .map_while(|s| match s {
                Segment::Literal(l) => Some(l.as_str()),
                _ => None,
            })
            .collect();
        (!literals.is_empty()).then(|| format!("/{}", literals.join("/")))
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

/// Patterns shared by at least `min_frequency` known URLs on `host`, no
/// deeper than `max_depth`, most frequent first.
pub fn learn_patterns(
    known: &[Url],
    host: &str,
    min_frequency: usize,
    max_depth: usize,
) -> Vec<(PathPattern, usize)> {
    let mut counts: HashMap<PathPattern, usize> = HashMap::new();
    for url in known.iter().filter(|u| is_same_site(u, host)) {
        if let Some(pattern) = PathPattern::of(url)
            && pattern.depth() <= max_depth
        {
            *counts.entry(pattern).or_default() += 1;
        }
    }
    let mut learned: Vec<(PathPattern, usize)> = counts
        .into_iter()
        .filter(|(_, n)| *n >= min_frequency.max(1))
        .collect();
    learned.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.to_string().cmp(&b.0.to_string())));
    learned
}

/// Distinct listing paths in pattern order.
pub fn listing_paths(patterns: &[PathPattern]) -> Vec<String> {
    let mut seen = HashSet::new();
    patterns
        .iter()
        .filter_map(|p| p.listing_path())
        .filter(|path| seen.insert(path.clone()))
        .collect()
}

pub struct PatternStrategy {
    min_frequency: usize,
    max_depth: usize,
    max_listing_pages: usize,
    max_links: usize,
}

impl PatternStrategy {
    pub fn new(min_frequency: usize, max_depth: usize, max_links: usize) -> Self {
        Self {
            min_frequency,
            max_depth,
            max_listing_pages: 3,
            max_links,
        }
    }
}

#[async_trait]
impl Strategy for PatternStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Pattern
    }

    async fn discover(&self, ctx: &SourceContext) -> Result<Vec<Url>, StrategyError> {
        let patterns: Vec<PathPattern> =
            learn_patterns(&ctx.known_urls, ctx.host(), self.min_frequency, self.max_depth)
                .into_iter()
                .map(|(pattern, _)| pattern)
                .collect();
        if patterns.is_empty() {
            debug!(host = %ctx.host(), known = ctx.known_urls.len(), "No path patterns learned");
            return Ok(Vec::new());
        }
        debug!(
            host = %ctx.host(),
            patterns = %patterns.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(" "),
            "Learned path patterns"
        );

        let known: HashSet<String> = ctx
            .known_urls
            .iter()
            .filter_map(|u| normalize_url(u.as_str()))
            .collect();

        let mut pages = vec![ctx.homepage().await?];
        for listing in listing_paths(&patterns).into_iter().take(self.max_listing_pages) {
            let Ok(listing_url) = ctx.base_url.join(&listing) else {
                continue;
            };
            match ctx.fetch_page(&listing_url).await {
                Ok(page) => pages.push(std::sync::Arc::new(page)),
                Err(StrategyError::Deferred { .. }) => break,
                Err(e) => debug!(listing = %listing_url, error = %e, "Listing page unavailable"),
            }
        }

        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for page in &pages {
            for url in page.links.iter().map(|l| &l.url).chain(page.raw_urls.iter()) {
                if !is_candidate_link(url, ctx.host()) || !patterns.iter().any(|p| p.matches(url)) {
                    continue;
                }
                let Some(normalized) = normalize_url(url.as_str()) else {
                    continue;
                };
                if known.contains(&normalized) || !seen.insert(normalized) {
                    continue;
                }
                found.push(url.clone());
            }
        }
        found.truncate(self.max_links);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(list: &[&str]) -> Vec<Url> {
        list.iter().map(|u| Url::parse(u).unwrap()).collect()
    }

    #[test]
    fn test_segment_classification() {
        assert_eq!(Segment::classify("2024"), Segment::Year);
        assert_eq!(Segment::classify("05"), Segment::Number);
        assert_eq!(Segment::classify("mayor-wins-race.html"), Segment::Slug);
        assert_eq!(Segment::classify("story-1234567"), Segment::Slug);
        assert_eq!(Segment::classify("News"), Segment::Literal("news".into()));
    }

    #[test]
    fn test_learn_patterns_threshold_and_depth() {
        let known = urls(&[
            "https://example.com/news/2024/council-votes-yes",
            "https://example.com/news/2024/school-board-meets",
            "https://example.com/news/2023/bridge-finally-opens",
            "https://example.com/sports/2024/team-wins-title",
            "https://example.com/a/b/c/d/e/very-deep-story",
            "https://example.com/a/b/c/d/e/another-deep-story",
            "https://example.com/a/b/c/d/e/third-deep-story",
        ]);
        let learned = learn_patterns(&known, "example.com", 3, 4);
        assert_eq!(learned.len(), 1);
        assert_eq!(learned[0].0.to_string(), "/news/{year}/{slug}");
        assert_eq!(learned[0].1, 3);
        assert_eq!(learned[0].0.listing_path().as_deref(), Some("/news"));
    }

    #[test]
    fn test_pattern_matches_siblings_only() {
        let pattern = PathPattern::of(&Url::parse("https://example.com/news/2024/a-b-c").unwrap())
            .unwrap();
        assert!(pattern.matches(&Url::parse("https://example.com/news/2025/new-story-here").unwrap()));
        assert!(!pattern.matches(&Url::parse("https://example.com/news/new-story-here").unwrap()));
        assert!(!pattern.matches(&Url::parse("https://example.com/sports/2025/x-y").unwrap()));
    }

    #[test]
    fn test_listing_paths_are_distinct() {
        let patterns: Vec<PathPattern> = urls(&[
            "https://example.com/news/2024/council-votes-yes",
            "https://example.com/sports/2024/team-wins-title",
            "https://example.com/news/2023/05/bridge-finally-opens",
            "https://example.com/2024/05/undated-section-story",
        ])
        .iter()
        .filter_map(PathPattern::of)
        .collect();
        assert_eq!(patterns.len(), 4);
        assert_eq!(listing_paths(&patterns), vec!["/news".to_string(), "/sports".to_string()]);
    }

    #[test]
    fn test_all_literal_paths_have_no_pattern() {
        assert!(PathPattern::of(&Url::parse("https://example.com/about/contact").unwrap()).is_none());
    }
}
