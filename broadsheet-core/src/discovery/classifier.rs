// URL classifier strategy. The model is a capability behind `UrlClassifier`;
// the bundled one is a small logistic model over lexical URL features.

use super::heuristic::{has_date, has_numeric_id, is_candidate_link, slug_words};
use super::homepage::match_section;
use super::{SourceContext, Strategy, StrategyError};
use crate::error::{PipelineError, Result};
use crate::model::StrategyKind;
use crate::urls::path_segments;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use url::Url;

/// Where a link was found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkContext {
    pub anchor_text: String,
    pub in_nav: bool,
    pub source_host: String,
}

/// Scores a link for "looks like an article", in `0.0..=1.0`.
pub trait UrlClassifier: Send + Sync {
    fn score(&self, url: &Url, context: &LinkContext) -> f64;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LexicalWeights {
    pub bias: f64,
    pub path_depth: f64,
    pub date_in_path: f64,
    pub slug_word: f64,
    pub numeric_id: f64,
    pub html_extension: f64,
    pub anchor_word: f64,
    pub in_nav: f64,
    pub has_query: f64,
    pub section_name: f64,
}

impl Default for LexicalWeights {
    fn default() -> Self {
        Self {
            bias: -2.0,
            path_depth: 0.3,
            date_in_path: 1.8,
            slug_word: 0.35,
            numeric_id: 1.2,
            html_extension: 0.8,
            anchor_word: 0.15,
            in_nav: -1.5,
            has_query: -0.5,
            section_name: -1.5,
        }
    }
}

/// Logistic regression over hand-picked URL features. Weights can be
/// retrained offline and loaded from JSON.
#[derive(Debug, Clone, Default)]
pub struct LexicalUrlModel {
    weights: LexicalWeights,
}

impl LexicalUrlModel {
    pub fn new(weights: LexicalWeights) -> Self {
        Self { weights }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw).map_err(|e| {
            PipelineError::InvalidConfig(format!("classifier weights {}: {}", path.display(), e))
        })
    }

    pub fn weights(&self) -> &LexicalWeights {
        &self.weights
    }
}

impl UrlClassifier for LexicalUrlModel {
    fn score(&self, url: &Url, context: &LinkContext) -> f64 {
        let w = &self.weights;
        let segments = path_segments(url);
        let last = segments
            .last()
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default();
        let anchor_words = context.anchor_text.split_whitespace().count().min(12);
        let is_section = !last.is_empty() && match_section(&last.replace(['-', '_'], " ")).is_some();

        let mut z = w.bias;
        z += w.path_depth * segments.len().min(5) as f64;
        z += w.slug_word * slug_words(&last).min(10) as f64;
        z += w.anchor_word * anchor_words as f64;
        if has_date(url) {
            z += w.date_in_path;
        }
        if has_numeric_id(&last) {
            z += w.numeric_id;
        }
        if [".html", ".htm", ".shtml"].iter().any(|ext| last.ends_with(ext)) {
            z += w.html_extension;
        }
        if context.in_nav {
            z += w.in_nav;
        }
        if url.query().is_some() {
            z += w.has_query;
        }
        if is_section {
            z += w.section_name;
        }
        1.0 / (1.0 + (-z).exp())
    }
}

pub struct ClassifierStrategy {
    classifier: Arc<dyn UrlClassifier>,
    threshold: f64,
    max_links: usize,
}

impl ClassifierStrategy {
    pub fn new(classifier: Arc<dyn UrlClassifier>, threshold: f64, max_links: usize) -> Self {
        Self {
            classifier,
            threshold,
            max_links,
        }
    }
}

#[async_trait]
impl Strategy for ClassifierStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Classifier
    }

    async fn discover(&self, ctx: &SourceContext) -> std::result::Result<Vec<Url>, StrategyError> {
        let page = ctx.homepage().await?;
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for link in &page.links {
            if !is_candidate_link(&link.url, ctx.host()) || !seen.insert(link.url.to_string()) {
                continue;
            }
            let context = LinkContext {
                anchor_text: link.text.clone(),
                in_nav: link.in_nav,
                source_host: ctx.host().to_string(),
            };
            if self.classifier.score(&link.url, &context) >= self.threshold {
                found.push(link.url.clone());
                if found.len() >= self.max_links {
                    break;
                }
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(model: &LexicalUrlModel, url: &str, text: &str, in_nav: bool) -> f64 {
        model.score(
            &Url::parse(url).unwrap(),
            &LinkContext {
                anchor_text: text.to_string(),
                in_nav,
                source_host: "example.com".to_string(),
            },
        )
    }

    #[test]
    fn test_article_outscores_section() {
        let model = LexicalUrlModel::default();
        let article = score(
            &model,
            "https://example.com/news/local-council-approves-budget",
            "Local council approves budget",
            false,
        );
        let section = score(&model, "https://example.com/sports", "Sports", true);
        assert!(article > 0.5, "article scored {}", article);
        assert!(section < 0.1, "section scored {}", section);
    }

    #[test]
    fn test_weights_from_json_fill_defaults() {
        let model = LexicalUrlModel::from_json(r#"{"bias": -10.0}"#).unwrap();
        assert_eq!(model.weights().bias, -10.0);
        assert_eq!(model.weights().date_in_path, 1.8);
        let low = score(&model, "https://example.com/news/a-b-c", "a b c", false);
        assert!(low < 0.01);
    }

    #[test]
    fn test_bad_weights_rejected() {
        assert!(LexicalUrlModel::from_json("{\"bias\": \"high\"}").is_err());
    }
}
