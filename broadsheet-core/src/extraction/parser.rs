// Layered article parser: JSON-LD first, then meta tags, then markup
// heuristics for whatever is still missing

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;

const ARTICLE_TYPES: &[&str] = &[
    "NewsArticle",
    "Article",
    "ReportageNewsArticle",
    "AnalysisNewsArticle",
    "BlogPosting",
    "Report",
];

const BODY_CONTAINERS: &[&str] = &[
    "[itemprop=articleBody]",
    "article",
    "[class*=article-body]",
    "[class*=story-body]",
    "main",
];

const MIN_PARAGRAPH_CHARS: usize = 40;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedArticle {
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub byline: Option<String>,
    pub body: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// Which layers contributed, in order.
    pub sources: Vec<&'static str>,
}

impl ParsedArticle {
    fn absorb(&mut self, other: ParsedArticle, layer: &'static str) {
        let mut used = false;
        if self.title.is_none() && other.title.is_some() {
            self.title = other.title;
            used = true;
        }
        if self.authors.is_empty() && !other.authors.is_empty() {
            self.authors = other.authors;
            used = true;
        }
        if self.byline.is_none() && other.byline.is_some() {
            self.byline = other.byline;
            used = true;
        }
        if self.body.is_none() && other.body.is_some() {
            self.body = other.body;
            used = true;
        }
        if self.published_at.is_none() && other.published_at.is_some() {
            self.published_at = other.published_at;
            used = true;
        }
        if used {
            self.sources.push(layer);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.title.is_some()
            && !self.authors.is_empty()
            && self.body.is_some()
            && self.published_at.is_some()
    }
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn clean(text: &str) -> Option<String> {
    let text = crate::text::normalize_whitespace(text);
    (!text.is_empty()).then_some(text)
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ")
}

/// Accepts RFC 3339, naive date-times and plain dates.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw.get(..10).unwrap_or(raw), "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Strip a leading "By" and split multiple names.
pub fn split_byline(byline: &str) -> Vec<String> {
    let trimmed = byline.trim();
    let trimmed = trimmed
        .strip_prefix("By ")
        .or_else(|| trimmed.strip_prefix("by "))
        .or_else(|| trimmed.strip_prefix("BY "))
        .unwrap_or(trimmed);
    trimmed
        .split([',', '|'])
        .flat_map(|part| part.split(" and "))
        .filter_map(clean)
        .collect()
}

fn is_article_type(value: &Value) -> bool {
    match value.get("@type") {
        Some(Value::String(t)) => ARTICLE_TYPES.contains(&t.as_str()),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(|t| t.as_str())
            .any(|t| ARTICLE_TYPES.contains(&t)),
        _ => false,
    }
}

fn find_article_node(value: &Value) -> Option<&Value> {
    match value {
        Value::Array(items) => items.iter().find_map(find_article_node),
        Value::Object(map) => {
            if is_article_type(value) {
                return Some(value);
            }
            map.get("@graph").and_then(find_article_node)
        }
        _ => None,
    }
}

fn json_ld_authors(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(name)) => split_byline(name),
        Some(Value::Object(map)) => map
            .get("name")
            .and_then(|n| n.as_str())
            .and_then(clean)
            .into_iter()
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .flat_map(|item| json_ld_authors(Some(item)))
            .collect(),
        _ => Vec::new(),
    }
}

fn from_json_ld(document: &Html) -> ParsedArticle {
    let mut parsed = ParsedArticle::default();
    let Some(scripts) = selector(r#"script[type="application/ld+json"]"#) else {
        return parsed;
    };
    for script in document.select(&scripts) {
        let raw = script.text().collect::<String>();
        let Ok(value) = serde_json::from_str::<Value>(raw.trim()) else {
            continue;
        };
        let Some(node) = find_article_node(&value) else {
            continue;
        };
        let candidate = ParsedArticle {
            title: node
                .get("headline")
                .or_else(|| node.get("name"))
                .and_then(|v| v.as_str())
                .and_then(clean),
            authors: json_ld_authors(node.get("author")),
            byline: None,
            body: node.get("articleBody").and_then(|v| v.as_str()).and_then(clean),
            published_at: node
                .get("datePublished")
                .and_then(|v| v.as_str())
                .and_then(parse_date),
            sources: Vec::new(),
        };
        parsed.absorb(candidate, "json_ld");
    }
    parsed
}

fn meta_content(document: &Html, css: &str) -> Option<String> {
    let sel = selector(css)?;
    document
        .select(&sel)
        .find_map(|el| el.value().attr("content").and_then(clean))
}

fn from_meta(document: &Html) -> ParsedArticle {
    let title = meta_content(document, r#"meta[property="og:title"]"#)
        .or_else(|| meta_content(document, r#"meta[name="twitter:title"]"#));
    let author = meta_content(document, r#"meta[name="author"]"#)
        .or_else(|| meta_content(document, r#"meta[property="article:author"]"#))
        .filter(|a| !a.starts_with("http"));
    let published_at = [
        r#"meta[property="article:published_time"]"#,
        r#"meta[name="pubdate"]"#,
        r#"meta[name="publish-date"]"#,
        r#"meta[itemprop="datePublished"]"#,
        r#"meta[name="date"]"#,
    ]
    .iter()
    .find_map(|css| meta_content(document, css).and_then(|raw| parse_date(&raw)));

    ParsedArticle {
        title,
        authors: author.as_deref().map(split_byline).unwrap_or_default(),
        byline: author,
        body: None,
        published_at,
        sources: Vec::new(),
    }
}

fn paragraphs_in(scope: ElementRef<'_>, paragraph: &Selector) -> Vec<String> {
    scope
        .select(paragraph)
        .filter_map(|p| clean(&element_text(p)))
        .filter(|p| p.chars().count() >= MIN_PARAGRAPH_CHARS)
        .collect()
}

fn from_markup(document: &Html) -> ParsedArticle {
    let title = selector("h1")
        .and_then(|sel| document.select(&sel).find_map(|h| clean(&element_text(h))))
        .or_else(|| {
            selector("title")
                .and_then(|sel| document.select(&sel).find_map(|t| clean(&element_text(t))))
        });

    let byline = selector(r#"[rel="author"], [class*=byline], [itemprop="author"]"#).and_then(|sel| {
        document
            .select(&sel)
            .find_map(|el| clean(&element_text(el)))
    });

    let published_at = selector("time[datetime]").and_then(|sel| {
        document
            .select(&sel)
            .find_map(|t| t.value().attr("datetime").and_then(parse_date))
    });

    let mut body = None;
    if let Some(paragraph) = selector("p") {
        for container in BODY_CONTAINERS {
            let Some(sel) = selector(container) else {
                continue;
            };
            let found: Vec<String> = document
                .select(&sel)
                .flat_map(|scope| paragraphs_in(scope, &paragraph))
                .collect();
            if !found.is_empty() {
                body = Some(found.join("\n\n"));
                break;
            }
        }
        if body.is_none() {
            let found = paragraphs_in(document.root_element(), &paragraph);
            if !found.is_empty() {
                body = Some(found.join("\n\n"));
            }
        }
    }

    ParsedArticle {
        title,
        authors: byline.as_deref().map(split_byline).unwrap_or_default(),
        byline,
        body,
        published_at,
        sources: Vec::new(),
    }
}

/// Parse an article page. Every field is best effort.
pub fn parse_article(html: &str) -> ParsedArticle {
    let document = Html::parse_document(html);
    let mut parsed = from_json_ld(&document);
    if !parsed.is_complete() {
        parsed.absorb(from_meta(&document), "meta");
    }
    if !parsed.is_complete() {
        parsed.absorb(from_markup(&document), "markup");
    }
    parsed
}
