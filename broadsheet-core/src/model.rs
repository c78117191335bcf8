use crate::db::SqlValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub fn current_timestamp() -> i64 {
    Utc::now().timestamp()
}

pub fn from_timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Lifecycle of a discovered URL.
///
/// `discovered → {article, dead, paused}`, `article → {extracted, dead, paused}`.
/// The remaining states are terminal for automated paths; only an
/// administrative reset moves a link back to `discovered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Discovered,
    Article,
    Extracted,
    Dead,
    Paused,
}

impl CandidateStatus {
    pub const ALL: [CandidateStatus; 5] = [
        CandidateStatus::Discovered,
        CandidateStatus::Article,
        CandidateStatus::Extracted,
        CandidateStatus::Dead,
        CandidateStatus::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::Discovered => "discovered",
            CandidateStatus::Article => "article",
            CandidateStatus::Extracted => "extracted",
            CandidateStatus::Dead => "dead",
            CandidateStatus::Paused => "paused",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// States from which an automated transition may reach `self`.
    pub fn predecessors(&self) -> &'static [CandidateStatus] {
        match self {
            CandidateStatus::Discovered => &[],
            CandidateStatus::Article => &[CandidateStatus::Discovered],
            CandidateStatus::Extracted => &[CandidateStatus::Article],
            CandidateStatus::Dead | CandidateStatus::Paused => {
                &[CandidateStatus::Discovered, CandidateStatus::Article]
            }
        }
    }

    pub fn can_transition_to(&self, next: CandidateStatus) -> bool {
        next.predecessors().contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CandidateStatus::Extracted | CandidateStatus::Dead | CandidateStatus::Paused
        )
    }
}

impl fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleStatus {
    Extracted,
    Cleaned,
    Classified,
    Paused,
}

impl ArticleStatus {
    pub const ALL: [ArticleStatus; 4] = [
        ArticleStatus::Extracted,
        ArticleStatus::Cleaned,
        ArticleStatus::Classified,
        ArticleStatus::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArticleStatus::Extracted => "extracted",
            ArticleStatus::Cleaned => "cleaned",
            ArticleStatus::Classified => "classified",
            ArticleStatus::Paused => "paused",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    pub fn predecessors(&self) -> &'static [ArticleStatus] {
        match self {
            ArticleStatus::Extracted => &[],
            ArticleStatus::Cleaned => &[ArticleStatus::Extracted],
            ArticleStatus::Classified => &[ArticleStatus::Cleaned],
            ArticleStatus::Paused => &[ArticleStatus::Extracted, ArticleStatus::Cleaned],
        }
    }

    pub fn can_transition_to(&self, next: ArticleStatus) -> bool {
        next.predecessors().contains(self)
    }
}

impl fmt::Display for ArticleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a candidate ended up `dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadReason {
    NotFound,
    DuplicateUrl,
    DuplicateContent,
    MaxRetries,
    ClientError,
}

impl DeadReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadReason::NotFound => "not_found",
            DeadReason::DuplicateUrl => "duplicate_url",
            DeadReason::DuplicateContent => "duplicate_content",
            DeadReason::MaxRetries => "max_retries",
            DeadReason::ClientError => "client_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Expired,
    NullText,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::Expired => "expired",
            PauseReason::NullText => "null_text",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Active,
    Disabled,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Active => "active",
            SourceStatus::Disabled => "disabled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SourceStatus::Active),
            "disabled" => Some(SourceStatus::Disabled),
            _ => None,
        }
    }
}

/// Discovery strategy tag stored on every candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Feed,
    Homepage,
    Heuristic,
    Classifier,
    Pattern,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::Feed,
        StrategyKind::Homepage,
        StrategyKind::Heuristic,
        StrategyKind::Classifier,
        StrategyKind::Pattern,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Feed => "feed",
            StrategyKind::Homepage => "homepage",
            StrategyKind::Heuristic => "heuristic",
            StrategyKind::Classifier => "classifier",
            StrategyKind::Pattern => "pattern",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// Default processing priority of links found by this strategy. Higher
    /// is processed first.
    pub fn priority(&self) -> i64 {
        match self {
            StrategyKind::Feed => 100,
            StrategyKind::Homepage => 80,
            StrategyKind::Pattern => 60,
            StrategyKind::Classifier => 50,
            StrategyKind::Heuristic => 30,
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dataset {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub isolated: bool,
    pub created_at: DateTime<Utc>,
}

/// Which records a pipeline run may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatasetScope {
    /// Production records: dataset 0 plus every non-isolated dataset.
    #[default]
    Default,
    Dataset(i64),
}

impl DatasetScope {
    /// SQL predicate restricting `column` to this scope, with its parameters.
    pub fn clause(&self, column: &str) -> (String, Vec<SqlValue>) {
        match self {
            DatasetScope::Default => (
                format!(
                    "({col} = 0 OR {col} IN (SELECT id FROM datasets WHERE isolated = 0))",
                    col = column
                ),
                Vec::new(),
            ),
            DatasetScope::Dataset(id) => (format!("{} = ?", column), vec![SqlValue::from(*id)]),
        }
    }

    /// Dataset id new records are written into.
    pub fn write_id(&self) -> i64 {
        match self {
            DatasetScope::Default => 0,
            DatasetScope::Dataset(id) => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub id: i64,
    pub dataset_id: i64,
    pub host: String,
    pub name: String,
    pub base_url: String,
    pub status: SourceStatus,
    pub feeds: Vec<String>,
    pub discovery_frequency_hours: i64,
    pub last_discovery_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Source {
    pub fn homepage(&self) -> Option<url::Url> {
        url::Url::parse(&self.base_url).ok()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_discovery_at {
            None => true,
            // A frequency too large to represent is never due
            Some(last) => chrono::Duration::try_hours(self.discovery_frequency_hours)
                .is_some_and(|frequency| now - last >= frequency),
        }
    }
}

/// Operator-supplied source definition.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSource {
    pub host: String,
    pub name: String,
    pub base_url: String,
    pub feeds: Vec<String>,
    pub discovery_frequency_hours: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCandidate {
    pub url: String,
    pub normalized_url: String,
    pub discovered_by: StrategyKind,
    pub priority: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateLink {
    pub id: i64,
    pub dataset_id: i64,
    pub source_id: i64,
    pub url: String,
    pub normalized_url: String,
    pub discovered_by: StrategyKind,
    pub priority: i64,
    pub status: CandidateStatus,
    pub status_reason: Option<String>,
    pub retry_count: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub page_hash: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewArticle {
    pub candidate_link_id: i64,
    pub dataset_id: i64,
    pub source_id: i64,
    pub url: String,
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub body: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
    pub wire_services: Vec<String>,
    pub status: ArticleStatus,
    pub status_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Article {
    pub id: i64,
    pub candidate_link_id: i64,
    pub dataset_id: i64,
    pub source_id: i64,
    pub url: String,
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub body: Option<String>,
    pub cleaned_text: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
    pub wire_services: Vec<String>,
    pub status: ArticleStatus,
    pub status_reason: Option<String>,
    pub primary_label: Option<String>,
    pub primary_confidence: Option<f64>,
    pub secondary_label: Option<String>,
    pub secondary_confidence: Option<f64>,
    pub extracted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Output of the external text classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub primary_label: String,
    pub primary_confidence: f64,
    pub secondary_label: Option<String>,
    pub secondary_confidence: Option<f64>,
}

/// A place matched by the gazetteer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceEntity {
    pub name: String,
    pub kind: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub confidence: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_graph_is_forward_only() {
        use CandidateStatus::*;
        assert!(Discovered.can_transition_to(Article));
        assert!(Article.can_transition_to(Extracted));
        assert!(Discovered.can_transition_to(Dead));
        assert!(Article.can_transition_to(Paused));

        assert!(!Article.can_transition_to(Discovered));
        assert!(!Extracted.can_transition_to(Article));
        assert!(!Dead.can_transition_to(Article));
        assert!(!Paused.can_transition_to(Discovered));
        assert!(!Discovered.can_transition_to(Extracted));
    }

    #[test]
    fn test_article_graph() {
        use ArticleStatus::*;
        assert!(Extracted.can_transition_to(Cleaned));
        assert!(Cleaned.can_transition_to(Classified));
        assert!(Extracted.can_transition_to(Paused));
        assert!(!Classified.can_transition_to(Cleaned));
        assert!(!Paused.can_transition_to(Extracted));
    }

    #[test]
    fn test_status_strings_parse_back() {
        for status in CandidateStatus::ALL {
            assert_eq!(CandidateStatus::parse(status.as_str()), Some(status));
        }
        for status in ArticleStatus::ALL {
            assert_eq!(ArticleStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CandidateStatus::parse("verified"), None);
    }

    #[test]
    fn test_scope_clause() {
        let (sql, params) = DatasetScope::Default.clause("c.dataset_id");
        assert!(sql.contains("c.dataset_id = 0"));
        assert!(sql.contains("isolated = 0"));
        assert!(params.is_empty());

        let (sql, params) = DatasetScope::Dataset(4).clause("dataset_id");
        assert_eq!(sql, "dataset_id = ?");
        assert_eq!(params, vec![SqlValue::from(4i64)]);
    }

    #[test]
    fn test_source_due() {
        let now = Utc::now();
        let mut source = Source {
            id: 1,
            dataset_id: 0,
            host: "example.com".into(),
            name: "Example".into(),
            base_url: "https://example.com/".into(),
            status: SourceStatus::Active,
            feeds: vec![],
            discovery_frequency_hours: 24,
            last_discovery_at: None,
            created_at: now,
        };
        assert!(source.is_due(now));
        source.last_discovery_at = Some(now - chrono::Duration::hours(2));
        assert!(!source.is_due(now));
        source.last_discovery_at = Some(now - chrono::Duration::hours(25));
        assert!(source.is_due(now));
        source.discovery_frequency_hours = i64::MAX;
        assert!(!source.is_due(now));
    }
}
