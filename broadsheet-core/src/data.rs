use crate::db::{self, Backend, Dialect, SqlRow, SqlValue};
use crate::error::{StoreError, StoreResult};
use crate::model::{
    Article, ArticleStatus, CandidateLink, CandidateStatus, Classification, Dataset,
    DatasetScope, NewArticle, NewCandidate, NewSource, PlaceEntity, Source, SourceStatus, StrategyKind,
    current_timestamp, from_timestamp,
};
use crate::sql_args;
use serde::Serialize;
use std::sync::Arc;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS datasets (
    id {auto_id},
    slug TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    isolated BIGINT NOT NULL DEFAULT 1,
    created_at BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS sources (
    id {auto_id},
    dataset_id BIGINT NOT NULL DEFAULT 0,
    host TEXT NOT NULL,
    name TEXT NOT NULL,
    base_url TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active', 'disabled')),
    feeds TEXT NOT NULL DEFAULT '[]',        -- JSON array of feed URLs
    discovery_frequency_hours BIGINT NOT NULL DEFAULT 24,
    last_discovery_at BIGINT,
    created_at BIGINT NOT NULL,
    UNIQUE(dataset_id, host)
);

CREATE INDEX IF NOT EXISTS idx_sources_dataset ON sources(dataset_id);

CREATE TABLE IF NOT EXISTS candidate_links (
    id {auto_id},
    dataset_id BIGINT NOT NULL DEFAULT 0,
    source_id BIGINT NOT NULL REFERENCES sources(id),
    url TEXT NOT NULL,
    normalized_url TEXT NOT NULL,
    discovered_by TEXT NOT NULL,
    priority BIGINT NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'discovered' CHECK(status IN (
        'discovered', 'article', 'extracted', 'dead', 'paused'
    )),
    status_reason TEXT,
    retry_count BIGINT NOT NULL DEFAULT 0,
    last_attempt_at BIGINT,
    last_error TEXT,
    page_hash TEXT,                          -- SHA-256 of the verified page text
    discovered_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    UNIQUE(dataset_id, normalized_url)
);

CREATE INDEX IF NOT EXISTS idx_candidates_status ON candidate_links(status);
CREATE INDEX IF NOT EXISTS idx_candidates_source ON candidate_links(source_id);
CREATE INDEX IF NOT EXISTS idx_candidates_page_hash ON candidate_links(page_hash);

CREATE TABLE IF NOT EXISTS articles (
    id {auto_id},
    candidate_link_id BIGINT NOT NULL REFERENCES candidate_links(id),
    dataset_id BIGINT NOT NULL DEFAULT 0,
    source_id BIGINT NOT NULL REFERENCES sources(id),
    url TEXT NOT NULL,
    title TEXT,
    authors TEXT NOT NULL DEFAULT '[]',       -- JSON array
    body TEXT,
    cleaned_text TEXT,
    published_at BIGINT,
    content_hash TEXT,
    wire_services TEXT NOT NULL DEFAULT '[]', -- JSON array
    status TEXT NOT NULL DEFAULT 'extracted' CHECK(status IN (
        'extracted', 'cleaned', 'classified', 'paused'
    )),
    status_reason TEXT,
    primary_label TEXT,
    primary_confidence DOUBLE PRECISION,
    secondary_label TEXT,
    secondary_confidence DOUBLE PRECISION,
    extracted_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    UNIQUE(candidate_link_id),
    UNIQUE(dataset_id, content_hash)
);

CREATE INDEX IF NOT EXISTS idx_articles_status ON articles(status);
CREATE INDEX IF NOT EXISTS idx_articles_source ON articles(source_id);

CREATE TABLE IF NOT EXISTS article_entities (
    id {auto_id},
    article_id BIGINT NOT NULL REFERENCES articles(id),
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    latitude DOUBLE PRECISION,
    longitude DOUBLE PRECISION,
    confidence DOUBLE PRECISION,
    created_at BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_article ON article_entities(article_id);
";

const SOURCE_COLUMNS: &str = "id, dataset_id, host, name, base_url, status, feeds, \
    discovery_frequency_hours, last_discovery_at, created_at";

const CANDIDATE_COLUMNS: &str = "id, dataset_id, source_id, url, normalized_url, discovered_by, \
    priority, status, status_reason, retry_count, last_attempt_at, last_error, page_hash, \
    discovered_at, updated_at";

const ARTICLE_COLUMNS: &str = "id, candidate_link_id, dataset_id, source_id, url, title, authors, \
    body, cleaned_text, published_at, content_hash, wire_services, status, status_reason, \
    primary_label, primary_confidence, secondary_label, secondary_confidence, extracted_at, \
    updated_at";

/// One `(source, status) → count` cell of the status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusCount {
    pub source: String,
    pub status: String,
    pub count: i64,
}

/// Repository over the pipeline tables. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    backend: Arc<dyn Backend>,
}

fn status_list<T, F>(statuses: &[T], name: F) -> String
where
    F: Fn(&T) -> &'static str,
{
    statuses
        .iter()
        .map(|s| format!("'{}'", name(s)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn json_list(value: Option<String>, column: &str) -> StoreResult<Vec<String>> {
    match value {
        None => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(&raw).map_err(|_| StoreError::Corrupt {
            column: column.to_string(),
            value: raw,
        }),
    }
}

fn to_json_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

impl Database {
    /// Connect using a database URL and make sure the schema exists.
    pub async fn open(url: &str) -> StoreResult<Self> {
        let backend = db::connect(url).await?;
        let database = Self::new(backend);
        database.init_schema().await?;
        Ok(database)
    }

    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    pub fn dialect(&self) -> Dialect {
        self.backend.dialect()
    }

    pub async fn init_schema(&self) -> StoreResult<()> {
        self.backend
            .execute_batch(&self.dialect().render_ddl(SCHEMA))
            .await
    }

    // Datasets

    pub async fn create_dataset(&self, slug: &str, name: &str, isolated: bool) -> StoreResult<i64> {
        let row = self
            .backend
            .query_one(
                "INSERT INTO datasets (slug, name, isolated, created_at) VALUES (?, ?, ?, ?)
                 ON CONFLICT(slug) DO UPDATE SET name = excluded.name, isolated = excluded.isolated
                 RETURNING id",
                &sql_args![slug, name, isolated, current_timestamp()],
            )
            .await?;
        row.ok_or_else(|| StoreError::Column {
            column: "id".to_string(),
            expected: "returned id",
        })?
        .int("id")
    }

    pub async fn dataset_by_slug(&self, slug: &str) -> StoreResult<Option<Dataset>> {
        let row = self
            .backend
            .query_one(
                "SELECT id, slug, name, isolated, created_at FROM datasets WHERE slug = ?",
                &sql_args![slug],
            )
            .await?;
        row.map(|r| dataset_from_row(&r)).transpose()
    }

    pub async fn list_datasets(&self) -> StoreResult<Vec<Dataset>> {
        let rows = self
            .backend
            .query(
                "SELECT id, slug, name, isolated, created_at FROM datasets ORDER BY slug",
                &[],
            )
            .await?;
        rows.iter().map(dataset_from_row).collect()
    }

    // Sources

    /// Insert a source or refresh the name, homepage and feeds of an existing one.
    pub async fn upsert_source(&self, dataset_id: i64, source: &NewSource) -> StoreResult<i64> {
        let row = self
            .backend
            .query_one(
                "INSERT INTO sources
                    (dataset_id, host, name, base_url, feeds, discovery_frequency_hours, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(dataset_id, host) DO UPDATE
                 SET name = excluded.name, base_url = excluded.base_url, feeds = excluded.feeds,
                     discovery_frequency_hours = excluded.discovery_frequency_hours
                 RETURNING id",
                &sql_args![
                    dataset_id,
                    source.host.as_str(),
                    source.name.as_str(),
                    source.base_url.as_str(),
                    to_json_list(&source.feeds),
                    source.discovery_frequency_hours,
                    current_timestamp()
                ],
            )
            .await?;
        row.ok_or_else(|| StoreError::Column {
            column: "id".to_string(),
            expected: "returned id",
        })?
        .int("id")
    }

    pub async fn get_source(&self, id: i64) -> StoreResult<Option<Source>> {
        let sql = format!("SELECT {} FROM sources WHERE id = ?", SOURCE_COLUMNS);
        let row = self.backend.query_one(&sql, &sql_args![id]).await?;
        row.map(|r| source_from_row(&r)).transpose()
    }

    pub async fn source_by_host(&self, dataset_id: i64, host: &str) -> StoreResult<Option<Source>> {
        let sql = format!(
            "SELECT {} FROM sources WHERE dataset_id = ? AND host = ?",
            SOURCE_COLUMNS
        );
        let row = self
            .backend
            .query_one(&sql, &sql_args![dataset_id, host])
            .await?;
        row.map(|r| source_from_row(&r)).transpose()
    }

    pub async fn list_sources(
        &self,
        scope: DatasetScope,
        include_disabled: bool,
    ) -> StoreResult<Vec<Source>> {
        let (clause, params) = scope.clause("dataset_id");
        let status_filter = if include_disabled {
            ""
        } else {
            " AND status = 'active'"
        };
        let sql = format!(
            "SELECT {} FROM sources WHERE {}{} ORDER BY host",
            SOURCE_COLUMNS, clause, status_filter
        );
        let rows = self.backend.query(&sql, &params).await?;
        rows.iter().map(source_from_row).collect()
    }

    /// Soft enable/disable. Returns false when no such source exists.
    pub async fn set_source_status(
        &self,
        dataset_id: i64,
        host: &str,
        status: SourceStatus,
    ) -> StoreResult<bool> {
        let changed = self
            .backend
            .execute(
                "UPDATE sources SET status = ? WHERE dataset_id = ? AND host = ?",
                &sql_args![status.as_str(), dataset_id, host],
            )
            .await?;
        Ok(changed > 0)
    }

    pub async fn mark_source_discovered(&self, source_id: i64) -> StoreResult<()> {
        self.backend
            .execute(
                "UPDATE sources SET last_discovery_at = ? WHERE id = ?",
                &sql_args![current_timestamp(), source_id],
            )
            .await?;
        Ok(())
    }

    // Candidate links

    /// Insert a candidate. `None` means the normalized URL already exists in
    /// the dataset; that is not an error.
    pub async fn insert_candidate(
        &self,
        source: &Source,
        candidate: &NewCandidate,
    ) -> StoreResult<Option<i64>> {
        let now = current_timestamp();
        let row = self
            .backend
            .query_one(
                "INSERT INTO candidate_links (
                    dataset_id, source_id, url, normalized_url, discovered_by, priority,
                    status, discovered_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, 'discovered', ?, ?)
                ON CONFLICT DO NOTHING
                RETURNING id",
                &sql_args![
                    source.dataset_id,
                    source.id,
                    candidate.url.as_str(),
                    candidate.normalized_url.as_str(),
                    candidate.discovered_by.as_str(),
                    candidate.priority,
                    now,
                    now
                ],
            )
            .await?;
        row.map(|r| r.int("id")).transpose()
    }

    pub async fn get_candidate(&self, id: i64) -> StoreResult<Option<CandidateLink>> {
        let sql = format!("SELECT {} FROM candidate_links WHERE id = ?", CANDIDATE_COLUMNS);
        let row = self.backend.query_one(&sql, &sql_args![id]).await?;
        row.map(|r| candidate_from_row(&r)).transpose()
    }

    pub async fn candidate_by_normalized_url(
        &self,
        dataset_id: i64,
        normalized_url: &str,
    ) -> StoreResult<Option<CandidateLink>> {
        let sql = format!(
            "SELECT {} FROM candidate_links WHERE dataset_id = ? AND normalized_url = ?",
            CANDIDATE_COLUMNS
        );
        let row = self
            .backend
            .query_one(&sql, &sql_args![dataset_id, normalized_url])
            .await?;
        row.map(|r| candidate_from_row(&r)).transpose()
    }

    /// One page of candidates in `status`, highest priority first.
    pub async fn candidates_page(
        &self,
        scope: DatasetScope,
        status: CandidateStatus,
        source_id: Option<i64>,
        offset: i64,
        limit: i64,
    ) -> StoreResult<Vec<CandidateLink>> {
        let (clause, mut params) = scope.clause("dataset_id");
        let mut sql = format!(
            "SELECT {} FROM candidate_links WHERE status = ? AND {}",
            CANDIDATE_COLUMNS, clause
        );
        params.insert(0, SqlValue::from(status.as_str()));
        if let Some(source_id) = source_id {
            sql.push_str(" AND source_id = ?");
            params.push(SqlValue::from(source_id));
        }
        sql.push_str(" ORDER BY priority DESC, id LIMIT ? OFFSET ?");
        params.push(SqlValue::from(limit));
        params.push(SqlValue::from(offset));
        let rows = self.backend.query(&sql, &params).await?;
        rows.iter().map(candidate_from_row).collect()
    }

    /// Move a candidate forward. The predecessor check runs inside the
    /// UPDATE so concurrent workers cannot regress a record. Returns false
    /// when the link was not in an allowed predecessor state.
    pub async fn transition_candidate(
        &self,
        id: i64,
        to: CandidateStatus,
        reason: Option<&str>,
    ) -> StoreResult<bool> {
        let predecessors = to.predecessors();
        if predecessors.is_empty() {
            return Ok(false);
        }
        // Extraction starts with a fresh retry budget; telemetry keeps the
        // verification attempts
        let reset_retries = if to == CandidateStatus::Article {
            ", retry_count = 0"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE candidate_links SET status = ?, status_reason = ?, updated_at = ?{}
             WHERE id = ? AND status IN ({})",
            reset_retries,
            status_list(predecessors, CandidateStatus::as_str)
        );
        let changed = self
            .backend
            .execute(&sql, &sql_args![to.as_str(), reason, current_timestamp(), id])
            .await?;
        Ok(changed > 0)
    }

    /// Count a failed attempt. Returns the new retry count, or `None` when
    /// the link is no longer in `status`.
    pub async fn record_candidate_retry(
        &self,
        id: i64,
        status: CandidateStatus,
        error: &str,
    ) -> StoreResult<Option<i64>> {
        let row = self
            .backend
            .query_one(
                "UPDATE candidate_links
                 SET retry_count = retry_count + 1, last_attempt_at = ?, last_error = ?
                 WHERE id = ? AND status = ?
                 RETURNING retry_count",
                &sql_args![current_timestamp(), error, id, status.as_str()],
            )
            .await?;
        row.map(|r| r.int("retry_count")).transpose()
    }

    pub async fn record_candidate_attempt(
        &self,
        id: i64,
        page_hash: Option<&str>,
    ) -> StoreResult<()> {
        self.backend
            .execute(
                "UPDATE candidate_links SET last_attempt_at = ?, page_hash = COALESCE(?, page_hash)
                 WHERE id = ?",
                &sql_args![current_timestamp(), page_hash, id],
            )
            .await?;
        Ok(())
    }

    /// A different verified link in scope with the same normalized URL.
    pub async fn verified_by_normalized_url(
        &self,
        scope: DatasetScope,
        normalized_url: &str,
        exclude_id: i64,
    ) -> StoreResult<Option<i64>> {
        let (clause, scope_params) = scope.clause("dataset_id");
        let sql = format!(
            "SELECT id FROM candidate_links
             WHERE normalized_url = ? AND id <> ? AND status IN ('article', 'extracted') AND {}
             ORDER BY id LIMIT 1",
            clause
        );
        let mut params = sql_args![normalized_url, exclude_id];
        params.extend(scope_params);
        let row = self.backend.query_one(&sql, &params).await?;
        row.map(|r| r.int("id")).transpose()
    }

    /// A different verified link in the same dataset whose page hashed the same.
    pub async fn verified_by_page_hash(
        &self,
        dataset_id: i64,
        page_hash: &str,
        exclude_id: i64,
    ) -> StoreResult<Option<i64>> {
        let row = self
            .backend
            .query_one(
                "SELECT id FROM candidate_links
                 WHERE dataset_id = ? AND page_hash = ? AND id <> ?
                   AND status IN ('article', 'extracted')
                 ORDER BY id LIMIT 1",
                &sql_args![dataset_id, page_hash, exclude_id],
            )
            .await?;
        row.map(|r| r.int("id")).transpose()
    }

    /// URLs of a source already confirmed as articles, newest first.
    pub async fn known_article_urls(&self, source_id: i64, limit: i64) -> StoreResult<Vec<String>> {
        let rows = self
            .backend
            .query(
                "SELECT url FROM candidate_links
                 WHERE source_id = ? AND status IN ('article', 'extracted')
                 ORDER BY id DESC LIMIT ?",
                &sql_args![source_id, limit],
            )
            .await?;
        rows.iter().map(|r| r.text("url")).collect()
    }

    /// Administrative reset back to `discovered`. The only path that moves a
    /// link backwards.
    pub async fn reset_candidate(&self, id: i64) -> StoreResult<bool> {
        let changed = self
            .backend
            .execute(
                "UPDATE candidate_links
                 SET status = 'discovered', status_reason = NULL, retry_count = 0,
                     last_attempt_at = NULL, last_error = NULL, updated_at = ?
                 WHERE id = ?",
                &sql_args![current_timestamp(), id],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Pause links that made no progress since `cutoff`.
    pub async fn pause_stale_candidates(&self, scope: DatasetScope, cutoff: i64) -> StoreResult<u64> {
        let (clause, scope_params) = scope.clause("dataset_id");
        let sql = format!(
            "UPDATE candidate_links SET status = 'paused', status_reason = 'expired', updated_at = ?
             WHERE status IN ({}) AND updated_at < ? AND {}",
            status_list(CandidateStatus::Paused.predecessors(), CandidateStatus::as_str),
            clause
        );
        let mut params = sql_args![current_timestamp(), cutoff];
        params.extend(scope_params);
        self.backend.execute(&sql, &params).await
    }

    pub async fn stalled_candidates(
        &self,
        scope: DatasetScope,
        status: CandidateStatus,
        cutoff: i64,
    ) -> StoreResult<i64> {
        let (clause, scope_params) = scope.clause("dataset_id");
        let sql = format!(
            "SELECT COUNT(*) AS n FROM candidate_links WHERE status = ? AND updated_at < ? AND {}",
            clause
        );
        let mut params = sql_args![status.as_str(), cutoff];
        params.extend(scope_params);
        self.count(&sql, &params).await
    }

    pub async fn stalled_articles(
        &self,
        scope: DatasetScope,
        status: ArticleStatus,
        cutoff: i64,
    ) -> StoreResult<i64> {
        let (clause, scope_params) = scope.clause("dataset_id");
        let sql = format!(
            "SELECT COUNT(*) AS n FROM articles WHERE status = ? AND updated_at < ? AND {}",
            clause
        );
        let mut params = sql_args![status.as_str(), cutoff];
        params.extend(scope_params);
        self.count(&sql, &params).await
    }

    // Articles

    /// Insert an article. `None` means a unique constraint fired: either the
    /// candidate already has an article or the content hash is taken.
    pub async fn insert_article(&self, article: &NewArticle) -> StoreResult<Option<i64>> {
        let now = current_timestamp();
        let row = self
            .backend
            .query_one(
                "INSERT INTO articles (
                    candidate_link_id, dataset_id, source_id, url, title, authors, body,
                    published_at, content_hash, wire_services, status, status_reason,
                    extracted_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT DO NOTHING
                RETURNING id",
                &sql_args![
                    article.candidate_link_id,
                    article.dataset_id,
                    article.source_id,
                    article.url.as_str(),
                    &article.title,
                    to_json_list(&article.authors),
                    &article.body,
                    article.published_at.map(|t| t.timestamp()),
                    &article.content_hash,
                    to_json_list(&article.wire_services),
                    article.status.as_str(),
                    &article.status_reason,
                    now,
                    now
                ],
            )
            .await?;
        row.map(|r| r.int("id")).transpose()
    }

    pub async fn get_article(&self, id: i64) -> StoreResult<Option<Article>> {
        let sql = format!("SELECT {} FROM articles WHERE id = ?", ARTICLE_COLUMNS);
        let row = self.backend.query_one(&sql, &sql_args![id]).await?;
        row.map(|r| article_from_row(&r)).transpose()
    }

    pub async fn article_for_candidate(&self, candidate_id: i64) -> StoreResult<Option<Article>> {
        let sql = format!(
            "SELECT {} FROM articles WHERE candidate_link_id = ?",
            ARTICLE_COLUMNS
        );
        let row = self.backend.query_one(&sql, &sql_args![candidate_id]).await?;
        row.map(|r| article_from_row(&r)).transpose()
    }

    pub async fn article_by_content_hash(
        &self,
        dataset_id: i64,
        content_hash: &str,
    ) -> StoreResult<Option<Article>> {
        let sql = format!(
            "SELECT {} FROM articles WHERE dataset_id = ? AND content_hash = ?",
            ARTICLE_COLUMNS
        );
        let row = self
            .backend
            .query_one(&sql, &sql_args![dataset_id, content_hash])
            .await?;
        row.map(|r| article_from_row(&r)).transpose()
    }

    pub async fn articles_in_status(
        &self,
        scope: DatasetScope,
        status: ArticleStatus,
        limit: i64,
    ) -> StoreResult<Vec<Article>> {
        let (clause, scope_params) = scope.clause("dataset_id");
        let sql = format!(
            "SELECT {} FROM articles WHERE status = ? AND {} ORDER BY id LIMIT ?",
            ARTICLE_COLUMNS, clause
        );
        let mut params = sql_args![status.as_str()];
        params.extend(scope_params);
        params.push(SqlValue::from(limit));
        let rows = self.backend.query(&sql, &params).await?;
        rows.iter().map(article_from_row).collect()
    }

    pub async fn transition_article(
        &self,
        id: i64,
        to: ArticleStatus,
        reason: Option<&str>,
    ) -> StoreResult<bool> {
        let predecessors = to.predecessors();
        if predecessors.is_empty() {
            return Ok(false);
        }
        let sql = format!(
            "UPDATE articles SET status = ?, status_reason = ?, updated_at = ?
             WHERE id = ? AND status IN ({})",
            status_list(predecessors, ArticleStatus::as_str)
        );
        let changed = self
            .backend
            .execute(&sql, &sql_args![to.as_str(), reason, current_timestamp(), id])
            .await?;
        Ok(changed > 0)
    }

    /// Store cleaned text and move `extracted → cleaned`.
    pub async fn mark_article_cleaned(&self, id: i64, cleaned_text: &str) -> StoreResult<bool> {
        let changed = self
            .backend
            .execute(
                "UPDATE articles SET cleaned_text = ?, status = 'cleaned', updated_at = ?
                 WHERE id = ? AND status = 'extracted'",
                &sql_args![cleaned_text, current_timestamp(), id],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Store labels and move `cleaned → classified`.
    pub async fn mark_article_classified(
        &self,
        id: i64,
        classification: &Classification,
    ) -> StoreResult<bool> {
        let changed = self
            .backend
            .execute(
                "UPDATE articles
                 SET primary_label = ?, primary_confidence = ?, secondary_label = ?,
                     secondary_confidence = ?, status = 'classified', updated_at = ?
                 WHERE id = ? AND status = 'cleaned'",
                &sql_args![
                    classification.primary_label.as_str(),
                    classification.primary_confidence,
                    &classification.secondary_label,
                    classification.secondary_confidence,
                    current_timestamp(),
                    id
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    pub async fn insert_entities(
        &self,
        article_id: i64,
        entities: &[PlaceEntity],
    ) -> StoreResult<usize> {
        let now = current_timestamp();
        for entity in entities {
            self.backend
                .execute(
                    "INSERT INTO article_entities
                        (article_id, name, kind, latitude, longitude, confidence, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    &sql_args![
                        article_id,
                        entity.name.as_str(),
                        entity.kind.as_str(),
                        entity.latitude,
                        entity.longitude,
                        entity.confidence,
                        now
                    ],
                )
                .await?;
        }
        Ok(entities.len())
    }

    pub async fn entities_for_article(&self, article_id: i64) -> StoreResult<Vec<PlaceEntity>> {
        let rows = self
            .backend
            .query(
                "SELECT name, kind, latitude, longitude, confidence
                 FROM article_entities WHERE article_id = ? ORDER BY id",
                &sql_args![article_id],
            )
            .await?;
        rows.iter()
            .map(|r| {
                Ok(PlaceEntity {
                    name: r.text("name")?,
                    kind: r.text("kind")?,
                    latitude: r.opt_real("latitude")?,
                    longitude: r.opt_real("longitude")?,
                    confidence: r.opt_real("confidence")?,
                })
            })
            .collect()
    }

    // Status query surface

    pub async fn candidate_status_counts(&self, scope: DatasetScope) -> StoreResult<Vec<StatusCount>> {
        let (clause, params) = scope.clause("c.dataset_id");
        let sql = format!(
            "SELECT s.host AS source, c.status AS status, COUNT(*) AS n
             FROM candidate_links c JOIN sources s ON s.id = c.source_id
             WHERE {}
             GROUP BY s.host, c.status
             ORDER BY s.host, c.status",
            clause
        );
        self.status_counts(&sql, &params).await
    }

    pub async fn article_status_counts(&self, scope: DatasetScope) -> StoreResult<Vec<StatusCount>> {
        let (clause, params) = scope.clause("a.dataset_id");
        let sql = format!(
            "SELECT s.host AS source, a.status AS status, COUNT(*) AS n
             FROM articles a JOIN sources s ON s.id = a.source_id
             WHERE {}
             GROUP BY s.host, a.status
             ORDER BY s.host, a.status",
            clause
        );
        self.status_counts(&sql, &params).await
    }

    /// Candidates in `status` whose last attempt is older than `attempted_before`.
    pub async fn due_candidates(
        &self,
        scope: DatasetScope,
        status: CandidateStatus,
        attempted_before: i64,
    ) -> StoreResult<i64> {
        let (clause, scope_params) = scope.clause("dataset_id");
        let sql = format!(
            "SELECT COUNT(*) AS n FROM candidate_links
             WHERE status = ? AND (last_attempt_at IS NULL OR last_attempt_at <= ?) AND {}",
            clause
        );
        let mut params = sql_args![status.as_str(), attempted_before];
        params.extend(scope_params);
        self.count(&sql, &params).await
    }

    async fn status_counts(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<StatusCount>> {
        let rows = self.backend.query(sql, params).await?;
        rows.iter()
            .map(|r| {
                Ok(StatusCount {
                    source: r.text("source")?,
                    status: r.text("status")?,
                    count: r.int("n")?,
                })
            })
            .collect()
    }

    async fn count(&self, sql: &str, params: &[SqlValue]) -> StoreResult<i64> {
        match self.backend.query_one(sql, params).await? {
            Some(row) => row.int("n"),
            None => Ok(0),
        }
    }
}

fn dataset_from_row(row: &SqlRow) -> StoreResult<Dataset> {
    Ok(Dataset {
        id: row.int("id")?,
        slug: row.text("slug")?,
        name: row.text("name")?,
        isolated: row.int("isolated")? != 0,
        created_at: from_timestamp(row.int("created_at")?),
    })
}

fn source_from_row(row: &SqlRow) -> StoreResult<Source> {
    let status = row.text("status")?;
    Ok(Source {
        id: row.int("id")?,
        dataset_id: row.int("dataset_id")?,
        host: row.text("host")?,
        name: row.text("name")?,
        base_url: row.text("base_url")?,
        status: SourceStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
            column: "sources.status".to_string(),
            value: status.clone(),
        })?,
        feeds: json_list(row.opt_text("feeds")?, "sources.feeds")?,
        discovery_frequency_hours: row.int("discovery_frequency_hours")?,
        last_discovery_at: row.opt_int("last_discovery_at")?.map(from_timestamp),
        created_at: from_timestamp(row.int("created_at")?),
    })
}

fn candidate_from_row(row: &SqlRow) -> StoreResult<CandidateLink> {
    let status = row.text("status")?;
    let strategy = row.text("discovered_by")?;
    Ok(CandidateLink {
        id: row.int("id")?,
        dataset_id: row.int("dataset_id")?,
        source_id: row.int("source_id")?,
        url: row.text("url")?,
        normalized_url: row.text("normalized_url")?,
        discovered_by: StrategyKind::parse(&strategy).ok_or_else(|| StoreError::Corrupt {
            column: "candidate_links.discovered_by".to_string(),
            value: strategy.clone(),
        })?,
        priority: row.int("priority")?,
        status: CandidateStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
            column: "candidate_links.status".to_string(),
            value: status.clone(),
        })?,
        status_reason: row.opt_text("status_reason")?,
        retry_count: row.int("retry_count")?,
        last_attempt_at: row.opt_int("last_attempt_at")?.map(from_timestamp),
        last_error: row.opt_text("last_error")?,
        page_hash: row.opt_text("page_hash")?,
        discovered_at: from_timestamp(row.int("discovered_at")?),
        updated_at: from_timestamp(row.int("updated_at")?),
    })
}

fn article_from_row(row: &SqlRow) -> StoreResult<Article> {
    let status = row.text("status")?;
    Ok(Article {
        id: row.int("id")?,
        candidate_link_id: row.int("candidate_link_id")?,
        dataset_id: row.int("dataset_id")?,
        source_id: row.int("source_id")?,
        url: row.text("url")?,
        title: row.opt_text("title")?,
        authors: json_list(row.opt_text("authors")?, "articles.authors")?,
        body: row.opt_text("body")?,
        cleaned_text: row.opt_text("cleaned_text")?,
        published_at: row.opt_int("published_at")?.map(from_timestamp),
        content_hash: row.opt_text("content_hash")?,
        wire_services: json_list(row.opt_text("wire_services")?, "articles.wire_services")?,
        status: ArticleStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
            column: "articles.status".to_string(),
            value: status.clone(),
        })?,
        status_reason: row.opt_text("status_reason")?,
        primary_label: row.opt_text("primary_label")?,
        primary_confidence: row.opt_real("primary_confidence")?,
        secondary_label: row.opt_text("secondary_label")?,
        secondary_confidence: row.opt_real("secondary_confidence")?,
        extracted_at: from_timestamp(row.int("extracted_at")?),
        updated_at: from_timestamp(row.int("updated_at")?),
    })
}
