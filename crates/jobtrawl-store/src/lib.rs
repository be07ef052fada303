//! Durable posting store + read-only query service for jobtrawl.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobtrawl_core::{DedupKey, DetailFields, FieldValue, NewPosting, Posting, PostingFields, PostingId};
use serde::Serialize;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub use sqlx::Error as SqlxError;

pub const CRATE_NAME: &str = "jobtrawl-store";

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("posting with dedup key `{0}` already exists")]
    Conflict(DedupKey),
    #[error("posting {0} not found")]
    NotFound(PostingId),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Minimal projection used by the enrichment scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRow {
    pub id: PostingId,
    pub link: FieldValue,
    pub enriched: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub rows: Vec<Posting>,
    pub total_count: u64,
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Cheap connectivity probe run before a cycle touches the store.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn exists(&self, key: &DedupKey) -> Result<bool, StoreError>;

    /// Atomic insert-if-absent. Losing a race on the dedup key is `StoreError::Conflict`.
    async fn insert(&self, posting: &NewPosting) -> Result<PostingId, StoreError>;

    /// Keyset page of postings with `id > after`, ascending by id.
    async fn scan_page(&self, after: PostingId, limit: u32) -> Result<Vec<ScanRow>, StoreError>;

    /// Writes detail fields and stamps the posting as enriched. A sentinel
    /// never replaces a value that is already present.
    async fn update_detail_fields(&self, id: PostingId, detail: &DetailFields) -> Result<(), StoreError>;

    /// Case-insensitive substring match OR'd across every textual column, ordered by id.
    /// An empty filter matches everything. `page` is 1-based.
    async fn search(&self, filter: &str, page: u32, limit: u32) -> Result<SearchResult, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        info!("job_postings migrations applied");
        Ok(())
    }
}

fn posting_from_row(row: &PgRow) -> Result<Posting, sqlx::Error> {
    let text = |column: &str| -> Result<FieldValue, sqlx::Error> {
        Ok(row.try_get::<Option<String>, _>(column)?.into())
    };
    Ok(Posting {
        id: PostingId(row.try_get("id")?),
        fields: PostingFields {
            title: text("job_title")?,
            link: text("job_link")?,
            company_name: text("company_name")?,
            company_link: text("company_link")?,
            source_name: text("job_source")?,
            location: text("job_location")?,
            salary: text("salary")?,
            employment_type: text("job_type")?,
            description: text("job_description")?,
            posted_date: text("job_posted_date")?,
        },
        dedup_key: DedupKey::new(row.try_get::<String, _>("dedup_key")?),
        created_at: row.try_get("created_at")?,
        enriched_at: row.try_get("enriched_at")?,
    })
}

/// Escapes `%`, `_` and `\` so the filter matches literally inside ILIKE.
pub fn like_pattern(filter: &str) -> String {
    let mut escaped = String::with_capacity(filter.len() + 2);
    escaped.push('%');
    for ch in filter.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

fn page_offset(page: u32, limit: u32) -> u64 {
    u64::from(page.saturating_sub(1)) * u64::from(limit)
}

#[async_trait]
impl Repository for PgRepository {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn exists(&self, key: &DedupKey) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM job_postings WHERE dedup_key = $1)")
            .bind(key.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<bool, _>(0)?)
    }

    async fn insert(&self, posting: &NewPosting) -> Result<PostingId, StoreError> {
        let f = &posting.fields;
        let row = sqlx::query(
            r#"
            INSERT INTO job_postings (
                dedup_key, job_title, job_link, company_name, company_link, job_source,
                job_location, salary, job_type, job_description, job_posted_date
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (dedup_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(posting.dedup_key.as_str())
        .bind(f.title.as_deref())
        .bind(f.link.as_deref())
        .bind(f.company_name.as_deref())
        .bind(f.company_link.as_deref())
        .bind(f.source_name.as_deref())
        .bind(f.location.as_deref())
        .bind(f.salary.as_deref())
        .bind(f.employment_type.as_deref())
        .bind(f.description.as_deref())
        .bind(f.posted_date.as_deref())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(PostingId(row.try_get("id")?)),
            None => Err(StoreError::Conflict(posting.dedup_key.clone())),
        }
    }

    async fn scan_page(&self, after: PostingId, limit: u32) -> Result<Vec<ScanRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_link, enriched_at IS NOT NULL AS enriched
              FROM job_postings
             WHERE id > $1
             ORDER BY id ASC
             LIMIT $2
            "#,
        )
        .bind(after.get())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ScanRow {
                id: PostingId(row.try_get("id")?),
                link: row.try_get::<Option<String>, _>("job_link")?.into(),
                enriched: row.try_get("enriched")?,
            });
        }
        Ok(out)
    }

    async fn update_detail_fields(&self, id: PostingId, detail: &DetailFields) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_postings
               SET job_description = COALESCE($2, job_description),
                   job_type = COALESCE($3, job_type),
                   salary = COALESCE($4, salary),
                   enriched_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id.get())
        .bind(detail.description.as_deref())
        .bind(detail.employment_type.as_deref())
        .bind(detail.salary.as_deref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn search(&self, filter: &str, page: u32, limit: u32) -> Result<SearchResult, StoreError> {
        let pattern = like_pattern(filter);
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query(
            r#"
            SELECT id, dedup_key, job_title, job_link, company_name, company_link, job_source,
                   job_location, salary, job_type, job_description, job_posted_date,
                   created_at, enriched_at
              FROM job_postings
             WHERE $1 = ''
                OR job_title ILIKE $2 OR job_link ILIKE $2 OR company_name ILIKE $2
                OR company_link ILIKE $2 OR job_source ILIKE $2 OR job_location ILIKE $2
                OR salary ILIKE $2 OR job_type ILIKE $2 OR job_description ILIKE $2
                OR job_posted_date ILIKE $2
             ORDER BY id ASC
             LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter)
        .bind(&pattern)
        .bind(i64::from(limit))
        .bind(page_offset(page, limit) as i64)
        .fetch_all(&mut *tx)
        .await?;

        let total: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
              FROM job_postings
             WHERE $1 = ''
                OR job_title ILIKE $2 OR job_link ILIKE $2 OR company_name ILIKE $2
                OR company_link ILIKE $2 OR job_source ILIKE $2 OR job_location ILIKE $2
                OR salary ILIKE $2 OR job_type ILIKE $2 OR job_description ILIKE $2
                OR job_posted_date ILIKE $2
            "#,
        )
        .bind(filter)
        .bind(&pattern)
        .fetch_one(&mut *tx)
        .await?
        .try_get("total")?;
        tx.commit().await?;

        let rows = rows
            .iter()
            .map(posting_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(filter, page, limit, total, returned = rows.len(), "search executed");
        Ok(SearchResult {
            rows,
            total_count: total.max(0) as u64,
        })
    }
}

/// Process-local repository with the same contract as [`PgRepository`].
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    last_id: i64,
    rows: BTreeMap<PostingId, Posting>,
    keys: HashMap<DedupKey, PostingId>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, id: PostingId) -> Option<Posting> {
        self.state.lock().await.rows.get(&id).cloned()
    }

    pub async fn all(&self) -> Vec<Posting> {
        self.state.lock().await.rows.values().cloned().collect()
    }
}

fn matches_filter(fields: &PostingFields, needle: &str) -> bool {
    needle.is_empty()
        || fields
            .columns()
            .iter()
            .filter_map(|(_, value)| value.as_deref())
            .any(|value| value.to_lowercase().contains(needle))
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn exists(&self, key: &DedupKey) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.keys.contains_key(key))
    }

    async fn insert(&self, posting: &NewPosting) -> Result<PostingId, StoreError> {
        let mut state = self.state.lock().await;
        if state.keys.contains_key(&posting.dedup_key) {
            return Err(StoreError::Conflict(posting.dedup_key.clone()));
        }
        state.last_id += 1;
        let id = PostingId(state.last_id);
        state.keys.insert(posting.dedup_key.clone(), id);
        state.rows.insert(
            id,
            Posting {
                id,
                fields: posting.fields.clone(),
                dedup_key: posting.dedup_key.clone(),
                created_at: Utc::now(),
                enriched_at: None,
            },
        );
        Ok(id)
    }

    async fn scan_page(&self, after: PostingId, limit: u32) -> Result<Vec<ScanRow>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .range((Bound::Excluded(after), Bound::Unbounded))
            .take(limit as usize)
            .map(|(id, posting)| ScanRow {
                id: *id,
                link: posting.fields.link.clone(),
                enriched: posting.is_enriched(),
            })
            .collect())
    }

    async fn update_detail_fields(&self, id: PostingId, detail: &DetailFields) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let posting = state.rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let fields = &mut posting.fields;
        fields.description = detail.description.clone().or(fields.description.clone());
        fields.employment_type = detail.employment_type.clone().or(fields.employment_type.clone());
        fields.salary = detail.salary.clone().or(fields.salary.clone());
        posting.enriched_at = Some(Utc::now());
        Ok(())
    }

    async fn search(&self, filter: &str, page: u32, limit: u32) -> Result<SearchResult, StoreError> {
        let needle = filter.to_lowercase();
        let state = self.state.lock().await;
        let matching: Vec<&Posting> = state
            .rows
            .values()
            .filter(|p| matches_filter(&p.fields, &needle))
            .collect();
        let total_count = matching.len() as u64;
        let rows = matching
            .into_iter()
            .skip(page_offset(page, limit) as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(SearchResult { rows, total_count })
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("page and limit must both be at least 1 (page={page}, limit={limit})")]
    InvalidPaging { page: u32, limit: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub rows: Vec<Posting>,
    pub page: u32,
    pub limit: u32,
    pub total_count: u64,
    pub total_pages: u64,
}

pub fn total_pages(total_count: u64, limit: u32) -> u64 {
    if limit == 0 {
        return 0;
    }
    total_count.div_ceil(u64::from(limit))
}

pub const DEFAULT_MAX_PAGE_SIZE: u32 = 100;

/// Read-only paginated view over a [`Repository`].
#[derive(Clone)]
pub struct QueryService {
    repo: Arc<dyn Repository>,
    max_limit: u32,
}

impl QueryService {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            max_limit: DEFAULT_MAX_PAGE_SIZE,
        }
    }

    pub fn with_max_limit(mut self, max_limit: u32) -> Self {
        self.max_limit = max_limit.max(1);
        self
    }

    /// Out-of-range pages return no rows rather than an error.
    pub async fn search(&self, filter: &str, page: u32, limit: u32) -> Result<SearchPage, QueryError> {
        if page == 0 || limit == 0 {
            return Err(QueryError::InvalidPaging { page, limit });
        }
        let limit = limit.min(self.max_limit);
        let result = self.repo.search(filter, page, limit).await?;
        Ok(SearchPage {
            rows: result.rows,
            page,
            limit,
            total_count: result.total_count,
            total_pages: total_pages(result.total_count, limit),
        })
    }
}
