//! PostgreSQL provider
//!
//! The primary backend: a bounded connection pool over one `entries`
//! table with a GIN full-text index spanning `task` and `response`.
//! Text queries go through `plainto_tsquery`, and `ts_rank` with the
//! rank/(rank+1) normalization yields a match score in [0, 1).
//!
//! Every operation runs under the configured deadline. Batch inserts
//! run in one transaction; a timeout or failure drops the transaction,
//! which rolls back on its way out.

use crate::config::ConnectionConfig;
use crate::entry::{DeleteFilter, MemoryEntry, NewEntry, UNKNOWN_MODEL};
use crate::provider::{schema, Candidate, Provider};
use crate::stats::{ModelStats, StatsSnapshot};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use std::str::FromStr;
use std::time::Duration;

/// Insert returning the stored row, so the caller gets the assigned id
/// and timestamp from the same statement that commits.
const INSERT_ENTRY: &str = r#"
INSERT INTO entries (agent_name, task, response, success_rating, model_used, tokens_used, metadata, parent_id)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
RETURNING id, agent_name, task, response, success_rating, model_used, tokens_used, created_at, metadata, parent_id
"#;

const SELECT_BY_ID: &str = r#"
SELECT id, agent_name, task, response, success_rating, model_used, tokens_used, created_at, metadata, parent_id
FROM entries
WHERE id = $1
"#;

const SELECT_ALL: &str = r#"
SELECT id, agent_name, task, response, success_rating, model_used, tokens_used, created_at, metadata, parent_id
FROM entries
ORDER BY id ASC
"#;

/// Full-text candidate query. The `to_tsvector` expression matches the
/// GIN index definition, and normalization flag 32 maps the rank into
/// [0, 1) as rank/(rank+1).
const SEARCH_ENTRIES: &str = r#"
SELECT id, agent_name, task, response, success_rating, model_used, tokens_used, created_at, metadata, parent_id,
       ts_rank(to_tsvector('english', task || ' ' || response),
               plainto_tsquery('english', $1), 32)::float8 AS match_score
FROM entries
WHERE to_tsvector('english', task || ' ' || response) @@ plainto_tsquery('english', $1)
ORDER BY match_score DESC, created_at DESC, id DESC
LIMIT $2
"#;

const SELECT_TOTALS: &str = r#"
SELECT COUNT(*) AS total_entries,
       COALESCE(SUM(success_rating), 0)::BIGINT AS rating_sum,
       COALESCE(SUM(tokens_used), 0)::BIGINT AS token_sum,
       MIN(created_at) AS oldest,
       MAX(created_at) AS newest
FROM entries
"#;

const SELECT_MODEL_TOTALS: &str = r#"
SELECT model_used AS model,
       COUNT(*) AS entries,
       SUM(success_rating)::BIGINT AS rating_sum,
       SUM(tokens_used)::BIGINT AS tokens_used,
       MIN(id) AS first_seen
FROM entries
GROUP BY model_used
ORDER BY first_seen ASC
"#;

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: i64,
    agent_name: String,
    task: String,
    response: String,
    success_rating: i32,
    model_used: String,
    tokens_used: i64,
    created_at: DateTime<Utc>,
    metadata: serde_json::Value,
    parent_id: Option<i64>,
}

impl From<EntryRow> for MemoryEntry {
    fn from(row: EntryRow) -> Self {
        MemoryEntry {
            id: row.id,
            agent_name: row.agent_name,
            task: row.task,
            response: row.response,
            success_rating: row.success_rating.clamp(1, 5) as u8,
            model_used: row.model_used,
            tokens_used: row.tokens_used.clamp(0, i64::from(u32::MAX)) as u32,
            created_at: row.created_at,
            metadata: row.metadata,
            parent_id: row.parent_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CandidateRow {
    #[sqlx(flatten)]
    entry: EntryRow,
    match_score: f64,
}

#[derive(sqlx::FromRow)]
struct TotalsRow {
    total_entries: i64,
    rating_sum: i64,
    token_sum: i64,
    oldest: Option<DateTime<Utc>>,
    newest: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct ModelRow {
    model: String,
    entries: i64,
    rating_sum: i64,
    tokens_used: i64,
}

/// PostgreSQL-backed provider over a bounded connection pool.
#[derive(Debug)]
pub struct RelationalProvider {
    pool: PgPool,
    op_timeout: Duration,
}

impl RelationalProvider {
    /// Connect, verify reachability, and apply the schema.
    ///
    /// Pool acquisition is bounded by the configured
    /// `pool_timeout_secs`; exhaustion surfaces as
    /// [`Error::Connection`].
    pub async fn connect(config: &ConnectionConfig, op_timeout: Duration) -> Result<Self> {
        let ssl_mode = PgSslMode::from_str(&config.ssl_mode).map_err(|_| {
            Error::Configuration(format!("invalid connection.ssl_mode: {}", config.ssl_mode))
        })?;
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
            .ssl_mode(ssl_mode);

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.pool_timeout())
            .connect_with(options)
            .await?;

        let provider = Self { pool, op_timeout };
        provider.ensure_schema().await?;
        Ok(provider)
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.with_timeout(async {
            for statement in schema::all_schema_statements() {
                sqlx::query(statement).execute(&self.pool).await?;
            }
            Ok(())
        })
        .await
    }

    /// Run a storage future under the operation deadline
    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.op_timeout.as_secs())),
        }
    }
}

#[async_trait]
impl Provider for RelationalProvider {
    async fn insert(&self, new: &NewEntry) -> Result<MemoryEntry> {
        self.with_timeout(async {
            let row: EntryRow = sqlx::query_as(INSERT_ENTRY)
                .bind(&new.agent_name)
                .bind(&new.task)
                .bind(&new.response)
                .bind(i32::from(new.success_rating))
                .bind(new.model_or_default())
                .bind(i64::from(new.tokens_used))
                .bind(new.metadata_or_default())
                .bind(new.parent_id)
                .fetch_one(&self.pool)
                .await?;
            Ok(row.into())
        })
        .await
    }

    async fn insert_batch(&self, batch: &[NewEntry]) -> Result<Vec<MemoryEntry>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        self.with_timeout(async {
            let mut tx = self.pool.begin().await?;
            let mut entries = Vec::with_capacity(batch.len());
            for new in batch {
                let row: EntryRow = sqlx::query_as(INSERT_ENTRY)
                    .bind(&new.agent_name)
                    .bind(&new.task)
                    .bind(&new.response)
                    .bind(i32::from(new.success_rating))
                    .bind(new.model_or_default())
                    .bind(i64::from(new.tokens_used))
                    .bind(new.metadata_or_default())
                    .bind(new.parent_id)
                    .fetch_one(&mut *tx)
                    .await?;
                entries.push(row.into());
            }
            tx.commit().await?;
            Ok(entries)
        })
        .await
    }

    async fn fetch(&self, id: i64) -> Result<Option<MemoryEntry>> {
        self.with_timeout(async {
            let row: Option<EntryRow> = sqlx::query_as(SELECT_BY_ID)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.map(Into::into))
        })
        .await
    }

    async fn query(&self, text: &str, candidate_limit: usize) -> Result<Vec<Candidate>> {
        self.with_timeout(async {
            let rows: Vec<CandidateRow> = sqlx::query_as(SEARCH_ENTRIES)
                .bind(text)
                .bind(candidate_limit as i64)
                .fetch_all(&self.pool)
                .await?;
            Ok(rows
                .into_iter()
                .map(|row| Candidate {
                    entry: row.entry.into(),
                    match_score: row.match_score,
                })
                .collect())
        })
        .await
    }

    async fn scan(&self) -> Result<Vec<MemoryEntry>> {
        self.with_timeout(async {
            let rows: Vec<EntryRow> = sqlx::query_as(SELECT_ALL).fetch_all(&self.pool).await?;
            Ok(rows.into_iter().map(Into::into).collect())
        })
        .await
    }

    async fn stats(&self) -> Result<StatsSnapshot> {
        self.with_timeout(async {
            let totals: TotalsRow = sqlx::query_as(SELECT_TOTALS).fetch_one(&self.pool).await?;
            let model_rows: Vec<ModelRow> = sqlx::query_as(SELECT_MODEL_TOTALS)
                .fetch_all(&self.pool)
                .await?;

            let avg_success_rating = if totals.total_entries == 0 {
                0.0
            } else {
                totals.rating_sum as f64 / totals.total_entries as f64
            };

            let mut per_model = Vec::new();
            let mut top: Option<&ModelRow> = None;
            for row in model_rows.iter().filter(|r| r.model != UNKNOWN_MODEL) {
                per_model.push(ModelStats {
                    model: row.model.clone(),
                    entries: row.entries as u64,
                    avg_rating: row.rating_sum as f64 / row.entries as f64,
                    tokens_used: row.tokens_used.max(0) as u64,
                });
                // rows arrive in first-seen order; strict greater keeps
                // the earlier model on ties
                match top {
                    Some(best) if row.entries <= best.entries => {}
                    _ => top = Some(row),
                }
            }

            Ok(StatsSnapshot {
                total_entries: totals.total_entries as u64,
                avg_success_rating,
                total_tokens_used: totals.token_sum.max(0) as u64,
                top_model: top.map(|row| row.model.clone()),
                per_model,
                oldest: totals.oldest,
                newest: totals.newest,
            })
        })
        .await
    }

    async fn delete_where(&self, filter: &DeleteFilter) -> Result<u64> {
        if filter.is_empty() {
            return Ok(0);
        }

        let mut conditions = Vec::new();
        let mut position = 0;
        if filter.older_than_days.is_some() {
            position += 1;
            conditions.push(format!("created_at < ${}", position));
        }
        if filter.rating_below.is_some() {
            position += 1;
            conditions.push(format!("success_rating < ${}", position));
        }
        if filter.agent_name.is_some() {
            position += 1;
            conditions.push(format!("agent_name = ${}", position));
        }
        let sql = format!("DELETE FROM entries WHERE {}", conditions.join(" AND "));

        let mut query = sqlx::query(&sql);
        if let Some(days) = filter.older_than_days {
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
            query = query.bind(cutoff);
        }
        if let Some(rating) = filter.rating_below {
            query = query.bind(i32::from(rating));
        }
        if let Some(agent) = &filter.agent_name {
            query = query.bind(agent);
        }

        self.with_timeout(async {
            let result = query.execute(&self.pool).await?;
            Ok(result.rows_affected())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Connection parameters for a disposable test database, read from
    /// the environment so the ignored tests can run against a real
    /// server: MEMBANK_PG_HOST, and optionally MEMBANK_PG_PORT,
    /// MEMBANK_PG_DATABASE, MEMBANK_PG_USER, MEMBANK_PG_PASSWORD.
    fn test_config() -> Option<ConnectionConfig> {
        let host = std::env::var("MEMBANK_PG_HOST").ok()?;
        Some(ConnectionConfig {
            host,
            port: std::env::var("MEMBANK_PG_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            database: std::env::var("MEMBANK_PG_DATABASE")
                .unwrap_or_else(|_| "membank_test".to_string()),
            user: std::env::var("MEMBANK_PG_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("MEMBANK_PG_PASSWORD").unwrap_or_default(),
            ssl_mode: "prefer".to_string(),
            pool_size: 2,
            pool_timeout_secs: 5,
        })
    }

    async fn fresh_provider() -> Option<RelationalProvider> {
        let config = test_config()?;
        let provider = RelationalProvider::connect(&config, Duration::from_secs(30))
            .await
            .unwrap();
        sqlx::query("DELETE FROM entries")
            .execute(&provider.pool)
            .await
            .unwrap();
        Some(provider)
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL server (set MEMBANK_PG_HOST)"]
    async fn test_pg_insert_fetch_query() {
        let Some(provider) = fresh_provider().await else {
            return;
        };

        let new = NewEntry::new("GPT-4", "Analyze Q3 sales data", "Revenue grew 12%", 5)
            .with_model("gpt-4-turbo")
            .with_tokens(450);
        let inserted = provider.insert(&new).await.unwrap();
        assert_eq!(inserted.task, "Analyze Q3 sales data");
        assert_eq!(inserted.model_used, "gpt-4-turbo");
        assert_eq!(inserted.tokens_used, 450);

        // the returned entry is the stored row, not a reconstruction
        let fetched = provider.fetch(inserted.id).await.unwrap().unwrap();
        assert_eq!(inserted, fetched);

        let candidates = provider.query("Q3 sales", 10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].match_score > 0.0);
        assert!(candidates[0].match_score < 1.0);

        assert!(provider.query("unrelated terms", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL server (set MEMBANK_PG_HOST)"]
    async fn test_pg_token_counts_wider_than_int4() {
        let Some(provider) = fresh_provider().await else {
            return;
        };

        // a valid u32 token count that does not fit in a signed int4
        let tokens = 3_000_000_000_u32;
        let inserted = provider
            .insert(&NewEntry::new("helper", "long context run", "ok", 3).with_tokens(tokens))
            .await
            .unwrap();
        assert_eq!(inserted.tokens_used, tokens);

        provider
            .insert(&NewEntry::new("helper", "another long run", "ok", 3).with_tokens(tokens))
            .await
            .unwrap();

        // the token sum exceeds u32::MAX as well
        let snapshot = provider.stats().await.unwrap();
        assert_eq!(snapshot.total_tokens_used, 6_000_000_000);
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL server (set MEMBANK_PG_HOST)"]
    async fn test_pg_batch_rolls_back_on_failure() {
        let Some(provider) = fresh_provider().await else {
            return;
        };

        // the third entry violates the rating check constraint
        let batch = vec![
            NewEntry::new("helper", "first", "ok", 3),
            NewEntry::new("helper", "second", "ok", 4),
            NewEntry::new("helper", "third", "bad", 0),
        ];
        assert!(provider.insert_batch(&batch).await.is_err());
        assert_eq!(provider.scan().await.unwrap().len(), 0);
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL server (set MEMBANK_PG_HOST)"]
    async fn test_pg_stats_and_delete() {
        let Some(provider) = fresh_provider().await else {
            return;
        };

        provider
            .insert(&NewEntry::new("helper", "old and bad", "response", 1).with_model("alpha"))
            .await
            .unwrap();
        provider
            .insert(&NewEntry::new("helper", "recent and good", "response", 5).with_model("beta"))
            .await
            .unwrap();

        let snapshot = provider.stats().await.unwrap();
        assert_eq!(snapshot.total_entries, 2);
        assert!((snapshot.avg_success_rating - 3.0).abs() < 1e-12);
        assert_eq!(snapshot.per_model.len(), 2);

        // nothing is older than a day yet
        let removed = provider
            .delete_where(&DeleteFilter::new().older_than_days(1).rating_below(2))
            .await
            .unwrap();
        assert_eq!(removed, 0);

        let removed = provider
            .delete_where(&DeleteFilter::new().rating_below(2))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(provider.stats().await.unwrap().total_entries, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "needs a PostgreSQL server (set MEMBANK_PG_HOST)"]
    async fn test_pg_concurrent_inserts_lose_nothing() {
        let Some(provider) = fresh_provider().await else {
            return;
        };
        let provider = Arc::new(provider);

        let mut handles = Vec::new();
        for i in 0..16 {
            let provider = Arc::clone(&provider);
            handles.push(tokio::spawn(async move {
                provider
                    .insert(&NewEntry::new("helper", format!("parallel task {}", i), "ok", 3))
                    .await
                    .unwrap()
                    .id
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);
        assert_eq!(provider.scan().await.unwrap().len(), 16);
    }
}
