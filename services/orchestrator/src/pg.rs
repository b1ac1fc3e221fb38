//! Postgres backends: the document store and the job queue.
//!
//! Schema lives in `migrations/`.

use async_trait::async_trait;
use metastore::{
    DocumentStore, Field, Kind, Literal, MetaError, Page, Predicate, Result, StoredDocument,
};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::debug;

use crate::queue::{Delivery, JobQueue, QueueError};

fn storage_err(e: sqlx::Error) -> MetaError {
    MetaError::Storage(e.to_string())
}

#[derive(Debug, sqlx::FromRow)]
struct DocumentRow {
    kind: String,
    id: String,
    owner: String,
    is_public: bool,
    version: i64,
    body: JsonValue,
}

impl TryFrom<DocumentRow> for StoredDocument {
    type Error = MetaError;

    fn try_from(r: DocumentRow) -> Result<Self> {
        let kind = Kind::parse(&r.kind)
            .ok_or_else(|| MetaError::Storage(format!("unknown kind column: {}", r.kind)))?;
        Ok(StoredDocument {
            kind,
            id: r.id,
            owner: r.owner,
            is_public: r.is_public,
            version: r.version as u64,
            body: r.body,
        })
    }
}

/// Appends `predicate` as a SQL boolean expression.
fn push_predicate(qb: &mut QueryBuilder<'_, Postgres>, predicate: &Predicate) {
    match predicate {
        Predicate::True => {
            qb.push("TRUE");
        }
        Predicate::Eq(field, lit) => match (field, lit) {
            (Field::Id, Literal::Str(s)) => {
                qb.push("id = ").push_bind(s.clone());
            }
            (Field::Owner, Literal::Str(s)) => {
                qb.push("owner = ").push_bind(s.clone());
            }
            (Field::IsPublic, Literal::Bool(b)) => {
                qb.push("is_public = ").push_bind(*b);
            }
            _ => {
                qb.push("FALSE");
            }
        },
        Predicate::And(ps) => push_joined(qb, ps, " AND ", "TRUE"),
        Predicate::Or(ps) => push_joined(qb, ps, " OR ", "FALSE"),
        Predicate::Not(p) => {
            qb.push("NOT (");
            push_predicate(qb, p);
            qb.push(")");
        }
    }
}

fn push_joined(
    qb: &mut QueryBuilder<'_, Postgres>,
    parts: &[Predicate],
    sep: &str,
    empty: &str,
) {
    if parts.is_empty() {
        qb.push(empty);
        return;
    }
    qb.push("(");
    for (i, p) in parts.iter().enumerate() {
        if i > 0 {
            qb.push(sep);
        }
        push_predicate(qb, p);
    }
    qb.push(")");
}

/// Documents in one table, keyed by `(kind, id)`, ordered by `seq`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn select(kind: Kind, predicate: &Predicate, what: &str) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new(format!("SELECT {what} FROM documents WHERE kind = "));
        qb.push_bind(kind.as_str()).push(" AND ");
        push_predicate(&mut qb, predicate);
        qb
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn insert(&self, doc: StoredDocument) -> Result<()> {
        let done = sqlx::query(
            r#"
            INSERT INTO documents (kind, id, owner, is_public, version, body)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (kind, id) DO NOTHING
            "#,
        )
        .bind(doc.kind.as_str())
        .bind(&doc.id)
        .bind(&doc.owner)
        .bind(doc.is_public)
        .bind(doc.version.max(1) as i64)
        .bind(&doc.body)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if done.rows_affected() == 0 {
            return Err(MetaError::Conflict(format!("{} {} already exists", doc.kind, doc.id)));
        }
        Ok(())
    }

    async fn get(&self, kind: Kind, id: &str) -> Result<Option<StoredDocument>> {
        let row: Option<DocumentRow> = sqlx::query_as(
            r#"
            SELECT kind, id, owner, is_public, version, body
            FROM documents
            WHERE kind = $1 AND id = $2
            "#,
        )
        .bind(kind.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.map(StoredDocument::try_from).transpose()
    }

    async fn replace(&self, doc: StoredDocument, expected_version: u64) -> Result<u64> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE documents
            SET owner = $3,
                is_public = $4,
                body = $5,
                version = version + 1,
                updated_at = NOW()
            WHERE kind = $1 AND id = $2 AND version = $6
            RETURNING version
            "#,
        )
        .bind(doc.kind.as_str())
        .bind(&doc.id)
        .bind(&doc.owner)
        .bind(doc.is_public)
        .bind(&doc.body)
        .bind(expected_version as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match version {
            Some(v) => Ok(v as u64),
            None => match self.get(doc.kind, &doc.id).await? {
                Some(current) => Err(MetaError::Conflict(format!(
                    "{} {} was modified concurrently (expected version {}, found {})",
                    doc.kind, doc.id, expected_version, current.version
                ))),
                None => Err(MetaError::not_found(doc.kind, doc.id)),
            },
        }
    }

    async fn delete(&self, kind: Kind, id: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM documents WHERE kind = $1 AND id = $2")
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(done.rows_affected() > 0)
    }

    async fn find(
        &self,
        kind: Kind,
        predicate: &Predicate,
        page: Page,
    ) -> Result<Vec<StoredDocument>> {
        let mut qb = Self::select(kind, predicate, "kind, id, owner, is_public, version, body");
        qb.push(" ORDER BY seq ASC OFFSET ")
            .push_bind(page.offset as i64)
            .push(" LIMIT ")
            .push_bind(page.limit as i64);

        let rows: Vec<DocumentRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        debug!(kind = %kind, rows = rows.len(), "pg: find");

        rows.into_iter().map(StoredDocument::try_from).collect()
    }

    async fn count(&self, kind: Kind, predicate: &Predicate) -> Result<u64> {
        let mut qb = Self::select(kind, predicate, "COUNT(*)");
        let n: i64 = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(n as u64)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    attempts: i32,
}

/// Lease-based queue over the `jobs` table.
///
/// A claimed job is `running` with a lease; a worker that stops
/// heartbeating loses the lease and the job becomes claimable again.
#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
    worker_id: String,
    lease_secs: i64,
}

impl PgQueue {
    pub fn new(pool: PgPool, worker_id: impl Into<String>, lease_secs: i64) -> Self {
        Self {
            pool,
            worker_id: worker_id.into(),
            lease_secs,
        }
    }
}

#[async_trait]
impl JobQueue for PgQueue {
    async fn enqueue(&self, task_id: &str) -> std::result::Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, status)
            VALUES ($1, 'pending')
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn receive(&self) -> std::result::Result<Option<Delivery>, QueueError> {
        let mut tx: Transaction<Postgres> = self.pool.begin().await?;

        // pending, or running with an expired lease
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            SELECT id, attempts
            FROM jobs
            WHERE
              status = 'pending'
              OR (
                  status = 'running'
                  AND (lease_until IS NULL OR lease_until < NOW())
              )
            ORDER BY created_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(r) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE jobs
            SET
              status = 'running',
              lease_owner = $2,
              lease_until = NOW() + ($3 * INTERVAL '1 second'),
              attempts = attempts + 1,
              updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(&r.id)
        .bind(&self.worker_id)
        .bind(self.lease_secs)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(Delivery {
            task_id: r.id,
            attempts: (r.attempts + 1) as u32,
        }))
    }

    async fn ack(&self, task_id: &str) -> std::result::Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done',
                lease_owner = NULL,
                lease_until = NULL,
                error = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, task_id: &str, reason: &str) -> std::result::Result<(), QueueError> {
        // upsert: a task that never made it into the table is still recorded
        sqlx::query(
            r#"
            INSERT INTO jobs (id, status, error)
            VALUES ($1, 'failed', $2)
            ON CONFLICT (id) DO UPDATE
            SET status = 'failed',
                lease_owner = NULL,
                lease_until = NULL,
                error = EXCLUDED.error,
                updated_at = NOW()
            "#,
        )
        .bind(task_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat(&self, task_id: &str) -> std::result::Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET lease_until = NOW() + ($3 * INTERVAL '1 second'),
                updated_at = NOW()
            WHERE id = $1
              AND status = 'running'
              AND lease_owner = $2
            "#,
        )
        .bind(task_id)
        .bind(&self.worker_id)
        .bind(self.lease_secs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
