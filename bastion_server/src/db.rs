//! Database connection and block registry queries

use bastion_common::{BlockFilter, BlockRecord, Metadata, ParseError};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool};
use uuid::Uuid;

/// Initialize the database connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Block row as stored in Postgres
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BlockRow {
    pub id: Uuid,
    pub identity: String,
    pub kind: String,
    pub reason: String,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub violation_count: i64,
    pub metadata: Json<Metadata>,
    pub blocked_by: String,
    pub created_at: DateTime<Utc>,
    pub unblocked_at: Option<DateTime<Utc>>,
    pub unblocked_by: Option<String>,
    pub unblock_reason: Option<String>,
}

impl TryFrom<BlockRow> for BlockRecord {
    type Error = ParseError;

    fn try_from(row: BlockRow) -> Result<Self, Self::Error> {
        Ok(BlockRecord {
            id: row.id,
            identity: row.identity,
            kind: row.kind.parse()?,
            reason: row.reason.parse()?,
            active: row.active,
            expires_at: row.expires_at,
            violation_count: row.violation_count.max(0) as u64,
            metadata: row.metadata.0,
            blocked_by: row.blocked_by,
            created_at: row.created_at,
            unblocked_at: row.unblocked_at,
            unblocked_by: row.unblocked_by,
            unblock_reason: row.unblock_reason,
        })
    }
}

/// Database queries
pub mod queries {
    use super::*;

    const BLOCK_COLUMNS: &str = "id, identity, kind, reason, active, expires_at, violation_count, \
        metadata, blocked_by, created_at, unblocked_at, unblocked_by, unblock_reason";

    /// Insert a new active block. Fails with a unique violation if the identity
    /// already has an active row.
    pub async fn insert_block(pool: &PgPool, record: &BlockRecord) -> Result<BlockRow, sqlx::Error> {
        sqlx::query_as::<_, BlockRow>(&format!(
            r#"
            INSERT INTO blocks (id, identity, kind, reason, active, expires_at, violation_count,
                                metadata, blocked_by, created_at)
            VALUES ($1, $2, $3, $4, TRUE, $5, 0, $6, $7, $8)
            RETURNING {}
            "#,
            BLOCK_COLUMNS
        ))
        .bind(record.id)
        .bind(&record.identity)
        .bind(record.kind.as_str())
        .bind(record.reason.as_str())
        .bind(record.expires_at)
        .bind(Json(&record.metadata))
        .bind(&record.blocked_by)
        .bind(record.created_at)
        .fetch_one(pool)
        .await
    }

    /// Find the in-force block for an identity
    pub async fn find_active_block(
        pool: &PgPool,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BlockRow>, sqlx::Error> {
        sqlx::query_as::<_, BlockRow>(&format!(
            r#"
            SELECT {} FROM blocks
            WHERE identity = $1 AND active AND (expires_at IS NULL OR expires_at > $2)
            "#,
            BLOCK_COLUMNS
        ))
        .bind(identity)
        .bind(now)
        .fetch_optional(pool)
        .await
    }

    /// Deactivate the active block for an identity
    pub async fn deactivate_block(
        pool: &PgPool,
        identity: &str,
        at: DateTime<Utc>,
        by: &str,
        reason: &str,
    ) -> Result<Option<BlockRow>, sqlx::Error> {
        sqlx::query_as::<_, BlockRow>(&format!(
            r#"
            UPDATE blocks
            SET active = FALSE, unblocked_at = $2, unblocked_by = $3, unblock_reason = $4
            WHERE identity = $1 AND active
            RETURNING {}
            "#,
            BLOCK_COLUMNS
        ))
        .bind(identity)
        .bind(at)
        .bind(by)
        .bind(reason)
        .fetch_optional(pool)
        .await
    }

    /// Expire the identity's active block if its expiry has passed
    pub async fn expire_identity(
        pool: &PgPool,
        identity: &str,
        now: DateTime<Utc>,
        by: &str,
        reason: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE blocks
            SET active = FALSE, unblocked_at = $2, unblocked_by = $3, unblock_reason = $4
            WHERE identity = $1 AND active AND expires_at <= $2
            "#,
        )
        .bind(identity)
        .bind(now)
        .bind(by)
        .bind(reason)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Expire every active block whose expiry has passed
    pub async fn expire_due_blocks(
        pool: &PgPool,
        now: DateTime<Utc>,
        by: &str,
        reason: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE blocks
            SET active = FALSE, unblocked_at = $1, unblocked_by = $2, unblock_reason = $3
            WHERE active AND expires_at <= $1
            "#,
        )
        .bind(now)
        .bind(by)
        .bind(reason)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Bump the violation counter of the in-force block
    pub async fn increment_violation(
        pool: &PgPool,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE blocks
            SET violation_count = violation_count + 1,
                metadata = jsonb_set(metadata, '{lastSeen}', to_jsonb($2::timestamptz))
            WHERE identity = $1 AND active AND (expires_at IS NULL OR expires_at > $2)
            "#,
        )
        .bind(identity)
        .bind(now)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// List blocks matching a filter, newest first
    pub async fn list_blocks(
        pool: &PgPool,
        filter: &BlockFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<BlockRow>, sqlx::Error> {
        sqlx::query_as::<_, BlockRow>(&format!(
            r#"
            SELECT {} FROM blocks
            WHERE ($1::bool IS NULL OR active = $1)
              AND ($2::text IS NULL OR kind = $2)
              AND ($3::text IS NULL OR reason = $3)
            ORDER BY created_at DESC
            OFFSET $4 LIMIT $5
            "#,
            BLOCK_COLUMNS
        ))
        .bind(filter.active)
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.reason.map(|r| r.as_str()))
        .bind(offset)
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    /// Count blocks matching a filter
    pub async fn count_blocks(pool: &PgPool, filter: &BlockFilter) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM blocks
            WHERE ($1::bool IS NULL OR active = $1)
              AND ($2::text IS NULL OR kind = $2)
              AND ($3::text IS NULL OR reason = $3)
            "#,
        )
        .bind(filter.active)
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.reason.map(|r| r.as_str()))
        .fetch_one(pool)
        .await
    }

    /// Totals for the statistics view: (total, active, expired, recent)
    pub async fn block_counts(
        pool: &PgPool,
        now: DateTime<Utc>,
        recent_since: DateTime<Utc>,
    ) -> Result<(i64, i64, i64, i64), sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE active AND (expires_at IS NULL OR expires_at > $1)),
                COUNT(*) FILTER (WHERE expires_at <= $1),
                COUNT(*) FILTER (WHERE created_at >= $2)
            FROM blocks
            "#,
        )
        .bind(now)
        .bind(recent_since)
        .fetch_one(pool)
        .await
    }

    /// In-force block counts grouped by a column ("kind" or "reason")
    pub async fn active_counts_by(
        pool: &PgPool,
        column: GroupColumn,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, i64)>, sqlx::Error> {
        sqlx::query_as(&format!(
            r#"
            SELECT {col}, COUNT(*) FROM blocks
            WHERE active AND (expires_at IS NULL OR expires_at > $1)
            GROUP BY {col}
            "#,
            col = column.as_str()
        ))
        .bind(now)
        .fetch_all(pool)
        .await
    }

    /// Columns the statistics view groups by
    #[derive(Debug, Clone, Copy)]
    pub enum GroupColumn {
        Kind,
        Reason,
    }

    impl GroupColumn {
        fn as_str(&self) -> &'static str {
            match self {
                GroupColumn::Kind => "kind",
                GroupColumn::Reason => "reason",
            }
        }
    }
}
