//! PostgreSQL audit storage backend
//!
//! Enforces immutability using `CREATE RULE` to silently discard UPDATE/DELETE operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::{PgPool, Postgres};

use super::{AuditStorage, HistoryQuery};
use crate::audit::event::{LockoutEvent, LockoutEventKind};
use crate::error::Error;
use crate::lockout::types::{AccountId, AccountIdentity, ActorIdentity, AttemptType, OrganizationContext};

/// PostgreSQL-backed audit storage
pub struct PgAuditStorage {
    pool: PgPool,
}

impl PgAuditStorage {
    /// Create a new PostgreSQL audit storage
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Initialize the lockout_events table and immutability rules
    ///
    /// Should be called once during application startup.
    pub async fn initialize(&self) -> Result<(), Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lockout_events (
                id UUID PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                kind TEXT NOT NULL,
                account_id BIGINT NOT NULL,
                account_external_id UUID NOT NULL,
                login TEXT NOT NULL,
                organization_id BIGINT,
                organization_external_id UUID,
                failure_count INTEGER,
                lockout_duration_minutes INTEGER,
                locked_at TIMESTAMPTZ,
                unlock_at TIMESTAMPTZ,
                attempt_type TEXT,
                source_ip TEXT,
                user_agent TEXT,
                auth_source TEXT,
                unlocked_by_id BIGINT,
                unlocked_by_login TEXT,
                reason TEXT,
                metadata JSONB
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to create lockout_events table: {}", e)))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_lockout_events_account_time ON lockout_events (account_id, timestamp DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to create lockout_events index: {}", e)))?;

        // Enforce immutability: silently discard UPDATE/DELETE
        sqlx::query(
            r#"
            DO $$
            BEGIN
                IF NOT EXISTS (
                    SELECT 1 FROM pg_rules
                    WHERE rulename = 'lockout_events_no_update' AND tablename = 'lockout_events'
                ) THEN
                    CREATE RULE lockout_events_no_update AS ON UPDATE TO lockout_events DO INSTEAD NOTHING;
                END IF;

                IF NOT EXISTS (
                    SELECT 1 FROM pg_rules
                    WHERE rulename = 'lockout_events_no_delete' AND tablename = 'lockout_events'
                ) THEN
                    CREATE RULE lockout_events_no_delete AS ON DELETE TO lockout_events DO INSTEAD NOTHING;
                END IF;
            END
            $$;
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to create lockout_events immutability rules: {}", e)))?;

        Ok(())
    }
}

fn insert_query(event: &LockoutEvent) -> sqlx::query::Query<'_, Postgres, PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO lockout_events (
            id, timestamp, kind,
            account_id, account_external_id, login,
            organization_id, organization_external_id,
            failure_count, lockout_duration_minutes, locked_at, unlock_at,
            attempt_type, source_ip, user_agent, auth_source,
            unlocked_by_id, unlocked_by_login, reason, metadata
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
        "#,
    )
    .bind(event.id)
    .bind(event.timestamp)
    .bind(event.kind.as_str())
    .bind(event.account.id)
    .bind(event.account.external_id)
    .bind(&event.account.login)
    .bind(event.organization.id)
    .bind(event.organization.external_id)
    .bind(event.failure_count.map(|c| c as i32))
    .bind(event.lockout_duration_minutes.map(|m| m as i32))
    .bind(event.locked_at)
    .bind(event.unlock_at)
    .bind(event.attempt_type.as_ref().map(|t| t.as_str()))
    .bind(&event.source_ip)
    .bind(&event.user_agent)
    .bind(&event.auth_source)
    .bind(event.unlocked_by.as_ref().map(|a| a.id))
    .bind(event.unlocked_by.as_ref().map(|a| a.login.as_str()))
    .bind(&event.reason)
    .bind(&event.metadata)
}

#[async_trait]
impl AuditStorage for PgAuditStorage {
    async fn append(&self, event: &LockoutEvent) -> Result<(), Error> {
        insert_query(event)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("Failed to append lockout event: {}", e)))?;
        Ok(())
    }

    async fn append_batch(&self, events: &[LockoutEvent]) -> Result<(), Error> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Storage(format!("Failed to begin audit transaction: {}", e)))?;

        for event in events {
            insert_query(event)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Storage(format!("Failed to append lockout event: {}", e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Storage(format!("Failed to commit audit batch: {}", e)))?;
        Ok(())
    }

    async fn history(
        &self,
        account_id: AccountId,
        query: &HistoryQuery,
    ) -> Result<Vec<LockoutEvent>, Error> {
        let kinds: Vec<String> = query.kinds.iter().map(|k| k.as_str().to_string()).collect();
        let limit = match query.limit {
            Some(limit) if limit > 0 => Some(i64::from(limit)),
            _ => None,
        };

        let rows = sqlx::query_as::<_, LockoutEventRow>(
            r#"
            SELECT * FROM lockout_events
            WHERE account_id = $1
              AND (cardinality($2::text[]) = 0 OR kind = ANY($2))
              AND ($3::timestamptz IS NULL OR timestamp >= $3)
            ORDER BY timestamp DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(account_id)
        .bind(&kinds)
        .bind(query.since)
        .bind(limit)
        .bind(i64::from(query.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to query lockout history: {}", e)))?;

        rows.into_iter().map(LockoutEvent::try_from).collect()
    }
}

/// Internal row type for sqlx mapping
#[derive(sqlx::FromRow)]
struct LockoutEventRow {
    id: uuid::Uuid,
    timestamp: DateTime<Utc>,
    kind: String,
    account_id: i64,
    account_external_id: uuid::Uuid,
    login: String,
    organization_id: Option<i64>,
    organization_external_id: Option<uuid::Uuid>,
    failure_count: Option<i32>,
    lockout_duration_minutes: Option<i32>,
    locked_at: Option<DateTime<Utc>>,
    unlock_at: Option<DateTime<Utc>>,
    attempt_type: Option<String>,
    source_ip: Option<String>,
    user_agent: Option<String>,
    auth_source: Option<String>,
    unlocked_by_id: Option<i64>,
    unlocked_by_login: Option<String>,
    reason: Option<String>,
    metadata: Option<serde_json::Value>,
}

impl TryFrom<LockoutEventRow> for LockoutEvent {
    type Error = Error;

    fn try_from(row: LockoutEventRow) -> Result<Self, Self::Error> {
        let kind: LockoutEventKind = row.kind.parse()?;
        let attempt_type = row
            .attempt_type
            .as_deref()
            .map(AttemptType::parse)
            .transpose()
            .map_err(|e| Error::Storage(format!("Malformed lockout event {}: {}", row.id, e)))?;
        let unlocked_by = match (row.unlocked_by_id, row.unlocked_by_login) {
            (Some(id), Some(login)) => Some(ActorIdentity::new(id, login)),
            _ => None,
        };

        Ok(LockoutEvent {
            id: row.id,
            timestamp: row.timestamp,
            kind,
            account: AccountIdentity::new(row.account_id, row.account_external_id, row.login),
            organization: OrganizationContext {
                id: row.organization_id,
                external_id: row.organization_external_id,
            },
            failure_count: row.failure_count.map(|c| c as u32),
            lockout_duration_minutes: row.lockout_duration_minutes.map(|m| m as u32),
            locked_at: row.locked_at,
            unlock_at: row.unlock_at,
            attempt_type,
            source_ip: row.source_ip,
            user_agent: row.user_agent,
            auth_source: row.auth_source,
            unlocked_by,
            reason: row.reason,
            metadata: row.metadata,
        })
    }
}
