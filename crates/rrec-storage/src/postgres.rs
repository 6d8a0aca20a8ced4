use async_trait::async_trait;
use rrec_core::{Organization, Table};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::{foreign_key_column, Store, StoreError};

/// Postgres-backed [`Store`].
///
/// Rows are exchanged as JSON objects and expanded server-side with
/// `jsonb_populate_recordset`, so column names must match the serialized
/// field names of the domain types. Table and column identifiers only ever
/// come from [`Table`] and its declared foreign keys.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// The importer issues strictly sequential statements, so one
    /// connection is all it needs.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("schema migrations applied");
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn organizations(&self) -> Result<Vec<Organization>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, created_at
              FROM organizations
             ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Organization {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }

    async fn count(&self, table: Table, organization_id: Uuid) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE organization_id = $1",
            table.as_str()
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(organization_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn fetch_page(
        &self,
        table: Table,
        organization_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let sql = format!(
            r#"
            SELECT to_jsonb(t) AS row
              FROM {} t
             WHERE t.organization_id = $1
             ORDER BY t.created_at, t.id
            OFFSET $2
             LIMIT $3
            "#,
            table.as_str()
        );
        let rows = sqlx::query(&sql)
            .bind(organization_id)
            .bind(offset as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get::<JsonValue, _>("row")?);
        }
        Ok(out)
    }

    async fn insert_rows(&self, table: Table, rows: &[JsonValue]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {0} SELECT * FROM jsonb_populate_recordset(NULL::{0}, $1)",
            table.as_str()
        );
        sqlx::query(&sql)
            .bind(JsonValue::Array(rows.to_vec()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_all(&self, table: Table, organization_id: Uuid) -> Result<u64, StoreError> {
        let sql = format!("DELETE FROM {} WHERE organization_id = $1", table.as_str());
        let done = sqlx::query(&sql)
            .bind(organization_id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    async fn delete_ids(&self, table: Table, ids: &[Uuid]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM {} WHERE id = ANY($1)", table.as_str());
        let done = sqlx::query(&sql)
            .bind(ids.to_vec())
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    async fn reassign(
        &self,
        table: Table,
        column: &str,
        from: Uuid,
        to: Uuid,
    ) -> Result<u64, StoreError> {
        let column = foreign_key_column(table, column)?;
        let sql = format!(
            "UPDATE {} SET {column} = $2 WHERE {column} = $1",
            table.as_str()
        );
        let done = sqlx::query(&sql)
            .bind(from)
            .bind(to)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    async fn clear_interview_outcomes(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let done = sqlx::query(
            r#"
            UPDATE interviews
               SET conducted_at = NULL,
                   result = NULL
             WHERE id = ANY($1)
            "#,
        )
        .bind(ids.to_vec())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }
}
