//! Relational store access for the intake importer: the [`Store`] seam,
//! count-terminated paginated reads and batch writes with per-row fallback.

use async_trait::async_trait;
use rrec_core::{Organization, Record, Table};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

mod archive;
mod memory;
mod postgres;

pub use archive::{ArchivedExport, ExportArchive};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "rrec-storage";

pub const DEFAULT_BATCH_SIZE: usize = 200;
pub const DEFAULT_PAGE_SIZE: u64 = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("row encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("{table} rejected row {id}: {reason}")]
    Rejected {
        table: Table,
        id: String,
        reason: String,
    },
    #[error("{table} has no foreign key column `{column}`")]
    UnknownColumn { table: Table, column: String },
}

/// Whether a failed write should abort the run or only cost the rows involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    RowLevel,
    Fatal,
}

pub fn classify(err: &StoreError) -> Failure {
    match err {
        StoreError::Database(db) => {
            if matches!(
                db,
                sqlx::Error::Database(_)
                    | sqlx::Error::Encode(_)
                    | sqlx::Error::Decode(_)
                    | sqlx::Error::ColumnDecode { .. }
            ) {
                Failure::RowLevel
            } else {
                Failure::Fatal
            }
        }
        StoreError::Encoding(_) | StoreError::Rejected { .. } => Failure::RowLevel,
        StoreError::Migrate(_) | StoreError::UnknownColumn { .. } => Failure::Fatal,
    }
}

/// Rows travel across this seam as JSON objects whose keys are column names.
#[async_trait]
pub trait Store: Send + Sync {
    async fn organizations(&self) -> Result<Vec<Organization>, StoreError>;

    async fn count(&self, table: Table, organization_id: Uuid) -> Result<u64, StoreError>;

    /// One page of rows in stable `(created_at, id)` order.
    async fn fetch_page(
        &self,
        table: Table,
        organization_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<JsonValue>, StoreError>;

    /// Inserts all rows or none of them.
    async fn insert_rows(&self, table: Table, rows: &[JsonValue]) -> Result<(), StoreError>;

    async fn delete_all(&self, table: Table, organization_id: Uuid) -> Result<u64, StoreError>;

    async fn delete_ids(&self, table: Table, ids: &[Uuid]) -> Result<u64, StoreError>;

    /// Re-points every `column = from` reference in `table` at `to`.
    async fn reassign(
        &self,
        table: Table,
        column: &str,
        from: Uuid,
        to: Uuid,
    ) -> Result<u64, StoreError>;

    /// Nulls `conducted_at` and `result` on the given interviews.
    async fn clear_interview_outcomes(&self, ids: &[Uuid]) -> Result<u64, StoreError>;
}

/// Resolves `column` against the foreign keys declared for `table`, so only
/// known identifiers ever reach generated SQL.
pub fn foreign_key_column(table: Table, column: &str) -> Result<&'static str, StoreError> {
    table
        .parents()
        .iter()
        .find(|(name, _)| *name == column)
        .map(|(name, _)| *name)
        .ok_or_else(|| StoreError::UnknownColumn {
            table,
            column: column.to_string(),
        })
}

/// Reads every row of `T`'s table for an organization.
///
/// Pages are requested until the row count taken up front has been read, so a
/// final page that happens to be exactly full still terminates correctly.
pub async fn read_all<T: Record>(
    store: &dyn Store,
    organization_id: Uuid,
    page_size: u64,
) -> Result<Vec<T>, StoreError> {
    let page_size = page_size.max(1);
    let total = store.count(T::TABLE, organization_id).await?;
    let mut rows = Vec::with_capacity(usize::try_from(total).unwrap_or_default());
    let mut offset = 0u64;

    while offset < total {
        let page = store
            .fetch_page(T::TABLE, organization_id, offset, page_size)
            .await?;
        if page.is_empty() {
            warn!(table = %T::TABLE, expected = total, read = offset, "table shrank while paging");
            break;
        }
        offset += page.len() as u64;
        for value in page {
            rows.push(serde_json::from_value(value)?);
        }
    }

    debug!(table = %T::TABLE, rows = rows.len(), "loaded existing rows");
    Ok(rows)
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedRow {
    pub id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableLoadReport {
    pub table: Table,
    pub attempted: usize,
    pub inserted: usize,
    pub batch_fallbacks: usize,
    pub failed: Vec<FailedRow>,
}

impl TableLoadReport {
    pub fn empty(table: Table) -> Self {
        Self {
            table,
            attempted: 0,
            inserted: 0,
            batch_fallbacks: 0,
            failed: Vec::new(),
        }
    }
}

/// Writes rows in fixed-size batches. A rejected batch is retried once row
/// by row so a single malformed row cannot void its neighbours.
pub struct BatchLoader<'a> {
    store: &'a dyn Store,
    batch_size: usize,
}

impl<'a> BatchLoader<'a> {
    pub fn new(store: &'a dyn Store, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn insert_all<T: Record>(&self, rows: &[T]) -> Result<TableLoadReport, StoreError> {
        let mut report = TableLoadReport::empty(T::TABLE);
        report.attempted = rows.len();

        for chunk in rows.chunks(self.batch_size) {
            let mut ids = Vec::with_capacity(chunk.len());
            let mut values = Vec::with_capacity(chunk.len());
            for row in chunk {
                match serde_json::to_value(row) {
                    Ok(value) => {
                        ids.push(row.id());
                        values.push(value);
                    }
                    Err(err) => report.failed.push(FailedRow {
                        id: row.id(),
                        reason: err.to_string(),
                    }),
                }
            }
            if values.is_empty() {
                continue;
            }

            match self.store.insert_rows(T::TABLE, &values).await {
                Ok(()) => report.inserted += values.len(),
                Err(err) if classify(&err) == Failure::Fatal => return Err(err),
                Err(err) => {
                    warn!(table = %T::TABLE, batch = values.len(), error = %err, "batch rejected, inserting rows individually");
                    report.batch_fallbacks += 1;
                    for (id, value) in ids.into_iter().zip(values.iter()) {
                        match self
                            .store
                            .insert_rows(T::TABLE, std::slice::from_ref(value))
                            .await
                        {
                            Ok(()) => report.inserted += 1,
                            Err(err) if classify(&err) == Failure::Fatal => return Err(err),
                            Err(err) => {
                                debug!(table = %T::TABLE, %id, error = %err, "row insert failed");
                                report.failed.push(FailedRow {
                                    id,
                                    reason: err.to_string(),
                                });
                            }
                        }
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rrec_core::{Company, Gender, JobSeeker};

    fn seeker(org: Uuid, phone: &str) -> JobSeeker {
        JobSeeker {
            id: Uuid::new_v4(),
            organization_id: org,
            phone: phone.to_string(),
            name: None,
            gender: Gender::Unknown,
            age: None,
            has_license: false,
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn read_all_terminates_when_last_page_is_exactly_full() {
        let store = MemoryStore::with_organization("acme");
        let org = store.organization_id().unwrap();
        let rows: Vec<_> = (0..6).map(|i| seeker(org, &format!("0900000000{i}"))).collect();
        BatchLoader::new(&store, 100).insert_all(&rows).await.unwrap();

        let read: Vec<JobSeeker> = read_all(&store, org, 3).await.unwrap();
        assert_eq!(read.len(), 6);
        assert_eq!(read, rows);
    }

    #[tokio::test]
    async fn read_all_only_sees_own_organization() {
        let store = MemoryStore::with_organization("acme");
        let org = store.organization_id().unwrap();
        let other = Uuid::new_v4();
        BatchLoader::new(&store, 10)
            .insert_all(&[seeker(org, "0901"), seeker(other, "0902")])
            .await
            .unwrap();

        let read: Vec<JobSeeker> = read_all(&store, org, 10).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].phone, "0901");
    }

    #[tokio::test]
    async fn failed_batch_falls_back_to_individual_inserts() {
        let store = MemoryStore::with_organization("acme").with_row_filter(|table, row| {
            (table == Table::JobSeekers && row["phone"] == "BAD").then(|| "bad phone".to_string())
        });
        let org = store.organization_id().unwrap();
        let rows = vec![seeker(org, "0901"), seeker(org, "BAD"), seeker(org, "0903")];

        let report = BatchLoader::new(&store, 10).insert_all(&rows).await.unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.batch_fallbacks, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, rows[1].id);
        assert_eq!(store.len(Table::JobSeekers).await, 2);
    }

    #[tokio::test]
    async fn lost_connection_aborts_instead_of_falling_back() {
        let store = MemoryStore::with_organization("acme").with_disconnect_after(1);
        let org = store.organization_id().unwrap();
        let rows: Vec<_> = (0..4).map(|i| seeker(org, &format!("090{i}"))).collect();

        let err = BatchLoader::new(&store, 2).insert_all(&rows).await.unwrap_err();
        assert_eq!(classify(&err), Failure::Fatal);
        // The first batch landed; the second was neither retried row by row nor recorded.
        assert_eq!(store.len(Table::JobSeekers).await, 2);
    }

    #[tokio::test]
    async fn clean_batches_never_fall_back() {
        let store = MemoryStore::with_organization("acme");
        let org = store.organization_id().unwrap();
        let rows: Vec<_> = (0..5).map(|i| seeker(org, &format!("090{i}"))).collect();

        let report = BatchLoader::new(&store, 2).insert_all(&rows).await.unwrap();
        assert_eq!(report.inserted, 5);
        assert_eq!(report.batch_fallbacks, 0);
        assert!(report.failed.is_empty());
    }

    #[test]
    fn only_declared_foreign_keys_are_accepted() {
        assert_eq!(
            foreign_key_column(Table::Jobs, "company_id").unwrap(),
            "company_id"
        );
        assert!(foreign_key_column(Table::Jobs, "title; DROP TABLE jobs").is_err());
        assert!(foreign_key_column(Table::Companies, "company_id").is_err());
    }

    #[test]
    fn rejected_rows_are_row_level_failures() {
        let err = StoreError::Rejected {
            table: Table::Companies,
            id: "x".into(),
            reason: "dup".into(),
        };
        assert_eq!(classify(&err), Failure::RowLevel);
        assert_eq!(classify(&StoreError::Database(sqlx::Error::PoolClosed)), Failure::Fatal);
    }

    #[tokio::test]
    async fn reassign_moves_child_references() {
        let store = MemoryStore::with_organization("acme");
        let org = store.organization_id().unwrap();
        let created_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap();
        let a = Company { id: Uuid::new_v4(), organization_id: org, name: "A".into(), created_at };
        let b = Company { id: Uuid::new_v4(), organization_id: org, name: "A ".into(), created_at };
        let loader = BatchLoader::new(&store, 10);
        loader.insert_all(&[a.clone(), b.clone()]).await.unwrap();
        let job = rrec_core::Job {
            id: Uuid::new_v4(),
            organization_id: org,
            company_id: b.id,
            title: "Picker".into(),
            created_at,
        };
        loader.insert_all(&[job]).await.unwrap();

        assert!(store.delete_ids(Table::Companies, &[b.id]).await.is_err());
        let moved = store.reassign(Table::Jobs, "company_id", b.id, a.id).await.unwrap();
        assert_eq!(moved, 1);
        assert_eq!(store.delete_ids(Table::Companies, &[b.id]).await.unwrap(), 1);
    }
}
