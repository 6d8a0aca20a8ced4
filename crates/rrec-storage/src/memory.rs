use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use rrec_core::{Organization, Record, Table, PHONE_MAX_LEN};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{foreign_key_column, Store, StoreError};

type RowFilter = Box<dyn Fn(Table, &JsonValue) -> Option<String> + Send + Sync>;

/// In-process [`Store`] used for dry runs and tests.
///
/// Enforces what the relational schema would: unique ids, the phone column
/// width, foreign keys on insert and restrict-on-delete.
#[derive(Default)]
pub struct MemoryStore {
    organizations: Vec<Organization>,
    tables: Mutex<BTreeMap<Table, Vec<JsonValue>>>,
    row_filter: Option<RowFilter>,
    /// Insert calls left before the connection is dropped.
    inserts_before_disconnect: Option<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_organization(name: &str) -> Self {
        Self {
            organizations: vec![Organization {
                id: Uuid::new_v4(),
                name: name.to_string(),
                created_at: Utc::now(),
            }],
            ..Self::default()
        }
    }

    /// Rejects rows for which `filter` returns a reason.
    pub fn with_row_filter(
        mut self,
        filter: impl Fn(Table, &JsonValue) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.row_filter = Some(Box::new(filter));
        self
    }

    /// Fails every `insert_rows` call after the first `calls` with a closed
    /// pool, the way a lost database connection surfaces.
    pub fn with_disconnect_after(mut self, calls: usize) -> Self {
        self.inserts_before_disconnect = Some(AtomicUsize::new(calls));
        self
    }

    pub fn organization_id(&self) -> Option<Uuid> {
        self.organizations.first().map(|o| o.id)
    }

    pub async fn len(&self, table: Table) -> usize {
        self.tables.lock().await.get(&table).map_or(0, Vec::len)
    }

    pub async fn rows<T: Record>(&self) -> Vec<T> {
        let tables = self.tables.lock().await;
        tables
            .get(&T::TABLE)
            .into_iter()
            .flatten()
            .filter_map(|value| serde_json::from_value(value.clone()).ok())
            .collect()
    }
}

fn row_id(row: &JsonValue) -> Option<&str> {
    row.get("id").and_then(JsonValue::as_str)
}

fn belongs_to(row: &JsonValue, organization_id: Uuid) -> bool {
    row.get("organization_id").and_then(JsonValue::as_str)
        == Some(organization_id.to_string().as_str())
}

fn ids_in(tables: &BTreeMap<Table, Vec<JsonValue>>, table: Table) -> HashSet<String> {
    tables
        .get(&table)
        .into_iter()
        .flatten()
        .filter_map(|row| row_id(row).map(str::to_string))
        .collect()
}

/// Ids in `table` that some child row still points at.
fn referenced_ids(tables: &BTreeMap<Table, Vec<JsonValue>>, table: Table) -> HashSet<String> {
    let mut out = HashSet::new();
    for child in Table::INSERT_ORDER {
        for (column, parent) in child.parents() {
            if *parent != table {
                continue;
            }
            for row in tables.get(&child).into_iter().flatten() {
                if let Some(id) = row.get(*column).and_then(JsonValue::as_str) {
                    out.insert(id.to_string());
                }
            }
        }
    }
    out
}

fn reject(table: Table, row: &JsonValue, reason: impl Into<String>) -> StoreError {
    StoreError::Rejected {
        table,
        id: row_id(row).unwrap_or("<no id>").to_string(),
        reason: reason.into(),
    }
}

impl MemoryStore {
    fn check_row(
        &self,
        parent_ids: &BTreeMap<Table, HashSet<String>>,
        seen: &mut HashSet<String>,
        table: Table,
        row: &JsonValue,
    ) -> Result<(), StoreError> {
        let Some(id) = row_id(row) else {
            return Err(reject(table, row, "missing id"));
        };
        if !seen.insert(id.to_string()) {
            return Err(reject(table, row, "duplicate primary key"));
        }
        if table == Table::JobSeekers {
            let phone = row.get("phone").and_then(JsonValue::as_str).unwrap_or_default();
            if phone.chars().count() > PHONE_MAX_LEN {
                return Err(reject(table, row, "phone exceeds column width"));
            }
        }
        for (column, parent) in table.parents() {
            let Some(parent_id) = row.get(*column).and_then(JsonValue::as_str) else {
                continue;
            };
            if !parent_ids
                .get(parent)
                .is_some_and(|ids| ids.contains(parent_id))
            {
                return Err(reject(
                    table,
                    row,
                    format!("{column} references missing {parent} row {parent_id}"),
                ));
            }
        }
        if let Some(reason) = self.row_filter.as_ref().and_then(|f| f(table, row)) {
            return Err(reject(table, row, reason));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn organizations(&self) -> Result<Vec<Organization>, StoreError> {
        Ok(self.organizations.clone())
    }

    async fn count(&self, table: Table, organization_id: Uuid) -> Result<u64, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(&table)
            .into_iter()
            .flatten()
            .filter(|row| belongs_to(row, organization_id))
            .count() as u64)
    }

    async fn fetch_page(
        &self,
        table: Table,
        organization_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(&table)
            .into_iter()
            .flatten()
            .filter(|row| belongs_to(row, organization_id))
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn insert_rows(&self, table: Table, rows: &[JsonValue]) -> Result<(), StoreError> {
        if let Some(budget) = &self.inserts_before_disconnect {
            let spent = budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err();
            if spent {
                return Err(StoreError::Database(sqlx::Error::PoolClosed));
            }
        }
        let mut tables = self.tables.lock().await;
        let mut seen = ids_in(&tables, table);
        let parent_ids: BTreeMap<Table, HashSet<String>> = table
            .parents()
            .iter()
            .map(|(_, parent)| (*parent, ids_in(&tables, *parent)))
            .collect();
        for row in rows {
            self.check_row(&parent_ids, &mut seen, table, row)?;
        }
        tables.entry(table).or_default().extend(rows.iter().cloned());
        Ok(())
    }

    async fn delete_all(&self, table: Table, organization_id: Uuid) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let referenced = referenced_ids(&tables, table);
        let rows = tables.entry(table).or_default();
        if let Some(row) = rows
            .iter()
            .filter(|row| belongs_to(row, organization_id))
            .find(|row| row_id(row).is_some_and(|id| referenced.contains(id)))
        {
            return Err(reject(table, row, "row is still referenced"));
        }
        let before = rows.len();
        rows.retain(|row| !belongs_to(row, organization_id));
        Ok((before - rows.len()) as u64)
    }

    async fn delete_ids(&self, table: Table, ids: &[Uuid]) -> Result<u64, StoreError> {
        let targets: HashSet<String> = ids.iter().map(Uuid::to_string).collect();
        let mut tables = self.tables.lock().await;
        let referenced = referenced_ids(&tables, table);
        let rows = tables.entry(table).or_default();
        let is_target = |row: &JsonValue| row_id(row).is_some_and(|id| targets.contains(id));
        if let Some(row) = rows
            .iter()
            .filter(|row| is_target(*row))
            .find(|row| row_id(row).is_some_and(|id| referenced.contains(id)))
        {
            return Err(reject(table, row, "row is still referenced"));
        }
        let before = rows.len();
        rows.retain(|row| !is_target(row));
        Ok((before - rows.len()) as u64)
    }

    async fn reassign(
        &self,
        table: Table,
        column: &str,
        from: Uuid,
        to: Uuid,
    ) -> Result<u64, StoreError> {
        let column = foreign_key_column(table, column)?;
        let (from, to) = (from.to_string(), to.to_string());
        let mut tables = self.tables.lock().await;
        let mut moved = 0;
        for row in tables.entry(table).or_default().iter_mut() {
            if row.get(column).and_then(JsonValue::as_str) == Some(from.as_str()) {
                if let Some(fields) = row.as_object_mut() {
                    fields.insert(column.to_string(), JsonValue::String(to.clone()));
                    moved += 1;
                }
            }
        }
        Ok(moved)
    }

    async fn clear_interview_outcomes(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        let targets: HashSet<String> = ids.iter().map(Uuid::to_string).collect();
        let mut tables = self.tables.lock().await;
        let mut cleared = 0;
        for row in tables.entry(Table::Interviews).or_default().iter_mut() {
            if row_id(row).is_some_and(|id| targets.contains(id)) {
                if let Some(fields) = row.as_object_mut() {
                    fields.insert("conducted_at".to_string(), JsonValue::Null);
                    fields.insert("result".to_string(), JsonValue::Null);
                    cleared += 1;
                }
            }
        }
        Ok(cleared)
    }
}
