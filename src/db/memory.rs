use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::debug;

use crate::dataset::{Column, ColumnType, Dataset, Value};
use crate::error::IngestError;

use super::store::{Connector, Store};
use super::table::{PartitionRange, TableDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ReplaceTable,
    AppendRows,
    CreatePartitionedTable,
    CreateRangePartition,
    InsertSelect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Looks like a dropped connection, eligible for a retry
    Transient,
    /// Any other database error
    Fatal,
}

#[derive(Debug, Clone)]
enum TableKind {
    Plain,
    Partitioned { key: usize, children: Vec<String> },
    Partition { parent: String, range: PartitionRange },
}

#[derive(Debug, Clone)]
struct MemoryTable {
    columns: Vec<Column>,
    kind: TableKind,
    rows: Vec<Vec<Value>>,
}

type Tables = BTreeMap<String, MemoryTable>;

#[derive(Debug, Default)]
struct Shared {
    tables: Tables,
    failing_connects: usize,
    faults: Vec<(Step, Fault, usize)>,
    connects: usize,
    open: usize,
    executed: Vec<Step>,
}

impl Shared {
    fn take_fault(&mut self, step: Step) -> Result<(), IngestError> {
        let found = self
            .faults
            .iter_mut()
            .find(|(s, _, remaining)| *s == step && *remaining > 0);
        match found {
            Some((_, fault, remaining)) => {
                *remaining -= 1;
                let msg = format!("injected failure at {:?}", step);
                match fault {
                    Fault::Transient => Err(IngestError::TransientConnection(msg)),
                    Fault::Fatal => Err(IngestError::Database(msg)),
                }
            }
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<Mutex<Shared>>,
}

impl MemoryDatabase {
    pub fn new() -> MemoryDatabase {
        MemoryDatabase::default()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The next `n` connection attempts fail with a transient error.
    pub fn fail_connects(&self, n: usize) {
        self.lock().failing_connects = n;
    }

    /// The next `times` executions of `step` fail.
    pub fn fail_at(&self, step: Step, fault: Fault, times: usize) {
        self.lock().faults.push((step, fault, times));
    }

    /// Number of successful connections so far.
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open
    }

    /// Steps which completed, in order.
    pub fn executed_steps(&self) -> Vec<Step> {
        self.lock().executed.clone()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.lock().tables.contains_key(name)
    }

    pub fn count(&self, name: &str) -> Option<u64> {
        let shared = self.lock();
        count_rows(&shared.tables, name).ok()
    }

    /// Names of the partitions attached to a partitioned table.
    pub fn partitions_of(&self, parent: &str) -> Vec<String> {
        match self.lock().tables.get(parent) {
            Some(MemoryTable {
                kind: TableKind::Partitioned { children, .. },
                ..
            }) => children.clone(),
            _ => Vec::new(),
        }
    }

    /// Rows stored directly in a table (empty for a partitioned parent).
    pub fn stored_rows(&self, name: &str) -> Option<Vec<Vec<Value>>> {
        self.lock().tables.get(name).map(|t| t.rows.clone())
    }
}

#[async_trait]
impl Connector for MemoryDatabase {
    type Conn = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, IngestError> {
        let mut shared = self.lock();
        if shared.failing_connects > 0 {
            shared.failing_connects -= 1;
            return Err(IngestError::TransientConnection(
                "injected connection failure".to_string(),
            ));
        }
        shared.connects += 1;
        shared.open += 1;
        Ok(MemoryConnection {
            db: self.clone(),
            snapshot: None,
        })
    }
}

pub struct MemoryConnection {
    db: MemoryDatabase,
    /// Tables as they were at BEGIN
    snapshot: Option<Tables>,
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut shared = self.db.lock();
        // an open transaction dies with its connection
        if let Some(tables) = self.snapshot.take() {
            shared.tables = tables;
        }
        shared.open -= 1;
    }
}

fn count_rows(tables: &Tables, name: &str) -> Result<u64, IngestError> {
    let table = tables
        .get(name)
        .ok_or_else(|| IngestError::MissingTable(name.to_string()))?;
    match &table.kind {
        TableKind::Partitioned { children, .. } => children
            .iter()
            .map(|c| count_rows(tables, c))
            .sum::<Result<u64, IngestError>>(),
        _ => Ok(table.rows.len() as u64),
    }
}

fn drop_table(tables: &mut Tables, name: &str) {
    if let Some(table) = tables.remove(name) {
        match table.kind {
            TableKind::Partitioned { children, .. } => {
                for child in children {
                    tables.remove(&child);
                }
            }
            TableKind::Partition { parent, .. } => {
                if let Some(MemoryTable {
                    kind: TableKind::Partitioned { children, .. },
                    ..
                }) = tables.get_mut(&parent)
                {
                    children.retain(|c| c != name);
                }
            }
            TableKind::Plain => {}
        }
    }
}

/// All the rows of a table, gathering partitions for a partitioned table.
fn scan(tables: &Tables, name: &str) -> Result<Vec<Vec<Value>>, IngestError> {
    let table = tables
        .get(name)
        .ok_or_else(|| IngestError::MissingTable(name.to_string()))?;
    match &table.kind {
        TableKind::Partitioned { children, .. } => {
            let mut out = Vec::new();
            for child in children {
                out.extend(scan(tables, child)?);
            }
            Ok(out)
        }
        _ => Ok(table.rows.clone()),
    }
}

fn partition_key_error(table: &str, key: &Column, value: &Value) -> IngestError {
    IngestError::NoPartitionForRow {
        table: table.to_string(),
        key: key.name.clone(),
        value: value.to_string(),
    }
}

/// Decide which table each row lands in.  Nothing is written, so a failure
/// leaves the tables untouched.
fn route(
    tables: &Tables,
    name: &str,
    rows: Vec<Vec<Value>>,
) -> Result<Vec<(String, Vec<Value>)>, IngestError> {
    let table = tables
        .get(name)
        .ok_or_else(|| IngestError::MissingTable(name.to_string()))?;
    let mut out = Vec::with_capacity(rows.len());
    match &table.kind {
        TableKind::Plain => {
            out.extend(rows.into_iter().map(|row| (name.to_string(), row)));
        }
        TableKind::Partitioned { key, children } => {
            for row in rows {
                let target = match &row[*key] {
                    Value::Timestamp(dt) => children.iter().find(|c| {
                        matches!(
                            tables.get(*c),
                            Some(MemoryTable { kind: TableKind::Partition { range, .. }, .. })
                                if range.contains(dt)
                        )
                    }),
                    _ => None,
                };
                match target {
                    Some(child) => out.push((child.clone(), row)),
                    None => {
                        return Err(partition_key_error(name, &table.columns[*key], &row[*key]))
                    }
                }
            }
        }
        TableKind::Partition { parent, range } => {
            let key = match tables.get(parent).map(|p| &p.kind) {
                Some(TableKind::Partitioned { key, .. }) => *key,
                _ => return Err(IngestError::MissingTable(parent.clone())),
            };
            for row in rows {
                let ok = matches!(&row[key], Value::Timestamp(dt) if range.contains(dt));
                if !ok {
                    return Err(partition_key_error(name, &table.columns[key], &row[key]));
                }
                out.push((name.to_string(), row));
            }
        }
    }
    Ok(out)
}

impl MemoryConnection {
    fn run<T>(
        &mut self,
        step: Step,
        f: impl FnOnce(&mut Tables) -> Result<T, IngestError>,
    ) -> Result<T, IngestError> {
        let mut shared = self.db.lock();
        shared.take_fault(step)?;
        let out = f(&mut shared.tables)?;
        debug!("memory store: {:?} done", step);
        shared.executed.push(step);
        Ok(out)
    }
}

#[async_trait]
impl Store for MemoryConnection {
    async fn replace_table(&mut self, table: &TableDescriptor) -> Result<(), IngestError> {
        self.run(Step::ReplaceTable, |tables| {
            drop_table(tables, &table.name);
            tables.insert(
                table.name.clone(),
                MemoryTable {
                    columns: table.columns.clone(),
                    kind: TableKind::Plain,
                    rows: Vec::new(),
                },
            );
            Ok(())
        })
    }

    async fn append_rows(&mut self, table: &str, ds: &Dataset) -> Result<u64, IngestError> {
        self.run(Step::AppendRows, |tables| {
            let existing = tables
                .get(table)
                .ok_or_else(|| IngestError::MissingTable(table.to_string()))?;
            if existing.columns != ds.columns() {
                return Err(IngestError::schema_mismatch(
                    table,
                    "dataset columns differ from the table columns",
                ));
            }
            let routed = route(tables, table, ds.rows().to_vec())?;
            let n = routed.len() as u64;
            for (target, row) in routed {
                if let Some(t) = tables.get_mut(&target) {
                    t.rows.push(row);
                }
            }
            Ok(n)
        })
    }

    async fn create_partitioned_table(
        &mut self,
        table: &TableDescriptor,
        key: &str,
    ) -> Result<(), IngestError> {
        self.run(Step::CreatePartitionedTable, |tables| {
            if tables.contains_key(&table.name) {
                return Err(IngestError::DuplicateTable(table.name.clone()));
            }
            let key = table
                .columns
                .iter()
                .position(|c| c.name == key && c.ty == ColumnType::Timestamp)
                .ok_or_else(|| {
                    IngestError::Database(format!("no timestamp column {} to partition by", key))
                })?;
            tables.insert(
                table.name.clone(),
                MemoryTable {
                    columns: table.columns.clone(),
                    kind: TableKind::Partitioned {
                        key,
                        children: Vec::new(),
                    },
                    rows: Vec::new(),
                },
            );
            Ok(())
        })
    }

    async fn create_range_partition(
        &mut self,
        child: &str,
        parent: &str,
        range: &PartitionRange,
    ) -> Result<(), IngestError> {
        self.run(Step::CreateRangePartition, |tables| {
            if tables.contains_key(child) {
                return Err(IngestError::DuplicateTable(child.to_string()));
            }
            let parent_table = tables
                .get(parent)
                .ok_or_else(|| IngestError::MissingTable(parent.to_string()))?;
            let siblings = match &parent_table.kind {
                TableKind::Partitioned { children, .. } => children,
                _ => {
                    return Err(IngestError::Database(format!(
                        "table {} is not partitioned",
                        parent
                    )))
                }
            };
            for sibling in siblings {
                if let Some(MemoryTable {
                    kind: TableKind::Partition { range: other, .. },
                    ..
                }) = tables.get(sibling)
                {
                    if other.overlaps(range) {
                        return Err(IngestError::Database(format!(
                            "partition {} would overlap partition {}",
                            child, sibling
                        )));
                    }
                }
            }
            let columns = parent_table.columns.clone();
            if let Some(MemoryTable {
                kind: TableKind::Partitioned { children, .. },
                ..
            }) = tables.get_mut(parent)
            {
                children.push(child.to_string());
            }
            tables.insert(
                child.to_string(),
                MemoryTable {
                    columns,
                    kind: TableKind::Partition {
                        parent: parent.to_string(),
                        range: *range,
                    },
                    rows: Vec::new(),
                },
            );
            Ok(())
        })
    }

    async fn insert_select_all(&mut self, target: &str, source: &str) -> Result<u64, IngestError> {
        self.run(Step::InsertSelect, |tables| {
            let target_columns = tables
                .get(target)
                .ok_or_else(|| IngestError::MissingTable(target.to_string()))?
                .columns
                .clone();
            let source_columns = tables
                .get(source)
                .ok_or_else(|| IngestError::MissingTable(source.to_string()))?
                .columns
                .clone();
            if source_columns.len() > target_columns.len() {
                return Err(IngestError::schema_mismatch(
                    target,
                    "INSERT has more expressions than target columns",
                ));
            }
            for (i, (s, t)) in source_columns.iter().zip(&target_columns).enumerate() {
                if s.ty != t.ty {
                    return Err(IngestError::schema_mismatch(
                        target,
                        format!(
                            "column {} is of type {} but expression {} is of type {}",
                            i + 1,
                            t.ty,
                            s.name,
                            s.ty
                        ),
                    ));
                }
            }
            // missing trailing columns get their default, NULL
            let rows = scan(tables, source)?
                .into_iter()
                .map(|mut row| {
                    row.resize(target_columns.len(), Value::Null);
                    row
                })
                .collect();
            let routed = route(tables, target, rows)?;
            let n = routed.len() as u64;
            for (name, row) in routed {
                if let Some(t) = tables.get_mut(&name) {
                    t.rows.push(row);
                }
            }
            Ok(n)
        })
    }

    async fn table_exists(&mut self, name: &str) -> Result<bool, IngestError> {
        Ok(self.db.has_table(name))
    }

    async fn table_columns(&mut self, name: &str) -> Result<Vec<Column>, IngestError> {
        self.db
            .lock()
            .tables
            .get(name)
            .map(|t| t.columns.clone())
            .ok_or_else(|| IngestError::MissingTable(name.to_string()))
    }

    async fn row_count(&mut self, name: &str) -> Result<u64, IngestError> {
        count_rows(&self.db.lock().tables, name)
    }

    async fn begin(&mut self) -> Result<(), IngestError> {
        if self.snapshot.is_some() {
            return Err(IngestError::Database(
                "there is already a transaction in progress".to_string(),
            ));
        }
        self.snapshot = Some(self.db.lock().tables.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), IngestError> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), IngestError> {
        if let Some(tables) = self.snapshot.take() {
            self.db.lock().tables = tables;
        }
        Ok(())
    }
}
