//! In-memory relational database for testing.

use crate::error::{StorageError, StorageResult};
use crate::sql::{Outcome, Projection, RelationalConnection, Row, Select, SqlValue, Statement};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct Table {
    key_column: Option<String>,
    rows: Vec<Row>,
}

/// An in-memory relational database.
///
/// Tables hold [`Row`]s and are created up front. Every executed statement is
/// recorded, so tests can assert on exactly what the engine sent.
///
/// # Example
///
/// ```rust
/// use nodedb_storage::{MemoryDatabase, RelationalConnection, Row, Select, Statement};
///
/// let db = MemoryDatabase::new();
/// db.create_table("item", Some("id"));
/// db.seed("item", Row::new().with("id", 1i64).with("name", "a")).unwrap();
///
/// let rows = db
///     .execute(&Statement::Select(Select::from("item")))
///     .unwrap()
///     .into_rows()
///     .unwrap();
/// assert_eq!(rows.len(), 1);
/// assert_eq!(db.statements().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    tables: RwLock<HashMap<String, Table>>,
    sequences: Mutex<HashMap<String, i64>>,
    log: Mutex<Vec<Statement>>,
    fail_writes: AtomicBool,
}

impl MemoryDatabase {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table. `key_column`, if given, must be unique across rows.
    ///
    /// Creating an existing table leaves it untouched.
    pub fn create_table(&self, name: &str, key_column: Option<&str>) {
        self.tables
            .write()
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| Table {
                key_column: key_column.map(str::to_string),
                rows: Vec::new(),
            });
    }

    /// Creates a native sequence whose first value is `start`.
    pub fn create_sequence(&self, name: &str, start: i64) {
        self.sequences
            .lock()
            .insert(name.to_ascii_lowercase(), start - 1);
    }

    /// Inserts a row without logging a statement.
    ///
    /// # Errors
    ///
    /// Returns an error if the table does not exist or the key is taken.
    pub fn seed(&self, table: &str, row: Row) -> StorageResult<()> {
        let mut tables = self.tables.write();
        let table_data = tables
            .get_mut(&table.to_ascii_lowercase())
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))?;
        insert_row(table, table_data, row)
    }

    /// Returns a snapshot of a table's rows in insertion order.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .get(&table.to_ascii_lowercase())
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Returns every statement executed so far.
    #[must_use]
    pub fn statements(&self) -> Vec<Statement> {
        self.log.lock().clone()
    }

    /// Returns the executed statements that modified rows.
    #[must_use]
    pub fn write_statements(&self) -> Vec<Statement> {
        self.log
            .lock()
            .iter()
            .filter(|s| s.is_write())
            .cloned()
            .collect()
    }

    /// Forgets all logged statements.
    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    /// Makes every subsequent write statement fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn select(&self, select: &Select) -> StorageResult<Outcome> {
        let tables = self.tables.read();
        let table = tables
            .get(&select.table.to_ascii_lowercase())
            .ok_or_else(|| StorageError::UnknownTable(select.table.clone()))?;

        let mut rows: Vec<&Row> = table
            .rows
            .iter()
            .filter(|row| select.conditions.iter().all(|c| c.matches(row)))
            .collect();

        if matches!(select.projection, Projection::Count) {
            return Ok(Outcome::Scalar(Some(SqlValue::Integer(rows.len() as i64))));
        }

        if !select.order_by.is_empty() {
            rows.sort_by(|a, b| {
                for key in &select.order_by {
                    let left = a.get(&key.column).unwrap_or(&SqlValue::Null);
                    let right = b.get(&key.column).unwrap_or(&SqlValue::Null);
                    let mut ord = left.compare(right);
                    if key.descending {
                        ord = ord.reverse();
                    }
                    if ord != CmpOrdering::Equal {
                        return ord;
                    }
                }
                CmpOrdering::Equal
            });
        }

        let projected: Vec<Row> = match &select.projection {
            Projection::All | Projection::Count => rows.into_iter().cloned().collect(),
            Projection::Column(column) => rows
                .into_iter()
                .map(|row| project(row, column))
                .collect(),
            Projection::Distinct(column) => {
                let mut seen: Vec<SqlValue> = Vec::new();
                let mut out = Vec::new();
                for row in rows {
                    let value = row.get(column).cloned().unwrap_or(SqlValue::Null);
                    if seen.iter().any(|v| v == &value) {
                        continue;
                    }
                    seen.push(value);
                    out.push(project(row, column));
                }
                out
            }
        };

        let offset = select.offset.unwrap_or(0);
        let limit = select.limit.unwrap_or(usize::MAX);
        Ok(Outcome::Rows(
            projected.into_iter().skip(offset).take(limit).collect(),
        ))
    }

    fn apply(&self, statement: &Statement) -> StorageResult<Outcome> {
        match statement {
            Statement::Select(select) => self.select(select),
            Statement::SelectMax { table, column } => {
                let tables = self.tables.read();
                let data = tables
                    .get(&table.to_ascii_lowercase())
                    .ok_or_else(|| StorageError::UnknownTable(table.clone()))?;
                let max = data
                    .rows
                    .iter()
                    .filter_map(|row| row.get(column))
                    .filter(|v| !v.is_null())
                    .max_by(|a, b| a.compare(b))
                    .cloned();
                Ok(Outcome::Scalar(max))
            }
            Statement::NextVal { sequence } => {
                let mut sequences = self.sequences.lock();
                let value = sequences
                    .get_mut(&sequence.to_ascii_lowercase())
                    .ok_or_else(|| StorageError::UnknownSequence(sequence.clone()))?;
                *value += 1;
                Ok(Outcome::Scalar(Some(SqlValue::Integer(*value))))
            }
            Statement::Insert { table, values } => {
                let mut tables = self.tables.write();
                let data = tables
                    .get_mut(&table.to_ascii_lowercase())
                    .ok_or_else(|| StorageError::UnknownTable(table.clone()))?;
                let mut row = Row::new();
                for (column, value) in values {
                    row.set(column, value.clone());
                }
                insert_row(table, data, row)?;
                Ok(Outcome::Affected(1))
            }
            Statement::Update {
                table,
                values,
                key_column,
                key_value,
            } => {
                let mut tables = self.tables.write();
                let data = tables
                    .get_mut(&table.to_ascii_lowercase())
                    .ok_or_else(|| StorageError::UnknownTable(table.clone()))?;
                let mut affected = 0;
                for row in &mut data.rows {
                    if row.get(key_column).is_some_and(|v| v.loosely_equals(key_value)) {
                        for (column, value) in values {
                            row.set(column, value.clone());
                        }
                        affected += 1;
                    }
                }
                Ok(Outcome::Affected(affected))
            }
            Statement::Delete {
                table,
                key_column,
                key_value,
            } => {
                let mut tables = self.tables.write();
                let data = tables
                    .get_mut(&table.to_ascii_lowercase())
                    .ok_or_else(|| StorageError::UnknownTable(table.clone()))?;
                let before = data.rows.len();
                data.rows
                    .retain(|row| !row.get(key_column).is_some_and(|v| v.loosely_equals(key_value)));
                Ok(Outcome::Affected(before - data.rows.len()))
            }
        }
    }
}

impl RelationalConnection for MemoryDatabase {
    fn execute(&self, statement: &Statement) -> StorageResult<Outcome> {
        self.log.lock().push(statement.clone());
        if statement.is_write() && self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::statement(format!(
                "write rejected: {statement}"
            )));
        }
        tracing::trace!(%statement, "memory database executing");
        self.apply(statement)
    }
}

fn project(row: &Row, column: &str) -> Row {
    let mut out = Row::new();
    out.set(column, row.get(column).cloned().unwrap_or(SqlValue::Null));
    out
}

fn insert_row(table: &str, data: &mut Table, row: Row) -> StorageResult<()> {
    if let Some(key_column) = &data.key_column {
        let key = row.get(key_column).cloned().unwrap_or(SqlValue::Null);
        if key.is_null() {
            return Err(StorageError::Constraint(format!(
                "{table}.{key_column} must not be null"
            )));
        }
        let taken = data
            .rows
            .iter()
            .any(|r| r.get(key_column).is_some_and(|v| v.loosely_equals(&key)));
        if taken {
            return Err(StorageError::Constraint(format!(
                "duplicate key {key} in {table}"
            )));
        }
    }
    data.rows.push(row);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Condition;

    fn db() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.create_table("item", Some("id"));
        for (id, name, cat) in [(1, "b", "x"), (2, "a", "y"), (3, "c", "x")] {
            db.seed(
                "item",
                Row::new()
                    .with("id", id as i64)
                    .with("name", name)
                    .with("cat", cat),
            )
            .unwrap();
        }
        db
    }

    fn query(db: &MemoryDatabase, select: Select) -> Vec<Row> {
        db.execute(&Statement::Select(select))
            .unwrap()
            .into_rows()
            .unwrap()
    }

    #[test]
    fn select_filters_and_orders() {
        let db = db();
        let rows = query(
            &db,
            Select::from("item")
                .filter(Condition::eq("cat", "x"))
                .order("name DESC"),
        );
        let names: Vec<String> = rows.iter().filter_map(|r| r.text("name")).collect();
        assert_eq!(names, vec!["c", "b"]);
    }

    #[test]
    fn distinct_and_count() {
        let db = db();
        let rows = query(
            &db,
            Select::from("item").project(Projection::Distinct("cat".into())),
        );
        assert_eq!(rows.len(), 2);

        let count = db
            .execute(&Statement::Select(
                Select::from("item").project(Projection::Count),
            ))
            .unwrap()
            .into_scalar()
            .unwrap();
        assert_eq!(count, Some(SqlValue::Integer(3)));
    }

    #[test]
    fn limit_and_offset_window() {
        let db = db();
        let rows = query(&db, Select::from("item").order("id").offset(1).limit(1));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text("id").as_deref(), Some("2"));
    }

    #[test]
    fn max_and_sequence() {
        let db = db();
        let max = db
            .execute(&Statement::SelectMax {
                table: "item".into(),
                column: "id".into(),
            })
            .unwrap()
            .into_scalar()
            .unwrap();
        assert_eq!(max, Some(SqlValue::Integer(3)));

        db.create_sequence("item_seq", 100);
        let next = |db: &MemoryDatabase| {
            db.execute(&Statement::NextVal {
                sequence: "item_seq".into(),
            })
            .unwrap()
            .into_scalar()
            .unwrap()
        };
        assert_eq!(next(&db), Some(SqlValue::Integer(100)));
        assert_eq!(next(&db), Some(SqlValue::Integer(101)));
    }

    #[test]
    fn update_and_delete_by_key() {
        let db = db();
        let outcome = db
            .execute(&Statement::Update {
                table: "item".into(),
                values: vec![("name".into(), "z".into())],
                key_column: "id".into(),
                key_value: SqlValue::Text("2".into()),
            })
            .unwrap();
        assert_eq!(outcome.affected(), 1);

        let outcome = db
            .execute(&Statement::Delete {
                table: "item".into(),
                key_column: "id".into(),
                key_value: SqlValue::Integer(1),
            })
            .unwrap();
        assert_eq!(outcome.affected(), 1);

        let rows = db.rows("item");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.text("name").as_deref() == Some("z")));
        assert_eq!(db.write_statements().len(), 2);
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let db = db();
        let err = db
            .execute(&Statement::Insert {
                table: "item".into(),
                values: vec![("id".into(), SqlValue::Integer(1))],
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)));
    }

    #[test]
    fn injected_write_failure() {
        let db = db();
        db.fail_writes(true);
        let stmt = Statement::Delete {
            table: "item".into(),
            key_column: "id".into(),
            key_value: SqlValue::Integer(1),
        };
        assert!(db.execute(&stmt).is_err());
        assert_eq!(db.rows("item").len(), 3);

        db.fail_writes(false);
        assert!(db.execute(&stmt).is_ok());
    }

    #[test]
    fn unknown_table() {
        let db = MemoryDatabase::new();
        let err = db
            .execute(&Statement::Select(Select::from("nope")))
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownTable(_)));
    }
}
