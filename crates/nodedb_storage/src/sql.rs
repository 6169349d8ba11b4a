//! Relational statement protocol.
//!
//! The engine never builds SQL strings by concatenation. It builds
//! [`Statement`] values, hands them to a [`RelationalConnection`], and gets an
//! [`Outcome`] back. `Statement` implements `Display` so the rendered SQL can
//! be logged.

use crate::error::{StorageError, StorageResult};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL `NULL`.
    Null,
    /// Character data.
    Text(String),
    /// Integral number.
    Integer(i64),
    /// Floating point number.
    Float(f64),
    /// Boolean.
    Boolean(bool),
    /// Point in time as milliseconds since the Unix epoch.
    Timestamp(i64),
    /// Binary data.
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// Returns true for `NULL`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Renders the value as plain text, as a driver's `getString` would.
    ///
    /// Returns `None` for `NULL`.
    #[must_use]
    pub fn as_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Integer(i) => Some(i.to_string()),
            SqlValue::Float(f) => Some(f.to_string()),
            SqlValue::Boolean(b) => Some(b.to_string()),
            SqlValue::Timestamp(t) => Some(t.to_string()),
            SqlValue::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        }
    }

    /// Returns the value as an integer if it is numeric or numeric text.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) | SqlValue::Timestamp(i) => Some(*i),
            SqlValue::Float(f) => Some(*f as i64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Compares two values the way a permissive database would.
    ///
    /// Values of the same type compare directly. Mixed numeric types compare
    /// numerically. Anything else compares by its text form. `NULL` never
    /// equals anything.
    #[must_use]
    pub fn loosely_equals(&self, other: &SqlValue) -> bool {
        if self.is_null() || other.is_null() {
            return false;
        }
        self.compare(other) == Ordering::Equal
    }

    /// Total order used for `ORDER BY`. `NULL` sorts first.
    #[must_use]
    pub fn compare(&self, other: &SqlValue) -> Ordering {
        use SqlValue::{Boolean, Float, Integer, Null, Text, Timestamp};
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Integer(a), Integer(b)) | (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Integer(a), Float(b)) => (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal),
            (Float(a), Integer(b)) => a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal),
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (a, b) => match (a.as_integer(), b.as_integer()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => a.as_text().cmp(&b.as_text()),
            },
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            SqlValue::Integer(i) => write!(f, "{i}"),
            SqlValue::Float(v) => write!(f, "{v}"),
            SqlValue::Boolean(b) => f.write_str(if *b { "TRUE" } else { "FALSE" }),
            SqlValue::Timestamp(t) => write!(f, "TIMESTAMP({t})"),
            SqlValue::Bytes(b) => {
                f.write_str("X'")?;
                for byte in b {
                    write!(f, "{byte:02X}")?;
                }
                f.write_str("'")
            }
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Boolean(value)
    }
}

/// One result row. Column names are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: BTreeMap<String, SqlValue>,
}

impl Row {
    /// Creates an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a column, builder style.
    #[must_use]
    pub fn with(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.set(column, value.into());
        self
    }

    /// Sets a column value.
    pub fn set(&mut self, column: &str, value: SqlValue) {
        self.columns.insert(column.to_ascii_lowercase(), value);
    }

    /// Returns a column value. Missing columns read as `None`.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns.get(&column.to_ascii_lowercase())
    }

    /// Returns a column as text, treating `NULL` and missing alike.
    #[must_use]
    pub fn text(&self, column: &str) -> Option<String> {
        self.get(column).and_then(SqlValue::as_text)
    }

    /// Iterates over `(column, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true if the row has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// A `WHERE` predicate. Multiple conditions are combined with `AND`.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `column = value`
    Eq(String, SqlValue),
    /// `column IN (values...)`
    In(String, Vec<SqlValue>),
    /// `column IS NULL`
    IsNull(String),
    /// `column IS NOT NULL`
    NotNull(String),
}

impl Condition {
    /// Shorthand for [`Condition::Eq`].
    pub fn eq(column: &str, value: impl Into<SqlValue>) -> Self {
        Condition::Eq(column.to_string(), value.into())
    }

    /// Evaluates the predicate against a row.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Condition::Eq(column, value) => row
                .get(column)
                .is_some_and(|actual| actual.loosely_equals(value)),
            Condition::In(column, values) => row
                .get(column)
                .is_some_and(|actual| values.iter().any(|v| actual.loosely_equals(v))),
            Condition::IsNull(column) => row.get(column).map_or(true, SqlValue::is_null),
            Condition::NotNull(column) => row.get(column).is_some_and(|v| !v.is_null()),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Eq(column, value) => write!(f, "{column} = {value}"),
            Condition::In(column, values) => {
                write!(f, "{column} IN (")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str(")")
            }
            Condition::IsNull(column) => write!(f, "{column} IS NULL"),
            Condition::NotNull(column) => write!(f, "{column} IS NOT NULL"),
        }
    }
}

/// What a `SELECT` returns.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Projection {
    /// `SELECT *`
    #[default]
    All,
    /// `SELECT column`
    Column(String),
    /// `SELECT DISTINCT column`
    Distinct(String),
    /// `SELECT COUNT(*)`
    Count,
}

/// One `ORDER BY` term.
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    /// Column to sort by.
    pub column: String,
    /// Sort descending instead of ascending.
    pub descending: bool,
}

impl SortKey {
    /// Parses an order clause such as `"name, created DESC"`.
    #[must_use]
    pub fn parse_list(clause: &str) -> Vec<SortKey> {
        clause
            .split(',')
            .filter_map(|term| {
                let mut parts = term.split_whitespace();
                let column = parts.next()?.to_string();
                let descending = parts
                    .next()
                    .is_some_and(|dir| dir.eq_ignore_ascii_case("desc"));
                Some(SortKey { column, descending })
            })
            .collect()
    }
}

/// A `SELECT` statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    /// Table to read.
    pub table: String,
    /// Returned columns.
    pub projection: Projection,
    /// `WHERE` predicates, combined with `AND`.
    pub conditions: Vec<Condition>,
    /// `ORDER BY` terms.
    pub order_by: Vec<SortKey>,
    /// `LIMIT`.
    pub limit: Option<usize>,
    /// `OFFSET`.
    pub offset: Option<usize>,
}

impl Select {
    /// Starts a `SELECT * FROM table`.
    #[must_use]
    pub fn from(table: &str) -> Self {
        Self {
            table: table.to_string(),
            projection: Projection::All,
            conditions: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Sets the projection.
    #[must_use]
    pub fn project(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    /// Adds a predicate.
    #[must_use]
    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Sets the order from a clause such as `"name DESC"`.
    #[must_use]
    pub fn order(mut self, clause: &str) -> Self {
        self.order_by = SortKey::parse_list(clause);
        self
    }

    /// Sets the row limit.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the row offset.
    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

impl fmt::Display for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.projection {
            Projection::All => f.write_str("SELECT *")?,
            Projection::Column(c) => write!(f, "SELECT {c}")?,
            Projection::Distinct(c) => write!(f, "SELECT DISTINCT {c}")?,
            Projection::Count => f.write_str("SELECT COUNT(*)")?,
        }
        write!(f, " FROM {}", self.table)?;
        for (i, condition) in self.conditions.iter().enumerate() {
            f.write_str(if i == 0 { " WHERE " } else { " AND " })?;
            write!(f, "{condition}")?;
        }
        for (i, key) in self.order_by.iter().enumerate() {
            f.write_str(if i == 0 { " ORDER BY " } else { ", " })?;
            f.write_str(&key.column)?;
            if key.descending {
                f.write_str(" DESC")?;
            }
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        if let Some(offset) = self.offset {
            write!(f, " OFFSET {offset}")?;
        }
        Ok(())
    }
}

/// A statement understood by a [`RelationalConnection`].
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// A query.
    Select(Select),
    /// `SELECT MAX(column) FROM table`
    SelectMax {
        /// Table to scan.
        table: String,
        /// Column to aggregate.
        column: String,
    },
    /// Fetches the next value of a native sequence.
    NextVal {
        /// Sequence name.
        sequence: String,
    },
    /// `INSERT INTO table (...) VALUES (...)`
    Insert {
        /// Target table.
        table: String,
        /// Column values in mapping order.
        values: Vec<(String, SqlValue)>,
    },
    /// `UPDATE table SET ... WHERE key_column = key_value`
    Update {
        /// Target table.
        table: String,
        /// Changed columns only.
        values: Vec<(String, SqlValue)>,
        /// Primary key column.
        key_column: String,
        /// Primary key value.
        key_value: SqlValue,
    },
    /// `DELETE FROM table WHERE key_column = key_value`
    Delete {
        /// Target table.
        table: String,
        /// Primary key column.
        key_column: String,
        /// Primary key value.
        key_value: SqlValue,
    },
}

impl Statement {
    /// Returns the table the statement touches, if any.
    #[must_use]
    pub fn table(&self) -> Option<&str> {
        match self {
            Statement::Select(s) => Some(&s.table),
            Statement::SelectMax { table, .. }
            | Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => Some(table),
            Statement::NextVal { .. } => None,
        }
    }

    /// Returns true for statements that modify rows.
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Statement::Insert { .. } | Statement::Update { .. } | Statement::Delete { .. }
        )
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Select(select) => write!(f, "{select}"),
            Statement::SelectMax { table, column } => {
                write!(f, "SELECT MAX({column}) FROM {table}")
            }
            Statement::NextVal { sequence } => write!(f, "SELECT {sequence}.nextval"),
            Statement::Insert { table, values } => {
                let columns: Vec<&str> = values.iter().map(|(c, _)| c.as_str()).collect();
                let rendered: Vec<String> = values.iter().map(|(_, v)| v.to_string()).collect();
                write!(
                    f,
                    "INSERT INTO {table} ({}) VALUES ({})",
                    columns.join(", "),
                    rendered.join(", ")
                )
            }
            Statement::Update {
                table,
                values,
                key_column,
                key_value,
            } => {
                let sets: Vec<String> = values.iter().map(|(c, v)| format!("{c} = {v}")).collect();
                write!(
                    f,
                    "UPDATE {table} SET {} WHERE {key_column} = {key_value}",
                    sets.join(", ")
                )
            }
            Statement::Delete {
                table,
                key_column,
                key_value,
            } => write!(f, "DELETE FROM {table} WHERE {key_column} = {key_value}"),
        }
    }
}

/// The result of executing a [`Statement`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Result rows of a query.
    Rows(Vec<Row>),
    /// A single value, such as `MAX` or `COUNT`.
    Scalar(Option<SqlValue>),
    /// Number of rows a write touched.
    Affected(usize),
}

impl Outcome {
    /// Unwraps query rows.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Statement`] if the outcome is not a row set.
    pub fn into_rows(self) -> StorageResult<Vec<Row>> {
        match self {
            Outcome::Rows(rows) => Ok(rows),
            other => Err(StorageError::statement(format!(
                "expected rows, got {other:?}"
            ))),
        }
    }

    /// Unwraps a scalar result.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Statement`] if the outcome is not a scalar.
    pub fn into_scalar(self) -> StorageResult<Option<SqlValue>> {
        match self {
            Outcome::Scalar(value) => Ok(value),
            Outcome::Rows(rows) => Ok(rows
                .into_iter()
                .next()
                .and_then(|row| row.iter().next().map(|(_, v)| v.clone()))),
            other => Err(StorageError::statement(format!(
                "expected scalar, got {other:?}"
            ))),
        }
    }

    /// Returns the affected-row count, or zero for queries.
    #[must_use]
    pub fn affected(&self) -> usize {
        match self {
            Outcome::Affected(n) => *n,
            _ => 0,
        }
    }
}

/// A connection to a relational database.
///
/// Implementations must release any per-statement resources before
/// returning, whether the statement succeeded or not.
pub trait RelationalConnection: Send + Sync {
    /// Executes one statement.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the statement fails.
    fn execute(&self, statement: &Statement) -> StorageResult<Outcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_renders_sql() {
        let select = Select::from("story")
            .project(Projection::Column("id".into()))
            .filter(Condition::eq("topic", 4i64))
            .filter(Condition::NotNull("title".into()))
            .order("created DESC, id")
            .limit(10)
            .offset(20);
        assert_eq!(
            select.to_string(),
            "SELECT id FROM story WHERE topic = 4 AND title IS NOT NULL \
             ORDER BY created DESC, id LIMIT 10 OFFSET 20"
        );
    }

    #[test]
    fn text_literals_are_escaped() {
        let stmt = Statement::Delete {
            table: "t".into(),
            key_column: "name".into(),
            key_value: "o'hara".into(),
        };
        assert_eq!(stmt.to_string(), "DELETE FROM t WHERE name = 'o''hara'");
    }

    #[test]
    fn loose_equality_crosses_types() {
        assert!(SqlValue::Integer(7).loosely_equals(&SqlValue::Text("7".into())));
        assert!(SqlValue::Integer(7).loosely_equals(&SqlValue::Float(7.0)));
        assert!(!SqlValue::Null.loosely_equals(&SqlValue::Null));
    }

    #[test]
    fn conditions_match_rows() {
        let row = Row::new().with("ID", 3i64).with("name", "x");
        assert!(Condition::eq("id", "3").matches(&row));
        assert!(Condition::In("name".into(), vec!["y".into(), "x".into()]).matches(&row));
        assert!(Condition::IsNull("missing".into()).matches(&row));
        assert!(!Condition::NotNull("missing".into()).matches(&row));
    }

    #[test]
    fn order_clause_parses_directions() {
        let keys = SortKey::parse_list(" a ,b desc,  c ASC ");
        assert_eq!(keys.len(), 3);
        assert!(!keys[0].descending);
        assert!(keys[1].descending);
        assert_eq!(keys[2].column, "c");
    }
}
