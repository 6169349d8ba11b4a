//! Property values.

use crate::handle::Handle;
use crate::mapping::ColumnType;
use nodedb_storage::SqlValue;

/// Type tag of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    /// No value.
    Null,
    /// Character data.
    String,
    /// Boolean.
    Boolean,
    /// Milliseconds since the Unix epoch.
    Date,
    /// Integral number.
    Integer,
    /// Floating point number.
    Float,
    /// Reference to another node.
    Reference,
    /// Opaque bytes owned by the application.
    Opaque,
}

/// A typed property value.
///
/// References hold a [`Handle`], never the node itself, so property tables
/// do not pin the object graph in memory.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value.
    Null,
    /// Character data.
    String(String),
    /// Boolean.
    Boolean(bool),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    /// Integral number.
    Integer(i64),
    /// Floating point number.
    Float(f64),
    /// Reference to another node.
    Reference(Handle),
    /// Opaque bytes.
    Opaque(Vec<u8>),
}

impl Value {
    /// Returns the type tag.
    #[must_use]
    pub fn kind(&self) -> PropertyKind {
        match self {
            Value::Null => PropertyKind::Null,
            Value::String(_) => PropertyKind::String,
            Value::Boolean(_) => PropertyKind::Boolean,
            Value::Date(_) => PropertyKind::Date,
            Value::Integer(_) => PropertyKind::Integer,
            Value::Float(_) => PropertyKind::Float,
            Value::Reference(_) => PropertyKind::Reference,
            Value::Opaque(_) => PropertyKind::Opaque,
        }
    }

    /// Returns the value rendered as a string.
    ///
    /// References render as the id of their key. Null and opaque values
    /// have no string form.
    #[must_use]
    pub fn as_string(&self) -> Option<String> {
        match self {
            Value::Null | Value::Opaque(_) => None,
            Value::String(s) => Some(s.clone()),
            Value::Boolean(b) => Some(b.to_string()),
            Value::Date(d) | Value::Integer(d) => Some(d.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Reference(h) => h.key().map(|k| k.id()),
        }
    }

    /// Returns the value as an integer, converting where that is lossless
    /// enough to be useful.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) | Value::Date(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Boolean(b) => Some(i64::from(*b)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Returns the value as a float.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) | Value::Date(i) => Some(*i as f64),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Returns the value as a boolean.
    #[must_use]
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            Value::Integer(i) => Some(*i != 0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Returns the referenced handle.
    #[must_use]
    pub fn as_handle(&self) -> Option<&Handle> {
        match self {
            Value::Reference(h) => Some(h),
            _ => None,
        }
    }

    /// Converts the value for a column of the given type.
    #[must_use]
    pub fn to_sql(&self, column_type: ColumnType) -> SqlValue {
        if matches!(self, Value::Null) {
            return SqlValue::Null;
        }
        match column_type {
            ColumnType::Text => self.as_string().map_or(SqlValue::Null, SqlValue::Text),
            ColumnType::Integer => self.as_integer().map_or(SqlValue::Null, SqlValue::Integer),
            ColumnType::Float => self.as_float().map_or(SqlValue::Null, SqlValue::Float),
            ColumnType::Boolean => self.as_boolean().map_or(SqlValue::Null, SqlValue::Boolean),
            ColumnType::Timestamp => self.as_integer().map_or(SqlValue::Null, SqlValue::Timestamp),
            ColumnType::Bytes => match self {
                Value::Opaque(bytes) => SqlValue::Bytes(bytes.clone()),
                other => other
                    .as_string()
                    .map_or(SqlValue::Null, |s| SqlValue::Bytes(s.into_bytes())),
            },
        }
    }

    /// Reads a column value into a property value of the column's type.
    #[must_use]
    pub fn from_sql(value: &SqlValue, column_type: ColumnType) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        match column_type {
            ColumnType::Text => value.as_text().map_or(Value::Null, Value::String),
            ColumnType::Integer => value.as_integer().map_or(Value::Null, Value::Integer),
            ColumnType::Float => match value {
                SqlValue::Float(f) => Value::Float(*f),
                other => other
                    .as_text()
                    .and_then(|s| s.parse().ok())
                    .map_or(Value::Null, Value::Float),
            },
            ColumnType::Boolean => match value {
                SqlValue::Boolean(b) => Value::Boolean(*b),
                other => Value::String(other.as_text().unwrap_or_default())
                    .as_boolean()
                    .map_or(Value::Null, Value::Boolean),
            },
            ColumnType::Timestamp => value.as_integer().map_or(Value::Null, Value::Date),
            ColumnType::Bytes => match value {
                SqlValue::Bytes(b) => Value::Opaque(b.clone()),
                other => other
                    .as_text()
                    .map_or(Value::Null, |s| Value::Opaque(s.into_bytes())),
            },
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

/// A named, dirty-tracked property.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    name: String,
    value: Value,
    dirty: bool,
}

impl Property {
    /// Creates a clean property, as loaded from a store.
    pub fn loaded(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            dirty: false,
        }
    }

    /// Creates a dirty property.
    pub fn changed(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            dirty: true,
        }
    }

    /// Returns the property name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the value.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Returns the type tag.
    #[must_use]
    pub fn kind(&self) -> PropertyKind {
        self.value.kind()
    }

    /// Returns true if the value changed since the last successful write.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Replaces the value and marks the property dirty.
    ///
    /// Returns false, leaving the dirty flag alone, if the value is
    /// unchanged.
    pub fn set(&mut self, value: Value) -> bool {
        if self.value == value {
            return false;
        }
        self.value = value;
        self.dirty = true;
        true
    }

    /// Clears the dirty flag after a successful write.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Returns true for names that are never persisted or locked.
    #[must_use]
    pub fn is_transient_name(name: &str) -> bool {
        name.starts_with('_')
    }
}
