//! Embedded-store record encoding.
//!
//! Nodes kept in the embedded store are written as one CBOR record each.
//! References and children are stored as keys, never as nested records, so
//! a record can be decoded without touching any other.

use crate::error::{CoreError, CoreResult};
use crate::handle::Handle;
use crate::key::Key;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A stored property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum StoredValue {
    Null,
    String(String),
    Boolean(bool),
    Date(i64),
    Integer(i64),
    Float(f64),
    Reference(Key),
    Opaque(Vec<u8>),
}

impl StoredValue {
    /// Converts a property value. References to nodes without a key have no
    /// stored form.
    pub(crate) fn from_value(value: &Value) -> Option<Self> {
        Some(match value {
            Value::Null => StoredValue::Null,
            Value::String(s) => StoredValue::String(s.clone()),
            Value::Boolean(b) => StoredValue::Boolean(*b),
            Value::Date(d) => StoredValue::Date(*d),
            Value::Integer(i) => StoredValue::Integer(*i),
            Value::Float(f) => StoredValue::Float(*f),
            Value::Reference(handle) => StoredValue::Reference(handle.key()?),
            Value::Opaque(bytes) => StoredValue::Opaque(bytes.clone()),
        })
    }

    pub(crate) fn into_value(self) -> Value {
        match self {
            StoredValue::Null => Value::Null,
            StoredValue::String(s) => Value::String(s),
            StoredValue::Boolean(b) => Value::Boolean(b),
            StoredValue::Date(d) => Value::Date(d),
            StoredValue::Integer(i) => Value::Integer(i),
            StoredValue::Float(f) => Value::Float(f),
            StoredValue::Reference(key) => Value::Reference(Handle::for_key(key)),
            StoredValue::Opaque(bytes) => Value::Opaque(bytes),
        }
    }
}

/// One entry of a stored child list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ChildRecord {
    pub(crate) key: Key,
    /// Group value for collections grouped by a property.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) group: Option<String>,
}

/// The stored form of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct NodeRecord {
    pub(crate) name: String,
    pub(crate) prototype: String,
    pub(crate) created: i64,
    pub(crate) last_modified: i64,
    #[serde(default)]
    pub(crate) parent: Option<Key>,
    #[serde(default)]
    pub(crate) properties: BTreeMap<String, StoredValue>,
    #[serde(default)]
    pub(crate) children: Vec<ChildRecord>,
}

pub(crate) fn encode(record: &NodeRecord) -> CoreResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(record, &mut bytes).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(bytes)
}

pub(crate) fn decode(bytes: &[u8]) -> CoreResult<NodeRecord> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> NodeRecord {
        let mut properties = BTreeMap::new();
        properties.insert("title".to_string(), StoredValue::String("hello".into()));
        properties.insert("votes".to_string(), StoredValue::Integer(3));
        properties.insert(
            "author".to_string(),
            StoredValue::Reference(Key::relational("user", "12")),
        );
        NodeRecord {
            name: "7".into(),
            prototype: "story".into(),
            created: 1_000,
            last_modified: 2_000,
            parent: Some(Key::embedded("0")),
            properties,
            children: vec![
                ChildRecord {
                    key: Key::embedded("8"),
                    group: None,
                },
                ChildRecord {
                    key: Key::embedded("9"),
                    group: Some("news".into()),
                },
            ],
        }
    }

    #[test]
    fn record_survives_encoding() {
        let original = record();
        let decoded = decode(&encode(&original).unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let err = decode(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, CoreError::Codec { .. }));
    }

    #[test]
    fn references_store_their_key() {
        let handle = Handle::for_key(Key::embedded("4"));
        let stored = StoredValue::from_value(&Value::Reference(handle)).unwrap();
        assert_eq!(stored, StoredValue::Reference(Key::embedded("4")));
        assert_eq!(
            stored.into_value().as_handle().and_then(Handle::key),
            Some(Key::embedded("4"))
        );
    }
}
