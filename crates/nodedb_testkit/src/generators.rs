//! Property-based test generators using proptest.
//!
//! Provides strategies for keys, property values and names that keep the
//! engine's naming rules.

use nodedb_core::{Key, Value};
use proptest::prelude::*;

/// Strategy for record ids.
pub fn id_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        (1i64..1_000_000).prop_map(|n| n.to_string()),
        prop::string::string_regex("[a-f0-9]{32}").expect("Invalid regex"),
    ]
}

/// Strategy for table names.
pub fn table_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for persistent property names, which never start with `_`.
pub fn property_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-zA-Z0-9]{0,19}").expect("Invalid regex")
}

/// Strategy for access names such as slugs.
pub fn slug_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9]{1,8}(-[a-z0-9]{1,8}){0,3}").expect("Invalid regex")
}

/// Strategy for primary keys of either store.
pub fn primary_key_strategy() -> impl Strategy<Value = Key> {
    prop_oneof![
        id_strategy().prop_map(Key::embedded),
        (table_strategy(), id_strategy()).prop_map(|(table, id)| Key::relational(table, id)),
    ]
}

/// Strategy for keys of every shape, synthetic keys nested up to three
/// levels.
pub fn key_strategy() -> impl Strategy<Value = Key> {
    let leaf = prop_oneof![
        3 => primary_key_strategy(),
        1 => (
            table_strategy(),
            prop::collection::vec((table_strategy(), id_strategy()), 1..3)
        )
            .prop_map(|(table, parts)| Key::composite(table, parts)),
    ];
    leaf.prop_recursive(3, 8, 1, |inner| {
        (inner, slug_strategy()).prop_map(|(parent, name)| Key::synthetic(parent, name))
    })
}

/// Strategy for scalar property values.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        ".{0,64}".prop_map(Value::String),
        any::<bool>().prop_map(Value::Boolean),
        (0i64..4_102_444_800_000).prop_map(Value::Date),
        any::<i64>().prop_map(Value::Integer),
        (-1.0e9f64..1.0e9).prop_map(Value::Float),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(Value::Opaque),
    ]
}

/// A single edit applied to a node in generated scenarios.
#[derive(Debug, Clone)]
pub enum PropertyEdit {
    /// Set a property.
    Set {
        /// Property name.
        name: String,
        /// New value.
        value: Value,
    },
    /// Remove a property.
    Unset {
        /// Property name.
        name: String,
    },
}

/// Strategy for a sequence of property edits over a small name pool, so
/// edits of the same property collide.
pub fn property_edits_strategy(max_len: usize) -> impl Strategy<Value = Vec<PropertyEdit>> {
    let names = prop::sample::select(vec!["title", "body", "rank", "flag", "stamp"]);
    let edit = prop_oneof![
        3 => (names.clone(), value_strategy()).prop_map(|(name, value)| PropertyEdit::Set {
            name: name.to_string(),
            value,
        }),
        1 => names.prop_map(|name| PropertyEdit::Unset {
            name: name.to_string(),
        }),
    ];
    prop::collection::vec(edit, 1..=max_len)
}
