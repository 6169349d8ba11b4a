//! Node identity keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable identity of a node.
///
/// Equality and hashing are structural, so a key rebuilt from a store or a
/// serialized handle finds the same cache entry as the original.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Key {
    /// A row or record addressed by its id.
    ///
    /// `storage` is the table name for relational mappings and `None` for
    /// the embedded store, whose ids are unique across all types.
    Primary {
        /// Storage the id is unique within.
        storage: Option<String>,
        /// The id.
        id: String,
    },
    /// A derived node addressed relative to its parent, such as a group or a
    /// virtual collection. No row backs it.
    Synthetic {
        /// Key of the owning node.
        parent: Box<Key>,
        /// Local name below the parent.
        name: String,
    },
    /// A row addressed by several column values, used by complex references.
    Composite {
        /// Table the columns belong to.
        storage: String,
        /// Column/value pairs in relation order.
        parts: Vec<(String, String)>,
    },
}

impl Key {
    /// Creates a key for an embedded-store record.
    pub fn embedded(id: impl Into<String>) -> Self {
        Key::Primary {
            storage: None,
            id: id.into(),
        }
    }

    /// Creates a key for a relational row.
    pub fn relational(table: impl Into<String>, id: impl Into<String>) -> Self {
        Key::Primary {
            storage: Some(table.into()),
            id: id.into(),
        }
    }

    /// Creates a key below `parent`.
    pub fn synthetic(parent: Key, name: impl Into<String>) -> Self {
        Key::Synthetic {
            parent: Box::new(parent),
            name: name.into(),
        }
    }

    /// Creates a multi-column key.
    pub fn composite(storage: impl Into<String>, parts: Vec<(String, String)>) -> Self {
        Key::Composite {
            storage: storage.into(),
            parts,
        }
    }

    /// Returns the local id: the record id, the synthetic name, or the
    /// joined column values.
    #[must_use]
    pub fn id(&self) -> String {
        match self {
            Key::Primary { id, .. } => id.clone(),
            Key::Synthetic { name, .. } => name.clone(),
            Key::Composite { parts, .. } => parts
                .iter()
                .map(|(_, v)| v.as_str())
                .collect::<Vec<_>>()
                .join("/"),
        }
    }

    /// Returns the storage name, if the key addresses stored data.
    #[must_use]
    pub fn storage(&self) -> Option<&str> {
        match self {
            Key::Primary { storage, .. } => storage.as_deref(),
            Key::Composite { storage, .. } => Some(storage),
            Key::Synthetic { .. } => None,
        }
    }

    /// Returns the parent key of a synthetic key.
    #[must_use]
    pub fn parent(&self) -> Option<&Key> {
        match self {
            Key::Synthetic { parent, .. } => Some(parent),
            _ => None,
        }
    }

    /// Returns true for synthetic keys.
    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        matches!(self, Key::Synthetic { .. })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Primary { storage: None, id } => write!(f, "{id}"),
            Key::Primary {
                storage: Some(storage),
                id,
            } => write!(f, "{storage}/{id}"),
            Key::Synthetic { parent, name } => write!(f, "{parent}:{name}"),
            Key::Composite { storage, parts } => {
                write!(f, "{storage}[")?;
                for (i, (column, value)) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{column}={value}")?;
                }
                f.write_str("]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(key: &Key) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn display_forms() {
        let root = Key::embedded("0");
        let group = Key::synthetic(root.clone(), "news");
        assert_eq!(root.to_string(), "0");
        assert_eq!(group.to_string(), "0:news");
        assert_eq!(Key::relational("story", "5").to_string(), "story/5");
        assert_eq!(group.parent(), Some(&root));
        assert_eq!(group.id(), "news");
    }

    #[test]
    fn embedded_and_relational_keys_differ() {
        assert_ne!(Key::embedded("1"), Key::relational("story", "1"));
    }

    proptest! {
        #[test]
        fn rebuilt_keys_are_equal(storage in "[a-z]{1,8}", id in "[0-9]{1,6}", name in "[a-z]{1,8}") {
            let a = Key::synthetic(Key::relational(storage.clone(), id.clone()), name.clone());
            let b = Key::synthetic(Key::relational(storage, id), name);
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(hash_of(&a), hash_of(&b));
        }

        #[test]
        fn composite_part_order_matters(a in "[a-z]{1,4}", b in "[a-z]{1,4}") {
            prop_assume!(a != b);
            let k1 = Key::composite("t", vec![("x".into(), a.clone()), ("y".into(), b.clone())]);
            let k2 = Key::composite("t", vec![("x".into(), b), ("y".into(), a)]);
            prop_assert_ne!(k1, k2);
        }
    }
}
