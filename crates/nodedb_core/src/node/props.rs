//! Property access on nodes.

use super::Node;
use crate::error::{CoreError, CoreResult};
use crate::key::Key;
use crate::mapping::Relation;
use crate::state::NodeState;
use crate::types::now_millis;
use crate::value::{Property, Value};
use std::sync::Arc;

impl Node {
    /// Returns a property value. Null values read as `None`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.data
            .read()
            .properties
            .get(name)
            .map(|p| p.value().clone())
            .filter(|v| *v != Value::Null)
    }

    /// Returns a property as a string.
    #[must_use]
    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get(name).and_then(|v| v.as_string())
    }

    /// Returns a property as an integer.
    #[must_use]
    pub fn get_integer(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|v| v.as_integer())
    }

    /// Returns a property as a float.
    #[must_use]
    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.as_float())
    }

    /// Returns a property as a boolean.
    #[must_use]
    pub fn get_boolean(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(|v| v.as_boolean())
    }

    /// Returns a date property in milliseconds since the Unix epoch.
    #[must_use]
    pub fn get_date(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            Value::Date(d) | Value::Integer(d) => Some(d),
            _ => None,
        }
    }

    /// Returns the names of all non-null properties.
    #[must_use]
    pub fn property_names(&self) -> Vec<String> {
        self.data
            .read()
            .properties
            .values()
            .filter(|p| *p.value() != Value::Null)
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Returns the node a property refers to. Collection, virtual and
    /// complex reference properties are resolved through their relation.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the node has to be fetched and the fetch
    /// fails.
    pub fn get_node(&self, name: &str) -> CoreResult<Option<Arc<Node>>> {
        let engine = self.engine()?;
        let mapping = self.mapping();
        if let Some(rel) = mapping.property_relation(name) {
            if rel.is_virtual() || rel.is_complex_reference() || rel.is_collection() {
                return engine.get_node_by_relation(&self.arc()?, name, rel);
            }
        }
        match self.get(name) {
            Some(Value::Reference(handle)) => handle.resolve(&engine),
            _ => Ok(None),
        }
    }

    /// Sets a property.
    ///
    /// Setting a value equal to the current one does nothing. Names
    /// starting with `_` are never locked, marked dirty or stored.
    ///
    /// # Errors
    ///
    /// Returns a write-lock error for persistent nodes, or
    /// [`CoreError::DuplicateName`] if the property is the parent
    /// collection's access name and the new name is taken.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> CoreResult<()> {
        self.set_value(name, value.into())
    }

    /// Sets a string property.
    ///
    /// # Errors
    ///
    /// See [`Node::set`].
    pub fn set_string(&self, name: &str, value: &str) -> CoreResult<()> {
        self.set_value(name, Value::from(value))
    }

    /// Sets an integer property.
    ///
    /// # Errors
    ///
    /// See [`Node::set`].
    pub fn set_integer(&self, name: &str, value: i64) -> CoreResult<()> {
        self.set_value(name, Value::Integer(value))
    }

    /// Sets a float property.
    ///
    /// # Errors
    ///
    /// See [`Node::set`].
    pub fn set_float(&self, name: &str, value: f64) -> CoreResult<()> {
        self.set_value(name, Value::Float(value))
    }

    /// Sets a boolean property.
    ///
    /// # Errors
    ///
    /// See [`Node::set`].
    pub fn set_boolean(&self, name: &str, value: bool) -> CoreResult<()> {
        self.set_value(name, Value::Boolean(value))
    }

    /// Sets a date property in milliseconds since the Unix epoch.
    ///
    /// # Errors
    ///
    /// See [`Node::set`].
    pub fn set_date(&self, name: &str, millis: i64) -> CoreResult<()> {
        self.set_value(name, Value::Date(millis))
    }

    /// Sets an opaque byte property.
    ///
    /// # Errors
    ///
    /// See [`Node::set`].
    pub fn set_opaque(&self, name: &str, bytes: Vec<u8>) -> CoreResult<()> {
        self.set_value(name, Value::Opaque(bytes))
    }

    /// Clears a property. For relational nodes the column is written as
    /// NULL.
    ///
    /// # Errors
    ///
    /// See [`Node::set`].
    pub fn unset(&self, name: &str) -> CoreResult<()> {
        self.set_value(name, Value::Null)
    }

    /// Makes a property refer to `node`.
    ///
    /// A transient target becomes persistent when this node is persistent.
    /// A target without a parent gets this node as its parent.
    ///
    /// # Errors
    ///
    /// See [`Node::set`].
    pub fn set_node(&self, name: &str, node: &Arc<Node>) -> CoreResult<()> {
        let persistable =
            self.state() != NodeState::Transient && !Property::is_transient_name(name);
        if persistable {
            self.check_write_lock()?;
            if node.state() == NodeState::Transient {
                node.make_persistable()?;
            }
        }
        if node.parent_handle().is_none() && !node.mapping().is_relational() {
            node.set_parent_handle(Some(self.handle()));
        }
        if node.state() == NodeState::Transient {
            self.pin(node);
        }
        self.set_value(name, Value::Reference(node.handle()))
    }

    pub(crate) fn set_value(&self, name: &str, value: Value) -> CoreResult<()> {
        let transient_name = Property::is_transient_name(name);
        let persistable = self.state() != NodeState::Transient && !transient_name;
        if persistable {
            self.check_write_lock()?;
        }

        let old = self.get(name);
        if old.as_ref() == Some(&value) || (old.is_none() && value == Value::Null) {
            return Ok(());
        }

        let mapping = self.mapping();
        let relation = mapping.property_relation(name);
        if relation.is_some_and(|rel| rel.is_collection() || rel.is_complex_reference()) {
            return Err(CoreError::invalid_operation(format!(
                "property {name} of {} is derived and cannot be assigned",
                mapping.name()
            )));
        }

        if persistable {
            let column = relation.and_then(Relation::column).unwrap_or(name).to_string();
            self.notify_parent(name, &column, old.as_ref(), &value)?;
        }

        {
            let mut data = self.data.write();
            let prop = data
                .properties
                .entry(name.to_string())
                .or_insert_with(|| Property::loaded(name, Value::Null));
            prop.set(value);
            if !persistable {
                prop.mark_clean();
            }
            data.last_modified = now_millis();
        }

        if persistable && self.state() == NodeState::Clean {
            self.mark_as(NodeState::Modified)?;
        }
        Ok(())
    }

    /// Keeps the parent's collection consistent with a property change:
    /// an order column change dirties its ordering, an access name change
    /// moves the child to its new synthetic key.
    fn notify_parent(
        &self,
        name: &str,
        column: &str,
        old: Option<&Value>,
        new: &Value,
    ) -> CoreResult<()> {
        let Some(parent) = self.parent()? else {
            return Ok(());
        };
        let parent_mapping = parent.mapping();
        let Some(rel) = parent_mapping.subnode_relation() else {
            return Ok(());
        };
        if rel
            .get_order()
            .is_some_and(|order| order.to_ascii_lowercase().contains(&column.to_ascii_lowercase()))
        {
            parent.register_subnode_change()?;
        }
        if rel.get_accessname() == Some(name) {
            let old = old.and_then(Value::as_string);
            let new = new.as_string();
            self.rename_in(&parent, rel, old, new)?;
        }
        Ok(())
    }

    fn rename_in(
        &self,
        parent: &Arc<Node>,
        rel: &Relation,
        old: Option<String>,
        new: Option<String>,
    ) -> CoreResult<()> {
        let engine = self.engine()?;
        let Some(parent_key) = parent.key() else {
            return Ok(());
        };
        let this = self.arc()?;
        if let Some(new) = new.as_deref().filter(|n| !n.is_empty()) {
            if let Some(existing) = engine.get_node_by_relation(parent, new, rel)? {
                if !Arc::ptr_eq(&existing, &this) {
                    return Err(CoreError::duplicate_name(new, parent.label()));
                }
            }
            engine.register_key(Key::synthetic(parent_key.clone(), new), &this);
        }
        if let Some(old) = old.filter(|o| !o.is_empty()) {
            engine.evict_key(&Key::synthetic(parent_key, old));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_reads_as_absent() {
        let node = Node::for_test(Key::embedded("1"));
        node.data
            .write()
            .properties
            .insert("x".into(), Property::loaded("x", Value::Null));
        assert!(node.get("x").is_none());
        assert!(node.property_names().is_empty());
    }

    #[test]
    fn typed_getters_convert() {
        let node = Node::for_test(Key::embedded("1"));
        {
            let mut data = node.data.write();
            data.properties
                .insert("n".into(), Property::loaded("n", Value::from("42")));
            data.properties
                .insert("d".into(), Property::loaded("d", Value::Date(9)));
        }
        assert_eq!(node.get_integer("n"), Some(42));
        assert_eq!(node.get_string("n").as_deref(), Some("42"));
        assert_eq!(node.get_date("d"), Some(9));
        assert_eq!(node.get_float("n"), Some(42.0));
    }

    #[test]
    fn transient_names_skip_locking() {
        let node = Node::for_test(Key::embedded("1"));
        node.set("_scratch", "v").unwrap();
        assert_eq!(node.get_string("_scratch").as_deref(), Some("v"));
        assert_eq!(node.state(), NodeState::Clean);
        assert!(node.dirty_properties().is_empty());
    }
}
