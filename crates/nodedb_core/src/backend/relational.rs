//! Relational table backend.

use super::{NodeBackend, NodeSeed};
use crate::error::{CoreError, CoreResult};
use crate::handle::Handle;
use crate::key::Key;
use crate::mapping::{IdStrategy, Mapping, MappingRegistry, TableSpec};
use crate::node::{Node, NodeSnapshot};
use crate::types::now_millis;
use crate::value::{Property, Value};
use nodedb_storage::{Condition, Outcome, RelationalConnection, Row, Select, SqlValue, Statement};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Translates node operations into statements on one connection.
pub(crate) struct RelationalBackend {
    source: String,
    connection: Arc<dyn RelationalConnection>,
    log_statements: bool,
}

fn table_of(mapping: &Mapping) -> CoreResult<&TableSpec> {
    mapping.table().ok_or_else(|| {
        CoreError::invalid_operation(format!("mapping {} has no table", mapping.name()))
    })
}

/// Ids are written as integers when they look like one.
pub(crate) fn id_value(id: &str) -> SqlValue {
    id.parse::<i64>()
        .map_or_else(|_| SqlValue::Text(id.to_string()), SqlValue::Integer)
}

impl RelationalBackend {
    pub(crate) fn new(
        source: &str,
        connection: Arc<dyn RelationalConnection>,
        log_statements: bool,
    ) -> Self {
        Self {
            source: source.to_string(),
            connection,
            log_statements,
        }
    }

    /// Runs one statement, logging it with its timing.
    pub(crate) fn execute(&self, statement: &Statement) -> CoreResult<Outcome> {
        let started = Instant::now();
        let outcome = self.connection.execute(statement);
        if self.log_statements {
            tracing::debug!(
                source = %self.source,
                table = statement.table().unwrap_or("-"),
                elapsed_us = started.elapsed().as_micros() as u64,
                ok = outcome.is_ok(),
                "{statement}"
            );
        }
        Ok(outcome?)
    }

    pub(crate) fn select(&self, select: Select) -> CoreResult<Vec<Row>> {
        Ok(self.execute(&Statement::Select(select))?.into_rows()?)
    }

    pub(crate) fn count(&self, select: Select) -> CoreResult<usize> {
        let value = self.execute(&Statement::Select(select))?.into_scalar()?;
        Ok(value
            .and_then(|v| v.as_integer())
            .map_or(0, |n| usize::try_from(n).unwrap_or(0)))
    }

    fn select_max(&self, table: &str, column: &str) -> CoreResult<i64> {
        let value = self
            .execute(&Statement::SelectMax {
                table: table.to_string(),
                column: column.to_string(),
            })?
            .into_scalar()?;
        Ok(value.and_then(|v| v.as_integer()).unwrap_or(0))
    }

    fn next_val(&self, sequence: &str) -> CoreResult<i64> {
        self.execute(&Statement::NextVal {
            sequence: sequence.to_string(),
        })?
        .into_scalar()?
        .and_then(|v| v.as_integer())
        .ok_or_else(|| CoreError::invalid_operation(format!("sequence {sequence} returned no value")))
    }

    /// Builds a seed from a result row. Returns `None` if the row has no id.
    ///
    /// A prototype column may name a more specific mapping on the same
    /// table; its relations are used instead.
    pub(crate) fn seed_from_row(
        registry: &MappingRegistry,
        mapping: &Arc<Mapping>,
        row: &Row,
    ) -> CoreResult<Option<(Arc<Mapping>, NodeSeed)>> {
        let table = table_of(mapping)?;
        let Some(id) = row.get(&table.id_column).and_then(SqlValue::as_text) else {
            return Ok(None);
        };
        let mapping = table
            .prototype_column
            .as_deref()
            .and_then(|column| row.text(column))
            .and_then(|prototype| registry.get(&prototype))
            .filter(|m| m.storage_name() == mapping.storage_name())
            .unwrap_or_else(|| Arc::clone(mapping));
        let table = table_of(&mapping)?;
        let name = table
            .name_column
            .as_deref()
            .and_then(|column| row.text(column))
            .unwrap_or_else(|| id.clone());

        let mut properties = BTreeMap::new();
        for rel in mapping.properties() {
            if !rel.is_primitive_or_reference() {
                continue;
            }
            let Some(column) = rel.column() else { continue };
            let raw = row.get(column).cloned().unwrap_or(SqlValue::Null);
            let value = if rel.is_reference() {
                match (raw.as_text(), registry.other_mapping(rel)?) {
                    (Some(other_id), Some(other)) => {
                        Value::Reference(Handle::for_key(other.key_for(&other_id)))
                    }
                    _ => Value::Null,
                }
            } else {
                Value::from_sql(&raw, rel.get_column_type())
            };
            properties.insert(rel.name().to_string(), Property::loaded(rel.name(), value));
        }

        let now = now_millis();
        Ok(Some((
            Arc::clone(&mapping),
            NodeSeed {
                id,
                name,
                prototype: mapping.name().to_string(),
                created: now,
                last_modified: now,
                parent: None,
                properties,
                children: None,
            },
        )))
    }

    fn insert_values(snapshot: &NodeSnapshot, table: &TableSpec) -> Vec<(String, SqlValue)> {
        let mapping = &snapshot.mapping;
        let mut values = vec![(table.id_column.clone(), id_value(&snapshot.id))];
        let taken = |values: &Vec<(String, SqlValue)>, column: &str| {
            values.iter().any(|(c, _)| c.eq_ignore_ascii_case(column))
        };
        if let Some(column) = &table.prototype_column {
            values.push((column.clone(), SqlValue::Text(mapping.name().to_string())));
        }
        for rel in mapping.properties() {
            if !rel.is_primitive_or_reference() || rel.is_virtual() {
                continue;
            }
            let Some(column) = rel.column() else { continue };
            if taken(&values, column) {
                continue;
            }
            let value = snapshot
                .properties
                .iter()
                .find(|p| p.name() == rel.name())
                .map_or(SqlValue::Null, |p| p.value().to_sql(rel.get_column_type()));
            values.push((column.to_string(), value));
        }
        if let Some(column) = &table.name_column {
            if !taken(&values, column) {
                values.push((column.clone(), SqlValue::Text(snapshot.name.clone())));
            }
        }
        values
    }
}

impl NodeBackend for RelationalBackend {
    fn fetch(
        &self,
        registry: &MappingRegistry,
        key: &Key,
    ) -> CoreResult<Option<(Arc<Mapping>, NodeSeed)>> {
        let (table_name, conditions) = match key {
            Key::Primary {
                storage: Some(table),
                id,
            } => {
                let mapping = registry.by_storage(table).ok_or_else(|| {
                    CoreError::mapping_not_found(format!("table {table}"))
                })?;
                let spec = table_of(&mapping)?;
                (table.clone(), vec![Condition::eq(&spec.id_column, id_value(id))])
            }
            Key::Composite { storage, parts } => (
                storage.clone(),
                parts
                    .iter()
                    .map(|(column, value)| Condition::eq(column, SqlValue::Text(value.clone())))
                    .collect(),
            ),
            _ => return Ok(None),
        };
        let mapping = registry
            .by_storage(&table_name)
            .ok_or_else(|| CoreError::mapping_not_found(format!("table {table_name}")))?;

        let mut select = Select::from(&table_name);
        for condition in conditions {
            select = select.filter(condition);
        }
        let rows = self.select(select)?;
        if rows.len() > 1 {
            tracing::warn!(key = %key, rows = rows.len(), "single-row lookup returned several rows, using the first");
        }
        match rows.first() {
            Some(row) => Self::seed_from_row(registry, &mapping, row),
            None => Ok(None),
        }
    }

    fn insert(&self, snapshot: &NodeSnapshot) -> CoreResult<()> {
        let table = table_of(&snapshot.mapping)?;
        let statement = Statement::Insert {
            table: table.table.clone(),
            values: Self::insert_values(snapshot, table),
        };
        self.execute(&statement)?;
        Ok(())
    }

    fn update(&self, node: &Node) -> CoreResult<bool> {
        let dirty = node.dirty_properties();
        if dirty.is_empty() {
            return Ok(false);
        }
        let mapping = node.mapping();
        let table = table_of(&mapping)?;

        let mut values = Vec::new();
        let mut public_change = false;
        for rel in mapping.properties() {
            let Some(prop) = dirty.iter().find(|p| p.name() == rel.name()) else {
                continue;
            };
            if !rel.is_primitive_or_reference() || rel.is_readonly() || rel.is_virtual() {
                continue;
            }
            let Some(column) = rel.column() else { continue };
            values.push((column.to_string(), prop.value().to_sql(rel.get_column_type())));
            public_change |= !rel.is_private();
        }
        let names: Vec<String> = dirty.iter().map(|p| p.name().to_string()).collect();
        if values.is_empty() {
            node.mark_properties_clean(&names);
            return Ok(false);
        }

        let id = node
            .id()
            .ok_or_else(|| CoreError::invalid_operation("cannot update a node without id"))?;
        self.execute(&Statement::Update {
            table: table.table.clone(),
            values,
            key_column: table.id_column.clone(),
            key_value: id_value(&id),
        })?;
        node.mark_properties_clean(&names);
        Ok(public_change)
    }

    fn delete(&self, snapshot: &NodeSnapshot) -> CoreResult<()> {
        let table = table_of(&snapshot.mapping)?;
        self.execute(&Statement::Delete {
            table: table.table.clone(),
            key_column: table.id_column.clone(),
            key_value: id_value(&snapshot.id),
        })?;
        Ok(())
    }

    fn next_id(&self, mapping: &Mapping) -> CoreResult<String> {
        let table = table_of(mapping)?;
        let id = match mapping.id_strategy() {
            IdStrategy::Max => {
                mapping.next_max_id(|| self.select_max(&table.table, &table.id_column))?
            }
            IdStrategy::Sequence(sequence) => self.next_val(&sequence)?,
            IdStrategy::EmbeddedSequence => {
                return Err(CoreError::invalid_operation(format!(
                    "relational mapping {} cannot use the embedded sequence",
                    mapping.name()
                )))
            }
        };
        Ok(id.to_string())
    }
}
