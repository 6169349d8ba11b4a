//! Query fragments for relational collections.
//!
//! A collection query is the relation's constraints evaluated against the
//! collection's anchor node, plus the relation's static filters, plus the
//! group condition for group nodes. A node-level subnode filter replaces
//! the constraints and filters.

use super::relational::id_value;
use crate::error::CoreResult;
use crate::mapping::{LocalField, Mapping, MappingKind, Relation, TableSpec};
use crate::node::Node;
use nodedb_storage::{Condition, Projection, Select, SqlValue};
use std::sync::Arc;

/// The node whose values a collection's constraints read: the nearest
/// ancestor-or-self that is neither a group nor a virtual node.
pub(crate) fn anchor(home: &Arc<Node>) -> CoreResult<Arc<Node>> {
    let mut node = Arc::clone(home);
    while node.mapping().kind() != MappingKind::Normal {
        match node.parent()? {
            Some(parent) => node = parent,
            None => break,
        }
    }
    Ok(node)
}

/// Returns the conditions selecting the members of `home`'s collection, or
/// `None` if a constrained value of the anchor is missing, in which case
/// the collection is empty.
pub(crate) fn collection_conditions(
    home: &Arc<Node>,
    rel: &Relation,
    other: &Mapping,
) -> CoreResult<Option<Vec<Condition>>> {
    let mut conditions = match home.subnode_filter() {
        Some(filter) => filter,
        None => {
            let anchor = anchor(home)?;
            let mut conditions = Vec::with_capacity(rel.constraints().len());
            for constraint in rel.constraints() {
                let value = match &constraint.local {
                    LocalField::Id => anchor.id(),
                    LocalField::Property(property) => anchor.get_string(property),
                };
                let Some(value) = value else {
                    return Ok(None);
                };
                conditions.push(Condition::eq(&constraint.foreign_column, id_value(&value)));
            }
            conditions.extend(rel.filters().iter().cloned());
            conditions
        }
    };
    if let Some(property) = rel.group_property() {
        let column = other.column_for_property(property).unwrap_or(property);
        conditions.push(Condition::eq(column, SqlValue::Text(home.name())));
    }
    Ok(Some(conditions))
}

fn filtered(table: &str, conditions: Vec<Condition>) -> Select {
    conditions
        .into_iter()
        .fold(Select::from(table), Select::filter)
}

/// `SELECT id ... ORDER BY ...` for a collection's id list.
pub(crate) fn child_ids(table: &TableSpec, rel: &Relation, conditions: Vec<Condition>) -> Select {
    let select = filtered(&table.table, conditions)
        .project(Projection::Column(table.id_column.clone()))
        .order(rel.get_order().unwrap_or(&table.id_column));
    limited(select, rel)
}

/// `SELECT * ... ORDER BY ...` for collections loaded with full rows.
pub(crate) fn child_rows(table: &TableSpec, rel: &Relation, conditions: Vec<Condition>) -> Select {
    let select =
        filtered(&table.table, conditions).order(rel.get_order().unwrap_or(&table.id_column));
    limited(select, rel)
}

/// `SELECT DISTINCT groupcolumn ...` for grouped collections.
pub(crate) fn group_values(
    table: &TableSpec,
    column: &str,
    rel: &Relation,
    conditions: Vec<Condition>,
) -> Select {
    filtered(&table.table, conditions)
        .project(Projection::Distinct(column.to_string()))
        .order(rel.get_group_order().unwrap_or(column))
}

/// `SELECT COUNT(*) ...` for a collection.
pub(crate) fn count(table: &TableSpec, conditions: Vec<Condition>) -> Select {
    filtered(&table.table, conditions).project(Projection::Count)
}

/// Looks up one member by access name, or by id if the relation has none.
pub(crate) fn lookup(
    table: &TableSpec,
    other: &Mapping,
    rel: &Relation,
    conditions: Vec<Condition>,
    name: &str,
) -> Select {
    let condition = match rel
        .get_accessname()
        .map(|access| other.column_for_property(access).unwrap_or(access))
    {
        Some(column) => Condition::eq(column, SqlValue::Text(name.to_string())),
        None => Condition::eq(&table.id_column, id_value(name)),
    };
    filtered(&table.table, conditions).filter(condition)
}

/// Fetches several rows by id in one statement.
pub(crate) fn by_ids(table: &TableSpec, ids: &[String]) -> Select {
    Select::from(&table.table).filter(Condition::In(
        table.id_column.clone(),
        ids.iter().map(|id| id_value(id)).collect(),
    ))
}

fn limited(select: Select, rel: &Relation) -> Select {
    match rel.get_max_size() {
        Some(max) => select.limit(max),
        None => select,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Relation, TableSpec};

    fn comment_table() -> TableSpec {
        TableSpec::new("main", "comment", "id")
    }

    #[test]
    fn id_query_orders_and_limits() {
        let rel = Relation::children("comment").order("created DESC").max_size(5);
        let select = child_ids(&comment_table(), &rel, vec![Condition::eq("story_id", 3_i64)]);
        assert_eq!(
            select.to_string(),
            "SELECT id FROM comment WHERE story_id = 3 ORDER BY created DESC LIMIT 5"
        );
    }

    #[test]
    fn group_query_is_distinct() {
        let rel = Relation::children("comment").group_by("day");
        let select = group_values(&comment_table(), "day", &rel, Vec::new());
        assert_eq!(select.to_string(), "SELECT DISTINCT day FROM comment ORDER BY day");
    }

    #[test]
    fn lookup_uses_accessname_column() {
        let other = Mapping::relational("comment", comment_table())
            .property(Relation::primitive("slug", "slug_col"))
            .build();
        let rel = Relation::children("comment").accessname("slug");
        let select = lookup(&comment_table(), &other, &rel, Vec::new(), "hello");
        assert_eq!(select.conditions, vec![Condition::eq("slug_col", "hello")]);

        let plain = Relation::children("comment");
        let select = lookup(&comment_table(), &other, &plain, Vec::new(), "12");
        assert_eq!(select.conditions, vec![Condition::eq("id", 12_i64)]);
    }

    #[test]
    fn prefetch_uses_in() {
        let select = by_ids(&comment_table(), &["1".to_string(), "x".to_string()]);
        assert_eq!(
            select.conditions,
            vec![Condition::In(
                "id".into(),
                vec![SqlValue::Integer(1), SqlValue::Text("x".into())]
            )]
        );
    }
}
