//! Property and collection relations.

use nodedb_storage::Condition;

/// What a relation describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// A scalar column.
    Primitive,
    /// A column holding the id of another node.
    Reference,
    /// A reference resolved through several columns.
    ComplexReference,
    /// An ordered collection of other nodes.
    Collection,
}

/// Column type used for value conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColumnType {
    /// Character data.
    #[default]
    Text,
    /// Integral number.
    Integer,
    /// Floating point number.
    Float,
    /// Boolean.
    Boolean,
    /// Milliseconds since the Unix epoch.
    Timestamp,
    /// Binary data.
    Bytes,
}

/// The home side of a constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalField {
    /// The home node's id.
    Id,
    /// A property of the home node.
    Property(String),
}

/// Binds a column of the related type to a value of the home node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    /// Where the value comes from on the home node.
    pub local: LocalField,
    /// Column of the related type that must equal it.
    pub foreign_column: String,
}

/// Describes how one property, or the child collection, of a mapping relates
/// to stored data.
#[derive(Debug, Clone)]
pub struct Relation {
    name: String,
    kind: RelationKind,
    column: Option<String>,
    column_type: ColumnType,
    other_type: Option<String>,
    readonly: bool,
    private: bool,
    virtual_node: bool,
    lazy: bool,
    aggressive: bool,
    accessname: Option<String>,
    groupby: Option<String>,
    group_order: Option<String>,
    order: Option<String>,
    max_size: Option<usize>,
    constraints: Vec<Constraint>,
    filters: Vec<Condition>,
    prototype: Option<String>,
    group_property: Option<String>,
}

impl Relation {
    fn new(name: &str, kind: RelationKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            column: None,
            column_type: ColumnType::Text,
            other_type: None,
            readonly: false,
            private: false,
            virtual_node: false,
            lazy: false,
            aggressive: false,
            accessname: None,
            groupby: None,
            group_order: None,
            order: None,
            max_size: None,
            constraints: Vec::new(),
            filters: Vec::new(),
            prototype: None,
            group_property: None,
        }
    }

    /// A scalar property stored in `column`.
    #[must_use]
    pub fn primitive(name: &str, column: &str) -> Self {
        let mut rel = Self::new(name, RelationKind::Primitive);
        rel.column = Some(column.to_string());
        rel
    }

    /// A property holding the id of a node of `other_type` in `column`.
    #[must_use]
    pub fn reference(name: &str, column: &str, other_type: &str) -> Self {
        let mut rel = Self::new(name, RelationKind::Reference);
        rel.column = Some(column.to_string());
        rel.other_type = Some(other_type.to_string());
        rel
    }

    /// A property resolved through the relation's constraints.
    #[must_use]
    pub fn complex_reference(name: &str, other_type: &str) -> Self {
        let mut rel = Self::new(name, RelationKind::ComplexReference);
        rel.other_type = Some(other_type.to_string());
        rel
    }

    /// A named collection property. Collection properties are materialized
    /// as virtual nodes.
    #[must_use]
    pub fn collection(name: &str, other_type: &str) -> Self {
        let mut rel = Self::new(name, RelationKind::Collection);
        rel.other_type = Some(other_type.to_string());
        rel.virtual_node = true;
        rel
    }

    /// The child collection of a mapping.
    #[must_use]
    pub fn children(other_type: &str) -> Self {
        let mut rel = Self::new("_children", RelationKind::Collection);
        rel.other_type = Some(other_type.to_string());
        rel
    }

    /// Sets the column type.
    #[must_use]
    pub fn column_type(mut self, column_type: ColumnType) -> Self {
        self.column_type = column_type;
        self
    }

    /// Excludes the column from updates.
    #[must_use]
    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// Marks the property private: changes to it do not advance the
    /// mapping's data-change clock.
    #[must_use]
    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    /// Loads the collection in windows instead of all at once.
    #[must_use]
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Loads whole rows for the collection in one query.
    #[must_use]
    pub fn aggressive(mut self) -> Self {
        self.aggressive = true;
        self
    }

    /// Names children by the given property of the child.
    #[must_use]
    pub fn accessname(mut self, property: &str) -> Self {
        self.accessname = Some(property.to_string());
        self
    }

    /// Groups children by the given property of the child.
    #[must_use]
    pub fn group_by(mut self, property: &str) -> Self {
        self.groupby = Some(property.to_string());
        self
    }

    /// Orders group nodes.
    #[must_use]
    pub fn group_order(mut self, clause: &str) -> Self {
        self.group_order = Some(clause.to_string());
        self
    }

    /// Orders children, e.g. `"created DESC"`.
    #[must_use]
    pub fn order(mut self, clause: &str) -> Self {
        self.order = Some(clause.to_string());
        self
    }

    /// Caps the number of children loaded and counted.
    #[must_use]
    pub fn max_size(mut self, max: usize) -> Self {
        self.max_size = Some(max);
        self
    }

    /// Adds a constraint binding `foreign_column` to a home value.
    #[must_use]
    pub fn constraint(mut self, local: LocalField, foreign_column: &str) -> Self {
        self.constraints.push(Constraint {
            local,
            foreign_column: foreign_column.to_string(),
        });
        self
    }

    /// Adds a static filter condition.
    #[must_use]
    pub fn filter(mut self, condition: Condition) -> Self {
        self.filters.push(condition);
        self
    }

    /// Sets the prototype of virtual nodes built from this relation.
    #[must_use]
    pub fn prototype(mut self, prototype: &str) -> Self {
        self.prototype = Some(prototype.to_string());
        self
    }

    /// Returns the property name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the relation kind.
    #[must_use]
    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    /// Returns the column.
    #[must_use]
    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    /// Returns the column type.
    #[must_use]
    pub fn get_column_type(&self) -> ColumnType {
        self.column_type
    }

    /// Returns the related mapping name.
    #[must_use]
    pub fn other_type(&self) -> Option<&str> {
        self.other_type.as_deref()
    }

    /// Returns true if updates skip this column.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Returns true if changes do not advance the data-change clock.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.private
    }

    /// Returns true if the relation materializes a virtual node.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.virtual_node
    }

    /// Returns true for segmented loading.
    #[must_use]
    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    /// Returns true for whole-row collection loading.
    #[must_use]
    pub fn is_aggressive(&self) -> bool {
        self.aggressive
    }

    /// Returns the access name property.
    #[must_use]
    pub fn get_accessname(&self) -> Option<&str> {
        self.accessname.as_deref()
    }

    /// Returns the group-by property.
    #[must_use]
    pub fn groupby(&self) -> Option<&str> {
        self.groupby.as_deref()
    }

    /// Returns the group node order clause.
    #[must_use]
    pub fn get_group_order(&self) -> Option<&str> {
        self.group_order.as_deref()
    }

    /// Returns the child order clause.
    #[must_use]
    pub fn get_order(&self) -> Option<&str> {
        self.order.as_deref()
    }

    /// Returns the collection size cap.
    #[must_use]
    pub fn get_max_size(&self) -> Option<usize> {
        self.max_size
    }

    /// Returns the constraints.
    #[must_use]
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Returns the static filters.
    #[must_use]
    pub fn filters(&self) -> &[Condition] {
        &self.filters
    }

    /// Returns the prototype for virtual nodes.
    #[must_use]
    pub fn get_prototype(&self) -> Option<&str> {
        self.prototype.as_deref()
    }

    /// For the member relation of a group node, the child property that
    /// must equal the group's name.
    #[must_use]
    pub fn group_property(&self) -> Option<&str> {
        self.group_property.as_deref()
    }

    /// Returns true for plain and complex references.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        self.kind == RelationKind::Reference
    }

    /// Returns true for multi-column references.
    #[must_use]
    pub fn is_complex_reference(&self) -> bool {
        self.kind == RelationKind::ComplexReference
    }

    /// Returns true for collections.
    #[must_use]
    pub fn is_collection(&self) -> bool {
        self.kind == RelationKind::Collection
    }

    /// Returns true if the relation maps to a single column.
    #[must_use]
    pub fn is_primitive_or_reference(&self) -> bool {
        matches!(self.kind, RelationKind::Primitive | RelationKind::Reference)
    }

    /// Returns true if children are identified by their primary key.
    #[must_use]
    pub fn uses_primary_key(&self) -> bool {
        match self.kind {
            RelationKind::Reference => true,
            RelationKind::Collection => self.accessname.is_none(),
            _ => false,
        }
    }

    /// Returns true if lookups by name go through a synthetic key.
    #[must_use]
    pub fn create_on_demand(&self) -> bool {
        self.virtual_node || self.groupby.is_some() || self.is_collection()
    }

    /// The relation used by group nodes for their members.
    pub(crate) fn group_member_relation(&self) -> Option<Relation> {
        let groupby = self.groupby.clone()?;
        let mut rel = self.clone();
        rel.name = "_children".to_string();
        rel.groupby = None;
        rel.group_order = None;
        rel.virtual_node = false;
        rel.group_property = Some(groupby);
        Some(rel)
    }

    /// The relation a virtual collection node uses for its children.
    pub(crate) fn as_child_relation(&self) -> Relation {
        let mut rel = self.clone();
        rel.virtual_node = false;
        rel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_key_usage() {
        assert!(Relation::children("Story").uses_primary_key());
        assert!(!Relation::children("Story").accessname("title").uses_primary_key());
        assert!(Relation::reference("author", "author_id", "User").uses_primary_key());
        assert!(!Relation::primitive("title", "title").uses_primary_key());
    }

    #[test]
    fn group_member_relation_moves_groupby() {
        let rel = Relation::children("Story")
            .group_by("category")
            .order("created DESC")
            .constraint(LocalField::Id, "site_id");
        let members = rel.group_member_relation().unwrap();
        assert!(members.groupby().is_none());
        assert_eq!(members.group_property(), Some("category"));
        assert_eq!(members.get_order(), Some("created DESC"));
        assert_eq!(members.constraints().len(), 1);
    }

    #[test]
    fn collections_are_virtual() {
        let rel = Relation::collection("comments", "Comment");
        assert!(rel.is_virtual());
        assert!(rel.create_on_demand());
        assert!(!rel.as_child_relation().is_virtual());
    }
}
