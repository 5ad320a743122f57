//! Entity schema model
//!
//! An [`EntitySchema`] is the immutable description of how one entity type is
//! persisted: table and view names, fields and their accessors, owned child
//! relations, constraints and indexes. Schemas are built once per data source
//! dialect by the [`EntityRegistry`] and shared behind `Arc`.

pub mod entity;
pub mod field;
pub mod policy;
pub mod registry;

pub use entity::{Entity, EntityDef};
pub use field::{
    ChildKind, ChildSchema, FieldKind, FieldSchema, FieldTransformer, ForeignKeySchema,
    IndexSchema, ListOnlySource, UniqueConstraintSchema, ViewBaseTable, ViewRestriction,
    ViewSource,
};
pub use policy::{
    EntityPolicy, EntityRecord, InMemorySequenceSource, NoopEntityPolicy, SequenceSource,
    SequencedEntityPolicy, UuidEntityPolicy,
};
pub use registry::{EntityRegistry, NamingRules};

use crate::database::types::SqlValue;
use crate::error::{Error, Result};
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Type-erased entity instance
pub type DynEntity = dyn std::any::Any + Send + Sync;

/// Handle to an entity type that may not be registered yet
#[derive(Clone, Copy)]
pub struct EntityRef {
    type_id: TypeId,
    name: &'static str,
    resolve: fn(&EntityRegistry) -> Result<Arc<EntitySchema>>,
}

fn resolve_entity<T: Entity>(registry: &EntityRegistry) -> Result<Arc<EntitySchema>> {
    registry.resolve::<T>()
}

impl EntityRef {
    pub fn of<T: Entity>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: entity::entity_name::<T>(),
            resolve: resolve_entity::<T>,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Resolve (registering on first use) the referenced schema
    pub fn resolve(&self, registry: &EntityRegistry) -> Result<Arc<EntitySchema>> {
        (self.resolve)(registry)
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityRef({})", self.name)
    }
}

pub struct EntitySchema {
    pub(crate) type_id: TypeId,
    pub(crate) name: String,
    pub(crate) table: String,
    pub(crate) preferred_table: String,
    pub(crate) schema_table: String,
    pub(crate) view: String,
    pub(crate) preferred_view: String,
    pub(crate) schema_view: String,
    pub(crate) id_field: String,
    pub(crate) version_field: Option<String>,
    pub(crate) fields: Vec<Arc<FieldSchema>>,
    pub(crate) list_fields: Vec<Arc<FieldSchema>>,
    pub(crate) field_index: HashMap<String, usize>,
    pub(crate) list_field_index: HashMap<String, usize>,
    pub(crate) foreign_keys: Vec<ForeignKeySchema>,
    pub(crate) children: Vec<ChildSchema>,
    pub(crate) unique_constraints: Vec<UniqueConstraintSchema>,
    pub(crate) indexes: Vec<IndexSchema>,
    pub(crate) view_base_tables: Vec<ViewBaseTable>,
    pub(crate) view_restrictions: Vec<ViewRestriction>,
    pub(crate) policy: Arc<dyn EntityPolicy>,
    pub(crate) new_instance: fn() -> Box<DynEntity>,
}

impl EntitySchema {
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn preferred_table(&self) -> &str {
        &self.preferred_table
    }

    /// Table name qualified with the data source schema, if any
    pub fn schema_table(&self) -> &str {
        &self.schema_table
    }

    pub fn view(&self) -> &str {
        &self.view
    }

    pub fn preferred_view(&self) -> &str {
        &self.preferred_view
    }

    pub fn schema_view(&self) -> &str {
        &self.schema_view
    }

    /// Persisted fields in declaration order
    pub fn fields(&self) -> &[Arc<FieldSchema>] {
        &self.fields
    }

    /// Persisted and list-only fields in declaration order
    pub fn list_fields(&self) -> &[Arc<FieldSchema>] {
        &self.list_fields
    }

    /// Look up a persisted field
    pub fn field(&self, name: &str) -> Result<&Arc<FieldSchema>> {
        self.field_index
            .get(name)
            .map(|&i| &self.fields[i])
            .ok_or_else(|| Error::field_not_found(&self.name, name))
    }

    /// Look up a persisted or list-only field
    pub fn list_field(&self, name: &str) -> Result<&Arc<FieldSchema>> {
        self.list_field_index
            .get(name)
            .map(|&i| &self.list_fields[i])
            .ok_or_else(|| Error::field_not_found(&self.name, name))
    }

    pub fn is_field(&self, name: &str) -> bool {
        self.field_index.contains_key(name)
    }

    pub fn is_list_field(&self, name: &str) -> bool {
        self.list_field_index.contains_key(name)
    }

    pub fn id_field(&self) -> &Arc<FieldSchema> {
        &self.fields[self.field_index[&self.id_field]]
    }

    pub fn version_field(&self) -> Option<&Arc<FieldSchema>> {
        self.version_field
            .as_ref()
            .map(|name| &self.fields[self.field_index[name]])
    }

    pub fn is_versioned(&self) -> bool {
        self.version_field.is_some()
    }

    /// True if every name refers to a persisted (non list-only) field
    pub fn test_true_field_names_only<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names.iter().all(|n| self.is_field(n.as_ref()))
    }

    pub fn foreign_keys(&self) -> &[ForeignKeySchema] {
        &self.foreign_keys
    }

    pub fn children(&self) -> &[ChildSchema] {
        &self.children
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Child relations removed together with the parent
    pub fn on_delete_cascade(&self) -> &[ChildSchema] {
        &self.children
    }

    pub fn unique_constraints(&self) -> &[UniqueConstraintSchema] {
        &self.unique_constraints
    }

    pub fn indexes(&self) -> &[IndexSchema] {
        &self.indexes
    }

    pub fn view_base_tables(&self) -> &[ViewBaseTable] {
        &self.view_base_tables
    }

    pub fn view_restrictions(&self) -> &[ViewRestriction] {
        &self.view_restrictions
    }

    pub fn is_view_only(&self) -> bool {
        !self.view_base_tables.is_empty()
    }

    /// True if reads of list fields need the view instead of the table
    pub fn is_viewable(&self) -> bool {
        self.is_view_only() || self.list_fields.len() > self.fields.len()
    }

    pub fn policy(&self) -> &Arc<dyn EntityPolicy> {
        &self.policy
    }

    /// Create a default instance of the entity type
    pub fn new_instance(&self) -> Box<DynEntity> {
        (self.new_instance)()
    }

    /// Read the entity-level id of a record
    pub fn id_of(&self, record: &DynEntity) -> Result<SqlValue> {
        self.id_field().get_value(record)
    }

    /// Read the entity-level version of a record, if the entity is versioned
    pub fn version_of(&self, record: &DynEntity) -> Result<Option<SqlValue>> {
        self.version_field()
            .map(|field| field.get_value(record))
            .transpose()
    }
}

impl fmt::Debug for EntitySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitySchema")
            .field("name", &self.name)
            .field("table", &self.schema_table)
            .field("view", &self.schema_view)
            .field("id", &self.id_field)
            .field("version", &self.version_field)
            .field("fields", &self.list_fields)
            .field("children", &self.children)
            .finish()
    }
}
