//! Field, relation and constraint metadata

use super::{DynEntity, EntityRef};
use crate::database::types::{ColumnType, SqlValue};
use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// Bidirectional transformation between an entity value and its stored form
pub trait FieldTransformer: Send + Sync {
    /// Entity value to stored value
    fn forward(&self, value: SqlValue) -> Result<SqlValue>;

    /// Stored value back to entity value
    fn reverse(&self, value: SqlValue) -> Result<SqlValue>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Id,
    Version,
    Regular,
    ForeignKey,
    /// Joined from a foreign record, present only in the view
    ListOnly,
}

/// Where a list-only field takes its value from
#[derive(Debug, Clone)]
pub struct ListOnlySource {
    /// Local foreign key field
    pub foreign_key_field: String,
    /// Field of the referenced entity
    pub foreign_field: String,
}

/// Base table column a view-only field is selected from
#[derive(Debug, Clone)]
pub struct ViewSource {
    pub table_alias: String,
    pub field: String,
}

pub(crate) type Getter = Arc<dyn Fn(&DynEntity) -> Result<SqlValue> + Send + Sync>;
pub(crate) type Setter = Arc<dyn Fn(&mut DynEntity, SqlValue) -> Result<()> + Send + Sync>;

pub struct FieldSchema {
    pub(crate) entity: String,
    pub(crate) name: String,
    pub(crate) kind: FieldKind,
    pub(crate) column_type: ColumnType,
    pub(crate) column: String,
    pub(crate) preferred_column: String,
    pub(crate) nullable: bool,
    pub(crate) length: u32,
    pub(crate) precision: u32,
    pub(crate) scale: u32,
    pub(crate) default_value: Option<String>,
    pub(crate) foreign_entity: Option<EntityRef>,
    pub(crate) list_only: Option<ListOnlySource>,
    pub(crate) view_source: Option<ViewSource>,
    pub(crate) transformer: Option<Arc<dyn FieldTransformer>>,
    pub(crate) getter: Getter,
    pub(crate) setter: Setter,
}

impl FieldSchema {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    /// Column name as declared
    pub fn column(&self) -> &str {
        &self.column
    }

    /// Column name with the data source's case rules applied
    pub fn preferred_column(&self) -> &str {
        &self.preferred_column
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn precision(&self) -> u32 {
        self.precision
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn default_value(&self) -> Option<&str> {
        self.default_value.as_deref()
    }

    pub fn foreign_entity(&self) -> Option<&EntityRef> {
        self.foreign_entity.as_ref()
    }

    pub fn list_only_source(&self) -> Option<&ListOnlySource> {
        self.list_only.as_ref()
    }

    pub fn view_source(&self) -> Option<&ViewSource> {
        self.view_source.as_ref()
    }

    pub fn is_list_only(&self) -> bool {
        self.kind == FieldKind::ListOnly
    }

    pub fn is_foreign_key(&self) -> bool {
        self.kind == FieldKind::ForeignKey
    }

    /// Read the stored form of this field from a record
    pub fn get(&self, record: &DynEntity) -> Result<SqlValue> {
        let value = (self.getter)(record)?;
        match &self.transformer {
            Some(transformer) if !value.is_null() => transformer.forward(value),
            _ => Ok(value),
        }
    }

    /// Write a stored value into a record
    pub fn set(&self, record: &mut DynEntity, value: SqlValue) -> Result<()> {
        let value = match &self.transformer {
            Some(transformer) if !value.is_null() => transformer.reverse(value)?,
            _ => value,
        };
        (self.setter)(record, value).map_err(|e| {
            e.with_context(format!("setting field '{}' of '{}'", self.name, self.entity))
        })
    }

    /// Write an entity-level value, bypassing any transformer
    pub fn set_value(&self, record: &mut DynEntity, value: SqlValue) -> Result<()> {
        (self.setter)(record, value).map_err(|e| {
            e.with_context(format!("setting field '{}' of '{}'", self.name, self.entity))
        })
    }

    /// Read the entity-level value, before any transformer runs
    pub fn get_value(&self, record: &DynEntity) -> Result<SqlValue> {
        (self.getter)(record)
    }

    /// Transform an entity-level value into its stored form
    pub fn to_stored(&self, value: SqlValue) -> Result<SqlValue> {
        match &self.transformer {
            Some(transformer) if !value.is_null() => transformer.forward(value),
            _ => Ok(value),
        }
    }

    /// Transform a stored value back into its entity-level form
    pub fn from_stored(&self, value: SqlValue) -> Result<SqlValue> {
        match &self.transformer {
            Some(transformer) if !value.is_null() => transformer.reverse(value),
            _ => Ok(value),
        }
    }

    pub fn has_transformer(&self) -> bool {
        self.transformer.is_some()
    }
}

impl fmt::Debug for FieldSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSchema")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("column_type", &self.column_type)
            .field("column", &self.preferred_column)
            .field("nullable", &self.nullable)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    Single,
    Many,
}

pub(crate) type ChildrenMut =
    Arc<dyn for<'a> Fn(&'a mut DynEntity) -> Vec<&'a mut DynEntity> + Send + Sync>;
pub(crate) type ChildrenSet =
    Arc<dyn Fn(&mut DynEntity, Vec<Box<DynEntity>>) -> Result<()> + Send + Sync>;

/// Owned child relation; children are created, replaced and deleted with the parent
pub struct ChildSchema {
    pub(crate) name: String,
    pub(crate) kind: ChildKind,
    pub(crate) child: EntityRef,
    pub(crate) child_fk_field: String,
    pub(crate) children_mut: ChildrenMut,
    pub(crate) set_children: ChildrenSet,
}

impl ChildSchema {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChildKind {
        self.kind
    }

    pub fn child(&self) -> &EntityRef {
        &self.child
    }

    /// Field on the child that holds the parent id
    pub fn child_fk_field(&self) -> &str {
        &self.child_fk_field
    }

    pub(crate) fn children_mut<'a>(&self, parent: &'a mut DynEntity) -> Vec<&'a mut DynEntity> {
        (self.children_mut)(parent)
    }

    pub(crate) fn set_children(
        &self,
        parent: &mut DynEntity,
        children: Vec<Box<DynEntity>>,
    ) -> Result<()> {
        (self.set_children)(parent, children)
    }
}

impl fmt::Debug for ChildSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildSchema")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("child", &self.child.name())
            .field("child_fk_field", &self.child_fk_field)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ForeignKeySchema {
    pub name: String,
    pub field: String,
    pub target: EntityRef,
}

#[derive(Debug, Clone)]
pub struct UniqueConstraintSchema {
    pub name: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IndexSchema {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
}

/// Base table of a view-only entity
#[derive(Debug, Clone)]
pub struct ViewBaseTable {
    pub alias: String,
    pub entity: EntityRef,
}

/// Join condition between two base tables of a view-only entity
#[derive(Debug, Clone)]
pub struct ViewRestriction {
    pub left_alias: String,
    pub left_field: String,
    pub right_alias: String,
    pub right_field: String,
}

pub(crate) fn downcast_error(entity: &str) -> Error {
    Error::conversion(format!("record is not an instance of '{}'", entity))
}
