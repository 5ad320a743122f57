//! Entity definitions
//!
//! Entities describe their persistence layout once, through [`EntityDef`].
//! The builder captures typed accessor closures for every field and relation
//! so the engine can read and write records without reflection.
//!
//! ```ignore
//! impl Entity for Account {
//!     fn define() -> EntityDef<Self> {
//!         EntityDef::table("account")
//!             .id("id", ColumnType::Long, |a: &Account| &a.id, |a| &mut a.id)
//!             .field("name", ColumnType::String, |a| &a.name, |a| &mut a.name)
//!             .length(64)
//!             .version("version", ColumnType::Long, |a| &a.version, |a| &mut a.version)
//!             .unique("name", &["name"])
//!     }
//! }
//! ```

use super::field::{
    downcast_error, ChildKind, ChildSchema, FieldKind, FieldSchema, FieldTransformer,
    ForeignKeySchema, IndexSchema, ListOnlySource, UniqueConstraintSchema, ViewBaseTable,
    ViewRestriction, ViewSource,
};
use super::policy::{EntityPolicy, NoopEntityPolicy};
use super::registry::NamingRules;
use super::{DynEntity, EntityRef, EntitySchema};
use crate::database::types::{ColumnType, FieldValue};
use crate::error::{Error, Result};
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

/// A persistent record type
pub trait Entity: Any + Default + Send + Sync {
    fn define() -> EntityDef<Self>;
}

/// Short, module-free name of an entity type
pub(crate) fn entity_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

struct FieldDef {
    name: String,
    kind: FieldKind,
    column_type: ColumnType,
    column: Option<String>,
    nullable: bool,
    length: u32,
    precision: u32,
    scale: u32,
    default_value: Option<String>,
    foreign_entity: Option<EntityRef>,
    list_only: Option<ListOnlySource>,
    view_source: Option<ViewSource>,
    transformer: Option<Arc<dyn FieldTransformer>>,
    getter: super::field::Getter,
    setter: super::field::Setter,
}

struct ChildDef {
    name: String,
    kind: ChildKind,
    child: EntityRef,
    child_fk_field: String,
    children_mut: super::field::ChildrenMut,
    set_children: super::field::ChildrenSet,
}

/// Builder describing how an entity type is persisted
pub struct EntityDef<T: Entity> {
    name: String,
    table: String,
    view: Option<String>,
    view_only: bool,
    fields: Vec<FieldDef>,
    children: Vec<ChildDef>,
    unique_constraints: Vec<UniqueConstraintSchema>,
    indexes: Vec<IndexSchema>,
    base_tables: Vec<ViewBaseTable>,
    view_restrictions: Vec<ViewRestriction>,
    policy: Arc<dyn EntityPolicy>,
    errors: Vec<String>,
    _marker: PhantomData<fn() -> T>,
}

fn children_accessor<F>(f: F) -> super::field::ChildrenMut
where
    F: for<'a> Fn(&'a mut DynEntity) -> Vec<&'a mut DynEntity> + Send + Sync + 'static,
{
    Arc::new(f)
}

impl<T: Entity> EntityDef<T> {
    fn new(table: &str, view_only: bool) -> Self {
        Self {
            name: entity_name::<T>().to_string(),
            table: table.to_string(),
            view: None,
            view_only,
            fields: Vec::new(),
            children: Vec::new(),
            unique_constraints: Vec::new(),
            indexes: Vec::new(),
            base_tables: Vec::new(),
            view_restrictions: Vec::new(),
            policy: Arc::new(NoopEntityPolicy),
            errors: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Entity stored in its own table
    pub fn table(table: &str) -> Self {
        Self::new(table, false)
    }

    /// Entity that only exists as a view over other entities' tables
    pub fn view(view: &str) -> Self {
        let mut def = Self::new(view, true);
        def.view = Some(view.to_string());
        def
    }

    /// Override the entity name used in messages and name lookups
    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Name of the joined view carrying list-only fields (default `v_<table>`)
    pub fn view_name(mut self, view: &str) -> Self {
        self.view = Some(view.to_string());
        self
    }

    pub fn policy(mut self, policy: Arc<dyn EntityPolicy>) -> Self {
        self.policy = policy;
        self
    }

    fn push_field<V, G, M>(
        mut self,
        name: &str,
        kind: FieldKind,
        column_type: ColumnType,
        get: G,
        get_mut: M,
    ) -> Self
    where
        V: FieldValue,
        G: Fn(&T) -> &V + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut V + Send + Sync + 'static,
    {
        let entity = self.name.clone();
        let getter_entity = entity.clone();
        let getter: super::field::Getter = Arc::new(move |record: &DynEntity| {
            record
                .downcast_ref::<T>()
                .map(|t| get(t).to_sql_value())
                .ok_or_else(|| downcast_error(&getter_entity))
        });
        let setter: super::field::Setter = Arc::new(move |record: &mut DynEntity, value| {
            let t = record
                .downcast_mut::<T>()
                .ok_or_else(|| downcast_error(&entity))?;
            *get_mut(t) = V::from_sql_value(value)?;
            Ok(())
        });

        let nullable = matches!(kind, FieldKind::ListOnly);
        self.fields.push(FieldDef {
            name: name.to_string(),
            kind,
            column_type,
            column: None,
            nullable,
            length: 0,
            precision: 0,
            scale: 0,
            default_value: None,
            foreign_entity: None,
            list_only: None,
            view_source: None,
            transformer: None,
            getter,
            setter,
        });
        self
    }

    /// Primary key field
    pub fn id<V, G, M>(self, name: &str, column_type: ColumnType, get: G, get_mut: M) -> Self
    where
        V: FieldValue,
        G: Fn(&T) -> &V + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut V + Send + Sync + 'static,
    {
        self.push_field(name, FieldKind::Id, column_type, get, get_mut)
    }

    /// Optimistic lock version field
    pub fn version<V, G, M>(self, name: &str, column_type: ColumnType, get: G, get_mut: M) -> Self
    where
        V: FieldValue,
        G: Fn(&T) -> &V + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut V + Send + Sync + 'static,
    {
        self.push_field(name, FieldKind::Version, column_type, get, get_mut)
    }

    pub fn field<V, G, M>(self, name: &str, column_type: ColumnType, get: G, get_mut: M) -> Self
    where
        V: FieldValue,
        G: Fn(&T) -> &V + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut V + Send + Sync + 'static,
    {
        self.push_field(name, FieldKind::Regular, column_type, get, get_mut)
    }

    /// Field joined from the record referenced by `foreign_key_field`
    pub fn list_only<V, G, M>(
        self,
        name: &str,
        column_type: ColumnType,
        foreign_key_field: &str,
        foreign_field: &str,
        get: G,
        get_mut: M,
    ) -> Self
    where
        V: FieldValue,
        G: Fn(&T) -> &V + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut V + Send + Sync + 'static,
    {
        let mut def = self.push_field(name, FieldKind::ListOnly, column_type, get, get_mut);
        if let Some(field) = def.fields.last_mut() {
            field.list_only = Some(ListOnlySource {
                foreign_key_field: foreign_key_field.to_string(),
                foreign_field: foreign_field.to_string(),
            });
        }
        def
    }

    fn modify_last(mut self, modifier: &str, f: impl FnOnce(&mut FieldDef)) -> Self {
        match self.fields.last_mut() {
            Some(field) => f(field),
            None => self
                .errors
                .push(format!("'{}' used before any field was declared", modifier)),
        }
        self
    }

    /// Explicit column name for the last declared field
    pub fn column(self, column: &str) -> Self {
        self.modify_last("column", |f| f.column = Some(column.to_string()))
    }

    pub fn length(self, length: u32) -> Self {
        self.modify_last("length", |f| f.length = length)
    }

    pub fn precision(self, precision: u32, scale: u32) -> Self {
        self.modify_last("precision", |f| {
            f.precision = precision;
            f.scale = scale;
        })
    }

    /// Mark the last declared field as a foreign key to the id of `F`
    pub fn references<F: Entity>(self) -> Self {
        self.modify_last("references", |f| {
            if f.kind == FieldKind::Regular {
                f.kind = FieldKind::ForeignKey;
            }
            f.foreign_entity = Some(EntityRef::of::<F>());
        })
    }

    pub fn nullable(self) -> Self {
        self.modify_last("nullable", |f| f.nullable = true)
    }

    /// SQL literal used as the column default in DDL
    pub fn default_value(self, default: &str) -> Self {
        self.modify_last("default_value", |f| f.default_value = Some(default.to_string()))
    }

    pub fn transform(self, transformer: Arc<dyn FieldTransformer>) -> Self {
        self.modify_last("transform", |f| f.transformer = Some(transformer))
    }

    /// Base table column a view-only field is selected from
    pub fn from_view(self, table_alias: &str, field: &str) -> Self {
        self.modify_last("from_view", |f| {
            f.view_source = Some(ViewSource {
                table_alias: table_alias.to_string(),
                field: field.to_string(),
            })
        })
    }

    /// Single owned child, linked by `child_fk_field` on the child
    pub fn child<C, M>(mut self, name: &str, child_fk_field: &str, get_mut: M) -> Self
    where
        C: Entity,
        M: Fn(&mut T) -> &mut Option<C> + Send + Sync + 'static,
    {
        let get_mut = Arc::new(get_mut);
        let reader = get_mut.clone();
        let children_mut = children_accessor(move |record: &mut DynEntity| {
            match record.downcast_mut::<T>() {
                Some(t) => reader(t)
                    .as_mut()
                    .map(|c| vec![c as &mut DynEntity])
                    .unwrap_or_default(),
                None => Vec::new(),
            }
        });
        let parent = self.name.clone();
        let set_children: super::field::ChildrenSet =
            Arc::new(move |record: &mut DynEntity, children: Vec<Box<DynEntity>>| {
                let t = record
                    .downcast_mut::<T>()
                    .ok_or_else(|| downcast_error(&parent))?;
                let child = match children.into_iter().next() {
                    Some(boxed) => Some(
                        *boxed
                            .downcast::<C>()
                            .map_err(|_| downcast_error(entity_name::<C>()))?,
                    ),
                    None => None,
                };
                *get_mut(t) = child;
                Ok(())
            });

        self.children.push(ChildDef {
            name: name.to_string(),
            kind: ChildKind::Single,
            child: EntityRef::of::<C>(),
            child_fk_field: child_fk_field.to_string(),
            children_mut,
            set_children,
        });
        self
    }

    /// List of owned children, linked by `child_fk_field` on each child
    pub fn child_list<C, M>(mut self, name: &str, child_fk_field: &str, get_mut: M) -> Self
    where
        C: Entity,
        M: Fn(&mut T) -> &mut Vec<C> + Send + Sync + 'static,
    {
        let get_mut = Arc::new(get_mut);
        let reader = get_mut.clone();
        let children_mut = children_accessor(move |record: &mut DynEntity| {
            match record.downcast_mut::<T>() {
                Some(t) => reader(t)
                    .iter_mut()
                    .map(|c| c as &mut DynEntity)
                    .collect(),
                None => Vec::new(),
            }
        });
        let parent = self.name.clone();
        let set_children: super::field::ChildrenSet =
            Arc::new(move |record: &mut DynEntity, children: Vec<Box<DynEntity>>| {
                let t = record
                    .downcast_mut::<T>()
                    .ok_or_else(|| downcast_error(&parent))?;
                let mut list = Vec::with_capacity(children.len());
                for boxed in children {
                    let child = boxed
                        .downcast::<C>()
                        .map_err(|_| downcast_error(entity_name::<C>()))?;
                    list.push(*child);
                }
                *get_mut(t) = list;
                Ok(())
            });

        self.children.push(ChildDef {
            name: name.to_string(),
            kind: ChildKind::Many,
            child: EntityRef::of::<C>(),
            child_fk_field: child_fk_field.to_string(),
            children_mut,
            set_children,
        });
        self
    }

    pub fn unique(mut self, name: &str, fields: &[&str]) -> Self {
        self.unique_constraints.push(UniqueConstraintSchema {
            name: name.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        });
        self
    }

    pub fn index(mut self, name: &str, fields: &[&str]) -> Self {
        self.indexes.push(IndexSchema {
            name: name.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique: false,
        });
        self
    }

    /// Base table of a view-only entity
    pub fn base_table<B: Entity>(mut self, alias: &str) -> Self {
        self.base_tables.push(ViewBaseTable {
            alias: alias.to_string(),
            entity: EntityRef::of::<B>(),
        });
        self
    }

    /// Equality join between two base tables of a view-only entity
    pub fn view_join(
        mut self,
        left_alias: &str,
        left_field: &str,
        right_alias: &str,
        right_field: &str,
    ) -> Self {
        self.view_restrictions.push(ViewRestriction {
            left_alias: left_alias.to_string(),
            left_field: left_field.to_string(),
            right_alias: right_alias.to_string(),
            right_field: right_field.to_string(),
        });
        self
    }

    /// Validate the definition and apply naming rules
    pub(crate) fn build(self, rules: &NamingRules) -> Result<EntitySchema> {
        let entity = self.name.clone();
        let invalid = |message: String| Error::invalid_schema(entity.clone(), message);

        if let Some(message) = self.errors.into_iter().next() {
            return Err(invalid(message));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.clone()) {
                return Err(invalid(format!("duplicate field '{}'", field.name)));
            }
        }

        let id_fields: Vec<&FieldDef> = self
            .fields
            .iter()
            .filter(|f| f.kind == FieldKind::Id)
            .collect();
        let id_field = match id_fields.as_slice() {
            [only] => only.name.clone(),
            [] => return Err(invalid("entity has no id field".into())),
            _ => return Err(invalid("entity declares more than one id field".into())),
        };

        let mut version_field = None;
        for field in self.fields.iter().filter(|f| f.kind == FieldKind::Version) {
            if version_field.is_some() {
                return Err(invalid("entity declares more than one version field".into()));
            }
            if !field.column_type.is_integral() {
                return Err(invalid(format!(
                    "version field '{}' must be an integral column",
                    field.name
                )));
            }
            version_field = Some(field.name.clone());
        }

        let true_names: HashSet<&str> = self
            .fields
            .iter()
            .filter(|f| f.kind != FieldKind::ListOnly)
            .map(|f| f.name.as_str())
            .collect();

        for field in &self.fields {
            if let Some(source) = &field.list_only {
                let fk = self
                    .fields
                    .iter()
                    .find(|f| f.name == source.foreign_key_field);
                match fk {
                    Some(fk) if fk.kind == FieldKind::ForeignKey => {}
                    _ => {
                        return Err(invalid(format!(
                            "list-only field '{}' references '{}', which is not a foreign key field",
                            field.name, source.foreign_key_field
                        )))
                    }
                }
            }
        }

        for constraint in &self.unique_constraints {
            check_fields(&true_names, &constraint.fields, &constraint.name).map_err(invalid)?;
        }
        for index in &self.indexes {
            check_fields(&true_names, &index.fields, &index.name).map_err(invalid)?;
        }

        if self.view_only && self.base_tables.is_empty() {
            return Err(invalid("view-only entity has no base tables".into()));
        }
        if !self.view_only && !self.base_tables.is_empty() {
            return Err(invalid("only view-only entities can declare base tables".into()));
        }
        let aliases: HashSet<&str> = self.base_tables.iter().map(|b| b.alias.as_str()).collect();
        for restriction in &self.view_restrictions {
            for alias in [&restriction.left_alias, &restriction.right_alias] {
                if !aliases.contains(alias.as_str()) {
                    return Err(invalid(format!("unknown view table alias '{}'", alias)));
                }
            }
        }

        let table = self.table.clone();
        let has_list_only = self.fields.iter().any(|f| f.kind == FieldKind::ListOnly);
        let view = if self.view_only {
            table.clone()
        } else if has_list_only {
            self.view.unwrap_or_else(|| format!("v_{}", table))
        } else {
            table.clone()
        };

        let mut fields = Vec::new();
        let mut list_fields = Vec::new();
        let mut foreign_keys = Vec::new();
        let default_alias = self.base_tables.first().map(|b| b.alias.clone());

        for def in self.fields {
            let column = def.column.unwrap_or_else(|| def.name.clone());
            let view_source = match (self.view_only, def.view_source) {
                (true, Some(source)) => Some(source),
                (true, None) => default_alias.clone().map(|alias| ViewSource {
                    table_alias: alias,
                    field: def.name.clone(),
                }),
                (false, _) => None,
            };
            if let Some(source) = &view_source {
                if !aliases.contains(source.table_alias.as_str()) {
                    return Err(invalid(format!(
                        "field '{}' selects from unknown view table alias '{}'",
                        def.name, source.table_alias
                    )));
                }
            }
            if let Some(target) = def.foreign_entity {
                foreign_keys.push(ForeignKeySchema {
                    name: format!("{}_{}_fk", table, column),
                    field: def.name.clone(),
                    target,
                });
            }

            let field = Arc::new(FieldSchema {
                entity: entity.clone(),
                preferred_column: rules.preferred(&column),
                column,
                name: def.name,
                kind: def.kind,
                column_type: def.column_type,
                nullable: def.nullable,
                length: def.length,
                precision: def.precision,
                scale: def.scale,
                default_value: def.default_value,
                foreign_entity: def.foreign_entity,
                list_only: def.list_only,
                view_source,
                transformer: def.transformer,
                getter: def.getter,
                setter: def.setter,
            });
            if field.kind != FieldKind::ListOnly {
                fields.push(field.clone());
            }
            list_fields.push(field);
        }

        let field_index: HashMap<String, usize> = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        let list_field_index: HashMap<String, usize> = list_fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();

        let children = self
            .children
            .into_iter()
            .map(|c| ChildSchema {
                name: c.name,
                kind: c.kind,
                child: c.child,
                child_fk_field: c.child_fk_field,
                children_mut: c.children_mut,
                set_children: c.set_children,
            })
            .collect();

        Ok(EntitySchema {
            type_id: TypeId::of::<T>(),
            name: entity,
            preferred_table: rules.preferred(&table),
            schema_table: rules.qualified(&table),
            table,
            preferred_view: rules.preferred(&view),
            schema_view: rules.qualified(&view),
            view,
            id_field,
            version_field,
            fields,
            list_fields,
            field_index,
            list_field_index,
            foreign_keys,
            children,
            unique_constraints: self.unique_constraints,
            indexes: self.indexes,
            view_base_tables: self.base_tables,
            view_restrictions: self.view_restrictions,
            policy: self.policy,
            new_instance: new_instance::<T>,
        })
    }
}

fn check_fields(
    known: &HashSet<&str>,
    fields: &[String],
    owner: &str,
) -> std::result::Result<(), String> {
    if fields.is_empty() {
        return Err(format!("'{}' lists no fields", owner));
    }
    match fields.iter().find(|f| !known.contains(f.as_str())) {
        Some(missing) => Err(format!("'{}' references unknown field '{}'", owner, missing)),
        None => Ok(()),
    }
}

fn new_instance<T: Entity>() -> Box<DynEntity> {
    Box::new(T::default())
}
