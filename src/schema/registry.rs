//! Entity schema registry
//!
//! Schemas are built lazily the first time an entity type is resolved and
//! then cached for the lifetime of the registry. Each dialect owns one
//! registry so table and column names follow that data source's case rules.

use super::entity::Entity;
use super::EntitySchema;
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::any::TypeId;
use std::sync::Arc;

/// Case and qualification rules applied to generated object names
#[derive(Debug, Clone, Default)]
pub struct NamingRules {
    pub all_objects_in_lowercase: bool,
    pub schema: Option<String>,
}

impl NamingRules {
    pub fn new(all_objects_in_lowercase: bool, schema: Option<String>) -> Self {
        Self {
            all_objects_in_lowercase,
            schema,
        }
    }

    /// Apply the case rule to an object name
    pub fn preferred(&self, name: &str) -> String {
        if self.all_objects_in_lowercase {
            name.to_lowercase()
        } else {
            name.to_uppercase()
        }
    }

    /// Preferred name qualified with the schema, if one is configured
    pub fn qualified(&self, name: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", self.preferred(schema), self.preferred(name)),
            None => self.preferred(name),
        }
    }
}

pub struct EntityRegistry {
    rules: NamingRules,
    schemas: DashMap<TypeId, Arc<EntitySchema>>,
    names: DashMap<String, TypeId>,
}

impl EntityRegistry {
    pub fn new(rules: NamingRules) -> Self {
        Self {
            rules,
            schemas: DashMap::new(),
            names: DashMap::new(),
        }
    }

    pub fn rules(&self) -> &NamingRules {
        &self.rules
    }

    /// Get the schema of `T`, building and caching it on first use
    ///
    /// Child, foreign key and view base entities reachable from `T` are
    /// registered as well, so their schemas resolve by `TypeId` afterwards.
    pub fn resolve<T: Entity>(&self) -> Result<Arc<EntitySchema>> {
        let type_id = TypeId::of::<T>();
        if let Some(schema) = self.schemas.get(&type_id) {
            return Ok(schema.clone());
        }

        let schema = Arc::new(T::define().build(&self.rules)?);
        log::debug!(
            "Registered entity schema '{}' (table {}, view {})",
            schema.name(),
            schema.schema_table(),
            schema.schema_view()
        );

        let schema = self.schemas.entry(type_id).or_insert(schema).clone();
        self.names.insert(schema.name().to_string(), type_id);

        // Registered before walking relations so cycles terminate
        if let Err(e) = self.resolve_related(&schema) {
            self.schemas.remove(&type_id);
            self.names.remove(schema.name());
            return Err(e);
        }

        Ok(schema)
    }

    fn resolve_related(&self, schema: &EntitySchema) -> Result<()> {
        for child in schema.children() {
            let child_schema = child.child().resolve(self)?;
            if !child_schema.is_field(child.child_fk_field()) {
                return Err(Error::invalid_schema(
                    schema.name(),
                    format!(
                        "child '{}' has no field '{}' to hold the parent id",
                        child.name(),
                        child.child_fk_field()
                    ),
                ));
            }
        }
        for fk in schema.foreign_keys() {
            fk.target.resolve(self)?;
        }
        for base in schema.view_base_tables() {
            base.entity.resolve(self)?;
        }
        Ok(())
    }

    /// Schema of a type reached earlier through [`resolve`](Self::resolve)
    pub fn resolve_type(&self, type_id: TypeId) -> Result<Arc<EntitySchema>> {
        self.schema(type_id)
    }

    /// Get an already registered schema by type
    pub fn schema(&self, type_id: TypeId) -> Result<Arc<EntitySchema>> {
        self.schemas
            .get(&type_id)
            .map(|s| s.clone())
            .ok_or_else(|| Error::schema_not_found(format!("{:?}", type_id)))
    }

    /// Get an already registered schema by entity name
    pub fn schema_by_name(&self, name: &str) -> Result<Arc<EntitySchema>> {
        let type_id = self
            .names
            .get(name)
            .map(|id| *id)
            .ok_or_else(|| Error::schema_not_found(name))?;
        self.schema(type_id)
    }

    pub fn is_registered<T: Entity>(&self) -> bool {
        self.schemas.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
