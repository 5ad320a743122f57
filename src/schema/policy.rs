//! Entity policies
//!
//! A policy runs before every create, update, delete and query of its entity.
//! It is where ids are assigned, audit fields are stamped and tenant filters
//! are added. Every schema carries one; [`NoopEntityPolicy`] is the default.

use super::{DynEntity, EntitySchema};
use crate::criteria::Criteria;
use crate::database::types::{FieldValue, SqlValue};
use crate::error::{Error, Result};
use chrono::NaiveDateTime;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Field-level view of a record handed to policies
pub struct EntityRecord<'a> {
    schema: &'a EntitySchema,
    record: &'a mut DynEntity,
}

impl<'a> EntityRecord<'a> {
    pub fn new(schema: &'a EntitySchema, record: &'a mut DynEntity) -> Self {
        Self { schema, record }
    }

    pub fn schema(&self) -> &EntitySchema {
        self.schema
    }

    /// Read a persisted or list-only field
    pub fn get(&self, field: &str) -> Result<SqlValue> {
        self.schema.list_field(field)?.get(&*self.record)
    }

    pub fn get_as<V: FieldValue>(&self, field: &str) -> Result<V> {
        V::from_sql_value(self.get(field)?)
    }

    pub fn set(&mut self, field: &str, value: impl Into<SqlValue>) -> Result<()> {
        self.schema.list_field(field)?.set(&mut *self.record, value.into())
    }

    pub fn id(&self) -> Result<SqlValue> {
        self.schema.id_of(&*self.record)
    }

    pub fn set_id(&mut self, id: SqlValue) -> Result<()> {
        self.schema.id_field().set_value(&mut *self.record, id)
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.record.downcast_ref::<T>()
    }

    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.record.downcast_mut::<T>()
    }
}

/// Hooks run around persistence operations of one entity type
pub trait EntityPolicy: Send + Sync {
    /// Called before insert; a returned id is written into the record's id field
    fn pre_create(
        &self,
        _record: &mut EntityRecord<'_>,
        _now: Option<NaiveDateTime>,
    ) -> Result<Option<SqlValue>> {
        Ok(None)
    }

    fn pre_update(&self, _record: &mut EntityRecord<'_>, _now: Option<NaiveDateTime>) -> Result<()> {
        Ok(())
    }

    /// Called before a record passed by the caller is deleted
    fn pre_delete(&self, _record: &mut EntityRecord<'_>, _now: Option<NaiveDateTime>) -> Result<()> {
        Ok(())
    }

    /// Called before any query is translated; may add restrictions
    fn pre_query(&self, _schema: &EntitySchema, _criteria: &mut Criteria) -> Result<()> {
        Ok(())
    }

    fn on_create_error(&self, _record: &EntityRecord<'_>, _error: &Error) {}

    fn on_update_error(&self, _record: &EntityRecord<'_>, _error: &Error) {}

    fn on_delete_error(&self, _record: &EntityRecord<'_>, _error: &Error) {}

    /// Whether pre-create/pre-update/pre-delete hooks need the database time
    fn is_set_now(&self) -> bool {
        false
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEntityPolicy;

impl EntityPolicy for NoopEntityPolicy {}

/// Source of monotonically increasing ids
pub trait SequenceSource: Send + Sync {
    fn next_value(&self, sequence: &str) -> Result<i64>;
}

/// Process-local sequences
#[derive(Default)]
pub struct InMemorySequenceSource {
    sequences: DashMap<String, AtomicI64>,
}

static SHARED_SEQUENCES: Lazy<Arc<InMemorySequenceSource>> =
    Lazy::new(|| Arc::new(InMemorySequenceSource::default()));

impl InMemorySequenceSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequences shared by every policy in the process
    pub fn shared() -> Arc<InMemorySequenceSource> {
        SHARED_SEQUENCES.clone()
    }

    /// Start a sequence at `value`; the next call returns `value + 1`
    pub fn reset(&self, sequence: &str, value: i64) {
        self.sequences
            .insert(sequence.to_string(), AtomicI64::new(value));
    }
}

impl SequenceSource for InMemorySequenceSource {
    fn next_value(&self, sequence: &str) -> Result<i64> {
        let counter = self
            .sequences
            .entry(sequence.to_string())
            .or_insert_with(|| AtomicI64::new(0));
        Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Assigns ids from a named sequence and optionally stamps a timestamp field
pub struct SequencedEntityPolicy {
    source: Arc<dyn SequenceSource>,
    sequence: Option<String>,
    created_field: Option<String>,
    updated_field: Option<String>,
}

impl SequencedEntityPolicy {
    /// Ids from the sequence named after the entity table
    pub fn new(source: Arc<dyn SequenceSource>) -> Self {
        Self {
            source,
            sequence: None,
            created_field: None,
            updated_field: None,
        }
    }

    pub fn sequence(mut self, name: &str) -> Self {
        self.sequence = Some(name.to_string());
        self
    }

    /// Field set to the database time on create
    pub fn created_at(mut self, field: &str) -> Self {
        self.created_field = Some(field.to_string());
        self
    }

    /// Field set to the database time on create and update
    pub fn updated_at(mut self, field: &str) -> Self {
        self.updated_field = Some(field.to_string());
        self
    }
}

impl EntityPolicy for SequencedEntityPolicy {
    fn pre_create(
        &self,
        record: &mut EntityRecord<'_>,
        now: Option<NaiveDateTime>,
    ) -> Result<Option<SqlValue>> {
        let sequence = self
            .sequence
            .clone()
            .unwrap_or_else(|| format!("{}_seq", record.schema().table()));
        let id = self.source.next_value(&sequence)?;
        if let Some(now) = now {
            for field in self.created_field.iter().chain(self.updated_field.iter()) {
                record.set(field, now)?;
            }
        }
        Ok(Some(SqlValue::BigInt(id)))
    }

    fn pre_update(&self, record: &mut EntityRecord<'_>, now: Option<NaiveDateTime>) -> Result<()> {
        if let (Some(field), Some(now)) = (&self.updated_field, now) {
            record.set(field, now)?;
        }
        Ok(())
    }

    fn is_set_now(&self) -> bool {
        self.created_field.is_some() || self.updated_field.is_some()
    }
}

/// Assigns random v4 UUID ids, stored as text
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidEntityPolicy;

impl EntityPolicy for UuidEntityPolicy {
    fn pre_create(
        &self,
        _record: &mut EntityRecord<'_>,
        _now: Option<NaiveDateTime>,
    ) -> Result<Option<SqlValue>> {
        Ok(Some(SqlValue::String(uuid::Uuid::new_v4().to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_sequences_are_independent() {
        let source = InMemorySequenceSource::new();
        assert_eq!(source.next_value("a").unwrap(), 1);
        assert_eq!(source.next_value("a").unwrap(), 2);
        assert_eq!(source.next_value("b").unwrap(), 1);

        source.reset("a", 100);
        assert_eq!(source.next_value("a").unwrap(), 101);
    }

    #[test]
    fn test_concurrent_sequence_values_are_unique() {
        let source = Arc::new(InMemorySequenceSource::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let source = source.clone();
                std::thread::spawn(move || {
                    (0..250)
                        .map(|_| source.next_value("shared").unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut values: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        values.sort_unstable();
        values.dedup();
        assert_eq!(values.len(), 1000);
        assert_eq!(values.last(), Some(&1000));
    }
}
