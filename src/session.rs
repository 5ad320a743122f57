//! Database sessions
//!
//! A [`DatabaseSession`] holds one pooled connection for a unit of work and
//! runs every entity operation on it. The connection is always inside a
//! transaction: one is begun when the session opens and again after each
//! commit or rollback, so closing the session discards anything that was not
//! committed.
//!
//! Operations that cascade (creating and deleting owned children, loading
//! child lists) recurse through boxed futures. Cascades are not rolled back
//! automatically; use [`set_savepoint`](DatabaseSession::set_savepoint) and
//! [`rollback_to_savepoint`](DatabaseSession::rollback_to_savepoint) to undo
//! a partial cascade.

use crate::callable::{CallableProc, CallableResult};
use crate::criteria::{
    AggregateFunction, Aggregation, Criteria, GroupAggregation, OrderDirection, Query,
    Restriction, Update,
};
use crate::database::adapter::{DataSource, SqlConnection};
use crate::database::types::{ColumnType, FieldValue, SqlValue};
use crate::dialects::{SqlDialect, SqlStatement};
use crate::error::{Error, ErrorContext, Result};
use crate::executor;
use crate::schema::entity::entity_name;
use crate::schema::field::downcast_error;
use crate::schema::{ChildKind, DynEntity, Entity, EntityPolicy, EntityRecord, EntitySchema};
use chrono::NaiveDateTime;
use futures::future::BoxFuture;
use indexmap::{IndexMap, IndexSet};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Version written into a versioned record when it is created
pub const INITIAL_VERSION: i64 = 1;

enum SessionState {
    Open(Box<dyn SqlConnection>),
    Closed,
}

/// Unit of work on one data source connection
pub struct DatabaseSession {
    data_source: Arc<dyn DataSource>,
    dialect: Arc<dyn SqlDialect>,
    state: SessionState,
    savepoints: Vec<String>,
    savepoint_counter: u64,
}

impl std::fmt::Debug for DatabaseSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSession")
            .field("data_source", &self.data_source.name())
            .field("open", &matches!(self.state, SessionState::Open(_)))
            .field("savepoints", &self.savepoints)
            .finish_non_exhaustive()
    }
}

fn into_entity<T: Entity>(record: Box<DynEntity>) -> Result<T> {
    record
        .downcast::<T>()
        .map(|record| *record)
        .map_err(|_| downcast_error(entity_name::<T>()))
}

fn into_entities<T: Entity>(records: Vec<Box<DynEntity>>) -> Result<Vec<T>> {
    records.into_iter().map(into_entity).collect()
}

/// Split an id list into chunks the dialect accepts in one IN clause
fn id_chunks(ids: &[SqlValue], max_clause_values: usize) -> std::slice::Chunks<'_, SqlValue> {
    let size = if max_clause_values == 0 {
        ids.len().max(1)
    } else {
        max_clause_values
    };
    ids.chunks(size)
}

fn optional<V: FieldValue>(value: Option<SqlValue>) -> Result<Option<V>> {
    match value {
        Some(value) if !value.is_null() => V::from_sql_value(value).map(Some),
        _ => Ok(None),
    }
}

impl DatabaseSession {
    /// Check a connection out of `data_source` and begin a transaction on it
    pub async fn open(data_source: Arc<dyn DataSource>) -> Result<Self> {
        let dialect = data_source.dialect();
        let mut connection = data_source.get_connection().await?;
        if let Err(e) = connection
            .execute_raw(&dialect.begin_transaction_sql())
            .await
        {
            data_source.restore_connection(connection).await;
            return Err(e.with_context(format!(
                "opening session on data source '{}'",
                data_source.name()
            )));
        }
        log::debug!("Opened session on data source '{}'", data_source.name());
        Ok(Self {
            data_source,
            dialect,
            state: SessionState::Open(connection),
            savepoints: Vec::new(),
            savepoint_counter: 0,
        })
    }

    pub fn data_source_name(&self) -> &str {
        self.data_source.name()
    }

    pub fn dialect(&self) -> &Arc<dyn SqlDialect> {
        &self.dialect
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed)
    }

    fn connection(&mut self) -> Result<&mut dyn SqlConnection> {
        match &mut self.state {
            SessionState::Open(connection) => Ok(connection.as_mut()),
            SessionState::Closed => Err(Error::SessionClosed),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            SessionState::Open(_) => Ok(()),
            SessionState::Closed => Err(Error::SessionClosed),
        }
    }

    /// Schema of `T` as named by this session's dialect
    pub fn schema<T: Entity>(&self) -> Result<Arc<EntitySchema>> {
        self.dialect.registry().resolve::<T>()
    }

    fn pre_query(&self, schema: &EntitySchema, mut criteria: Criteria) -> Result<Criteria> {
        schema.policy().pre_query(schema, &mut criteria)?;
        Ok(criteria)
    }

    fn reads_view(&self, schema: &EntitySchema, criteria: &Criteria) -> bool {
        schema.is_view_only() || self.dialect.requires_view(schema, criteria)
    }

    fn record_statement(
        &self,
        schema: &EntitySchema,
        criteria: &Criteria,
        list_only: bool,
    ) -> Result<SqlStatement> {
        if list_only && schema.is_viewable() {
            self.dialect.prepare_list_statement(schema, criteria)
        } else {
            let use_view = self.reads_view(schema, criteria);
            self.dialect.prepare_find_statement(schema, criteria, use_view)
        }
    }

    async fn policy_now(&mut self, policy: &Arc<dyn EntityPolicy>) -> Result<Option<NaiveDateTime>> {
        if policy.is_set_now() {
            Ok(Some(self.now().await?))
        } else {
            Ok(None)
        }
    }

    // Create

    /// Insert a record and its owned children, returning the record's id
    ///
    /// The entity policy may assign the id. A versioned record starts at
    /// [`INITIAL_VERSION`].
    pub async fn create<T: Entity>(&mut self, record: &mut T) -> Result<SqlValue> {
        let schema = self.schema::<T>()?;
        self.create_record(&schema, record).await
    }

    fn create_record<'a>(
        &'a mut self,
        schema: &'a EntitySchema,
        record: &'a mut DynEntity,
    ) -> BoxFuture<'a, Result<SqlValue>> {
        Box::pin(async move {
            if schema.is_view_only() {
                return Err(Error::view_only(schema.name(), "create"));
            }
            let policy = schema.policy().clone();
            let old_version = schema.version_of(&*record)?;
            let result = async {
                let now = self.policy_now(&policy).await?;
                let assigned =
                    policy.pre_create(&mut EntityRecord::new(schema, &mut *record), now)?;
                if let Some(id) = assigned {
                    schema.id_field().set_value(&mut *record, id)?;
                }
                if let Some(version) = schema.version_field() {
                    version.set_value(&mut *record, SqlValue::BigInt(INITIAL_VERSION))?;
                }

                let stmt = self.dialect.prepare_create_statement(schema, &*record)?;
                executor::execute_update(self.connection()?, &stmt).await?;

                let id = schema.id_of(&*record)?;
                if schema.has_children() {
                    self.create_children(schema, &mut *record, &id)
                        .await
                        .with_context(|| format!("creating children of '{}'", schema.name()))?;
                }
                Ok::<_, Error>(id)
            }
            .await;

            if let Err(e) = &result {
                if let (Some(old), Some(version_field)) = (old_version, schema.version_field()) {
                    if let Err(restore) = version_field.set_value(&mut *record, old) {
                        log::warn!(
                            "Could not restore version of '{}' after failed create: {}",
                            schema.name(),
                            restore
                        );
                    }
                }
                policy.on_create_error(&EntityRecord::new(schema, &mut *record), e);
            }
            result
        })
    }

    fn create_children<'a>(
        &'a mut self,
        schema: &'a EntitySchema,
        record: &'a mut DynEntity,
        id: &'a SqlValue,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for child in schema.children() {
                let child_schema = child.child().resolve(self.dialect.registry())?;
                let fk_field = child_schema.field(child.child_fk_field())?.clone();
                for child_record in child.children_mut(&mut *record) {
                    fk_field.set_value(&mut *child_record, id.clone())?;
                    self.create_record(&child_schema, child_record).await?;
                }
            }
            Ok(())
        })
    }

    // Find and list

    /// Record by id, with its children
    pub async fn find<T: Entity>(&mut self, id: impl Into<SqlValue>) -> Result<T> {
        self.load_by_id::<T>(id.into(), None, false, true).await
    }

    /// Record by id and version, with its children
    pub async fn find_version<T: Entity>(
        &mut self,
        id: impl Into<SqlValue>,
        version: impl Into<SqlValue>,
    ) -> Result<T> {
        self.load_by_id::<T>(id.into(), Some(version.into()), false, true)
            .await
    }

    /// Record by id, without children
    pub async fn find_lean<T: Entity>(&mut self, id: impl Into<SqlValue>) -> Result<T> {
        self.load_by_id::<T>(id.into(), None, false, false).await
    }

    pub async fn find_lean_version<T: Entity>(
        &mut self,
        id: impl Into<SqlValue>,
        version: impl Into<SqlValue>,
    ) -> Result<T> {
        self.load_by_id::<T>(id.into(), Some(version.into()), false, false)
            .await
    }

    /// Record by id including list-only fields, with its children
    pub async fn list<T: Entity>(&mut self, id: impl Into<SqlValue>) -> Result<T> {
        self.load_by_id::<T>(id.into(), None, true, true).await
    }

    pub async fn list_version<T: Entity>(
        &mut self,
        id: impl Into<SqlValue>,
        version: impl Into<SqlValue>,
    ) -> Result<T> {
        self.load_by_id::<T>(id.into(), Some(version.into()), true, true)
            .await
    }

    pub async fn list_lean<T: Entity>(&mut self, id: impl Into<SqlValue>) -> Result<T> {
        self.load_by_id::<T>(id.into(), None, true, false).await
    }

    pub async fn list_lean_version<T: Entity>(
        &mut self,
        id: impl Into<SqlValue>,
        version: impl Into<SqlValue>,
    ) -> Result<T> {
        self.load_by_id::<T>(id.into(), Some(version.into()), true, false)
            .await
    }

    async fn load_by_id<T: Entity>(
        &mut self,
        id: SqlValue,
        version: Option<SqlValue>,
        list_only: bool,
        with_children: bool,
    ) -> Result<T> {
        let schema = self.schema::<T>()?;
        let mut record = self
            .fetch_by_id(&schema, &id, version.as_ref(), list_only)
            .await?;
        if with_children && schema.has_children() {
            self.fetch_children(&schema, &mut *record, &[], list_only)
                .await?;
        }
        into_entity(record)
    }

    async fn fetch_by_id(
        &mut self,
        schema: &EntitySchema,
        id: &SqlValue,
        version: Option<&SqlValue>,
        list_only: bool,
    ) -> Result<Box<DynEntity>> {
        let from_view = (list_only && schema.is_viewable()) || schema.is_view_only();
        let dialect = self.dialect.clone();
        let stmt = match (version, from_view) {
            (Some(version), true) => {
                dialect.prepare_list_by_id_version_statement(schema, id, version)?
            }
            (Some(version), false) => {
                dialect.prepare_find_by_id_version_statement(schema, id, version)?
            }
            (None, true) => dialect.prepare_list_by_id_statement(schema, id)?,
            (None, false) => dialect.prepare_find_by_id_statement(schema, id)?,
        };
        let record =
            executor::execute_single_record_result_query(self.connection()?, schema, &stmt, false)
                .await?;
        record.ok_or_else(|| match version {
            Some(version) => Error::version_mismatch(schema.name(), id, version),
            None => Error::record_not_found(schema.name(), id),
        })
    }

    /// Single record matching a query, with the selected children
    ///
    /// Returns `None` when nothing matches, unless the query is must-match.
    pub async fn find_one<T: Entity>(&mut self, query: &Query<T>) -> Result<Option<T>> {
        self.load_one(query, false, true).await
    }

    pub async fn find_one_lean<T: Entity>(&mut self, query: &Query<T>) -> Result<Option<T>> {
        self.load_one(query, false, false).await
    }

    pub async fn list_one<T: Entity>(&mut self, query: &Query<T>) -> Result<Option<T>> {
        self.load_one(query, true, true).await
    }

    pub async fn list_one_lean<T: Entity>(&mut self, query: &Query<T>) -> Result<Option<T>> {
        self.load_one(query, true, false).await
    }

    async fn load_one<T: Entity>(
        &mut self,
        query: &Query<T>,
        list_only: bool,
        with_children: bool,
    ) -> Result<Option<T>> {
        let schema = self.schema::<T>()?;
        let criteria = self.pre_query(&schema, query.criteria().clone())?;
        let stmt = self.record_statement(&schema, &criteria, list_only)?;
        let record = executor::execute_single_record_result_query(
            self.connection()?,
            &schema,
            &stmt,
            criteria.is_must_match(),
        )
        .await?;
        match record {
            Some(mut record) => {
                if with_children && schema.has_children() {
                    self.fetch_children(&schema, &mut *record, criteria.select(), list_only)
                        .await?;
                }
                into_entity(record).map(Some)
            }
            None => Ok(None),
        }
    }

    /// All records matching a query, without children
    pub async fn find_all<T: Entity>(&mut self, query: &Query<T>) -> Result<Vec<T>> {
        let schema = self.schema::<T>()?;
        let records = self
            .select_records(&schema, query.criteria().clone(), false)
            .await?;
        into_entities(records)
    }

    /// All records matching a query, each with its children
    pub async fn find_all_with_children<T: Entity>(&mut self, query: &Query<T>) -> Result<Vec<T>> {
        self.load_all_with_children(query, false).await
    }

    /// All records matching a query including list-only fields, without children
    pub async fn list_all<T: Entity>(&mut self, query: &Query<T>) -> Result<Vec<T>> {
        let schema = self.schema::<T>()?;
        let records = self
            .select_records(&schema, query.criteria().clone(), true)
            .await?;
        into_entities(records)
    }

    pub async fn list_all_with_children<T: Entity>(&mut self, query: &Query<T>) -> Result<Vec<T>> {
        self.load_all_with_children(query, true).await
    }

    async fn load_all_with_children<T: Entity>(
        &mut self,
        query: &Query<T>,
        list_only: bool,
    ) -> Result<Vec<T>> {
        let schema = self.schema::<T>()?;
        let select = query.criteria().select().to_vec();
        let mut records = self
            .select_records(&schema, query.criteria().clone(), list_only)
            .await?;
        if schema.has_children() {
            for record in records.iter_mut() {
                self.fetch_children(&schema, &mut **record, &select, list_only)
                    .await?;
            }
        }
        into_entities(records)
    }

    async fn select_records(
        &mut self,
        schema: &EntitySchema,
        criteria: Criteria,
        list_only: bool,
    ) -> Result<Vec<Box<DynEntity>>> {
        let criteria = self.pre_query(schema, criteria)?;
        let stmt = self.record_statement(schema, &criteria, list_only)?;
        executor::execute_multiple_record_result_query(self.connection()?, schema, &stmt).await
    }

    /// Load the owned children of `record`, limited to `select` when it is not empty
    fn fetch_children<'a>(
        &'a mut self,
        schema: &'a EntitySchema,
        record: &'a mut DynEntity,
        select: &'a [String],
        list_only: bool,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let id = schema.id_of(&*record)?;
            for child in schema.children() {
                if !select.is_empty() && !select.iter().any(|s| s == child.name()) {
                    continue;
                }
                let child_schema = child.child().resolve(self.dialect.registry())?;
                let mut criteria = Criteria::new();
                criteria
                    .add(Restriction::equals(child.child_fk_field(), id.clone()))
                    .add_order(child_schema.id_field().name(), OrderDirection::Asc);
                let mut children = self
                    .select_records(&child_schema, criteria, list_only)
                    .await?;

                if child.kind() == ChildKind::Single && children.len() > 1 {
                    return Err(Error::MultipleChildFound {
                        entity: schema.name().to_string(),
                        child: child.name().to_string(),
                        id: id.to_string(),
                    });
                }
                if child_schema.has_children() {
                    for child_record in children.iter_mut() {
                        self.fetch_children(&child_schema, &mut **child_record, &[], list_only)
                            .await?;
                    }
                }
                child.set_children(&mut *record, children)?;
            }
            Ok(())
        })
    }

    /// Records matching a query keyed by a unique field
    pub async fn find_all_map<K, T>(&mut self, key_field: &str, query: &Query<T>) -> Result<IndexMap<K, T>>
    where
        K: FieldValue + Eq + Hash,
        T: Entity,
    {
        self.load_map(key_field, query, false).await
    }

    /// Records matching a query grouped by a field
    pub async fn find_all_list_map<K, T>(
        &mut self,
        key_field: &str,
        query: &Query<T>,
    ) -> Result<IndexMap<K, Vec<T>>>
    where
        K: FieldValue + Eq + Hash,
        T: Entity,
    {
        self.load_list_map(key_field, query, false).await
    }

    pub async fn list_all_map<K, T>(&mut self, key_field: &str, query: &Query<T>) -> Result<IndexMap<K, T>>
    where
        K: FieldValue + Eq + Hash,
        T: Entity,
    {
        self.load_map(key_field, query, true).await
    }

    pub async fn list_all_list_map<K, T>(
        &mut self,
        key_field: &str,
        query: &Query<T>,
    ) -> Result<IndexMap<K, Vec<T>>>
    where
        K: FieldValue + Eq + Hash,
        T: Entity,
    {
        self.load_list_map(key_field, query, true).await
    }

    async fn load_map<K, T>(
        &mut self,
        key_field: &str,
        query: &Query<T>,
        list_only: bool,
    ) -> Result<IndexMap<K, T>>
    where
        K: FieldValue + Eq + Hash,
        T: Entity,
    {
        let schema = self.schema::<T>()?;
        let criteria = self.pre_query(&schema, query.criteria().clone())?;
        let stmt = self.record_statement(&schema, &criteria, list_only || !schema.is_field(key_field))?;
        let map = executor::execute_multiple_record_map_query::<K>(
            self.connection()?,
            &schema,
            key_field,
            &stmt,
        )
        .await?;
        map.into_iter()
            .map(|(key, record)| Ok((key, into_entity(record)?)))
            .collect()
    }

    async fn load_list_map<K, T>(
        &mut self,
        key_field: &str,
        query: &Query<T>,
        list_only: bool,
    ) -> Result<IndexMap<K, Vec<T>>>
    where
        K: FieldValue + Eq + Hash,
        T: Entity,
    {
        let schema = self.schema::<T>()?;
        let criteria = self.pre_query(&schema, query.criteria().clone())?;
        let stmt = self.record_statement(&schema, &criteria, list_only || !schema.is_field(key_field))?;
        let map = executor::execute_multiple_record_list_map_query::<K>(
            self.connection()?,
            &schema,
            key_field,
            &stmt,
        )
        .await?;
        map.into_iter()
            .map(|(key, records)| Ok((key, into_entities(records)?)))
            .collect()
    }

    /// First stored record that conflicts with `record` on any unique constraint
    pub async fn find_constraint<T: Entity>(&mut self, record: &T) -> Result<Option<T>> {
        let schema = self.schema::<T>()?;
        for constraint in schema.unique_constraints() {
            let mut criteria = Criteria::new();
            for name in &constraint.fields {
                let value = schema.field(name)?.get_value(record)?;
                criteria.add(Restriction::equals(name, value));
            }
            let stmt = self.record_statement(&schema, &criteria, false)?;
            let found =
                executor::execute_single_record_result_query(self.connection()?, &schema, &stmt, false)
                    .await?;
            if let Some(found) = found {
                log::debug!(
                    "Record of '{}' conflicts on unique constraint '{}'",
                    schema.name(),
                    constraint.name
                );
                return into_entity(found).map(Some);
            }
        }
        Ok(None)
    }

    /// Fill the list-only fields of `record` from the records its foreign keys reference
    pub async fn populate_list_only<T: Entity>(&mut self, record: &mut T) -> Result<()> {
        let schema = self.schema::<T>()?;
        let record: &mut DynEntity = record;

        let mut referenced: HashMap<String, (Arc<EntitySchema>, Box<DynEntity>)> = HashMap::new();
        for fk in schema.foreign_keys() {
            let fk_id = schema.field(&fk.field)?.get_value(&*record)?;
            if fk_id.is_null() {
                continue;
            }
            let target = fk.target.resolve(self.dialect.registry())?;
            let found = self.fetch_by_id(&target, &fk_id, None, true).await?;
            referenced.insert(fk.field.clone(), (target, found));
        }

        for field in schema.list_fields().iter().filter(|f| f.is_list_only()) {
            let Some(source) = field.list_only_source() else {
                continue;
            };
            if let Some((target, found)) = referenced.get(&source.foreign_key_field) {
                let value = target.list_field(&source.foreign_field)?.get_value(&**found)?;
                field.set_value(&mut *record, value)?;
            }
        }
        Ok(())
    }

    // Update

    /// Update a record by id and replace its children
    pub async fn update_by_id<T: Entity>(&mut self, record: &mut T) -> Result<u64> {
        let schema = self.schema::<T>()?;
        self.update_record(&schema, record, false, true).await
    }

    /// Update a record by id and version and replace its children
    ///
    /// The record's version is incremented; it is restored if the update fails.
    pub async fn update_by_id_version<T: Entity>(&mut self, record: &mut T) -> Result<u64> {
        let schema = self.schema::<T>()?;
        self.update_record(&schema, record, true, true).await
    }

    /// Update a record by id, leaving its children untouched
    pub async fn update_lean_by_id<T: Entity>(&mut self, record: &mut T) -> Result<u64> {
        let schema = self.schema::<T>()?;
        self.update_record(&schema, record, false, false).await
    }

    pub async fn update_lean_by_id_version<T: Entity>(&mut self, record: &mut T) -> Result<u64> {
        let schema = self.schema::<T>()?;
        self.update_record(&schema, record, true, false).await
    }

    async fn update_record(
        &mut self,
        schema: &EntitySchema,
        record: &mut DynEntity,
        check_version: bool,
        replace_children: bool,
    ) -> Result<u64> {
        if schema.is_view_only() {
            return Err(Error::view_only(schema.name(), "update"));
        }
        let policy = schema.policy().clone();
        let old_version = if check_version {
            schema.version_of(&*record)?
        } else {
            None
        };

        let result = async {
            let now = self.policy_now(&policy).await?;
            policy.pre_update(&mut EntityRecord::new(schema, &mut *record), now)?;

            let dialect = self.dialect.clone();
            let stmt = match (&old_version, schema.version_field()) {
                (Some(old), Some(version_field)) => {
                    let current = old.as_i64().ok_or_else(|| {
                        Error::conversion(format!(
                            "version of '{}' is not an integer: {}",
                            schema.name(),
                            old
                        ))
                    })?;
                    version_field.set_value(&mut *record, SqlValue::BigInt(current + 1))?;
                    dialect.prepare_update_by_id_version_statement(schema, &*record, old)?
                }
                _ => dialect.prepare_update_by_id_statement(schema, &*record)?,
            };

            let affected = executor::execute_update(self.connection()?, &stmt).await?;
            let id = schema.id_of(&*record)?;
            if affected == 0 {
                return Err(match &old_version {
                    Some(old) => Error::version_mismatch(schema.name(), &id, old),
                    None => Error::record_not_found(schema.name(), &id),
                });
            }

            if replace_children && schema.has_children() {
                self.delete_children(schema, &id).await?;
                self.create_children(schema, &mut *record, &id)
                    .await
                    .with_context(|| format!("replacing children of '{}'", schema.name()))?;
            }
            Ok::<_, Error>(affected)
        }
        .await;

        if let Err(e) = &result {
            if let (Some(old), Some(version_field)) = (&old_version, schema.version_field()) {
                if let Err(restore) = version_field.set_value(&mut *record, old.clone()) {
                    log::warn!(
                        "Could not restore version of '{}' after failed update: {}",
                        schema.name(),
                        restore
                    );
                }
            }
            policy.on_update_error(&EntityRecord::new(schema, &mut *record), e);
        }
        result
    }

    /// Apply field assignments to the record with the given id
    pub async fn update_by_id_with<T: Entity>(
        &mut self,
        id: impl Into<SqlValue>,
        update: &Update,
    ) -> Result<u64> {
        let schema = self.schema::<T>()?;
        let stmt = self
            .dialect
            .prepare_update_by_id_with_statement(&schema, &id.into(), update)?;
        executor::execute_update(self.connection()?, &stmt).await
    }

    /// Apply field assignments to every record matching a query
    ///
    /// Queries the table alone can answer run as one UPDATE; otherwise the
    /// matching ids are selected first and updated in chunks the dialect's
    /// IN clause accepts.
    pub async fn update_all<T: Entity>(&mut self, query: &Query<T>, update: &Update) -> Result<u64> {
        let schema = self.schema::<T>()?;
        if schema.is_view_only() {
            return Err(Error::view_only(schema.name(), "update"));
        }
        let criteria = self.pre_query(&schema, query.criteria().clone())?;
        let dialect = self.dialect.clone();

        if dialect.is_direct_update(&schema, &criteria) {
            let stmt = dialect.prepare_update_statement(&schema, &criteria, update)?;
            return executor::execute_update(self.connection()?, &stmt).await;
        }

        let ids = self.matching_ids(&schema, &criteria).await?;
        let mut affected = 0;
        for chunk in id_chunks(&ids, dialect.max_clause_values()) {
            let mut by_id = Criteria::new();
            by_id.add(Restriction::amongst(schema.id_field().name(), chunk.to_vec()));
            let stmt = dialect.prepare_update_statement(&schema, &by_id, update)?;
            affected += executor::execute_update(self.connection()?, &stmt).await?;
        }
        Ok(affected)
    }

    /// Entity-level ids of the records matching `criteria`
    async fn matching_ids(&mut self, schema: &EntitySchema, criteria: &Criteria) -> Result<Vec<SqlValue>> {
        let use_view = self.reads_view(schema, criteria);
        let stmt = self.dialect.prepare_ids_statement(schema, criteria, use_view)?;
        let stored =
            executor::execute_multiple_object_result_query(self.connection()?, &stmt).await?;
        let id_field = schema.id_field();
        stored
            .into_iter()
            .map(|id| id_field.from_stored(id))
            .collect()
    }

    // Delete

    /// Delete a record and its children by id
    ///
    /// The entity policy sees the record before anything is deleted.
    pub async fn delete_by_id<T: Entity>(&mut self, record: &mut T) -> Result<u64> {
        let schema = self.schema::<T>()?;
        let id = schema.id_of(&*record)?;
        self.delete_record(&schema, id, None, Some(record as &mut DynEntity))
            .await
    }

    /// Delete a record and its children by id and version
    pub async fn delete_by_id_version<T: Entity>(&mut self, record: &mut T) -> Result<u64> {
        let schema = self.schema::<T>()?;
        let id = schema.id_of(&*record)?;
        let version = schema.version_of(&*record)?;
        self.delete_record(&schema, id, version, Some(record as &mut DynEntity))
            .await
    }

    /// Delete the record of type `T` with the given id, and its children
    ///
    /// No record is loaded, so the entity policy is not consulted.
    pub async fn delete<T: Entity>(&mut self, id: impl Into<SqlValue>) -> Result<u64> {
        let schema = self.schema::<T>()?;
        self.delete_record(&schema, id.into(), None, None).await
    }

    async fn delete_record(
        &mut self,
        schema: &EntitySchema,
        id: SqlValue,
        version: Option<SqlValue>,
        mut record: Option<&mut DynEntity>,
    ) -> Result<u64> {
        if schema.is_view_only() {
            return Err(Error::view_only(schema.name(), "delete"));
        }
        let policy = schema.policy().clone();
        let result = async {
            if let Some(record) = record.as_deref_mut() {
                let now = self.policy_now(&policy).await?;
                policy.pre_delete(&mut EntityRecord::new(schema, record), now)?;
            }
            let stmt = match &version {
                Some(version) => self
                    .dialect
                    .prepare_delete_by_id_version_statement(schema, &id, version)?,
                None => self.dialect.prepare_delete_by_id_statement(schema, &id)?,
            };
            if schema.has_children() {
                self.delete_children(schema, &id).await?;
            }
            let affected = executor::execute_update(self.connection()?, &stmt).await?;
            if affected == 0 {
                return Err(match &version {
                    Some(version) => Error::version_mismatch(schema.name(), &id, version),
                    None => Error::record_not_found(schema.name(), &id),
                });
            }
            Ok::<_, Error>(affected)
        }
        .await;

        if let (Err(e), Some(record)) = (&result, record) {
            policy.on_delete_error(&EntityRecord::new(schema, record), e);
        }
        result
    }

    async fn delete_children(&mut self, schema: &EntitySchema, id: &SqlValue) -> Result<()> {
        for child in schema.on_delete_cascade() {
            let child_schema = child.child().resolve(self.dialect.registry())?;
            let mut criteria = Criteria::new();
            criteria.add(Restriction::equals(child.child_fk_field(), id.clone()));
            self.delete_all_records(&child_schema, criteria)
                .await
                .with_context(|| format!("deleting children of '{}'", schema.name()))?;
        }
        Ok(())
    }

    /// Delete every record matching a query, with their children
    pub async fn delete_all<T: Entity>(&mut self, query: &Query<T>) -> Result<u64> {
        let schema = self.schema::<T>()?;
        self.delete_all_records(&schema, query.criteria().clone())
            .await
    }

    fn delete_all_records<'a>(
        &'a mut self,
        schema: &'a EntitySchema,
        criteria: Criteria,
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            if schema.is_view_only() {
                return Err(Error::view_only(schema.name(), "delete"));
            }
            let criteria = self.pre_query(schema, criteria)?;
            let dialect = self.dialect.clone();

            if dialect.is_direct_delete(schema, &criteria) {
                let stmt = dialect.prepare_delete_statement(schema, &criteria)?;
                return executor::execute_update(self.connection()?, &stmt).await;
            }

            let ids = self.matching_ids(schema, &criteria).await?;
            let mut affected = 0;
            for chunk in id_chunks(&ids, dialect.max_clause_values()) {
                for child in schema.on_delete_cascade() {
                    let child_schema = child.child().resolve(dialect.registry())?;
                    let mut by_parent = Criteria::new();
                    by_parent.add(Restriction::amongst(child.child_fk_field(), chunk.to_vec()));
                    self.delete_all_records(&child_schema, by_parent)
                        .await
                        .with_context(|| format!("deleting children of '{}'", schema.name()))?;
                }
                let mut by_id = Criteria::new();
                by_id.add(Restriction::amongst(schema.id_field().name(), chunk.to_vec()));
                let stmt = dialect.prepare_delete_statement(schema, &by_id)?;
                affected += executor::execute_update(self.connection()?, &stmt).await?;
            }
            Ok(affected)
        })
    }

    // Values and aggregates

    /// Number of records matching a query
    ///
    /// The query's limit and offset have no effect on the count.
    pub async fn count<T: Entity>(&mut self, query: &Query<T>) -> Result<u64> {
        let schema = self.schema::<T>()?;
        let criteria = self.pre_query(&schema, query.criteria().clone())?;
        let use_view = self.reads_view(&schema, &criteria);
        let stmt = self
            .dialect
            .prepare_count_statement(&schema, &criteria, use_view)?;
        let count =
            executor::execute_single_object_result_query(self.connection()?, &stmt, true).await?;
        Ok(count.and_then(|c| c.as_i64()).unwrap_or(0).max(0) as u64)
    }

    async fn values_statement(
        &mut self,
        schema: &EntitySchema,
        fields: &[&str],
        criteria: Criteria,
    ) -> Result<(SqlStatement, Criteria)> {
        let criteria = self.pre_query(schema, criteria)?;
        let use_view =
            self.reads_view(schema, &criteria) || fields.iter().any(|f| !schema.is_field(f));
        let stmt = self
            .dialect
            .prepare_values_statement(schema, fields, &criteria, use_view)?;
        Ok((stmt, criteria))
    }

    /// Value of one field of the single record matching a query
    pub async fn value<V, T>(&mut self, field: &str, query: &Query<T>) -> Result<Option<V>>
    where
        V: FieldValue,
        T: Entity,
    {
        let schema = self.schema::<T>()?;
        let (stmt, criteria) = self
            .values_statement(&schema, &[field], query.criteria().clone())
            .await?;
        let value = executor::execute_single_object_result_query(
            self.connection()?,
            &stmt,
            criteria.is_must_match(),
        )
        .await?;
        optional(value)
    }

    /// Values of one field across the records matching a query
    pub async fn value_list<V, T>(&mut self, field: &str, query: &Query<T>) -> Result<Vec<V>>
    where
        V: FieldValue,
        T: Entity,
    {
        let schema = self.schema::<T>()?;
        let (stmt, _) = self
            .values_statement(&schema, &[field], query.criteria().clone())
            .await?;
        executor::execute_multiple_object_result_query(self.connection()?, &stmt)
            .await?
            .into_iter()
            .map(V::from_sql_value)
            .collect()
    }

    /// Distinct values of one field, in first-seen order
    pub async fn value_set<V, T>(&mut self, field: &str, query: &Query<T>) -> Result<IndexSet<V>>
    where
        V: FieldValue + Eq + Hash,
        T: Entity,
    {
        Ok(self.value_list(field, query).await?.into_iter().collect())
    }

    /// One field keyed by another; a repeated key is an error
    pub async fn value_map<K, V, T>(
        &mut self,
        key_field: &str,
        value_field: &str,
        query: &Query<T>,
    ) -> Result<IndexMap<K, V>>
    where
        K: FieldValue + Eq + Hash,
        V: FieldValue,
        T: Entity,
    {
        let schema = self.schema::<T>()?;
        let (stmt, _) = self
            .values_statement(&schema, &[key_field, value_field], query.criteria().clone())
            .await?;
        executor::execute_multiple_object_map_query::<K>(self.connection()?, key_field, &stmt)
            .await?
            .into_iter()
            .map(|(key, value)| Ok((key, V::from_sql_value(value)?)))
            .collect()
    }

    /// Values of one field grouped by another
    pub async fn value_list_map<K, V, T>(
        &mut self,
        key_field: &str,
        value_field: &str,
        query: &Query<T>,
    ) -> Result<IndexMap<K, Vec<V>>>
    where
        K: FieldValue + Eq + Hash,
        V: FieldValue,
        T: Entity,
    {
        let schema = self.schema::<T>()?;
        let (stmt, _) = self
            .values_statement(&schema, &[key_field, value_field], query.criteria().clone())
            .await?;
        executor::execute_multiple_object_list_map_query::<K>(self.connection()?, &stmt)
            .await?
            .into_iter()
            .map(|(key, values)| {
                let values = values
                    .into_iter()
                    .map(V::from_sql_value)
                    .collect::<Result<Vec<_>>>()?;
                Ok((key, values))
            })
            .collect()
    }

    /// Smallest value of a field over the matching records
    pub async fn min<V, T>(&mut self, field: &str, query: &Query<T>) -> Result<Option<V>>
    where
        V: FieldValue,
        T: Entity,
    {
        self.extreme(false, field, query).await
    }

    /// Largest value of a field over the matching records
    pub async fn max<V, T>(&mut self, field: &str, query: &Query<T>) -> Result<Option<V>>
    where
        V: FieldValue,
        T: Entity,
    {
        self.extreme(true, field, query).await
    }

    async fn extreme<V, T>(&mut self, maximum: bool, field: &str, query: &Query<T>) -> Result<Option<V>>
    where
        V: FieldValue,
        T: Entity,
    {
        let schema = self.schema::<T>()?;
        let criteria = self.pre_query(&schema, query.criteria().clone())?;
        let use_view = self.reads_view(&schema, &criteria) || !schema.is_field(field);
        let stmt = if maximum {
            self.dialect
                .prepare_max_statement(&schema, field, &criteria, use_view)?
        } else {
            self.dialect
                .prepare_min_statement(&schema, field, &criteria, use_view)?
        };
        let value =
            executor::execute_single_object_result_query(self.connection()?, &stmt, false).await?;
        optional(value)
    }

    /// Aggregate statement for a query, or `None` when no record can match
    ///
    /// Queries that need the view select the matching ids first and
    /// aggregate the table rows with those ids. Pagination is dropped on both
    /// paths.
    async fn aggregate_statement(
        &mut self,
        schema: &EntitySchema,
        functions: &[AggregateFunction],
        criteria: Criteria,
    ) -> Result<Option<(SqlStatement, usize)>> {
        let mut criteria = self.pre_query(schema, criteria)?;
        criteria.set_offset(0).set_limit(0);
        let group_count = criteria.group_by().len();
        if !self.reads_view(schema, &criteria) {
            let stmt = self
                .dialect
                .prepare_aggregate_statement(schema, functions, &criteria, false)?;
            return Ok(Some((stmt, group_count)));
        }

        let ids = self.matching_ids(schema, &criteria).await?;
        if ids.is_empty() {
            return Ok(None);
        }
        let mut by_id = Criteria::new();
        by_id.add(Restriction::amongst(schema.id_field().name(), ids));
        for field in criteria.group_by() {
            by_id.add_group_by(field.clone());
        }
        let use_view = self.reads_view(schema, &by_id);
        let stmt = self
            .dialect
            .prepare_aggregate_statement(schema, functions, &by_id, use_view)?;
        Ok(Some((stmt, group_count)))
    }

    /// Run one aggregate function over the records matching a query
    ///
    /// Every matching record is aggregated; limit and offset are ignored.
    pub async fn aggregate<T: Entity>(
        &mut self,
        function: AggregateFunction,
        query: &Query<T>,
    ) -> Result<Option<Aggregation>> {
        let mut aggregations = self.aggregate_many(&[function], query).await?;
        Ok(aggregations.pop())
    }

    /// Run several aggregate functions over the records matching a query
    ///
    /// Limit and offset are ignored, as in [`DatabaseSession::aggregate`].
    pub async fn aggregate_many<T: Entity>(
        &mut self,
        functions: &[AggregateFunction],
        query: &Query<T>,
    ) -> Result<Vec<Aggregation>> {
        let schema = self.schema::<T>()?;
        match self
            .aggregate_statement(&schema, functions, query.criteria().clone())
            .await?
        {
            Some((stmt, _)) => {
                executor::execute_aggregate_query(self.connection()?, functions, &stmt).await
            }
            None => Ok(Vec::new()),
        }
    }

    /// Aggregate functions per group of the query's group-by fields
    ///
    /// Limit and offset are ignored.
    pub async fn aggregate_group_many<T: Entity>(
        &mut self,
        functions: &[AggregateFunction],
        query: &Query<T>,
    ) -> Result<Vec<GroupAggregation>> {
        let schema = self.schema::<T>()?;
        match self
            .aggregate_statement(&schema, functions, query.criteria().clone())
            .await?
        {
            Some((stmt, group_count)) => {
                executor::execute_group_aggregate_query(
                    self.connection()?,
                    functions,
                    group_count,
                    &stmt,
                )
                .await
            }
            None => Ok(Vec::new()),
        }
    }

    /// Current UTC time according to the database
    pub async fn now(&mut self) -> Result<NaiveDateTime> {
        let dialect = self.dialect.clone();
        let mut stmt = SqlStatement::new("now");
        stmt.sql_mut()
            .push_str(&dialect.generate_utc_timestamp_sql());
        stmt.push_result(None, dialect.sql_type_policy(ColumnType::TimestampUtc)?);
        let value =
            executor::execute_single_object_result_query(self.connection()?, &stmt, true).await?;
        NaiveDateTime::from_sql_value(value.unwrap_or(SqlValue::Null))
    }

    // Stored routines

    /// Call a stored procedure or function, filling in OUT values and the return value
    pub async fn execute_callable(&mut self, proc: &mut CallableProc) -> Result<()> {
        self.execute_callable_with_results(proc).await.map(|_| ())
    }

    /// Call a stored routine and collect its declared result sets
    pub async fn execute_callable_with_results(
        &mut self,
        proc: &mut CallableProc,
    ) -> Result<Vec<CallableResult>> {
        let dialect = self.dialect.clone();
        let stmt = dialect.prepare_callable_statement(proc)?;
        executor::execute_callable(self.connection()?, dialect.as_ref(), proc, &stmt).await
    }

    // Schema management

    /// Create the table (and view, if the entity has one) of `T`
    pub async fn create_schema<T: Entity>(&mut self) -> Result<()> {
        let schema = self.schema::<T>()?;
        let dialect = self.dialect.clone();
        let mut statements = if schema.is_view_only() {
            Vec::new()
        } else {
            dialect.create_table_sql(&schema)?
        };
        statements.extend(dialect.create_view_sql(&schema)?);
        self.run_ddl(schema.name(), statements).await
    }

    /// Drop the view and table of `T`
    pub async fn drop_schema<T: Entity>(&mut self) -> Result<()> {
        let schema = self.schema::<T>()?;
        let dialect = self.dialect.clone();
        let mut statements: Vec<String> = dialect.drop_view_sql(&schema)?.into_iter().collect();
        if !schema.is_view_only() {
            statements.push(dialect.drop_table_sql(&schema)?);
        }
        self.run_ddl(schema.name(), statements).await
    }

    async fn run_ddl(&mut self, entity: &str, statements: Vec<String>) -> Result<()> {
        for sql in statements {
            log::debug!("Running DDL for '{}': {}", entity, sql);
            self.connection()?
                .execute_raw(&sql)
                .await
                .with_context(|| format!("running DDL for '{}'", entity))?;
        }
        Ok(())
    }

    // Transactions

    /// Push a savepoint
    pub async fn set_savepoint(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.savepoint_counter += 1;
        let name = format!("sp_{}", self.savepoint_counter);
        let sql = self.dialect.savepoint_sql(&name);
        self.connection()?.execute_raw(&sql).await?;
        self.savepoints.push(name);
        Ok(())
    }

    /// Roll back to the most recent savepoint, which stays on the stack
    pub async fn rollback_to_savepoint(&mut self) -> Result<()> {
        self.ensure_open()?;
        if let Some(name) = self.savepoints.last() {
            let sql = self.dialect.rollback_to_savepoint_sql(name);
            self.connection()?.execute_raw(&sql).await?;
        }
        Ok(())
    }

    /// Release and pop the most recent savepoint
    pub async fn clear_savepoint(&mut self) -> Result<()> {
        self.ensure_open()?;
        if let Some(name) = self.savepoints.pop() {
            let sql = self.dialect.release_savepoint_sql(&name);
            self.connection()?.execute_raw(&sql).await?;
        }
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.end_transaction(true).await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.end_transaction(false).await
    }

    async fn end_transaction(&mut self, commit: bool) -> Result<()> {
        self.ensure_open()?;
        let dialect = self.dialect.clone();
        let end = if commit {
            dialect.commit_sql()
        } else {
            dialect.rollback_sql()
        };
        let connection = self.connection()?;
        connection.execute_raw(&end).await?;
        connection
            .execute_raw(&dialect.begin_transaction_sql())
            .await?;
        self.savepoints.clear();
        Ok(())
    }

    /// Roll back uncommitted work and return the connection to the pool
    ///
    /// Closing an already closed session does nothing.
    pub async fn close(&mut self) -> Result<()> {
        let connection = match std::mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Open(connection) => connection,
            SessionState::Closed => return Ok(()),
        };
        self.savepoints.clear();
        self.data_source.restore_connection(connection).await;
        log::debug!("Closed session on data source '{}'", self.data_source.name());
        Ok(())
    }
}

impl Drop for DatabaseSession {
    fn drop(&mut self) {
        if let SessionState::Open(connection) = &mut self.state {
            log::warn!(
                "Session on data source '{}' dropped without close; discarding its connection",
                self.data_source.name()
            );
            connection.close_on_drop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_chunks_respect_clause_limit() {
        let ids: Vec<SqlValue> = (0..7).map(SqlValue::BigInt).collect();
        let sizes: Vec<usize> = id_chunks(&ids, 3).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);

        let unbounded: Vec<usize> = id_chunks(&ids, 0).map(|c| c.len()).collect();
        assert_eq!(unbounded, vec![7]);

        assert_eq!(id_chunks(&[], 0).count(), 0);
    }

    #[test]
    fn test_optional_treats_null_as_none() {
        assert_eq!(optional::<i64>(None).unwrap(), None);
        assert_eq!(optional::<i64>(Some(SqlValue::Null)).unwrap(), None);
        assert_eq!(optional::<i64>(Some(SqlValue::Int(4))).unwrap(), Some(4));
    }
}
