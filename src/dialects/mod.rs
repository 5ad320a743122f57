//! Database dialect implementations
//!
//! A dialect owns everything product-specific: identifier quoting,
//! placeholder style, pagination, the type policy map, the restriction
//! policies and DDL spelling. The portable statement builder and DDL
//! generator are provided methods on [`SqlDialect`], so each product only
//! overrides what it spells differently.

pub mod ddl;
pub mod mysql;
pub mod postgres;
pub mod sqlite;
pub mod statement;
pub mod translate;

mod builder;

pub use mysql::MySqlDialect;
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;
pub use statement::{
    BindValue, OutParameterSource, SqlCallableStatement, SqlParameter, SqlResult, SqlStatement,
};
pub use translate::{CriteriaPolicy, CriteriaPolicyMap, TranslationContext};

use crate::callable::CallableProc;
use crate::criteria::{AggregateFunction, Criteria, RestrictionType, Update};
use crate::database::types::{ColumnType, SqlDataTypePolicy, SqlValue, TypePolicyMap};
use crate::error::{Error, Result};
use crate::schema::{
    DynEntity, EntityRegistry, EntitySchema, FieldSchema, ForeignKeySchema, IndexSchema,
    NamingRules, UniqueConstraintSchema,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Database products supported by the sqlx stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    #[serde(alias = "mariadb")]
    MySQL,
    #[serde(alias = "postgresql")]
    Postgres,
    SQLite,
}

impl DatabaseBackend {
    /// Detect the backend from a connection URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        let scheme = url.split(':').next().unwrap_or_default().to_ascii_lowercase();
        match scheme.as_str() {
            "mysql" | "mariadb" => Ok(DatabaseBackend::MySQL),
            "postgres" | "postgresql" => Ok(DatabaseBackend::Postgres),
            "sqlite" => Ok(DatabaseBackend::SQLite),
            _ => Err(Error::invalid_configuration(format!(
                "unsupported database URL scheme '{}'",
                scheme
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DatabaseBackend::MySQL => "MySQL",
            DatabaseBackend::Postgres => "PostgreSQL",
            DatabaseBackend::SQLite => "SQLite",
        }
    }
}

impl fmt::Display for DatabaseBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?`
    Anonymous,
    /// `$1`, `$2`, ...
    Numbered,
}

/// State every dialect carries: naming, policies and product limits
pub struct DialectCore {
    backend: DatabaseBackend,
    registry: EntityRegistry,
    type_policies: TypePolicyMap,
    criteria_policies: CriteriaPolicyMap,
    max_clause_values: usize,
    quote: char,
    placeholders: PlaceholderStyle,
}

impl DialectCore {
    pub fn new(
        backend: DatabaseBackend,
        rules: NamingRules,
        type_policies: TypePolicyMap,
        max_clause_values: usize,
        quote: char,
        placeholders: PlaceholderStyle,
    ) -> Self {
        Self {
            backend,
            registry: EntityRegistry::new(rules),
            type_policies,
            criteria_policies: translate::default_criteria_policies(),
            max_clause_values,
            quote,
            placeholders,
        }
    }

    /// Replace the policy used for one restriction type
    pub fn set_criteria_policy(&mut self, kind: RestrictionType, policy: Arc<dyn CriteriaPolicy>) {
        self.criteria_policies.insert(kind, policy);
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Upper bound for values in one IN clause; 0 means unbounded
    pub fn max_clause_values(&self) -> usize {
        self.max_clause_values
    }

    /// Quote an identifier; schema-qualified names are quoted part by part
    pub fn quote_identifier(&self, identifier: &str) -> String {
        let quote = self.quote.to_string();
        let escaped = format!("{}{}", self.quote, self.quote);
        identifier
            .split('.')
            .map(|part| format!("{}{}{}", self.quote, part.replace(&quote, &escaped), self.quote))
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn placeholder(&self, position: usize) -> String {
        match self.placeholders {
            PlaceholderStyle::Anonymous => "?".to_string(),
            PlaceholderStyle::Numbered => format!("${}", position),
        }
    }

    pub fn sql_type_policy(&self, column_type: ColumnType) -> Result<Arc<dyn SqlDataTypePolicy>> {
        self.type_policies.get(&column_type).cloned().ok_or_else(|| {
            Error::unsupported(self.backend.name(), format!("column type {}", column_type))
        })
    }

    pub fn criteria_policy(&self, kind: RestrictionType) -> Result<Arc<dyn CriteriaPolicy>> {
        self.criteria_policies.get(&kind).cloned().ok_or_else(|| {
            Error::unsupported(self.backend.name(), format!("{:?} restrictions", kind))
        })
    }
}

/// Product-specific SQL generation
pub trait SqlDialect: Send + Sync {
    fn core(&self) -> &DialectCore;

    /// Append the LIMIT/OFFSET clause; `limit == 0` means no limit
    fn append_pagination(&self, sql: &mut String, offset: u64, limit: u64);

    /// Query returning the current UTC time as a timestamp
    fn generate_utc_timestamp_sql(&self) -> String;

    /// Support for downcasting to specific dialect implementations
    fn as_any(&self) -> &dyn std::any::Any;

    fn backend(&self) -> DatabaseBackend {
        self.core().backend()
    }

    fn name(&self) -> &'static str {
        self.backend().name()
    }

    /// Schemas named with this dialect's case rules
    fn registry(&self) -> &EntityRegistry {
        self.core().registry()
    }

    fn quote_identifier(&self, identifier: &str) -> String {
        self.core().quote_identifier(identifier)
    }

    fn placeholder(&self, position: usize) -> String {
        self.core().placeholder(position)
    }

    fn sql_type_policy(&self, column_type: ColumnType) -> Result<Arc<dyn SqlDataTypePolicy>> {
        self.core().sql_type_policy(column_type)
    }

    fn max_clause_values(&self) -> usize {
        self.core().max_clause_values()
    }

    fn generate_test_sql(&self) -> String {
        "SELECT 1".to_string()
    }

    /// Whether UPDATE and DELETE accept a LIMIT clause
    fn supports_update_limit(&self) -> bool {
        false
    }

    /// Whether foreign keys are declared inside CREATE TABLE
    fn inline_foreign_keys(&self) -> bool {
        false
    }

    fn begin_transaction_sql(&self) -> String {
        "BEGIN".to_string()
    }

    fn commit_sql(&self) -> String {
        "COMMIT".to_string()
    }

    fn rollback_sql(&self) -> String {
        "ROLLBACK".to_string()
    }

    fn savepoint_sql(&self, name: &str) -> String {
        format!("SAVEPOINT {}", name)
    }

    fn rollback_to_savepoint_sql(&self, name: &str) -> String {
        format!("ROLLBACK TO SAVEPOINT {}", name)
    }

    fn release_savepoint_sql(&self, name: &str) -> String {
        format!("RELEASE SAVEPOINT {}", name)
    }

    fn is_query_offset_or_limit(&self, criteria: &Criteria) -> bool {
        criteria.is_paginated()
    }

    /// Whether reads for `criteria` must go through the view
    fn requires_view(&self, schema: &EntitySchema, criteria: &Criteria) -> bool {
        !schema.test_true_field_names_only(&criteria.referenced_fields())
            || criteria.select().iter().any(|f| !schema.is_field(f))
    }

    /// Whether a bulk update can run as a single statement
    ///
    /// Otherwise the matching ids are selected first and updated by id.
    fn is_direct_update(&self, schema: &EntitySchema, criteria: &Criteria) -> bool {
        let pagination_ok = !self.is_query_offset_or_limit(criteria)
            || (self.supports_update_limit() && criteria.offset() == 0);
        pagination_ok && schema.test_true_field_names_only(&criteria.referenced_fields())
    }

    /// Whether a bulk delete can run as a single statement
    fn is_direct_delete(&self, schema: &EntitySchema, criteria: &Criteria) -> bool {
        self.is_direct_update(schema, criteria) && !schema.has_children()
    }

    // Statements

    fn prepare_find_statement(
        &self,
        schema: &EntitySchema,
        criteria: &Criteria,
        use_view: bool,
    ) -> Result<SqlStatement> {
        builder::find(self, schema, criteria, use_view)
    }

    /// Persisted and list-only fields, read from the view
    fn prepare_list_statement(
        &self,
        schema: &EntitySchema,
        criteria: &Criteria,
    ) -> Result<SqlStatement> {
        builder::find(self, schema, criteria, true)
    }

    fn prepare_find_by_id_statement(
        &self,
        schema: &EntitySchema,
        id: &SqlValue,
    ) -> Result<SqlStatement> {
        builder::find_by_id(self, schema, id, None, false)
    }

    fn prepare_find_by_id_version_statement(
        &self,
        schema: &EntitySchema,
        id: &SqlValue,
        version: &SqlValue,
    ) -> Result<SqlStatement> {
        builder::find_by_id(self, schema, id, Some(version), false)
    }

    fn prepare_list_by_id_statement(
        &self,
        schema: &EntitySchema,
        id: &SqlValue,
    ) -> Result<SqlStatement> {
        builder::find_by_id(self, schema, id, None, true)
    }

    fn prepare_list_by_id_version_statement(
        &self,
        schema: &EntitySchema,
        id: &SqlValue,
        version: &SqlValue,
    ) -> Result<SqlStatement> {
        builder::find_by_id(self, schema, id, Some(version), true)
    }

    fn prepare_create_statement(
        &self,
        schema: &EntitySchema,
        record: &DynEntity,
    ) -> Result<SqlStatement> {
        builder::create(self, schema, record)
    }

    fn prepare_update_by_id_statement(
        &self,
        schema: &EntitySchema,
        record: &DynEntity,
    ) -> Result<SqlStatement> {
        builder::update_by_id(self, schema, record, None)
    }

    /// Update predicated on the version the record was read with
    fn prepare_update_by_id_version_statement(
        &self,
        schema: &EntitySchema,
        record: &DynEntity,
        expected_version: &SqlValue,
    ) -> Result<SqlStatement> {
        builder::update_by_id(self, schema, record, Some(expected_version))
    }

    fn prepare_update_statement(
        &self,
        schema: &EntitySchema,
        criteria: &Criteria,
        update: &Update,
    ) -> Result<SqlStatement> {
        builder::update(self, schema, criteria, update)
    }

    fn prepare_update_by_id_with_statement(
        &self,
        schema: &EntitySchema,
        id: &SqlValue,
        update: &Update,
    ) -> Result<SqlStatement> {
        builder::update_by_id_with(self, schema, id, update)
    }

    fn prepare_delete_by_id_statement(
        &self,
        schema: &EntitySchema,
        id: &SqlValue,
    ) -> Result<SqlStatement> {
        builder::delete_by_id(self, schema, id, None)
    }

    fn prepare_delete_by_id_version_statement(
        &self,
        schema: &EntitySchema,
        id: &SqlValue,
        version: &SqlValue,
    ) -> Result<SqlStatement> {
        builder::delete_by_id(self, schema, id, Some(version))
    }

    fn prepare_delete_statement(
        &self,
        schema: &EntitySchema,
        criteria: &Criteria,
    ) -> Result<SqlStatement> {
        builder::delete(self, schema, criteria)
    }

    /// Select the ids matching `criteria`, honoring order and pagination
    fn prepare_ids_statement(
        &self,
        schema: &EntitySchema,
        criteria: &Criteria,
        use_view: bool,
    ) -> Result<SqlStatement> {
        builder::ids(self, schema, criteria, use_view)
    }

    /// Select the given fields of the matching rows
    fn prepare_values_statement(
        &self,
        schema: &EntitySchema,
        fields: &[&str],
        criteria: &Criteria,
        use_view: bool,
    ) -> Result<SqlStatement> {
        builder::values(self, schema, fields, criteria, use_view)
    }

    fn prepare_count_statement(
        &self,
        schema: &EntitySchema,
        criteria: &Criteria,
        use_view: bool,
    ) -> Result<SqlStatement> {
        builder::count(self, schema, criteria, use_view)
    }

    fn prepare_min_statement(
        &self,
        schema: &EntitySchema,
        field: &str,
        criteria: &Criteria,
        use_view: bool,
    ) -> Result<SqlStatement> {
        builder::extreme(self, schema, "MIN", field, criteria, use_view)
    }

    fn prepare_max_statement(
        &self,
        schema: &EntitySchema,
        field: &str,
        criteria: &Criteria,
        use_view: bool,
    ) -> Result<SqlStatement> {
        builder::extreme(self, schema, "MAX", field, criteria, use_view)
    }

    /// `COUNT(*)` followed by one column per function, grouped by the
    /// criteria's group-by fields when there are any
    fn prepare_aggregate_statement(
        &self,
        schema: &EntitySchema,
        functions: &[AggregateFunction],
        criteria: &Criteria,
        use_view: bool,
    ) -> Result<SqlStatement> {
        builder::aggregate(self, schema, functions, criteria, use_view)
    }

    fn prepare_callable_statement(&self, _proc: &CallableProc) -> Result<SqlCallableStatement> {
        Err(Error::unsupported(self.name(), "stored procedures"))
    }

    // DDL

    fn column_definition_sql(&self, field: &FieldSchema) -> Result<String> {
        ddl::column_definition(self, field)
    }

    /// CREATE TABLE followed by its constraints and indexes
    fn create_table_sql(&self, schema: &EntitySchema) -> Result<Vec<String>> {
        ddl::create_table(self, schema)
    }

    /// CREATE VIEW for entities read through a view
    fn create_view_sql(&self, schema: &EntitySchema) -> Result<Option<String>> {
        ddl::create_view(self, schema)
    }

    fn drop_table_sql(&self, schema: &EntitySchema) -> Result<String> {
        Ok(format!(
            "DROP TABLE {}",
            self.quote_identifier(schema.schema_table())
        ))
    }

    fn drop_view_sql(&self, schema: &EntitySchema) -> Result<Option<String>> {
        Ok(schema
            .is_viewable()
            .then(|| format!("DROP VIEW {}", self.quote_identifier(schema.schema_view()))))
    }

    fn add_column_sql(&self, schema: &EntitySchema, field: &FieldSchema) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.quote_identifier(schema.schema_table()),
            self.column_definition_sql(field)?
        ))
    }

    /// Change a column's type, nullability and default to match `field`
    fn alter_column_sql(&self, schema: &EntitySchema, field: &FieldSchema) -> Result<Vec<String>> {
        ddl::alter_column(self, schema, field)
    }

    fn rename_column_sql(
        &self,
        schema: &EntitySchema,
        old_column: &str,
        field: &FieldSchema,
    ) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            self.quote_identifier(schema.schema_table()),
            self.quote_identifier(old_column),
            self.quote_identifier(field.preferred_column())
        ))
    }

    fn drop_column_sql(&self, schema: &EntitySchema, column: &str) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.quote_identifier(schema.schema_table()),
            self.quote_identifier(column)
        ))
    }

    fn alter_column_to_null_sql(&self, schema: &EntitySchema, field: &FieldSchema) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL",
            self.quote_identifier(schema.schema_table()),
            self.quote_identifier(field.preferred_column())
        ))
    }

    fn add_unique_constraint_sql(
        &self,
        schema: &EntitySchema,
        constraint: &UniqueConstraintSchema,
    ) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
            self.quote_identifier(schema.schema_table()),
            self.quote_identifier(&ddl::object_name(self, schema, &constraint.name)),
            ddl::column_list(self, schema, &constraint.fields)?
        ))
    }

    fn drop_unique_constraint_sql(
        &self,
        schema: &EntitySchema,
        constraint: &UniqueConstraintSchema,
    ) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            self.quote_identifier(schema.schema_table()),
            self.quote_identifier(&ddl::object_name(self, schema, &constraint.name))
        ))
    }

    fn create_index_sql(&self, schema: &EntitySchema, index: &IndexSchema) -> Result<String> {
        Ok(format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.quote_identifier(&ddl::object_name(self, schema, &index.name)),
            self.quote_identifier(schema.schema_table()),
            ddl::column_list(self, schema, &index.fields)?
        ))
    }

    fn drop_index_sql(&self, schema: &EntitySchema, index: &IndexSchema) -> Result<String> {
        Ok(format!(
            "DROP INDEX {}",
            self.quote_identifier(&ddl::object_name(self, schema, &index.name))
        ))
    }

    fn add_foreign_key_sql(&self, schema: &EntitySchema, fk: &ForeignKeySchema) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {}",
            self.quote_identifier(schema.schema_table()),
            self.quote_identifier(&self.registry().rules().preferred(&fk.name)),
            ddl::foreign_key_clause(self, schema, fk)?
        ))
    }

    fn drop_foreign_key_sql(&self, schema: &EntitySchema, fk: &ForeignKeySchema) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            self.quote_identifier(schema.schema_table()),
            self.quote_identifier(&self.registry().rules().preferred(&fk.name))
        ))
    }
}

/// Build the dialect for a backend
pub fn create_dialect(backend: DatabaseBackend, rules: NamingRules) -> Arc<dyn SqlDialect> {
    match backend {
        DatabaseBackend::MySQL => Arc::new(MySqlDialect::new(rules)),
        DatabaseBackend::Postgres => Arc::new(PostgresDialect::new(rules)),
        DatabaseBackend::SQLite => Arc::new(SqliteDialect::new(rules)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_url() {
        assert_eq!(
            DatabaseBackend::from_url("postgres://localhost/db").unwrap(),
            DatabaseBackend::Postgres
        );
        assert_eq!(
            DatabaseBackend::from_url("mariadb://localhost/db").unwrap(),
            DatabaseBackend::MySQL
        );
        assert_eq!(
            DatabaseBackend::from_url("sqlite::memory:").unwrap(),
            DatabaseBackend::SQLite
        );
        assert!(DatabaseBackend::from_url("oracle://x").is_err());
    }

    #[test]
    fn test_quote_identifier_per_part() {
        let dialect = create_dialect(DatabaseBackend::MySQL, NamingRules::default());
        assert_eq!(dialect.quote_identifier("sales.customer"), "`sales`.`customer`");
        assert_eq!(dialect.quote_identifier("we`ird"), "`we``ird`");

        let pg = create_dialect(DatabaseBackend::Postgres, NamingRules::default());
        assert_eq!(pg.quote_identifier("customer"), "\"customer\"");
        assert_eq!(pg.placeholder(3), "$3");
    }

    #[test]
    fn test_max_clause_values_per_backend() {
        let rules = NamingRules::default();
        assert_eq!(create_dialect(DatabaseBackend::MySQL, rules.clone()).max_clause_values(), 0);
        assert_eq!(create_dialect(DatabaseBackend::SQLite, rules.clone()).max_clause_values(), 999);
        assert_eq!(create_dialect(DatabaseBackend::Postgres, rules).max_clause_values(), 32767);
    }
}
