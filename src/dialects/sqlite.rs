//! SQLite dialect
//!
//! SQLite stores values by storage class rather than declared type. Decimals
//! are bound as canonical text into NUMERIC columns, so the engine stores and
//! compares them as numbers. Structural
//! alterations beyond adding, renaming and dropping columns are not
//! available and are reported as unsupported.

use super::ddl;
use super::{DatabaseBackend, DialectCore, PlaceholderStyle, SqlDialect};
use crate::database::types::{
    ColumnType, DecimalPolicy, PlainTypePolicy, SizedStringPolicy, SqlDataTypePolicy,
    TypePolicyMap,
};
use crate::error::{Error, Result};
use crate::schema::{
    EntitySchema, FieldSchema, ForeignKeySchema, NamingRules, UniqueConstraintSchema,
};
use std::sync::Arc;

/// Default SQLITE_MAX_VARIABLE_NUMBER of older builds
const MAX_CLAUSE_VALUES: usize = 999;

pub struct SqliteDialect {
    core: DialectCore,
}

fn type_policies() -> TypePolicyMap {
    let policies: Vec<Arc<dyn SqlDataTypePolicy>> = vec![
        Arc::new(PlainTypePolicy::new(ColumnType::Boolean, "BOOLEAN")),
        Arc::new(PlainTypePolicy::new(ColumnType::Short, "SMALLINT")),
        Arc::new(PlainTypePolicy::new(ColumnType::Integer, "INTEGER")),
        Arc::new(PlainTypePolicy::new(ColumnType::Long, "BIGINT")),
        Arc::new(PlainTypePolicy::new(ColumnType::Float, "REAL")),
        Arc::new(PlainTypePolicy::new(ColumnType::Double, "DOUBLE")),
        Arc::new(DecimalPolicy::as_text("NUMERIC")),
        Arc::new(SizedStringPolicy::new(ColumnType::String, "VARCHAR")),
        Arc::new(SizedStringPolicy::new(ColumnType::Char, "CHAR")),
        Arc::new(PlainTypePolicy::new(ColumnType::Text, "TEXT")),
        Arc::new(PlainTypePolicy::new(ColumnType::Blob, "BLOB")),
        Arc::new(PlainTypePolicy::new(ColumnType::Date, "DATE")),
        Arc::new(PlainTypePolicy::new(ColumnType::Time, "TIME")),
        Arc::new(PlainTypePolicy::new(ColumnType::Timestamp, "TIMESTAMP")),
        Arc::new(PlainTypePolicy::new(ColumnType::TimestampUtc, "TIMESTAMP")),
    ];
    policies
        .into_iter()
        .map(|policy| (policy.column_type(), policy))
        .collect()
}

impl SqliteDialect {
    pub fn new(rules: NamingRules) -> Self {
        Self {
            core: DialectCore::new(
                DatabaseBackend::SQLite,
                rules,
                type_policies(),
                MAX_CLAUSE_VALUES,
                '"',
                PlaceholderStyle::Anonymous,
            ),
        }
    }
}

impl Default for SqliteDialect {
    fn default() -> Self {
        Self::new(NamingRules::new(true, None))
    }
}

impl SqlDialect for SqliteDialect {
    fn core(&self) -> &DialectCore {
        &self.core
    }

    fn append_pagination(&self, sql: &mut String, offset: u64, limit: u64) {
        match (limit, offset) {
            (0, 0) => {}
            (0, offset) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            (limit, 0) => sql.push_str(&format!(" LIMIT {}", limit)),
            (limit, offset) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset)),
        }
    }

    fn generate_utc_timestamp_sql(&self) -> String {
        "SELECT STRFTIME('%Y-%m-%d %H:%M:%f', 'now')".to_string()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn inline_foreign_keys(&self) -> bool {
        true
    }

    fn alter_column_sql(&self, _schema: &EntitySchema, _field: &FieldSchema) -> Result<Vec<String>> {
        Err(Error::unsupported(self.name(), "altering columns"))
    }

    fn alter_column_to_null_sql(&self, _schema: &EntitySchema, _field: &FieldSchema) -> Result<String> {
        Err(Error::unsupported(self.name(), "altering column nullability"))
    }

    /// Unique constraints are backed by unique indexes
    fn add_unique_constraint_sql(
        &self,
        schema: &EntitySchema,
        constraint: &UniqueConstraintSchema,
    ) -> Result<String> {
        Ok(format!(
            "CREATE UNIQUE INDEX {} ON {} ({})",
            self.quote_identifier(&ddl::object_name(self, schema, &constraint.name)),
            self.quote_identifier(schema.schema_table()),
            ddl::column_list(self, schema, &constraint.fields)?
        ))
    }

    fn drop_unique_constraint_sql(
        &self,
        schema: &EntitySchema,
        constraint: &UniqueConstraintSchema,
    ) -> Result<String> {
        Ok(format!(
            "DROP INDEX {}",
            self.quote_identifier(&ddl::object_name(self, schema, &constraint.name))
        ))
    }

    fn add_foreign_key_sql(&self, _schema: &EntitySchema, _fk: &ForeignKeySchema) -> Result<String> {
        Err(Error::unsupported(self.name(), "adding foreign keys to existing tables"))
    }

    fn drop_foreign_key_sql(&self, _schema: &EntitySchema, _fk: &ForeignKeySchema) -> Result<String> {
        Err(Error::unsupported(self.name(), "dropping foreign keys"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callable::CallableProc;

    #[test]
    fn test_offset_without_limit() {
        let d = SqliteDialect::default();
        let mut sql = String::new();
        d.append_pagination(&mut sql, 10, 0);
        assert_eq!(sql, " LIMIT -1 OFFSET 10");
    }

    #[test]
    fn test_decimal_declared_numeric() {
        let d = SqliteDialect::default();
        let policy = d.sql_type_policy(ColumnType::Decimal).unwrap();
        let mut sql = String::new();
        policy.append_type_sql(&mut sql, 0, 18, 2);
        assert_eq!(sql, "NUMERIC");
    }

    #[test]
    fn test_callables_are_unsupported() {
        let d = SqliteDialect::default();
        let err = d
            .prepare_callable_statement(&CallableProc::procedure("p"))
            .unwrap_err();
        assert_eq!(err.error_code(), "UNSUPPORTED_FEATURE");
    }
}
