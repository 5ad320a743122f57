//! MySQL/MariaDB dialect
//!
//! Backtick quoting, anonymous placeholders and no limit on IN clause size.
//! MySQL is the only supported product that accepts LIMIT on UPDATE and
//! DELETE, and it spells most column alterations with `MODIFY`/`CHANGE`.

use super::ddl;
use super::statement::{OutParameterSource, SqlCallableStatement, SqlStatement};
use super::{DatabaseBackend, DialectCore, PlaceholderStyle, SqlDialect};
use crate::callable::{CallableProc, ParameterMode};
use crate::database::types::{
    ColumnType, DecimalPolicy, PlainTypePolicy, SizedStringPolicy, SqlDataTypePolicy,
    TypePolicyMap,
};
use crate::error::Result;
use crate::schema::{EntitySchema, FieldSchema, ForeignKeySchema, IndexSchema, NamingRules};
use crate::schema::UniqueConstraintSchema;
use std::sync::Arc;

pub struct MySqlDialect {
    core: DialectCore,
}

fn type_policies() -> TypePolicyMap {
    let policies: Vec<Arc<dyn SqlDataTypePolicy>> = vec![
        Arc::new(PlainTypePolicy::new(ColumnType::Boolean, "TINYINT(1)")),
        Arc::new(PlainTypePolicy::new(ColumnType::Short, "SMALLINT")),
        Arc::new(PlainTypePolicy::new(ColumnType::Integer, "INT")),
        Arc::new(PlainTypePolicy::new(ColumnType::Long, "BIGINT")),
        Arc::new(PlainTypePolicy::new(ColumnType::Float, "FLOAT")),
        Arc::new(PlainTypePolicy::new(ColumnType::Double, "DOUBLE")),
        Arc::new(DecimalPolicy::new("DECIMAL")),
        Arc::new(SizedStringPolicy::new(ColumnType::String, "VARCHAR")),
        Arc::new(SizedStringPolicy::new(ColumnType::Char, "CHAR")),
        Arc::new(PlainTypePolicy::new(ColumnType::Text, "LONGTEXT")),
        Arc::new(PlainTypePolicy::new(ColumnType::Blob, "MEDIUMBLOB")),
        Arc::new(PlainTypePolicy::new(ColumnType::Date, "DATE")),
        Arc::new(PlainTypePolicy::new(ColumnType::Time, "TIME(6)")),
        Arc::new(PlainTypePolicy::new(ColumnType::Timestamp, "DATETIME(6)")),
        Arc::new(PlainTypePolicy::new(ColumnType::TimestampUtc, "DATETIME(6)")),
    ];
    policies
        .into_iter()
        .map(|policy| (policy.column_type(), policy))
        .collect()
}

impl MySqlDialect {
    pub fn new(rules: NamingRules) -> Self {
        Self {
            core: DialectCore::new(
                DatabaseBackend::MySQL,
                rules,
                type_policies(),
                0,
                '`',
                PlaceholderStyle::Anonymous,
            ),
        }
    }

    /// Session variable holding OUT parameter `index` during a call
    fn out_variable(index: usize) -> String {
        format!("@sw_p{}", index + 1)
    }
}

impl Default for MySqlDialect {
    fn default() -> Self {
        Self::new(NamingRules::new(true, None))
    }
}

impl SqlDialect for MySqlDialect {
    fn core(&self) -> &DialectCore {
        &self.core
    }

    fn append_pagination(&self, sql: &mut String, offset: u64, limit: u64) {
        match (limit, offset) {
            (0, 0) => {}
            // MySQL has no OFFSET without LIMIT
            (0, offset) => sql.push_str(&format!(" LIMIT 18446744073709551615 OFFSET {}", offset)),
            (limit, 0) => sql.push_str(&format!(" LIMIT {}", limit)),
            (limit, offset) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset)),
        }
    }

    fn generate_utc_timestamp_sql(&self) -> String {
        "SELECT UTC_TIMESTAMP(6)".to_string()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn supports_update_limit(&self) -> bool {
        true
    }

    fn begin_transaction_sql(&self) -> String {
        "START TRANSACTION".to_string()
    }

    fn prepare_callable_statement(&self, proc: &CallableProc) -> Result<SqlCallableStatement> {
        let name = self.quote_identifier(proc.name());

        if let Some(return_type) = proc.return_type() {
            let mut call = SqlStatement::new(proc.name());
            let mut args = Vec::new();
            for param in proc.params() {
                call.push_param(self.sql_type_policy(param.column_type)?, param.value.clone());
                args.push("?");
            }
            call.sql_mut()
                .push_str(&format!("SELECT {}({})", name, args.join(", ")));
            return Ok(SqlCallableStatement {
                setup: Vec::new(),
                call,
                out_source: OutParameterSource::None,
                out_params: Vec::new(),
                out_policies: Vec::new(),
                return_policy: Some(self.sql_type_policy(return_type)?),
            });
        }

        let mut setup = Vec::new();
        let mut call = SqlStatement::new(proc.name());
        let mut args = Vec::new();
        let mut out_params = Vec::new();
        let mut out_policies = Vec::new();

        for (index, param) in proc.params().iter().enumerate() {
            let policy = self.sql_type_policy(param.column_type)?;
            match param.mode {
                ParameterMode::In => {
                    call.push_param(policy, param.value.clone());
                    args.push("?".to_string());
                }
                ParameterMode::Out | ParameterMode::InOut => {
                    let variable = Self::out_variable(index);
                    let mut init = SqlStatement::new(proc.name());
                    if param.mode == ParameterMode::InOut {
                        init.push_param(policy.clone(), param.value.clone());
                        init.sql_mut().push_str(&format!("SET {} = ?", variable));
                    } else {
                        init.sql_mut().push_str(&format!("SET {} = NULL", variable));
                    }
                    setup.push(init);
                    args.push(variable);
                    out_params.push(index);
                    out_policies.push(policy);
                }
            }
        }
        call.sql_mut()
            .push_str(&format!("CALL {}({})", name, args.join(", ")));

        let out_source = if out_params.is_empty() {
            OutParameterSource::None
        } else {
            let variables = out_params
                .iter()
                .map(|&i| Self::out_variable(i))
                .collect::<Vec<_>>();
            OutParameterSource::Query(format!("SELECT {}", variables.join(", ")))
        };

        Ok(SqlCallableStatement {
            setup,
            call,
            out_source,
            out_params,
            out_policies,
            return_policy: None,
        })
    }

    fn alter_column_sql(&self, schema: &EntitySchema, field: &FieldSchema) -> Result<Vec<String>> {
        let mut statements: Vec<String> = ddl::backfill_default(self, schema, field).into_iter().collect();
        statements.push(format!(
            "ALTER TABLE {} MODIFY {}",
            self.quote_identifier(schema.schema_table()),
            self.column_definition_sql(field)?
        ));
        Ok(statements)
    }

    fn rename_column_sql(
        &self,
        schema: &EntitySchema,
        old_column: &str,
        field: &FieldSchema,
    ) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} CHANGE COLUMN {} {}",
            self.quote_identifier(schema.schema_table()),
            self.quote_identifier(old_column),
            self.column_definition_sql(field)?
        ))
    }

    fn alter_column_to_null_sql(&self, schema: &EntitySchema, field: &FieldSchema) -> Result<String> {
        let mut type_sql = String::new();
        self.sql_type_policy(field.column_type())?.append_type_sql(
            &mut type_sql,
            field.length(),
            field.precision(),
            field.scale(),
        );
        Ok(format!(
            "ALTER TABLE {} MODIFY {} {} NULL",
            self.quote_identifier(schema.schema_table()),
            self.quote_identifier(field.preferred_column()),
            type_sql
        ))
    }

    fn drop_unique_constraint_sql(
        &self,
        schema: &EntitySchema,
        constraint: &UniqueConstraintSchema,
    ) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} DROP INDEX {}",
            self.quote_identifier(schema.schema_table()),
            self.quote_identifier(&ddl::object_name(self, schema, &constraint.name))
        ))
    }

    fn drop_index_sql(&self, schema: &EntitySchema, index: &IndexSchema) -> Result<String> {
        Ok(format!(
            "DROP INDEX {} ON {}",
            self.quote_identifier(&ddl::object_name(self, schema, &index.name)),
            self.quote_identifier(schema.schema_table())
        ))
    }

    fn drop_foreign_key_sql(&self, schema: &EntitySchema, fk: &ForeignKeySchema) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} DROP FOREIGN KEY {}",
            self.quote_identifier(schema.schema_table()),
            self.quote_identifier(&self.registry().rules().preferred(&fk.name))
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::types::SqlValue;

    #[test]
    fn test_pagination() {
        let d = MySqlDialect::default();
        let mut sql = String::new();
        d.append_pagination(&mut sql, 0, 10);
        assert_eq!(sql, " LIMIT 10");

        let mut sql = String::new();
        d.append_pagination(&mut sql, 5, 0);
        assert_eq!(sql, " LIMIT 18446744073709551615 OFFSET 5");
    }

    #[test]
    fn test_procedure_out_params_use_session_variables() {
        let d = MySqlDialect::default();
        let proc = CallableProc::procedure("transfer")
            .param_in("from", ColumnType::Long, 1i64)
            .param_out("balance", ColumnType::Decimal)
            .param_in_out("attempts", ColumnType::Integer, 3i32);

        let stmt = d.prepare_callable_statement(&proc).unwrap();
        assert_eq!(stmt.setup.len(), 2);
        assert_eq!(stmt.setup[0].sql(), "SET @sw_p2 = NULL");
        assert_eq!(stmt.setup[1].sql(), "SET @sw_p3 = ?");
        assert_eq!(stmt.setup[1].params()[0].value, SqlValue::Int(3));
        assert_eq!(stmt.call.sql(), "CALL `transfer`(?, @sw_p2, @sw_p3)");
        assert_eq!(
            stmt.out_source,
            OutParameterSource::Query("SELECT @sw_p2, @sw_p3".to_string())
        );
        assert_eq!(stmt.out_params, vec![1, 2]);
    }

    #[test]
    fn test_function_call_selects_return_value() {
        let d = MySqlDialect::default();
        let proc = CallableProc::function("tax", ColumnType::Decimal).param_in(
            "amount",
            ColumnType::Decimal,
            SqlValue::Int(100),
        );
        let stmt = d.prepare_callable_statement(&proc).unwrap();
        assert_eq!(stmt.call.sql(), "SELECT `tax`(?)");
        assert!(stmt.return_policy.is_some());
    }
}
