//! PostgreSQL dialect
//!
//! Double-quote identifiers and numbered `$n` placeholders. The wire protocol
//! caps a statement at 65535 parameters; IN clauses are held to half of that
//! so the rest of a statement always has room.

use super::statement::{OutParameterSource, SqlCallableStatement, SqlStatement};
use super::{DatabaseBackend, DialectCore, PlaceholderStyle, SqlDialect};
use crate::callable::CallableProc;
use crate::database::types::{
    ColumnType, DecimalPolicy, PlainTypePolicy, SizedStringPolicy, SqlDataTypePolicy, SqlValue,
    TypePolicyMap,
};
use crate::error::Result;
use crate::schema::NamingRules;
use std::sync::Arc;

pub struct PostgresDialect {
    core: DialectCore,
}

fn type_policies() -> TypePolicyMap {
    let policies: Vec<Arc<dyn SqlDataTypePolicy>> = vec![
        Arc::new(PlainTypePolicy::new(ColumnType::Boolean, "BOOLEAN")),
        Arc::new(PlainTypePolicy::new(ColumnType::Short, "SMALLINT")),
        Arc::new(PlainTypePolicy::new(ColumnType::Integer, "INTEGER")),
        Arc::new(PlainTypePolicy::new(ColumnType::Long, "BIGINT")),
        Arc::new(PlainTypePolicy::new(ColumnType::Float, "REAL")),
        Arc::new(PlainTypePolicy::new(ColumnType::Double, "DOUBLE PRECISION")),
        Arc::new(DecimalPolicy::new("NUMERIC")),
        Arc::new(SizedStringPolicy::new(ColumnType::String, "VARCHAR")),
        Arc::new(SizedStringPolicy::new(ColumnType::Char, "CHAR")),
        Arc::new(PlainTypePolicy::new(ColumnType::Text, "TEXT")),
        Arc::new(PlainTypePolicy::new(ColumnType::Blob, "BYTEA")),
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

impl PostgresDialect {
    pub fn new(rules: NamingRules) -> Self {
        Self {
            core: DialectCore::new(
                DatabaseBackend::Postgres,
                rules,
                type_policies(),
                32767,
                '"',
                PlaceholderStyle::Numbered,
            ),
        }
    }
}

impl Default for PostgresDialect {
    fn default() -> Self {
        Self::new(NamingRules::new(true, None))
    }
}

impl SqlDialect for PostgresDialect {
    fn core(&self) -> &DialectCore {
        &self.core
    }

    fn append_pagination(&self, sql: &mut String, offset: u64, limit: u64) {
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if offset > 0 {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
    }

    fn generate_utc_timestamp_sql(&self) -> String {
        "SELECT CAST(NOW() AT TIME ZONE 'UTC' AS TIMESTAMP)".to_string()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    /// Functions are selected; procedures are CALLed with OUT arguments bound
    /// as typed NULLs and report OUT values as the single row of the call
    fn prepare_callable_statement(&self, proc: &CallableProc) -> Result<SqlCallableStatement> {
        let name = self.quote_identifier(proc.name());
        let mut call = SqlStatement::new(proc.name());
        let mut args = Vec::new();
        let mut out_params = Vec::new();
        let mut out_policies = Vec::new();

        for (index, param) in proc.params().iter().enumerate() {
            let policy = self.sql_type_policy(param.column_type)?;
            let value = if param.mode.is_input() {
                param.value.clone()
            } else {
                SqlValue::Null
            };
            if param.mode.is_output() {
                out_params.push(index);
                out_policies.push(policy.clone());
            }
            let position = call.push_param(policy, value);
            args.push(self.placeholder(position));
        }

        let (sql, return_policy) = match proc.return_type() {
            Some(_) if !proc.result_sets().is_empty() => {
                (format!("SELECT * FROM {}({})", name, args.join(", ")), None)
            }
            Some(return_type) => (
                format!("SELECT {}({})", name, args.join(", ")),
                Some(self.sql_type_policy(return_type)?),
            ),
            None => (format!("CALL {}({})", name, args.join(", ")), None),
        };
        call.sql_mut().push_str(&sql);

        Ok(SqlCallableStatement {
            setup: Vec::new(),
            call,
            out_source: if out_params.is_empty() {
                OutParameterSource::None
            } else {
                OutParameterSource::CallRow
            },
            out_params,
            out_policies,
            return_policy,
        })
    }
}
