//! Statement descriptors
//!
//! A [`SqlStatement`] is the complete output of the statement builder: SQL
//! text, the ordered parameters with the type policy that binds each one,
//! and the result columns with the policy that reads each one. Statements
//! are built per operation and moved into the executor, which consumes them.

use crate::database::types::{ColumnType, SqlDataTypePolicy, SqlValue};
use crate::error::Result;
use crate::schema::FieldSchema;
use std::fmt;
use std::sync::Arc;

/// Positional parameter of a statement
#[derive(Clone)]
pub struct SqlParameter {
    /// 1-based position
    pub index: usize,
    pub policy: Arc<dyn SqlDataTypePolicy>,
    pub value: SqlValue,
}

impl SqlParameter {
    /// Value as it is handed to the driver
    pub fn bind_value(&self) -> Result<BindValue> {
        Ok(BindValue {
            column_type: Some(self.policy.column_type()),
            value: self.policy.bind(&self.value)?,
        })
    }
}

impl fmt::Debug for SqlParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {}={}",
            self.index,
            self.policy.column_type(),
            self.value.to_sql_string()
        )
    }
}

/// A value ready for the driver, with the column type used to bind typed NULLs
#[derive(Debug, Clone, PartialEq)]
pub struct BindValue {
    pub column_type: Option<ColumnType>,
    pub value: SqlValue,
}

impl BindValue {
    pub fn untyped(value: SqlValue) -> Self {
        Self {
            column_type: None,
            value,
        }
    }
}

/// Result column of a statement
#[derive(Clone)]
pub struct SqlResult {
    /// Entity field the column is written to, if the statement reads records
    pub field: Option<Arc<FieldSchema>>,
    pub policy: Arc<dyn SqlDataTypePolicy>,
}

impl fmt::Debug for SqlResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}:{}", field.name(), self.policy.column_type()),
            None => write!(f, "{}", self.policy.column_type()),
        }
    }
}

pub struct SqlStatement {
    entity: String,
    sql: String,
    params: Vec<SqlParameter>,
    results: Vec<SqlResult>,
}

impl SqlStatement {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            sql: String::new(),
            params: Vec::new(),
            results: Vec::new(),
        }
    }

    /// Entity the statement operates on, used in error messages
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[SqlParameter] {
        &self.params
    }

    pub fn results(&self) -> &[SqlResult] {
        &self.results
    }

    pub(crate) fn sql_mut(&mut self) -> &mut String {
        &mut self.sql
    }

    pub(crate) fn params_mut(&mut self) -> &mut Vec<SqlParameter> {
        &mut self.params
    }

    /// Append a parameter and return its 1-based position
    pub(crate) fn push_param(&mut self, policy: Arc<dyn SqlDataTypePolicy>, value: SqlValue) -> usize {
        let index = self.params.len() + 1;
        self.params.push(SqlParameter {
            index,
            policy,
            value,
        });
        index
    }

    pub(crate) fn push_result(
        &mut self,
        field: Option<Arc<FieldSchema>>,
        policy: Arc<dyn SqlDataTypePolicy>,
    ) {
        self.results.push(SqlResult { field, policy });
    }

    /// Parameters converted for the driver
    pub fn bind_values(&self) -> Result<Vec<BindValue>> {
        self.params.iter().map(SqlParameter::bind_value).collect()
    }
}

impl fmt::Debug for SqlStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlStatement")
            .field("entity", &self.entity)
            .field("sql", &self.sql)
            .field("params", &self.params)
            .field("results", &self.results)
            .finish()
    }
}

/// Where OUT parameter values come from after a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutParameterSource {
    /// No OUT parameters
    None,
    /// Run a follow-up query on the same connection after all result sets are drained
    Query(String),
    /// The call itself returns a single row holding the OUT values
    CallRow,
}

/// Statement sequence for one stored routine call
#[derive(Debug)]
pub struct SqlCallableStatement {
    /// Statements run before the call, e.g. session variable setup
    pub setup: Vec<SqlStatement>,
    pub call: SqlStatement,
    pub out_source: OutParameterSource,
    /// Indexes of the OUT and INOUT parameters of the routine, in read order
    pub out_params: Vec<usize>,
    /// Policies reading the OUT values, parallel to `out_params`
    pub out_policies: Vec<Arc<dyn SqlDataTypePolicy>>,
    /// Policy reading a function's return value
    pub return_policy: Option<Arc<dyn SqlDataTypePolicy>>,
}
