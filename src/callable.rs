//! Stored procedure and function calls
//!
//! A [`CallableProc`] names a routine, its parameters and the result sets it
//! is expected to produce. Dialects turn it into a [`SqlCallableStatement`]
//! and the executor runs it, draining every result set before OUT parameters
//! are read back.
//!
//! [`SqlCallableStatement`]: crate::dialects::statement::SqlCallableStatement

use crate::database::types::{ColumnType, SqlValue};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterMode {
    In,
    Out,
    InOut,
}

impl ParameterMode {
    pub fn is_input(&self) -> bool {
        matches!(self, ParameterMode::In | ParameterMode::InOut)
    }

    pub fn is_output(&self) -> bool {
        matches!(self, ParameterMode::Out | ParameterMode::InOut)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallableParam {
    pub name: String,
    pub mode: ParameterMode,
    pub column_type: ColumnType,
    /// Input value; replaced by the returned value for OUT and INOUT parameters
    pub value: SqlValue,
}

/// Expected shape of one result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSetDef {
    pub name: String,
    pub columns: Vec<ColumnType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallableResult {
    pub name: String,
    pub rows: Vec<Vec<SqlValue>>,
}

/// A stored procedure, or a function when a return type is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallableProc {
    name: String,
    params: Vec<CallableParam>,
    return_type: Option<ColumnType>,
    return_value: SqlValue,
    result_sets: Vec<ResultSetDef>,
}

impl CallableProc {
    pub fn procedure(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            return_type: None,
            return_value: SqlValue::Null,
            result_sets: Vec::new(),
        }
    }

    pub fn function(name: impl Into<String>, return_type: ColumnType) -> Self {
        Self {
            return_type: Some(return_type),
            ..Self::procedure(name)
        }
    }

    pub fn param_in(
        mut self,
        name: impl Into<String>,
        column_type: ColumnType,
        value: impl Into<SqlValue>,
    ) -> Self {
        self.params.push(CallableParam {
            name: name.into(),
            mode: ParameterMode::In,
            column_type,
            value: value.into(),
        });
        self
    }

    pub fn param_out(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.params.push(CallableParam {
            name: name.into(),
            mode: ParameterMode::Out,
            column_type,
            value: SqlValue::Null,
        });
        self
    }

    pub fn param_in_out(
        mut self,
        name: impl Into<String>,
        column_type: ColumnType,
        value: impl Into<SqlValue>,
    ) -> Self {
        self.params.push(CallableParam {
            name: name.into(),
            mode: ParameterMode::InOut,
            column_type,
            value: value.into(),
        });
        self
    }

    /// Declare the next result set the routine produces
    pub fn result_set(mut self, name: impl Into<String>, columns: Vec<ColumnType>) -> Self {
        self.result_sets.push(ResultSetDef {
            name: name.into(),
            columns,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[CallableParam] {
        &self.params
    }

    pub fn is_function(&self) -> bool {
        self.return_type.is_some()
    }

    pub fn return_type(&self) -> Option<ColumnType> {
        self.return_type
    }

    pub fn return_value(&self) -> &SqlValue {
        &self.return_value
    }

    pub fn result_sets(&self) -> &[ResultSetDef] {
        &self.result_sets
    }

    /// Value of an OUT or INOUT parameter after execution
    pub fn out_value(&self, name: &str) -> Option<&SqlValue> {
        self.params
            .iter()
            .find(|p| p.name == name && p.mode.is_output())
            .map(|p| &p.value)
    }

    pub(crate) fn set_return_value(&mut self, value: SqlValue) {
        self.return_value = value;
    }

    pub(crate) fn set_param_value(&mut self, index: usize, value: SqlValue) {
        if let Some(param) = self.params.get_mut(index) {
            param.value = value;
        }
    }
}
