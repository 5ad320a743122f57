//! Statement execution
//!
//! Runs prepared statements on a connection and marshals the rows into
//! values, records and aggregates. Every column is read through the type
//! policy the statement builder attached to it, and fields with a
//! transformer get the reverse transform after the raw read.

use crate::callable::{CallableProc, CallableResult};
use crate::criteria::{AggregateFunction, Aggregation, GroupAggregation};
use crate::database::adapter::{Row, SqlConnection};
use crate::database::types::{coerce, FieldValue, SqlValue};
use crate::dialects::{OutParameterSource, SqlCallableStatement, SqlDialect, SqlResult, SqlStatement};
use crate::error::{Error, ErrorContext, Result};
use crate::schema::{DynEntity, EntitySchema};
use indexmap::map::Entry;
use indexmap::IndexMap;
use std::hash::Hash;

/// Run an INSERT, UPDATE or DELETE and return the rows affected
pub async fn execute_update(connection: &mut dyn SqlConnection, stmt: &SqlStatement) -> Result<u64> {
    let params = stmt.bind_values()?;
    let affected = connection
        .execute(stmt.sql(), &params)
        .await
        .with_context(|| format!("executing update on '{}'", stmt.entity()))?;
    log::trace!("{} row(s) affected on '{}'", affected, stmt.entity());
    Ok(affected)
}

async fn fetch(connection: &mut dyn SqlConnection, stmt: &SqlStatement) -> Result<Vec<Row>> {
    let params = stmt.bind_values()?;
    let rows = connection
        .fetch_all(stmt.sql(), &params)
        .await
        .with_context(|| format!("querying '{}'", stmt.entity()))?;
    log::trace!("{} row(s) read from '{}'", rows.len(), stmt.entity());
    Ok(rows)
}

/// Read a column as a plain value, in its entity-level form
fn read_object(result: &SqlResult, raw: SqlValue) -> Result<SqlValue> {
    let value = result.policy.read(raw)?;
    match &result.field {
        Some(field) => field.from_stored(value),
        None => Ok(value),
    }
}

fn first_column(stmt: &SqlStatement, mut row: Row) -> Result<SqlValue> {
    let result = stmt
        .results()
        .first()
        .ok_or_else(|| Error::invalid_query(format!("statement on '{}' selects no column", stmt.entity())))?;
    if row.is_empty() {
        return Err(Error::conversion(format!("empty row read from '{}'", stmt.entity())));
    }
    read_object(result, row.swap_remove(0))
}

fn read_record(schema: &EntitySchema, stmt: &SqlStatement, row: Row) -> Result<Box<DynEntity>> {
    let mut record = schema.new_instance();
    for (result, raw) in stmt.results().iter().zip(row) {
        if let Some(field) = &result.field {
            let value = result.policy.read(raw)?;
            field.set(&mut *record, value)?;
        }
    }
    Ok(record)
}

fn single<T>(stmt: &SqlStatement, mut items: Vec<T>, must_match: bool) -> Result<Option<T>> {
    match items.len() {
        0 if must_match => Err(Error::NoMatchingRecord {
            entity: stmt.entity().to_string(),
        }),
        0 => Ok(None),
        1 => Ok(items.pop()),
        _ => Err(Error::MultipleResultFound {
            entity: stmt.entity().to_string(),
        }),
    }
}

/// Read at most one value from the first column
pub async fn execute_single_object_result_query(
    connection: &mut dyn SqlConnection,
    stmt: &SqlStatement,
    must_match: bool,
) -> Result<Option<SqlValue>> {
    let rows = fetch(connection, stmt).await?;
    match single(stmt, rows, must_match)? {
        Some(row) => first_column(stmt, row).map(Some),
        None => Ok(None),
    }
}

/// Read the first column of every row
pub async fn execute_multiple_object_result_query(
    connection: &mut dyn SqlConnection,
    stmt: &SqlStatement,
) -> Result<Vec<SqlValue>> {
    fetch(connection, stmt)
        .await?
        .into_iter()
        .map(|row| first_column(stmt, row))
        .collect()
}

/// Read every row as a list of values, one per result column
pub async fn execute_multiple_values_query(
    connection: &mut dyn SqlConnection,
    stmt: &SqlStatement,
) -> Result<Vec<Vec<SqlValue>>> {
    fetch(connection, stmt)
        .await?
        .into_iter()
        .map(|row| {
            stmt.results()
                .iter()
                .zip(row)
                .map(|(result, raw)| read_object(result, raw))
                .collect()
        })
        .collect()
}

/// Read at most one record
pub async fn execute_single_record_result_query(
    connection: &mut dyn SqlConnection,
    schema: &EntitySchema,
    stmt: &SqlStatement,
    must_match: bool,
) -> Result<Option<Box<DynEntity>>> {
    let rows = fetch(connection, stmt).await?;
    match single(stmt, rows, must_match)? {
        Some(row) => read_record(schema, stmt, row).map(Some),
        None => Ok(None),
    }
}

pub async fn execute_multiple_record_result_query(
    connection: &mut dyn SqlConnection,
    schema: &EntitySchema,
    stmt: &SqlStatement,
) -> Result<Vec<Box<DynEntity>>> {
    fetch(connection, stmt)
        .await?
        .into_iter()
        .map(|row| read_record(schema, stmt, row))
        .collect()
}

fn duplicate_key(stmt: &SqlStatement, field: &str, key: &SqlValue) -> Error {
    Error::DuplicateKeyFound {
        entity: stmt.entity().to_string(),
        field: field.to_string(),
        key: key.to_string(),
    }
}

/// Records keyed by one of their fields; a repeated key is an error
pub async fn execute_multiple_record_map_query<K>(
    connection: &mut dyn SqlConnection,
    schema: &EntitySchema,
    key_field: &str,
    stmt: &SqlStatement,
) -> Result<IndexMap<K, Box<DynEntity>>>
where
    K: FieldValue + Eq + Hash,
{
    let field = schema.list_field(key_field)?.clone();
    let mut map = IndexMap::new();
    for record in execute_multiple_record_result_query(connection, schema, stmt).await? {
        let key_value = field.get_value(&*record)?;
        match map.entry(K::from_sql_value(key_value.clone())?) {
            Entry::Occupied(_) => return Err(duplicate_key(stmt, key_field, &key_value)),
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }
    }
    Ok(map)
}

/// Records grouped by one of their fields, in read order
pub async fn execute_multiple_record_list_map_query<K>(
    connection: &mut dyn SqlConnection,
    schema: &EntitySchema,
    key_field: &str,
    stmt: &SqlStatement,
) -> Result<IndexMap<K, Vec<Box<DynEntity>>>>
where
    K: FieldValue + Eq + Hash,
{
    let field = schema.list_field(key_field)?.clone();
    let mut map: IndexMap<K, Vec<Box<DynEntity>>> = IndexMap::new();
    for record in execute_multiple_record_result_query(connection, schema, stmt).await? {
        let key = K::from_sql_value(field.get_value(&*record)?)?;
        map.entry(key).or_default().push(record);
    }
    Ok(map)
}

fn key_value_pairs(stmt: &SqlStatement, rows: Vec<Row>) -> Result<Vec<(SqlValue, SqlValue)>> {
    let results = stmt.results();
    if results.len() < 2 {
        return Err(Error::invalid_query(format!(
            "map query on '{}' needs a key and a value column",
            stmt.entity()
        )));
    }
    rows.into_iter()
        .map(|row| {
            let mut columns = row.into_iter();
            let key = read_object(&results[0], columns.next().unwrap_or(SqlValue::Null))?;
            let value = read_object(&results[1], columns.next().unwrap_or(SqlValue::Null))?;
            Ok((key, value))
        })
        .collect()
}

/// First column as key, second as value; a repeated key is an error
pub async fn execute_multiple_object_map_query<K>(
    connection: &mut dyn SqlConnection,
    key_field: &str,
    stmt: &SqlStatement,
) -> Result<IndexMap<K, SqlValue>>
where
    K: FieldValue + Eq + Hash,
{
    let rows = fetch(connection, stmt).await?;
    let mut map = IndexMap::new();
    for (key_value, value) in key_value_pairs(stmt, rows)? {
        match map.entry(K::from_sql_value(key_value.clone())?) {
            Entry::Occupied(_) => return Err(duplicate_key(stmt, key_field, &key_value)),
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }
    }
    Ok(map)
}

/// First column as key, second column values collected per key
pub async fn execute_multiple_object_list_map_query<K>(
    connection: &mut dyn SqlConnection,
    stmt: &SqlStatement,
) -> Result<IndexMap<K, Vec<SqlValue>>>
where
    K: FieldValue + Eq + Hash,
{
    let rows = fetch(connection, stmt).await?;
    let mut map: IndexMap<K, Vec<SqlValue>> = IndexMap::new();
    for (key, value) in key_value_pairs(stmt, rows)? {
        map.entry(K::from_sql_value(key)?).or_default().push(value);
    }
    Ok(map)
}

/// Aggregate value with NULL reported as zero for numeric columns
fn aggregate_value(result: &SqlResult, raw: SqlValue) -> Result<SqlValue> {
    let value = result.policy.read(raw)?;
    let column_type = result.policy.column_type();
    if value.is_null() && column_type.is_numeric() {
        return coerce(SqlValue::BigInt(0), column_type);
    }
    Ok(value)
}

fn read_aggregations(
    functions: &[AggregateFunction],
    results: &[SqlResult],
    row: Vec<SqlValue>,
) -> Result<Vec<Aggregation>> {
    let mut columns = results.iter().zip(row);
    let count = match columns.next() {
        Some((result, raw)) => result.policy.read(raw)?.as_i64().unwrap_or(0).max(0) as u64,
        None => 0,
    };
    functions
        .iter()
        .zip(columns)
        .map(|(function, (result, raw))| {
            Ok(Aggregation {
                kind: function.kind,
                field: function.field.clone(),
                count,
                value: aggregate_value(result, raw)?,
            })
        })
        .collect()
}

/// Run an ungrouped aggregate statement, one [`Aggregation`] per function
pub async fn execute_aggregate_query(
    connection: &mut dyn SqlConnection,
    functions: &[AggregateFunction],
    stmt: &SqlStatement,
) -> Result<Vec<Aggregation>> {
    let rows = fetch(connection, stmt).await?;
    match single(stmt, rows, false)? {
        Some(row) => read_aggregations(functions, stmt.results(), row),
        None => Ok(Vec::new()),
    }
}

/// Run a grouped aggregate statement whose first `group_count` columns are the group
pub async fn execute_group_aggregate_query(
    connection: &mut dyn SqlConnection,
    functions: &[AggregateFunction],
    group_count: usize,
    stmt: &SqlStatement,
) -> Result<Vec<GroupAggregation>> {
    let results = stmt.results();
    if results.len() < group_count {
        return Err(Error::invalid_query(format!(
            "aggregate on '{}' selects fewer columns than its grouping",
            stmt.entity()
        )));
    }
    let (group_results, aggregate_results) = results.split_at(group_count);
    fetch(connection, stmt)
        .await?
        .into_iter()
        .map(|mut row| {
            let rest = row.split_off(group_count.min(row.len()));
            let group = group_results
                .iter()
                .zip(row)
                .map(|(result, raw)| read_object(result, raw))
                .collect::<Result<Vec<_>>>()?;
            Ok(GroupAggregation {
                group,
                aggregations: read_aggregations(functions, aggregate_results, rest)?,
            })
        })
        .collect()
}

/// Run a stored routine and copy OUT values and the return value into `proc`
///
/// Result sets are read completely before OUT parameters, since some drivers
/// only make them available once every result set has been consumed.
pub async fn execute_callable(
    connection: &mut dyn SqlConnection,
    dialect: &dyn SqlDialect,
    proc: &mut CallableProc,
    stmt: &SqlCallableStatement,
) -> Result<Vec<CallableResult>> {
    for setup in &stmt.setup {
        execute_update(connection, setup).await?;
    }

    let call = &stmt.call;
    let params = call.bind_values()?;
    log::debug!("Calling '{}': {}", proc.name(), call.sql());

    if let Some(policy) = &stmt.return_policy {
        let rows = connection
            .fetch_all(call.sql(), &params)
            .await
            .with_context(|| format!("calling function '{}'", proc.name()))?;
        let value = match rows.into_iter().next().and_then(|row| row.into_iter().next()) {
            Some(raw) => policy.read(raw)?,
            None => SqlValue::Null,
        };
        proc.set_return_value(value);
        return Ok(Vec::new());
    }

    let mut sets = connection
        .fetch_result_sets(call.sql(), &params)
        .await
        .with_context(|| format!("calling procedure '{}'", proc.name()))?
        .into_iter();

    let call_row = match stmt.out_source {
        OutParameterSource::CallRow => sets.next().and_then(|set| set.into_iter().next()),
        _ => None,
    };

    let mut results = Vec::with_capacity(proc.result_sets().len());
    for definition in proc.result_sets() {
        let rows = sets.next().unwrap_or_default();
        let mut converted = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(row.len());
            for (index, raw) in row.into_iter().enumerate() {
                let value = match definition.columns.get(index) {
                    Some(column_type) => dialect.sql_type_policy(*column_type)?.read(raw)?,
                    None => raw,
                };
                values.push(value);
            }
            converted.push(values);
        }
        results.push(CallableResult {
            name: definition.name.clone(),
            rows: converted,
        });
    }
    let skipped = sets.filter(|set| !set.is_empty()).count();
    if skipped > 0 {
        log::warn!(
            "Ignored {} undeclared result set(s) from '{}'",
            skipped,
            proc.name()
        );
    }

    let out_row = match &stmt.out_source {
        OutParameterSource::None => None,
        OutParameterSource::CallRow => call_row,
        OutParameterSource::Query(sql) => connection
            .fetch_all(sql, &[])
            .await
            .with_context(|| format!("reading OUT parameters of '{}'", proc.name()))?
            .into_iter()
            .next(),
    };
    if let Some(row) = out_row {
        for ((&index, policy), raw) in stmt.out_params.iter().zip(&stmt.out_policies).zip(row) {
            proc.set_param_value(index, policy.read(raw)?);
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::AggregateType;
    use crate::database::types::{ColumnType, PlainTypePolicy};
    use crate::dialects::{BindValue, DatabaseBackend};
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Connection returning canned rows
    struct ScriptedConnection {
        rows: Vec<Row>,
        executed: Vec<String>,
    }

    #[async_trait]
    impl SqlConnection for ScriptedConnection {
        fn data_source(&self) -> &str {
            "scripted"
        }

        fn backend(&self) -> DatabaseBackend {
            DatabaseBackend::SQLite
        }

        async fn execute(&mut self, sql: &str, _params: &[BindValue]) -> Result<u64> {
            self.executed.push(sql.to_string());
            Ok(1)
        }

        async fn fetch_all(&mut self, sql: &str, _params: &[BindValue]) -> Result<Vec<Row>> {
            self.executed.push(sql.to_string());
            Ok(self.rows.clone())
        }

        async fn fetch_result_sets(&mut self, sql: &str, params: &[BindValue]) -> Result<Vec<Vec<Row>>> {
            Ok(vec![self.fetch_all(sql, params).await?])
        }

        async fn execute_raw(&mut self, sql: &str) -> Result<u64> {
            self.executed.push(sql.to_string());
            Ok(0)
        }

        fn close_on_drop(&mut self) {}
    }

    fn connection(rows: Vec<Row>) -> ScriptedConnection {
        ScriptedConnection {
            rows,
            executed: Vec::new(),
        }
    }

    fn statement(types: &[ColumnType]) -> SqlStatement {
        let mut stmt = SqlStatement::new("Account");
        stmt.sql_mut().push_str("SELECT ...");
        for column_type in types {
            stmt.push_result(None, Arc::new(PlainTypePolicy::new(*column_type, "X")));
        }
        stmt
    }

    #[tokio::test]
    async fn test_single_object_cardinality() {
        let stmt = statement(&[ColumnType::Long]);

        let mut none = connection(vec![]);
        assert_eq!(
            execute_single_object_result_query(&mut none, &stmt, false).await.unwrap(),
            None
        );
        let err = execute_single_object_result_query(&mut none, &stmt, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoMatchingRecord { .. }));

        let mut many = connection(vec![vec![SqlValue::BigInt(1)], vec![SqlValue::BigInt(2)]]);
        let err = execute_single_object_result_query(&mut many, &stmt, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MultipleResultFound { .. }));
    }

    #[tokio::test]
    async fn test_values_are_read_through_policy() {
        let stmt = statement(&[ColumnType::Integer]);
        let mut conn = connection(vec![vec![SqlValue::BigInt(7)]]);
        let value = execute_single_object_result_query(&mut conn, &stmt, true)
            .await
            .unwrap();
        assert_eq!(value, Some(SqlValue::Int(7)));
    }

    #[tokio::test]
    async fn test_object_map_rejects_duplicate_keys() {
        let stmt = statement(&[ColumnType::String, ColumnType::Long]);
        let mut conn = connection(vec![
            vec![SqlValue::from("a"), SqlValue::BigInt(1)],
            vec![SqlValue::from("a"), SqlValue::BigInt(2)],
        ]);
        let err = execute_multiple_object_map_query::<String>(&mut conn, "name", &stmt)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKeyFound { ref key, .. } if key == "a"));

        let list = execute_multiple_object_list_map_query::<String>(&mut conn, &stmt)
            .await
            .unwrap();
        assert_eq!(list["a"], vec![SqlValue::BigInt(1), SqlValue::BigInt(2)]);
    }

    #[tokio::test]
    async fn test_aggregate_nulls_become_zero() {
        let stmt = statement(&[ColumnType::Long, ColumnType::Double, ColumnType::Long]);
        let mut conn = connection(vec![vec![SqlValue::BigInt(0), SqlValue::Null, SqlValue::Null]]);
        let functions = [
            AggregateFunction::sum("balance"),
            AggregateFunction::count("id"),
        ];
        let aggregations = execute_aggregate_query(&mut conn, &functions, &stmt)
            .await
            .unwrap();

        assert_eq!(aggregations.len(), 2);
        assert_eq!(aggregations[0].kind, AggregateType::Sum);
        assert_eq!(aggregations[0].value, SqlValue::Double(0.0));
        assert_eq!(aggregations[1].value, SqlValue::BigInt(0));
        assert_eq!(aggregations[1].count, 0);
    }

    #[tokio::test]
    async fn test_group_aggregates_split_group_columns() {
        let stmt = statement(&[ColumnType::String, ColumnType::Long, ColumnType::Double]);
        let mut conn = connection(vec![
            vec![SqlValue::from("OPEN"), SqlValue::BigInt(2), SqlValue::Double(30.0)],
            vec![SqlValue::from("CLOSED"), SqlValue::BigInt(1), SqlValue::Double(5.5)],
        ]);
        let functions = [AggregateFunction::sum("balance")];
        let groups = execute_group_aggregate_query(&mut conn, &functions, 1, &stmt)
            .await
            .unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].group, vec![SqlValue::from("OPEN")]);
        assert_eq!(groups[0].aggregations[0].count, 2);
        assert_eq!(groups[1].aggregations[0].value, SqlValue::Double(5.5));
    }

    #[tokio::test]
    async fn test_update_reports_rows_affected() {
        let mut stmt = SqlStatement::new("Account");
        stmt.sql_mut().push_str("DELETE FROM account");
        let mut conn = connection(vec![]);
        assert_eq!(execute_update(&mut conn, &stmt).await.unwrap(), 1);
        assert_eq!(conn.executed, vec!["DELETE FROM account"]);
    }
}
