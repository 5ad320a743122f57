//! Portable statement builder shared by all dialects

use super::statement::SqlStatement;
use super::translate::translate_criteria;
use super::SqlDialect;
use crate::criteria::{AggregateFunction, AggregateType, Criteria, OrderDirection, Update};
use crate::database::types::{ColumnType, SqlValue};
use crate::error::{Error, Result};
use crate::schema::{DynEntity, EntitySchema, FieldSchema};
use std::sync::Arc;

fn source<D: SqlDialect + ?Sized>(d: &D, schema: &EntitySchema, use_view: bool) -> String {
    if use_view {
        d.quote_identifier(schema.schema_view())
    } else {
        d.quote_identifier(schema.schema_table())
    }
}

fn resolve_field(schema: &EntitySchema, name: &str, use_view: bool) -> Result<Arc<FieldSchema>> {
    let field = if use_view {
        schema.list_field(name)?
    } else {
        schema.field(name)?
    };
    Ok(field.clone())
}

fn ensure_mutable(schema: &EntitySchema, operation: &str) -> Result<()> {
    if schema.is_view_only() {
        return Err(Error::view_only(schema.name(), operation));
    }
    Ok(())
}

fn record_fields(
    schema: &EntitySchema,
    criteria: &Criteria,
    use_view: bool,
) -> Result<Vec<Arc<FieldSchema>>> {
    if criteria.select().is_empty() {
        let all = if use_view {
            schema.list_fields()
        } else {
            schema.fields()
        };
        return Ok(all.to_vec());
    }
    criteria
        .select()
        .iter()
        .map(|name| resolve_field(schema, name, use_view))
        .collect()
}

fn append_record_columns<D: SqlDialect + ?Sized>(
    d: &D,
    stmt: &mut SqlStatement,
    fields: &[Arc<FieldSchema>],
) -> Result<()> {
    let columns = fields
        .iter()
        .map(|f| d.quote_identifier(f.preferred_column()))
        .collect::<Vec<_>>()
        .join(", ");
    stmt.sql_mut().push_str(&columns);
    for field in fields {
        let policy = d.sql_type_policy(field.column_type())?;
        stmt.push_result(Some(field.clone()), policy);
    }
    Ok(())
}

fn append_where<D: SqlDialect + ?Sized>(
    d: &D,
    stmt: &mut SqlStatement,
    schema: &EntitySchema,
    criteria: &Criteria,
    use_view: bool,
) -> Result<()> {
    let clause = translate_criteria(d.core(), schema, criteria, use_view, stmt.params_mut())?;
    if let Some(clause) = clause {
        stmt.sql_mut().push_str(" WHERE ");
        stmt.sql_mut().push_str(&clause);
    }
    Ok(())
}

fn append_group_by<D: SqlDialect + ?Sized>(
    d: &D,
    stmt: &mut SqlStatement,
    schema: &EntitySchema,
    criteria: &Criteria,
    use_view: bool,
) -> Result<()> {
    if criteria.group_by().is_empty() {
        return Ok(());
    }
    let columns = criteria
        .group_by()
        .iter()
        .map(|name| {
            resolve_field(schema, name, use_view).map(|f| d.quote_identifier(f.preferred_column()))
        })
        .collect::<Result<Vec<_>>>()?;
    stmt.sql_mut().push_str(" GROUP BY ");
    stmt.sql_mut().push_str(&columns.join(", "));
    Ok(())
}

fn append_order<D: SqlDialect + ?Sized>(
    d: &D,
    stmt: &mut SqlStatement,
    schema: &EntitySchema,
    criteria: &Criteria,
    use_view: bool,
) -> Result<()> {
    if criteria.order().is_empty() {
        return Ok(());
    }
    let terms = criteria
        .order()
        .iter()
        .map(|order| {
            let field = resolve_field(schema, &order.field, use_view)?;
            let direction = match order.direction {
                OrderDirection::Asc => "ASC",
                OrderDirection::Desc => "DESC",
            };
            Ok(format!(
                "{} {}",
                d.quote_identifier(field.preferred_column()),
                direction
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    stmt.sql_mut().push_str(" ORDER BY ");
    stmt.sql_mut().push_str(&terms.join(", "));
    Ok(())
}

fn append_pagination<D: SqlDialect + ?Sized>(d: &D, stmt: &mut SqlStatement, criteria: &Criteria) {
    if d.is_query_offset_or_limit(criteria) {
        d.append_pagination(stmt.sql_mut(), criteria.offset(), criteria.limit());
    }
}

/// `WHERE id = ? [AND version = ?]` with entity-level values
fn append_id_predicate<D: SqlDialect + ?Sized>(
    d: &D,
    stmt: &mut SqlStatement,
    schema: &EntitySchema,
    id: &SqlValue,
    version: Option<&SqlValue>,
) -> Result<()> {
    let id_field = schema.id_field();
    let stored = id_field.to_stored(id.clone())?;
    append_stored_id_predicate(d, stmt, schema, stored, version)
}

fn append_stored_id_predicate<D: SqlDialect + ?Sized>(
    d: &D,
    stmt: &mut SqlStatement,
    schema: &EntitySchema,
    stored_id: SqlValue,
    version: Option<&SqlValue>,
) -> Result<()> {
    let id_field = schema.id_field();
    let index = stmt.push_param(d.sql_type_policy(id_field.column_type())?, stored_id);
    let clause = format!(
        " WHERE {} = {}",
        d.quote_identifier(id_field.preferred_column()),
        d.placeholder(index)
    );
    stmt.sql_mut().push_str(&clause);

    if let Some(version) = version {
        let version_field = schema.version_field().ok_or_else(|| {
            Error::invalid_query(format!("entity '{}' is not versioned", schema.name()))
        })?;
        let stored = version_field.to_stored(version.clone())?;
        let index = stmt.push_param(d.sql_type_policy(version_field.column_type())?, stored);
        let clause = format!(
            " AND {} = {}",
            d.quote_identifier(version_field.preferred_column()),
            d.placeholder(index)
        );
        stmt.sql_mut().push_str(&clause);
    }
    Ok(())
}

fn append_update_limit<D: SqlDialect + ?Sized>(d: &D, stmt: &mut SqlStatement, criteria: &Criteria) {
    if d.supports_update_limit() && criteria.limit() > 0 && criteria.offset() == 0 {
        stmt.sql_mut().push_str(&format!(" LIMIT {}", criteria.limit()));
    }
}

pub(super) fn find<D: SqlDialect + ?Sized>(
    d: &D,
    schema: &EntitySchema,
    criteria: &Criteria,
    use_view: bool,
) -> Result<SqlStatement> {
    let fields = record_fields(schema, criteria, use_view)?;
    let mut stmt = SqlStatement::new(schema.name());
    stmt.sql_mut().push_str(if criteria.is_distinct() {
        "SELECT DISTINCT "
    } else {
        "SELECT "
    });
    append_record_columns(d, &mut stmt, &fields)?;
    let from = format!(" FROM {}", source(d, schema, use_view));
    stmt.sql_mut().push_str(&from);
    append_where(d, &mut stmt, schema, criteria, use_view)?;
    append_order(d, &mut stmt, schema, criteria, use_view)?;
    append_pagination(d, &mut stmt, criteria);

    log::debug!("Prepared select on {}: {}", schema.name(), stmt.sql());
    Ok(stmt)
}

pub(super) fn find_by_id<D: SqlDialect + ?Sized>(
    d: &D,
    schema: &EntitySchema,
    id: &SqlValue,
    version: Option<&SqlValue>,
    use_view: bool,
) -> Result<SqlStatement> {
    let fields = if use_view {
        schema.list_fields()
    } else {
        schema.fields()
    };
    let mut stmt = SqlStatement::new(schema.name());
    stmt.sql_mut().push_str("SELECT ");
    append_record_columns(d, &mut stmt, fields)?;
    let from = format!(" FROM {}", source(d, schema, use_view));
    stmt.sql_mut().push_str(&from);
    append_id_predicate(d, &mut stmt, schema, id, version)?;

    log::debug!("Prepared select by id on {}: {}", schema.name(), stmt.sql());
    Ok(stmt)
}

pub(super) fn create<D: SqlDialect + ?Sized>(
    d: &D,
    schema: &EntitySchema,
    record: &DynEntity,
) -> Result<SqlStatement> {
    ensure_mutable(schema, "create")?;
    let mut stmt = SqlStatement::new(schema.name());
    let mut columns = Vec::with_capacity(schema.fields().len());
    let mut placeholders = Vec::with_capacity(schema.fields().len());

    for field in schema.fields() {
        let value = field.get(record)?;
        let index = stmt.push_param(d.sql_type_policy(field.column_type())?, value);
        columns.push(d.quote_identifier(field.preferred_column()));
        placeholders.push(d.placeholder(index));
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        source(d, schema, false),
        columns.join(", "),
        placeholders.join(", ")
    );
    stmt.sql_mut().push_str(&sql);

    log::debug!("Prepared insert on {}: {}", schema.name(), stmt.sql());
    Ok(stmt)
}

pub(super) fn update_by_id<D: SqlDialect + ?Sized>(
    d: &D,
    schema: &EntitySchema,
    record: &DynEntity,
    expected_version: Option<&SqlValue>,
) -> Result<SqlStatement> {
    ensure_mutable(schema, "update")?;
    let id_field = schema.id_field();
    let mut stmt = SqlStatement::new(schema.name());
    let mut assignments = Vec::with_capacity(schema.fields().len());

    for field in schema.fields().iter().filter(|f| f.name() != id_field.name()) {
        let value = field.get(record)?;
        let index = stmt.push_param(d.sql_type_policy(field.column_type())?, value);
        assignments.push(format!(
            "{} = {}",
            d.quote_identifier(field.preferred_column()),
            d.placeholder(index)
        ));
    }
    if assignments.is_empty() {
        return Err(Error::invalid_query(format!(
            "entity '{}' has no fields to update",
            schema.name()
        )));
    }

    let sql = format!(
        "UPDATE {} SET {}",
        source(d, schema, false),
        assignments.join(", ")
    );
    stmt.sql_mut().push_str(&sql);
    let stored_id = id_field.get(record)?;
    append_stored_id_predicate(d, &mut stmt, schema, stored_id, expected_version)?;

    log::debug!("Prepared update by id on {}: {}", schema.name(), stmt.sql());
    Ok(stmt)
}

fn append_assignments<D: SqlDialect + ?Sized>(
    d: &D,
    stmt: &mut SqlStatement,
    schema: &EntitySchema,
    update: &Update,
) -> Result<()> {
    if update.is_empty() {
        return Err(Error::invalid_query(format!(
            "update of '{}' has no assignments",
            schema.name()
        )));
    }
    let mut assignments = Vec::new();
    for (name, value) in update.assignments() {
        let field = schema.field(name)?;
        let stored = field.to_stored(value.clone())?;
        let index = stmt.push_param(d.sql_type_policy(field.column_type())?, stored);
        assignments.push(format!(
            "{} = {}",
            d.quote_identifier(field.preferred_column()),
            d.placeholder(index)
        ));
    }
    let sql = format!(
        "UPDATE {} SET {}",
        source(d, schema, false),
        assignments.join(", ")
    );
    stmt.sql_mut().push_str(&sql);
    Ok(())
}

pub(super) fn update<D: SqlDialect + ?Sized>(
    d: &D,
    schema: &EntitySchema,
    criteria: &Criteria,
    update: &Update,
) -> Result<SqlStatement> {
    ensure_mutable(schema, "update")?;
    let mut stmt = SqlStatement::new(schema.name());
    append_assignments(d, &mut stmt, schema, update)?;
    append_where(d, &mut stmt, schema, criteria, false)?;
    if d.supports_update_limit() && criteria.limit() > 0 {
        append_order(d, &mut stmt, schema, criteria, false)?;
    }
    append_update_limit(d, &mut stmt, criteria);

    log::debug!("Prepared bulk update on {}: {}", schema.name(), stmt.sql());
    Ok(stmt)
}

pub(super) fn update_by_id_with<D: SqlDialect + ?Sized>(
    d: &D,
    schema: &EntitySchema,
    id: &SqlValue,
    update: &Update,
) -> Result<SqlStatement> {
    ensure_mutable(schema, "update")?;
    let mut stmt = SqlStatement::new(schema.name());
    append_assignments(d, &mut stmt, schema, update)?;
    append_id_predicate(d, &mut stmt, schema, id, None)?;

    log::debug!("Prepared update by id on {}: {}", schema.name(), stmt.sql());
    Ok(stmt)
}

pub(super) fn delete_by_id<D: SqlDialect + ?Sized>(
    d: &D,
    schema: &EntitySchema,
    id: &SqlValue,
    version: Option<&SqlValue>,
) -> Result<SqlStatement> {
    ensure_mutable(schema, "delete")?;
    let mut stmt = SqlStatement::new(schema.name());
    let sql = format!("DELETE FROM {}", source(d, schema, false));
    stmt.sql_mut().push_str(&sql);
    append_id_predicate(d, &mut stmt, schema, id, version)?;

    log::debug!("Prepared delete by id on {}: {}", schema.name(), stmt.sql());
    Ok(stmt)
}

pub(super) fn delete<D: SqlDialect + ?Sized>(
    d: &D,
    schema: &EntitySchema,
    criteria: &Criteria,
) -> Result<SqlStatement> {
    ensure_mutable(schema, "delete")?;
    let mut stmt = SqlStatement::new(schema.name());
    let sql = format!("DELETE FROM {}", source(d, schema, false));
    stmt.sql_mut().push_str(&sql);
    append_where(d, &mut stmt, schema, criteria, false)?;
    if d.supports_update_limit() && criteria.limit() > 0 {
        append_order(d, &mut stmt, schema, criteria, false)?;
    }
    append_update_limit(d, &mut stmt, criteria);

    log::debug!("Prepared bulk delete on {}: {}", schema.name(), stmt.sql());
    Ok(stmt)
}

pub(super) fn ids<D: SqlDialect + ?Sized>(
    d: &D,
    schema: &EntitySchema,
    criteria: &Criteria,
    use_view: bool,
) -> Result<SqlStatement> {
    let id_field = schema.id_field();
    let mut stmt = SqlStatement::new(schema.name());
    let sql = format!(
        "SELECT {} FROM {}",
        d.quote_identifier(id_field.preferred_column()),
        source(d, schema, use_view)
    );
    stmt.sql_mut().push_str(&sql);
    stmt.push_result(None, d.sql_type_policy(id_field.column_type())?);
    append_where(d, &mut stmt, schema, criteria, use_view)?;
    append_order(d, &mut stmt, schema, criteria, use_view)?;
    append_pagination(d, &mut stmt, criteria);

    log::debug!("Prepared id select on {}: {}", schema.name(), stmt.sql());
    Ok(stmt)
}

pub(super) fn values<D: SqlDialect + ?Sized>(
    d: &D,
    schema: &EntitySchema,
    fields: &[&str],
    criteria: &Criteria,
    use_view: bool,
) -> Result<SqlStatement> {
    if fields.is_empty() {
        return Err(Error::invalid_query("value query selects no fields"));
    }
    let mut stmt = SqlStatement::new(schema.name());
    let mut columns = Vec::with_capacity(fields.len());
    for name in fields {
        let field = resolve_field(schema, name, use_view)?;
        columns.push(d.quote_identifier(field.preferred_column()));
        stmt.push_result(Some(field.clone()), d.sql_type_policy(field.column_type())?);
    }
    let sql = format!(
        "SELECT {}{} FROM {}",
        if criteria.is_distinct() { "DISTINCT " } else { "" },
        columns.join(", "),
        source(d, schema, use_view)
    );
    stmt.sql_mut().push_str(&sql);
    append_where(d, &mut stmt, schema, criteria, use_view)?;
    append_order(d, &mut stmt, schema, criteria, use_view)?;
    append_pagination(d, &mut stmt, criteria);

    log::debug!("Prepared value select on {}: {}", schema.name(), stmt.sql());
    Ok(stmt)
}

pub(super) fn count<D: SqlDialect + ?Sized>(
    d: &D,
    schema: &EntitySchema,
    criteria: &Criteria,
    use_view: bool,
) -> Result<SqlStatement> {
    let mut stmt = SqlStatement::new(schema.name());
    let sql = format!("SELECT COUNT(*) FROM {}", source(d, schema, use_view));
    stmt.sql_mut().push_str(&sql);
    stmt.push_result(None, d.sql_type_policy(ColumnType::Long)?);
    append_where(d, &mut stmt, schema, criteria, use_view)?;

    log::debug!("Prepared count on {}: {}", schema.name(), stmt.sql());
    Ok(stmt)
}

pub(super) fn extreme<D: SqlDialect + ?Sized>(
    d: &D,
    schema: &EntitySchema,
    function: &str,
    field: &str,
    criteria: &Criteria,
    use_view: bool,
) -> Result<SqlStatement> {
    let field = resolve_field(schema, field, use_view)?;
    let mut stmt = SqlStatement::new(schema.name());
    let sql = format!(
        "SELECT {}({}) FROM {}",
        function,
        d.quote_identifier(field.preferred_column()),
        source(d, schema, use_view)
    );
    stmt.sql_mut().push_str(&sql);
    stmt.push_result(Some(field.clone()), d.sql_type_policy(field.column_type())?);
    append_where(d, &mut stmt, schema, criteria, use_view)?;

    log::debug!("Prepared {} on {}: {}", function, schema.name(), stmt.sql());
    Ok(stmt)
}

/// Column type the result of an aggregate is read as
fn aggregate_type(function: &AggregateFunction, field: &FieldSchema) -> ColumnType {
    match function.kind {
        AggregateType::Count => ColumnType::Long,
        AggregateType::Maximum | AggregateType::Minimum => field.column_type(),
        AggregateType::Sum | AggregateType::Average => {
            if field.column_type() == ColumnType::Decimal {
                ColumnType::Decimal
            } else {
                ColumnType::Double
            }
        }
    }
}

pub(super) fn aggregate<D: SqlDialect + ?Sized>(
    d: &D,
    schema: &EntitySchema,
    functions: &[AggregateFunction],
    criteria: &Criteria,
    use_view: bool,
) -> Result<SqlStatement> {
    let mut stmt = SqlStatement::new(schema.name());
    let mut columns = Vec::new();

    for name in criteria.group_by() {
        let field = resolve_field(schema, name, use_view)?;
        columns.push(d.quote_identifier(field.preferred_column()));
        stmt.push_result(Some(field.clone()), d.sql_type_policy(field.column_type())?);
    }

    columns.push("COUNT(*)".to_string());
    stmt.push_result(None, d.sql_type_policy(ColumnType::Long)?);

    for function in functions {
        let field = resolve_field(schema, &function.field, use_view)?;
        columns.push(format!(
            "{}({})",
            function.kind.sql_function(),
            d.quote_identifier(field.preferred_column())
        ));
        stmt.push_result(None, d.sql_type_policy(aggregate_type(function, &field))?);
    }

    let sql = format!(
        "SELECT {} FROM {}",
        columns.join(", "),
        source(d, schema, use_view)
    );
    stmt.sql_mut().push_str(&sql);
    append_where(d, &mut stmt, schema, criteria, use_view)?;
    append_group_by(d, &mut stmt, schema, criteria, use_view)?;
    append_order(d, &mut stmt, schema, criteria, use_view)?;

    log::debug!("Prepared aggregate on {}: {}", schema.name(), stmt.sql());
    Ok(stmt)
}

#[cfg(test)]
mod tests {
    use crate::criteria::{AggregateFunction, Criteria, OrderDirection, Query, Restriction, Update};
    use crate::database::types::{ColumnType, SqlValue};
    use crate::dialects::{MySqlDialect, PostgresDialect, SqlDialect, SqliteDialect};
    use crate::error::Error;
    use crate::schema::{Entity, EntityDef, NamingRules};

    #[derive(Default)]
    struct Owner {
        id: i64,
        name: String,
    }

    impl Entity for Owner {
        fn define() -> EntityDef<Self> {
            EntityDef::table("owner")
                .id("id", ColumnType::Long, |o: &Owner| &o.id, |o| &mut o.id)
                .field("name", ColumnType::String, |o| &o.name, |o| &mut o.name)
        }
    }

    #[derive(Default)]
    struct Account {
        id: i64,
        owner_id: i64,
        owner_name: Option<String>,
        balance: i64,
        version: i64,
    }

    impl Entity for Account {
        fn define() -> EntityDef<Self> {
            EntityDef::table("account")
                .id("id", ColumnType::Long, |a: &Account| &a.id, |a| &mut a.id)
                .field("owner_id", ColumnType::Long, |a| &a.owner_id, |a| &mut a.owner_id)
                .references::<Owner>()
                .list_only(
                    "owner_name",
                    ColumnType::String,
                    "owner_id",
                    "name",
                    |a| &a.owner_name,
                    |a| &mut a.owner_name,
                )
                .field("balance", ColumnType::Long, |a| &a.balance, |a| &mut a.balance)
                .version("version", ColumnType::Long, |a| &a.version, |a| &mut a.version)
        }
    }

    #[derive(Default)]
    struct Statement {
        id: i64,
        owner: String,
    }

    impl Entity for Statement {
        fn define() -> EntityDef<Self> {
            EntityDef::view("account_statement")
                .base_table::<Account>("a")
                .base_table::<Owner>("o")
                .id("id", ColumnType::Long, |s: &Statement| &s.id, |s| &mut s.id)
                .field("owner", ColumnType::String, |s| &s.owner, |s| &mut s.owner)
                .from_view("o", "name")
                .view_join("a", "owner_id", "o", "id")
        }
    }

    fn sqlite() -> SqliteDialect {
        SqliteDialect::new(NamingRules::new(true, None))
    }

    #[test]
    fn test_find_statement_on_table_and_view() {
        let d = sqlite();
        let schema = d.registry().resolve::<Account>().unwrap();
        let query = Query::<Account>::new()
            .where_gt("balance", 100i64)
            .order_by("id", OrderDirection::Desc)
            .limit(10)
            .offset(20);

        let stmt = d
            .prepare_find_statement(&schema, query.criteria(), false)
            .unwrap();
        assert_eq!(
            stmt.sql(),
            r#"SELECT "id", "owner_id", "balance", "version" FROM "account" WHERE "balance" > ? ORDER BY "id" DESC LIMIT 10 OFFSET 20"#
        );
        assert_eq!(stmt.results().len(), 4);

        let list = d.prepare_list_statement(&schema, query.criteria()).unwrap();
        assert!(list
            .sql()
            .starts_with(r#"SELECT "id", "owner_id", "owner_name", "balance", "version" FROM "v_account""#));
        assert_eq!(list.results().len(), 5);
    }

    #[test]
    fn test_view_routing_follows_referenced_fields() {
        let d = sqlite();
        let schema = d.registry().resolve::<Account>().unwrap();

        let on_table = Query::<Account>::new().where_eq("balance", 1i64);
        assert!(!d.requires_view(&schema, on_table.criteria()));

        let on_view = Query::<Account>::new().where_eq("owner_name", "Ada");
        assert!(d.requires_view(&schema, on_view.criteria()));

        let ordered = Query::<Account>::new().order_by("owner_name", OrderDirection::Asc);
        assert!(d.requires_view(&schema, ordered.criteria()));
    }

    #[test]
    fn test_versioned_update_and_delete() {
        let d = PostgresDialect::new(NamingRules::new(true, None));
        let schema = d.registry().resolve::<Account>().unwrap();
        let account = Account {
            id: 7,
            owner_id: 3,
            balance: 50,
            version: 2,
            ..Default::default()
        };

        let stmt = d
            .prepare_update_by_id_version_statement(&schema, &account, &SqlValue::BigInt(1))
            .unwrap();
        assert_eq!(
            stmt.sql(),
            r#"UPDATE "account" SET "owner_id" = $1, "balance" = $2, "version" = $3 WHERE "id" = $4 AND "version" = $5"#
        );
        assert_eq!(stmt.params()[2].value, SqlValue::BigInt(2));
        assert_eq!(stmt.params()[4].value, SqlValue::BigInt(1));

        let delete = d
            .prepare_delete_by_id_version_statement(&schema, &SqlValue::BigInt(7), &SqlValue::BigInt(2))
            .unwrap();
        assert_eq!(
            delete.sql(),
            r#"DELETE FROM "account" WHERE "id" = $1 AND "version" = $2"#
        );
    }

    #[test]
    fn test_create_statement_binds_all_true_fields() {
        let d = MySqlDialect::new(NamingRules::new(true, None));
        let schema = d.registry().resolve::<Account>().unwrap();
        let stmt = d
            .prepare_create_statement(&schema, &Account::default())
            .unwrap();
        assert_eq!(
            stmt.sql(),
            "INSERT INTO `account` (`id`, `owner_id`, `balance`, `version`) VALUES (?, ?, ?, ?)"
        );
        assert_eq!(stmt.params().len(), 4);
    }

    #[test]
    fn test_bulk_update_uses_limit_only_where_supported() {
        let mut criteria = Criteria::new();
        criteria
            .add(Restriction::less_than("balance", 0i64))
            .set_limit(5);
        let update = Update::new().set("balance", 0i64);

        let mysql = MySqlDialect::new(NamingRules::new(true, None));
        let schema = mysql.registry().resolve::<Account>().unwrap();
        assert!(mysql.is_direct_update(&schema, &criteria));
        let stmt = mysql
            .prepare_update_statement(&schema, &criteria, &update)
            .unwrap();
        assert_eq!(
            stmt.sql(),
            "UPDATE `account` SET `balance` = ? WHERE `balance` < ? LIMIT 5"
        );

        // MySQL cannot skip rows in UPDATE
        criteria.set_offset(2);
        assert!(!mysql.is_direct_update(&schema, &criteria));
        criteria.set_offset(0);

        let sqlite = sqlite();
        let schema = sqlite.registry().resolve::<Account>().unwrap();
        assert!(!sqlite.is_direct_update(&schema, &criteria));

        criteria.set_limit(0);
        assert!(sqlite.is_direct_update(&schema, &criteria));
    }

    #[test]
    fn test_view_only_entities_reject_mutations() {
        let d = sqlite();
        let schema = d.registry().resolve::<Statement>().unwrap();
        assert!(schema.is_view_only());

        let err = d
            .prepare_create_statement(&schema, &Statement::default())
            .unwrap_err();
        assert!(matches!(err, Error::ViewOnlyMutation { .. }));
        assert!(d
            .prepare_delete_statement(&schema, &Criteria::new())
            .is_err());

        let find = d
            .prepare_find_statement(&schema, &Criteria::new(), false)
            .unwrap();
        assert_eq!(find.sql(), r#"SELECT "id", "owner" FROM "account_statement""#);
    }

    #[test]
    fn test_aggregate_statement_with_groups() {
        let d = sqlite();
        let schema = d.registry().resolve::<Account>().unwrap();
        let mut criteria = Criteria::new();
        criteria.add_group_by("owner_id");

        let stmt = d
            .prepare_aggregate_statement(
                &schema,
                &[AggregateFunction::sum("balance"), AggregateFunction::maximum("balance")],
                &criteria,
                false,
            )
            .unwrap();
        assert_eq!(
            stmt.sql(),
            r#"SELECT "owner_id", COUNT(*), SUM("balance"), MAX("balance") FROM "account" GROUP BY "owner_id""#
        );
        assert_eq!(stmt.results().len(), 4);
        assert_eq!(stmt.results()[2].policy.column_type(), ColumnType::Double);
    }

    #[test]
    fn test_count_and_extremes() {
        let d = sqlite();
        let schema = d.registry().resolve::<Account>().unwrap();
        let criteria = Query::<Account>::new().where_eq("owner_id", 1i64).into_criteria();

        let count = d.prepare_count_statement(&schema, &criteria, false).unwrap();
        assert_eq!(
            count.sql(),
            r#"SELECT COUNT(*) FROM "account" WHERE "owner_id" = ?"#
        );

        let max = d
            .prepare_max_statement(&schema, "balance", &criteria, false)
            .unwrap();
        assert_eq!(
            max.sql(),
            r#"SELECT MAX("balance") FROM "account" WHERE "owner_id" = ?"#
        );
        assert!(d
            .prepare_min_statement(&schema, "missing", &criteria, false)
            .is_err());
    }
}
