//! DDL generation shared by the dialects

use super::SqlDialect;
use crate::error::{Error, Result};
use crate::schema::{EntitySchema, FieldSchema, ForeignKeySchema};
use std::collections::HashMap;

/// Name of a constraint or index, prefixed with its table
pub fn object_name<D: SqlDialect + ?Sized>(d: &D, schema: &EntitySchema, name: &str) -> String {
    d.registry()
        .rules()
        .preferred(&format!("{}_{}", schema.table(), name))
}

/// Quoted, comma separated columns of the named fields
pub fn column_list<D: SqlDialect + ?Sized>(
    d: &D,
    schema: &EntitySchema,
    fields: &[String],
) -> Result<String> {
    let columns = fields
        .iter()
        .map(|name| {
            schema
                .field(name)
                .map(|f| d.quote_identifier(f.preferred_column()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(columns.join(", "))
}

pub fn column_definition<D: SqlDialect + ?Sized>(d: &D, field: &FieldSchema) -> Result<String> {
    let policy = d.sql_type_policy(field.column_type())?;
    let mut sql = d.quote_identifier(field.preferred_column());
    sql.push(' ');
    policy.append_type_sql(&mut sql, field.length(), field.precision(), field.scale());
    if !field.is_nullable() {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = field.default_value() {
        policy.append_default_sql(&mut sql, default);
    }
    Ok(sql)
}

pub fn foreign_key_clause<D: SqlDialect + ?Sized>(
    d: &D,
    schema: &EntitySchema,
    fk: &ForeignKeySchema,
) -> Result<String> {
    let field = schema.field(&fk.field)?;
    let target = fk.target.resolve(d.registry())?;
    Ok(format!(
        "FOREIGN KEY ({}) REFERENCES {} ({})",
        d.quote_identifier(field.preferred_column()),
        d.quote_identifier(target.schema_table()),
        d.quote_identifier(target.id_field().preferred_column())
    ))
}

pub fn create_table<D: SqlDialect + ?Sized>(d: &D, schema: &EntitySchema) -> Result<Vec<String>> {
    if schema.is_view_only() {
        return Err(Error::view_only(schema.name(), "create table"));
    }

    let mut elements = schema
        .fields()
        .iter()
        .map(|field| d.column_definition_sql(field))
        .collect::<Result<Vec<_>>>()?;
    elements.push(format!(
        "PRIMARY KEY ({})",
        d.quote_identifier(schema.id_field().preferred_column())
    ));
    if d.inline_foreign_keys() {
        for fk in schema.foreign_keys() {
            elements.push(foreign_key_clause(d, schema, fk)?);
        }
    }

    let mut statements = vec![format!(
        "CREATE TABLE {} ({})",
        d.quote_identifier(schema.schema_table()),
        elements.join(", ")
    )];
    for constraint in schema.unique_constraints() {
        statements.push(d.add_unique_constraint_sql(schema, constraint)?);
    }
    for index in schema.indexes() {
        statements.push(d.create_index_sql(schema, index)?);
    }
    if !d.inline_foreign_keys() {
        for fk in schema.foreign_keys() {
            statements.push(d.add_foreign_key_sql(schema, fk)?);
        }
    }
    Ok(statements)
}

pub fn create_view<D: SqlDialect + ?Sized>(d: &D, schema: &EntitySchema) -> Result<Option<String>> {
    if schema.is_view_only() {
        return create_base_table_view(d, schema).map(Some);
    }
    if !schema.is_viewable() {
        return Ok(None);
    }

    let mut joins: Vec<(String, String)> = Vec::new();
    let mut aliases: HashMap<String, String> = HashMap::new();
    let mut columns = Vec::with_capacity(schema.list_fields().len());

    for field in schema.list_fields() {
        let Some(source) = field.list_only_source() else {
            columns.push(format!(
                "t0.{} AS {}",
                d.quote_identifier(field.preferred_column()),
                d.quote_identifier(field.preferred_column())
            ));
            continue;
        };

        let fk_field = schema.field(&source.foreign_key_field)?;
        let target = fk_field
            .foreign_entity()
            .ok_or_else(|| {
                Error::invalid_schema(
                    schema.name(),
                    format!("field '{}' is not a foreign key", fk_field.name()),
                )
            })?
            .resolve(d.registry())?;
        let foreign = target.field(&source.foreign_field)?;

        let alias = match aliases.get(fk_field.name()) {
            Some(alias) => alias.clone(),
            None => {
                let alias = format!("t{}", aliases.len() + 1);
                aliases.insert(fk_field.name().to_string(), alias.clone());
                joins.push((
                    alias.clone(),
                    format!(
                        " LEFT JOIN {} {} ON t0.{} = {}.{}",
                        d.quote_identifier(target.schema_table()),
                        alias,
                        d.quote_identifier(fk_field.preferred_column()),
                        alias,
                        d.quote_identifier(target.id_field().preferred_column())
                    ),
                ));
                alias
            }
        };
        columns.push(format!(
            "{}.{} AS {}",
            alias,
            d.quote_identifier(foreign.preferred_column()),
            d.quote_identifier(field.preferred_column())
        ));
    }

    let mut sql = format!(
        "CREATE VIEW {} AS SELECT {} FROM {} t0",
        d.quote_identifier(schema.schema_view()),
        columns.join(", "),
        d.quote_identifier(schema.schema_table())
    );
    for (_, join) in joins {
        sql.push_str(&join);
    }
    Ok(Some(sql))
}

fn create_base_table_view<D: SqlDialect + ?Sized>(d: &D, schema: &EntitySchema) -> Result<String> {
    let mut bases = HashMap::new();
    let mut tables = Vec::new();
    for base in schema.view_base_tables() {
        let base_schema = base.entity.resolve(d.registry())?;
        tables.push(format!(
            "{} {}",
            d.quote_identifier(base_schema.schema_table()),
            d.quote_identifier(&base.alias)
        ));
        bases.insert(base.alias.clone(), base_schema);
    }

    let column_of = |alias: &str, field: &str| -> Result<String> {
        let base = bases.get(alias).ok_or_else(|| {
            Error::invalid_schema(schema.name(), format!("unknown view table alias '{}'", alias))
        })?;
        Ok(format!(
            "{}.{}",
            d.quote_identifier(alias),
            d.quote_identifier(base.field(field)?.preferred_column())
        ))
    };

    let columns = schema
        .fields()
        .iter()
        .map(|field| {
            let source = field.view_source().ok_or_else(|| {
                Error::invalid_schema(
                    schema.name(),
                    format!("view field '{}' has no base table source", field.name()),
                )
            })?;
            Ok(format!(
                "{} AS {}",
                column_of(&source.table_alias, &source.field)?,
                d.quote_identifier(field.preferred_column())
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut sql = format!(
        "CREATE VIEW {} AS SELECT {} FROM {}",
        d.quote_identifier(schema.schema_view()),
        columns.join(", "),
        tables.join(", ")
    );

    let conditions = schema
        .view_restrictions()
        .iter()
        .map(|r| {
            Ok(format!(
                "{} = {}",
                column_of(&r.left_alias, &r.left_field)?,
                column_of(&r.right_alias, &r.right_field)?
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    Ok(sql)
}

/// Backfill NULLs with the default before a column becomes NOT NULL
pub fn backfill_default<D: SqlDialect + ?Sized>(
    d: &D,
    schema: &EntitySchema,
    field: &FieldSchema,
) -> Option<String> {
    match (field.is_nullable(), field.default_value()) {
        (false, Some(default)) => Some(format!(
            "UPDATE {} SET {} = {} WHERE {} IS NULL",
            d.quote_identifier(schema.schema_table()),
            d.quote_identifier(field.preferred_column()),
            default,
            d.quote_identifier(field.preferred_column())
        )),
        _ => None,
    }
}

pub fn alter_column<D: SqlDialect + ?Sized>(
    d: &D,
    schema: &EntitySchema,
    field: &FieldSchema,
) -> Result<Vec<String>> {
    let table = d.quote_identifier(schema.schema_table());
    let column = d.quote_identifier(field.preferred_column());
    let policy = d.sql_type_policy(field.column_type())?;

    let mut type_sql = String::new();
    policy.append_type_sql(&mut type_sql, field.length(), field.precision(), field.scale());

    let mut statements = vec![format!(
        "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
        table, column, type_sql
    )];
    match field.default_value() {
        Some(default) => statements.push(format!(
            "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
            table, column, default
        )),
        None => statements.push(format!(
            "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT",
            table, column
        )),
    }
    if field.is_nullable() {
        statements.push(format!(
            "ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL",
            table, column
        ));
    } else {
        statements.extend(backfill_default(d, schema, field));
        statements.push(format!(
            "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
            table, column
        ));
    }
    Ok(statements)
}

#[cfg(test)]
mod tests {
    use crate::database::types::ColumnType;
    use crate::dialects::{MySqlDialect, PostgresDialect, SqlDialect, SqliteDialect};
    use crate::error::Error;
    use crate::schema::{Entity, EntityDef, NamingRules};

    #[derive(Default)]
    struct Branch {
        id: i64,
        code: String,
    }

    impl Entity for Branch {
        fn define() -> EntityDef<Self> {
            EntityDef::table("branch")
                .id("id", ColumnType::Long, |b: &Branch| &b.id, |b| &mut b.id)
                .field("code", ColumnType::Char, |b| &b.code, |b| &mut b.code)
                .length(4)
                .unique("code", &["code"])
        }
    }

    #[derive(Default)]
    struct Teller {
        id: i64,
        branch_id: i64,
        branch_code: Option<String>,
        active: bool,
    }

    impl Entity for Teller {
        fn define() -> EntityDef<Self> {
            EntityDef::table("teller")
                .id("id", ColumnType::Long, |t: &Teller| &t.id, |t| &mut t.id)
                .field("branch_id", ColumnType::Long, |t| &t.branch_id, |t| &mut t.branch_id)
                .references::<Branch>()
                .list_only(
                    "branch_code",
                    ColumnType::Char,
                    "branch_id",
                    "code",
                    |t| &t.branch_code,
                    |t| &mut t.branch_code,
                )
                .field("active", ColumnType::Boolean, |t| &t.active, |t| &mut t.active)
                .default_value("1")
                .index("branch", &["branch_id"])
        }
    }

    #[test]
    fn test_sqlite_create_table_inlines_foreign_keys() {
        let d = SqliteDialect::new(NamingRules::new(true, None));
        let schema = d.registry().resolve::<Teller>().unwrap();
        let statements = d.create_table_sql(&schema).unwrap();

        assert_eq!(
            statements[0],
            r#"CREATE TABLE "teller" ("id" BIGINT NOT NULL, "branch_id" BIGINT NOT NULL, "active" BOOLEAN NOT NULL DEFAULT 1, PRIMARY KEY ("id"), FOREIGN KEY ("branch_id") REFERENCES "branch" ("id"))"#
        );
        assert_eq!(
            statements[1],
            r#"CREATE INDEX "teller_branch" ON "teller" ("branch_id")"#
        );
        assert_eq!(statements.len(), 2);
    }

    #[test]
    fn test_postgres_constraints_are_separate_statements() {
        let d = PostgresDialect::new(NamingRules::new(true, None));
        let branch = d.registry().resolve::<Branch>().unwrap();
        let statements = d.create_table_sql(&branch).unwrap();
        assert_eq!(
            statements,
            vec![
                r#"CREATE TABLE "branch" ("id" BIGINT NOT NULL, "code" CHAR(4) NOT NULL, PRIMARY KEY ("id"))"#.to_string(),
                r#"ALTER TABLE "branch" ADD CONSTRAINT "branch_code" UNIQUE ("code")"#.to_string(),
            ]
        );

        let teller = d.registry().resolve::<Teller>().unwrap();
        let statements = d.create_table_sql(&teller).unwrap();
        assert_eq!(
            statements.last().unwrap(),
            r#"ALTER TABLE "teller" ADD CONSTRAINT "teller_branch_id_fk" FOREIGN KEY ("branch_id") REFERENCES "branch" ("id")"#
        );
    }

    #[test]
    fn test_joined_view_for_list_only_fields() {
        let d = SqliteDialect::new(NamingRules::new(true, None));
        let schema = d.registry().resolve::<Teller>().unwrap();
        let view = d.create_view_sql(&schema).unwrap().unwrap();
        assert_eq!(
            view,
            r#"CREATE VIEW "v_teller" AS SELECT t0."id" AS "id", t0."branch_id" AS "branch_id", t1."code" AS "branch_code", t0."active" AS "active" FROM "teller" t0 LEFT JOIN "branch" t1 ON t0."branch_id" = t1."id""#
        );

        let branch = d.registry().resolve::<Branch>().unwrap();
        assert!(d.create_view_sql(&branch).unwrap().is_none());
        assert!(d.drop_view_sql(&branch).unwrap().is_none());
    }

    #[test]
    fn test_mysql_structural_alterations() {
        let d = MySqlDialect::new(NamingRules::new(true, None));
        let schema = d.registry().resolve::<Teller>().unwrap();
        let active = schema.field("active").unwrap();

        assert_eq!(
            d.rename_column_sql(&schema, "enabled", active).unwrap(),
            "ALTER TABLE `teller` CHANGE COLUMN `enabled` `active` TINYINT(1) NOT NULL DEFAULT 1"
        );
        let alter = d.alter_column_sql(&schema, active).unwrap();
        assert_eq!(
            alter,
            vec![
                "UPDATE `teller` SET `active` = 1 WHERE `active` IS NULL".to_string(),
                "ALTER TABLE `teller` MODIFY `active` TINYINT(1) NOT NULL DEFAULT 1".to_string(),
            ]
        );

        let branch = d.registry().resolve::<Branch>().unwrap();
        assert_eq!(
            d.drop_unique_constraint_sql(&branch, &branch.unique_constraints()[0])
                .unwrap(),
            "ALTER TABLE `branch` DROP INDEX `branch_code`"
        );
    }

    #[test]
    fn test_sqlite_reports_unsupported_alterations() {
        let d = SqliteDialect::new(NamingRules::new(true, None));
        let schema = d.registry().resolve::<Teller>().unwrap();
        let active = schema.field("active").unwrap();

        assert!(matches!(
            d.alter_column_sql(&schema, active).unwrap_err(),
            Error::UnsupportedFeature { .. }
        ));
        assert!(d.alter_column_to_null_sql(&schema, active).is_err());
        assert!(d
            .add_foreign_key_sql(&schema, &schema.foreign_keys()[0])
            .is_err());
        assert_eq!(
            d.drop_column_sql(&schema, "active").unwrap(),
            r#"ALTER TABLE "teller" DROP COLUMN "active""#
        );
    }

    #[test]
    fn test_postgres_alter_column_backfills_defaults() {
        let d = PostgresDialect::new(NamingRules::new(true, None));
        let schema = d.registry().resolve::<Teller>().unwrap();
        let statements = d
            .alter_column_sql(&schema, schema.field("active").unwrap())
            .unwrap();
        assert_eq!(
            statements,
            vec![
                r#"ALTER TABLE "teller" ALTER COLUMN "active" TYPE BOOLEAN"#.to_string(),
                r#"ALTER TABLE "teller" ALTER COLUMN "active" SET DEFAULT 1"#.to_string(),
                r#"UPDATE "teller" SET "active" = 1 WHERE "active" IS NULL"#.to_string(),
                r#"ALTER TABLE "teller" ALTER COLUMN "active" SET NOT NULL"#.to_string(),
            ]
        );
    }
}
