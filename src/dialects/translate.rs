//! Restriction translation
//!
//! Every [`RestrictionType`] maps to a [`CriteriaPolicy`] that renders one
//! restriction as a WHERE fragment and appends its parameters. Dialects build
//! the map at construction and may replace individual entries.

use super::statement::SqlParameter;
use super::DialectCore;
use crate::criteria::{Criteria, Restriction, RestrictionType};
use crate::database::types::{ColumnType, SqlValue};
use crate::error::{Error, Result};
use crate::schema::{EntitySchema, FieldSchema};
use std::collections::HashMap;
use std::sync::Arc;

/// Renders one kind of restriction
pub trait CriteriaPolicy: Send + Sync {
    /// Returns `None` when the restriction adds no clause (empty compounds)
    fn translate(
        &self,
        ctx: &mut TranslationContext<'_>,
        restriction: &Restriction,
    ) -> Result<Option<String>>;
}

pub type CriteriaPolicyMap = HashMap<RestrictionType, Arc<dyn CriteriaPolicy>>;

/// State shared by the policies while one criteria tree is translated
pub struct TranslationContext<'a> {
    core: &'a DialectCore,
    schema: &'a EntitySchema,
    use_view: bool,
    params: &'a mut Vec<SqlParameter>,
}

impl<'a> TranslationContext<'a> {
    pub fn new(
        core: &'a DialectCore,
        schema: &'a EntitySchema,
        use_view: bool,
        params: &'a mut Vec<SqlParameter>,
    ) -> Self {
        Self {
            core,
            schema,
            use_view,
            params,
        }
    }

    pub fn schema(&self) -> &EntitySchema {
        self.schema
    }

    pub fn max_clause_values(&self) -> usize {
        self.core.max_clause_values()
    }

    /// Resolve a restricted field; list-only fields only resolve against the view
    pub fn field(&self, name: &str) -> Result<Arc<FieldSchema>> {
        let field = if self.use_view {
            self.schema.list_field(name)?
        } else {
            self.schema.field(name)?
        };
        Ok(field.clone())
    }

    pub fn column(&self, field: &FieldSchema) -> String {
        self.core.quote_identifier(field.preferred_column())
    }

    /// Bind a value through the field's transformer and type policy
    pub fn bind(&mut self, field: &FieldSchema, value: &SqlValue) -> Result<String> {
        let stored = field.to_stored(value.clone())?;
        self.bind_as(field.column_type(), stored)
    }

    /// Bind a value with the policy of an explicit column type
    pub fn bind_as(&mut self, column_type: ColumnType, value: SqlValue) -> Result<String> {
        let policy = self.core.sql_type_policy(column_type)?;
        let index = self.params.len() + 1;
        self.params.push(SqlParameter {
            index,
            policy,
            value,
        });
        Ok(self.core.placeholder(index))
    }

    pub fn translate(&mut self, restriction: &Restriction) -> Result<Option<String>> {
        let policy = self.core.criteria_policy(restriction.kind())?;
        policy.translate(self, restriction)
    }
}

/// Translate the root restriction of `criteria` into a WHERE body
pub fn translate_criteria(
    core: &DialectCore,
    schema: &EntitySchema,
    criteria: &Criteria,
    use_view: bool,
    params: &mut Vec<SqlParameter>,
) -> Result<Option<String>> {
    let mut ctx = TranslationContext::new(core, schema, use_view, params);
    ctx.translate(&criteria.restriction())
}

fn mismatch(policy: &str, restriction: &Restriction) -> Error {
    Error::invalid_query(format!(
        "{} policy cannot translate {:?} restriction",
        policy,
        restriction.kind()
    ))
}

/// IS NULL / IS NOT NULL
#[derive(Debug, Default)]
pub struct ZeroValuePolicy;

impl CriteriaPolicy for ZeroValuePolicy {
    fn translate(
        &self,
        ctx: &mut TranslationContext<'_>,
        restriction: &Restriction,
    ) -> Result<Option<String>> {
        let Restriction::Zero { kind, field } = restriction else {
            return Err(mismatch("zero-value", restriction));
        };
        let field = ctx.field(field)?;
        let op = match kind {
            RestrictionType::IsNotNull => "IS NOT NULL",
            _ => "IS NULL",
        };
        Ok(Some(format!("{} {}", ctx.column(&field), op)))
    }
}

/// Comparison, LIKE family and case-insensitive equality
#[derive(Debug, Default)]
pub struct SingleValuePolicy;

impl SingleValuePolicy {
    fn pattern(value: &SqlValue, kind: RestrictionType) -> SqlValue {
        let text = match value {
            SqlValue::String(s) => s.clone(),
            other => other.to_string(),
        };
        match kind {
            RestrictionType::BeginsWith => SqlValue::String(format!("{}%", text)),
            RestrictionType::EndsWith => SqlValue::String(format!("%{}", text)),
            _ => SqlValue::String(text),
        }
    }
}

impl CriteriaPolicy for SingleValuePolicy {
    fn translate(
        &self,
        ctx: &mut TranslationContext<'_>,
        restriction: &Restriction,
    ) -> Result<Option<String>> {
        let Restriction::Single { kind, field, value } = restriction else {
            return Err(mismatch("single-value", restriction));
        };
        let field = ctx.field(field)?;
        let column = ctx.column(&field);

        if value.is_null() {
            match kind {
                RestrictionType::Equals => return Ok(Some(format!("{} IS NULL", column))),
                RestrictionType::NotEquals => return Ok(Some(format!("{} IS NOT NULL", column))),
                _ => {}
            }
        }

        let clause = match kind {
            RestrictionType::Like
            | RestrictionType::NotLike
            | RestrictionType::BeginsWith
            | RestrictionType::EndsWith => {
                let stored = field.to_stored(value.clone())?;
                let placeholder = ctx.bind_as(ColumnType::String, Self::pattern(&stored, *kind))?;
                let op = if *kind == RestrictionType::NotLike {
                    "NOT LIKE"
                } else {
                    "LIKE"
                };
                format!("{} {} {}", column, op, placeholder)
            }
            RestrictionType::IEquals => {
                let stored = field.to_stored(value.clone())?;
                let placeholder = ctx.bind_as(ColumnType::String, Self::pattern(&stored, *kind))?;
                format!("UPPER({}) = UPPER({})", column, placeholder)
            }
            other => {
                let op = match other {
                    RestrictionType::Equals => "=",
                    RestrictionType::NotEquals => "<>",
                    RestrictionType::LessThan => "<",
                    RestrictionType::LessThanEqual => "<=",
                    RestrictionType::GreaterThan => ">",
                    RestrictionType::GreaterThanEqual => ">=",
                    _ => return Err(mismatch("single-value", restriction)),
                };
                let placeholder = ctx.bind(&field, value)?;
                format!("{} {} {}", column, op, placeholder)
            }
        };
        Ok(Some(clause))
    }
}

/// BETWEEN / NOT BETWEEN
#[derive(Debug, Default)]
pub struct DoubleValuePolicy;

impl CriteriaPolicy for DoubleValuePolicy {
    fn translate(
        &self,
        ctx: &mut TranslationContext<'_>,
        restriction: &Restriction,
    ) -> Result<Option<String>> {
        let Restriction::Double {
            kind,
            field,
            first,
            second,
        } = restriction
        else {
            return Err(mismatch("double-value", restriction));
        };
        let field = ctx.field(field)?;
        let column = ctx.column(&field);
        let low = ctx.bind(&field, first)?;
        let high = ctx.bind(&field, second)?;
        let op = if *kind == RestrictionType::NotBetween {
            "NOT BETWEEN"
        } else {
            "BETWEEN"
        };
        Ok(Some(format!("{} {} {} AND {}", column, op, low, high)))
    }
}

/// IN / NOT IN, bounded by the dialect's maximum clause values
#[derive(Debug, Default)]
pub struct CollectionValuePolicy;

impl CriteriaPolicy for CollectionValuePolicy {
    fn translate(
        &self,
        ctx: &mut TranslationContext<'_>,
        restriction: &Restriction,
    ) -> Result<Option<String>> {
        let Restriction::Collection {
            kind,
            field: name,
            values,
        } = restriction
        else {
            return Err(mismatch("collection", restriction));
        };
        let field = ctx.field(name)?;
        let negated = *kind == RestrictionType::NotAmongst;

        if values.is_empty() {
            return Ok(Some(if negated { "1 = 1" } else { "1 = 0" }.to_string()));
        }

        let max = ctx.max_clause_values();
        if max > 0 && values.len() > max {
            return Err(Error::TooManyClauseValues {
                entity: ctx.schema().name().to_string(),
                field: name.clone(),
                count: values.len(),
                max,
            });
        }

        let column = ctx.column(&field);
        let placeholders = values
            .iter()
            .map(|v| ctx.bind(&field, v))
            .collect::<Result<Vec<_>>>()?;
        let op = if negated { "NOT IN" } else { "IN" };
        Ok(Some(format!("{} {} ({})", column, op, placeholders.join(", "))))
    }
}

/// AND / OR over nested restrictions
#[derive(Debug, Default)]
pub struct CompoundPolicy;

impl CriteriaPolicy for CompoundPolicy {
    fn translate(
        &self,
        ctx: &mut TranslationContext<'_>,
        restriction: &Restriction,
    ) -> Result<Option<String>> {
        let Restriction::Compound { kind, restrictions } = restriction else {
            return Err(mismatch("compound", restriction));
        };

        let mut clauses = Vec::with_capacity(restrictions.len());
        for nested in restrictions {
            if let Some(clause) = ctx.translate(nested)? {
                clauses.push(clause);
            }
        }

        let joiner = if *kind == RestrictionType::Or {
            " OR "
        } else {
            " AND "
        };
        Ok(match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(format!("({})", clauses.join(joiner))),
        })
    }
}

/// The policy set shared by all built-in dialects
pub fn default_criteria_policies() -> CriteriaPolicyMap {
    let zero: Arc<dyn CriteriaPolicy> = Arc::new(ZeroValuePolicy);
    let single: Arc<dyn CriteriaPolicy> = Arc::new(SingleValuePolicy);
    let double: Arc<dyn CriteriaPolicy> = Arc::new(DoubleValuePolicy);
    let collection: Arc<dyn CriteriaPolicy> = Arc::new(CollectionValuePolicy);
    let compound: Arc<dyn CriteriaPolicy> = Arc::new(CompoundPolicy);

    let mut policies = CriteriaPolicyMap::new();
    for kind in [RestrictionType::IsNull, RestrictionType::IsNotNull] {
        policies.insert(kind, zero.clone());
    }
    for kind in [
        RestrictionType::Equals,
        RestrictionType::NotEquals,
        RestrictionType::LessThan,
        RestrictionType::LessThanEqual,
        RestrictionType::GreaterThan,
        RestrictionType::GreaterThanEqual,
        RestrictionType::Like,
        RestrictionType::NotLike,
        RestrictionType::BeginsWith,
        RestrictionType::EndsWith,
        RestrictionType::IEquals,
    ] {
        policies.insert(kind, single.clone());
    }
    for kind in [RestrictionType::Between, RestrictionType::NotBetween] {
        policies.insert(kind, double.clone());
    }
    for kind in [RestrictionType::Amongst, RestrictionType::NotAmongst] {
        policies.insert(kind, collection.clone());
    }
    for kind in [RestrictionType::And, RestrictionType::Or] {
        policies.insert(kind, compound.clone());
    }
    policies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialects::{PostgresDialect, SqlDialect, SqliteDialect};
    use crate::schema::{Entity, EntityDef, NamingRules};

    #[derive(Default)]
    struct Customer {
        id: i64,
        name: String,
        age: i32,
        city_id: i64,
        city_name: Option<String>,
    }

    #[derive(Default)]
    struct City {
        id: i64,
        name: String,
    }

    impl Entity for City {
        fn define() -> EntityDef<Self> {
            EntityDef::table("city")
                .id("id", ColumnType::Long, |c: &City| &c.id, |c| &mut c.id)
                .field("name", ColumnType::String, |c| &c.name, |c| &mut c.name)
        }
    }

    impl Entity for Customer {
        fn define() -> EntityDef<Self> {
            EntityDef::table("customer")
                .id("id", ColumnType::Long, |c: &Customer| &c.id, |c| &mut c.id)
                .field("name", ColumnType::String, |c| &c.name, |c| &mut c.name)
                .field("age", ColumnType::Integer, |c| &c.age, |c| &mut c.age)
                .field("city_id", ColumnType::Long, |c| &c.city_id, |c| &mut c.city_id)
                .references::<City>()
                .list_only(
                    "city_name",
                    ColumnType::String,
                    "city_id",
                    "name",
                    |c| &c.city_name,
                    |c| &mut c.city_name,
                )
        }
    }

    fn translate(
        dialect: &dyn SqlDialect,
        criteria: &Criteria,
        use_view: bool,
    ) -> Result<(Option<String>, Vec<SqlParameter>)> {
        let schema = dialect.registry().resolve::<Customer>()?;
        let mut params = Vec::new();
        let clause = translate_criteria(dialect.core(), &schema, criteria, use_view, &mut params)?;
        Ok((clause, params))
    }

    fn sqlite() -> SqliteDialect {
        SqliteDialect::new(NamingRules::new(true, None))
    }

    #[test]
    fn test_single_and_range_restrictions() {
        let mut criteria = Criteria::new();
        criteria
            .add(Restriction::equals("name", "Ada"))
            .add(Restriction::between("age", 18i32, 65i32));

        let (clause, params) = translate(&sqlite(), &criteria, false).unwrap();
        assert_eq!(
            clause.unwrap(),
            r#"("name" = ? AND "age" BETWEEN ? AND ?)"#
        );
        assert_eq!(params.len(), 3);
        assert_eq!(params[1].index, 2);
        assert_eq!(params[2].value, SqlValue::Int(65));
    }

    #[test]
    fn test_postgres_placeholders_are_numbered_across_compounds() {
        let dialect = PostgresDialect::new(NamingRules::new(true, None));
        let mut criteria = Criteria::new();
        criteria
            .add(Restriction::or(vec![
                Restriction::equals("name", "a"),
                Restriction::equals("name", "b"),
            ]))
            .add(Restriction::amongst("age", vec![1i32, 2, 3]));

        let (clause, params) = translate(&dialect, &criteria, false).unwrap();
        assert_eq!(
            clause.unwrap(),
            r#"(("name" = $1 OR "name" = $2) AND "age" IN ($3, $4, $5))"#
        );
        assert_eq!(params.len(), 5);
    }

    #[test]
    fn test_like_family_builds_patterns() {
        let mut criteria = Criteria::new();
        criteria
            .add(Restriction::begins_with("name", "Ad"))
            .add(Restriction::ends_with("name", "da"))
            .add(Restriction::iequals("name", "ADA"));

        let (clause, params) = translate(&sqlite(), &criteria, false).unwrap();
        assert_eq!(
            clause.unwrap(),
            r#"("name" LIKE ? AND "name" LIKE ? AND UPPER("name") = UPPER(?))"#
        );
        assert_eq!(params[0].value, SqlValue::String("Ad%".into()));
        assert_eq!(params[1].value, SqlValue::String("%da".into()));
    }

    #[test]
    fn test_empty_collections_are_constant_clauses() {
        let mut criteria = Criteria::new();
        criteria
            .add(Restriction::amongst::<i64>("id", vec![]))
            .add(Restriction::not_amongst::<i64>("id", vec![]));

        let (clause, params) = translate(&sqlite(), &criteria, false).unwrap();
        assert_eq!(clause.unwrap(), "(1 = 0 AND 1 = 1)");
        assert!(params.is_empty());
    }

    #[test]
    fn test_collection_over_max_values_fails() {
        let values: Vec<i64> = (0..1000).collect();
        let mut criteria = Criteria::new();
        criteria.add(Restriction::amongst("id", values));

        let err = translate(&sqlite(), &criteria, false).unwrap_err();
        match err {
            Error::TooManyClauseValues { count, max, .. } => {
                assert_eq!(count, 1000);
                assert_eq!(max, 999);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_compound_adds_no_clause() {
        let mut criteria = Criteria::new();
        criteria.add(Restriction::and(vec![Restriction::or(vec![])]));
        let (clause, _) = translate(&sqlite(), &criteria, false).unwrap();
        assert!(clause.is_none());
    }

    #[test]
    fn test_unknown_and_list_only_fields() {
        let mut unknown = Criteria::new();
        unknown.add(Restriction::equals("nickname", "x"));
        assert!(matches!(
            translate(&sqlite(), &unknown, true).unwrap_err(),
            Error::FieldNotFound { .. }
        ));

        let mut joined = Criteria::new();
        joined.add(Restriction::equals("city_name", "Oslo"));
        assert!(translate(&sqlite(), &joined, false).is_err());
        let (clause, _) = translate(&sqlite(), &joined, true).unwrap();
        assert_eq!(clause.unwrap(), r#""city_name" = ?"#);
    }

    #[test]
    fn test_null_equality_and_null_checks() {
        let mut criteria = Criteria::new();
        criteria
            .add(Restriction::equals("name", SqlValue::Null))
            .add(Restriction::is_not_null("age"));
        let (clause, params) = translate(&sqlite(), &criteria, false).unwrap();
        assert_eq!(clause.unwrap(), r#"("name" IS NULL AND "age" IS NOT NULL)"#);
        assert!(params.is_empty());
    }
}
