//! Portable query model
//!
//! [`Query`] is the typed front end callers build; it wraps an untyped
//! [`Criteria`] so cascades and dialects can work on any entity. [`Update`]
//! lists field assignments for bulk updates and [`AggregateFunction`]
//! describes aggregate columns.

pub mod restriction;

pub use restriction::{Restriction, RestrictionCategory, RestrictionType};

use crate::database::types::SqlValue;
use crate::schema::Entity;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: OrderDirection,
}

/// Untyped query description
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Criteria {
    restrictions: Vec<Restriction>,
    select: Vec<String>,
    distinct: bool,
    order: Vec<OrderBy>,
    group_by: Vec<String>,
    offset: u64,
    limit: u64,
    must_match: bool,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a restriction to the root AND
    pub fn add(&mut self, restriction: Restriction) -> &mut Self {
        self.restrictions.push(restriction);
        self
    }

    /// The root restriction (an AND of everything added)
    pub fn restriction(&self) -> Restriction {
        Restriction::and(self.restrictions.clone())
    }

    pub fn restrictions(&self) -> &[Restriction] {
        &self.restrictions
    }

    pub fn is_restricted(&self) -> bool {
        self.restrictions.iter().any(|r| !r.is_empty())
    }

    /// Fields referenced by restrictions
    pub fn restricted_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        for r in &self.restrictions {
            r.collect_fields(&mut fields);
        }
        fields
    }

    /// Fields referenced by restrictions, ordering and grouping
    pub fn referenced_fields(&self) -> Vec<String> {
        let mut fields = self.restricted_fields();
        for name in self
            .order
            .iter()
            .map(|o| &o.field)
            .chain(self.group_by.iter())
        {
            if !fields.contains(name) {
                fields.push(name.clone());
            }
        }
        fields
    }

    /// Rewrite every single-value leaf on `field`; reports whether any matched
    pub fn replace_all(&mut self, field: &str, value: &SqlValue) -> bool {
        let mut replaced = false;
        for r in self.restrictions.iter_mut() {
            let (new, hit) = r.replace_all(field, value);
            *r = new;
            replaced |= hit;
        }
        replaced
    }

    pub fn select(&self) -> &[String] {
        &self.select
    }

    pub fn set_select(&mut self, fields: Vec<String>) -> &mut Self {
        self.select = fields;
        self
    }

    pub fn add_select(&mut self, field: impl Into<String>) -> &mut Self {
        let field = field.into();
        if !self.select.contains(&field) {
            self.select.push(field);
        }
        self
    }

    pub fn is_selected(&self, field: &str) -> bool {
        self.select.is_empty() || self.select.iter().any(|f| f == field)
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    pub fn set_distinct(&mut self, distinct: bool) -> &mut Self {
        self.distinct = distinct;
        self
    }

    pub fn order(&self) -> &[OrderBy] {
        &self.order
    }

    pub fn add_order(&mut self, field: impl Into<String>, direction: OrderDirection) -> &mut Self {
        self.order.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn group_by(&self) -> &[String] {
        &self.group_by
    }

    pub fn add_group_by(&mut self, field: impl Into<String>) -> &mut Self {
        self.group_by.push(field.into());
        self
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: u64) -> &mut Self {
        self.offset = offset;
        self
    }

    /// Row limit; zero means unlimited
    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn set_limit(&mut self, limit: u64) -> &mut Self {
        self.limit = limit;
        self
    }

    /// True if the query requests a page of the result
    pub fn is_paginated(&self) -> bool {
        self.offset > 0 || self.limit > 0
    }

    pub fn is_must_match(&self) -> bool {
        self.must_match
    }

    pub fn set_must_match(&mut self, must_match: bool) -> &mut Self {
        self.must_match = must_match;
        self
    }

    /// Copy keeping select, distinct, order and grouping but no restrictions or paging
    pub fn copy_no_criteria(&self) -> Self {
        Self {
            restrictions: Vec::new(),
            select: self.select.clone(),
            distinct: self.distinct,
            order: self.order.clone(),
            group_by: self.group_by.clone(),
            offset: 0,
            limit: 0,
            must_match: self.must_match,
        }
    }
}

/// Typed query against entity `T`
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Query<T: Entity> {
    criteria: Criteria,
    #[serde(skip)]
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self::from_criteria(self.criteria.clone())
    }
}

impl<T: Entity> Default for Query<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Query<T> {
    pub fn new() -> Self {
        Self::from_criteria(Criteria::new())
    }

    pub fn from_criteria(criteria: Criteria) -> Self {
        Self {
            criteria,
            _marker: PhantomData,
        }
    }

    pub fn criteria(&self) -> &Criteria {
        &self.criteria
    }

    pub fn criteria_mut(&mut self) -> &mut Criteria {
        &mut self.criteria
    }

    pub fn into_criteria(self) -> Criteria {
        self.criteria
    }

    /// Add an arbitrary restriction
    pub fn filter(mut self, restriction: Restriction) -> Self {
        self.criteria.add(restriction);
        self
    }

    /// Add WHERE field = value condition
    pub fn where_eq<S: Into<String>, V: Into<SqlValue>>(self, field: S, value: V) -> Self {
        self.filter(Restriction::equals(field, value))
    }

    pub fn where_ne<S: Into<String>, V: Into<SqlValue>>(self, field: S, value: V) -> Self {
        self.filter(Restriction::not_equals(field, value))
    }

    pub fn where_lt<S: Into<String>, V: Into<SqlValue>>(self, field: S, value: V) -> Self {
        self.filter(Restriction::less_than(field, value))
    }

    pub fn where_lte<S: Into<String>, V: Into<SqlValue>>(self, field: S, value: V) -> Self {
        self.filter(Restriction::less_than_equal(field, value))
    }

    pub fn where_gt<S: Into<String>, V: Into<SqlValue>>(self, field: S, value: V) -> Self {
        self.filter(Restriction::greater_than(field, value))
    }

    pub fn where_gte<S: Into<String>, V: Into<SqlValue>>(self, field: S, value: V) -> Self {
        self.filter(Restriction::greater_than_equal(field, value))
    }

    pub fn where_like<S: Into<String>, V: Into<SqlValue>>(self, field: S, pattern: V) -> Self {
        self.filter(Restriction::like(field, pattern))
    }

    pub fn where_begins_with<S: Into<String>, V: Into<SqlValue>>(self, field: S, prefix: V) -> Self {
        self.filter(Restriction::begins_with(field, prefix))
    }

    pub fn where_ends_with<S: Into<String>, V: Into<SqlValue>>(self, field: S, suffix: V) -> Self {
        self.filter(Restriction::ends_with(field, suffix))
    }

    pub fn where_iequals<S: Into<String>, V: Into<SqlValue>>(self, field: S, value: V) -> Self {
        self.filter(Restriction::iequals(field, value))
    }

    pub fn where_between<S: Into<String>, V: Into<SqlValue>>(
        self,
        field: S,
        first: V,
        second: V,
    ) -> Self {
        self.filter(Restriction::between(field, first, second))
    }

    pub fn where_not_between<S: Into<String>, V: Into<SqlValue>>(
        self,
        field: S,
        first: V,
        second: V,
    ) -> Self {
        self.filter(Restriction::not_between(field, first, second))
    }

    /// WHERE field IN (values)
    pub fn where_in<S: Into<String>, V: Into<SqlValue>>(self, field: S, values: Vec<V>) -> Self {
        self.filter(Restriction::amongst(field, values))
    }

    pub fn where_not_in<S: Into<String>, V: Into<SqlValue>>(self, field: S, values: Vec<V>) -> Self {
        self.filter(Restriction::not_amongst(field, values))
    }

    pub fn where_null<S: Into<String>>(self, field: S) -> Self {
        self.filter(Restriction::is_null(field))
    }

    pub fn where_not_null<S: Into<String>>(self, field: S) -> Self {
        self.filter(Restriction::is_not_null(field))
    }

    /// Restrict the fields read into records
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.criteria
            .set_select(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn distinct(mut self) -> Self {
        self.criteria.set_distinct(true);
        self
    }

    pub fn order_by<S: Into<String>>(mut self, field: S, direction: OrderDirection) -> Self {
        self.criteria.add_order(field, direction);
        self
    }

    pub fn group_by<S: Into<String>>(mut self, field: S) -> Self {
        self.criteria.add_group_by(field);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.criteria.set_limit(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.criteria.set_offset(offset);
        self
    }

    /// Fail single-result operations that match nothing
    pub fn must_match(mut self) -> Self {
        self.criteria.set_must_match(true);
        self
    }
}

/// Field assignments for bulk updates
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    assignments: IndexMap<String, SqlValue>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<S: Into<String>, V: Into<SqlValue>>(mut self, field: S, value: V) -> Self {
        self.assignments.insert(field.into(), value.into());
        self
    }

    pub fn assignments(&self) -> impl Iterator<Item = (&String, &SqlValue)> {
        self.assignments.iter()
    }

    pub fn fields(&self) -> Vec<String> {
        self.assignments.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateType {
    Count,
    Sum,
    Average,
    Maximum,
    Minimum,
}

impl AggregateType {
    pub fn sql_function(&self) -> &'static str {
        match self {
            AggregateType::Count => "COUNT",
            AggregateType::Sum => "SUM",
            AggregateType::Average => "AVG",
            AggregateType::Maximum => "MAX",
            AggregateType::Minimum => "MIN",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateFunction {
    pub kind: AggregateType,
    pub field: String,
}

impl AggregateFunction {
    pub fn new(kind: AggregateType, field: impl Into<String>) -> Self {
        Self {
            kind,
            field: field.into(),
        }
    }

    pub fn sum(field: impl Into<String>) -> Self {
        Self::new(AggregateType::Sum, field)
    }

    pub fn average(field: impl Into<String>) -> Self {
        Self::new(AggregateType::Average, field)
    }

    pub fn count(field: impl Into<String>) -> Self {
        Self::new(AggregateType::Count, field)
    }

    pub fn maximum(field: impl Into<String>) -> Self {
        Self::new(AggregateType::Maximum, field)
    }

    pub fn minimum(field: impl Into<String>) -> Self {
        Self::new(AggregateType::Minimum, field)
    }
}

/// Result of one aggregate function over the matched rows
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub kind: AggregateType,
    pub field: String,
    /// Number of rows the aggregate ran over
    pub count: u64,
    /// Aggregate value; NULL results are reported as zero
    pub value: SqlValue,
}

/// Aggregates for one group of a grouped aggregate query
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupAggregation {
    /// Values of the group-by fields, in group-by order
    pub group: Vec<SqlValue>,
    pub aggregations: Vec<Aggregation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_referenced_fields_include_order_and_group() {
        let mut criteria = Criteria::new();
        criteria
            .add(Restriction::equals("status", "OPEN"))
            .add_order("opened_on", OrderDirection::Desc)
            .add_group_by("status");

        assert_eq!(criteria.restricted_fields(), vec!["status"]);
        assert_eq!(criteria.referenced_fields(), vec!["status", "opened_on"]);
    }

    #[test]
    fn test_copy_no_criteria_drops_restrictions_and_paging() {
        let mut criteria = Criteria::new();
        criteria
            .add(Restriction::equals("a", 1))
            .add_select("a")
            .set_offset(5)
            .set_limit(10);

        let copy = criteria.copy_no_criteria();
        assert!(!copy.is_restricted());
        assert!(!copy.is_paginated());
        assert_eq!(copy.select(), ["a".to_string()]);
    }

    #[test]
    fn test_replace_all_in_criteria() {
        let mut criteria = Criteria::new();
        criteria.add(Restriction::and(vec![Restriction::equals("owner", "x")]));
        assert!(criteria.replace_all("owner", &SqlValue::from("y")));
        assert_eq!(
            criteria.restriction(),
            Restriction::and(vec![Restriction::and(vec![Restriction::equals("owner", "y")])])
        );
    }

    #[test]
    fn test_update_keeps_assignment_order() {
        let update = Update::new().set("b", 2).set("a", 1);
        assert_eq!(update.fields(), vec!["b", "a"]);
    }
}
