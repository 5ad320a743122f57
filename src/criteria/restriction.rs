//! Portable restriction trees
//!
//! A [`Restriction`] is an immutable predicate over entity fields. Leaves carry
//! zero, one, two or many values; compounds combine children with AND or OR.
//! Rewrites never mutate a tree in place, they return a new one.

use crate::database::types::SqlValue;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestrictionType {
    Equals,
    NotEquals,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
    Like,
    NotLike,
    BeginsWith,
    EndsWith,
    /// Case-insensitive equality
    IEquals,
    Between,
    NotBetween,
    Amongst,
    NotAmongst,
    IsNull,
    IsNotNull,
    And,
    Or,
}

/// Shape of a restriction, used to pick its translation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestrictionCategory {
    Zero,
    Single,
    Double,
    Collection,
    Compound,
}

impl RestrictionType {
    pub fn category(&self) -> RestrictionCategory {
        match self {
            RestrictionType::IsNull | RestrictionType::IsNotNull => RestrictionCategory::Zero,
            RestrictionType::Between | RestrictionType::NotBetween => RestrictionCategory::Double,
            RestrictionType::Amongst | RestrictionType::NotAmongst => {
                RestrictionCategory::Collection
            }
            RestrictionType::And | RestrictionType::Or => RestrictionCategory::Compound,
            _ => RestrictionCategory::Single,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Restriction {
    Zero {
        kind: RestrictionType,
        field: String,
    },
    Single {
        kind: RestrictionType,
        field: String,
        value: SqlValue,
    },
    Double {
        kind: RestrictionType,
        field: String,
        first: SqlValue,
        second: SqlValue,
    },
    Collection {
        kind: RestrictionType,
        field: String,
        values: Vec<SqlValue>,
    },
    Compound {
        kind: RestrictionType,
        restrictions: Vec<Restriction>,
    },
}

fn single(kind: RestrictionType, field: impl Into<String>, value: impl Into<SqlValue>) -> Restriction {
    Restriction::Single {
        kind,
        field: field.into(),
        value: value.into(),
    }
}

impl Restriction {
    pub fn equals(field: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        single(RestrictionType::Equals, field, value)
    }

    pub fn not_equals(field: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        single(RestrictionType::NotEquals, field, value)
    }

    pub fn less_than(field: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        single(RestrictionType::LessThan, field, value)
    }

    pub fn less_than_equal(field: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        single(RestrictionType::LessThanEqual, field, value)
    }

    pub fn greater_than(field: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        single(RestrictionType::GreaterThan, field, value)
    }

    pub fn greater_than_equal(field: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        single(RestrictionType::GreaterThanEqual, field, value)
    }

    /// SQL LIKE with a caller-supplied pattern
    pub fn like(field: impl Into<String>, pattern: impl Into<SqlValue>) -> Self {
        single(RestrictionType::Like, field, pattern)
    }

    pub fn not_like(field: impl Into<String>, pattern: impl Into<SqlValue>) -> Self {
        single(RestrictionType::NotLike, field, pattern)
    }

    pub fn begins_with(field: impl Into<String>, prefix: impl Into<SqlValue>) -> Self {
        single(RestrictionType::BeginsWith, field, prefix)
    }

    pub fn ends_with(field: impl Into<String>, suffix: impl Into<SqlValue>) -> Self {
        single(RestrictionType::EndsWith, field, suffix)
    }

    pub fn iequals(field: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        single(RestrictionType::IEquals, field, value)
    }

    pub fn between(
        field: impl Into<String>,
        first: impl Into<SqlValue>,
        second: impl Into<SqlValue>,
    ) -> Self {
        Restriction::Double {
            kind: RestrictionType::Between,
            field: field.into(),
            first: first.into(),
            second: second.into(),
        }
    }

    pub fn not_between(
        field: impl Into<String>,
        first: impl Into<SqlValue>,
        second: impl Into<SqlValue>,
    ) -> Self {
        Restriction::Double {
            kind: RestrictionType::NotBetween,
            field: field.into(),
            first: first.into(),
            second: second.into(),
        }
    }

    pub fn amongst<V: Into<SqlValue>>(field: impl Into<String>, values: Vec<V>) -> Self {
        Restriction::Collection {
            kind: RestrictionType::Amongst,
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn not_amongst<V: Into<SqlValue>>(field: impl Into<String>, values: Vec<V>) -> Self {
        Restriction::Collection {
            kind: RestrictionType::NotAmongst,
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Restriction::Zero {
            kind: RestrictionType::IsNull,
            field: field.into(),
        }
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        Restriction::Zero {
            kind: RestrictionType::IsNotNull,
            field: field.into(),
        }
    }

    pub fn and(restrictions: Vec<Restriction>) -> Self {
        Restriction::Compound {
            kind: RestrictionType::And,
            restrictions,
        }
    }

    pub fn or(restrictions: Vec<Restriction>) -> Self {
        Restriction::Compound {
            kind: RestrictionType::Or,
            restrictions,
        }
    }

    pub fn kind(&self) -> RestrictionType {
        match self {
            Restriction::Zero { kind, .. }
            | Restriction::Single { kind, .. }
            | Restriction::Double { kind, .. }
            | Restriction::Collection { kind, .. }
            | Restriction::Compound { kind, .. } => *kind,
        }
    }

    /// Field of a leaf restriction
    pub fn field(&self) -> Option<&str> {
        match self {
            Restriction::Zero { field, .. }
            | Restriction::Single { field, .. }
            | Restriction::Double { field, .. }
            | Restriction::Collection { field, .. } => Some(field),
            Restriction::Compound { .. } => None,
        }
    }

    /// True for a compound without any leaf below it
    pub fn is_empty(&self) -> bool {
        match self {
            Restriction::Compound { restrictions, .. } => restrictions.iter().all(|r| r.is_empty()),
            _ => false,
        }
    }

    /// Distinct field names referenced anywhere in the tree, in first-use order
    pub fn restricted_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        self.collect_fields(&mut fields);
        fields
    }

    pub(crate) fn collect_fields(&self, fields: &mut Vec<String>) {
        match self {
            Restriction::Compound { restrictions, .. } => {
                for r in restrictions {
                    r.collect_fields(fields);
                }
            }
            leaf => {
                if let Some(field) = leaf.field() {
                    if !fields.iter().any(|f| f == field) {
                        fields.push(field.to_string());
                    }
                }
            }
        }
    }

    /// New tree with the value of every single-value leaf on `field` replaced
    ///
    /// The flag reports whether any leaf matched.
    pub fn replace_all(&self, field: &str, value: &SqlValue) -> (Restriction, bool) {
        self.rewrite(&mut |leaf| match leaf {
            Restriction::Single {
                kind, field: f, ..
            } if f == field => Some(Restriction::Single {
                kind: *kind,
                field: f.clone(),
                value: value.clone(),
            }),
            _ => None,
        })
    }

    /// New tree with the bounds of every range leaf on `field` replaced
    pub fn replace_all_range(
        &self,
        field: &str,
        first: &SqlValue,
        second: &SqlValue,
    ) -> (Restriction, bool) {
        self.rewrite(&mut |leaf| match leaf {
            Restriction::Double {
                kind, field: f, ..
            } if f == field => Some(Restriction::Double {
                kind: *kind,
                field: f.clone(),
                first: first.clone(),
                second: second.clone(),
            }),
            _ => None,
        })
    }

    /// New tree with the values of every collection leaf on `field` replaced
    pub fn replace_all_values(&self, field: &str, values: &[SqlValue]) -> (Restriction, bool) {
        self.rewrite(&mut |leaf| match leaf {
            Restriction::Collection {
                kind, field: f, ..
            } if f == field => Some(Restriction::Collection {
                kind: *kind,
                field: f.clone(),
                values: values.to_vec(),
            }),
            _ => None,
        })
    }

    fn rewrite(
        &self,
        replace: &mut dyn FnMut(&Restriction) -> Option<Restriction>,
    ) -> (Restriction, bool) {
        match self {
            Restriction::Compound { kind, restrictions } => {
                let mut replaced = false;
                let restrictions = restrictions
                    .iter()
                    .map(|r| {
                        let (r, hit) = r.rewrite(&mut *replace);
                        replaced |= hit;
                        r
                    })
                    .collect();
                (
                    Restriction::Compound {
                        kind: *kind,
                        restrictions,
                    },
                    replaced,
                )
            }
            leaf => match replace(leaf) {
                Some(new_leaf) => (new_leaf, true),
                None => (leaf.clone(), false),
            },
        }
    }
}
