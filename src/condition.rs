// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Lockheed Contributors
//
// This file is part of Lockheed.
//
// Lockheed is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Lockheed is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Lockheed. If not, see <https://www.gnu.org/licenses/>.

//! Declarative conditions over lock metadata.
//!
//! Conditions drive two things: filtering in [`crate::get_locks`] and the
//! force-takeover policy on acquire. A condition is a tree whose non-leaf
//! nodes combine children with `and`/`or` and whose leaves test a single
//! field of the record. Values are typed; a value of the wrong type for its
//! field fails evaluation with [`LockError::TypeMismatch`] instead of
//! panicking.

use serde::{Deserialize, Serialize};

use crate::error::{LockError, LockResult};
use crate::record::LockRecord;

/// Record field a leaf condition can test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    /// Whether any lease on the record is still live
    Acquired,
    /// The record's tag set
    Tags,
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Field::Acquired => f.write_str("acquired"),
            Field::Tags => f.write_str("tags"),
        }
    }
}

/// Leaf operation. `equals` applies to `acquired`, `contains` to `tags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Predicate {
    Equals,
    Contains,
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::Equals => f.write_str("equals"),
            Predicate::Contains => f.write_str("contains"),
        }
    }
}

/// Typed leaf value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Bool(bool),
    Str(String),
}

/// Boolean expression tree over lock metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    /// True iff all children evaluate true
    And(Vec<Condition>),
    /// True iff any child evaluates true
    Or(Vec<Condition>),
    /// Single-field test
    Leaf {
        field: Field,
        predicate: Predicate,
        value: Value,
    },
}

impl Condition {
    pub fn and(conditions: Vec<Condition>) -> Self {
        Condition::And(conditions)
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Condition::Or(conditions)
    }

    /// `acquired equals <value>`
    pub fn acquired(value: bool) -> Self {
        Condition::Leaf {
            field: Field::Acquired,
            predicate: Predicate::Equals,
            value: Value::Bool(value),
        }
    }

    /// `tags contains <tag>`
    pub fn has_tag(tag: impl Into<String>) -> Self {
        Condition::Leaf {
            field: Field::Tags,
            predicate: Predicate::Contains,
            value: Value::Str(tag.into()),
        }
    }

    /// Evaluate this condition against a lock record.
    ///
    /// The semantics are total: every child is evaluated so that errors
    /// anywhere in the tree surface regardless of the boolean outcome.
    pub fn evaluate(&self, record: &LockRecord) -> LockResult<bool> {
        match self {
            Condition::And(children) => {
                let mut all = true;
                for child in children {
                    all &= child.evaluate(record)?;
                }
                Ok(all)
            }
            Condition::Or(children) => {
                let mut any = false;
                for child in children {
                    any |= child.evaluate(record)?;
                }
                Ok(any)
            }
            Condition::Leaf {
                field,
                predicate,
                value,
            } => evaluate_leaf(record, *field, *predicate, value),
        }
    }
}

fn evaluate_leaf(
    record: &LockRecord,
    field: Field,
    predicate: Predicate,
    value: &Value,
) -> LockResult<bool> {
    match (field, predicate) {
        (Field::Tags, Predicate::Contains) => match value {
            Value::Str(tag) => Ok(record.tags.iter().any(|t| t == tag)),
            Value::Bool(_) => Err(LockError::TypeMismatch {
                field: field.to_string(),
                expected: "string".to_string(),
            }),
        },
        (Field::Acquired, Predicate::Equals) => match value {
            Value::Bool(expected) => Ok(record.held() == *expected),
            Value::Str(_) => Err(LockError::TypeMismatch {
                field: field.to_string(),
                expected: "boolean".to_string(),
            }),
        },
        (field, predicate) => Err(LockError::UnsupportedPredicate {
            field: field.to_string(),
            predicate: predicate.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{expiry_sentinel, Lease};
    use chrono::Utc;

    fn record_with_tags(tags: &[&str]) -> LockRecord {
        let mut record = LockRecord::named("l");
        record.tags = tags.iter().map(|t| t.to_string()).collect();
        record
    }

    fn held_record() -> LockRecord {
        let mut record = LockRecord::named("l");
        record
            .leases
            .insert("i-1".to_string(), Lease::new("i-1", expiry_sentinel()));
        record
    }

    #[test]
    fn tags_contains() {
        let record = record_with_tags(&["a", "b"]);
        assert!(Condition::has_tag("a").evaluate(&record).unwrap());
        assert!(!Condition::has_tag("c").evaluate(&record).unwrap());
    }

    #[test]
    fn acquired_equals_ignores_expired_leases() {
        let mut record = LockRecord::named("l");
        record.leases.insert(
            "i-1".to_string(),
            Lease::new("i-1", Utc::now() - chrono::Duration::seconds(1)),
        );
        assert!(Condition::acquired(false).evaluate(&record).unwrap());
        assert!(!Condition::acquired(true).evaluate(&record).unwrap());

        assert!(Condition::acquired(true).evaluate(&held_record()).unwrap());
    }

    #[test]
    fn and_or_combinators() {
        let mut record = held_record();
        record.tags = vec!["x".to_string()];

        let both = Condition::and(vec![Condition::acquired(true), Condition::has_tag("x")]);
        assert!(both.evaluate(&record).unwrap());

        let one = Condition::and(vec![Condition::acquired(true), Condition::has_tag("y")]);
        assert!(!one.evaluate(&record).unwrap());

        let either = Condition::or(vec![Condition::acquired(false), Condition::has_tag("x")]);
        assert!(either.evaluate(&record).unwrap());

        let neither = Condition::or(vec![Condition::acquired(false), Condition::has_tag("y")]);
        assert!(!neither.evaluate(&record).unwrap());
    }

    #[test]
    fn empty_combinators_are_identity() {
        let record = LockRecord::named("l");
        assert!(Condition::and(vec![]).evaluate(&record).unwrap());
        assert!(!Condition::or(vec![]).evaluate(&record).unwrap());
    }

    #[test]
    fn unsupported_predicate() {
        let record = record_with_tags(&["a"]);
        let cond = Condition::Leaf {
            field: Field::Tags,
            predicate: Predicate::Equals,
            value: Value::Str("a".to_string()),
        };
        assert!(matches!(
            cond.evaluate(&record),
            Err(LockError::UnsupportedPredicate { .. })
        ));
    }

    #[test]
    fn type_mismatch() {
        let record = record_with_tags(&["a"]);
        let cond = Condition::Leaf {
            field: Field::Tags,
            predicate: Predicate::Contains,
            value: Value::Bool(true),
        };
        assert!(matches!(
            cond.evaluate(&record),
            Err(LockError::TypeMismatch { .. })
        ));

        let cond = Condition::Leaf {
            field: Field::Acquired,
            predicate: Predicate::Equals,
            value: Value::Str("yes".to_string()),
        };
        assert!(matches!(
            cond.evaluate(&record),
            Err(LockError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn errors_surface_through_combinators() {
        let record = record_with_tags(&["a"]);
        let bad = Condition::Leaf {
            field: Field::Acquired,
            predicate: Predicate::Contains,
            value: Value::Str("a".to_string()),
        };
        // the passing sibling does not mask the error
        let cond = Condition::or(vec![Condition::has_tag("a"), bad]);
        assert!(cond.evaluate(&record).is_err());
    }
}
