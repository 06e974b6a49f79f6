//! Narrow condition model for update conditions and partition predicates.
//!
//! The full query/condition language belongs to the query engine that
//! executes source queries. vista only needs to inspect the top level of an
//! update condition (junction and simple column comparisons) and to append
//! range predicates to it, so the model here is deliberately small:
//! a junction over a list of terms, where a term is a comparison, a null
//! test, or a nested group.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::ScalarValue;

/// How the terms of a [`Condition`] combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Junction {
    /// All terms must hold.
    #[default]
    And,
    /// At least one term must hold.
    Or,
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
}

impl CompareOp {
    const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
        }
    }
}

/// One term of a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Term {
    /// `column <op> value`
    Compare {
        /// Column name.
        column: String,
        /// Operator.
        op: CompareOp,
        /// Literal operand.
        value: ScalarValue,
    },
    /// `column IS NULL`
    IsNull {
        /// Column name.
        column: String,
    },
    /// Parenthesised sub-condition.
    Group {
        /// The nested condition.
        condition: Condition,
    },
}

impl Term {
    /// Builds a comparison term.
    #[must_use]
    pub fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<ScalarValue>) -> Self {
        Self::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// Builds an `IS NULL` term.
    #[must_use]
    pub fn is_null(column: impl Into<String>) -> Self {
        Self::IsNull {
            column: column.into(),
        }
    }

    /// Wraps a condition as a nested group.
    #[must_use]
    pub fn group(condition: Condition) -> Self {
        Self::Group { condition }
    }

    fn evaluate<'a, F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> Option<&'a ScalarValue>,
    {
        match self {
            Self::Compare { column, op, value } => {
                let Some(actual) = lookup(column) else {
                    return false;
                };
                if actual.is_null() || value.is_null() {
                    return false;
                }
                let Some(ordering) = actual.partial_cmp(value) else {
                    return false;
                };
                match op {
                    CompareOp::Eq => ordering.is_eq(),
                    CompareOp::NotEq => ordering.is_ne(),
                    CompareOp::Lt => ordering.is_lt(),
                    CompareOp::LtEq => ordering.is_le(),
                    CompareOp::Gt => ordering.is_gt(),
                    CompareOp::GtEq => ordering.is_ge(),
                }
            }
            Self::IsNull { column } => lookup(column).is_none_or(ScalarValue::is_null),
            Self::Group { condition } => condition.evaluate(lookup),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare { column, op, value } => write!(f, "{column} {} {value}", op.symbol()),
            Self::IsNull { column } => write!(f, "{column} IS NULL"),
            Self::Group { condition } => write!(f, "({condition})"),
        }
    }
}

/// A junction over a list of terms.
///
/// An empty condition places no restriction on rows.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Condition {
    /// How the terms combine.
    pub junction: Junction,
    /// The terms, in declaration order.
    pub terms: Vec<Term>,
}

impl Condition {
    /// An empty (always true) condition.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Conjunction of `terms`.
    #[must_use]
    pub fn all(terms: Vec<Term>) -> Self {
        Self {
            junction: Junction::And,
            terms,
        }
    }

    /// Disjunction of `terms`.
    #[must_use]
    pub fn any(terms: Vec<Term>) -> Self {
        Self {
            junction: Junction::Or,
            terms,
        }
    }

    /// Returns true when the condition has no terms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Returns `self AND term`.
    ///
    /// Conjunctions are extended in place; any other condition is wrapped in
    /// a group so its meaning is preserved.
    #[must_use]
    pub fn and(self, term: Term) -> Self {
        if self.junction == Junction::And || self.terms.is_empty() {
            let mut terms = self.terms;
            terms.push(term);
            Self::all(terms)
        } else {
            Self::all(vec![Term::group(self), term])
        }
    }

    /// Top-level comparisons on `column`.
    pub fn comparisons_on<'a>(
        &'a self,
        column: &'a str,
    ) -> impl Iterator<Item = (CompareOp, &'a ScalarValue)> + 'a {
        self.terms.iter().filter_map(move |term| match term {
            Term::Compare {
                column: c,
                op,
                value,
            } if c == column => Some((*op, value)),
            _ => None,
        })
    }

    /// Columns referenced by top-level comparison terms, in order, deduplicated.
    #[must_use]
    pub fn compared_columns(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for term in &self.terms {
            if let Term::Compare { column, .. } = term {
                if !out.contains(&column.as_str()) {
                    out.push(column);
                }
            }
        }
        out
    }

    /// Evaluates the condition against a row accessor.
    ///
    /// Comparisons against NULL (or a missing column) are false; `IS NULL`
    /// treats a missing column as NULL.
    pub fn evaluate<'a, F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> Option<&'a ScalarValue>,
    {
        if self.terms.is_empty() {
            return true;
        }
        match self.junction {
            Junction::And => self.terms.iter().all(|t| t.evaluate(lookup)),
            Junction::Or => self.terms.iter().any(|t| t.evaluate(lookup)),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return f.write_str("TRUE");
        }
        let sep = match self.junction {
            Junction::And => " AND ",
            Junction::Or => " OR ",
        };
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                f.write_str(sep)?;
            }
            write!(f, "{term}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn row(pairs: &[(&str, ScalarValue)]) -> HashMap<String, ScalarValue> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn empty_condition_accepts_everything() {
        let r = row(&[]);
        assert!(Condition::empty().evaluate(&|c| r.get(c)));
    }

    #[test]
    fn and_extends_conjunctions_and_wraps_disjunctions() {
        let c = Condition::all(vec![Term::compare("a", CompareOp::Gt, 1_i64)])
            .and(Term::is_null("b"));
        assert_eq!(c.terms.len(), 2);
        assert_eq!(c.junction, Junction::And);

        let d = Condition::any(vec![Term::is_null("a"), Term::is_null("b")])
            .and(Term::compare("c", CompareOp::Eq, 1_i64));
        assert_eq!(d.junction, Junction::And);
        assert!(matches!(d.terms[0], Term::Group { .. }));
    }

    #[test]
    fn comparisons_with_null_are_false_but_is_null_matches() {
        let r = row(&[("a", ScalarValue::Null)]);
        let cmp = Condition::all(vec![Term::compare("a", CompareOp::Lt, 10_i64)]);
        assert!(!cmp.evaluate(&|c| r.get(c)));
        let isnull = Condition::all(vec![Term::is_null("a")]);
        assert!(isnull.evaluate(&|c| r.get(c)));
        assert!(Condition::all(vec![Term::is_null("missing")]).evaluate(&|c| r.get(c)));
    }

    #[test]
    fn nested_range_or_null_matches_both_arms() {
        let range = Condition::any(vec![
            Term::group(Condition::all(vec![
                Term::compare("n", CompareOp::GtEq, 0_i64),
                Term::compare("n", CompareOp::Lt, 10_i64),
            ])),
            Term::is_null("n"),
        ]);
        let inside = row(&[("n", ScalarValue::Int64(5))]);
        let outside = row(&[("n", ScalarValue::Int64(10))]);
        let null = row(&[("n", ScalarValue::Null)]);
        assert!(range.evaluate(&|c| inside.get(c)));
        assert!(!range.evaluate(&|c| outside.get(c)));
        assert!(range.evaluate(&|c| null.get(c)));
    }

    #[test]
    fn display_is_readable() {
        let c = Condition::all(vec![
            Term::compare("year", CompareOp::GtEq, 2020_i64),
            Term::is_null("region"),
        ]);
        assert_eq!(c.to_string(), "year >= 2020 AND region IS NULL");
    }
}
