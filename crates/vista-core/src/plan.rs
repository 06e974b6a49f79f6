//! Opaque query plans.
//!
//! vista never interprets the query language. A [`SourceQuery`] describes how
//! an artifact is computed from its source table; a [`QueryPlan`] is a read
//! against a materialized artifact whose filter and per-block work have
//! already been pushed down by the caller's planner. Both carry the engine's
//! own plan as an opaque JSON payload next to the few facts vista needs to
//! schedule work.

use serde::{Deserialize, Serialize};

use crate::condition::Condition;

/// The query an artifact materializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceQuery {
    /// Identity of the backing source table.
    pub table: String,
    /// Engine-specific plan, passed through untouched.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SourceQuery {
    /// Creates a source query.
    #[must_use]
    pub fn new(table: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            table: table.into(),
            payload,
        }
    }
}

/// Global operations that force a read to see every block before answering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalOps {
    /// Aggregation across blocks.
    #[serde(default)]
    pub aggregate: bool,
    /// Ordering across blocks.
    #[serde(default)]
    pub sort: bool,
    /// Ranking / top-N across blocks.
    #[serde(default)]
    pub rank: bool,
}

impl GlobalOps {
    /// Returns true when any global operation is present.
    #[must_use]
    pub const fn any(self) -> bool {
        self.aggregate || self.sort || self.rank
    }
}

/// A read against a materialized artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlan {
    /// Columns the read needs; every one must exist in the artifact.
    pub columns: Vec<String>,
    /// Row filter evaluated inside each map task.
    #[serde(default)]
    pub filter: Condition,
    /// Global operations applied after all partial results are in.
    #[serde(default)]
    pub global: GlobalOps,
    /// Upper bound on the number of rows the caller wants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,
    /// Engine-specific plan fragment, passed to the evaluator untouched.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl QueryPlan {
    /// Creates a row-level plan over `columns`.
    #[must_use]
    pub fn select<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            filter: Condition::empty(),
            global: GlobalOps::default(),
            max_rows: None,
            payload: serde_json::Value::Null,
        }
    }

    /// Sets the pushed-down filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Condition) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the global operations.
    #[must_use]
    pub const fn with_global(mut self, global: GlobalOps) -> Self {
        self.global = global;
        self
    }

    /// Caps the number of rows returned.
    #[must_use]
    pub const fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    /// Attaches an engine payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Returns true when the plan only needs row-level detail and results
    /// may be forwarded as soon as individual blocks finish.
    #[must_use]
    pub const fn is_streamable(&self) -> bool {
        !self.global.any()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_level_plans_stream() {
        let plan = QueryPlan::select(["region", "amount"]);
        assert!(plan.is_streamable());
        assert_eq!(plan.columns, vec!["region", "amount"]);
    }

    #[test]
    fn any_global_op_forces_buffering() {
        for global in [
            GlobalOps { aggregate: true, ..GlobalOps::default() },
            GlobalOps { sort: true, ..GlobalOps::default() },
            GlobalOps { rank: true, ..GlobalOps::default() },
        ] {
            assert!(!QueryPlan::select(["a"]).with_global(global).is_streamable());
        }
    }

    #[test]
    fn plan_serializes_with_camel_case() {
        let plan = QueryPlan::select(["a"]).with_max_rows(5);
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["maxRows"], 5);
        let back: QueryPlan = serde_json::from_value(json).unwrap();
        assert_eq!(back, plan);
    }
}
