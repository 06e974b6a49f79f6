//! Plan evaluation seam.
//!
//! The read plan is opaque to vista. An evaluator applies the pushed-down
//! part of a plan to one decoded block (map side) and the global part to the
//! collected partial results (reduce side).

use std::cmp::Ordering;

use vista_core::plan::QueryPlan;
use vista_core::value::{Row, RowBatch};

use crate::error::Result;

/// Applies read plans to row batches.
pub trait PlanEvaluator: Send + Sync + 'static {
    /// Evaluates `plan` against one block. The result must hold exactly
    /// `plan.columns`, in order.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::ColumnMissing` when the block lacks a column the
    /// plan needs, or any evaluation error.
    fn evaluate_block(&self, block: &RowBatch, plan: &QueryPlan) -> Result<RowBatch>;

    /// Applies the plan's global operations to the concatenated partial
    /// results. Only called for plans that are not streamable.
    ///
    /// # Errors
    ///
    /// Returns an evaluation error.
    fn finish(&self, combined: RowBatch, plan: &QueryPlan) -> Result<RowBatch>;
}

/// Filters and projects rows; orders rows for global sorts.
///
/// Aggregation and ranking live in the engine payload and are left to
/// engine-specific evaluators; this one passes those rows through.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterProjectEvaluator;

impl PlanEvaluator for FilterProjectEvaluator {
    fn evaluate_block(&self, block: &RowBatch, plan: &QueryPlan) -> Result<RowBatch> {
        let projection = projection(block, &plan.columns)?;
        let rows = block
            .rows
            .iter()
            .filter(|row| {
                plan.filter
                    .evaluate(&|name| block.column_index(name).and_then(|i| row.get(i)))
            })
            .map(|row| {
                projection
                    .iter()
                    .map(|&i| {
                        row.get(i).cloned().ok_or_else(|| {
                            vista_core::Error::InvalidInput(format!(
                                "row has {} values, projection reads value {i}",
                                row.len()
                            ))
                            .into()
                        })
                    })
                    .collect::<Result<Row>>()
            })
            .collect::<Result<Vec<Row>>>()?;
        Ok(RowBatch::new(plan.columns.clone(), rows))
    }

    fn finish(&self, mut combined: RowBatch, plan: &QueryPlan) -> Result<RowBatch> {
        if plan.global.sort {
            combined.rows.sort_by(compare_rows);
        }
        Ok(combined)
    }
}

fn projection(block: &RowBatch, columns: &[String]) -> Result<Vec<usize>> {
    columns
        .iter()
        .map(|c| {
            block.column_index(c).ok_or_else(|| {
                vista_core::Error::InvalidInput(format!("block has no column {c}")).into()
            })
        })
        .collect()
}

/// Lexicographic order; nulls first, unordered pairs compare equal.
fn compare_rows(a: &Row, b: &Row) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ord = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vista_core::condition::{CompareOp, Condition, Term};
    use vista_core::plan::GlobalOps;
    use vista_core::value::ScalarValue;

    fn block() -> RowBatch {
        RowBatch::new(
            vec!["region".into(), "amount".into()],
            vec![
                vec!["north".into(), ScalarValue::Int64(30)],
                vec!["south".into(), ScalarValue::Int64(10)],
                vec![ScalarValue::Null, ScalarValue::Int64(20)],
            ],
        )
    }

    #[test]
    fn filters_then_projects() {
        let plan = QueryPlan::select(["amount"]).with_filter(Condition::all(vec![Term::compare(
            "amount",
            CompareOp::Gt,
            15_i64,
        )]));
        let out = FilterProjectEvaluator.evaluate_block(&block(), &plan).unwrap();
        assert_eq!(out.columns, vec!["amount"]);
        assert_eq!(
            out.rows,
            vec![vec![ScalarValue::Int64(30)], vec![ScalarValue::Int64(20)]]
        );
    }

    #[test]
    fn missing_column_is_an_error() {
        let plan = QueryPlan::select(["discount"]);
        assert!(FilterProjectEvaluator.evaluate_block(&block(), &plan).is_err());
    }

    #[test]
    fn short_row_is_an_error() {
        let mut ragged = block();
        ragged.rows.push(vec!["west".into()]);
        let plan = QueryPlan::select(["amount"]);
        assert!(FilterProjectEvaluator.evaluate_block(&ragged, &plan).is_err());
    }

    #[test]
    fn global_sort_orders_nulls_first() {
        let plan = QueryPlan::select(["region", "amount"]).with_global(GlobalOps {
            sort: true,
            ..GlobalOps::default()
        });
        let out = FilterProjectEvaluator.finish(block(), &plan).unwrap();
        let regions: Vec<_> = out.rows.iter().map(|r| r[0].clone()).collect();
        assert_eq!(regions, vec![ScalarValue::Null, "north".into(), "south".into()]);
    }
}
