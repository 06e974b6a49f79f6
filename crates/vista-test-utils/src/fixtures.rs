//! Pre-built test fixtures.
//!
//! A small "sales" table with a date, a region and an amount column, plus the
//! artifact definition that materializes it.

use std::sync::Arc;

use chrono::{Days, NaiveDate};
use serde_json::json;
use vista_core::condition::{CompareOp, Condition, Term};
use vista_core::definition::ArtifactDefinition;
use vista_core::plan::SourceQuery;
use vista_core::schema::{Column, ColumnType};
use vista_core::value::{Row, RowBatch, ScalarValue};

use crate::clock::SimulatedClock;
use crate::executor::InMemoryExecutor;
use crate::storage::TracingMemoryBackend;

/// Name of the fixture source table.
pub const SALES_TABLE: &str = "sales";

const REGIONS: [&str; 4] = ["north", "south", "east", "west"];

/// Storage, executor and clock wired together.
#[derive(Debug, Clone)]
pub struct TestContext {
    /// Shared storage backend.
    pub storage: Arc<TracingMemoryBackend>,
    /// Executor preloaded with the sales table.
    pub executor: Arc<InMemoryExecutor>,
    /// Simulated clock.
    pub clock: Arc<SimulatedClock>,
}

impl TestContext {
    /// Creates a context whose sales table holds `rows` rows.
    #[must_use]
    pub fn with_sales(rows: usize) -> Self {
        let executor = InMemoryExecutor::new();
        executor.insert_table(SALES_TABLE, sales_table(rows));
        Self {
            storage: Arc::new(TracingMemoryBackend::new()),
            executor: Arc::new(executor),
            clock: Arc::new(SimulatedClock::deterministic()),
        }
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::with_sales(100)
    }
}

/// Columns of the sales table.
#[must_use]
pub fn sales_columns() -> Vec<Column> {
    vec![
        Column::dimension("order_date", ColumnType::Date),
        Column::dimension("region", ColumnType::String),
        Column::measure("amount", ColumnType::Int64),
    ]
}

/// Column names of the sales table.
#[must_use]
pub fn sales_column_names() -> Vec<String> {
    sales_columns().into_iter().map(|c| c.name).collect()
}

/// The `i`-th sales row.
///
/// Dates start at 2020-01-01 and advance a week per row; every tenth row has
/// an unknown date.
#[must_use]
pub fn sales_row(i: usize) -> Row {
    let date = if i % 10 == 9 {
        ScalarValue::Null
    } else {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).expect("valid date");
        ScalarValue::Date(start + Days::new(7 * i as u64))
    };
    vec![
        date,
        ScalarValue::from(REGIONS[i % REGIONS.len()]),
        ScalarValue::Int64(i64::try_from(i).expect("row index fits") * 10),
    ]
}

/// A sales table with `rows` rows.
#[must_use]
pub fn sales_table(rows: usize) -> RowBatch {
    RowBatch::new(sales_column_names(), (0..rows).map(sales_row).collect())
}

/// Source query of the sales artifact.
#[must_use]
pub fn sales_source() -> SourceQuery {
    SourceQuery::new(
        SALES_TABLE,
        json!({"select": ["order_date", "region", "amount"], "caption": "Sales"}),
    )
}

/// Update condition selecting every dated sale.
#[must_use]
pub fn sales_update_condition() -> Condition {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid date");
    Condition::all(vec![Term::compare(
        "order_date",
        CompareOp::GtEq,
        ScalarValue::Date(epoch),
    )])
}

/// Definition materializing the sales table in `scope`.
#[must_use]
pub fn sales_definition(scope: &str) -> ArtifactDefinition {
    ArtifactDefinition::new("sales", scope, sales_source(), sales_columns())
        .expect("fingerprint")
        .with_update_condition(sales_update_condition())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tenth_row_has_no_date() {
        let table = sales_table(20);
        assert!(table.rows[9][0].is_null());
        assert!(table.rows[19][0].is_null());
        assert!(!table.rows[8][0].is_null());
    }

    #[test]
    fn definitions_with_same_source_share_a_fingerprint() {
        assert_eq!(
            sales_definition("a").sharing.fingerprint,
            sales_definition("a").sharing.fingerprint
        );
    }
}
