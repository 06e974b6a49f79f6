//! In-memory query executor.
//!
//! Holds named tables as [`RowBatch`]es and answers [`ExecutionRequest`]s by
//! evaluating the request condition row by row, so a partitioned build sees
//! exactly the rows its range predicate selects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use vista_core::error::{Error, Result};
use vista_core::executor::{ExecutionRequest, QueryExecutor, RowCount, RowSet};
use vista_core::value::{Row, RowBatch};

#[derive(Debug, Default)]
struct Faults {
    tables: Vec<String>,
    after_rows: Option<usize>,
    on_execution: Option<usize>,
}

/// Query executor over in-memory tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExecutor {
    tables: Arc<Mutex<HashMap<String, RowBatch>>>,
    requests: Arc<Mutex<Vec<ExecutionRequest>>>,
    executions: Arc<AtomicUsize>,
    faults: Arc<Mutex<Faults>>,
    latency: Option<Duration>,
}

impl InMemoryExecutor {
    /// Creates an executor with no tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an executor that sleeps before answering each request.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Registers (or replaces) a table.
    pub fn insert_table(&self, name: impl Into<String>, batch: RowBatch) {
        self.tables.lock().expect("lock").insert(name.into(), batch);
    }

    /// Appends rows to an existing table.
    pub fn append_rows(&self, name: &str, rows: Vec<Row>) {
        let mut tables = self.tables.lock().expect("lock");
        let table = tables.get_mut(name).expect("table exists");
        table.rows.extend(rows);
    }

    /// Number of executions started.
    #[must_use]
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Requests received, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests.lock().expect("lock").clone()
    }

    /// Fails every execution against `table`.
    pub fn fail_table(&self, table: impl Into<String>) {
        self.faults.lock().expect("lock").tables.push(table.into());
    }

    /// Makes every stream yield an error after `rows` rows.
    pub fn fail_stream_after(&self, rows: usize) {
        self.faults.lock().expect("lock").after_rows = Some(rows);
    }

    /// Fails the `n`-th execution (1-based) only.
    pub fn fail_execution(&self, n: usize) {
        self.faults.lock().expect("lock").on_execution = Some(n);
    }

    /// Clears injected faults.
    pub fn clear_faults(&self) {
        *self.faults.lock().expect("lock") = Faults::default();
    }

    fn select(&self, request: &ExecutionRequest) -> Result<Vec<Row>> {
        let tables = self.tables.lock().expect("lock");
        let table = tables
            .get(&request.source.table)
            .ok_or_else(|| Error::NotFound(format!("table not found: {}", request.source.table)))?;

        let projection: Vec<usize> = request
            .columns
            .iter()
            .map(|c| {
                table
                    .column_index(c)
                    .ok_or_else(|| Error::InvalidInput(format!("unknown column: {c}")))
            })
            .collect::<Result<_>>()?;

        Ok(table
            .rows
            .iter()
            .filter(|row| {
                request
                    .condition
                    .evaluate(&|name| table.column_index(name).and_then(|i| row.get(i)))
            })
            .map(|row| projection.iter().map(|&i| row[i].clone()).collect())
            .collect())
    }
}

#[async_trait]
impl QueryExecutor for InMemoryExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<RowSet> {
        let n = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().expect("lock").push(request.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let (fail_table, after_rows, fail_now) = {
            let faults = self.faults.lock().expect("lock");
            (
                faults.tables.contains(&request.source.table),
                faults.after_rows,
                faults.on_execution == Some(n),
            )
        };
        if fail_table || fail_now {
            return Err(Error::internal(format!(
                "injected executor failure for {} (execution {n})",
                request.source.table
            )));
        }

        let rows = self.select(&request)?;
        let row_count = RowCount::Known(rows.len() as u64);
        let items: Vec<Result<Row>> = match after_rows {
            Some(limit) => rows
                .into_iter()
                .take(limit)
                .map(Ok)
                .chain(std::iter::once(Err(Error::internal(
                    "injected stream failure",
                ))))
                .collect(),
            None => rows.into_iter().map(Ok).collect(),
        };

        Ok(RowSet {
            columns: request.columns,
            row_count,
            rows: stream::iter(items).boxed(),
        })
    }
}
