//! Scalar values and row batches.
//!
//! A [`ScalarValue`] is one typed cell. Values of the same family compare
//! with each other (integers and floats compare numerically, dates and
//! timestamps compare on the timeline); values of unrelated families are
//! unordered and `partial_cmp` returns `None`.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// One typed cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum ScalarValue {
    /// Missing / unknown value.
    Null,
    /// Boolean value.
    Boolean(bool),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit float.
    Float64(f64),
    /// UTF-8 string.
    String(String),
    /// Calendar date.
    Date(NaiveDate),
    /// UTC timestamp.
    Timestamp(DateTime<Utc>),
}

impl ScalarValue {
    /// Returns true for [`ScalarValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the value as an integer when it is integral.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value on the UTC timeline when it is temporal.
    ///
    /// Dates are interpreted as midnight UTC.
    #[must_use]
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            Self::Date(d) => Some(d.and_time(NaiveTime::MIN).and_utc()),
            _ => None,
        }
    }

    /// Returns the smaller of two comparable values; `None` when unordered.
    #[must_use]
    pub fn min_of(a: &Self, b: &Self) -> Option<Self> {
        match a.partial_cmp(b)? {
            Ordering::Greater => Some(b.clone()),
            _ => Some(a.clone()),
        }
    }

    /// Returns the larger of two comparable values; `None` when unordered.
    #[must_use]
    pub fn max_of(a: &Self, b: &Self) -> Option<Self> {
        match a.partial_cmp(b)? {
            Ordering::Less => Some(b.clone()),
            _ => Some(a.clone()),
        }
    }
}

impl PartialOrd for ScalarValue {
    #[allow(clippy::cast_precision_loss)]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Boolean(a), Self::Boolean(b)) => a.partial_cmp(b),
            (Self::Int64(a), Self::Int64(b)) => a.partial_cmp(b),
            (Self::Float64(a), Self::Float64(b)) => a.partial_cmp(b),
            (Self::Int64(a), Self::Float64(b)) => (*a as f64).partial_cmp(b),
            (Self::Float64(a), Self::Int64(b)) => a.partial_cmp(&(*b as f64)),
            (Self::String(a), Self::String(b)) => a.partial_cmp(b),
            (Self::Date(a), Self::Date(b)) => a.partial_cmp(b),
            (a, b) => match (a.as_timestamp(), b.as_timestamp()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "'{v}'"),
            Self::Date(v) => write!(f, "{v}"),
            Self::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<NaiveDate> for ScalarValue {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<DateTime<Utc>> for ScalarValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

/// One row: values positionally aligned with a column list.
pub type Row = Vec<ScalarValue>;

/// A batch of rows sharing one column list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowBatch {
    /// Column names, in row order.
    pub columns: Vec<String>,
    /// Row values.
    pub rows: Vec<Row>,
}

impl RowBatch {
    /// Creates a batch.
    #[must_use]
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// Creates an empty batch with the given columns.
    #[must_use]
    pub fn empty(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true when the batch holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of `column` in the column list.
    #[must_use]
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    /// Value of `column` in row `row`, if both exist.
    #[must_use]
    pub fn value(&self, row: usize, column: &str) -> Option<&ScalarValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Splits the batch into chunks of at most `chunk_rows` rows.
    ///
    /// An empty batch yields no chunks. `chunk_rows` of zero is treated as one.
    #[must_use]
    pub fn into_chunks(self, chunk_rows: usize) -> Vec<Self> {
        let chunk_rows = chunk_rows.max(1);
        let columns = self.columns;
        let mut chunks = Vec::with_capacity(self.rows.len().div_ceil(chunk_rows));
        let mut rows = self.rows.into_iter().peekable();
        while rows.peek().is_some() {
            let chunk: Vec<Row> = rows.by_ref().take(chunk_rows).collect();
            chunks.push(Self::new(columns.clone(), chunk));
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_values_compare_across_int_and_float() {
        assert!(ScalarValue::Int64(2) < ScalarValue::Float64(2.5));
        assert!(ScalarValue::Float64(3.0) > ScalarValue::Int64(2));
    }

    #[test]
    fn dates_and_timestamps_share_a_timeline() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let ts = d.and_hms_opt(12, 0, 0).unwrap().and_utc();
        assert!(ScalarValue::Date(d) < ScalarValue::Timestamp(ts));
    }

    #[test]
    fn unrelated_families_are_unordered() {
        assert_eq!(
            ScalarValue::Int64(1).partial_cmp(&ScalarValue::String("1".into())),
            None
        );
        assert_eq!(
            ScalarValue::max_of(&ScalarValue::Int64(1), &ScalarValue::Boolean(true)),
            None
        );
    }

    #[test]
    fn into_chunks_respects_chunk_size() {
        let rows = (0..5).map(|i| vec![ScalarValue::Int64(i)]).collect();
        let chunks = RowBatch::new(vec!["n".into()], rows).into_chunks(2);
        let sizes: Vec<_> = chunks.iter().map(RowBatch::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(chunks.iter().all(|c| c.columns == vec!["n".to_string()]));
    }

    #[test]
    fn empty_batch_has_no_chunks() {
        assert!(RowBatch::empty(vec!["a".into()]).into_chunks(10).is_empty());
    }
}
