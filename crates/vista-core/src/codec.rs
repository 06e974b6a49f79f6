//! Block encoding seam.
//!
//! The physical byte layout of a block belongs to the block builder that a
//! deployment plugs in. vista only needs to turn a run of rows into bytes plus
//! per-column statistics, and to turn bytes back into rows for map tasks.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::ColumnRange;
use crate::value::{Row, RowBatch};

/// Rows decoded from one block.
pub type DecodedBlock = RowBatch;

/// One encoded block ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBlock {
    /// Encoded payload.
    pub bytes: Bytes,
    /// Number of rows in the block.
    pub rows: u64,
    /// Observed range per column.
    pub stats: BTreeMap<String, ColumnRange>,
}

/// Encodes rows into immutable blocks and decodes them back.
pub trait BlockCodec: Send + Sync + 'static {
    /// Short identifier recorded in generation manifests.
    fn name(&self) -> &'static str;

    /// Encodes `rows`, positionally aligned with `columns`.
    ///
    /// # Errors
    ///
    /// Returns an error if a row does not match the column list or the
    /// payload cannot be produced.
    fn encode(&self, columns: &[String], rows: &[Row]) -> Result<EncodedBlock>;

    /// Decodes a block produced by [`BlockCodec::encode`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the payload is malformed.
    fn decode(&self, bytes: &Bytes) -> Result<DecodedBlock>;
}

/// Computes per-column ranges over `rows`.
///
/// # Errors
///
/// Returns `Error::InvalidInput` if a row's width differs from `columns`.
pub fn column_stats(columns: &[String], rows: &[Row]) -> Result<BTreeMap<String, ColumnRange>> {
    let mut stats: BTreeMap<String, ColumnRange> = columns
        .iter()
        .map(|c| (c.clone(), ColumnRange::default()))
        .collect();
    for (i, row) in rows.iter().enumerate() {
        if row.len() != columns.len() {
            return Err(Error::InvalidInput(format!(
                "row {i} has {} values, expected {}",
                row.len(),
                columns.len()
            )));
        }
        for (column, value) in columns.iter().zip(row) {
            if let Some(range) = stats.get_mut(column) {
                range.observe(value);
            }
        }
    }
    Ok(stats)
}

const JSON_BLOCK_FORMAT: &str = "vista-json-block/v1";

#[derive(Serialize, Deserialize)]
struct JsonBlock {
    format: String,
    columns: Vec<String>,
    rows: Vec<Row>,
}

/// Reference codec storing a block as a JSON document with a column header.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBlockCodec;

impl BlockCodec for JsonBlockCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, columns: &[String], rows: &[Row]) -> Result<EncodedBlock> {
        let stats = column_stats(columns, rows)?;
        let block = JsonBlock {
            format: JSON_BLOCK_FORMAT.to_string(),
            columns: columns.to_vec(),
            rows: rows.to_vec(),
        };
        let bytes = serde_json::to_vec(&block)?;
        Ok(EncodedBlock {
            bytes: Bytes::from(bytes),
            rows: rows.len() as u64,
            stats,
        })
    }

    fn decode(&self, bytes: &Bytes) -> Result<DecodedBlock> {
        let block: JsonBlock = serde_json::from_slice(bytes)?;
        if block.format != JSON_BLOCK_FORMAT {
            return Err(Error::serialization(format!(
                "unsupported block format '{}'",
                block.format
            )));
        }
        if let Some((i, row)) = block
            .rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != block.columns.len())
        {
            return Err(Error::serialization(format!(
                "block row {i} has {} values for {} columns",
                row.len(),
                block.columns.len()
            )));
        }
        Ok(RowBatch::new(block.columns, block.rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ScalarValue;

    fn columns() -> Vec<String> {
        vec!["region".into(), "amount".into()]
    }

    #[test]
    fn encode_records_stats_and_decodes_back() {
        let rows = vec![
            vec![ScalarValue::from("north"), ScalarValue::Int64(5)],
            vec![ScalarValue::from("east"), ScalarValue::Null],
            vec![ScalarValue::from("west"), ScalarValue::Int64(-3)],
        ];
        let block = JsonBlockCodec.encode(&columns(), &rows).unwrap();
        assert_eq!(block.rows, 3);
        assert_eq!(block.stats["amount"], ColumnRange::new(-3_i64, 5_i64));
        assert_eq!(block.stats["region"], ColumnRange::new("east", "west"));

        let decoded = JsonBlockCodec.decode(&block.bytes).unwrap();
        assert_eq!(decoded.columns, columns());
        assert_eq!(decoded.rows, rows);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let rows = vec![vec![ScalarValue::Int64(1)]];
        assert!(matches!(
            JsonBlockCodec.encode(&columns(), &rows),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn short_stored_rows_fail_to_decode() {
        let err = JsonBlockCodec
            .decode(&Bytes::from_static(
                br#"{"format":"vista-json-block/v1","columns":["region","amount"],"rows":[["north"]]}"#,
            ))
            .unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }), "{err}");
    }

    #[test]
    fn foreign_payload_is_rejected() {
        let err = JsonBlockCodec
            .decode(&Bytes::from_static(br#"{"format":"other","columns":[],"rows":[]}"#))
            .unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
