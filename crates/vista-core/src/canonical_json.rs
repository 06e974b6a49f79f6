//! Canonical JSON serialization for deterministic hashing.
//!
//! Canonical JSON has:
//! - Object keys sorted lexicographically (UTF-8 byte order)
//! - No whitespace
//! - UTF-8 output
//!
//! Structural fingerprints hash canonical bytes, so two plans that differ only
//! in key insertion order (or in the naming keys passed to
//! [`to_canonical_bytes_without`]) produce identical bytes.

use std::io::Write;

use serde::Serialize;
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Errors that can occur during canonical JSON serialization.
#[derive(Debug, Error)]
pub enum CanonicalJsonError {
    /// Serde JSON conversion failed.
    #[error("serde_json error: {0}")]
    Serde(#[from] serde_json::Error),

    /// IO error during writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// UTF-8 encoding error (should never happen with valid JSON).
    #[error("UTF-8 encoding error")]
    Utf8Error,
}

/// Serialize `value` into canonical JSON bytes.
///
/// # Errors
///
/// Returns `CanonicalJsonError::Serde` if serialization fails.
#[must_use = "canonical bytes should be used for hashing"]
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalJsonError> {
    to_canonical_bytes_without(value, &[])
}

/// Serialize `value` into canonical JSON bytes, dropping every object entry
/// whose key is in `ignored_keys` (at any depth).
///
/// # Errors
///
/// Returns `CanonicalJsonError::Serde` if serialization fails.
#[must_use = "canonical bytes should be used for hashing"]
pub fn to_canonical_bytes_without<T: Serialize>(
    value: &T,
    ignored_keys: &[&str],
) -> Result<Vec<u8>, CanonicalJsonError> {
    let v = serde_json::to_value(value)?;
    let mut out = Vec::<u8>::new();
    write_value(&v, ignored_keys, &mut out)?;
    Ok(out)
}

/// Same as [`to_canonical_bytes`], but returns a UTF-8 String.
///
/// # Errors
///
/// Returns `CanonicalJsonError::Serde` if serialization fails, or
/// `CanonicalJsonError::Utf8Error` if UTF-8 conversion fails.
#[must_use = "canonical string should be used for hashing"]
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, CanonicalJsonError> {
    let bytes = to_canonical_bytes(value)?;
    String::from_utf8(bytes).map_err(|_| CanonicalJsonError::Utf8Error)
}

fn write_value(
    v: &Value,
    ignored: &[&str],
    out: &mut Vec<u8>,
) -> Result<(), CanonicalJsonError> {
    match v {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => write_number(n, out)?,
        Value::String(s) => serde_json::to_writer(&mut *out, s)?,
        Value::Array(arr) => {
            out.push(b'[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, ignored, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => write_object(map, ignored, out)?,
    }
    Ok(())
}

fn write_object(
    map: &Map<String, Value>,
    ignored: &[&str],
    out: &mut Vec<u8>,
) -> Result<(), CanonicalJsonError> {
    out.push(b'{');

    let mut entries: Vec<(&String, &Value)> = map
        .iter()
        .filter(|(k, _)| !ignored.contains(&k.as_str()))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    for (i, (k, val)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        serde_json::to_writer(&mut *out, k)?;
        out.push(b':');
        write_value(val, ignored, out)?;
    }

    out.push(b'}');
    Ok(())
}

fn write_number(n: &Number, out: &mut Vec<u8>) -> Result<(), CanonicalJsonError> {
    if let Some(i) = n.as_i64() {
        write!(out, "{i}")?;
    } else if let Some(u) = n.as_u64() {
        write!(out, "{u}")?;
    } else {
        // serde_json only holds finite floats; its formatting is shortest round-trip.
        serde_json::to_writer(&mut *out, n)?;
    }
    Ok(())
}
