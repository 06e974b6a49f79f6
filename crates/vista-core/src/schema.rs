//! Column descriptions and value ranges.

use serde::{Deserialize, Serialize};

use crate::value::ScalarValue;

/// Role a column plays in an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnRole {
    /// Grouping / slicing attribute.
    Dimension,
    /// Aggregated value.
    Measure,
}

/// Declared column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Boolean.
    Boolean,
    /// 64-bit integer.
    Int64,
    /// 64-bit float.
    Float64,
    /// UTF-8 string.
    String,
    /// Calendar date.
    Date,
    /// UTC timestamp.
    Timestamp,
}

impl ColumnType {
    /// Date or timestamp.
    #[must_use]
    pub const fn is_temporal(self) -> bool {
        matches!(self, Self::Date | Self::Timestamp)
    }

    /// Integral numeric type.
    #[must_use]
    pub const fn is_integral(self) -> bool {
        matches!(self, Self::Int64)
    }
}

/// Reference to the dictionary that interns a column's values.
///
/// Dictionaries themselves are owned by the block encoder; vista only records
/// which one a column uses so that shared dictionaries survive artifact
/// deletion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "name", rename_all = "lowercase")]
pub enum DictionaryRef {
    /// Dictionary shared across artifacts.
    Shared(String),
    /// Dictionary private to one artifact.
    Private(String),
}

/// Observed `[min, max]` of a column's non-null values.
///
/// Ranges only ever widen: [`ColumnRange::widen`] returns the union of two
/// ranges, which makes merging associative and commutative.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnRange {
    /// Smallest observed value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<ScalarValue>,
    /// Largest observed value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<ScalarValue>,
}

impl ColumnRange {
    /// A range covering exactly `[min, max]`.
    #[must_use]
    pub fn new(min: impl Into<ScalarValue>, max: impl Into<ScalarValue>) -> Self {
        Self {
            min: Some(min.into()),
            max: Some(max.into()),
        }
    }

    /// Returns true when no value has been observed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    /// Widens the range to include `value`. Nulls are ignored.
    pub fn observe(&mut self, value: &ScalarValue) {
        if value.is_null() {
            return;
        }
        let single = Self {
            min: Some(value.clone()),
            max: Some(value.clone()),
        };
        *self = self.widen(&single);
    }

    /// Union of two ranges.
    ///
    /// Values of incomparable types never replace an existing bound.
    #[must_use]
    pub fn widen(&self, other: &Self) -> Self {
        Self {
            min: pick(self.min.as_ref(), other.min.as_ref(), ScalarValue::min_of),
            max: pick(self.max.as_ref(), other.max.as_ref(), ScalarValue::max_of),
        }
    }

    /// Returns true when `other` lies inside this range.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self.widen(other) == *self
    }
}

fn pick(
    a: Option<&ScalarValue>,
    b: Option<&ScalarValue>,
    f: fn(&ScalarValue, &ScalarValue) -> Option<ScalarValue>,
) -> Option<ScalarValue> {
    match (a, b) {
        (Some(a), Some(b)) => f(a, b).or_else(|| Some(a.clone())),
        (Some(v), None) | (None, Some(v)) => Some(v.clone()),
        (None, None) => None,
    }
}

/// One column of an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    /// Column name, unique within the artifact.
    pub name: String,
    /// Dimension or measure.
    pub role: ColumnRole,
    /// Declared type.
    pub data_type: ColumnType,
    /// Observed value range.
    #[serde(default)]
    pub range: ColumnRange,
    /// Dictionary used to encode the column, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dictionary: Option<DictionaryRef>,
}

impl Column {
    /// A dimension column.
    #[must_use]
    pub fn dimension(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            role: ColumnRole::Dimension,
            data_type,
            range: ColumnRange::default(),
            dictionary: None,
        }
    }

    /// A measure column.
    #[must_use]
    pub fn measure(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            role: ColumnRole::Measure,
            data_type,
            range: ColumnRange::default(),
            dictionary: None,
        }
    }

    /// Attaches a dictionary reference.
    #[must_use]
    pub fn with_dictionary(mut self, dictionary: DictionaryRef) -> Self {
        self.dictionary = Some(dictionary);
        self
    }

    /// Returns true when the two columns describe the same data, ignoring
    /// observed ranges and dictionaries.
    #[must_use]
    pub fn same_shape(&self, other: &Self) -> bool {
        self.name == other.name && self.role == other.role && self.data_type == other.data_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn observe_ignores_nulls() {
        let mut range = ColumnRange::default();
        range.observe(&ScalarValue::Null);
        assert!(range.is_empty());
        range.observe(&ScalarValue::Int64(4));
        range.observe(&ScalarValue::Int64(-2));
        assert_eq!(range, ColumnRange::new(-2_i64, 4_i64));
    }

    #[test]
    fn widen_never_narrows() {
        let wide = ColumnRange::new(0_i64, 100_i64);
        let narrow = ColumnRange::new(10_i64, 20_i64);
        assert_eq!(wide.widen(&narrow), wide);
        assert!(wide.contains(&narrow));
        assert!(!narrow.contains(&wide));
    }

    #[test]
    fn widen_with_empty_is_identity() {
        let r = ColumnRange::new(1_i64, 2_i64);
        assert_eq!(r.widen(&ColumnRange::default()), r);
        assert_eq!(ColumnRange::default().widen(&r), r);
    }

    fn arb_range() -> impl Strategy<Value = ColumnRange> {
        prop_oneof![
            Just(ColumnRange::default()),
            (-1000_i64..1000, 0_i64..1000).prop_map(|(lo, span)| ColumnRange::new(lo, lo + span)),
        ]
    }

    proptest! {
        #[test]
        fn widen_is_associative(a in arb_range(), b in arb_range(), c in arb_range()) {
            prop_assert_eq!(a.widen(&b).widen(&c), a.widen(&b.widen(&c)));
        }

        #[test]
        fn widen_is_commutative(a in arb_range(), b in arb_range()) {
            prop_assert_eq!(a.widen(&b), b.widen(&a));
        }
    }
}
