//! Range partitioning of an update condition.
//!
//! A partitioned build runs one sub-query per partition. Each partition
//! restricts the artifact's update condition to a half-open range of one
//! temporal or integer column:
//!
//! ```text
//! p0: (-inf, T1) OR col IS NULL
//! p1: [T1, T2)
//! ...
//! pN: [T(N-1), +inf)
//! ```
//!
//! The ranges are contiguous and exhaustive, and only the first partition
//! captures nulls, so the union of all partitions selects exactly the rows a
//! single build would. Any definition the partitioner cannot split safely
//! falls back to [`PartitionPlan::Single`] with the unmodified condition.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Months, Utc};
use vista_core::condition::{CompareOp, Condition, Junction, Term};
use vista_core::config::{PartitionConfig, VistaConfig};
use vista_core::definition::ArtifactDefinition;
use vista_core::schema::ColumnType;
use vista_core::value::ScalarValue;

/// Why a build runs unpartitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FallbackReason {
    /// Configured parallelism is one or less.
    SerialParallelism,
    /// The process runs in single-node mode.
    SingleNode,
    /// The update condition compares no temporal or integer column.
    NoPartitionColumn,
    /// An integer column qualifies but no numeric maximum is configured.
    NumericMaxUnset,
    /// The update condition's top-level junction is OR.
    DisjunctiveCondition,
    /// Both a persisted and a runtime pre-condition are present.
    AmbiguousPreCondition,
    /// Range bounds fall outside the representable calendar.
    RangeOverflow,
}

impl FallbackReason {
    /// Stable name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SerialParallelism => "parallelism <= 1",
            Self::SingleNode => "single-node mode",
            Self::NoPartitionColumn => "no partition column in update condition",
            Self::NumericMaxUnset => "numeric partition column without configured maximum",
            Self::DisjunctiveCondition => "update condition is a disjunction",
            Self::AmbiguousPreCondition => "persisted and runtime pre-conditions both set",
            Self::RangeOverflow => "partition bounds overflow the calendar",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One range of a partitioned build.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    /// Position in the plan; blocks are ordered by it.
    pub index: u32,
    /// Partition column.
    pub column: String,
    /// Inclusive lower bound; `None` is unbounded.
    pub lower: Option<ScalarValue>,
    /// Exclusive upper bound; `None` is unbounded.
    pub upper: Option<ScalarValue>,
    /// This partition also selects rows where the column is null.
    pub captures_nulls: bool,
    /// Full condition passed to the executor.
    pub condition: Condition,
}

impl Partition {
    /// Returns true if a partition-column value falls into this partition.
    #[must_use]
    pub fn contains(&self, value: &ScalarValue) -> bool {
        if value.is_null() {
            return self.captures_nulls;
        }
        let above = self
            .lower
            .as_ref()
            .is_none_or(|lo| value.partial_cmp(lo).is_some_and(Ordering::is_ge));
        let below = self
            .upper
            .as_ref()
            .is_none_or(|hi| value.partial_cmp(hi).is_some_and(Ordering::is_lt));
        above && below
    }
}

/// Result of partition planning.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionPlan {
    /// Build everything with one sub-query.
    Single {
        /// Unmodified build condition.
        condition: Condition,
        /// Why partitioning was not applied.
        reason: FallbackReason,
    },
    /// Build each range with its own sub-query.
    Partitioned {
        /// Partition column.
        column: String,
        /// Nominal end of the temporal span; `None` for numeric columns.
        horizon: Option<ScalarValue>,
        /// Partitions in index order.
        partitions: Vec<Partition>,
    },
}

impl PartitionPlan {
    /// Number of sub-queries the plan runs.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        match self {
            Self::Single { .. } => 1,
            Self::Partitioned { partitions, .. } => partitions.len(),
        }
    }

    /// Returns true for [`PartitionPlan::Partitioned`].
    #[must_use]
    pub const fn is_partitioned(&self) -> bool {
        matches!(self, Self::Partitioned { .. })
    }

    /// Fallback reason of a single plan.
    #[must_use]
    pub const fn fallback_reason(&self) -> Option<FallbackReason> {
        match self {
            Self::Single { reason, .. } => Some(*reason),
            Self::Partitioned { .. } => None,
        }
    }

    /// `(partition index, condition)` for every sub-query.
    #[must_use]
    pub fn jobs(&self) -> Vec<(u32, Condition)> {
        match self {
            Self::Single { condition, .. } => vec![(0, condition.clone())],
            Self::Partitioned { partitions, .. } => partitions
                .iter()
                .map(|p| (p.index, p.condition.clone()))
                .collect(),
        }
    }
}

enum PartitionColumn<'a> {
    Temporal { name: &'a str, data_type: ColumnType },
    Numeric { name: &'a str, max: i64 },
}

/// Splits update conditions into contiguous ranges.
#[derive(Debug, Clone)]
pub struct RangePartitioner {
    parallelism: usize,
    single_node: bool,
    config: PartitionConfig,
}

impl RangePartitioner {
    /// Creates a partitioner producing up to `parallelism` partitions.
    #[must_use]
    pub const fn new(parallelism: usize, single_node: bool, config: PartitionConfig) -> Self {
        Self {
            parallelism,
            single_node,
            config,
        }
    }

    /// Creates a partitioner from the build and partition settings.
    #[must_use]
    pub fn from_config(config: &VistaConfig) -> Self {
        Self::new(
            config.build.parallelism,
            config.build.single_node,
            config.partition.clone(),
        )
    }

    /// Desired partition count.
    #[must_use]
    pub const fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Plans the sub-queries of one build.
    ///
    /// `runtime_pre` is a per-build restriction in addition to the
    /// definition's persisted pre-condition. `now` anchors temporal ranges.
    #[must_use]
    pub fn plan(
        &self,
        definition: &ArtifactDefinition,
        runtime_pre: Option<&Condition>,
        now: DateTime<Utc>,
    ) -> PartitionPlan {
        let runtime_pre = runtime_pre.filter(|c| !c.is_empty());
        let base = base_condition(definition, runtime_pre);
        let single = |reason: FallbackReason| {
            tracing::debug!(artifact = %definition.id, %reason, "building unpartitioned");
            PartitionPlan::Single {
                condition: base.clone(),
                reason,
            }
        };

        if self.parallelism <= 1 {
            return single(FallbackReason::SerialParallelism);
        }
        if self.single_node {
            return single(FallbackReason::SingleNode);
        }
        let update = &definition.update_condition;
        if !update.is_empty() && update.junction == Junction::Or {
            return single(FallbackReason::DisjunctiveCondition);
        }
        if !definition.pre_condition.is_empty() && runtime_pre.is_some() {
            return single(FallbackReason::AmbiguousPreCondition);
        }

        let column = match self.partition_column(definition) {
            Ok(column) => column,
            Err(reason) => return single(reason),
        };
        let count = u32::try_from(self.parallelism).unwrap_or(u32::MAX);

        let (name, boundaries, horizon) = match column {
            PartitionColumn::Temporal { name, data_type } => {
                match self.temporal_boundaries(data_type, now, count) {
                    Some((boundaries, horizon)) => (name, boundaries, Some(horizon)),
                    None => return single(FallbackReason::RangeOverflow),
                }
            }
            PartitionColumn::Numeric { name, max } => {
                (name, numeric_boundaries(max, count), None)
            }
        };

        let partitions = build_partitions(name, &base, boundaries);
        tracing::debug!(
            artifact = %definition.id,
            column = name,
            partitions = partitions.len(),
            "planned partitioned build"
        );
        PartitionPlan::Partitioned {
            column: name.to_string(),
            horizon,
            partitions,
        }
    }

    fn partition_column<'a>(
        &self,
        definition: &'a ArtifactDefinition,
    ) -> Result<PartitionColumn<'a>, FallbackReason> {
        let mut integral = None;
        for name in definition.update_condition.compared_columns() {
            let Some(column) = definition.column(name) else {
                continue;
            };
            if column.data_type.is_temporal() {
                return Ok(PartitionColumn::Temporal {
                    name: column.name.as_str(),
                    data_type: column.data_type,
                });
            }
            if column.data_type.is_integral() && integral.is_none() {
                integral = Some(column.name.as_str());
            }
        }
        match (integral, self.config.numeric_max) {
            (Some(name), Some(max)) => Ok(PartitionColumn::Numeric { name, max }),
            (Some(_), None) => Err(FallbackReason::NumericMaxUnset),
            (None, _) => Err(FallbackReason::NoPartitionColumn),
        }
    }

    /// Boundaries `T1..T(n-1)` of the span `[now - history, now + horizon)`.
    fn temporal_boundaries(
        &self,
        data_type: ColumnType,
        now: DateTime<Utc>,
        count: u32,
    ) -> Option<(Vec<ScalarValue>, ScalarValue)> {
        let horizon_months = self.config.horizon_years.checked_mul(12)?;
        let total_months = self.config.history_months.saturating_add(horizon_months);
        let interval = self
            .config
            .interval_months
            .unwrap_or_else(|| (total_months / count).max(1));

        let start = now.checked_sub_months(Months::new(self.config.history_months))?;
        let horizon = now.checked_add_months(Months::new(horizon_months))?;

        let mut boundaries = Vec::with_capacity(count as usize);
        for k in 1..count {
            let Some(offset) = k.checked_mul(interval) else {
                break;
            };
            let Some(boundary) = start.checked_add_months(Months::new(offset)) else {
                break;
            };
            boundaries.push(temporal_value(data_type, boundary));
        }
        Some((boundaries, temporal_value(data_type, horizon)))
    }
}

fn temporal_value(data_type: ColumnType, ts: DateTime<Utc>) -> ScalarValue {
    match data_type {
        ColumnType::Date => ScalarValue::Date(ts.date_naive()),
        _ => ScalarValue::Timestamp(ts),
    }
}

/// Boundaries splitting `[0, max]` into `count` integer ranges.
fn numeric_boundaries(max: i64, count: u32) -> Vec<ScalarValue> {
    let mut boundaries: Vec<i64> = Vec::with_capacity(count as usize);
    for k in 1..count {
        let b = i128::from(max) * i128::from(k) / i128::from(count);
        let b = i64::try_from(b).unwrap_or(max);
        if boundaries.last().is_none_or(|&prev| b > prev) {
            boundaries.push(b);
        }
    }
    boundaries.into_iter().map(ScalarValue::Int64).collect()
}

fn base_condition(definition: &ArtifactDefinition, runtime_pre: Option<&Condition>) -> Condition {
    [Some(&definition.pre_condition), runtime_pre]
        .into_iter()
        .flatten()
        .filter(|c| !c.is_empty())
        .fold(definition.update_condition.clone(), |acc, pre| {
            acc.and(Term::group(pre.clone()))
        })
}

fn build_partitions(column: &str, base: &Condition, boundaries: Vec<ScalarValue>) -> Vec<Partition> {
    let count = boundaries.len() + 1;
    let mut partitions = Vec::with_capacity(count);
    let mut lower: Option<ScalarValue> = None;
    let mut uppers = boundaries.into_iter();

    for index in 0..count {
        let upper = uppers.next();
        let mut range: Vec<Term> = Vec::with_capacity(2);
        if let Some(lo) = &lower {
            range.push(Term::compare(column, CompareOp::GtEq, lo.clone()));
        }
        if let Some(hi) = &upper {
            range.push(Term::compare(column, CompareOp::Lt, hi.clone()));
        }

        let captures_nulls = index == 0;
        let condition = if captures_nulls && !range.is_empty() {
            let bounded = if range.len() == 1 {
                range.remove(0)
            } else {
                Term::group(Condition::all(range))
            };
            base.clone()
                .and(Term::group(Condition::any(vec![bounded, Term::is_null(column)])))
        } else {
            range.into_iter().fold(base.clone(), Condition::and)
        };

        partitions.push(Partition {
            index: u32::try_from(index).unwrap_or(u32::MAX),
            column: column.to_string(),
            lower: lower.take(),
            upper: upper.clone(),
            captures_nulls,
            condition,
        });
        lower = upper;
    }
    partitions
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use proptest::prelude::*;
    use serde_json::json;
    use vista_core::plan::SourceQuery;
    use vista_core::schema::Column;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> ScalarValue {
        ScalarValue::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    fn dated_definition() -> ArtifactDefinition {
        ArtifactDefinition::new(
            "orders",
            "scope",
            SourceQuery::new("orders", json!({})),
            vec![
                Column::dimension("order_date", ColumnType::Date),
                Column::measure("amount", ColumnType::Int64),
            ],
        )
        .unwrap()
        .with_update_condition(Condition::all(vec![Term::compare(
            "order_date",
            CompareOp::GtEq,
            date(1970, 1, 1),
        )]))
    }

    fn numbered_definition() -> ArtifactDefinition {
        ArtifactDefinition::new(
            "events",
            "scope",
            SourceQuery::new("events", json!({})),
            vec![Column::dimension("seq", ColumnType::Int64)],
        )
        .unwrap()
        .with_update_condition(Condition::all(vec![Term::compare(
            "seq",
            CompareOp::GtEq,
            -1_000_i64,
        )]))
    }

    fn partitioner(parallelism: usize, config: PartitionConfig) -> RangePartitioner {
        RangePartitioner::new(parallelism, false, config)
    }

    fn quarterly() -> PartitionConfig {
        PartitionConfig {
            interval_months: Some(3),
            ..PartitionConfig::default()
        }
    }

    fn numeric(max: i64) -> PartitionConfig {
        PartitionConfig {
            numeric_max: Some(max),
            ..PartitionConfig::default()
        }
    }

    #[test]
    fn four_quarterly_date_partitions() {
        let plan = partitioner(4, quarterly()).plan(&dated_definition(), None, now());
        let PartitionPlan::Partitioned {
            column,
            horizon,
            partitions,
        } = plan
        else {
            panic!("expected partitioned plan");
        };
        assert_eq!(column, "order_date");
        assert_eq!(horizon, Some(date(2124, 6, 15)));

        let bounds: Vec<_> = partitions
            .iter()
            .map(|p| (p.lower.clone(), p.upper.clone()))
            .collect();
        assert_eq!(
            bounds,
            vec![
                (None, Some(date(2023, 9, 15))),
                (Some(date(2023, 9, 15)), Some(date(2023, 12, 15))),
                (Some(date(2023, 12, 15)), Some(date(2024, 3, 15))),
                (Some(date(2024, 3, 15)), None),
            ]
        );

        let null_catchers: Vec<u32> = partitions
            .iter()
            .filter(|p| p.captures_nulls)
            .map(|p| p.index)
            .collect();
        assert_eq!(null_catchers, vec![0]);
        assert!(partitions[0].condition.to_string().contains("order_date IS NULL"));
        assert!(!partitions[1].condition.to_string().contains("IS NULL"));
    }

    #[test]
    fn default_interval_divides_the_whole_span() {
        let plan = partitioner(4, PartitionConfig::default()).plan(&dated_definition(), None, now());
        let PartitionPlan::Partitioned { partitions, .. } = plan else {
            panic!("expected partitioned plan");
        };
        // (12 + 1200) / 4 = 303 months per interval, starting 12 months back.
        assert_eq!(partitions[0].upper, Some(date(2048, 9, 15)));
        assert_eq!(partitions.len(), 4);
    }

    #[test]
    fn partitions_are_contiguous() {
        let plan = partitioner(6, quarterly()).plan(&dated_definition(), None, now());
        let PartitionPlan::Partitioned { partitions, .. } = plan else {
            panic!("expected partitioned plan");
        };
        for pair in partitions.windows(2) {
            assert_eq!(pair[0].upper, pair[1].lower);
        }
        assert!(partitions.first().unwrap().lower.is_none());
        assert!(partitions.last().unwrap().upper.is_none());
    }

    #[test]
    fn dates_past_the_horizon_stay_in_the_last_partition() {
        let plan = partitioner(4, quarterly()).plan(&dated_definition(), None, now());
        let PartitionPlan::Partitioned {
            horizon, partitions, ..
        } = plan
        else {
            panic!("expected partitioned plan");
        };
        assert_eq!(horizon, Some(date(2124, 6, 15)));
        let late = date(2300, 1, 1);
        let hits: Vec<u32> = partitions
            .iter()
            .filter(|p| p.contains(&late))
            .map(|p| p.index)
            .collect();
        assert_eq!(hits, vec![3]);
    }

    #[test]
    fn numeric_partitions_split_the_configured_domain() {
        let plan = partitioner(4, numeric(100)).plan(&numbered_definition(), None, now());
        let PartitionPlan::Partitioned {
            partitions, horizon, ..
        } = plan
        else {
            panic!("expected partitioned plan");
        };
        assert!(horizon.is_none());
        let uppers: Vec<_> = partitions.iter().map(|p| p.upper.clone()).collect();
        assert_eq!(
            uppers,
            vec![
                Some(ScalarValue::Int64(25)),
                Some(ScalarValue::Int64(50)),
                Some(ScalarValue::Int64(75)),
                None
            ]
        );
    }

    #[test]
    fn tiny_numeric_domain_yields_fewer_partitions() {
        let plan = partitioner(8, numeric(2)).plan(&numbered_definition(), None, now());
        assert!(plan.partition_count() < 8);
        assert!(plan.partition_count() >= 2);
    }

    #[test]
    fn fallbacks_keep_the_unmodified_condition() {
        let def = dated_definition();
        let cases = [
            (partitioner(1, quarterly()), FallbackReason::SerialParallelism),
            (
                RangePartitioner::new(4, true, quarterly()),
                FallbackReason::SingleNode,
            ),
        ];
        for (p, reason) in cases {
            let plan = p.plan(&def, None, now());
            assert_eq!(plan.fallback_reason(), Some(reason));
            assert_eq!(plan.jobs(), vec![(0, def.update_condition.clone())]);
        }
    }

    #[test]
    fn disjunctive_update_condition_falls_back() {
        let def = dated_definition().with_update_condition(Condition::any(vec![
            Term::compare("order_date", CompareOp::GtEq, date(2020, 1, 1)),
            Term::is_null("order_date"),
        ]));
        let plan = partitioner(4, quarterly()).plan(&def, None, now());
        assert_eq!(plan.fallback_reason(), Some(FallbackReason::DisjunctiveCondition));
    }

    #[test]
    fn two_pre_conditions_fall_back_and_apply_both() {
        let persisted = Condition::all(vec![Term::compare("amount", CompareOp::Gt, 0_i64)]);
        let runtime = Condition::all(vec![Term::compare("amount", CompareOp::Lt, 100_i64)]);
        let def = dated_definition().with_pre_condition(persisted);
        let plan = partitioner(4, quarterly()).plan(&def, Some(&runtime), now());
        assert_eq!(plan.fallback_reason(), Some(FallbackReason::AmbiguousPreCondition));
        let PartitionPlan::Single { condition, .. } = plan else {
            unreachable!()
        };
        assert_eq!(condition.terms.len(), 3);
    }

    #[test]
    fn single_pre_condition_is_applied_to_every_partition() {
        let runtime = Condition::all(vec![Term::compare("amount", CompareOp::Gt, 0_i64)]);
        let plan = partitioner(3, quarterly()).plan(&dated_definition(), Some(&runtime), now());
        assert!(plan.is_partitioned());
        for (_, condition) in plan.jobs() {
            assert!(condition.to_string().contains("amount > 0"));
        }
    }

    #[test]
    fn missing_or_unconfigured_columns_fall_back() {
        let def = dated_definition().with_update_condition(Condition::empty());
        assert_eq!(
            partitioner(4, quarterly()).plan(&def, None, now()).fallback_reason(),
            Some(FallbackReason::NoPartitionColumn)
        );
        assert_eq!(
            partitioner(4, PartitionConfig::default())
                .plan(&numbered_definition(), None, now())
                .fallback_reason(),
            Some(FallbackReason::NumericMaxUnset)
        );
    }

    fn row_value(v: Option<i64>) -> ScalarValue {
        v.map_or(ScalarValue::Null, ScalarValue::Int64)
    }

    proptest! {
        #[test]
        fn every_value_lands_in_exactly_one_numeric_partition(
            v in proptest::option::of(any::<i64>()),
            max in 1_i64..1_000_000,
            n in 2_usize..16,
        ) {
            let plan = partitioner(n, numeric(max)).plan(&numbered_definition(), None, now());
            let PartitionPlan::Partitioned { partitions, .. } = plan else {
                panic!("expected partitioned plan");
            };
            let value = row_value(v);
            let hits = partitions.iter().filter(|p| p.contains(&value)).count();
            prop_assert_eq!(hits, 1);
        }

        #[test]
        fn partition_union_matches_single_build(
            v in proptest::option::of(-2_000_i64..2_000),
            n in 2_usize..8,
        ) {
            let def = numbered_definition();
            let value = row_value(v);
            let lookup = |c: &str| (c == "seq").then_some(&value);
            let single = def.update_condition.evaluate(&lookup);
            let plan = partitioner(n, numeric(1_000)).plan(&def, None, now());
            let hits = plan.jobs().iter().filter(|(_, c)| c.evaluate(&lookup)).count();
            prop_assert_eq!(hits, usize::from(single));
        }

        #[test]
        fn every_date_lands_in_exactly_one_temporal_partition(
            days in -40_000_i64..40_000,
            n in 2_usize..12,
            interval in 1_u32..24,
        ) {
            let config = PartitionConfig { interval_months: Some(interval), ..PartitionConfig::default() };
            let plan = partitioner(n, config).plan(&dated_definition(), None, now());
            let PartitionPlan::Partitioned { partitions, .. } = plan else {
                panic!("expected partitioned plan");
            };
            let day = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap() + chrono::Duration::days(days);
            let value = ScalarValue::Date(day);
            prop_assert_eq!(partitions.iter().filter(|p| p.contains(&value)).count(), 1);
            prop_assert_eq!(partitions.iter().filter(|p| p.contains(&ScalarValue::Null)).count(), 1);
        }
    }
}
