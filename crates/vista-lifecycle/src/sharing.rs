//! Artifact sharing.
//!
//! Two definitions can be served by one artifact when they are in the same
//! scope, have equal fingerprints and break columns, and one of them holds
//! every column and every row of the other without losing published data.
//! The survivor takes over the other's registrations; the superseded
//! artifact is deleted.

use vista_core::definition::ArtifactDefinition;
use vista_core::id::ArtifactId;

/// Why two definitions stay separate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepReason {
    /// Both are the same artifact.
    SameArtifact,
    /// Different sharing scopes.
    DifferentScope,
    /// Different source fingerprints.
    DifferentFingerprint,
    /// Different break columns.
    DifferentBreakColumn,
    /// Neither column set contains the other.
    IncompatibleColumns,
    /// The would-be survivor lacks rows or published data of the other.
    WouldLoseData,
}

/// Outcome of comparing two definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareDecision {
    /// `survivor` absorbs `superseded`.
    Share {
        /// Artifact that stays.
        survivor: ArtifactId,
        /// Artifact that is deleted.
        superseded: ArtifactId,
    },
    /// Both stay registered.
    Keep {
        /// Why they cannot be shared.
        reason: KeepReason,
    },
}

/// One merge of the sharing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareStep {
    /// Artifact receiving the registrations.
    pub survivor: ArtifactId,
    /// Artifact whose registrations move and which is then deleted.
    pub superseded: ArtifactId,
}

/// Checks whether `survivor` can take over everything `other` serves.
///
/// # Errors
///
/// Returns the first [`KeepReason`] that prevents it.
pub fn can_absorb(
    survivor: &ArtifactDefinition,
    other: &ArtifactDefinition,
) -> Result<(), KeepReason> {
    if survivor.id == other.id {
        return Err(KeepReason::SameArtifact);
    }
    if survivor.sharing.scope != other.sharing.scope {
        return Err(KeepReason::DifferentScope);
    }
    if survivor.sharing.fingerprint != other.sharing.fingerprint {
        return Err(KeepReason::DifferentFingerprint);
    }
    if survivor.break_column != other.break_column {
        return Err(KeepReason::DifferentBreakColumn);
    }
    let covers_columns = other.columns.iter().all(|wanted| {
        survivor
            .column(&wanted.name)
            .is_some_and(|have| have.same_shape(wanted))
    });
    if !covers_columns {
        return Err(KeepReason::IncompatibleColumns);
    }
    let covers_rows =
        survivor.sharing.full_data || survivor.pre_condition == other.pre_condition;
    // has-data monotonicity: sharing never drops a published generation for
    // an unbuilt one
    let keeps_data = survivor.sharing.has_data || !other.sharing.has_data;
    if !covers_rows || !keeps_data {
        return Err(KeepReason::WouldLoseData);
    }
    Ok(())
}

/// Decides whether `existing` and `candidate` are shared, preferring
/// `existing` as the survivor.
#[must_use]
pub fn decide(existing: &ArtifactDefinition, candidate: &ArtifactDefinition) -> ShareDecision {
    match can_absorb(existing, candidate) {
        Ok(()) => ShareDecision::Share {
            survivor: existing.id,
            superseded: candidate.id,
        },
        Err(reason) => match can_absorb(candidate, existing) {
            Ok(()) => ShareDecision::Share {
                survivor: candidate.id,
                superseded: existing.id,
            },
            Err(_) => ShareDecision::Keep { reason },
        },
    }
}

/// Plans every share among `definitions` in a single pass.
///
/// Definitions are considered in order, so callers pass registered artifacts
/// (oldest first) before new candidates. Each one is first offered to the
/// artifacts still alive; if none absorbs it, it absorbs every alive
/// artifact it covers and joins them. A superseded artifact never becomes
/// alive again, and steps are meant to be applied in order: a survivor may
/// itself be superseded by a later step, taking its absorbed registrations
/// along.
#[must_use]
pub fn plan_shares(definitions: &[ArtifactDefinition]) -> Vec<ShareStep> {
    let mut alive: Vec<&ArtifactDefinition> = Vec::with_capacity(definitions.len());
    let mut steps = Vec::new();

    for next in definitions {
        if alive.iter().any(|a| a.id == next.id) {
            continue;
        }
        if let Some(survivor) = alive.iter().find(|a| can_absorb(a, next).is_ok()) {
            steps.push(ShareStep {
                survivor: survivor.id,
                superseded: next.id,
            });
            continue;
        }
        alive.retain(|a| {
            if can_absorb(next, a).is_ok() {
                steps.push(ShareStep {
                    survivor: next.id,
                    superseded: a.id,
                });
                false
            } else {
                true
            }
        });
        alive.push(next);
    }
    steps
}

/// Follows `steps` from `artifact` to the artifact that finally serves it.
#[must_use]
pub fn final_survivor(steps: &[ShareStep], artifact: ArtifactId) -> ArtifactId {
    steps
        .iter()
        .fold(artifact, |current, step| {
            if step.superseded == current {
                step.survivor
            } else {
                current
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use vista_core::condition::{CompareOp, Condition, Term};
    use vista_core::schema::{Column, ColumnType};
    use vista_test_utils::{sales_columns, sales_definition, sales_source};

    fn with_columns(names: &[&str]) -> ArtifactDefinition {
        let columns = sales_columns()
            .into_iter()
            .filter(|c| names.contains(&c.name.as_str()))
            .collect();
        ArtifactDefinition::new("view", "scope", sales_source(), columns).unwrap()
    }

    fn north_only() -> Condition {
        Condition::all(vec![Term::compare("region", CompareOp::Eq, "north")])
    }

    #[test]
    fn wider_artifact_absorbs_narrower_one() {
        let wide = sales_definition("scope");
        let narrow = with_columns(&["region", "amount"]);
        assert_eq!(
            decide(&narrow, &wide),
            ShareDecision::Share {
                survivor: wide.id,
                superseded: narrow.id
            }
        );
        assert_eq!(
            decide(&wide, &narrow),
            ShareDecision::Share {
                survivor: wide.id,
                superseded: narrow.id
            }
        );
    }

    #[test]
    fn equal_definitions_keep_the_existing_one() {
        let existing = sales_definition("scope");
        let candidate = sales_definition("scope");
        assert_eq!(
            decide(&existing, &candidate),
            ShareDecision::Share {
                survivor: existing.id,
                superseded: candidate.id
            }
        );
    }

    #[test]
    fn structural_mismatches_keep_both() {
        let base = sales_definition("scope");
        let keep = |other: &ArtifactDefinition| match decide(&base, other) {
            ShareDecision::Keep { reason } => reason,
            ShareDecision::Share { .. } => panic!("unexpected share"),
        };

        assert_eq!(keep(&sales_definition("other")), KeepReason::DifferentScope);
        assert_eq!(
            keep(&sales_definition("scope").with_break_column("region")),
            KeepReason::DifferentBreakColumn
        );

        let mut retyped = sales_definition("scope");
        retyped.columns[2] = Column::measure("amount", ColumnType::Float64);
        assert_eq!(keep(&retyped), KeepReason::IncompatibleColumns);

        let mut other_source = sales_definition("scope");
        other_source.source.payload = serde_json::json!({"select": ["region"]});
        other_source.refresh_fingerprint().unwrap();
        assert_eq!(keep(&other_source), KeepReason::DifferentFingerprint);
        assert_eq!(decide(&base, &base), ShareDecision::Keep { reason: KeepReason::SameArtifact });
    }

    #[test]
    fn published_data_is_never_dropped() {
        let mut built_narrow = with_columns(&["region", "amount"]);
        built_narrow.sharing.has_data = true;
        let unbuilt_wide = sales_definition("scope");

        assert_eq!(
            decide(&built_narrow, &unbuilt_wide),
            ShareDecision::Keep {
                reason: KeepReason::IncompatibleColumns
            }
        );
        assert_eq!(can_absorb(&unbuilt_wide, &built_narrow), Err(KeepReason::WouldLoseData));
    }

    #[test]
    fn restricted_rows_only_cover_the_same_restriction() {
        let restricted = sales_definition("scope").with_pre_condition(north_only());
        let full = sales_definition("scope");
        assert_eq!(can_absorb(&restricted, &full), Err(KeepReason::WouldLoseData));
        assert!(can_absorb(&full, &restricted).is_ok());

        let same_restriction = sales_definition("scope").with_pre_condition(north_only());
        assert!(can_absorb(&restricted, &same_restriction).is_ok());
    }

    #[test]
    fn one_survivor_absorbs_many() {
        let narrow_a = with_columns(&["region"]);
        let narrow_b = with_columns(&["amount"]);
        let wide = sales_definition("scope");
        let steps = plan_shares(&[narrow_a.clone(), narrow_b.clone(), wide.clone()]);

        assert_eq!(
            steps,
            vec![
                ShareStep { survivor: wide.id, superseded: narrow_a.id },
                ShareStep { survivor: wide.id, superseded: narrow_b.id },
            ]
        );
    }

    fn arb_definition() -> impl Strategy<Value = ArtifactDefinition> {
        (1_u8..8, any::<bool>(), 0_u8..3).prop_map(|(mask, has_data, restriction)| {
            let columns: Vec<Column> = sales_columns()
                .into_iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, c)| c)
                .collect();
            let mut def = ArtifactDefinition::new("view", "scope", sales_source(), columns).unwrap();
            if restriction > 0 {
                let region = if restriction == 1 { "north" } else { "south" };
                def = def.with_pre_condition(Condition::all(vec![Term::compare(
                    "region",
                    CompareOp::Eq,
                    region,
                )]));
            }
            def.sharing.has_data = has_data;
            def
        })
    }

    proptest! {
        #[test]
        fn single_pass_is_transitive_safe(defs in prop::collection::vec(arb_definition(), 1..7)) {
            let steps = plan_shares(&defs);

            for (i, step) in steps.iter().enumerate() {
                // superseded artifacts never come back
                prop_assert!(steps[i + 1..].iter().all(|later| later.survivor != step.superseded
                    && later.superseded != step.superseded));
            }
            for def in &defs {
                let last = final_survivor(&steps, def.id);
                prop_assert!(steps.iter().all(|s| s.superseded != last));
                if last != def.id {
                    let survivor = defs.iter().find(|d| d.id == last).unwrap();
                    prop_assert!(can_absorb(survivor, def).is_ok());
                }
            }
            // whatever remains alive is pairwise unshareable
            let alive: Vec<_> = defs
                .iter()
                .filter(|d| steps.iter().all(|s| s.superseded != d.id))
                .collect();
            for a in &alive {
                for b in &alive {
                    if a.id != b.id {
                        prop_assert!(can_absorb(a, b).is_err());
                    }
                }
            }
        }
    }
}
