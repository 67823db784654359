//! Converges persisted flag state onto a desired-state [`Document`].
//!
//! Flags are matched by name and variants by key. Segments have no key:
//! the Nth segment of the document is the Nth persisted segment in
//! `(rank, id)` order, surplus persisted segments are deleted and missing
//! ones appended. Constraints and distributions are replaced wholesale.
//!
//! Writes happen in an order that never leaves a distribution pointing at
//! a missing variant: variants are ensured first, segments and their
//! distributions are rewritten next, and only then are stale variants
//! removed.
//!
//! A run stops at the first error. Flags synchronized before the error stay
//! synchronized; nothing is rolled back.

use std::collections::HashMap;

use tracing::{debug, info, info_span};

use crate::document::{
    DesiredConstraint, DesiredDistribution, DesiredFlag, DesiredSegment, Document,
};
use crate::entity::{Flag, Id, NewConstraint, NewDistribution, Segment};
use crate::error::{SyncError, ValidationError};
use crate::operator::Operator;
use crate::store::FlagStore;

/// Actor label recorded on snapshots when none is configured.
pub const DEFAULT_ACTOR: &str = "flagsync";

/// What a synchronization run did to one flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagReport {
    pub name: String,
    pub flag_id: Id,
    pub variants: usize,
    pub variants_deleted: usize,
    pub segments_updated: usize,
    pub segments_created: usize,
    pub segments_deleted: usize,
    pub snapshot_id: Id,
}

/// Outcome of a successful [`Reconciler::synchronize`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub flags: Vec<FlagReport>,
    pub flags_deleted: usize,
}

pub struct Reconciler<'a> {
    store: &'a dyn FlagStore,
    actor: String,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn FlagStore) -> Self {
        Self {
            store,
            actor: DEFAULT_ACTOR.to_string(),
        }
    }

    /// Label recorded as `updated_by` on every snapshot of this run.
    pub fn actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    /// Make persisted state match `document`, then delete flags the
    /// document no longer names.
    pub fn synchronize(&self, document: &Document) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();

        for desired in &document.flags {
            let _span = info_span!("flag", name = %desired.name).entered();
            info!("Synchronizing flag");
            let flag_report = self.synchronize_flag(desired)?;
            debug!(?flag_report, "Flag synchronized");
            report.flags.push(flag_report);
        }

        report.flags_deleted = self.store.delete_flags_not_in(&document.flag_names())?;
        if report.flags_deleted > 0 {
            info!(count = report.flags_deleted, "Deleted flags missing from document");
        }
        Ok(report)
    }

    fn synchronize_flag(&self, desired: &DesiredFlag) -> Result<FlagReport, SyncError> {
        let mut flag = self.store.get_or_create_flag(&desired.name)?;
        self.store
            .update_flag(&mut flag, &desired.description, desired.enabled)?;

        let variant_keys = desired.variant_keys();
        let variants = self.store.ensure_variants_exist(flag.id, &variant_keys)?;
        let variant_ids: HashMap<String, Id> =
            variants.into_iter().map(|v| (v.key, v.id)).collect();

        let mut report = FlagReport {
            name: flag.name.clone(),
            flag_id: flag.id,
            variants: variant_ids.len(),
            ..Default::default()
        };

        self.synchronize_segments(&flag, &desired.segments, &variant_ids, &mut report)?;

        // Only safe once every distribution of this flag has been rewritten.
        report.variants_deleted = self.store.delete_variants_not_in(flag.id, &variant_keys)?;

        report.snapshot_id = self.store.snapshot(flag.id, &self.actor)?.id;
        Ok(report)
    }

    fn synchronize_segments(
        &self,
        flag: &Flag,
        desired: &[DesiredSegment],
        variant_ids: &HashMap<String, Id>,
        report: &mut FlagReport,
    ) -> Result<(), SyncError> {
        let persisted = self.store.list_segments(flag.id)?;

        for (position, desired_segment) in desired.iter().enumerate() {
            if desired_segment.rollout > 100 {
                return Err(invalid(
                    flag,
                    ValidationError::RolloutOutOfRange {
                        segment: position,
                        rollout: desired_segment.rollout,
                    },
                ));
            }

            let segment = match persisted.get(position) {
                Some(existing) => {
                    let mut segment = existing.clone();
                    self.store.update_segment(
                        &mut segment,
                        &desired_segment.description,
                        desired_segment.rollout,
                    )?;
                    report.segments_updated += 1;
                    segment
                }
                None => {
                    report.segments_created += 1;
                    self.store.append_segment(
                        flag.id,
                        &desired_segment.description,
                        desired_segment.rollout,
                    )?
                }
            };
            debug!(position, segment_id = segment.id, "Segment aligned");

            self.synchronize_segment(flag, position, &segment, desired_segment, variant_ids)?;
        }

        if let Some(first_surplus) = persisted.get(desired.len()) {
            report.segments_deleted = self.store.delete_segments_after(flag.id, first_surplus)?;
            debug!(count = report.segments_deleted, "Deleted surplus segments");
        }
        Ok(())
    }

    fn synchronize_segment(
        &self,
        flag: &Flag,
        position: usize,
        segment: &Segment,
        desired: &DesiredSegment,
        variant_ids: &HashMap<String, Id>,
    ) -> Result<(), SyncError> {
        let constraints =
            build_constraints(position, &desired.constraints).map_err(|e| invalid(flag, e))?;
        self.store.replace_constraints(segment.id, &constraints)?;

        let distributions = build_distributions(position, &desired.distributions, variant_ids)
            .map_err(|e| invalid(flag, e))?;
        self.store
            .replace_distributions(segment.id, &distributions)?;
        Ok(())
    }
}

fn invalid(flag: &Flag, source: ValidationError) -> SyncError {
    SyncError::Validation {
        flag: flag.name.clone(),
        source,
    }
}

/// Translate document constraints into rows: operator tokens become codes
/// and values become their JSON encoding.
pub fn build_constraints(
    position: usize,
    desired: &[DesiredConstraint],
) -> Result<Vec<NewConstraint>, ValidationError> {
    desired
        .iter()
        .map(|c| {
            let operator =
                Operator::from_token(&c.operator).ok_or_else(|| ValidationError::UnknownOperator {
                    segment: position,
                    token: c.operator.clone(),
                })?;
            let value =
                serde_json::to_string(&c.value).map_err(|e| ValidationError::ConstraintValue {
                    segment: position,
                    property: c.property.clone(),
                    message: e.to_string(),
                })?;
            Ok(NewConstraint {
                property: c.property.clone(),
                operator: operator.code().to_string(),
                value,
            })
        })
        .collect()
}

/// Resolve variant keys and check that percentages add up to exactly 100.
pub fn build_distributions(
    position: usize,
    desired: &[DesiredDistribution],
    variant_ids: &HashMap<String, Id>,
) -> Result<Vec<NewDistribution>, ValidationError> {
    let mut distributions = Vec::with_capacity(desired.len());
    let mut total: u64 = 0;
    for d in desired {
        let variant_id =
            *variant_ids
                .get(&d.key)
                .ok_or_else(|| ValidationError::UnknownVariant {
                    segment: position,
                    key: d.key.clone(),
                })?;
        total += u64::from(d.percent);
        distributions.push(NewDistribution {
            variant_id,
            variant_key: d.key.clone(),
            percent: d.percent,
        });
    }
    if total != 100 {
        return Err(ValidationError::PercentSum {
            segment: position,
            total,
        });
    }
    Ok(distributions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constraint(operator: &str, value: serde_json::Value) -> DesiredConstraint {
        DesiredConstraint {
            property: "plan".into(),
            operator: operator.into(),
            value,
        }
    }

    fn distribution(key: &str, percent: u32) -> DesiredDistribution {
        DesiredDistribution {
            key: key.into(),
            percent,
        }
    }

    #[test]
    fn test_build_constraints_maps_operator_and_value() {
        let built = build_constraints(
            0,
            &[
                constraint("IN", serde_json::json!(["a", "b"])),
                constraint("=~", serde_json::json!("^beta")),
                constraint(">=", serde_json::json!(18)),
            ],
        )
        .unwrap();
        assert_eq!(built[0].operator, "IN");
        assert_eq!(built[0].value, r#"["a","b"]"#);
        assert_eq!(built[1].operator, "EREG");
        assert_eq!(built[1].value, r#""^beta""#);
        assert_eq!(built[2].operator, "GTE");
        assert_eq!(built[2].value, "18");
    }

    #[test]
    fn test_build_constraints_rejects_unknown_operator() {
        let err = build_constraints(
            3,
            &[
                constraint("==", serde_json::json!("x")),
                constraint("LIKE", serde_json::json!("x")),
            ],
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownOperator {
                segment: 3,
                token: "LIKE".into()
            }
        );
    }

    #[test]
    fn test_build_distributions_checks_sum() {
        let ids = HashMap::from([("on".to_string(), 7), ("off".to_string(), 8)]);
        let built =
            build_distributions(0, &[distribution("on", 30), distribution("off", 70)], &ids)
                .unwrap();
        assert_eq!(built[0].variant_id, 7);
        assert_eq!(built[1].variant_id, 8);

        let err = build_distributions(1, &[distribution("on", 90)], &ids).unwrap_err();
        assert_eq!(
            err,
            ValidationError::PercentSum {
                segment: 1,
                total: 90
            }
        );

        let err = build_distributions(0, &[], &ids).unwrap_err();
        assert_eq!(
            err,
            ValidationError::PercentSum {
                segment: 0,
                total: 0
            }
        );
    }

    #[test]
    fn test_build_distributions_rejects_undeclared_variant() {
        let ids = HashMap::from([("on".to_string(), 1)]);
        let err = build_distributions(
            2,
            &[distribution("on", 50), distribution("maybe", 50)],
            &ids,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownVariant {
                segment: 2,
                key: "maybe".into()
            }
        );
    }

    #[test]
    fn test_percent_sum_does_not_overflow() {
        let ids = HashMap::from([("on".to_string(), 1)]);
        let err = build_distributions(
            0,
            &[distribution("on", u32::MAX), distribution("on", u32::MAX)],
            &ids,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::PercentSum { .. }));
    }
}
