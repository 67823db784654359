use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::FlagStore;
use crate::entity::{
    Constraint, Distribution, Flag, FlagSnapshot, FlagState, Id, NewConstraint, NewDistribution,
    Segment, Variant,
};
use crate::error::StoreError;

/// In-memory flag storage backed by a `Mutex` over ordered maps.
///
/// Enforces the same referential rules as the SQL schema: deleting a
/// segment drops its constraints and distributions, and a variant cannot be
/// deleted while a distribution points at it.
pub struct MemoryStore {
    data: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    next_id: Id,
    flags: BTreeMap<Id, Flag>,
    variants: BTreeMap<Id, Variant>,
    segments: BTreeMap<Id, Segment>,
    constraints: BTreeMap<Id, Constraint>,
    distributions: BTreeMap<Id, Distribution>,
    snapshots: Vec<FlagSnapshot>,
}

impl Tables {
    fn next_id(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }

    fn insert_segment(
        &mut self,
        flag_id: Id,
        description: &str,
        rollout_percent: u32,
        rank: i64,
    ) -> Segment {
        let segment = Segment {
            id: self.next_id(),
            flag_id,
            description: description.to_string(),
            rollout_percent,
            rank,
        };
        self.segments.insert(segment.id, segment.clone());
        segment
    }

    fn remove_segments(&mut self, ids: &HashSet<Id>) {
        self.segments.retain(|id, _| !ids.contains(id));
        self.constraints.retain(|_, c| !ids.contains(&c.segment_id));
        self.distributions.retain(|_, d| !ids.contains(&d.segment_id));
    }

    fn remove_variants(&mut self, ids: &HashSet<Id>) -> Result<(), StoreError> {
        if let Some(d) = self
            .distributions
            .values()
            .find(|d| ids.contains(&d.variant_id))
        {
            return Err(StoreError::Integrity(format!(
                "variant {} is still referenced by distribution {}",
                d.variant_id, d.id
            )));
        }
        self.variants.retain(|id, _| !ids.contains(id));
        Ok(())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(Tables::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.data
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }

    /// Insert a segment with an explicit rank. Lets callers reproduce state
    /// written by other tools, such as several segments sharing one rank.
    pub fn insert_segment(
        &self,
        flag_id: Id,
        description: &str,
        rollout_percent: u32,
        rank: i64,
    ) -> Result<Segment, StoreError> {
        let mut data = self.lock()?;
        Ok(data.insert_segment(flag_id, description, rollout_percent, rank))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FlagStore for MemoryStore {
    fn get_or_create_flag(&self, name: &str) -> Result<Flag, StoreError> {
        let mut data = self.lock()?;
        if let Some(flag) = data.flags.values().find(|f| f.name == name) {
            return Ok(flag.clone());
        }
        let flag = Flag {
            id: data.next_id(),
            name: name.to_string(),
            description: String::new(),
            enabled: false,
        };
        data.flags.insert(flag.id, flag.clone());
        Ok(flag)
    }

    fn update_flag(
        &self,
        flag: &mut Flag,
        description: &str,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let mut data = self.lock()?;
        let stored = data.flags.get_mut(&flag.id).ok_or(StoreError::NotFound {
            kind: "flag",
            id: flag.id,
        })?;
        stored.description = description.to_string();
        stored.enabled = enabled;
        *flag = stored.clone();
        Ok(())
    }

    fn get_flag(&self, flag_id: Id) -> Result<Option<Flag>, StoreError> {
        Ok(self.lock()?.flags.get(&flag_id).cloned())
    }

    fn list_flags(&self) -> Result<Vec<Flag>, StoreError> {
        let mut flags: Vec<Flag> = self.lock()?.flags.values().cloned().collect();
        flags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(flags)
    }

    fn delete_flags_not_in(&self, names: &[String]) -> Result<usize, StoreError> {
        let mut data = self.lock()?;
        let doomed: HashSet<Id> = data
            .flags
            .values()
            .filter(|f| !names.contains(&f.name))
            .map(|f| f.id)
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let segments: HashSet<Id> = data
            .segments
            .values()
            .filter(|s| doomed.contains(&s.flag_id))
            .map(|s| s.id)
            .collect();
        data.remove_segments(&segments);

        let variants: HashSet<Id> = data
            .variants
            .values()
            .filter(|v| doomed.contains(&v.flag_id))
            .map(|v| v.id)
            .collect();
        data.remove_variants(&variants)?;

        data.flags.retain(|id, _| !doomed.contains(id));
        Ok(doomed.len())
    }

    fn ensure_variants_exist(
        &self,
        flag_id: Id,
        keys: &[String],
    ) -> Result<Vec<Variant>, StoreError> {
        let mut data = self.lock()?;
        let mut result = Vec::with_capacity(keys.len());
        for key in keys {
            let existing = data
                .variants
                .values()
                .find(|v| v.flag_id == flag_id && &v.key == key)
                .cloned();
            let variant = match existing {
                Some(variant) => variant,
                None => {
                    let variant = Variant {
                        id: data.next_id(),
                        flag_id,
                        key: key.clone(),
                        attachment: Default::default(),
                    };
                    data.variants.insert(variant.id, variant.clone());
                    variant
                }
            };
            result.push(variant);
        }
        Ok(result)
    }

    fn list_variants(&self, flag_id: Id) -> Result<Vec<Variant>, StoreError> {
        Ok(self
            .lock()?
            .variants
            .values()
            .filter(|v| v.flag_id == flag_id)
            .cloned()
            .collect())
    }

    fn delete_variants_not_in(&self, flag_id: Id, keys: &[String]) -> Result<usize, StoreError> {
        let mut data = self.lock()?;
        let doomed: HashSet<Id> = data
            .variants
            .values()
            .filter(|v| v.flag_id == flag_id && !keys.contains(&v.key))
            .map(|v| v.id)
            .collect();
        data.remove_variants(&doomed)?;
        Ok(doomed.len())
    }

    fn list_segments(&self, flag_id: Id) -> Result<Vec<Segment>, StoreError> {
        let mut segments: Vec<Segment> = self
            .lock()?
            .segments
            .values()
            .filter(|s| s.flag_id == flag_id)
            .cloned()
            .collect();
        segments.sort_by_key(Segment::order_key);
        Ok(segments)
    }

    fn append_segment(
        &self,
        flag_id: Id,
        description: &str,
        rollout_percent: u32,
    ) -> Result<Segment, StoreError> {
        let mut data = self.lock()?;
        let rank = data
            .segments
            .values()
            .filter(|s| s.flag_id == flag_id)
            .map(|s| s.rank + 1)
            .max()
            .unwrap_or(0);
        Ok(data.insert_segment(flag_id, description, rollout_percent, rank))
    }

    fn update_segment(
        &self,
        segment: &mut Segment,
        description: &str,
        rollout_percent: u32,
    ) -> Result<(), StoreError> {
        let mut data = self.lock()?;
        let stored = data
            .segments
            .get_mut(&segment.id)
            .ok_or(StoreError::NotFound {
                kind: "segment",
                id: segment.id,
            })?;
        stored.description = description.to_string();
        stored.rollout_percent = rollout_percent;
        *segment = stored.clone();
        Ok(())
    }

    fn delete_segments_after(
        &self,
        flag_id: Id,
        reference: &Segment,
    ) -> Result<usize, StoreError> {
        let mut data = self.lock()?;
        let doomed: HashSet<Id> = data
            .segments
            .values()
            .filter(|s| s.flag_id == flag_id && s.is_at_or_after(reference))
            .map(|s| s.id)
            .collect();
        data.remove_segments(&doomed);
        Ok(doomed.len())
    }

    fn replace_constraints(
        &self,
        segment_id: Id,
        constraints: &[NewConstraint],
    ) -> Result<Vec<Constraint>, StoreError> {
        let mut data = self.lock()?;
        if !data.segments.contains_key(&segment_id) {
            return Err(StoreError::NotFound {
                kind: "segment",
                id: segment_id,
            });
        }
        data.constraints.retain(|_, c| c.segment_id != segment_id);
        let mut created = Vec::with_capacity(constraints.len());
        for c in constraints {
            let constraint = Constraint {
                id: data.next_id(),
                segment_id,
                property: c.property.clone(),
                operator: c.operator.clone(),
                value: c.value.clone(),
            };
            data.constraints.insert(constraint.id, constraint.clone());
            created.push(constraint);
        }
        Ok(created)
    }

    fn list_constraints(&self, segment_id: Id) -> Result<Vec<Constraint>, StoreError> {
        Ok(self
            .lock()?
            .constraints
            .values()
            .filter(|c| c.segment_id == segment_id)
            .cloned()
            .collect())
    }

    fn replace_distributions(
        &self,
        segment_id: Id,
        distributions: &[NewDistribution],
    ) -> Result<Vec<Distribution>, StoreError> {
        let mut data = self.lock()?;
        if !data.segments.contains_key(&segment_id) {
            return Err(StoreError::NotFound {
                kind: "segment",
                id: segment_id,
            });
        }
        if let Some(d) = distributions
            .iter()
            .find(|d| !data.variants.contains_key(&d.variant_id))
        {
            return Err(StoreError::Integrity(format!(
                "distribution references missing variant {} ({})",
                d.variant_id, d.variant_key
            )));
        }
        data.distributions.retain(|_, d| d.segment_id != segment_id);
        let mut created = Vec::with_capacity(distributions.len());
        for d in distributions {
            let distribution = Distribution {
                id: data.next_id(),
                segment_id,
                variant_id: d.variant_id,
                variant_key: d.variant_key.clone(),
                percent: d.percent,
            };
            data.distributions
                .insert(distribution.id, distribution.clone());
            created.push(distribution);
        }
        Ok(created)
    }

    fn list_distributions(&self, segment_id: Id) -> Result<Vec<Distribution>, StoreError> {
        Ok(self
            .lock()?
            .distributions
            .values()
            .filter(|d| d.segment_id == segment_id)
            .cloned()
            .collect())
    }

    fn save_snapshot(
        &self,
        flag_id: Id,
        updated_by: &str,
        created_at: DateTime<Utc>,
        hash: &str,
        state: &FlagState,
    ) -> Result<FlagSnapshot, StoreError> {
        let mut data = self.lock()?;
        let snapshot = FlagSnapshot {
            id: data.next_id(),
            flag_id,
            updated_by: updated_by.to_string(),
            created_at,
            hash: hash.to_string(),
            state: state.clone(),
        };
        data.snapshots.push(snapshot.clone());
        Ok(snapshot)
    }

    fn list_snapshots(&self, flag_id: Id) -> Result<Vec<FlagSnapshot>, StoreError> {
        Ok(self
            .lock()?
            .snapshots
            .iter()
            .filter(|s| s.flag_id == flag_id)
            .cloned()
            .collect())
    }
}
