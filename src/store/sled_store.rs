use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::FlagStore;
use crate::entity::{
    Constraint, Distribution, Flag, FlagSnapshot, FlagState, Id, NewConstraint, NewDistribution,
    Segment, Variant,
};
use crate::error::StoreError;

/// Persistent flag storage backed by sled.
///
/// Each entity kind lives in its own tree keyed by big-endian id, so a tree
/// scan yields rows in id order. Values are JSON. Cascades and the variant
/// reference check are done by hand.
pub struct SledStore {
    db: sled::Db,
    flags: sled::Tree,
    variants: sled::Tree,
    segments: sled::Tree,
    constraints: sled::Tree,
    distributions: sled::Tree,
    snapshots: sled::Tree,
}

impl SledStore {
    pub fn new(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            flags: db.open_tree("flags")?,
            variants: db.open_tree("variants")?,
            segments: db.open_tree("segments")?,
            constraints: db.open_tree("constraints")?,
            distributions: db.open_tree("distributions")?,
            snapshots: db.open_tree("snapshots")?,
            db,
        })
    }

    /// Open a sled database at the given directory path.
    pub fn open(data_dir: &str) -> Result<Self, StoreError> {
        Self::new(sled::open(data_dir)?)
    }

    /// Open a throwaway database that is removed on drop.
    pub fn open_temporary() -> Result<Self, StoreError> {
        Self::new(sled::Config::new().temporary(true).open()?)
    }

    /// Insert a segment with an explicit rank, bypassing rank assignment.
    pub fn insert_segment(
        &self,
        flag_id: Id,
        description: &str,
        rollout_percent: u32,
        rank: i64,
    ) -> Result<Segment, StoreError> {
        let segment = Segment {
            id: self.next_id()?,
            flag_id,
            description: description.to_string(),
            rollout_percent,
            rank,
        };
        put(&self.segments, segment.id, &segment)?;
        self.flush()?;
        Ok(segment)
    }

    fn next_id(&self) -> Result<Id, StoreError> {
        // sled ids start at zero; keep zero free so it never names a row
        Ok(self.db.generate_id()? + 1)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn remove_segments(&self, ids: &HashSet<Id>) -> Result<(), StoreError> {
        for c in scan::<Constraint>(&self.constraints)? {
            if ids.contains(&c.segment_id) {
                self.constraints.remove(c.id.to_be_bytes())?;
            }
        }
        for d in scan::<Distribution>(&self.distributions)? {
            if ids.contains(&d.segment_id) {
                self.distributions.remove(d.id.to_be_bytes())?;
            }
        }
        for id in ids {
            self.segments.remove(id.to_be_bytes())?;
        }
        Ok(())
    }

    fn remove_variants(&self, ids: &HashSet<Id>) -> Result<(), StoreError> {
        if let Some(d) = scan::<Distribution>(&self.distributions)?
            .into_iter()
            .find(|d| ids.contains(&d.variant_id))
        {
            return Err(StoreError::Integrity(format!(
                "variant {} is still referenced by distribution {}",
                d.variant_id, d.id
            )));
        }
        for id in ids {
            self.variants.remove(id.to_be_bytes())?;
        }
        Ok(())
    }

    fn require_segment(&self, segment_id: Id) -> Result<(), StoreError> {
        if self.segments.contains_key(segment_id.to_be_bytes())? {
            Ok(())
        } else {
            Err(StoreError::NotFound {
                kind: "segment",
                id: segment_id,
            })
        }
    }
}

fn put<T: Serialize>(tree: &sled::Tree, id: Id, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value)?;
    tree.insert(id.to_be_bytes(), bytes)?;
    Ok(())
}

fn get<T: DeserializeOwned>(tree: &sled::Tree, id: Id) -> Result<Option<T>, StoreError> {
    match tree.get(id.to_be_bytes())? {
        Some(ivec) => Ok(Some(serde_json::from_slice(&ivec)?)),
        None => Ok(None),
    }
}

fn scan<T: DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>, StoreError> {
    let mut rows = Vec::new();
    for item in tree.iter() {
        let (_, value) = item?;
        rows.push(serde_json::from_slice(&value)?);
    }
    Ok(rows)
}

impl FlagStore for SledStore {
    fn get_or_create_flag(&self, name: &str) -> Result<Flag, StoreError> {
        if let Some(flag) = scan::<Flag>(&self.flags)?
            .into_iter()
            .find(|f| f.name == name)
        {
            return Ok(flag);
        }
        let flag = Flag {
            id: self.next_id()?,
            name: name.to_string(),
            description: String::new(),
            enabled: false,
        };
        put(&self.flags, flag.id, &flag)?;
        self.flush()?;
        Ok(flag)
    }

    fn update_flag(
        &self,
        flag: &mut Flag,
        description: &str,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let mut stored: Flag = get(&self.flags, flag.id)?.ok_or(StoreError::NotFound {
            kind: "flag",
            id: flag.id,
        })?;
        stored.description = description.to_string();
        stored.enabled = enabled;
        put(&self.flags, stored.id, &stored)?;
        self.flush()?;
        *flag = stored;
        Ok(())
    }

    fn get_flag(&self, flag_id: Id) -> Result<Option<Flag>, StoreError> {
        get(&self.flags, flag_id)
    }

    fn list_flags(&self) -> Result<Vec<Flag>, StoreError> {
        let mut flags = scan::<Flag>(&self.flags)?;
        flags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(flags)
    }

    fn delete_flags_not_in(&self, names: &[String]) -> Result<usize, StoreError> {
        let doomed: HashSet<Id> = scan::<Flag>(&self.flags)?
            .into_iter()
            .filter(|f| !names.contains(&f.name))
            .map(|f| f.id)
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let segments: HashSet<Id> = scan::<Segment>(&self.segments)?
            .into_iter()
            .filter(|s| doomed.contains(&s.flag_id))
            .map(|s| s.id)
            .collect();
        self.remove_segments(&segments)?;

        let variants: HashSet<Id> = scan::<Variant>(&self.variants)?
            .into_iter()
            .filter(|v| doomed.contains(&v.flag_id))
            .map(|v| v.id)
            .collect();
        self.remove_variants(&variants)?;

        for id in &doomed {
            self.flags.remove(id.to_be_bytes())?;
        }
        self.flush()?;
        Ok(doomed.len())
    }

    fn ensure_variants_exist(
        &self,
        flag_id: Id,
        keys: &[String],
    ) -> Result<Vec<Variant>, StoreError> {
        let mut existing = self.list_variants(flag_id)?;
        let mut result = Vec::with_capacity(keys.len());
        for key in keys {
            let variant = match existing.iter().find(|v| &v.key == key) {
                Some(variant) => variant.clone(),
                None => {
                    let variant = Variant {
                        id: self.next_id()?,
                        flag_id,
                        key: key.clone(),
                        attachment: Default::default(),
                    };
                    put(&self.variants, variant.id, &variant)?;
                    existing.push(variant.clone());
                    variant
                }
            };
            result.push(variant);
        }
        self.flush()?;
        Ok(result)
    }

    fn list_variants(&self, flag_id: Id) -> Result<Vec<Variant>, StoreError> {
        Ok(scan::<Variant>(&self.variants)?
            .into_iter()
            .filter(|v| v.flag_id == flag_id)
            .collect())
    }

    fn delete_variants_not_in(&self, flag_id: Id, keys: &[String]) -> Result<usize, StoreError> {
        let doomed: HashSet<Id> = self
            .list_variants(flag_id)?
            .into_iter()
            .filter(|v| !keys.contains(&v.key))
            .map(|v| v.id)
            .collect();
        self.remove_variants(&doomed)?;
        self.flush()?;
        Ok(doomed.len())
    }

    fn list_segments(&self, flag_id: Id) -> Result<Vec<Segment>, StoreError> {
        let mut segments: Vec<Segment> = scan::<Segment>(&self.segments)?
            .into_iter()
            .filter(|s| s.flag_id == flag_id)
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
        let rank = self
            .list_segments(flag_id)?
            .iter()
            .map(|s| s.rank + 1)
            .max()
            .unwrap_or(0);
        self.insert_segment(flag_id, description, rollout_percent, rank)
    }

    fn update_segment(
        &self,
        segment: &mut Segment,
        description: &str,
        rollout_percent: u32,
    ) -> Result<(), StoreError> {
        let mut stored: Segment =
            get(&self.segments, segment.id)?.ok_or(StoreError::NotFound {
                kind: "segment",
                id: segment.id,
            })?;
        stored.description = description.to_string();
        stored.rollout_percent = rollout_percent;
        put(&self.segments, stored.id, &stored)?;
        self.flush()?;
        *segment = stored;
        Ok(())
    }

    fn delete_segments_after(
        &self,
        flag_id: Id,
        reference: &Segment,
    ) -> Result<usize, StoreError> {
        let doomed: HashSet<Id> = self
            .list_segments(flag_id)?
            .into_iter()
            .filter(|s| s.is_at_or_after(reference))
            .map(|s| s.id)
            .collect();
        self.remove_segments(&doomed)?;
        self.flush()?;
        Ok(doomed.len())
    }

    fn replace_constraints(
        &self,
        segment_id: Id,
        constraints: &[NewConstraint],
    ) -> Result<Vec<Constraint>, StoreError> {
        self.require_segment(segment_id)?;
        for old in self.list_constraints(segment_id)? {
            self.constraints.remove(old.id.to_be_bytes())?;
        }
        let mut created = Vec::with_capacity(constraints.len());
        for c in constraints {
            let constraint = Constraint {
                id: self.next_id()?,
                segment_id,
                property: c.property.clone(),
                operator: c.operator.clone(),
                value: c.value.clone(),
            };
            put(&self.constraints, constraint.id, &constraint)?;
            created.push(constraint);
        }
        self.flush()?;
        Ok(created)
    }

    fn list_constraints(&self, segment_id: Id) -> Result<Vec<Constraint>, StoreError> {
        Ok(scan::<Constraint>(&self.constraints)?
            .into_iter()
            .filter(|c| c.segment_id == segment_id)
            .collect())
    }

    fn replace_distributions(
        &self,
        segment_id: Id,
        distributions: &[NewDistribution],
    ) -> Result<Vec<Distribution>, StoreError> {
        self.require_segment(segment_id)?;
        for d in distributions {
            if !self.variants.contains_key(d.variant_id.to_be_bytes())? {
                return Err(StoreError::Integrity(format!(
                    "distribution references missing variant {} ({})",
                    d.variant_id, d.variant_key
                )));
            }
        }
        for old in self.list_distributions(segment_id)? {
            self.distributions.remove(old.id.to_be_bytes())?;
        }
        let mut created = Vec::with_capacity(distributions.len());
        for d in distributions {
            let distribution = Distribution {
                id: self.next_id()?,
                segment_id,
                variant_id: d.variant_id,
                variant_key: d.variant_key.clone(),
                percent: d.percent,
            };
            put(&self.distributions, distribution.id, &distribution)?;
            created.push(distribution);
        }
        self.flush()?;
        Ok(created)
    }

    fn list_distributions(&self, segment_id: Id) -> Result<Vec<Distribution>, StoreError> {
        Ok(scan::<Distribution>(&self.distributions)?
            .into_iter()
            .filter(|d| d.segment_id == segment_id)
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
        let snapshot = FlagSnapshot {
            id: self.next_id()?,
            flag_id,
            updated_by: updated_by.to_string(),
            created_at,
            hash: hash.to_string(),
            state: state.clone(),
        };
        put(&self.snapshots, snapshot.id, &snapshot)?;
        self.flush()?;
        Ok(snapshot)
    }

    fn list_snapshots(&self, flag_id: Id) -> Result<Vec<FlagSnapshot>, StoreError> {
        Ok(scan::<FlagSnapshot>(&self.snapshots)?
            .into_iter()
            .filter(|s| s.flag_id == flag_id)
            .collect())
    }
}
