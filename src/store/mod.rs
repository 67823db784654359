pub mod memory;
#[cfg(feature = "sled")]
pub mod sled_store;
pub mod sqlite;

use chrono::{DateTime, Utc};

use crate::entity::{
    Constraint, Distribution, Flag, FlagSnapshot, FlagState, Id, NewConstraint, NewDistribution,
    Segment, SegmentState, Variant,
};
use crate::error::StoreError;

pub use memory::MemoryStore;
#[cfg(feature = "sled")]
pub use sled_store::SledStore;
pub use sqlite::SqliteStore;

/// Access to persisted flag state. Implementations must be thread-safe.
///
/// Every operation either completes or returns an error; none of them
/// report partial success. There is no diffing logic here, that lives in
/// [`Reconciler`](crate::reconcile::Reconciler).
pub trait FlagStore: Send + Sync {
    /// Look up a flag by name, inserting an empty disabled one if missing.
    fn get_or_create_flag(&self, name: &str) -> Result<Flag, StoreError>;

    /// Overwrite description and enabled state of `flag`.
    fn update_flag(&self, flag: &mut Flag, description: &str, enabled: bool)
        -> Result<(), StoreError>;

    fn get_flag(&self, flag_id: Id) -> Result<Option<Flag>, StoreError>;

    /// All flags ordered by name.
    fn list_flags(&self) -> Result<Vec<Flag>, StoreError>;

    /// Delete every flag whose name is not in `names`, together with its
    /// variants, segments, constraints and distributions. Snapshots stay.
    /// Returns the number of flags deleted.
    fn delete_flags_not_in(&self, names: &[String]) -> Result<usize, StoreError>;

    /// Look up or insert one variant per key. The result follows the order
    /// of `keys`.
    fn ensure_variants_exist(&self, flag_id: Id, keys: &[String])
        -> Result<Vec<Variant>, StoreError>;

    fn list_variants(&self, flag_id: Id) -> Result<Vec<Variant>, StoreError>;

    /// Delete variants of the flag whose key is not in `keys`. Fails with
    /// [`StoreError::Integrity`] if a distribution still references one of
    /// them. Returns the number of variants deleted.
    fn delete_variants_not_in(&self, flag_id: Id, keys: &[String]) -> Result<usize, StoreError>;

    /// Segments of the flag in `(rank, id)` order.
    fn list_segments(&self, flag_id: Id) -> Result<Vec<Segment>, StoreError>;

    /// Insert a segment after every existing segment of the flag.
    fn append_segment(
        &self,
        flag_id: Id,
        description: &str,
        rollout_percent: u32,
    ) -> Result<Segment, StoreError>;

    /// Overwrite description and rollout of `segment`. The rank is kept.
    fn update_segment(
        &self,
        segment: &mut Segment,
        description: &str,
        rollout_percent: u32,
    ) -> Result<(), StoreError>;

    /// Delete the flag's segments ranked after `reference`, plus those with
    /// the same rank and an id at or above the reference id. The reference
    /// itself is therefore deleted too. Returns the number deleted.
    fn delete_segments_after(&self, flag_id: Id, reference: &Segment)
        -> Result<usize, StoreError>;

    /// Delete all constraints of the segment, then insert `constraints`.
    fn replace_constraints(
        &self,
        segment_id: Id,
        constraints: &[NewConstraint],
    ) -> Result<Vec<Constraint>, StoreError>;

    fn list_constraints(&self, segment_id: Id) -> Result<Vec<Constraint>, StoreError>;

    /// Delete all distributions of the segment, then insert `distributions`.
    fn replace_distributions(
        &self,
        segment_id: Id,
        distributions: &[NewDistribution],
    ) -> Result<Vec<Distribution>, StoreError>;

    fn list_distributions(&self, segment_id: Id) -> Result<Vec<Distribution>, StoreError>;

    /// Append a snapshot record. Callers normally go through [`snapshot`].
    ///
    /// [`snapshot`]: FlagStore::snapshot
    fn save_snapshot(
        &self,
        flag_id: Id,
        updated_by: &str,
        created_at: DateTime<Utc>,
        hash: &str,
        state: &FlagState,
    ) -> Result<FlagSnapshot, StoreError>;

    /// Snapshots of the flag, oldest first.
    fn list_snapshots(&self, flag_id: Id) -> Result<Vec<FlagSnapshot>, StoreError>;

    /// Read the full nested state of a flag.
    fn load_flag_state(&self, flag_id: Id) -> Result<FlagState, StoreError> {
        let flag = self.get_flag(flag_id)?.ok_or(StoreError::NotFound {
            kind: "flag",
            id: flag_id,
        })?;
        let variants = self.list_variants(flag_id)?;
        let mut segments = Vec::new();
        for segment in self.list_segments(flag_id)? {
            let constraints = self.list_constraints(segment.id)?;
            let distributions = self.list_distributions(segment.id)?;
            segments.push(SegmentState {
                segment,
                constraints,
                distributions,
            });
        }
        Ok(FlagState {
            flag,
            variants,
            segments,
        })
    }

    /// Record an immutable copy of the flag's current state, tagged with
    /// `actor`. Written unconditionally, even when nothing changed.
    fn snapshot(&self, flag_id: Id, actor: &str) -> Result<FlagSnapshot, StoreError> {
        let state = self.load_flag_state(flag_id)?;
        let hash = state.digest()?;
        self.save_snapshot(flag_id, actor, Utc::now(), &hash, &state)
    }
}
