use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Persisted row identifier. Unique per entity kind, never reused.
pub type Id = u64;

/// Opaque variant payload, passed through untouched.
pub type Attachment = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flag {
    pub id: Id,
    pub name: String,
    pub description: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub id: Id,
    pub flag_id: Id,
    pub key: String,
    #[serde(default)]
    pub attachment: Attachment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub id: Id,
    pub flag_id: Id,
    pub description: String,
    pub rollout_percent: u32,
    pub rank: i64,
}

impl Segment {
    /// Ordering key of persisted segments: rank first, identifier breaks ties.
    pub fn order_key(&self) -> (i64, Id) {
        (self.rank, self.id)
    }

    /// True when `self` sorts at or after `reference`.
    pub fn is_at_or_after(&self, reference: &Segment) -> bool {
        self.rank > reference.rank || (self.rank == reference.rank && self.id >= reference.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: Id,
    pub segment_id: Id,
    pub property: String,
    pub operator: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    pub id: Id,
    pub segment_id: Id,
    pub variant_id: Id,
    pub variant_key: String,
    pub percent: u32,
}

/// Constraint row to be inserted; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConstraint {
    pub property: String,
    pub operator: String,
    pub value: String,
}

/// Distribution row to be inserted; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDistribution {
    pub variant_id: Id,
    pub variant_key: String,
    pub percent: u32,
}

/// A segment together with the rows it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentState {
    #[serde(flatten)]
    pub segment: Segment,
    pub constraints: Vec<Constraint>,
    pub distributions: Vec<Distribution>,
}

/// Full persisted state of one flag, as captured by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagState {
    #[serde(flatten)]
    pub flag: Flag,
    pub variants: Vec<Variant>,
    pub segments: Vec<SegmentState>,
}

impl FlagState {
    /// SHA-1 of the JSON encoding. Equal states hash equally because every
    /// list is kept in persisted order.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        let mut hasher = Sha1::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Immutable historical copy of a flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSnapshot {
    pub id: Id,
    pub flag_id: Id,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub hash: String,
    pub state: FlagState,
}
