use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use flagsync_lib::entity::{
    Constraint, Distribution, Flag, FlagSnapshot, FlagState, Id, NewConstraint, NewDistribution,
    Segment, Variant,
};
use flagsync_lib::{
    Document, FlagStore, MemoryStore, Reconciler, SqliteStore, StoreError, SyncError,
    ValidationError,
};

/// Wraps a store, logs every mutating call and checks after each one that
/// no distribution points at a missing variant.
struct RecordingStore<S> {
    inner: S,
    calls: Mutex<Vec<String>>,
}

impl<S: FlagStore> RecordingStore<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
        self.assert_no_dangling_references();
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn assert_no_dangling_references(&self) {
        for flag in self.inner.list_flags().unwrap() {
            let variants: HashSet<Id> = self
                .inner
                .list_variants(flag.id)
                .unwrap()
                .iter()
                .map(|v| v.id)
                .collect();
            for segment in self.inner.list_segments(flag.id).unwrap() {
                for d in self.inner.list_distributions(segment.id).unwrap() {
                    assert!(
                        variants.contains(&d.variant_id),
                        "distribution {} references missing variant {}",
                        d.id,
                        d.variant_id
                    );
                }
            }
        }
    }
}

impl<S: FlagStore> FlagStore for RecordingStore<S> {
    fn get_or_create_flag(&self, name: &str) -> Result<Flag, StoreError> {
        let flag = self.inner.get_or_create_flag(name)?;
        self.record(format!("get_or_create_flag {}", name));
        Ok(flag)
    }

    fn update_flag(&self, flag: &mut Flag, description: &str, enabled: bool) -> Result<(), StoreError> {
        self.inner.update_flag(flag, description, enabled)?;
        self.record(format!("update_flag {}", flag.name));
        Ok(())
    }

    fn get_flag(&self, flag_id: Id) -> Result<Option<Flag>, StoreError> {
        self.inner.get_flag(flag_id)
    }

    fn list_flags(&self) -> Result<Vec<Flag>, StoreError> {
        self.inner.list_flags()
    }

    fn delete_flags_not_in(&self, names: &[String]) -> Result<usize, StoreError> {
        let deleted = self.inner.delete_flags_not_in(names)?;
        self.record("delete_flags_not_in".to_string());
        Ok(deleted)
    }

    fn ensure_variants_exist(&self, flag_id: Id, keys: &[String]) -> Result<Vec<Variant>, StoreError> {
        let variants = self.inner.ensure_variants_exist(flag_id, keys)?;
        self.record(format!("ensure_variants_exist {:?}", keys));
        Ok(variants)
    }

    fn list_variants(&self, flag_id: Id) -> Result<Vec<Variant>, StoreError> {
        self.inner.list_variants(flag_id)
    }

    fn delete_variants_not_in(&self, flag_id: Id, keys: &[String]) -> Result<usize, StoreError> {
        let deleted = self.inner.delete_variants_not_in(flag_id, keys)?;
        self.record(format!("delete_variants_not_in {:?}", keys));
        Ok(deleted)
    }

    fn list_segments(&self, flag_id: Id) -> Result<Vec<Segment>, StoreError> {
        self.inner.list_segments(flag_id)
    }

    fn append_segment(&self, flag_id: Id, description: &str, rollout_percent: u32) -> Result<Segment, StoreError> {
        let segment = self.inner.append_segment(flag_id, description, rollout_percent)?;
        self.record(format!("append_segment {}", description));
        Ok(segment)
    }

    fn update_segment(&self, segment: &mut Segment, description: &str, rollout_percent: u32) -> Result<(), StoreError> {
        self.inner.update_segment(segment, description, rollout_percent)?;
        self.record(format!("update_segment {}", description));
        Ok(())
    }

    fn delete_segments_after(&self, flag_id: Id, reference: &Segment) -> Result<usize, StoreError> {
        let deleted = self.inner.delete_segments_after(flag_id, reference)?;
        self.record(format!("delete_segments_after {}", reference.id));
        Ok(deleted)
    }

    fn replace_constraints(&self, segment_id: Id, constraints: &[NewConstraint]) -> Result<Vec<Constraint>, StoreError> {
        let created = self.inner.replace_constraints(segment_id, constraints)?;
        self.record(format!("replace_constraints {}", segment_id));
        Ok(created)
    }

    fn list_constraints(&self, segment_id: Id) -> Result<Vec<Constraint>, StoreError> {
        self.inner.list_constraints(segment_id)
    }

    fn replace_distributions(&self, segment_id: Id, distributions: &[NewDistribution]) -> Result<Vec<Distribution>, StoreError> {
        let created = self.inner.replace_distributions(segment_id, distributions)?;
        self.record(format!("replace_distributions {}", segment_id));
        Ok(created)
    }

    fn list_distributions(&self, segment_id: Id) -> Result<Vec<Distribution>, StoreError> {
        self.inner.list_distributions(segment_id)
    }

    fn save_snapshot(
        &self,
        flag_id: Id,
        updated_by: &str,
        created_at: DateTime<Utc>,
        hash: &str,
        state: &FlagState,
    ) -> Result<FlagSnapshot, StoreError> {
        let snapshot = self
            .inner
            .save_snapshot(flag_id, updated_by, created_at, hash, state)?;
        self.record(format!("snapshot {}", flag_id));
        Ok(snapshot)
    }

    fn list_snapshots(&self, flag_id: Id) -> Result<Vec<FlagSnapshot>, StoreError> {
        self.inner.list_snapshots(flag_id)
    }
}

fn doc(yaml: &str) -> Document {
    Document::from_yaml_str(yaml).unwrap()
}

fn sync(store: &dyn FlagStore, yaml: &str) -> Result<flagsync_lib::SyncReport, SyncError> {
    Reconciler::new(store).actor("test").synchronize(&doc(yaml))
}

fn flag_id(store: &dyn FlagStore, name: &str) -> Id {
    store
        .list_flags()
        .unwrap()
        .into_iter()
        .find(|f| f.name == name)
        .map(|f| f.id)
        .unwrap_or_else(|| panic!("flag {} not found", name))
}

fn segment_ids(store: &dyn FlagStore, name: &str) -> Vec<Id> {
    store
        .list_segments(flag_id(store, name))
        .unwrap()
        .iter()
        .map(|s| s.id)
        .collect()
}

/// Segment yaml with a single distribution to `key`.
fn segments_yaml(count: usize, key: &str) -> String {
    (0..count)
        .map(|i| {
            format!(
                "      - description: seg-{i}\n        rollout: {rollout}\n        distributions:\n          - key: {key}\n            percent: 100\n",
                i = i,
                rollout = 10 * (i + 1),
                key = key
            )
        })
        .collect()
}

fn checkout_doc(segment_count: usize) -> String {
    let segments = if segment_count == 0 {
        " []\n".to_string()
    } else {
        format!("\n{}", segments_yaml(segment_count, "on"))
    };
    format!(
        "flags:\n  checkout:\n    description: new checkout\n    enabled: true\n    variants:\n      - key: on\n      - key: off\n    segments:{}",
        segments
    )
}

const FULL_DOC: &str = r#"
flags:
  checkout:
    description: new checkout
    enabled: true
    variants:
      - key: on
      - key: off
    segments:
      - description: staff
        rollout: 100
        constraints:
          - property: email
            operator: "=~"
            value: "@example\\.com$"
        distributions:
          - key: on
            percent: 100
      - description: everyone
        rollout: 25
        constraints:
          - property: country
            operator: IN
            value: [NL, LT]
          - property: age
            operator: ">="
            value: 18
        distributions:
          - key: on
            percent: 50
          - key: off
            percent: 50
  banner:
    description: welcome banner
    enabled: false
    variants:
      - key: shown
    segments:
      - rollout: 100
        distributions:
          - key: shown
            percent: 100
"#;

#[test]
fn test_sync_creates_full_state() {
    let store = MemoryStore::new();
    let report = sync(&store, FULL_DOC).unwrap();
    assert_eq!(report.flags.len(), 2);
    assert_eq!(report.flags[0].name, "checkout");
    assert_eq!(report.flags[0].segments_created, 2);
    assert_eq!(report.flags_deleted, 0);

    let state = store.load_flag_state(flag_id(&store, "checkout")).unwrap();
    assert_eq!(state.flag.description, "new checkout");
    assert!(state.flag.enabled);
    assert_eq!(state.variants.len(), 2);
    assert_eq!(state.segments.len(), 2);

    let everyone = &state.segments[1];
    assert_eq!(everyone.segment.description, "everyone");
    assert_eq!(everyone.segment.rollout_percent, 25);
    assert_eq!(everyone.constraints.len(), 2);
    assert_eq!(everyone.constraints[0].operator, "IN");
    assert_eq!(everyone.constraints[0].value, r#"["NL","LT"]"#);
    assert_eq!(everyone.constraints[1].operator, "GTE");
    assert_eq!(everyone.distributions.len(), 2);

    let staff = &state.segments[0];
    assert_eq!(staff.constraints[0].operator, "EREG");
    assert_eq!(staff.constraints[0].value, r#""@example\\.com$""#);
}

#[test]
fn test_sync_is_idempotent() {
    let store = MemoryStore::new();
    sync(&store, FULL_DOC).unwrap();
    let before = store.load_flag_state(flag_id(&store, "checkout")).unwrap();

    let report = sync(&store, FULL_DOC).unwrap();
    assert_eq!(report.flags[0].segments_updated, 2);
    assert_eq!(report.flags[0].segments_created, 0);
    assert_eq!(report.flags[0].segments_deleted, 0);
    assert_eq!(report.flags[0].variants_deleted, 0);

    let after = store.load_flag_state(flag_id(&store, "checkout")).unwrap();
    assert_eq!(before.flag, after.flag);
    assert_eq!(before.variants, after.variants);
    for (b, a) in before.segments.iter().zip(&after.segments) {
        assert_eq!(b.segment, a.segment);
        // Constraints and distributions are recreated, so only their
        // content is stable, not their ids.
        let strip_c = |c: &Constraint| (c.property.clone(), c.operator.clone(), c.value.clone());
        let strip_d = |d: &Distribution| (d.variant_id, d.variant_key.clone(), d.percent);
        assert_eq!(
            b.constraints.iter().map(strip_c).collect::<Vec<_>>(),
            a.constraints.iter().map(strip_c).collect::<Vec<_>>()
        );
        assert_eq!(
            b.distributions.iter().map(strip_d).collect::<Vec<_>>(),
            a.distributions.iter().map(strip_d).collect::<Vec<_>>()
        );
    }
}

#[test]
fn test_snapshot_written_on_every_sync() {
    let store = MemoryStore::new();
    sync(&store, FULL_DOC).unwrap();
    sync(&store, FULL_DOC).unwrap();

    let snapshots = store
        .list_snapshots(flag_id(&store, "banner"))
        .unwrap();
    assert_eq!(snapshots.len(), 2);
    assert!(snapshots.iter().all(|s| s.updated_by == "test"));
    assert_eq!(snapshots[0].state.flag.name, "banner");
}

#[test]
fn test_surplus_segments_are_deleted_in_place() {
    let store = MemoryStore::new();
    sync(&store, &checkout_doc(3)).unwrap();
    let initial = segment_ids(&store, "checkout");
    assert_eq!(initial.len(), 3);

    let report = sync(&store, &checkout_doc(2)).unwrap();
    assert_eq!(report.flags[0].segments_updated, 2);
    assert_eq!(report.flags[0].segments_deleted, 1);
    assert_eq!(segment_ids(&store, "checkout"), initial[..2].to_vec());
    let third = initial[2];
    assert!(store.list_distributions(third).unwrap().is_empty());
}

#[test]
fn test_missing_segments_are_appended() {
    let store = MemoryStore::new();
    sync(&store, &checkout_doc(1)).unwrap();
    let initial = segment_ids(&store, "checkout");

    let report = sync(&store, &checkout_doc(3)).unwrap();
    assert_eq!(report.flags[0].segments_updated, 1);
    assert_eq!(report.flags[0].segments_created, 2);

    let grown = segment_ids(&store, "checkout");
    assert_eq!(grown.len(), 3);
    assert_eq!(grown[0], initial[0]);
    assert!(!initial.contains(&grown[1]));
    assert!(!initial.contains(&grown[2]));

    let segments = store.list_segments(flag_id(&store, "checkout")).unwrap();
    let descriptions: Vec<&str> = segments.iter().map(|s| s.description.as_str()).collect();
    assert_eq!(descriptions, vec!["seg-0", "seg-1", "seg-2"]);
}

#[test]
fn test_zero_segments_deletes_all() {
    let store = MemoryStore::new();
    sync(&store, &checkout_doc(2)).unwrap();
    let report = sync(&store, &checkout_doc(0)).unwrap();
    assert_eq!(report.flags[0].segments_deleted, 2);
    assert!(segment_ids(&store, "checkout").is_empty());
}

#[test]
fn test_duplicate_ranks_break_ties_by_id() {
    let store = MemoryStore::new();
    let flag = store.get_or_create_flag("checkout").unwrap();
    let first = store.insert_segment(flag.id, "a", 0, 0).unwrap();
    store.insert_segment(flag.id, "b", 0, 0).unwrap();
    store.insert_segment(flag.id, "c", 0, 0).unwrap();

    sync(&store, &checkout_doc(1)).unwrap();
    assert_eq!(segment_ids(&store, "checkout"), vec![first.id]);
}

#[test]
fn test_percent_sum_aborts_before_distribution_write() {
    let store = RecordingStore::new(MemoryStore::new());
    let yaml = r#"
flags:
  first:
    variants:
      - key: on
    segments:
      - rollout: 100
        distributions:
          - key: on
            percent: 100
  second:
    variants:
      - key: on
      - key: off
    segments:
      - description: good
        rollout: 100
        distributions:
          - key: on
            percent: 100
      - description: bad
        rollout: 100
        constraints:
          - property: plan
            operator: "=="
            value: pro
        distributions:
          - key: on
            percent: 60
          - key: off
            percent: 30
"#;
    let err = sync(&store, yaml).unwrap_err();
    match &err {
        SyncError::Validation { flag, source } => {
            assert_eq!(flag, "second");
            assert_eq!(
                *source,
                ValidationError::PercentSum {
                    segment: 1,
                    total: 90
                }
            );
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(err.is_validation());

    // the earlier flag is fully converged
    let first = flag_id(&store, "first");
    assert_eq!(store.list_snapshots(first).unwrap().len(), 1);

    // the valid segment of the failing flag stays committed
    let segments = store.list_segments(flag_id(&store, "second")).unwrap();
    assert_eq!(segments.len(), 2);
    assert_eq!(store.list_distributions(segments[0].id).unwrap().len(), 1);

    // the invalid one kept its constraints but got no distributions
    let bad = &segments[1];
    assert_eq!(store.list_constraints(bad.id).unwrap().len(), 1);
    assert!(store.list_distributions(bad.id).unwrap().is_empty());
    assert!(!store
        .calls()
        .contains(&format!("replace_distributions {}", bad.id)));

    // and the run stopped: no flag deletion, no snapshot for the failing flag
    assert!(!store.calls().contains(&"delete_flags_not_in".to_string()));
    assert!(store
        .list_snapshots(flag_id(&store, "second"))
        .unwrap()
        .is_empty());
}

#[test]
fn test_unknown_operator_aborts_before_constraint_write() {
    let store = RecordingStore::new(MemoryStore::new());
    let yaml = r#"
flags:
  f:
    variants:
      - key: on
    segments:
      - rollout: 100
        constraints:
          - property: plan
            operator: LIKE
            value: pro
        distributions:
          - key: on
            percent: 100
"#;
    let err = sync(&store, yaml).unwrap_err();
    assert!(matches!(
        err,
        SyncError::Validation {
            source: ValidationError::UnknownOperator { segment: 0, .. },
            ..
        }
    ));
    assert!(!store
        .calls()
        .iter()
        .any(|c| c.starts_with("replace_constraints")));
}

#[test]
fn test_undeclared_variant_is_rejected() {
    let store = MemoryStore::new();
    let yaml = r#"
flags:
  f:
    variants:
      - key: on
    segments:
      - rollout: 100
        distributions:
          - key: missing
            percent: 100
"#;
    let err = sync(&store, yaml).unwrap_err();
    assert!(matches!(
        err,
        SyncError::Validation {
            source: ValidationError::UnknownVariant { .. },
            ..
        }
    ));
}

#[test]
fn test_rollout_above_hundred_is_rejected() {
    let store = RecordingStore::new(MemoryStore::new());
    let yaml = r#"
flags:
  f:
    variants:
      - key: on
    segments:
      - rollout: 150
        distributions:
          - key: on
            percent: 100
"#;
    let err = sync(&store, yaml).unwrap_err();
    assert!(matches!(
        err,
        SyncError::Validation {
            source: ValidationError::RolloutOutOfRange { rollout: 150, .. },
            ..
        }
    ));
    assert!(!store
        .calls()
        .iter()
        .any(|c| c.starts_with("append_segment")));
}

#[test]
fn test_variant_removed_only_after_distributions_rewritten() {
    let store = RecordingStore::new(MemoryStore::new());
    let before = r#"
flags:
  f:
    variants:
      - key: on
      - key: legacy
    segments:
      - rollout: 100
        distributions:
          - key: on
            percent: 50
          - key: legacy
            percent: 50
"#;
    let after = r#"
flags:
  f:
    variants:
      - key: on
    segments:
      - rollout: 100
        distributions:
          - key: on
            percent: 100
"#;
    sync(&store, before).unwrap();
    store.clear();

    let report = sync(&store, after).unwrap();
    assert_eq!(report.flags[0].variants_deleted, 1);

    let calls = store.calls();
    let rewrite = calls
        .iter()
        .position(|c| c.starts_with("replace_distributions"))
        .unwrap();
    let delete = calls
        .iter()
        .position(|c| c.starts_with("delete_variants_not_in"))
        .unwrap();
    let snapshot = calls.iter().position(|c| c.starts_with("snapshot")).unwrap();
    assert!(rewrite < delete);
    assert!(delete < snapshot);

    let keys: Vec<String> = store
        .list_variants(flag_id(&store, "f"))
        .unwrap()
        .into_iter()
        .map(|v| v.key)
        .collect();
    assert_eq!(keys, vec!["on"]);
}

#[test]
fn test_flags_missing_from_document_are_deleted() {
    let store = MemoryStore::new();
    sync(&store, FULL_DOC).unwrap();
    let banner = flag_id(&store, "banner");

    let report = sync(&store, &checkout_doc(1)).unwrap();
    assert_eq!(report.flags_deleted, 1);
    let names: Vec<String> = store
        .list_flags()
        .unwrap()
        .into_iter()
        .map(|f| f.name)
        .collect();
    assert_eq!(names, vec!["checkout"]);
    assert!(store.list_variants(banner).unwrap().is_empty());
}

#[test]
fn test_empty_document_deletes_everything() {
    let store = MemoryStore::new();
    sync(&store, FULL_DOC).unwrap();
    let report = sync(&store, "flags: {}").unwrap();
    assert!(report.flags.is_empty());
    assert_eq!(report.flags_deleted, 2);
    assert!(store.list_flags().unwrap().is_empty());
}

#[test]
fn test_sqlite_store_converges_like_memory() {
    let store = SqliteStore::open_in_memory().unwrap();
    sync(&store, &checkout_doc(3)).unwrap();
    let initial = segment_ids(&store, "checkout");

    sync(&store, &checkout_doc(2)).unwrap();
    assert_eq!(segment_ids(&store, "checkout"), initial[..2].to_vec());

    sync(&store, FULL_DOC).unwrap();
    let state = store.load_flag_state(flag_id(&store, "checkout")).unwrap();
    assert_eq!(state.segments.len(), 2);
    assert_eq!(state.segments[0].segment.id, initial[0]);
    assert_eq!(state.segments[1].distributions.len(), 2);

    let before = r#"
flags:
  checkout:
    variants:
      - key: off
    segments:
      - rollout: 100
        distributions:
          - key: off
            percent: 100
"#;
    let report = sync(&store, before).unwrap();
    assert_eq!(report.flags[0].variants_deleted, 1);
    assert_eq!(report.flags[0].segments_deleted, 1);
    assert_eq!(report.flags_deleted, 1);
    assert_eq!(store.list_snapshots(flag_id(&store, "checkout")).unwrap().len(), 4);
}
