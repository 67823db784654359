//! Synchronizes a declarative feature-flag document into a flag store.
//!
//! ```no_run
//! use flagsync_lib::{Document, Reconciler, SqliteStore};
//!
//! let store = SqliteStore::open("flags.db").unwrap();
//! let document = Document::from_path("flags.yaml").unwrap();
//! let report = Reconciler::new(&store)
//!     .actor("nightly-sync")
//!     .synchronize(&document)
//!     .unwrap();
//! println!("synchronized {} flags", report.flags.len());
//! ```

pub mod document;
pub mod entity;
pub mod error;
pub mod operator;
pub mod reconcile;
pub mod store;

pub use document::{
    DesiredConstraint, DesiredDistribution, DesiredFlag, DesiredSegment, DesiredVariant, Document,
};
pub use entity::{FlagSnapshot, FlagState, Id};
pub use error::{DocumentError, StoreError, SyncError, ValidationError};
pub use operator::Operator;
pub use reconcile::{FlagReport, Reconciler, SyncReport, DEFAULT_ACTOR};
#[cfg(feature = "sled")]
pub use store::SledStore;
pub use store::{FlagStore, MemoryStore, SqliteStore};

/// Synchronize `document` into `store`, recording `actor` on snapshots.
pub fn synchronize(
    store: &dyn FlagStore,
    document: &Document,
    actor: &str,
) -> Result<SyncReport, SyncError> {
    Reconciler::new(store).actor(actor).synchronize(document)
}
