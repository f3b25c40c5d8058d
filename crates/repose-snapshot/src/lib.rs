//! # Snapshot state
//!
//! Repose keeps UI state in multi-version cells. Every read and write names a
//! [`Snapshot`], and each snapshot sees a consistent view of all cells:
//!
//! - the **global snapshot** is always open and sees the latest applied state;
//! - **read-only snapshots** freeze the state as of when they were taken;
//! - **mutable snapshots** additionally buffer their own writes until
//!   [`Snapshot::apply`] publishes them, or until they are disposed.
//!
//! ```rust
//! use repose_snapshot::*;
//!
//! let store = SnapshotStore::new();
//! let global = store.global_snapshot();
//! let count = StateCell::new(&global, 0).unwrap();
//!
//! let snapshot = store.take_mutable_snapshot();
//! count.set_untracked(&snapshot, 1).unwrap();
//!
//! // Not visible outside the snapshot until applied.
//! assert_eq!(count.get_untracked(&global).unwrap(), 0);
//! snapshot.apply().unwrap().check().unwrap();
//! assert_eq!(count.get_untracked(&global).unwrap(), 1);
//! ```
//!
//! ## Conflicts
//!
//! Applying a snapshot fails when another snapshot applied a different value
//! to a cell it also wrote, unless the cell's [`MutationPolicy`] merges the
//! two. A failed apply leaves the snapshot open; [`ApplyResult::check`]
//! disposes it and turns the failure into [`StateError::ApplyConflict`].
//!
//! ## Observation
//!
//! Tracked reads and writes report to an [`ObserverStack`]; the apply and
//! global write observers registered on the [`SnapshotStore`] hear about
//! changes once they become visible.

pub mod apply;
pub mod derived;
pub mod error;
pub mod id;
pub mod observer;
pub mod policy;
mod record;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod tests;

pub use apply::*;
pub use derived::*;
pub use error::*;
pub use id::{CellId, INVALID_SNAPSHOT, SnapshotId, SnapshotIdSet};
pub use observer::*;
pub use policy::*;
pub use snapshot::*;
pub use state::*;
pub use store::*;
