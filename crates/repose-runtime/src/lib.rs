//! # Compositions and recomposition
//!
//! A [`Composition`] runs composable bodies and turns what they emit into calls
//! on an [`Applier`]. Every body runs as a **recompose scope**:
//!
//! - reads through the [`Composer`] subscribe the scope to the cell;
//! - when a snapshot touching that cell applies, the [`Recomposer`] schedules
//!   the scope again;
//! - [`Composition::perform_recompose`] re-executes only the scheduled scopes,
//!   ancestors first, then diffs what they emitted against the committed tree.
//!
//! ```rust
//! use repose_runtime::*;
//! use repose_snapshot::{SnapshotStore, StateCell};
//!
//! let store = SnapshotStore::new();
//! let count = StateCell::new(&store.global_snapshot(), 0).unwrap();
//! let recomposer = Recomposer::new(&store);
//! let mut composition = Composition::new(&recomposer, MemoryApplier::new());
//!
//! let cell = count.clone();
//! composition
//!     .compose_initial(move |cx| {
//!         let n = cx.read(&cell)?;
//!         cx.emit("label", format!("Count = {n}"));
//!         Ok(())
//!     })
//!     .unwrap();
//! assert_eq!(composition.applier().values(), ["Count = 0"]);
//!
//! store
//!     .with_mutable_snapshot(|s| count.set_untracked(s, 1))
//!     .unwrap()
//!     .unwrap();
//! composition.perform_recompose().unwrap();
//! assert_eq!(composition.applier().values(), ["Count = 1"]);
//! ```
//!
//! ## Identity
//!
//! Emitted nodes and child scopes are identified by a [`Key`] plus how many
//! earlier siblings used the same key. Reordering keyed children moves them;
//! the [`key!`] macro derives a key from the call site.
//!
//! ## Remembered state
//!
//! - `remember` and `remember_state` are order-based: the Nth call in a scope
//!   always refers to the Nth stored value.
//! - `remember_with_key` is key-based and stable across conditional branches.
//! - `remember_cell` keeps a [`StateCell`](repose_snapshot::StateCell) alive
//!   for the lifetime of the scope.
//!
//! ## Effects and cleanup
//!
//! Effects are queued while bodies run and only execute once the node tree is
//! up to date:
//!
//! ```rust
//! use repose_runtime::*;
//!
//! fn example(cx: &mut Composer<'_, String>) -> Result<(), ComposeError> {
//!     cx.launched_effect(|| {
//!         log::info!("mounted");
//!         on_unmount(|| log::info!("unmounted"))
//!     });
//!     cx.emit("box", "Box".to_string());
//!     Ok(())
//! }
//! ```
//!
//! Unmount handlers run in reverse registration order, so a child is torn down
//! before its parent. A panicking effect is reported in
//! [`DrainReport::effect_failures`] and does not stop the others.

pub mod applier;
pub mod composition;
pub mod config;
pub mod diff;
pub mod effects;
pub mod effects_ext;
pub mod error;
pub mod prelude;
mod reactive;
pub mod recomposer;
pub mod runtime;
pub mod scope;

pub use applier::*;
pub use composition::Composition;
pub use config::*;
pub use diff::{DiffOp, keyed_diff};
pub use effects::{Dispose, on_unmount};
pub use error::{ComposeError, EffectFailure};
pub use recomposer::{DrainReport, Recomposer};
pub use runtime::Composer;
pub use scope::{Container, Key, NodeId, ScopeFlags, ScopeId, ScopeState, SlotKey};

pub use repose_snapshot;
