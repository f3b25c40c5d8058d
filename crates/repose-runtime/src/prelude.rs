pub use crate::applier::{Applier, MemoryApplier, MemoryNode};
pub use crate::composition::Composition;
pub use crate::config::RecomposerConfig;
pub use crate::effects::{Dispose, on_unmount};
pub use crate::error::{ComposeError, EffectFailure};
pub use crate::key;
pub use crate::recomposer::{DrainReport, Recomposer};
pub use crate::runtime::Composer;
pub use crate::scope::{Key, ScopeId, ScopeState};
pub use repose_snapshot::{
    DerivedState, MutationPolicy, NeverEqual, ReferentialEquality, Snapshot, SnapshotStore,
    StateCell, StateError, StructuralEquality,
};
