use crate::{CellId, SnapshotId};

/// Errors raised by snapshot and state cell operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// The snapshot was applied or disposed; it can no longer be read or written.
    #[error("snapshot {snapshot} is closed (applied or disposed)")]
    SnapshotClosed { snapshot: SnapshotId },

    /// No record of the cell is visible to the snapshot: the cell was created
    /// after the snapshot was taken, or in a snapshot that has not been applied.
    #[error("state cell {cell} has no record visible to snapshot {snapshot}")]
    NoReadableRecord { cell: CellId, snapshot: SnapshotId },

    #[error("cannot modify state in read-only snapshot {snapshot}")]
    ReadOnlyWrite { snapshot: SnapshotId },

    /// Another snapshot applied a conflicting write and no merge was possible.
    #[error("snapshot {snapshot} conflicts with applied changes to cells {cells:?}")]
    ApplyConflict {
        snapshot: SnapshotId,
        cells: Vec<CellId>,
    },

    #[error("snapshot {snapshot} was already applied")]
    AlreadyApplied { snapshot: SnapshotId },

    #[error("parent of snapshot {snapshot} was applied or disposed")]
    ParentClosed { snapshot: SnapshotId },

    #[error("the global snapshot cannot be applied; call send_apply_notifications")]
    GlobalApply,
}
