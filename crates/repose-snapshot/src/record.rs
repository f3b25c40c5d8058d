use smallvec::SmallVec;

use crate::id::{INVALID_SNAPSHOT, SnapshotId, SnapshotIdSet, valid};

#[derive(Clone, Debug)]
pub(crate) struct Record<T> {
    pub snapshot_id: SnapshotId,
    /// Bumped on every write, including in-place overwrites.
    pub revision: u64,
    pub value: T,
}

/// Version history of one cell. At most one live record per snapshot id.
pub(crate) struct RecordChain<T> {
    records: SmallVec<[Record<T>; 2]>,
    revision: u64,
}

impl<T> RecordChain<T> {
    pub fn empty() -> Self {
        Self {
            records: SmallVec::new(),
            revision: 0,
        }
    }

    /// Index of the valid record with the highest snapshot id.
    pub fn readable_index(&self, id: SnapshotId, invalid: &SnapshotIdSet) -> Option<usize> {
        let mut candidate: Option<usize> = None;
        for (index, record) in self.records.iter().enumerate() {
            if !valid(record.snapshot_id, id, invalid) {
                continue;
            }
            match candidate {
                Some(c) if self.records[c].snapshot_id >= record.snapshot_id => {}
                _ => candidate = Some(index),
            }
        }
        candidate
    }

    pub fn readable(&self, id: SnapshotId, invalid: &SnapshotIdSet) -> Option<&Record<T>> {
        self.readable_index(id, invalid).map(|i| &self.records[i])
    }

    pub fn find(&self, snapshot_id: SnapshotId) -> Option<usize> {
        if snapshot_id == INVALID_SNAPSHOT {
            return None;
        }
        self.records
            .iter()
            .position(|r| r.snapshot_id == snapshot_id)
    }

    pub fn get(&self, index: usize) -> &Record<T> {
        &self.records[index]
    }

    pub fn overwrite(&mut self, index: usize, value: T) {
        self.revision += 1;
        let record = &mut self.records[index];
        record.value = value;
        record.revision = self.revision;
    }

    pub fn push(&mut self, snapshot_id: SnapshotId, value: T) {
        self.revision += 1;
        self.records.push(Record {
            snapshot_id,
            revision: self.revision,
            value,
        });
    }

    /// Retags records owned by an abandoned snapshot so no snapshot can see them.
    pub fn abandon(&mut self, owned: &SnapshotIdSet) {
        for record in self.records.iter_mut() {
            if owned.contains(record.snapshot_id) {
                record.snapshot_id = INVALID_SNAPSHOT;
            }
        }
    }

    /// Drops records no open snapshot can observe.
    ///
    /// Every open snapshot sees all ids up to `reuse_limit`, so below it only
    /// the newest record matters.
    pub fn prune(&mut self, reuse_limit: SnapshotId) {
        let empty = SnapshotIdSet::new();
        let floor = self
            .records
            .iter()
            .filter(|r| valid(r.snapshot_id, reuse_limit, &empty))
            .map(|r| r.snapshot_id)
            .max();
        self.records.retain(|r| {
            if r.snapshot_id == INVALID_SNAPSHOT {
                return false;
            }
            match floor {
                Some(floor) => r.snapshot_id >= floor,
                None => true,
            }
        });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}
