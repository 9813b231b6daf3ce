use ahash::AHashMap as HashMap;
use arrow::record_batch::RecordBatch;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::snapshot::SnapshotVersion;

/// A data value (or tombstone) with the version of the transaction that
/// wrote it.
///
/// Entries in the partition store keep a short chain of these so that reads
/// at an older [SnapshotVersion] still observe the value that was committed
/// at that point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    /// The row image, or `None` for a deletion tombstone.
    data: Option<Arc<RecordBatch>>,
    /// The version of the transaction that wrote this value.
    version: u64,
}

impl VersionedValue {
    /// Creates a new versioned value.
    pub fn new(data: Arc<RecordBatch>, version: u64) -> Self {
        Self {
            data: Some(data),
            version,
        }
    }

    /// Creates a deletion tombstone at the given version.
    pub fn tombstone(version: u64) -> Self {
        Self {
            data: None,
            version,
        }
    }

    /// Returns the row image, or `None` for a tombstone.
    pub fn data(&self) -> Option<&Arc<RecordBatch>> {
        self.data.as_ref()
    }

    /// Returns the version of the value.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether this value marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.data.is_none()
    }
}

/// The multi-versioned in-memory state of the partitions hosted by one node.
///
/// Each key holds its committed versions in ascending order. A read at a
/// snapshot returns the newest version the snapshot sees; writes from
/// not-yet-visible transactions never leak into an older snapshot's reads.
pub struct PartitionStore {
    entries: RwLock<HashMap<String, Vec<VersionedValue>>>,
}

impl PartitionStore {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Reads the value visible to `snapshot`, skipping newer concurrent
    /// writes. Tombstones and absent keys both read as `None`.
    pub fn read_at(&self, key: &str, snapshot: SnapshotVersion) -> Option<Arc<RecordBatch>> {
        let entries = self.entries.read();
        let chain = entries.get(key)?;
        chain
            .iter()
            .rev()
            .find(|v| snapshot.sees(v.version()))
            .and_then(|v| v.data().cloned())
    }

    /// Reads the newest committed value regardless of snapshot.
    pub fn read_latest(&self, key: &str) -> Option<Arc<RecordBatch>> {
        let entries = self.entries.read();
        entries
            .get(key)
            .and_then(|chain| chain.last())
            .and_then(|v| v.data().cloned())
    }

    /// The version of the newest committed write for `key`, or zero when the
    /// key was never written. Used for write-conflict checks against the
    /// batch snapshot.
    pub fn latest_version(&self, key: &str) -> u64 {
        let entries = self.entries.read();
        entries
            .get(key)
            .and_then(|chain| chain.last())
            .map(|v| v.version())
            .unwrap_or(0)
    }

    /// Appends a committed write (value or tombstone) for `key` at `version`.
    pub fn apply(&self, key: &str, value: Option<Arc<RecordBatch>>, version: u64) {
        let versioned = match value {
            Some(data) => VersionedValue::new(data, version),
            None => VersionedValue::tombstone(version),
        };
        let mut entries = self.entries.write();
        let chain = entries.entry(key.to_string()).or_default();
        // Versions arrive out of order when backups replay concurrent batches.
        let pos = chain.partition_point(|v| v.version() < version);
        chain.insert(pos, versioned);
    }

    /// Number of keys with at least one committed version.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store holds no keys at all.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for PartitionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn batch(v: i64) -> Arc<RecordBatch> {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        Arc::new(RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![v]))]).unwrap())
    }

    #[test]
    fn snapshot_read_skips_newer_writes() {
        let store = PartitionStore::new();
        store.apply("k", Some(batch(1)), 5);
        store.apply("k", Some(batch(2)), 9);

        let old = SnapshotVersion::new(5);
        let new = SnapshotVersion::new(9);

        assert_eq!(store.read_at("k", old), Some(batch(1)));
        assert_eq!(store.read_at("k", new), Some(batch(2)));
        assert_eq!(store.read_at("k", SnapshotVersion::new(4)), None);
    }

    #[test]
    fn tombstone_hides_value() {
        let store = PartitionStore::new();
        store.apply("k", Some(batch(1)), 3);
        store.apply("k", None, 7);

        assert_eq!(store.read_at("k", SnapshotVersion::new(3)), Some(batch(1)));
        assert_eq!(store.read_at("k", SnapshotVersion::new(8)), None);
        assert_eq!(store.latest_version("k"), 7);
    }
}
