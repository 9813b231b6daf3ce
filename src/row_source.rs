use arrow::record_batch::RecordBatch;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::EnlistOperation;
use crate::errors::Result;

/// A computation applied to one entry under [EnlistOperation::Invoke].
///
/// The processor sees the value visible at the batch snapshot and returns
/// the new row image (`Some`) or a deletion (`None`). Its result or error is
/// reported per key in the aggregate.
pub trait EntryProcessor: Send + Sync {
    fn process(&self, key: &str, previous: Option<&RecordBatch>) -> Result<Option<RecordBatch>>;
}

/// An optional per-batch predicate over the previous value. Entries that do
/// not match are skipped with a non-success outcome instead of being mutated.
pub trait EntryFilter: Send + Sync {
    fn matches(&self, key: &str, previous: Option<&RecordBatch>) -> bool;
}

/// The payload carried by one [EnlistItem].
#[derive(Clone)]
pub enum EnlistPayload {
    /// No payload (deletes).
    None,
    /// The row image to write.
    Row(Arc<RecordBatch>),
    /// The processor to run against the previous value.
    Processor(Arc<dyn EntryProcessor>),
}

impl fmt::Debug for EnlistPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnlistPayload::None => write!(f, "None"),
            EnlistPayload::Row(batch) => write!(f, "Row({} rows)", batch.num_rows()),
            EnlistPayload::Processor(_) => write!(f, "Processor"),
        }
    }
}

/// One unit of enlistment work: a key, the requested operation, and an
/// optional payload. Immutable after creation.
#[derive(Debug, Clone)]
pub struct EnlistItem {
    pub key: String,
    pub op: EnlistOperation,
    pub payload: EnlistPayload,
}

impl EnlistItem {
    pub fn insert(key: impl Into<String>, row: Arc<RecordBatch>) -> Self {
        Self {
            key: key.into(),
            op: EnlistOperation::Insert,
            payload: EnlistPayload::Row(row),
        }
    }

    pub fn update(key: impl Into<String>, row: Arc<RecordBatch>) -> Self {
        Self {
            key: key.into(),
            op: EnlistOperation::Update,
            payload: EnlistPayload::Row(row),
        }
    }

    pub fn upsert(key: impl Into<String>, row: Arc<RecordBatch>) -> Self {
        Self {
            key: key.into(),
            op: EnlistOperation::Upsert,
            payload: EnlistPayload::Row(row),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: EnlistOperation::Delete,
            payload: EnlistPayload::None,
        }
    }

    pub fn invoke(key: impl Into<String>, processor: Arc<dyn EntryProcessor>) -> Self {
        Self {
            key: key.into(),
            op: EnlistOperation::Invoke,
            payload: EnlistPayload::Processor(processor),
        }
    }
}

/// A lazy, finite, single-pass supplier of [EnlistItem]s.
///
/// Produced by the relational or cache-API layer: an SQL `UPDATE` compiles
/// into a source that yields one item per matched row, a cache bulk mutation
/// into a source over its argument map. The sequence is not restartable;
/// a yielded error terminates enlistment for the whole batch. Keys already
/// enlisted before the error stay enlisted — undoing them is the surrounding
/// transaction's job, not this component's.
pub trait RowSource: Send {
    /// The operation kind shared by the items of this batch.
    fn operation(&self) -> EnlistOperation;

    /// Whether previous-value reporting was requested for the batch.
    fn needs_previous(&self) -> bool;

    /// Yields the next item, or `None` once the source is exhausted.
    fn next_item(&mut self) -> impl Future<Output = Result<Option<EnlistItem>>> + Send;
}

/// A [RowSource] over an already-materialized collection of items, as
/// produced by cache-API bulk operations.
pub struct BatchRowSource {
    items: std::vec::IntoIter<EnlistItem>,
    op: EnlistOperation,
    needs_previous: bool,
}

impl BatchRowSource {
    pub fn new(op: EnlistOperation, items: Vec<EnlistItem>, needs_previous: bool) -> Self {
        Self {
            items: items.into_iter(),
            op,
            needs_previous,
        }
    }
}

impl RowSource for BatchRowSource {
    fn operation(&self) -> EnlistOperation {
        self.op
    }

    fn needs_previous(&self) -> bool {
        self.needs_previous
    }

    async fn next_item(&mut self) -> Result<Option<EnlistItem>> {
        Ok(self.items.next())
    }
}
