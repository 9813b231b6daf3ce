use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

use crate::errors::{GridError, Result};

/// The outcome of one entry-processor invocation.
#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    /// The processor's return value, if it produced one.
    pub result: Option<Arc<RecordBatch>>,
    /// The processor's error, if it failed.
    pub error: Option<String>,
}

/// The per-key result of one processed [crate::EnlistItem]. Immutable once
/// recorded.
#[derive(Debug, Clone)]
pub struct EnlistOutcome {
    /// Whether the operation applied to this key.
    pub success: bool,
    /// The value visible at the batch snapshot, when previous-value
    /// reporting was requested.
    pub previous: Option<Arc<RecordBatch>>,
    /// The per-key invoke result, for entry-processor batches.
    pub invoke: Option<InvokeOutcome>,
    /// The classified per-key failure, when one occurred.
    pub error: Option<GridError>,
}

impl EnlistOutcome {
    /// An applied (or filtered/conflicted, when `success` is false)
    /// operation with its previous value.
    pub fn applied(success: bool, previous: Option<Arc<RecordBatch>>) -> Self {
        Self {
            success,
            previous,
            invoke: None,
            error: None,
        }
    }

    /// An entry-processor outcome. Processor errors are reported per key and
    /// do not fail the entry itself.
    pub fn invoked(invoke: InvokeOutcome, previous: Option<Arc<RecordBatch>>) -> Self {
        Self {
            success: true,
            previous,
            invoke: Some(invoke),
            error: None,
        }
    }

    /// A per-key failure (lock timeout, backup replication failure).
    pub fn failed(error: GridError) -> Self {
        Self {
            success: false,
            previous: None,
            invoke: None,
            error: Some(error),
        }
    }
}

/// The transaction-level return value of an enlistment batch.
///
/// Readable only once the coordinator reached a terminal state.
#[derive(Debug, Clone, Default)]
pub struct AggregateResult {
    /// Logical AND of all per-key successes.
    pub success: bool,
    /// The representative previous value. Only meaningful for batches that
    /// are logically a single-row operation, so it is set only when exactly
    /// one outcome was recorded with previous-value reporting requested.
    pub previous: Option<Arc<RecordBatch>>,
    /// Every recorded per-key outcome.
    pub outcomes: HashMap<String, EnlistOutcome>,
}

impl AggregateResult {
    /// The invoke outcome recorded for `key`, if any.
    pub fn invoke_result(&self, key: &str) -> Option<&InvokeOutcome> {
        self.outcomes.get(key).and_then(|o| o.invoke.as_ref())
    }

    /// Iterates the per-key invoke outcomes of an entry-processor batch.
    pub fn invoke_results(&self) -> impl Iterator<Item = (&str, &InvokeOutcome)> {
        self.outcomes
            .iter()
            .filter_map(|(k, o)| o.invoke.as_ref().map(|inv| (k.as_str(), inv)))
    }

    /// Number of recorded outcomes.
    pub fn entries(&self) -> usize {
        self.outcomes.len()
    }
}

/// Merges per-key outcomes into one [AggregateResult], write-once per key.
///
/// Owned exclusively by one coordinator instance and never mutated from
/// outside it.
pub struct ResultAggregator {
    needs_previous: bool,
    success: bool,
    outcomes: HashMap<String, EnlistOutcome>,
    recorded: HashSet<String>,
}

impl ResultAggregator {
    /// Creates an empty aggregator. `needs_previous` mirrors the batch's
    /// previous-value reporting flag.
    pub fn new(needs_previous: bool) -> Self {
        Self {
            needs_previous,
            success: true,
            outcomes: HashMap::new(),
            recorded: HashSet::new(),
        }
    }

    /// Records the outcome for one key.
    ///
    /// Each key is recorded at most once; a duplicate is a programming error
    /// in the caller and is surfaced as [GridError::DuplicateOutcome], which
    /// fails the coordinator rather than being retried.
    pub fn record(&mut self, key: String, outcome: EnlistOutcome) -> Result<()> {
        if !self.recorded.insert(key.clone()) {
            return Err(GridError::DuplicateOutcome(key));
        }
        self.success &= outcome.success;
        self.outcomes.insert(key, outcome);
        Ok(())
    }

    /// Overall success so far.
    pub fn success(&self) -> bool {
        self.success
    }

    /// Number of outcomes recorded so far.
    pub fn recorded(&self) -> usize {
        self.recorded.len()
    }

    /// Consumes the aggregator into the final result. Called exactly once,
    /// when the coordinator reaches its terminal state.
    ///
    /// The representative previous value is taken from the outcome only when
    /// the batch produced exactly one; with several outcomes there is no
    /// meaningful single previous value, and which outcome arrived last
    /// would depend on owner grouping.
    pub fn finish(self) -> AggregateResult {
        let previous = if self.needs_previous && self.outcomes.len() == 1 {
            self.outcomes
                .values()
                .next()
                .filter(|outcome| outcome.invoke.is_none())
                .and_then(|outcome| outcome.previous.clone())
        } else {
            None
        };
        AggregateResult {
            success: self.success,
            previous,
            outcomes: self.outcomes,
        }
    }
}
