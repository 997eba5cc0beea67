//! Batched concurrent drain into a [`FileCache`].
//!
//! Any number of producers hand sorted batches to [`IngestPipeline::process`];
//! a single consumer empties the queue with [`IngestPipeline::drain_and_flush`].
//! The drain only exits once no producer is inside `process` *and* the queue
//! is empty, so an item reserved by a producer can never be missed.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use barrage_cache::FileCache;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::{Error, Result};

/// Items between two drain progress logs.
const PROGRESS_INTERVAL: usize = 1000;

/// Pipeline lifecycle. `Flushed` is terminal; build a new pipeline to reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Draining,
    Flushed,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Draining => "DRAINING",
            Self::Flushed => "FLUSHED",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keeps the in-flight counter raised for the duration of a merge.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
    notify: &'a Notify,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_one();
    }
}

/// Producer/consumer batching layer in front of a durable sink.
pub struct IngestPipeline<T: Sync> {
    sink: Arc<dyn FileCache<T>>,
    queue: Mutex<VecDeque<T>>,
    in_flight: AtomicUsize,
    notify: Notify,
    state: Mutex<PipelineState>,
    written: Mutex<Vec<T>>,
}

impl<T> IngestPipeline<T>
where
    T: Ord + Clone + Send + Sync + 'static,
{
    pub fn new(sink: Arc<dyn FileCache<T>>) -> Self {
        Self {
            sink,
            queue: Mutex::new(VecDeque::new()),
            in_flight: AtomicUsize::new(0),
            notify: Notify::new(),
            state: Mutex::new(PipelineState::Idle),
            written: Mutex::new(Vec::new()),
        }
    }

    fn enter(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight {
            counter: &self.in_flight,
            notify: &self.notify,
        }
    }

    /// Sort a batch and append it to the shared queue as one contiguous run.
    ///
    /// Returns the number of items enqueued. An empty batch is a no-op.
    /// Rejected once the pipeline has flushed.
    pub fn process(&self, mut batch: Vec<T>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        batch.sort();

        let _in_flight = self.enter();
        // State is held across the merge so the drain cannot seal the queue
        // between the check and the extend.
        let state = self.state.lock();
        if *state == PipelineState::Flushed {
            return Err(Error::invalid_transition(*state, "PROCESSING"));
        }

        let count = batch.len();
        self.queue.lock().extend(batch);
        Ok(count)
    }

    /// Move every queued item into the sink, then force-sync it once.
    ///
    /// Keeps waiting while any producer is inside [`process`](Self::process),
    /// so callers must stop submitting before draining or this never returns.
    /// The pipeline is sealed as `Flushed` once the queue is empty, before the
    /// sync, so a late `process` is rejected rather than stranded.
    /// An append failure aborts the drain and is returned as is; the sink is
    /// not synced in that case.
    pub async fn drain_and_flush(&self, keys: &[String]) -> Result<usize> {
        {
            let mut state = self.state.lock();
            if *state != PipelineState::Idle {
                return Err(Error::invalid_transition(*state, PipelineState::Draining));
            }
            *state = PipelineState::Draining;
        }
        debug!(partition = ?keys, "Drain started");

        let mut written = 0usize;
        loop {
            let next = self.queue.lock().pop_front();
            match next {
                Some(item) => {
                    self.sink.append(&item, keys).await?;
                    self.written.lock().push(item);
                    written += 1;
                    if written % PROGRESS_INTERVAL == 0 {
                        info!(written, queued = self.cache_size(), "Drain progress");
                    }
                }
                None if self.in_flight.load(Ordering::Acquire) == 0 => {
                    // A merge may have landed between the pop and the load.
                    let mut state = self.state.lock();
                    if self.queue.lock().is_empty() {
                        *state = PipelineState::Flushed;
                        break;
                    }
                }
                None => self.notify.notified().await,
            }
        }

        self.sink.force_sync().await?;
        info!(written, partition = ?keys, "Drain complete");
        Ok(written)
    }

    /// Current queue depth.
    pub fn cache_size(&self) -> usize {
        self.queue.lock().len()
    }

    /// Number of producers currently merging.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Items handed to the sink so far, in drain order.
    pub fn result(&self) -> Vec<T> {
        self.written.lock().clone()
    }

    pub fn written_count(&self) -> usize {
        self.written.lock().len()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }
}
