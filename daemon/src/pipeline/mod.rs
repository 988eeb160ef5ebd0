//! Chunked upload pipeline.
//!
//! Fragments are coalesced into fixed-capacity [`Chunk`]s per stream, then handed
//! to a fixed worker pool. All streams of one [`StreamOwner`] hash to the same
//! worker, so their chunks are delivered in dispatch order. Delivery is best
//! effort: failures are logged and counted, never propagated to the producer.

pub mod chunk;
pub mod router;
pub mod storage;

pub use chunk::{Chunk, ChunkTarget, Fragment, StreamId, StreamOwner};
pub use router::ChunkRouter;
pub use storage::LocalStorage;

use crate::config::PipelineConfig;
use crate::metrics;
use crate::transport::TransportError;
use crossbeam_channel::{bounded, Receiver, Sender};
use devscope_shared::DeviceId;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Most chunks a worker takes per wake-up.
const MAX_BATCH: usize = 64;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("upload pipeline is shut down")]
    Closed,

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no transport for job {job_id} device {device}")]
    NoTransport { job_id: String, device: DeviceId },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Final destination of dispatched chunks.
pub trait ChunkSink: Send + Sync {
    fn deliver(&self, chunk: Chunk) -> Result<(), PipelineError>;

    /// Release resources held for `owner` once its queue has drained.
    fn close_owner(&self, _owner: &StreamOwner) {}

    fn close_all(&self) {}
}

type Slot = Arc<Mutex<Option<Chunk>>>;
type SlotKey = (StreamOwner, String);

/// Dispatched-but-undelivered chunk counts.
#[derive(Default)]
struct Pending {
    counts: Mutex<HashMap<StreamOwner, usize>>,
    drained: Condvar,
}

impl Pending {
    fn add(&self, owner: &StreamOwner) {
        *self.counts.lock().entry(owner.clone()).or_insert(0) += 1;
        metrics::PENDING_CHUNKS.inc();
    }

    fn done(&self, owner: &StreamOwner) {
        let mut counts = self.counts.lock();
        if let Some(n) = counts.get_mut(owner) {
            *n -= 1;
            if *n == 0 {
                counts.remove(owner);
            }
        }
        metrics::PENDING_CHUNKS.dec();
        self.drained.notify_all();
    }

    fn wait(&self, owner: Option<&StreamOwner>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut counts = self.counts.lock();
        loop {
            let idle = match owner {
                Some(owner) => !counts.contains_key(owner),
                None => counts.is_empty(),
            };
            if idle {
                return true;
            }
            if self.drained.wait_until(&mut counts, deadline).timed_out() {
                return match owner {
                    Some(owner) => !counts.contains_key(owner),
                    None => counts.is_empty(),
                };
            }
        }
    }
}

pub struct UploadPipeline {
    chunk_capacity: usize,
    flush_timeout: Duration,
    slots: Mutex<HashMap<SlotKey, Slot>>,
    queues: RwLock<Vec<Sender<Chunk>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<Pending>,
    sink: Arc<dyn ChunkSink>,
    closed: AtomicBool,
}

impl UploadPipeline {
    pub fn new(config: &PipelineConfig, sink: Arc<dyn ChunkSink>) -> anyhow::Result<Self> {
        let pending = Arc::new(Pending::default());
        let mut queues = Vec::with_capacity(config.workers);
        let mut workers = Vec::with_capacity(config.workers);

        for index in 0..config.workers.max(1) {
            let (tx, rx) = bounded(config.queue_capacity.max(1));
            let sink = Arc::clone(&sink);
            let pending = Arc::clone(&pending);
            let handle = std::thread::Builder::new()
                .name(format!("upload-{}", index))
                .spawn(move || worker_loop(rx, sink, pending))?;
            queues.push(tx);
            workers.push(handle);
        }
        info!(
            "Upload pipeline started: {} workers, {} byte chunks",
            workers.len(),
            config.chunk_capacity
        );

        Ok(Self {
            chunk_capacity: config.chunk_capacity,
            flush_timeout: config.flush_timeout(),
            slots: Mutex::new(HashMap::new()),
            queues: RwLock::new(queues),
            workers: Mutex::new(workers),
            pending,
            sink,
            closed: AtomicBool::new(false),
        })
    }

    fn slot(&self, stream: &StreamId) -> Slot {
        let mut slots = self.slots.lock();
        Arc::clone(
            slots
                .entry((stream.owner.clone(), stream.name.clone()))
                .or_default(),
        )
    }

    /// Add a fragment to its stream's open chunk.
    ///
    /// A fragment that does not fit, or that ends the stream, first dispatches
    /// the open chunk as-is and then goes out in a chunk of its own.
    pub fn send(&self, stream: &StreamId, fragment: Fragment) -> Result<(), PipelineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::Closed);
        }

        let slot = self.slot(stream);
        let mut open = slot.lock();

        let overflow = match open.as_ref() {
            Some(chunk) => fragment.len() > chunk.remaining(),
            None => fragment.len() > self.chunk_capacity,
        };
        if overflow || fragment.is_last {
            if let Some(current) = open.take() {
                self.dispatch(current)?;
            }
            return self.dispatch(Chunk::exact(stream.clone(), fragment));
        }

        match open.as_mut() {
            Some(chunk) => {
                chunk.append(&fragment);
            }
            None => {
                let mut chunk = Chunk::with_capacity(stream.clone(), self.chunk_capacity);
                chunk.append(&fragment);
                *open = Some(chunk);
            }
        }
        Ok(())
    }

    /// Queue a chunk on its owner's worker. Blocks while that queue is full.
    pub fn dispatch(&self, chunk: Chunk) -> Result<(), PipelineError> {
        let queue = {
            let queues = self.queues.read();
            if queues.is_empty() {
                return Err(PipelineError::Closed);
            }
            queues[worker_index(&chunk.stream.owner, queues.len())].clone()
        };

        let owner = chunk.stream.owner.clone();
        let target = chunk.stream.sink.label();
        let bytes = chunk.len();
        self.pending.add(&owner);
        if queue.send(chunk).is_err() {
            self.pending.done(&owner);
            return Err(PipelineError::Closed);
        }
        metrics::CHUNKS_DISPATCHED.with_label_values(&[target]).inc();
        metrics::CHUNK_BYTES.inc_by(bytes as f64);
        Ok(())
    }

    /// Dispatch the open chunk of one stream, marked as the last one, and
    /// forget the stream.
    pub fn finish_stream(&self, stream: &StreamId) -> Result<(), PipelineError> {
        let slot = self
            .slots
            .lock()
            .remove(&(stream.owner.clone(), stream.name.clone()));
        let open = slot.and_then(|slot| slot.lock().take());
        let mut chunk = open.unwrap_or_else(|| Chunk::with_capacity(stream.clone(), 0));
        chunk.is_last = true;
        self.dispatch(chunk)
    }

    /// Dispatch every open chunk accepted by `filter`.
    fn drain_slots(&self, remove: bool, filter: impl Fn(&StreamOwner) -> bool) -> usize {
        let selected: Vec<Slot> = {
            let mut slots = self.slots.lock();
            let keys: Vec<SlotKey> = slots
                .keys()
                .filter(|(owner, _)| filter(owner))
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|k| {
                    if remove {
                        slots.remove(k)
                    } else {
                        slots.get(k).cloned()
                    }
                })
                .collect()
        };

        let mut drained = 0;
        for slot in selected {
            let open = slot.lock().take();
            if let Some(chunk) = open {
                let stream = chunk.stream.to_string();
                match self.dispatch(chunk) {
                    Ok(()) => drained += 1,
                    Err(e) => warn!("Dropping open chunk of {}: {}", stream, e),
                }
            }
        }
        drained
    }

    /// Drain one owner's open chunks, wait (bounded) for its queue to empty,
    /// then close its files. Returns false if the wait timed out.
    pub fn flush_owner(&self, owner: &StreamOwner) -> bool {
        let drained = self.drain_slots(true, |o| o == owner);
        let done = self.pending.wait(Some(owner), self.flush_timeout);
        if !done {
            warn!(owner = %owner, "Flush timed out with chunks still queued");
        }
        self.sink.close_owner(owner);
        debug!(owner = %owner, drained, "Flushed stream owner");
        done
    }

    /// Drain every open chunk, wait (bounded) for all queues, close all files.
    pub fn flush(&self) -> bool {
        let drained = self.drain_slots(false, |_| true);
        let done = self.pending.wait(None, self.flush_timeout);
        if !done {
            warn!("Pipeline flush timed out with chunks still queued");
        }
        self.sink.close_all();
        debug!(drained, "Flushed upload pipeline");
        done
    }

    /// Flush, stop accepting fragments, and join the workers.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flush();
        self.queues.write().clear();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                warn!("Upload worker panicked");
            }
        }
        info!("Upload pipeline stopped");
    }

    /// Bytes in the open chunk of `stream`, if one is cached.
    pub fn cached_len(&self, stream: &StreamId) -> Option<usize> {
        let slot = self
            .slots
            .lock()
            .get(&(stream.owner.clone(), stream.name.clone()))
            .cloned()?;
        let open = slot.lock();
        open.as_ref().map(Chunk::len)
    }

    pub fn worker_count(&self) -> usize {
        self.queues.read().len()
    }
}

impl Drop for UploadPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_index(owner: &StreamOwner, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    owner.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

fn worker_loop(rx: Receiver<Chunk>, sink: Arc<dyn ChunkSink>, pending: Arc<Pending>) {
    let mut batch = Vec::with_capacity(MAX_BATCH);
    while let Ok(first) = rx.recv() {
        batch.push(first);
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(chunk) => batch.push(chunk),
                Err(_) => break,
            }
        }

        for chunk in batch.drain(..) {
            let owner = chunk.stream.owner.clone();
            let target = chunk.stream.sink.label();
            let stream = chunk.stream.to_string();
            if let Err(e) = sink.deliver(chunk) {
                metrics::UPLOAD_FAILURES.with_label_values(&[target]).inc();
                warn!("Upload of {} failed: {}", stream, e);
            }
            pending.done(&owner);
        }
    }
}
