use crate::listener::{spawn_dispatcher, Dispatch, Listener, ListenerId};
use crate::models::{
    AuditCategory, AuditEntry, AuditEvent, AuditFilter, AuditOutcome, AuditReport, GroupBy,
};
use crate::query::EventStream;
use crate::store::{AuditStore, MemoryAuditStore, StoreError};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use custodian_core::config::AuditStorageConfig;
use custodian_core::Details;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::oneshot;

const DEGRADED_ACTION: &str = "audit_storage_degraded";
const FLUSHED_ACTION: &str = "audit_overflow_flushed";
const LISTENER_FAILED_ACTION: &str = "listener_failed";

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub overflow_capacity: usize,
    pub query_batch_size: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            overflow_capacity: 10_000,
            query_batch_size: 256,
        }
    }
}

impl From<&AuditStorageConfig> for PipelineOptions {
    fn from(config: &AuditStorageConfig) -> Self {
        Self {
            overflow_capacity: config.overflow_capacity,
            query_batch_size: config.query_batch_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    pub degraded: bool,
    pub overflow_depth: usize,
    pub evicted_total: u64,
    pub last_sequence: u64,
}

struct Pending {
    event: AuditEvent,
    dispatch: bool,
}

#[derive(Default)]
struct WriterState {
    overflow: VecDeque<Pending>,
    evicted_since_flush: u64,
    evicted_total: u64,
    degraded: bool,
}

struct Inner {
    store: Arc<dyn AuditStore>,
    options: PipelineOptions,
    /// Last assigned sequence id. Only advanced under `writer`.
    sequence: AtomicU64,
    writer: Mutex<WriterState>,
    listeners: ArcSwap<Vec<Arc<Listener>>>,
    next_listener_id: AtomicU64,
    dispatch_tx: Mutex<Option<UnboundedSender<Dispatch>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Durable, ordered audit trail.
///
/// Cheap to clone; all clones share one sequence counter and one store.
#[derive(Clone)]
pub struct AuditPipeline {
    inner: Arc<Inner>,
}

impl AuditPipeline {
    /// Build a pipeline over `store`, resuming the sequence from what it holds.
    pub fn new(store: Arc<dyn AuditStore>, options: PipelineOptions) -> Result<Self, StoreError> {
        let last_sequence = store.last_sequence()?;
        Ok(Self::build(store, options, last_sequence))
    }

    /// Pipeline over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::build(
            Arc::new(MemoryAuditStore::new()),
            PipelineOptions::default(),
            0,
        )
    }

    fn build(store: Arc<dyn AuditStore>, options: PipelineOptions, last_sequence: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            store,
            options,
            sequence: AtomicU64::new(last_sequence),
            writer: Mutex::new(WriterState::default()),
            listeners: ArcSwap::from_pointee(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            dispatch_tx: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(None),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let spawned = spawn_dispatcher(rx, move |event| match weak.upgrade() {
            Some(inner) => {
                inner.deliver(&event);
                true
            }
            None => false,
        });
        match spawned {
            Ok(handle) => *inner.dispatcher.lock() = Some(handle),
            Err(e) => {
                // Ingestion keeps working; only listeners go quiet.
                tracing::error!(error = %e, "Failed to start audit listener dispatcher");
                inner.dispatch_tx.lock().take();
            }
        }

        tracing::info!(
            last_sequence,
            overflow_capacity = inner.options.overflow_capacity,
            "Audit pipeline started"
        );

        Self { inner }
    }

    /// Record an event and return its sequence id.
    ///
    /// Never fails: when the store is down the event is buffered.
    pub fn log(
        &self,
        category: AuditCategory,
        action: &str,
        user_id: &str,
        outcome: AuditOutcome,
        source_ip: Option<&str>,
        details: Option<Details>,
    ) -> u64 {
        let entry = AuditEntry::new(category, action, user_id, outcome)
            .source_ip(source_ip)
            .details(details.unwrap_or_default());
        self.record(entry)
    }

    pub fn record(&self, entry: AuditEntry) -> u64 {
        self.inner.record(entry, true)
    }

    /// Retry the overflow queue. Returns true when nothing is left buffered.
    pub fn flush(&self) -> bool {
        let mut writer = self.inner.writer.lock();
        self.inner.try_flush(&mut writer);
        writer.overflow.is_empty()
    }

    pub fn status(&self) -> PipelineStatus {
        let writer = self.inner.writer.lock();
        PipelineStatus {
            degraded: writer.degraded,
            overflow_depth: writer.overflow.len(),
            evicted_total: writer.evicted_total,
            last_sequence: self.inner.sequence.load(Ordering::SeqCst),
        }
    }

    /// Register a callback run asynchronously, after persistence, for every
    /// event matching `predicate`.
    pub fn register_listener<P, C>(&self, predicate: P, callback: C) -> ListenerId
    where
        P: Fn(&AuditEvent) -> bool + Send + Sync + 'static,
        C: Fn(&AuditEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let listener = Arc::new(Listener::new(id, Box::new(predicate), Box::new(callback)));
        self.inner.listeners.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(listener.clone());
            next
        });
        tracing::debug!(listener_id = id, "Registered audit listener");
        id
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        let previous = self.inner.listeners.rcu(|current| {
            current
                .iter()
                .filter(|l| l.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().any(|l| l.id == id)
    }

    /// Block until every event persisted so far has been offered to listeners.
    ///
    /// Must not be called from inside a listener callback or an async task.
    pub fn drain_listeners(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        let sent = match self.inner.dispatch_tx.lock().as_ref() {
            Some(tx) => tx.send(Dispatch::Barrier(done_tx)).is_ok(),
            None => false,
        };
        if sent {
            let _ = done_rx.blocking_recv();
        }
    }

    /// All persisted events matching `filter`, lazily, by ascending sequence id.
    ///
    /// Events still in the overflow queue become visible once flushed.
    pub fn query_events(&self, filter: AuditFilter) -> EventStream {
        self.query_from(filter, 0)
    }

    /// Resume a query after sequence id `after` (see `EventStream::cursor`).
    pub fn query_from(&self, filter: AuditFilter, after: u64) -> EventStream {
        EventStream::new(
            self.inner.store.clone(),
            filter,
            after,
            self.inner.options.query_batch_size,
        )
    }

    pub fn generate_report(&self, filter: AuditFilter, group_by: GroupBy) -> AuditReport {
        let mut stream = self.query_events(filter);
        let mut groups: BTreeMap<String, u64> = BTreeMap::new();
        let mut total = 0u64;
        let mut first_sequence = None;
        let mut last_sequence = None;

        for event in stream.by_ref() {
            total += 1;
            first_sequence.get_or_insert(event.sequence_id);
            last_sequence = Some(event.sequence_id);
            *groups.entry(group_by.key(&event)).or_insert(0) += 1;
        }

        AuditReport {
            generated_at: Utc::now(),
            total,
            groups,
            first_sequence,
            last_sequence,
            partial: stream.interrupted(),
        }
    }

    /// Delete persisted events older than `cutoff`. Callers log the purge.
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self.inner.store.purge_before(cutoff)?;
        if removed > 0 {
            tracing::info!(removed, cutoff = %cutoff, "Purged audit events");
        }
        Ok(removed)
    }

    /// Flush, stop the listener thread after it drains, and sync the store.
    pub fn shutdown(&self) {
        if !self.flush() {
            let status = self.status();
            tracing::error!(
                overflow_depth = status.overflow_depth,
                "Audit overflow could not be flushed at shutdown"
            );
        }

        // Closing the channel lets the dispatcher finish what is queued and exit.
        self.inner.dispatch_tx.lock().take();
        if let Some(handle) = self.inner.dispatcher.lock().take() {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                tracing::error!("Audit listener dispatcher panicked");
            }
        }

        if let Err(e) = self.inner.store.sync() {
            tracing::error!(error = %e, "Failed to sync audit store at shutdown");
        }
        tracing::info!("Audit pipeline shut down");
    }
}

impl Inner {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record(&self, entry: AuditEntry, dispatch: bool) -> u64 {
        let mut writer = self.writer.lock();

        // Earlier buffered events (and the flush marker) must precede this one.
        if !writer.overflow.is_empty() {
            self.try_flush(&mut writer);
        }

        let sequence_id = self.next_sequence();
        let event = entry.into_event(sequence_id);

        metrics::counter!(
            "audit_events_logged_total",
            "category" => event.category.as_str(),
            "outcome" => event.outcome.as_str()
        )
        .increment(1);

        if writer.overflow.is_empty() {
            match self.store.append(std::slice::from_ref(&event)) {
                Ok(()) => {
                    if dispatch {
                        self.send(event);
                    }
                }
                Err(e) => {
                    self.enqueue(&mut writer, event, dispatch);
                    self.enter_degraded(&mut writer, &e);
                }
            }
        } else {
            self.enqueue(&mut writer, event, dispatch);
        }

        sequence_id
    }

    fn enter_degraded(&self, writer: &mut WriterState, err: &StoreError) {
        if writer.degraded {
            return;
        }
        writer.degraded = true;
        tracing::error!(error = %err, "Audit storage unavailable, buffering events");

        let notice = AuditEntry::system(DEGRADED_ACTION, AuditOutcome::Failure)
            .detail("error", err.to_string())
            .detail("overflow_capacity", self.options.overflow_capacity)
            .into_event(self.next_sequence());
        self.enqueue(writer, notice, true);
    }

    fn enqueue(&self, writer: &mut WriterState, event: AuditEvent, dispatch: bool) {
        while writer.overflow.len() >= self.options.overflow_capacity.max(1) {
            if let Some(evicted) = writer.overflow.pop_front() {
                writer.evicted_since_flush += 1;
                writer.evicted_total += 1;
                metrics::counter!("audit_events_evicted_total").increment(1);
                tracing::warn!(
                    sequence_id = evicted.event.sequence_id,
                    "Audit overflow full, evicted oldest event"
                );
            }
        }
        writer.overflow.push_back(Pending { event, dispatch });
        metrics::gauge!("audit_overflow_depth").set(writer.overflow.len() as f64);
    }

    /// Append the whole overflow queue followed by a marker event recording
    /// how many events were flushed and how many were evicted meanwhile.
    fn try_flush(&self, writer: &mut WriterState) {
        if writer.overflow.is_empty() {
            return;
        }

        let batch: Vec<AuditEvent> = writer.overflow.iter().map(|p| p.event.clone()).collect();
        if let Err(e) = self.store.append(&batch) {
            tracing::debug!(error = %e, depth = batch.len(), "Audit store still unavailable");
            return;
        }

        let flushed = writer.overflow.len();
        let evicted = std::mem::take(&mut writer.evicted_since_flush);
        for pending in writer.overflow.drain(..) {
            if pending.dispatch {
                self.send(pending.event);
            }
        }

        let marker = AuditEntry::system(FLUSHED_ACTION, AuditOutcome::Success)
            .detail("flushed", flushed)
            .detail("evicted", evicted)
            .detail("evicted_total", writer.evicted_total)
            .into_event(self.next_sequence());

        match self.store.append(std::slice::from_ref(&marker)) {
            Ok(()) => {
                writer.degraded = false;
                tracing::info!(flushed, evicted, "Audit storage recovered, overflow flushed");
                self.send(marker);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Audit store failed again while writing flush marker");
                self.enqueue(writer, marker, true);
            }
        }

        metrics::gauge!("audit_overflow_depth").set(writer.overflow.len() as f64);
    }

    fn send(&self, event: AuditEvent) {
        if self.listeners.load().is_empty() {
            return;
        }
        if let Some(tx) = self.dispatch_tx.lock().as_ref() {
            let _ = tx.send(Dispatch::Event(event));
        }
    }

    /// Runs on the dispatcher thread.
    fn deliver(&self, event: &AuditEvent) {
        let listeners = self.listeners.load_full();
        for listener in listeners.iter() {
            if let Err(reason) = listener.deliver(event) {
                tracing::warn!(
                    listener_id = listener.id,
                    sequence_id = event.sequence_id,
                    error = %reason,
                    "Audit listener failed"
                );
                let failure = AuditEntry::system(LISTENER_FAILED_ACTION, AuditOutcome::Failure)
                    .detail("listener_id", listener.id)
                    .detail("event_sequence_id", event.sequence_id)
                    .detail("error", reason);
                self.record(failure, false);
            }
        }
    }
}
