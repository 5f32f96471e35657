use crate::models::{AuditEvent, AuditFilter};
use crate::store::AuditStore;
use std::collections::VecDeque;
use std::sync::Arc;

/// Lazy, restartable sequence of events in ascending sequence order.
///
/// Pages are fetched from the store on demand; dropping the stream at any
/// point releases everything it holds. `cursor()` is the last sequence id
/// examined, which `AuditPipeline::query_from` accepts to resume.
pub struct EventStream {
    store: Arc<dyn AuditStore>,
    filter: AuditFilter,
    batch_size: usize,
    next_from: u64,
    buffer: VecDeque<AuditEvent>,
    cursor: u64,
    exhausted: bool,
    interrupted: bool,
}

impl EventStream {
    pub(crate) fn new(
        store: Arc<dyn AuditStore>,
        filter: AuditFilter,
        after: u64,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            filter,
            batch_size: batch_size.max(1),
            next_from: after.saturating_add(1),
            buffer: VecDeque::new(),
            cursor: after,
            exhausted: false,
            interrupted: false,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// True when the store failed mid-stream; the stream ended early.
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    fn fill(&mut self) {
        match self.store.read_from(self.next_from, self.batch_size) {
            Ok(page) => {
                match page.last() {
                    Some(last) => self.next_from = last.sequence_id + 1,
                    None => self.exhausted = true,
                }
                if page.len() < self.batch_size {
                    self.exhausted = true;
                }
                self.buffer.extend(page);
            }
            Err(e) => {
                tracing::warn!(error = %e, cursor = self.cursor, "Audit query interrupted by store failure");
                self.interrupted = true;
                self.exhausted = true;
            }
        }
    }
}

impl Iterator for EventStream {
    type Item = AuditEvent;

    fn next(&mut self) -> Option<AuditEvent> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                self.cursor = event.sequence_id;
                if self.filter.matches(&event) {
                    return Some(event);
                }
                continue;
            }
            if self.exhausted {
                return None;
            }
            self.fill();
        }
    }
}
