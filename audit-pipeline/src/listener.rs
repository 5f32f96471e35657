use crate::models::AuditEvent;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

/// Handle returned by `register_listener`, used to unregister.
pub type ListenerId = u64;

pub(crate) type Predicate = Box<dyn Fn(&AuditEvent) -> bool + Send + Sync>;
pub(crate) type Callback = Box<dyn Fn(&AuditEvent) -> anyhow::Result<()> + Send + Sync>;

pub(crate) struct Listener {
    pub(crate) id: ListenerId,
    predicate: Predicate,
    callback: Callback,
}

impl Listener {
    pub(crate) fn new(id: ListenerId, predicate: Predicate, callback: Callback) -> Self {
        Self {
            id,
            predicate,
            callback,
        }
    }

    /// Run predicate and callback, turning errors and panics into a reason string.
    pub(crate) fn deliver(&self, event: &AuditEvent) -> Result<(), String> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if (self.predicate)(event) {
                (self.callback)(event)
            } else {
                Ok(())
            }
        }));

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(panic) => Err(panic_message(panic.as_ref())),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

pub(crate) enum Dispatch {
    Event(AuditEvent),
    /// Acknowledged once every message queued before it has been delivered.
    Barrier(oneshot::Sender<()>),
}

/// Dedicated delivery thread so listeners never run on the ingestion path.
pub(crate) fn spawn_dispatcher<F>(
    mut rx: UnboundedReceiver<Dispatch>,
    deliver: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: Fn(AuditEvent) -> bool + Send + 'static,
{
    thread::Builder::new()
        .name("audit-listeners".to_string())
        .spawn(move || {
            while let Some(message) = rx.blocking_recv() {
                match message {
                    Dispatch::Event(event) => {
                        if !deliver(event) {
                            break;
                        }
                    }
                    Dispatch::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
            tracing::debug!("Audit listener dispatcher stopped");
        })
}
