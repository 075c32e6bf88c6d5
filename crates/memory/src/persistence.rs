//! Background writer that mirrors appended records into a [`TurnStore`].
//!
//! Event dispatch is synchronous, so the listener only pushes onto an
//! unbounded channel; a spawned task drains it and talks to the store.
//! A [`PersistenceFlusher`] queues a marker behind pending writes and waits
//! for the task to reach it.

use crate::store::TurnStore;
use clawlink_core::event::{EventDispatcher, EventKind, EventPayload, SubscriptionId};
use clawlink_core::message::TurnRecord;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct PendingWrite {
    session_id: String,
    index: usize,
    record: TurnRecord,
}

enum Job {
    Write(PendingWrite),
    Flush(oneshot::Sender<()>),
}

/// Subscribes to `MessagePersisted` events and writes each record to the store.
pub struct PersistenceWriter {
    subscription: SubscriptionId,
    task: JoinHandle<()>,
    flusher: PersistenceFlusher,
}

/// Waits for the writer to catch up. Does not keep the writer alive.
#[derive(Clone)]
pub struct PersistenceFlusher {
    tx: mpsc::WeakUnboundedSender<Job>,
}

impl PersistenceFlusher {
    /// Resolve once every record queued before this call is in the store.
    /// Returns at once if the writer has shut down.
    pub async fn flush(&self) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let (done, written) = oneshot::channel();
        let queued = tx.send(Job::Flush(done)).is_ok();
        drop(tx);
        if queued {
            let _ = written.await;
        }
    }
}

impl PersistenceWriter {
    /// Subscribe on `dispatcher` and start the writer task.
    pub fn spawn(store: Arc<dyn TurnStore>, dispatcher: &EventDispatcher) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let flusher = PersistenceFlusher { tx: tx.downgrade() };

        let subscription = dispatcher.subscribe(EventKind::MessagePersisted, move |event| {
            if let EventPayload::MessagePersisted { index, record } = &event.payload {
                tx.send(Job::Write(PendingWrite {
                    session_id: event.session_id().to_string(),
                    index: *index,
                    record: record.clone(),
                }))
                .map_err(|_| clawlink_core::Error::Internal("persistence writer stopped".into()))?;
            }
            Ok(())
        });

        let task = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let write = match job {
                    Job::Write(write) => write,
                    Job::Flush(done) => {
                        let _ = done.send(());
                        continue;
                    }
                };
                match store.append(&write.session_id, &write.record).await {
                    Ok(()) => debug!(
                        session_id = %write.session_id,
                        index = write.index,
                        kind = write.record.kind(),
                        store = store.name(),
                        "Persisted turn record"
                    ),
                    Err(e) => warn!(
                        session_id = %write.session_id,
                        index = write.index,
                        error = %e,
                        "Failed to persist turn record"
                    ),
                }
            }
        });

        Self {
            subscription,
            task,
            flusher,
        }
    }

    pub fn flusher(&self) -> PersistenceFlusher {
        self.flusher.clone()
    }

    /// Stop listening and wait until every queued record has been written.
    pub async fn shutdown(self, dispatcher: &EventDispatcher) {
        dispatcher.unsubscribe(self.subscription);
        // Dropping the listener closes the channel; the task exits once drained.
        if let Err(e) = self.task.await {
            warn!(error = %e, "Persistence writer task failed");
        }
    }
}
