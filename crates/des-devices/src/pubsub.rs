//! Ordered per-topic dispatch.
//!
//! Inbound messages are fanned out to one worker task per topic. A worker
//! handles its topic's messages one at a time in arrival order; different
//! topics proceed concurrently. Handler panics are caught and logged so a
//! single bad payload cannot take down the worker.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::transport::InboundMessage;

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: InboundMessage);
}

pub struct Dispatcher {
    handler: Arc<dyn MessageHandler>,
    workers: DashMap<String, mpsc::UnboundedSender<InboundMessage>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn MessageHandler>, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            handler,
            workers: DashMap::new(),
            tracker: TaskTracker::new(),
            cancel,
        })
    }

    /// Spawn the task that drains `inbound` into the per-topic workers.
    pub fn start(self: &Arc<Self>, mut inbound: mpsc::Receiver<InboundMessage>) {
        let dispatcher = Arc::clone(self);
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatcher.cancel.cancelled() => break,
                    message = inbound.recv() => match message {
                        Some(message) => dispatcher.dispatch(message),
                        None => break,
                    },
                }
            }
            debug!("Inbound router stopped");
        });
    }

    /// Queue a message on its topic's worker, creating the worker on first use.
    pub fn dispatch(&self, message: InboundMessage) {
        if self.cancel.is_cancelled() {
            return;
        }
        let message = match self.workers.get(&message.topic) {
            Some(tx) => match tx.send(message) {
                Ok(()) => return,
                // Worker exited; replace it.
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };
        let topic = message.topic.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is still in scope, so this cannot fail.
        let _ = tx.send(message);
        self.workers.insert(topic.clone(), tx);
        self.spawn_worker(topic, rx);
    }

    fn spawn_worker(&self, topic: String, mut rx: mpsc::UnboundedReceiver<InboundMessage>) {
        let handler = Arc::clone(&self.handler);
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            debug!(topic = %topic, "Topic worker started");
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                let result = AssertUnwindSafe(handler.handle(message)).catch_unwind().await;
                if let Err(panic) = result {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(topic = %topic, reason = %reason, "Message handler panicked");
                }
            }
            debug!(topic = %topic, "Topic worker stopped");
        });
    }

    /// Stop the workers of every topic under `prefix`. Queued messages are
    /// still handled before each worker exits.
    pub fn retire(&self, prefix: &str) {
        self.workers.retain(|topic, _| !topic.starts_with(prefix));
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Cancel every worker and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.workers.clear();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
