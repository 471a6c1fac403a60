//! Status events and the rendezvous channel that carries them.
//!
//! Producers share one [`StatusSender`]. A report holds the sender's lock
//! from the moment it is sent until the reporter acknowledges consuming it,
//! so at most one event is ever in flight and a fast producer cannot run
//! ahead of the display.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Prefix marking a message as "one region finished".
pub const COMPLETED_PREFIX: &str = "completed: ";

/// Node identity of the event that ends the reporter loop.
pub const EXIT_NODE: &str = "exit";

// ---------------------------------------------------------------------------
// StatusEvent
// ---------------------------------------------------------------------------

/// A status line emitted by one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub node: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// A region-completion event; `detail` names what finished.
    pub fn completed(node: impl Into<String>, detail: &str) -> Self {
        Self::new(node, format!("{COMPLETED_PREFIX}{detail}"))
    }

    /// The terminal event.
    pub fn exit() -> Self {
        Self::new(EXIT_NODE, "")
    }

    pub fn is_completion(&self) -> bool {
        self.message.starts_with(COMPLETED_PREFIX)
    }

    pub fn is_exit(&self) -> bool {
        self.node == EXIT_NODE
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// An event plus the acknowledgement the reporter fires once consumed.
#[derive(Debug)]
pub struct Delivery {
    pub event: StatusEvent,
    consumed: oneshot::Sender<()>,
}

impl Delivery {
    /// Release the producer waiting on this event.
    pub fn ack(self) {
        // The producer may have been dropped; nothing to release then.
        let _ = self.consumed.send(());
    }
}

/// Producer handle shared by all node workers.
#[derive(Debug, Clone)]
pub struct StatusSender {
    tx: mpsc::Sender<Delivery>,
    emit_lock: Arc<Mutex<()>>,
}

/// Consumer half, owned by the reporter.
#[derive(Debug)]
pub struct StatusReceiver {
    rx: mpsc::Receiver<Delivery>,
}

/// Create a connected sender/receiver pair.
pub fn status_channel() -> (StatusSender, StatusReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (
        StatusSender {
            tx,
            emit_lock: Arc::new(Mutex::new(())),
        },
        StatusReceiver { rx },
    )
}

impl StatusSender {
    /// Send `event` and wait until the reporter has consumed it.
    ///
    /// If the reporter has already stopped the event is logged and dropped.
    pub async fn send(&self, event: StatusEvent) {
        let _guard = self.emit_lock.lock().await;
        let (consumed, done) = oneshot::channel();
        let delivery = Delivery { event, consumed };

        if let Err(mpsc::error::SendError(delivery)) = self.tx.send(delivery).await {
            tracing::debug!(
                node = %delivery.event.node,
                message = %delivery.event.message,
                "Status reporter gone, dropping event",
            );
            return;
        }
        let _ = done.await;
    }

    /// Report a free-form status line for `node`.
    pub async fn report(&self, node: &str, message: impl Into<String>) {
        self.send(StatusEvent::new(node, message)).await;
    }

    /// Report that `node` finished one region.
    pub async fn completed(&self, node: &str, detail: &str) {
        self.send(StatusEvent::completed(node, detail)).await;
    }

    /// Tell the reporter to stop.
    pub async fn exit(&self) {
        self.send(StatusEvent::exit()).await;
    }
}

impl StatusReceiver {
    /// Next delivery, or `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
