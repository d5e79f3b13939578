//! Bus abstraction layer: wraps `tokio::sync::broadcast` so callers never
//! touch the broadcast types directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

use novadrill::{AlertLevel, AlertMessage, NovaEvent, NovaMessage};

/// The bus is closed or the actor's shutdown flag is set.
#[derive(Debug)]
pub enum PollError {
    Shutdown,
}

// ---------------------------------------------------------------------------
// BusSender
// ---------------------------------------------------------------------------

/// Cloneable sender that auto-stamps `source` on every outbound message.
pub struct BusSender {
    actor_id: String,
    inner: broadcast::Sender<NovaMessage>,
    shutdown: Arc<AtomicBool>,
}

impl BusSender {
    pub fn new(
        actor_id: String,
        inner: broadcast::Sender<NovaMessage>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            actor_id,
            inner,
            shutdown,
        }
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Access the underlying broadcast sender (e.g. for WebState).
    pub fn raw_sender(&self) -> &broadcast::Sender<NovaMessage> {
        &self.inner
    }

    /// Send a message, auto-stamping source from the actor ID.
    pub fn send(&self, mut msg: NovaMessage) {
        msg.source = self.actor_id.clone();
        let _ = self.inner.send(msg);
    }

    /// Wrap an event in a fresh message and send it.
    pub fn emit(&self, event: impl Into<NovaEvent>) {
        self.send(NovaMessage::new(event));
    }

    /// Emit a user-visible alert.
    pub fn alert(&self, level: AlertLevel, message: impl Into<String>) {
        self.emit(AlertMessage {
            level,
            message: message.into(),
        });
    }

    /// Create a new receiver subscribed to this bus, sharing this sender's
    /// shutdown flag.
    pub fn subscribe(&self) -> BusReceiver {
        BusReceiver {
            inner: self.inner.subscribe(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl Clone for BusSender {
    fn clone(&self) -> Self {
        Self {
            actor_id: self.actor_id.clone(),
            inner: self.inner.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

// ---------------------------------------------------------------------------
// BusReceiver
// ---------------------------------------------------------------------------

/// Receiver wrapper. Holds the broadcast Receiver and a shutdown flag.
pub struct BusReceiver {
    inner: broadcast::Receiver<NovaMessage>,
    shutdown: Arc<AtomicBool>,
}

impl BusReceiver {
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Non-blocking drain: returns the next message, `Ok(None)` if empty,
    /// or `Err(PollError::Shutdown)` if the bus is closed or shutdown flag set.
    pub fn poll(&mut self) -> Result<Option<NovaMessage>, PollError> {
        if self.is_shutdown() {
            return Err(PollError::Shutdown);
        }
        loop {
            match self.inner.try_recv() {
                Ok(msg) => return Ok(Some(msg)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Closed) => return Err(PollError::Shutdown),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!("bus: lagged, dropped {n} events");
                    continue;
                }
            }
        }
    }

    /// Await the next message. For actors that run on their own runtime.
    pub async fn recv(&mut self) -> Result<NovaMessage, PollError> {
        loop {
            if self.is_shutdown() {
                return Err(PollError::Shutdown);
            }
            match self.inner.recv().await {
                Ok(msg) => return Ok(msg),
                Err(broadcast::error::RecvError::Closed) => return Err(PollError::Shutdown),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("bus: lagged, dropped {n} events");
                }
            }
        }
    }
}

impl From<broadcast::Receiver<NovaMessage>> for BusReceiver {
    fn from(inner: broadcast::Receiver<NovaMessage>) -> Self {
        Self {
            inner,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// A sender/receiver pair on a fresh bus, for tests.
#[cfg(test)]
pub fn test_bus(actor_id: &str) -> (BusSender, BusReceiver) {
    let (tx, _) = broadcast::channel(256);
    let sender = BusSender::new(actor_id.into(), tx, Arc::new(AtomicBool::new(false)));
    let receiver = sender.subscribe();
    (sender, receiver)
}
