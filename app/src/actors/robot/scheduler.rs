//! Cancellable one-shot timers for the drill runner.
//!
//! Each timer kind has at most one pending instance. Scheduling a kind that
//! is already pending replaces it. A fired timer is delivered on a channel
//! tagged with an id, and `accept` rejects fires whose timer was cancelled
//! or replaced after the sleep completed.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::runner::RunTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fired {
    pub timer: RunTimer,
    id: u64,
}

pub struct Scheduler {
    tx: mpsc::UnboundedSender<Fired>,
    pending: HashMap<RunTimer, (JoinHandle<()>, u64)>,
    next_id: u64,
}

impl Scheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Fired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                pending: HashMap::new(),
                next_id: 0,
            },
            rx,
        )
    }

    pub fn schedule(&mut self, timer: RunTimer, after: Duration) {
        self.cancel(timer);
        self.next_id += 1;
        let id = self.next_id;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Fired { timer, id });
        });
        self.pending.insert(timer, (handle, id));
    }

    pub fn cancel(&mut self, timer: RunTimer) {
        if let Some((handle, _)) = self.pending.remove(&timer) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (handle, _)) in self.pending.drain() {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub fn is_pending(&self, timer: RunTimer) -> bool {
        self.pending.contains_key(&timer)
    }

    /// Claim a fire. True only if it belongs to the currently pending timer.
    pub fn accept(&mut self, fired: &Fired) -> bool {
        match self.pending.get(&fired.timer) {
            Some((_, id)) if *id == fired.id => {
                self.pending.remove(&fired.timer);
                true
            }
            _ => false,
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
