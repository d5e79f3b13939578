//! Serialized write pipeline.
//!
//! Every outbound packet goes through one worker task, so writes reach the
//! link in call order and never overlap. A failed write is logged and
//! reported on its own ticket; the next request still goes out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::transport::{Link, TransportError};

struct WriteRequest {
    data: Vec<u8>,
    done: oneshot::Sender<Result<(), TransportError>>,
}

/// Completion handle for one queued write.
pub struct WriteTicket(oneshot::Receiver<Result<(), TransportError>>);

impl WriteTicket {
    pub async fn wait(self) -> Result<(), TransportError> {
        self.0.await.unwrap_or(Err(TransportError::QueueClosed))
    }
}

pub struct WriteQueue {
    tx: Option<mpsc::UnboundedSender<WriteRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl WriteQueue {
    pub fn new(link: Arc<dyn Link>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteRequest>();
        let worker = tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let result = link.write(&req.data).await;
                if let Err(e) = &result {
                    tracing::warn!("robot: write of {} bytes failed: {e}", req.data.len());
                }
                let _ = req.done.send(result);
            }
        });
        Self {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Append a write. Returns immediately.
    pub fn enqueue(&self, data: Vec<u8>) -> WriteTicket {
        let (done, ticket) = oneshot::channel();
        // A closed queue drops `done`, which the ticket reports as QueueClosed.
        if let Some(tx) = &self.tx {
            let _ = tx.send(WriteRequest { data, done });
        }
        WriteTicket(ticket)
    }

    /// Stop accepting writes and let the queued ones finish, up to `grace`.
    pub async fn close(&mut self, grace: Duration) {
        self.tx = None;
        if let Some(worker) = self.worker.take()
            && tokio::time::timeout(grace, worker).await.is_err()
        {
            tracing::warn!("robot: write queue did not drain within {grace:?}");
        }
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    /// Records writes, fails the ones whose first byte is 0xEE, and tracks
    /// how many writes overlap.
    #[derive(Default)]
    struct SlowLink {
        written: Mutex<Vec<Vec<u8>>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl Link for SlowLink {
        async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.written.lock().unwrap().push(data.to_vec());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if data.first() == Some(&0xEE) {
                return Err(TransportError::NotConnected);
            }
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_does_not_block_the_next() {
        let link = Arc::new(SlowLink::default());
        let queue = WriteQueue::new(link.clone());

        let first = queue.enqueue(vec![1]);
        let second = queue.enqueue(vec![0xEE]);
        let third = queue.enqueue(vec![3]);

        assert!(third.wait().await.is_ok());
        assert!(first.wait().await.is_ok());
        assert!(matches!(second.wait().await, Err(TransportError::NotConnected)));
        assert_eq!(*link.written.lock().unwrap(), vec![vec![1], vec![0xEE], vec![3]]);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_never_overlap() {
        let link = Arc::new(SlowLink::default());
        let queue = WriteQueue::new(link.clone());
        let tickets: Vec<_> = (0..8u8).map(|i| queue.enqueue(vec![i])).collect();
        for ticket in tickets {
            ticket.wait().await.unwrap();
        }
        assert_eq!(link.max_in_flight.load(Ordering::SeqCst), 1);
        let order: Vec<u8> = link.written.lock().unwrap().iter().map(|w| w[0]).collect();
        assert_eq!(order, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn close_drains_pending_writes() {
        let link = Arc::new(SlowLink::default());
        let mut queue = WriteQueue::new(link.clone());
        let ticket = queue.enqueue(vec![9]);
        queue.close(Duration::from_secs(1)).await;
        assert!(ticket.wait().await.is_ok());
        assert!(matches!(
            queue.enqueue(vec![10]).wait().await,
            Err(TransportError::QueueClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_queue_reports_closed() {
        let link = Arc::new(SlowLink::default());
        let queue = WriteQueue::new(link);
        let ticket = queue.enqueue(vec![1]);
        drop(queue);
        assert!(matches!(ticket.wait().await, Err(TransportError::QueueClosed)));
    }
}
