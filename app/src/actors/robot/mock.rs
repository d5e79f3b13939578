//! Simulated robot for `--mock` runs and end-to-end tests.
//!
//! Speaks the device side of the protocol: issues a challenge, checks the
//! digest, acknowledges the auth steps, and reports a finished batch after
//! a per-ball delay. A stop packet cancels the pending report.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use novadrill::codec;
use novadrill::handshake::salted_digest;

use super::transport::{Link, LinkEvent, OpenLink, Transport, TransportError};

const MOCK_SERIAL: &str = "NV2024000001";
const MOCK_CODE: &str = "A7K3";
const MOCK_DEVICE: &str = "Nova Robot (mock)";

#[derive(Debug, Clone)]
pub struct MockTransport {
    /// Delay before each reply notification.
    pub reply_delay: Duration,
    /// Time the simulated robot takes per ball in a batch.
    pub ball_delay: Duration,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            reply_delay: Duration::from_millis(50),
            ball_delay: Duration::from_millis(600),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<OpenLink, TransportError> {
        let (tx, events) = mpsc::unbounded_channel();
        tracing::info!("mock: connected to {MOCK_DEVICE}");
        Ok(OpenLink {
            link: Arc::new(MockLink {
                config: self.clone(),
                events: tx,
                connected: AtomicBool::new(true),
                generation: Arc::new(AtomicU64::new(0)),
            }),
            events,
            device: MOCK_DEVICE.into(),
        })
    }
}

struct MockLink {
    config: MockTransport,
    events: mpsc::UnboundedSender<LinkEvent>,
    connected: AtomicBool,
    /// Bumped by every stop; a batch report only fires if unchanged.
    generation: Arc<AtomicU64>,
}

impl MockLink {
    fn notify_after(&self, delay: Duration, data: Vec<u8>) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(LinkEvent::Notification(data));
        });
    }

    fn challenge() -> Vec<u8> {
        format!("NOVA01{MOCK_SERIAL}{MOCK_CODE}").into_bytes()
    }
}

#[async_trait]
impl Link for MockLink {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::NotConnected);
        }
        let reply = self.config.reply_delay;

        if data == codec::HANDSHAKE_START {
            self.notify_after(reply, Self::challenge());
        } else if let Some(digest) = data.strip_prefix(&codec::HANDSHAKE_RESPONSE_HEADER[..]) {
            if digest == salted_digest(MOCK_SERIAL, MOCK_CODE).as_bytes() {
                self.notify_after(reply, vec![0x01]);
            } else {
                tracing::warn!("mock: rejected challenge response");
            }
        } else if data == codec::AUTH_ACK_1 {
            self.notify_after(reply, vec![0x02]);
        } else if data == codec::AUTH_ACK_2 {
            self.notify_after(reply, vec![0x03]);
        } else if data == codec::STOP {
            self.generation.fetch_add(1, Ordering::SeqCst);
        } else if let Some(balls) = codec::fire_packet_len(data) {
            let generation = Arc::clone(&self.generation);
            let expected = generation.load(Ordering::SeqCst);
            let events = self.events.clone();
            let delay = self.config.ball_delay * balls.max(1) as u32;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if generation.load(Ordering::SeqCst) == expected {
                    let mut report = vec![0x5A];
                    report.extend_from_slice(&codec::COMPLETION_MARKER);
                    let _ = events.send(LinkEvent::Notification(report));
                }
            });
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use novadrill::{Handshake, HandshakeStep, ShotParameters};

    async fn next_notification(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Vec<u8> {
        match events.recv().await {
            Some(LinkEvent::Notification(data)) => data,
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completes_handshake_with_the_real_state_machine() {
        let OpenLink {
            link, mut events, ..
        } = MockTransport::default().open().await.unwrap();
        let mut hs = Handshake::new();

        link.write(&codec::build_handshake_start()).await.unwrap();
        while !hs.is_complete() {
            let n = next_notification(&mut events).await;
            let HandshakeStep::Reply { packet, .. } = hs.advance(&n) else {
                panic!("mock sent an unusable notification");
            };
            link.write(&packet).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reports_batch_completion_unless_stopped() {
        let OpenLink {
            link, mut events, ..
        } = MockTransport::default().open().await.unwrap();
        let shot = ShotParameters::new(3000, 2000, 0, 0.0, 50, 1);

        link.write(&codec::build_fire_packet([&shot, &shot]).unwrap()).await.unwrap();
        let n = next_notification(&mut events).await;
        assert!(codec::contains_completion_marker(&n));

        link.write(&codec::build_fire_packet([&shot]).unwrap()).await.unwrap();
        link.write(&codec::build_stop_packet()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn writes_fail_after_disconnect() {
        let open = MockTransport::default().open().await.unwrap();
        open.link.disconnect().await.unwrap();
        assert!(matches!(
            open.link.write(&codec::build_stop_packet()).await,
            Err(TransportError::NotConnected)
        ));
    }
}
