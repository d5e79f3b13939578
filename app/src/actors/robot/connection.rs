//! Connection lifecycle: open the link, run the handshake, route
//! notifications, and tear down.
//!
//! Every state change is published as `ConnectionChanged`. Outbound packets
//! go through one `WriteQueue` per link. Inbound notifications are raw
//! bytes from the link; `handle_notification` decides whether they belong
//! to the handshake or to the drill runner.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use novadrill::{
    AlertLevel, ConnectionChanged, ConnectionState, Handshake, HandshakeStage, HandshakeStep,
    StatsCommand, codec,
};

use super::queue::{WriteQueue, WriteTicket};
use super::transport::{Link, LinkEvent, Transport, TransportError};
use crate::bus::BusSender;

/// Grace period for queued writes (usually a stop packet) on disconnect.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// What a notification turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Consumed by the handshake, which is still in progress.
    Handshake,
    /// The handshake just finished.
    Ready,
    /// A batch completion report.
    Done,
    Ignored,
}

struct ActiveLink {
    link: Arc<dyn Link>,
    queue: WriteQueue,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    device: String,
}

pub struct ConnectionManager {
    transport: Box<dyn Transport>,
    state: ConnectionState,
    handshake: Handshake,
    active: Option<ActiveLink>,
    sender: BusSender,
    handshake_timeout: Option<Duration>,
    handshake_deadline: Option<Instant>,
}

impl ConnectionManager {
    pub fn new(
        transport: Box<dyn Transport>,
        sender: BusSender,
        handshake_timeout: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            state: ConnectionState::Disconnected,
            handshake: Handshake::new(),
            active: None,
            sender,
            handshake_timeout,
            handshake_deadline: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn device(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.device.as_str())
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        info!("robot: {} -> {state}", self.state);
        self.state = state;
        self.sender.emit(ConnectionChanged {
            state,
            device: self.device().map(str::to_string),
        });
    }

    /// Open the link and start the handshake. A no-op unless disconnected.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.state != ConnectionState::Disconnected {
            debug!("robot: connect ignored in state {}", self.state);
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);

        let open = match self.transport.open().await {
            Ok(open) => open,
            Err(e) => {
                warn!("robot: connection failed: {e}");
                self.set_state(ConnectionState::Disconnected);
                self.sender
                    .alert(AlertLevel::Error, format!("Connection failed: {e}"));
                return Err(e);
            }
        };
        info!("robot: linked to {}", open.device);

        self.handshake.reset();
        self.active = Some(ActiveLink {
            queue: WriteQueue::new(Arc::clone(&open.link)),
            link: open.link,
            events: open.events,
            device: open.device,
        });
        self.set_state(ConnectionState::Handshake);
        self.handshake_deadline = self.handshake_timeout.map(|t| Instant::now() + t);
        let ticket = self.send_packet(codec::build_handshake_start())?;
        if let Err(e) = ticket.wait().await {
            self.sender
                .alert(AlertLevel::Error, format!("Connection failed: {e}"));
            self.disconnect().await;
            return Err(e);
        }
        Ok(())
    }

    /// Flush queued writes, close the link and reset. Idempotent.
    pub async fn disconnect(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.queue.close(DRAIN_GRACE).await;
            if let Err(e) = active.link.disconnect().await {
                warn!("robot: disconnect failed: {e}");
            }
            info!("robot: disconnected from {}", active.device);
        }
        self.reset();
    }

    /// The link dropped without a request.
    pub fn on_link_lost(&mut self) {
        if self.active.take().is_none() && self.state == ConnectionState::Disconnected {
            return;
        }
        warn!("robot: link lost");
        self.reset();
        self.sender.alert(AlertLevel::Warn, "Robot disconnected");
    }

    fn reset(&mut self) {
        self.handshake.reset();
        self.handshake_deadline = None;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Queue a packet on the open link.
    pub fn send_packet(&self, packet: Vec<u8>) -> Result<WriteTicket, TransportError> {
        let active = self.active.as_ref().ok_or(TransportError::NotConnected)?;
        info!(target: "audit", "{} send {}", self.sender.actor_id(), codec::hex(&packet));
        Ok(active.queue.enqueue(packet))
    }

    pub fn handle_notification(&mut self, data: &[u8]) -> Routed {
        info!(target: "audit", "{} recv {}", self.sender.actor_id(), codec::hex(data));

        if self.state.is_ready() {
            return if codec::contains_completion_marker(data) {
                Routed::Done
            } else {
                Routed::Ignored
            };
        }
        if !self.state.is_handshaking() {
            return Routed::Ignored;
        }

        match self.handshake.advance(data) {
            HandshakeStep::Reply { packet, next } => {
                if let Err(e) = self.send_packet(packet) {
                    warn!("robot: handshake reply not sent: {e}");
                }
                self.set_state(next.into());
                if next == HandshakeStage::Complete {
                    self.handshake_deadline = None;
                    self.sender.emit(StatsCommand::StartSession);
                    Routed::Ready
                } else {
                    Routed::Handshake
                }
            }
            HandshakeStep::Ignored => {
                debug!(
                    "robot: unexpected {} byte notification during {:?}",
                    data.len(),
                    self.handshake.stage()
                );
                Routed::Ignored
            }
        }
    }

    /// Next inbound event. Pending forever while no link is open.
    pub async fn next_event(&mut self) -> LinkEvent {
        match self.active.as_mut() {
            Some(active) => active.events.recv().await.unwrap_or(LinkEvent::Disconnected),
            None => std::future::pending().await,
        }
    }

    pub fn handshake_deadline(&self) -> Option<Instant> {
        self.handshake_deadline
    }

    pub async fn handshake_timed_out(&mut self) {
        warn!("robot: handshake timed out in state {}", self.state);
        self.sender.alert(AlertLevel::Error, "Handshake timed out");
        self.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::robot::mock::MockTransport;
    use crate::bus::{BusReceiver, test_bus};
    use novadrill::{NovaEvent, ShotParameters};

    fn manager(mock: MockTransport, timeout: Option<Duration>) -> (ConnectionManager, BusReceiver) {
        let (sender, rx) = test_bus("robot.0");
        (ConnectionManager::new(Box::new(mock), sender, timeout), rx)
    }

    fn drain(rx: &mut BusReceiver) -> Vec<NovaEvent> {
        let mut out = Vec::new();
        while let Ok(Some(msg)) = rx.poll() {
            out.push(msg.event);
        }
        out
    }

    fn states(events: &[NovaEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                NovaEvent::Connection(c) => Some(c.state),
                _ => None,
            })
            .collect()
    }

    async fn drive_to_ready(conn: &mut ConnectionManager) {
        while !conn.is_ready() {
            match conn.next_event().await {
                LinkEvent::Notification(data) => {
                    conn.handle_notification(&data);
                }
                LinkEvent::Disconnected => panic!("link dropped during handshake"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn walks_every_state_to_ready() {
        let (mut conn, mut rx) = manager(MockTransport::default(), None);
        conn.connect().await.unwrap();
        drive_to_ready(&mut conn).await;

        let events = drain(&mut rx);
        assert_eq!(
            states(&events),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Handshake,
                ConnectionState::Auth1,
                ConnectionState::Auth2,
                ConnectionState::Auth3,
                ConnectionState::Ready,
            ]
        );
        assert!(
            events
                .iter()
                .any(|e| matches!(e, NovaEvent::StatsCommand(StatsCommand::StartSession)))
        );
        assert_eq!(conn.device(), Some("Nova Robot (mock)"));
        assert!(conn.handshake_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn completion_marker_routes_to_done_once_ready() {
        let (mut conn, _rx) = manager(MockTransport::default(), None);
        let mut marker = vec![0x11];
        marker.extend_from_slice(&codec::COMPLETION_MARKER);
        assert_eq!(conn.handle_notification(&marker), Routed::Ignored);

        conn.connect().await.unwrap();
        drive_to_ready(&mut conn).await;
        assert_eq!(conn.handle_notification(&marker), Routed::Done);
        assert_eq!(conn.handle_notification(&[0x01, 0x02]), Routed::Ignored);

        let shot = ShotParameters::new(3000, 2000, 0, 0.0, 50, 1);
        conn.send_packet(codec::build_fire_packet([&shot]).unwrap()).unwrap();
        match conn.next_event().await {
            LinkEvent::Notification(data) => assert_eq!(conn.handle_notification(&data), Routed::Done),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_deadline_is_armed_on_connect() {
        let slow = MockTransport {
            reply_delay: Duration::from_secs(60),
            ..MockTransport::default()
        };
        let (mut conn, mut rx) = manager(slow, Some(Duration::from_secs(5)));
        conn.connect().await.unwrap();
        let deadline = conn.handshake_deadline().unwrap();
        tokio::time::sleep_until(deadline).await;
        conn.handshake_timed_out().await;

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            NovaEvent::Alert(a) if a.message == "Handshake timed out"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn send_without_link_is_rejected() {
        let (conn, _rx) = manager(MockTransport::default(), None);
        assert!(matches!(
            conn.send_packet(codec::build_stop_packet()),
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent_and_connect_works_again() {
        let (mut conn, mut rx) = manager(MockTransport::default(), None);
        conn.disconnect().await;
        assert!(states(&drain(&mut rx)).is_empty());

        conn.connect().await.unwrap();
        drive_to_ready(&mut conn).await;
        conn.disconnect().await;
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.device().is_none());

        conn.connect().await.unwrap();
        drive_to_ready(&mut conn).await;
        assert!(conn.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_alerts_once() {
        let (mut conn, mut rx) = manager(MockTransport::default(), None);
        conn.connect().await.unwrap();
        drain(&mut rx);
        conn.on_link_lost();
        conn.on_link_lost();

        let events = drain(&mut rx);
        assert_eq!(states(&events), vec![ConnectionState::Disconnected]);
        let alerts = events
            .iter()
            .filter(|e| matches!(e, NovaEvent::Alert(_)))
            .count();
        assert_eq!(alerts, 1);
    }
}
