//! Link abstraction between the connection manager and the radio.
//!
//! A `Transport` opens a `Link`: the write half as a trait object, the
//! inbound side as a channel of `LinkEvent`s. The BLE implementation lives
//! in `ble.rs`, the simulated robot in `mock.rs`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use novadrill::{RobotSection, TransportKind};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Ble(#[from] btleplug::Error),
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error("no robot found within {0} s")]
    ScanTimeout(u64),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("characteristic {0} not found")]
    CharacteristicMissing(uuid::Uuid),
    #[error("not connected")]
    NotConnected,
    #[error("write queue closed")]
    QueueClosed,
}

/// Inbound side of an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Notification(Vec<u8>),
    /// The link dropped without us asking.
    Disconnected,
}

/// Write half of an open link. At most one write is in flight at a time;
/// `WriteQueue` guarantees that, not the implementation.
#[async_trait]
pub trait Link: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

pub struct OpenLink {
    pub link: Arc<dyn Link>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
    pub device: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Discover, connect and subscribe. Errors leave nothing open.
    async fn open(&self) -> Result<OpenLink, TransportError>;
}

pub fn from_config(section: &RobotSection) -> Box<dyn Transport> {
    match section.transport {
        TransportKind::Ble => Box::new(super::ble::BleTransport::new(section)),
        TransportKind::Mock => Box::new(super::mock::MockTransport::default()),
    }
}
