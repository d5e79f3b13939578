//! BLE transport via btleplug.
//!
//! Scans for the first peripheral advertising the robot service, connects,
//! binds the write and notify characteristics, and forwards notifications
//! and link loss into the `LinkEvent` channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use novadrill::RobotSection;

use super::transport::{Link, LinkEvent, OpenLink, Transport, TransportError};

/// 16-bit service advertised by the robot (0xFEFF).
pub const ADVERTISED_SERVICE: Uuid = Uuid::from_u128(0x0000feff_0000_1000_8000_00805f9b34fb);
pub const ROBOT_SERVICE: Uuid = Uuid::from_u128(0x02f00000_0000_0000_0000_00000000fe00);
pub const WRITE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x02f00000_0000_0000_0000_00000000ff01);
pub const NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x02f00000_0000_0000_0000_00000000ff02);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);

pub struct BleTransport {
    name_prefix: Option<String>,
    scan_timeout: Duration,
}

impl BleTransport {
    pub fn new(section: &RobotSection) -> Self {
        Self {
            name_prefix: section.name_prefix.clone(),
            scan_timeout: section.scan_timeout(),
        }
    }

    async fn first_adapter() -> Result<Adapter, TransportError> {
        let manager = Manager::new().await?;
        manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)
    }

    /// Poll discovered peripherals until one matches.
    async fn find_robot(&self, adapter: &Adapter) -> Result<(Peripheral, String), TransportError> {
        let search = async {
            loop {
                for p in adapter.peripherals().await? {
                    let Ok(Some(props)) = p.properties().await else {
                        continue;
                    };
                    let name = props.local_name.unwrap_or_default();
                    let advertises = props.services.contains(&ADVERTISED_SERVICE)
                        || props.services.contains(&ROBOT_SERVICE);
                    let name_ok = self
                        .name_prefix
                        .as_deref()
                        .is_none_or(|prefix| name.starts_with(prefix));
                    if advertises && name_ok {
                        return Ok::<_, TransportError>((p, name));
                    }
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        };
        tokio::time::timeout(self.scan_timeout, search)
            .await
            .map_err(|_| TransportError::ScanTimeout(self.scan_timeout.as_secs()))?
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn open(&self) -> Result<OpenLink, TransportError> {
        let adapter = Self::first_adapter().await?;

        tracing::info!("ble: scanning (timeout {} s)", self.scan_timeout.as_secs());
        adapter
            .start_scan(ScanFilter {
                services: vec![ADVERTISED_SERVICE],
            })
            .await?;
        let found = self.find_robot(&adapter).await;
        adapter.stop_scan().await.ok();
        let (peripheral, name) = found?;
        let device = if name.is_empty() {
            format!("{:?}", peripheral.id())
        } else {
            name
        };
        tracing::info!("ble: found {device}");

        tokio::time::timeout(CONNECT_TIMEOUT, peripheral.connect())
            .await
            .map_err(|_| TransportError::Timeout("connect"))??;

        // BlueZ reports the connection before the GATT cache is filled.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        let bound = bind(&peripheral).await;
        let (write_char, notify_char) = match bound {
            Ok(chars) => chars,
            Err(e) => {
                peripheral.disconnect().await.ok();
                return Err(e);
            }
        };

        let (tx, events) = mpsc::unbounded_channel();
        let mut notifications = peripheral.notifications().await?;
        peripheral.subscribe(&notify_char).await?;

        let notify_tx = tx.clone();
        let notify_task = tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                if n.uuid == NOTIFY_CHARACTERISTIC {
                    let _ = notify_tx.send(LinkEvent::Notification(n.value));
                }
            }
            let _ = notify_tx.send(LinkEvent::Disconnected);
        });

        let peripheral_id = peripheral.id();
        let watch_task = tokio::spawn(async move {
            match adapter.events().await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        if let CentralEvent::DeviceDisconnected(id) = event
                            && id == peripheral_id
                        {
                            tracing::info!("ble: {id:?} disconnected");
                            let _ = tx.send(LinkEvent::Disconnected);
                            break;
                        }
                    }
                }
                Err(e) => tracing::warn!("ble: cannot watch adapter events: {e}"),
            }
        });

        Ok(OpenLink {
            link: Arc::new(BleLink {
                peripheral,
                write_char,
                tasks: [notify_task, watch_task],
            }),
            events,
            device,
        })
    }
}

async fn bind(peripheral: &Peripheral) -> Result<(Characteristic, Characteristic), TransportError> {
    tokio::time::timeout(DISCOVER_TIMEOUT, peripheral.discover_services())
        .await
        .map_err(|_| TransportError::Timeout("service discovery"))??;

    let chars = peripheral.characteristics();
    let find = |uuid: Uuid| {
        chars
            .iter()
            .find(|c| c.uuid == uuid && c.service_uuid == ROBOT_SERVICE)
            .or_else(|| chars.iter().find(|c| c.uuid == uuid))
            .cloned()
            .ok_or(TransportError::CharacteristicMissing(uuid))
    };
    Ok((find(WRITE_CHARACTERISTIC)?, find(NOTIFY_CHARACTERISTIC)?))
}

struct BleLink {
    peripheral: Peripheral,
    write_char: Characteristic,
    tasks: [JoinHandle<()>; 2],
}

#[async_trait]
impl Link for BleLink {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        self.peripheral
            .write(&self.write_char, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        for task in &self.tasks {
            task.abort();
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
