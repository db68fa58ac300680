//! btleplug-backed [`Transport`] using the first Bluetooth adapter found.

use super::{DiscoveredDevice, FrameStream, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::time::Duration;
use uuid::Uuid;

pub struct BleTransport {
    central: Adapter,
}

impl BleTransport {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::Scan(format!("Failed to create BLE manager: {}", e)))?;

        let adapters = manager
            .adapters()
            .await
            .map_err(|e| TransportError::Scan(format!("Failed to get adapters: {}", e)))?;

        let central = adapters.into_iter().next().ok_or(TransportError::NoAdapter)?;
        Ok(Self { central })
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral, TransportError> {
        let peripherals = self.central.peripherals().await.map_err(|e| {
            TransportError::Connect {
                address: address.to_string(),
                reason: format!("Failed to get peripherals: {}", e),
            }
        })?;

        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == address || p.address().to_string() == address)
            .ok_or_else(|| TransportError::Connect {
                address: address.to_string(),
                reason: "Peripheral is no longer known to the adapter".to_string(),
            })
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral.characteristics().into_iter().find(|c| c.uuid == uuid)
}

#[async_trait]
impl Transport for BleTransport {
    type Handle = Peripheral;

    async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
        self.central
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| TransportError::Scan(format!("Failed to start scan: {}", e)))?;

        tokio::time::sleep(timeout).await;

        if let Err(e) = self.central.stop_scan().await {
            log::warn!("Failed to stop scan: {}", e);
        }

        let peripherals = self
            .central
            .peripherals()
            .await
            .map_err(|e| TransportError::Scan(format!("Failed to get peripherals: {}", e)))?;

        let mut devices = Vec::new();
        for peripheral in peripherals {
            if let Ok(Some(props)) = peripheral.properties().await {
                if let Some(local_name) = props.local_name {
                    devices.push(DiscoveredDevice::new(local_name, peripheral.id().to_string()));
                }
            }
        }

        log::debug!("Scan saw {} named devices", devices.len());
        Ok(devices)
    }

    async fn connect(&self, address: &str) -> Result<Peripheral, TransportError> {
        let peripheral = self.find_peripheral(address).await?;

        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        peripheral
            .discover_services()
            .await
            .map_err(|e| TransportError::Connect {
                address: address.to_string(),
                reason: format!("Service discovery failed: {}", e),
            })?;

        Ok(peripheral)
    }

    async fn subscribe(
        &self,
        handle: &Peripheral,
        characteristic: Uuid,
    ) -> Result<FrameStream, TransportError> {
        let target = find_characteristic(handle, characteristic)
            .ok_or_else(|| TransportError::CharacteristicNotFound(characteristic.to_string()))?;

        // Listen for the disconnect before enabling notifications so it cannot be missed
        let mut events = self
            .central
            .events()
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        handle
            .subscribe(&target)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let notifications = handle
            .notifications()
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let id = handle.id();
        let disconnected = async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        break;
                    }
                }
            }
        };

        let frames = notifications
            .filter_map(move |n| async move { (n.uuid == characteristic).then_some(n.value) })
            .take_until(disconnected);

        Ok(frames.boxed())
    }

    async fn unsubscribe(&self, handle: &Peripheral, characteristic: Uuid) -> Result<(), TransportError> {
        let target = find_characteristic(handle, characteristic)
            .ok_or_else(|| TransportError::CharacteristicNotFound(characteristic.to_string()))?;

        handle
            .unsubscribe(&target)
            .await
            .map_err(|e| TransportError::Unsubscribe(e.to_string()))
    }

    async fn disconnect(&self, handle: &Peripheral) -> Result<(), TransportError> {
        handle
            .disconnect()
            .await
            .map_err(|e| TransportError::Disconnect(e.to_string()))
    }
}
