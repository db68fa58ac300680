//! # Transport Capability
//!
//! The connection supervisor only talks to the peripheral through the
//! [`Transport`] trait, so the lifecycle can be driven by btleplug in the
//! binary and by a scripted transport in tests.
//!
//! Notifications come back as a [`FrameStream`]. The stream ending means the
//! link went away without being asked to.

pub mod ble;

use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use uuid::Uuid;

/// Standard Heart Rate Measurement characteristic (0x2A37)
pub const HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// Raw notification payloads, in arrival order
pub type FrameStream = BoxStream<'static, Vec<u8>>;

/// A peripheral seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
}

impl DiscoveredDevice {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Case-insensitive substring match on the advertised name
    pub fn matches(&self, target: &str) -> bool {
        self.name.to_lowercase().contains(&target.to_lowercase())
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connected peripheral. Cloned into the notification task.
    type Handle: Clone + Send + Sync + 'static;

    /// Devices advertising a name within `timeout`
    async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>, TransportError>;

    async fn connect(&self, address: &str) -> Result<Self::Handle, TransportError>;

    /// Enable notifications on `characteristic` and return the frames it pushes
    async fn subscribe(
        &self,
        handle: &Self::Handle,
        characteristic: Uuid,
    ) -> Result<FrameStream, TransportError>;

    async fn unsubscribe(
        &self,
        handle: &Self::Handle,
        characteristic: Uuid,
    ) -> Result<(), TransportError>;

    async fn disconnect(&self, handle: &Self::Handle) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_name_match() {
        let device = DiscoveredDevice::new("Polar Verity Sense 0A3BD92C", "C4:1B:00:11:22:33");
        assert!(device.matches("Polar Verity Sense"));
        assert!(device.matches("polar verity"));
        assert!(device.matches("VERITY"));
        assert!(!device.matches("Polar H10"));
    }
}
