//! Scripted transport and fault-injecting sink shared by the unit tests.

use crate::connection::NotificationHandler;
use crate::error::{PersistenceError, TransportError};
use crate::events::PipelineEvent;
use crate::persistence::PersistenceSink;
use crate::sample::Sample;
use crate::transport::{DiscoveredDevice, FrameStream, Transport};
use async_trait::async_trait;
use crossbeam_channel::Receiver;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Poll `check` until it holds, panicking after a few seconds
pub async fn wait_until<F: FnMut() -> bool>(mut check: F) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

pub fn drain_events(events: &Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    events.try_iter().collect()
}

#[derive(Default)]
struct Script {
    devices: Mutex<Vec<DiscoveredDevice>>,
    scan_delay: Mutex<Option<Duration>>,
    fail_connect: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_unsubscribe: AtomicBool,
    fail_disconnect: AtomicBool,
    connect_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    connected: Mutex<Option<String>>,
    frames: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

/// In-memory peripheral. Clones share the same script.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Script>,
}

impl ScriptedTransport {
    pub fn with_devices(devices: Vec<DiscoveredDevice>) -> Self {
        let transport = Self::default();
        *transport.script.devices.lock().unwrap() = devices;
        transport
    }

    /// A nearby Verity Sense next to an unrelated device
    pub fn polar() -> Self {
        Self::with_devices(vec![
            DiscoveredDevice::new("JBL Flip 5", "00:11:22:33:44:55"),
            DiscoveredDevice::new("Polar Verity Sense 0A3BD92C", "C4:1B:00:11:22:33"),
        ])
    }

    pub fn set_scan_delay(&self, delay: Duration) {
        *self.script.scan_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.script.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.script.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn fail_unsubscribe(&self, fail: bool) {
        self.script.fail_unsubscribe.store(fail, Ordering::SeqCst);
    }

    pub fn fail_disconnect(&self, fail: bool) {
        self.script.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    /// Deliver a notification; false when nothing is subscribed
    pub fn push(&self, frame: Vec<u8>) -> bool {
        match self.script.frames.lock().unwrap().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Peripheral goes out of range: the notification stream ends
    pub fn drop_link(&self) {
        self.script.frames.lock().unwrap().take();
    }

    pub fn connected_address(&self) -> Option<String> {
        self.script.connected.lock().unwrap().clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.script.connect_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.script.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.script.unsubscribe_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.script.disconnect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    type Handle = String;

    async fn scan(&self, _timeout: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let delay = *self.script.scan_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.script.devices.lock().unwrap().clone())
    }

    async fn connect(&self, address: &str) -> Result<String, TransportError> {
        self.script.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        *self.script.connected.lock().unwrap() = Some(address.to_string());
        Ok(address.to_string())
    }

    async fn subscribe(
        &self,
        _handle: &String,
        _characteristic: Uuid,
    ) -> Result<FrameStream, TransportError> {
        self.script.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Subscribe("notify not permitted".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.script.frames.lock().unwrap() = Some(tx);
        let frames = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        Ok(frames.boxed())
    }

    async fn unsubscribe(&self, _handle: &String, _characteristic: Uuid) -> Result<(), TransportError> {
        self.script.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Unsubscribe("GATT error".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&self, _handle: &String) -> Result<(), TransportError> {
        self.script.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.script.frames.lock().unwrap().take();
        self.script.connected.lock().unwrap().take();
        if self.script.fail_disconnect.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnect("already gone".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct CollectingHandler {
    frames: Mutex<Vec<Vec<u8>>>,
    link_lost: AtomicBool,
}

impl CollectingHandler {
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    pub async fn wait_for_frames(&self, count: usize) {
        wait_until(|| self.frames.lock().unwrap().len() >= count).await;
    }

    pub async fn wait_for_link_lost(&self) {
        wait_until(|| self.link_lost.load(Ordering::SeqCst)).await;
    }
}

impl NotificationHandler for CollectingHandler {
    fn on_notification(&self, frame: Vec<u8>) {
        self.frames.lock().unwrap().push(frame);
    }

    fn on_link_lost(&self) {
        self.link_lost.store(true, Ordering::SeqCst);
    }
}

/// Sink keeping everything in memory; can be told to fail upcoming writes
#[derive(Clone, Default)]
pub struct RecordingSink {
    written: Arc<Mutex<Vec<Sample>>>,
    failures_left: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
    partial: Arc<AtomicUsize>,
}

impl RecordingSink {
    pub fn fail_next(&self, writes: usize) {
        self.failures_left.store(writes, Ordering::SeqCst);
    }

    /// Failing writes commit this many leading samples first
    pub fn commit_prefix_on_failure(&self, samples: usize) {
        self.partial.store(samples, Ordering::SeqCst);
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.written.lock().unwrap().clone()
    }

    pub fn heart_rates(&self) -> Vec<u16> {
        self.samples().iter().map(|s| s.heart_rate()).collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl PersistenceSink for RecordingSink {
    fn write_batch(&mut self, samples: &[Sample]) -> Result<usize, PersistenceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if failing {
            let prefix = self.partial.load(Ordering::SeqCst).min(samples.len());
            self.written
                .lock()
                .unwrap()
                .extend_from_slice(&samples[..prefix]);
            return Err(PersistenceError::rejected(prefix, "disk I/O error"));
        }

        self.written.lock().unwrap().extend_from_slice(samples);
        Ok(samples.len())
    }
}
