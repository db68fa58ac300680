//! # Connection Management Module
//!
//! Drives the peripheral through discovery, connect, subscribe, monitor and
//! teardown, and routes every notification frame to a [`NotificationHandler`].
//!
//! ## States
//! ```text
//! Idle -> Scanning -> Connecting -> Connected -> Monitoring
//!           |             |             |            |
//!           v             v             v            v
//!         Failed        Failed        Failed    Disconnecting -> Idle
//! ```
//! `Failed` holds no peripheral. The next `connect()` or `start_monitoring()`
//! starts over from `Idle`.
//!
//! ## Ownership
//! The peripheral handle lives inside the supervisor's link state and is only
//! cloned into the notification task. All transitions happen while holding the
//! link lock, so intermediate states are never observed half-done. Dropping
//! the supervisor stops notification forwarding at once and finishes the
//! teardown on the current tokio runtime.

use crate::error::{MonitorError, TransportError};
use crate::events::{EventSender, PipelineEvent, TeardownStep};
use crate::transport::{DiscoveredDevice, FrameStream, Transport};
use futures::StreamExt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Extra time granted to a transport scan beyond the requested timeout
const SCAN_GRACE: Duration = Duration::from_millis(500);

/// Upper bound for each best-effort teardown step
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    DeviceNotFound,
    DiscoveryError,
    ConnectError,
    SubscribeError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Monitoring,
    Disconnecting,
    Failed(FailureReason),
}

/// What to look for and how long to look
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub target_name: String,
    pub characteristic: Uuid,
    pub scan_timeout: Duration,
}

/// Receives notification frames from the monitoring task.
///
/// Called from a tokio task, so implementations must not block.
pub trait NotificationHandler: Send + Sync + 'static {
    fn on_notification(&self, frame: Vec<u8>);

    /// The notification stream ended without a stop request
    fn on_link_lost(&self) {}
}

struct Link<H> {
    state: ConnectionState,
    handle: Option<H>,
    forwarder: Option<JoinHandle<()>>,
    /// Bumped on every successful connect so a stale task can't tear down a newer link
    generation: u64,
}

struct Shared<T: Transport> {
    transport: T,
    settings: LinkSettings,
    link: Mutex<Link<T::Handle>>,
    /// Wakes an in-flight discovery when a stop is requested
    cancel: Notify,
    events: EventSender,
}

/// Owns the peripheral and its lifecycle
pub struct ConnectionSupervisor<T: Transport> {
    shared: Arc<Shared<T>>,
    released: AtomicBool,
}

impl<T: Transport> ConnectionSupervisor<T> {
    pub fn new(transport: T, settings: LinkSettings, events: EventSender) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                settings,
                link: Mutex::new(Link {
                    state: ConnectionState::Idle,
                    handle: None,
                    forwarder: None,
                    generation: 0,
                }),
                cancel: Notify::new(),
                events,
            }),
            released: AtomicBool::new(false),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.link.lock().await.state.clone()
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.shared.settings
    }

    /// Discover and connect to the target without subscribing.
    ///
    /// A no-op when already connected or monitoring.
    pub async fn connect(&self) -> Result<(), MonitorError> {
        let mut link = self.shared.link.lock().await;
        self.shared.connect_locked(&mut link).await
    }

    /// Connect if needed and subscribe to notifications.
    ///
    /// Calling this while already monitoring succeeds without subscribing again.
    pub async fn start_monitoring(
        &self,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<(), MonitorError> {
        let mut link = self.shared.link.lock().await;
        if link.state == ConnectionState::Monitoring {
            log::debug!("Already monitoring");
            return Ok(());
        }

        self.shared.connect_locked(&mut link).await?;
        Shared::subscribe_locked(&self.shared, &mut link, handler).await
    }

    /// Unsubscribe and disconnect, always ending in `Idle`.
    ///
    /// A connect still scanning is cancelled first. Teardown failures are
    /// logged and reported as events, never returned.
    pub async fn stop_monitoring(&self) {
        self.shared.cancel.notify_waiters();
        let mut link = self.shared.link.lock().await;
        self.shared.teardown_locked(&mut link).await;
    }

    /// Stop forwarding notifications now and tear the link down in the background.
    ///
    /// Runs once; later calls do nothing. Outside a tokio runtime the forwarder
    /// is still aborted but the peripheral is left to the transport.
    pub(crate) fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.cancel.notify_waiters();

        if let Ok(mut link) = self.shared.link.try_lock() {
            if link.state == ConnectionState::Idle {
                return;
            }
            if let Some(task) = link.forwarder.take() {
                task.abort();
            }
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let shared = Arc::clone(&self.shared);
                runtime.spawn(async move {
                    let mut link = shared.link.lock().await;
                    shared.teardown_locked(&mut link).await;
                });
            }
            Err(_) => log::warn!("No tokio runtime on drop, peripheral left connected"),
        }
    }
}

impl<T: Transport> Drop for ConnectionSupervisor<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: Transport> Shared<T> {
    fn transition(&self, link: &mut Link<T::Handle>, to: ConnectionState) {
        if link.state == to {
            return;
        }
        let from = std::mem::replace(&mut link.state, to.clone());
        log::info!("Connection state: {:?} -> {:?}", from, to);
        self.events.emit(PipelineEvent::StateChanged { from, to });
    }

    fn fail(&self, link: &mut Link<T::Handle>, error: MonitorError) -> MonitorError {
        log::error!("{}", error);
        let reason = match &error {
            MonitorError::DeviceNotFound { .. } => FailureReason::DeviceNotFound,
            MonitorError::Discovery(_) | MonitorError::Cancelled => FailureReason::DiscoveryError,
            MonitorError::ConnectError { .. } => FailureReason::ConnectError,
            MonitorError::SubscribeError(_) | MonitorError::PipelineClosed => {
                FailureReason::SubscribeError
            }
        };
        self.transition(link, ConnectionState::Failed(reason));
        error
    }

    async fn connect_locked(&self, link: &mut Link<T::Handle>) -> Result<(), MonitorError> {
        match link.state {
            ConnectionState::Connected | ConnectionState::Monitoring => return Ok(()),
            ConnectionState::Failed(_) => self.transition(link, ConnectionState::Idle),
            _ => {}
        }

        self.transition(link, ConnectionState::Scanning);
        let discovered = tokio::select! {
            result = self.discover() => result,
            _ = self.cancel.notified() => {
                log::info!("Discovery cancelled");
                self.transition(link, ConnectionState::Idle);
                return Err(MonitorError::Cancelled);
            }
        };
        let device = match discovered {
            Ok(device) => device,
            Err(e) => return Err(self.fail(link, e)),
        };

        log::info!("Found device: {} ({})", device.name, device.address);
        self.events.emit(PipelineEvent::DeviceFound {
            name: device.name.clone(),
            address: device.address.clone(),
        });

        self.transition(link, ConnectionState::Connecting);
        match self.transport.connect(&device.address).await {
            Ok(handle) => {
                link.handle = Some(handle);
                link.generation += 1;
                self.transition(link, ConnectionState::Connected);
                Ok(())
            }
            Err(source) => Err(self.fail(
                link,
                MonitorError::ConnectError {
                    address: device.address,
                    source,
                },
            )),
        }
    }

    async fn discover(&self) -> Result<DiscoveredDevice, MonitorError> {
        let timeout = self.settings.scan_timeout;
        let target = &self.settings.target_name;
        log::info!("Scanning for \"{}\" ({:?})", target, timeout);

        let devices =
            match tokio::time::timeout(timeout + SCAN_GRACE, self.transport.scan(timeout)).await {
                Ok(Ok(devices)) => devices,
                Ok(Err(e)) => return Err(MonitorError::Discovery(e)),
                Err(_) => {
                    log::warn!("Scan did not return within {:?}", timeout + SCAN_GRACE);
                    Vec::new()
                }
            };

        devices
            .into_iter()
            .find(|d| d.matches(target))
            .ok_or_else(|| MonitorError::DeviceNotFound {
                target: target.clone(),
            })
    }

    async fn subscribe_locked(
        this: &Arc<Self>,
        link: &mut Link<T::Handle>,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<(), MonitorError> {
        let Some(handle) = link.handle.clone() else {
            let e = TransportError::Subscribe("no connected peripheral".to_string());
            return Err(this.fail(link, MonitorError::SubscribeError(e)));
        };

        match this
            .transport
            .subscribe(&handle, this.settings.characteristic)
            .await
        {
            Ok(frames) => {
                let task = tokio::spawn(Arc::clone(this).forward(frames, handler, link.generation));
                link.forwarder = Some(task);
                this.transition(link, ConnectionState::Monitoring);
                Ok(())
            }
            Err(e) => {
                // Failed never keeps a peripheral
                if let Some(handle) = link.handle.take() {
                    this.best_effort(TeardownStep::Disconnect, this.transport.disconnect(&handle))
                        .await;
                }
                Err(this.fail(link, MonitorError::SubscribeError(e)))
            }
        }
    }

    /// Notification task: frames go to the handler until the stream ends
    async fn forward(
        self: Arc<Self>,
        mut frames: FrameStream,
        handler: Arc<dyn NotificationHandler>,
        generation: u64,
    ) {
        while let Some(frame) = frames.next().await {
            handler.on_notification(frame);
        }

        let mut link = self.link.lock().await;
        if link.generation != generation || link.state != ConnectionState::Monitoring {
            return;
        }

        log::warn!("Notification stream ended, peripheral disconnected");
        link.forwarder = None;
        self.events.emit(PipelineEvent::LinkLost);
        handler.on_link_lost();

        self.transition(&mut link, ConnectionState::Disconnecting);
        if let Some(handle) = link.handle.take() {
            self.best_effort(TeardownStep::Disconnect, self.transport.disconnect(&handle))
                .await;
        }
        self.transition(&mut link, ConnectionState::Idle);
    }

    async fn teardown_locked(&self, link: &mut Link<T::Handle>) {
        let was = link.state.clone();
        if was == ConnectionState::Idle {
            return;
        }

        self.transition(link, ConnectionState::Disconnecting);

        if let Some(task) = link.forwarder.take() {
            task.abort();
            // Wait until the task is gone so no frame slips past this point
            let _ = task.await;
        }

        if let Some(handle) = link.handle.take() {
            if was == ConnectionState::Monitoring {
                self.best_effort(
                    TeardownStep::Unsubscribe,
                    self.transport
                        .unsubscribe(&handle, self.settings.characteristic),
                )
                .await;
            }
            self.best_effort(TeardownStep::Disconnect, self.transport.disconnect(&handle))
                .await;
        }

        self.transition(link, ConnectionState::Idle);
    }

    async fn best_effort<F>(&self, step: TeardownStep, op: F)
    where
        F: Future<Output = Result<(), TransportError>>,
    {
        let reason = match tokio::time::timeout(TEARDOWN_TIMEOUT, op).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", TEARDOWN_TIMEOUT),
        };

        log::warn!("Ignoring {:?} failure during teardown: {}", step, reason);
        self.events
            .emit(PipelineEvent::TeardownFailed { step, reason });
    }
}
