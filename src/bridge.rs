//! # DSMR Bridge
//!
//! [`DsmrBridge`] is the owner of a [`DsmrDevice`]. It runs two tasks next to
//! the reader:
//!
//! - the dispatcher takes events from the device queue, detects the meters
//!   in each telegram and calls the listeners;
//! - the watchdog checks the time since the last telegram, restarts the
//!   device and reports it offline after a prolonged silence.
//!
//! The current state is published as a [`BridgeStatus`] on a
//! `tokio::sync::watch` channel.

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::DsmrConfig;
use crate::device::{
    Connector, DeviceEvent, DsmrDevice, DsmrEventListener, ListenerRegistry, ReceiveWatchdog,
    StatusChange,
};
use crate::error::{DsmrError, ErrorStatus};
use crate::meter::detect_meters;
use crate::telegram::DecoderOptions;

/// State of the bridge as seen by its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BridgeStatus {
    /// Started, no telegram yet
    Initializing,
    Online,
    /// Communication problem; the watchdog keeps restarting the device
    Offline(String),
    /// Needs a configuration change, the reader is stopped
    ConfigurationError(String),
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeStatus::Initializing => write!(f, "initializing"),
            BridgeStatus::Online => write!(f, "online"),
            BridgeStatus::Offline(reason) => write!(f, "offline: {reason}"),
            BridgeStatus::ConfigurationError(reason) => write!(f, "configuration error: {reason}"),
        }
    }
}

/// Publishes a new status unless it is already current. A configuration
/// error sticks until the bridge is rebuilt.
fn publish(status: &watch::Sender<BridgeStatus>, next: BridgeStatus) {
    status.send_if_modified(|current| {
        if *current == next || matches!(current, BridgeStatus::ConfigurationError(_)) {
            return false;
        }
        log::info!("Bridge status: {next}");
        *current = next;
        true
    });
}

pub struct DsmrBridge {
    device: Arc<DsmrDevice>,
    listeners: ListenerRegistry,
    watchdog: Arc<Mutex<ReceiveWatchdog>>,
    status: watch::Sender<BridgeStatus>,
    stop: watch::Sender<bool>,
    events: tokio::sync::Mutex<Option<mpsc::Receiver<DeviceEvent>>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl DsmrBridge {
    pub fn new(
        connector: Box<dyn Connector>,
        decoder: DecoderOptions,
        received_timeout: Duration,
    ) -> Self {
        let (device, events) = DsmrDevice::new(connector, decoder);
        let (status, _) = watch::channel(BridgeStatus::Initializing);
        let (stop, _) = watch::channel(false);
        DsmrBridge {
            device: Arc::new(device),
            listeners: ListenerRegistry::new(),
            watchdog: Arc::new(Mutex::new(ReceiveWatchdog::new(
                received_timeout,
                Instant::now(),
            ))),
            status,
            stop,
            events: tokio::sync::Mutex::new(Some(events)),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Builds a bridge from a validated configuration.
    pub fn from_config(config: &DsmrConfig) -> Result<Self, DsmrError> {
        config.validate()?;
        Ok(Self::new(
            config.connector()?,
            config.decoder_options()?,
            config.received_timeout(),
        ))
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn add_listener(&self, listener: Arc<dyn DsmrEventListener>) {
        self.listeners.add(listener);
    }

    pub fn device(&self) -> &DsmrDevice {
        &self.device
    }

    pub fn status(&self) -> BridgeStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BridgeStatus> {
        self.status.subscribe()
    }

    /// Starts the dispatcher, the watchdog and the device reader.
    pub async fn start(&self) -> Result<(), DsmrError> {
        let events = self
            .events
            .lock()
            .await
            .take()
            .ok_or_else(|| DsmrError::Device("bridge already started".to_string()))?;

        let timeout = {
            let mut watchdog = self.lock_watchdog();
            watchdog.rearm(Instant::now());
            watchdog.timeout()
        };
        log::info!(
            "Starting bridge for {} (received timeout {}s)",
            self.device.name(),
            timeout.as_secs()
        );

        let dispatcher = Dispatcher {
            listeners: self.listeners.clone(),
            watchdog: self.watchdog.clone(),
            status: self.status.clone(),
        };
        let watchdog = WatchdogTask {
            device: self.device.clone(),
            listeners: self.listeners.clone(),
            watchdog: self.watchdog.clone(),
            status: self.status.clone(),
        };

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(dispatcher.run(events, self.stop.subscribe())));
        tasks.push(tokio::spawn(watchdog.run(self.stop.subscribe())));
        drop(tasks);

        self.device.start().await
    }

    /// Stops all tasks and closes the device.
    pub async fn stop(&self) {
        self.stop.send_replace(true);
        self.device.close().await;
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("Bridge task failed: {e}");
            }
        }
        log::info!("Bridge for {} stopped", self.device.name());
    }

    fn lock_watchdog(&self) -> std::sync::MutexGuard<'_, ReceiveWatchdog> {
        self.watchdog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct Dispatcher {
    listeners: ListenerRegistry,
    watchdog: Arc<Mutex<ReceiveWatchdog>>,
    status: watch::Sender<BridgeStatus>,
}

impl Dispatcher {
    async fn run(self, mut events: mpsc::Receiver<DeviceEvent>, mut stop: watch::Receiver<bool>) {
        loop {
            let event = tokio::select! {
                _ = stop.changed() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                DeviceEvent::Telegram(telegram) => {
                    let detection = detect_meters(&telegram);
                    if let Err(status) = detection.check() {
                        log::warn!("Telegram from {} without supported meter", telegram.header);
                        publish(&self.status, BridgeStatus::Offline(status.to_string()));
                        self.listeners.dispatch_error(&status);
                        continue;
                    }
                    let change = self
                        .watchdog
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .telegram_received(Instant::now());
                    if change == Some(StatusChange::Online) {
                        log::info!("Receiving telegrams from {}", telegram.header);
                    }
                    publish(&self.status, BridgeStatus::Online);
                    self.listeners.dispatch_telegram(&telegram);
                }
                DeviceEvent::Error(status) => {
                    if status.is_fatal() {
                        log::error!("Fatal error: {status}");
                        publish(&self.status, BridgeStatus::ConfigurationError(status.to_string()));
                    } else if status.is_communication_error() {
                        publish(&self.status, BridgeStatus::Offline(status.to_string()));
                    } else {
                        log::debug!("Transient error: {status}");
                    }
                    self.listeners.dispatch_error(&status);
                }
            }
        }
        log::debug!("Dispatcher stopped");
    }
}

struct WatchdogTask {
    device: Arc<DsmrDevice>,
    listeners: ListenerRegistry,
    watchdog: Arc<Mutex<ReceiveWatchdog>>,
    status: watch::Sender<BridgeStatus>,
}

impl WatchdogTask {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let period = self
            .watchdog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .period();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {}
            }
            if matches!(*self.status.borrow(), BridgeStatus::ConfigurationError(_)) {
                continue;
            }

            let verdict = self
                .watchdog
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .check(Instant::now());

            if verdict.offline {
                log::warn!("No telegram from {}, reporting offline", self.device.name());
                publish(
                    &self.status,
                    BridgeStatus::Offline(ErrorStatus::TelegramNoData.to_string()),
                );
            }
            if verdict.restart {
                self.listeners.dispatch_error(&ErrorStatus::TelegramNoData);
                if let Err(e) = self.device.restart().await {
                    log::error!("Restart of {} failed: {e}", self.device.name());
                }
            }
        }
        log::debug!("Watchdog stopped");
    }
}
