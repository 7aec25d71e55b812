//! # P1 Device
//!
//! [`DsmrDevice`] owns a [`Connector`] and runs one reader task per
//! connection. The reader decodes incoming bytes and pushes
//! [`DeviceEvent`]s into a bounded queue; it never waits for the consumer.
//!
//! ```text
//! connector.open() -> read loop -> decoder.feed() -> try_send(DeviceEvent)
//!        ^                |
//!        +-- LinkAction::Reopen (serial autodetection)
//! ```
//!
//! The reader task ends on a read error, end of stream, an open failure or a
//! fatal decode error. The owner restarts it with [`DsmrDevice::restart`].

pub mod connector;
pub mod listener;
pub mod serial;
pub mod watchdog;

pub use connector::{BoxedStream, Connector, LinkAction, LinkEvent, TcpConnector};
pub use listener::{DsmrEventListener, ListenerRegistry};
pub use serial::{SerialAutoDetector, SerialConnector, SerialParity, SerialSettings};
pub use watchdog::{ReceiveWatchdog, StatusChange, WatchdogVerdict};

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::constants::{EVENT_QUEUE_CAPACITY, READER_IDLE_TICK, READ_BUFFER_SIZE};
use crate::error::{DsmrError, ErrorStatus};
use crate::telegram::{DecodeEvent, DecoderOptions, Telegram, TelegramDecoder};
use crate::util::logging::{log_frame_hex, LogThrottle};

/// Event delivered from the reader task to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Telegram(Telegram),
    Error(ErrorStatus),
}

enum ReaderSlot {
    Idle(Box<dyn Connector>),
    Running {
        shutdown: oneshot::Sender<()>,
        handle: JoinHandle<Box<dyn Connector>>,
    },
    /// Closed, or the reader task panicked and took the connector with it
    Empty,
}

/// Resets the restart flag when a restart finishes, also on early return.
struct RestartGuard<'a>(&'a AtomicBool);

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct DsmrDevice {
    name: String,
    decoder: DecoderOptions,
    slot: Mutex<ReaderSlot>,
    events: mpsc::Sender<DeviceEvent>,
    restarting: AtomicBool,
}

impl DsmrDevice {
    /// Creates the device and the receiving end of its event queue.
    pub fn new(
        connector: Box<dyn Connector>,
        decoder: DecoderOptions,
    ) -> (Self, mpsc::Receiver<DeviceEvent>) {
        let (events, receiver) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let device = DsmrDevice {
            name: connector.name(),
            decoder,
            slot: Mutex::new(ReaderSlot::Idle(connector)),
            events,
            restarting: AtomicBool::new(false),
        };
        (device, receiver)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the reader task. Does nothing if it is already running.
    pub async fn start(&self) -> Result<(), DsmrError> {
        let mut slot = self.slot.lock().await;
        match std::mem::replace(&mut *slot, ReaderSlot::Empty) {
            ReaderSlot::Idle(connector) => {
                *slot = self.spawn_reader(connector);
                Ok(())
            }
            running @ ReaderSlot::Running { .. } => {
                *slot = running;
                Ok(())
            }
            ReaderSlot::Empty => Err(DsmrError::Device(format!("{} is closed", self.name))),
        }
    }

    /// Stops the reader, if any, and starts a new one.
    ///
    /// Calls made while a restart is in progress return immediately.
    pub async fn restart(&self) -> Result<(), DsmrError> {
        if self
            .restarting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("Restart of {} already in progress", self.name);
            return Ok(());
        }
        let _guard = RestartGuard(&self.restarting);

        log::info!("Restarting {}", self.name);
        let mut slot = self.slot.lock().await;
        match stop_reader(&mut slot).await {
            Some(connector) => {
                *slot = self.spawn_reader(connector);
                Ok(())
            }
            None => Err(DsmrError::Device(format!("{} is closed", self.name))),
        }
    }

    /// Interrupts the reader, waits for it to finish and hands back the
    /// connector. The device cannot be started again afterwards.
    pub async fn close(&self) -> Option<Box<dyn Connector>> {
        let mut slot = self.slot.lock().await;
        let connector = stop_reader(&mut slot).await;
        log::debug!("Closed {}", self.name);
        connector
    }

    /// True while the reader task is alive.
    pub async fn is_running(&self) -> bool {
        match &*self.slot.lock().await {
            ReaderSlot::Running { handle, .. } => !handle.is_finished(),
            _ => false,
        }
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    fn spawn_reader(&self, connector: Box<dyn Connector>) -> ReaderSlot {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let reader = Reader {
            connector,
            decoder: self.decoder.build(),
            events: self.events.clone(),
            throttle: LogThrottle::new(60_000, 5),
        };
        let handle = tokio::spawn(reader.run(shutdown_rx));
        ReaderSlot::Running { shutdown, handle }
    }
}

impl Drop for DsmrDevice {
    fn drop(&mut self) {
        if let Ok(slot) = self.slot.try_lock() {
            if let ReaderSlot::Running { handle, .. } = &*slot {
                handle.abort();
            }
        }
    }
}

async fn stop_reader(slot: &mut ReaderSlot) -> Option<Box<dyn Connector>> {
    match std::mem::replace(slot, ReaderSlot::Empty) {
        ReaderSlot::Idle(connector) => Some(connector),
        ReaderSlot::Running { shutdown, handle } => {
            // The task may already have ended on its own
            let _ = shutdown.send(());
            match handle.await {
                Ok(connector) => Some(connector),
                Err(e) => {
                    log::error!("Reader task failed: {e}");
                    None
                }
            }
        }
        ReaderSlot::Empty => None,
    }
}

enum Step {
    Continue,
    Reopen(Option<ErrorStatus>),
    Stop,
}

struct Reader {
    connector: Box<dyn Connector>,
    decoder: Box<dyn TelegramDecoder>,
    events: mpsc::Sender<DeviceEvent>,
    throttle: LogThrottle,
}

impl Reader {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Box<dyn Connector> {
        let name = self.connector.name();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        log::debug!("Reader for {name} started");

        'connection: loop {
            let opened = tokio::select! {
                _ = &mut shutdown => break 'connection,
                opened = self.connector.open() => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(status) => {
                    log::warn!("Cannot open {name}: {status}");
                    self.emit(DeviceEvent::Error(status));
                    break 'connection;
                }
            };
            self.decoder.reset();

            let mut idle =
                tokio::time::interval_at(Instant::now() + READER_IDLE_TICK, READER_IDLE_TICK);
            idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let step = tokio::select! {
                    _ = &mut shutdown => break 'connection,
                    read = stream.read(&mut buffer) => match read {
                        Ok(0) => {
                            log::warn!("{name} closed the connection");
                            self.emit(DeviceEvent::Error(ErrorStatus::SerialDataReadError(
                                "end of stream".to_string(),
                            )));
                            Step::Stop
                        }
                        Ok(n) => self.process(&buffer[..n]),
                        Err(e) => {
                            log::warn!("Reading from {name} failed: {e}");
                            self.emit(DeviceEvent::Error(ErrorStatus::SerialDataReadError(
                                e.to_string(),
                            )));
                            Step::Stop
                        }
                    },
                    _ = idle.tick() => self.link_action(LinkEvent::Idle),
                };

                match step {
                    Step::Continue => {}
                    Step::Reopen(report) => {
                        if let Some(status) = report {
                            self.emit(DeviceEvent::Error(status));
                        }
                        continue 'connection;
                    }
                    Step::Stop => break 'connection,
                }
            }
        }

        log::debug!("Reader for {name} stopped");
        self.connector
    }

    fn process(&mut self, data: &[u8]) -> Step {
        log_frame_hex("P1 RX", data);
        let mut step = Step::Continue;
        for event in self.decoder.feed(data) {
            let next = match event {
                DecodeEvent::Telegram(telegram) => {
                    self.emit(DeviceEvent::Telegram(telegram));
                    self.link_action(LinkEvent::Telegram)
                }
                DecodeEvent::Rejected(err) => {
                    crate::log_warn_throttled!(self.throttle, "Telegram rejected: {err}");
                    self.emit(DeviceEvent::Error(ErrorStatus::from(&err)));
                    self.link_action(LinkEvent::DecodeError)
                }
                DecodeEvent::Failed(status) => {
                    let fatal = status.is_fatal();
                    self.emit(DeviceEvent::Error(status));
                    if fatal {
                        Step::Stop
                    } else {
                        Step::Continue
                    }
                }
            };
            match next {
                Step::Continue => {}
                other => {
                    step = other;
                    break;
                }
            }
        }
        step
    }

    fn link_action(&mut self, event: LinkEvent) -> Step {
        match self.connector.observe(event, Instant::now()) {
            LinkAction::Continue => Step::Continue,
            LinkAction::Reopen { report } => Step::Reopen(report),
        }
    }

    fn emit(&mut self, event: DeviceEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                crate::log_warn_throttled!(
                    self.throttle,
                    "Event queue full, dropping {}",
                    match dropped {
                        DeviceEvent::Telegram(_) => "telegram".to_string(),
                        DeviceEvent::Error(status) => status.to_string(),
                    }
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Event queue closed, dropping event");
            }
        }
    }
}
