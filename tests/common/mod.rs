//! Shared telegrams and helpers for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use dsmr_rs::device::{BoxedStream, Connector, LinkAction, LinkEvent};
use dsmr_rs::telegram::crc::seal_telegram;
use dsmr_rs::ErrorStatus;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, DuplexStream};
use tokio::time::Instant;

/// DSMR 5.0 telegram of a Iskra AM550 with a gas meter on channel 1.
pub const DSMR5_BODY: &str = "/ISK5\\2M550T-1012\r\n\
\r\n\
1-3:0.2.8(50)\r\n\
0-0:1.0.0(190214211400W)\r\n\
0-0:96.1.1(4530303434303037313331363530363136)\r\n\
1-0:1.8.1(000671.578*kWh)\r\n\
1-0:1.8.2(000842.472*kWh)\r\n\
1-0:2.8.1(000000.000*kWh)\r\n\
1-0:2.8.2(000000.000*kWh)\r\n\
0-0:96.14.0(0001)\r\n\
1-0:1.7.0(00.333*kW)\r\n\
1-0:2.7.0(00.000*kW)\r\n\
0-0:96.7.21(00008)\r\n\
0-0:96.7.9(00007)\r\n\
1-0:99.97.0(1)(0-0:96.7.19)(180104110418W)(0000012156*s)\r\n\
1-0:32.32.0(00000)\r\n\
1-0:52.32.0(00000)\r\n\
1-0:72.32.0(00000)\r\n\
1-0:32.36.0(00000)\r\n\
1-0:52.36.0(00000)\r\n\
1-0:72.36.0(00000)\r\n\
0-0:96.13.0()\r\n\
1-0:32.7.0(231.0*V)\r\n\
1-0:52.7.0(230.0*V)\r\n\
1-0:72.7.0(232.0*V)\r\n\
1-0:31.7.0(001*A)\r\n\
1-0:51.7.0(001*A)\r\n\
1-0:71.7.0(000*A)\r\n\
1-0:21.7.0(00.133*kW)\r\n\
1-0:41.7.0(00.100*kW)\r\n\
1-0:61.7.0(00.100*kW)\r\n\
1-0:22.7.0(00.000*kW)\r\n\
1-0:42.7.0(00.000*kW)\r\n\
1-0:62.7.0(00.000*kW)\r\n\
0-1:24.1.0(003)\r\n\
0-1:96.1.0(4730303339303031373030343630313137)\r\n\
0-1:24.2.1(190214211005W)(00598.387*m3)\r\n";

/// Number of objects in [`DSMR5_BODY`].
pub const DSMR5_OBJECTS: usize = 35;

/// DSMR 2.2 telegram: no checksum, gas reading on a continuation line.
pub const DSMR22_TELEGRAM: &str = "/ISk5\\2MT382-1004\r\n\
\r\n\
0-0:96.1.1(00000000000000)\r\n\
1-0:1.8.1(00001.001*kWh)\r\n\
1-0:1.8.2(00001.001*kWh)\r\n\
1-0:2.8.1(00001.001*kWh)\r\n\
1-0:2.8.2(00001.001*kWh)\r\n\
0-0:96.14.0(0001)\r\n\
1-0:1.7.0(0001.01*kW)\r\n\
1-0:2.7.0(0000.00*kW)\r\n\
0-0:17.0.0(0999.00*kW)\r\n\
0-0:96.3.10(1)\r\n\
0-0:96.13.1()\r\n\
0-0:96.13.0()\r\n\
0-1:24.1.0(3)\r\n\
0-1:96.1.0(3238313031453631373038393930)\r\n\
0-1:24.3.0(120517020000)(08)(60)(1)(0-1:24.2.1)(m3)\r\n\
(00124.477)\r\n\
0-1:24.4.0(1)\r\n\
!\r\n";

/// Smarty key used by the test frames.
pub const SMARTY_KEY: &str = "000102030405060708090A0B0C0D0E0F";

pub const SMARTY_SYSTEM_TITLE: [u8; 8] = *b"SAG\x10\x00\x00\x00\x01";

/// Luxembourg Smarty telegram body (plaintext of the encrypted frames).
pub const SMARTY_BODY: &str = "/Lux5\\SMARTY1\r\n\
\r\n\
1-3:0.2.8(42)\r\n\
0-0:1.0.0(170102192002W)\r\n\
0-0:42.0.0(53414733303832323030303032313630)\r\n\
1-0:1.8.0(000001.000*kWh)\r\n\
1-0:2.8.0(000002.000*kWh)\r\n\
1-0:1.7.0(00.111*kW)\r\n\
1-0:2.7.0(00.000*kW)\r\n\
0-0:17.0.0(999.9*kVA)\r\n\
0-0:96.3.10(1)\r\n";

pub fn dsmr5_telegram() -> String {
    seal_telegram(DSMR5_BODY)
}

pub fn smarty_telegram() -> String {
    seal_telegram(SMARTY_BODY)
}

/// Replaces the checksum of a sealed telegram with a wrong one.
pub fn corrupt_crc(sealed: &str) -> String {
    let bang = sealed.rfind('!').expect("sealed telegram");
    let crc = u16::from_str_radix(&sealed[bang + 1..bang + 5], 16).expect("crc digits");
    format!("{}{:04X}\r\n", &sealed[..=bang], crc ^ 0x0101)
}

/// Counters shared between a [`ScriptedConnector`] and the test.
#[derive(Default)]
pub struct ConnectorStats {
    pub opens: AtomicUsize,
    pub observed: Mutex<Vec<LinkEvent>>,
}

impl ConnectorStats {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn observed(&self, event: LinkEvent) -> usize {
        self.observed
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == event)
            .count()
    }
}

/// Connector handing out prepared in-memory streams, one per `open`.
/// Fails with `ConnectionFailed` once the streams are used up.
pub struct ScriptedConnector {
    streams: VecDeque<BoxedStream>,
    stats: Arc<ConnectorStats>,
    /// Reopen after this many decode errors, reporting the given status
    reopen_after_errors: Option<(usize, Option<ErrorStatus>)>,
    errors: usize,
}

impl ScriptedConnector {
    pub fn new<S>(streams: Vec<S>) -> (Self, Arc<ConnectorStats>)
    where
        S: AsyncRead + Send + Unpin + 'static,
    {
        let stats = Arc::new(ConnectorStats::default());
        (
            ScriptedConnector {
                streams: streams
                    .into_iter()
                    .map(|stream| Box::new(stream) as BoxedStream)
                    .collect(),
                stats: stats.clone(),
                reopen_after_errors: None,
                errors: 0,
            },
            stats,
        )
    }

    pub fn reopen_after_errors(mut self, errors: usize, report: Option<ErrorStatus>) -> Self {
        self.reopen_after_errors = Some((errors, report));
        self
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&mut self) -> Result<BoxedStream, ErrorStatus> {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        match self.streams.pop_front() {
            Some(stream) => Ok(stream),
            None => Err(ErrorStatus::ConnectionFailed("no more streams".to_string())),
        }
    }

    fn name(&self) -> String {
        "scripted".to_string()
    }

    fn observe(&mut self, event: LinkEvent, _now: Instant) -> LinkAction {
        self.stats.observed.lock().unwrap().push(event);
        if event == LinkEvent::DecodeError {
            self.errors += 1;
            if let Some((limit, report)) = &self.reopen_after_errors {
                if self.errors >= *limit {
                    self.errors = 0;
                    return LinkAction::Reopen {
                        report: report.clone(),
                    };
                }
            }
        }
        LinkAction::Continue
    }
}

/// In-memory link: the test writes to the first half, the device reads the
/// second.
pub fn link() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(64 * 1024)
}

/// Listener recording everything it receives.
#[derive(Default)]
pub struct RecordingListener {
    pub telegrams: Mutex<Vec<dsmr_rs::Telegram>>,
    pub errors: Mutex<Vec<ErrorStatus>>,
}

impl RecordingListener {
    pub fn telegram_count(&self) -> usize {
        self.telegrams.lock().unwrap().len()
    }

    pub fn error_count(&self, status: &ErrorStatus) -> usize {
        self.errors
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == status)
            .count()
    }
}

impl dsmr_rs::DsmrEventListener for RecordingListener {
    fn telegram_received(&self, telegram: &dsmr_rs::Telegram) {
        self.telegrams.lock().unwrap().push(telegram.clone());
    }

    fn error_received(&self, status: &ErrorStatus) {
        self.errors.lock().unwrap().push(status.clone());
    }
}

/// Polls `condition` until it holds, failing after five seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
