//! Scripted collaborators shared by the unit tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use serde_json::Value;

use crate::{
    error::InstallerError,
    network::WifiLink,
    ota::FirmwareInstaller,
    telemetry::{PowerSource, Sensor},
    transport::{InboundMessage, MqttTransport},
    types::LinkInfo,
};

pub fn message(topic: &str, payload: impl Into<Vec<u8>>) -> InboundMessage {
    InboundMessage {
        topic: topic.to_string(),
        payload: payload.into(),
    }
}

type Responder = Box<dyn FnMut(&str, &[u8]) -> Vec<InboundMessage> + Send>;

#[derive(Debug, Default)]
pub struct BrokerLog {
    pub connected: bool,
    pub refuse_connect: bool,
    pub connect_calls: usize,
    pub calls: usize,
    pub published: Vec<(String, Vec<u8>)>,
    pub subscribed: Vec<String>,
    pub unsubscribed: Vec<String>,
    pub inbound: VecDeque<InboundMessage>,
}

impl BrokerLog {
    pub fn published_json(&self, topic: &str) -> Vec<Value> {
        self.published
            .iter()
            .filter(|(published, _)| published == topic)
            .filter_map(|(_, payload)| serde_json::from_slice(payload).ok())
            .collect()
    }

    pub fn published_topics(&self) -> Vec<String> {
        self.published.iter().map(|(topic, _)| topic.clone()).collect()
    }
}

pub struct MockTransport {
    log: Arc<Mutex<BrokerLog>>,
    responder: Option<Responder>,
}

impl MockTransport {
    pub fn new() -> (Self, Arc<Mutex<BrokerLog>>) {
        let log = Arc::new(Mutex::new(BrokerLog::default()));
        (
            Self {
                log: log.clone(),
                responder: None,
            },
            log,
        )
    }

    pub fn connected() -> (Self, Arc<Mutex<BrokerLog>>) {
        let (transport, log) = Self::new();
        log.lock().unwrap().connected = true;
        (transport, log)
    }

    /// Answers every publish with the messages `responder` returns, as a
    /// broker would.
    pub fn with_responder(
        mut self,
        responder: impl FnMut(&str, &[u8]) -> Vec<InboundMessage> + Send + 'static,
    ) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }
}

impl MqttTransport for MockTransport {
    fn connect(&mut self, _host: &str, _port: u16, _client_id: &str, _username: &str) -> bool {
        let mut log = self.log.lock().unwrap();
        log.calls += 1;
        log.connect_calls += 1;
        log.connected = !log.refuse_connect;
        log.connected
    }

    fn is_connected(&self) -> bool {
        self.log.lock().unwrap().connected
    }

    fn disconnect(&mut self) {
        let mut log = self.log.lock().unwrap();
        log.calls += 1;
        log.connected = false;
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        {
            let mut log = self.log.lock().unwrap();
            log.calls += 1;
            if !log.connected {
                return false;
            }
            log.published.push((topic.to_string(), payload.to_vec()));
        }

        if let Some(responder) = self.responder.as_mut() {
            let replies = responder(topic, payload);
            self.log.lock().unwrap().inbound.extend(replies);
        }
        true
    }

    fn subscribe(&mut self, topic: &str) -> bool {
        let mut log = self.log.lock().unwrap();
        log.calls += 1;
        if !log.connected {
            return false;
        }
        log.subscribed.push(topic.to_string());
        true
    }

    fn unsubscribe(&mut self, topic: &str) -> bool {
        let mut log = self.log.lock().unwrap();
        log.calls += 1;
        log.unsubscribed.push(topic.to_string());
        log.connected
    }

    fn poll(&mut self) -> Option<InboundMessage> {
        self.log.lock().unwrap().inbound.pop_front()
    }
}

#[derive(Debug, Default)]
pub struct InstallLog {
    pub begun: Vec<usize>,
    pub write_attempts: usize,
    pub writes: Vec<(usize, usize)>,
    pub image: Vec<u8>,
    pub finalized: usize,
    pub aborted: usize,
}

#[derive(Default)]
pub struct MockInstaller {
    log: Arc<Mutex<InstallLog>>,
    fail_always: bool,
    fail_once_at: Vec<usize>,
}

impl MockInstaller {
    pub fn new() -> (Self, Arc<Mutex<InstallLog>>) {
        let installer = Self::default();
        let log = installer.log.clone();
        (installer, log)
    }

    pub fn failing() -> (Self, Arc<Mutex<InstallLog>>) {
        let (mut installer, log) = Self::new();
        installer.fail_always = true;
        (installer, log)
    }

    /// Rejects the first write that starts at `offset`.
    pub fn fail_once_at(mut self, offset: usize) -> Self {
        self.fail_once_at.push(offset);
        self
    }
}

impl FirmwareInstaller for MockInstaller {
    fn begin(&mut self, total_size: usize) -> Result<(), InstallerError> {
        let mut log = self.log.lock().unwrap();
        log.begun.push(total_size);
        log.image.clear();
        Ok(())
    }

    fn write(&mut self, offset: usize, chunk: &[u8]) -> Result<(), InstallerError> {
        let mut log = self.log.lock().unwrap();
        log.write_attempts += 1;

        let injected = match self.fail_once_at.iter().position(|at| *at == offset) {
            Some(position) => {
                self.fail_once_at.remove(position);
                true
            }
            None => false,
        };

        if self.fail_always || injected {
            return Err(InstallerError::Write {
                offset,
                len: chunk.len(),
                reason: "injected fault".to_string(),
            });
        }

        log.writes.push((offset, chunk.len()));
        log.image.extend_from_slice(chunk);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), InstallerError> {
        self.log.lock().unwrap().finalized += 1;
        Ok(())
    }

    fn abort(&mut self) {
        self.log.lock().unwrap().aborted += 1;
    }
}

/// Link that comes up on the `connect_on_poll`-th status poll after `begin`.
pub struct MockLink {
    connect_on_poll: Option<u32>,
    started: bool,
    polls: AtomicU32,
    pub begin_calls: u32,
}

impl MockLink {
    pub fn up_after(polls: u32) -> Self {
        Self {
            connect_on_poll: Some(polls),
            started: false,
            polls: AtomicU32::new(0),
            begin_calls: 0,
        }
    }

    pub fn never() -> Self {
        Self {
            connect_on_poll: None,
            ..Self::up_after(0)
        }
    }

    pub fn already_up() -> Self {
        Self {
            started: true,
            ..Self::up_after(0)
        }
    }
}

impl WifiLink for MockLink {
    fn begin(&mut self, _ssid: &str, _password: &str) {
        self.started = true;
        self.begin_calls += 1;
        self.polls.store(0, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        if !self.started {
            return false;
        }
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        self.connect_on_poll.is_some_and(|needed| polls >= needed)
    }

    fn disconnect(&mut self) {
        self.started = false;
    }

    fn info(&self) -> LinkInfo {
        LinkInfo {
            rssi: -61,
            channel: 6,
            bssid: "AA:BB:CC:DD:EE:FF".to_string(),
            local_ip: "192.168.1.42".to_string(),
            mac_address: "24:0A:C4:00:11:22".to_string(),
        }
    }
}

pub struct FixedSensor {
    pub temperature_c: f32,
    pub humidity: f32,
    pub reads: usize,
}

impl FixedSensor {
    pub fn new(temperature_c: f32, humidity: f32) -> Self {
        Self {
            temperature_c,
            humidity,
            reads: 0,
        }
    }
}

impl Sensor for FixedSensor {
    fn read(&mut self) -> (f32, f32) {
        self.reads += 1;
        (self.temperature_c, self.humidity)
    }
}

pub struct FixedPower(pub u8);

impl PowerSource for FixedPower {
    fn sample(&mut self) -> u8 {
        self.0
    }
}
