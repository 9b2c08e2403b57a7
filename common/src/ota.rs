//! Over-the-air firmware replacement driven by shared attributes.
//!
//! The server announces an image through the `fw_*` shared attributes. The
//! driver downloads it chunk by chunk over `v2/fw/request/{req}/chunk/{n}`,
//! hands every chunk to a [`FirmwareInstaller`], verifies the announced
//! digest and finally asks the runtime for a restart through
//! [`LoopControl::Restart`]. Progress is reported as `fw_state` telemetry.

use std::sync::mpsc::{self, Receiver, Sender};

use log::{debug, info, warn};
use serde_json::{json, Value};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::{
    attributes::{AttributeMap, SharedKeys, SubscriptionId},
    cloud::CloudSession,
    config::FirmwareConfig,
    error::{InstallerError, OtaFailure},
    status::{Latch, StatusFlags},
    topics::{
        firmware_chunk_request_topic, parse_firmware_chunk_response, KEY_CURRENT_FW_TITLE,
        KEY_CURRENT_FW_VERSION, KEY_FW_CHECKSUM, KEY_FW_CHECKSUM_ALGORITHM, KEY_FW_ERROR,
        KEY_FW_SIZE, KEY_FW_STATE, KEY_FW_TITLE, KEY_FW_VERSION,
        TOPIC_FIRMWARE_RESPONSE_SUBSCRIBE,
    },
    transport::{InboundMessage, MqttTransport},
    types::{FirmwareState, LoopControl},
};

pub const OTA_KEYS: SharedKeys<5> = SharedKeys::new([
    KEY_FW_TITLE,
    KEY_FW_VERSION,
    KEY_FW_SIZE,
    KEY_FW_CHECKSUM,
    KEY_FW_CHECKSUM_ALGORITHM,
]);

/// Sink for the downloaded image, typically the inactive flash partition.
pub trait FirmwareInstaller {
    /// Prepares to receive an image of `total_size` bytes, discarding any
    /// partial image from an earlier attempt.
    fn begin(&mut self, total_size: usize) -> Result<(), InstallerError>;
    fn write(&mut self, offset: usize, chunk: &[u8]) -> Result<(), InstallerError>;
    /// Marks the written image bootable.
    fn finalize(&mut self) -> Result<(), InstallerError>;
    fn abort(&mut self);
}

pub struct OtaCallbacks {
    pub on_start: Box<dyn FnMut() + Send>,
    pub on_progress: Box<dyn FnMut(usize, usize) + Send>,
    pub on_finish: Box<dyn FnMut(bool) + Send>,
}

impl Default for OtaCallbacks {
    fn default() -> Self {
        Self {
            on_start: Box::new(|| info!("firmware update started")),
            on_progress: Box::new(|current, total| {
                info!("firmware download: {current}/{total} bytes")
            }),
            on_finish: Box::new(|success| {
                if success {
                    info!("firmware update finished, restarting");
                } else {
                    warn!("firmware update failed");
                }
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareOffer {
    pub title: String,
    pub version: String,
    pub size: usize,
    pub checksum: Option<String>,
    pub checksum_algorithm: Option<String>,
}

impl FirmwareOffer {
    /// Builds an offer once title, version and size are all known.
    pub fn from_attributes(values: &AttributeMap) -> Option<Self> {
        let title = text(values.get(KEY_FW_TITLE)?)?;
        let version = text(values.get(KEY_FW_VERSION)?)?;
        let size = match values.get(KEY_FW_SIZE)? {
            Value::Number(number) => usize::try_from(number.as_u64()?).ok()?,
            Value::String(raw) => raw.trim().parse().ok()?,
            _ => return None,
        };

        Some(Self {
            title,
            version,
            size,
            checksum: values.get(KEY_FW_CHECKSUM).and_then(text),
            checksum_algorithm: values.get(KEY_FW_CHECKSUM_ALGORITHM).and_then(text),
        })
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) if !raw.is_empty() => Some(raw.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaState {
    Idle,
    InfoSent,
    SubscriptionActive,
    Updating,
    Success,
    Failed,
}

enum ImageHasher {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl ImageHasher {
    fn for_algorithm(algorithm: &str) -> Option<Self> {
        match algorithm.to_ascii_uppercase().as_str() {
            "SHA256" | "SHA-256" => Some(Self::Sha256(Sha256::new())),
            "SHA384" | "SHA-384" => Some(Self::Sha384(Sha384::new())),
            "SHA512" | "SHA-512" => Some(Self::Sha512(Sha512::new())),
            _ => None,
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(hasher) => hasher.update(bytes),
            Self::Sha384(hasher) => hasher.update(bytes),
            Self::Sha512(hasher) => hasher.update(bytes),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Sha256(hasher) => Digest::reset(hasher),
            Self::Sha384(hasher) => Digest::reset(hasher),
            Self::Sha512(hasher) => Digest::reset(hasher),
        }
    }

    fn finish_hex(&mut self) -> String {
        match self {
            Self::Sha256(hasher) => to_hex(&hasher.finalize_reset()),
            Self::Sha384(hasher) => to_hex(&hasher.finalize_reset()),
            Self::Sha512(hasher) => to_hex(&hasher.finalize_reset()),
        }
    }
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

struct OtaSession {
    title: String,
    version: String,
    total_bytes: usize,
    bytes_received: usize,
    chunk_index: u32,
    retries_remaining: u8,
    request_id: u32,
    hasher: Option<ImageHasher>,
    checksum: Option<String>,
    chunk_deadline_ms: u64,
    last_percent: Option<u8>,
}

impl OtaSession {
    fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        let percent = self.bytes_received.saturating_mul(100) / self.total_bytes;
        percent.min(100) as u8
    }
}

pub struct OtaDriver<I> {
    installer: I,
    config: FirmwareConfig,
    request_timeout_ms: u64,
    callbacks: OtaCallbacks,
    state: OtaState,
    offers_tx: Sender<AttributeMap>,
    offers_rx: Receiver<AttributeMap>,
    offer: AttributeMap,
    subscription: Option<SubscriptionId>,
    download: Option<OtaSession>,
    next_request_id: u32,
    restart_reported: bool,
}

impl<I: FirmwareInstaller> OtaDriver<I> {
    pub fn new(installer: I, config: FirmwareConfig, request_timeout_ms: u64) -> Self {
        let (offers_tx, offers_rx) = mpsc::channel();
        Self {
            installer,
            config,
            request_timeout_ms,
            callbacks: OtaCallbacks::default(),
            state: OtaState::Idle,
            offers_tx,
            offers_rx,
            offer: AttributeMap::new(),
            subscription: None,
            download: None,
            next_request_id: 0,
            restart_reported: false,
        }
    }

    pub fn with_callbacks(mut self, callbacks: OtaCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    pub fn installer(&self) -> &I {
        &self.installer
    }

    /// Announces the running image and registers for firmware offers. Each
    /// half latches independently, so a call after both succeeded makes no
    /// transport calls.
    pub fn ensure_update_ready<T: MqttTransport>(
        &mut self,
        session: &mut CloudSession<T>,
        flags: &StatusFlags,
        now_ms: u64,
    ) -> bool {
        if !flags.is_set(Latch::FirmwareInfoSent) {
            let info = json!({
                KEY_CURRENT_FW_TITLE: self.config.title,
                KEY_CURRENT_FW_VERSION: self.config.version,
            });
            if !session.publish_telemetry(&info) {
                return false;
            }
            flags.latch(Latch::FirmwareInfoSent);
            if self.state == OtaState::Idle {
                self.state = OtaState::InfoSent;
            }
        }

        if flags.is_set(Latch::FirmwareUpdateSubscribed) {
            return true;
        }

        if self.subscription.is_none() {
            let offers = self.offers_tx.clone();
            let id = session.subscribe_shared(
                OTA_KEYS.as_slice(),
                Box::new(move |values| {
                    let _ = offers.send(values.clone());
                }),
            );
            match id {
                Some(id) => self.subscription = Some(id),
                None => return false,
            }
        }

        let offers = self.offers_tx.clone();
        let requested = session.request_shared(
            OTA_KEYS.as_slice(),
            self.request_timeout_ms,
            now_ms,
            Box::new(move |values| {
                let _ = offers.send(values.clone());
            }),
            Box::new(|| warn!("firmware attribute request timed out")),
        );
        if !requested {
            return false;
        }

        flags.latch(Latch::FirmwareUpdateSubscribed);
        if self.state != OtaState::Updating {
            self.state = OtaState::SubscriptionActive;
        }
        true
    }

    /// Consumes firmware chunk responses; `false` for any other topic.
    pub fn handle_message<T: MqttTransport>(
        &mut self,
        session: &mut CloudSession<T>,
        flags: &StatusFlags,
        message: &InboundMessage,
        now_ms: u64,
    ) -> bool {
        let Some((request_id, chunk)) = parse_firmware_chunk_response(&message.topic) else {
            return false;
        };

        let Some(download) = self.download.as_ref() else {
            debug!("ignoring firmware chunk {chunk} with no update in progress");
            return true;
        };
        if request_id != download.request_id || chunk != download.chunk_index {
            debug!("ignoring stale firmware chunk {request_id}/{chunk}");
            return true;
        }

        let offset = download.bytes_received;
        let applied = if message.payload.is_empty() {
            Err(InstallerError::Write {
                offset,
                len: 0,
                reason: "empty chunk".to_string(),
            })
        } else {
            self.installer.write(offset, &message.payload)
        };

        match applied {
            Ok(()) => self.chunk_applied(session, flags, &message.payload, now_ms),
            Err(err) => {
                warn!("firmware chunk {chunk} rejected: {err}");
                self.consume_retry(session, flags, OtaFailure::RetriesExhausted { chunk }, now_ms);
            }
        }
        true
    }

    /// Evaluates pending offers and chunk deadlines.
    pub fn poll<T: MqttTransport>(
        &mut self,
        session: &mut CloudSession<T>,
        flags: &StatusFlags,
        now_ms: u64,
    ) -> LoopControl {
        if self.state == OtaState::Success {
            if self.restart_reported {
                return LoopControl::Continue;
            }
            self.restart_reported = true;
            return LoopControl::Restart;
        }

        let mut changed = false;
        while let Ok(values) = self.offers_rx.try_recv() {
            self.offer.extend(values);
            changed = true;
        }
        if changed && self.download.is_none() {
            self.evaluate_offer(session, flags, now_ms);
        }

        let timed_out = self
            .download
            .as_ref()
            .filter(|download| now_ms >= download.chunk_deadline_ms)
            .map(|download| download.chunk_index);
        if let Some(chunk) = timed_out {
            warn!("firmware chunk {chunk} timed out");
            self.consume_retry(session, flags, OtaFailure::RetriesExhausted { chunk }, now_ms);
        }

        if self.state == OtaState::Success {
            self.restart_reported = true;
            return LoopControl::Restart;
        }
        LoopControl::Continue
    }

    fn evaluate_offer<T: MqttTransport>(
        &mut self,
        session: &mut CloudSession<T>,
        flags: &StatusFlags,
        now_ms: u64,
    ) {
        let Some(offer) = FirmwareOffer::from_attributes(&self.offer) else {
            debug!("firmware offer incomplete, waiting for more attributes");
            return;
        };

        if offer.title != self.config.title {
            let failure = OtaFailure::TitleMismatch {
                running: self.config.title.clone(),
                offered: offer.title,
            };
            warn!("{failure}");
            self.report_failure(session, &failure);
            self.offer.clear();
            return;
        }

        if offer.version == self.config.version {
            info!("firmware {} {} is already running", offer.title, offer.version);
            self.report_state(session, FirmwareState::Updated);
            return;
        }

        if offer.size == 0 {
            warn!("firmware offer {} has no size, ignoring", offer.version);
            return;
        }

        self.start(session, flags, offer, now_ms);
    }

    fn start<T: MqttTransport>(
        &mut self,
        session: &mut CloudSession<T>,
        flags: &StatusFlags,
        offer: FirmwareOffer,
        now_ms: u64,
    ) {
        info!(
            "firmware {} {} offered ({} bytes), running {}",
            offer.title, offer.version, offer.size, self.config.version
        );

        if let Err(err) = self.installer.begin(offer.size) {
            self.fail(session, flags, OtaFailure::Begin(err));
            return;
        }
        if !session.subscribe_topic(TOPIC_FIRMWARE_RESPONSE_SUBSCRIBE) {
            self.installer.abort();
            self.fail(session, flags, OtaFailure::Subscribe);
            return;
        }

        let hasher = match (&offer.checksum, &offer.checksum_algorithm) {
            (Some(_), Some(algorithm)) => {
                let hasher = ImageHasher::for_algorithm(algorithm);
                if hasher.is_none() {
                    warn!("checksum algorithm {algorithm} unsupported, image will not be verified");
                }
                hasher
            }
            _ => None,
        };

        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.download = Some(OtaSession {
            title: offer.title,
            version: offer.version,
            total_bytes: offer.size,
            bytes_received: 0,
            chunk_index: 0,
            retries_remaining: self.config.failure_retries,
            request_id: self.next_request_id,
            hasher,
            checksum: offer.checksum,
            chunk_deadline_ms: now_ms,
            last_percent: None,
        });
        self.state = OtaState::Updating;

        (self.callbacks.on_start)();
        self.report_state(session, FirmwareState::Downloading);
        self.request_chunk(session, now_ms);
    }

    fn request_chunk<T: MqttTransport>(&mut self, session: &mut CloudSession<T>, now_ms: u64) {
        let Some(download) = self.download.as_mut() else {
            return;
        };
        download.chunk_deadline_ms = now_ms.saturating_add(self.config.chunk_timeout_ms);

        let topic = firmware_chunk_request_topic(download.request_id, download.chunk_index);
        let size = self.config.packet_size.to_string();
        if !session.publish_raw(&topic, size.as_bytes()) {
            debug!("chunk request {topic} not sent, waiting for the deadline");
        }
    }

    fn chunk_applied<T: MqttTransport>(
        &mut self,
        session: &mut CloudSession<T>,
        flags: &StatusFlags,
        chunk: &[u8],
        now_ms: u64,
    ) {
        let Some(download) = self.download.as_mut() else {
            return;
        };
        download.bytes_received += chunk.len();
        download.chunk_index += 1;
        if let Some(hasher) = download.hasher.as_mut() {
            hasher.update(chunk);
        }

        let percent = download.percent();
        if download.last_percent.map_or(true, |last| percent > last) {
            download.last_percent = Some(percent);
            (self.callbacks.on_progress)(download.bytes_received, download.total_bytes);
        }

        if download.bytes_received >= download.total_bytes {
            self.complete(session, flags, now_ms);
        } else {
            self.request_chunk(session, now_ms);
        }
    }

    fn complete<T: MqttTransport>(
        &mut self,
        session: &mut CloudSession<T>,
        flags: &StatusFlags,
        now_ms: u64,
    ) {
        self.report_state(session, FirmwareState::Downloaded);

        let Some(download) = self.download.as_mut() else {
            return;
        };
        if let (Some(hasher), Some(expected)) = (download.hasher.as_mut(), &download.checksum) {
            let actual = hasher.finish_hex();
            if !actual.eq_ignore_ascii_case(expected) {
                let failure = OtaFailure::Checksum {
                    expected: expected.clone(),
                    actual,
                };
                warn!("{failure}, downloading again");
                self.restart_download(session, flags, failure, now_ms);
                return;
            }
        }

        self.report_state(session, FirmwareState::Verified);
        self.report_state(session, FirmwareState::Updating);

        if let Err(err) = self.installer.finalize() {
            self.fail(session, flags, OtaFailure::Finalize(err));
            return;
        }

        if let Some(download) = self.download.take() {
            info!("firmware {} {} installed", download.title, download.version);
        }
        session.unsubscribe_topic(TOPIC_FIRMWARE_RESPONSE_SUBSCRIBE);
        self.state = OtaState::Success;
        (self.callbacks.on_finish)(true);
    }

    fn restart_download<T: MqttTransport>(
        &mut self,
        session: &mut CloudSession<T>,
        flags: &StatusFlags,
        failure: OtaFailure,
        now_ms: u64,
    ) {
        let Some(download) = self.download.as_mut() else {
            return;
        };
        download.retries_remaining = download.retries_remaining.saturating_sub(1);
        if download.retries_remaining == 0 {
            self.fail(session, flags, failure);
            return;
        }

        let total = download.total_bytes;
        download.bytes_received = 0;
        download.chunk_index = 0;
        if let Some(hasher) = download.hasher.as_mut() {
            hasher.reset();
        }

        if let Err(err) = self.installer.begin(total) {
            self.fail(session, flags, OtaFailure::Begin(err));
            return;
        }
        self.report_state(session, FirmwareState::Downloading);
        self.request_chunk(session, now_ms);
    }

    fn consume_retry<T: MqttTransport>(
        &mut self,
        session: &mut CloudSession<T>,
        flags: &StatusFlags,
        failure: OtaFailure,
        now_ms: u64,
    ) {
        let Some(download) = self.download.as_mut() else {
            return;
        };
        download.retries_remaining = download.retries_remaining.saturating_sub(1);
        if download.retries_remaining == 0 {
            self.fail(session, flags, failure);
        } else {
            debug!(
                "re-requesting firmware chunk {}, {} retries left",
                download.chunk_index, download.retries_remaining
            );
            self.request_chunk(session, now_ms);
        }
    }

    fn fail<T: MqttTransport>(
        &mut self,
        session: &mut CloudSession<T>,
        flags: &StatusFlags,
        failure: OtaFailure,
    ) {
        warn!("firmware update failed: {failure}");
        if self.download.take().is_some() {
            self.installer.abort();
        }
        self.report_failure(session, &failure);

        self.offer.clear();
        while self.offers_rx.try_recv().is_ok() {}
        if let Some(id) = self.subscription.take() {
            session.unsubscribe_shared(id);
        }
        session.unsubscribe_topic(TOPIC_FIRMWARE_RESPONSE_SUBSCRIBE);
        flags.clear(Latch::FirmwareUpdateSubscribed);

        self.state = OtaState::Failed;
        (self.callbacks.on_finish)(false);
    }

    fn report_state<T: MqttTransport>(&self, session: &mut CloudSession<T>, state: FirmwareState) {
        if !session.publish_telemetry(&json!({ KEY_FW_STATE: state.as_str() })) {
            debug!("could not report fw_state {}", state.as_str());
        }
    }

    fn report_failure<T: MqttTransport>(&self, session: &mut CloudSession<T>, failure: &OtaFailure) {
        let report = json!({
            KEY_FW_STATE: FirmwareState::Failed.as_str(),
            KEY_FW_ERROR: failure.to_string(),
        });
        if !session.publish_telemetry(&report) {
            debug!("could not report firmware failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        cloud::CloudClient,
        testing::{message, BrokerLog, InstallLog, MockInstaller, MockTransport},
        topics::{TOPIC_ATTRIBUTES, TOPIC_TELEMETRY},
    };

    const CHUNK: usize = 1024;

    fn image(chunks: usize) -> Vec<u8> {
        (0..chunks * CHUNK).map(|index| (index % 251) as u8).collect()
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        to_hex(&Sha256::digest(bytes))
    }

    fn firmware_config(retries: u8) -> FirmwareConfig {
        FirmwareConfig {
            failure_retries: retries,
            packet_size: CHUNK as u16,
            chunk_timeout_ms: 5_000,
            ..FirmwareConfig::default()
        }
    }

    /// Broker that serves `image` in `CHUNK`-sized pieces.
    fn serving(image: Vec<u8>) -> (MockTransport, Arc<Mutex<BrokerLog>>) {
        serving_in(image, CHUNK)
    }

    fn serving_in(image: Vec<u8>, chunk_size: usize) -> (MockTransport, Arc<Mutex<BrokerLog>>) {
        let (transport, broker) = MockTransport::connected();
        let transport = transport.with_responder(move |topic, _payload| {
            let Some(rest) = topic.strip_prefix("v2/fw/request/") else {
                return Vec::new();
            };
            let Some((request, chunk)) = rest.split_once("/chunk/") else {
                return Vec::new();
            };
            let index: usize = chunk.parse().unwrap();
            let start = (index * chunk_size).min(image.len());
            let end = (start + chunk_size).min(image.len());
            vec![message(
                &format!("v2/fw/response/{request}/chunk/{index}"),
                image[start..end].to_vec(),
            )]
        });
        (transport, broker)
    }

    struct Harness {
        client: CloudClient<MockTransport, MockInstaller>,
        broker: Arc<Mutex<BrokerLog>>,
        installs: Arc<Mutex<InstallLog>>,
        flags: StatusFlags,
        progress: Arc<Mutex<Vec<(usize, usize)>>>,
        finished: Arc<Mutex<Vec<bool>>>,
    }

    impl Harness {
        fn new(
            transport: (MockTransport, Arc<Mutex<BrokerLog>>),
            installer: (MockInstaller, Arc<Mutex<InstallLog>>),
            config: FirmwareConfig,
        ) -> Self {
            let (transport, broker) = transport;
            let (installer, installs) = installer;
            let progress = Arc::new(Mutex::new(Vec::new()));
            let finished = Arc::new(Mutex::new(Vec::new()));
            let progress_sink = progress.clone();
            let finished_sink = finished.clone();

            let ota = OtaDriver::new(installer, config, 10_000).with_callbacks(OtaCallbacks {
                on_start: Box::new(|| {}),
                on_progress: Box::new(move |current, total| {
                    progress_sink.lock().unwrap().push((current, total))
                }),
                on_finish: Box::new(move |success| finished_sink.lock().unwrap().push(success)),
            });
            let mut session = CloudSession::new(transport, 512);
            assert!(session.connect("broker", "token", 1883, "node"));

            Self {
                client: CloudClient::new(session, ota),
                broker,
                installs,
                flags: StatusFlags::new(),
                progress,
                finished,
            }
        }

        fn offer(&mut self, payload: Value) {
            assert!(self
                .client
                .ota
                .ensure_update_ready(&mut self.client.session, &self.flags, 0));
            self.broker
                .lock()
                .unwrap()
                .inbound
                .push_back(message(TOPIC_ATTRIBUTES, payload.to_string()));
        }

        fn pump_until_quiet(&mut self, now_ms: u64) -> Vec<LoopControl> {
            let mut controls = Vec::new();
            for _ in 0..64 {
                controls.push(self.client.pump_once(&self.flags, now_ms));
                let idle = self.broker.lock().unwrap().inbound.is_empty();
                if idle && self.client.ota.state() != OtaState::Updating {
                    controls.push(self.client.pump_once(&self.flags, now_ms));
                    break;
                }
            }
            controls
        }

        fn fw_states(&self) -> Vec<String> {
            self.broker
                .lock()
                .unwrap()
                .published_json(TOPIC_TELEMETRY)
                .iter()
                .filter_map(|values| values.get(KEY_FW_STATE))
                .filter_map(|state| state.as_str().map(str::to_string))
                .collect()
        }
    }

    fn offer_for(image: &[u8], version: &str) -> Value {
        json!({
            "fw_title": "OTA test",
            "fw_version": version,
            "fw_size": image.len(),
            "fw_checksum": sha256_hex(image),
            "fw_checksum_algorithm": "SHA256",
        })
    }

    #[test]
    fn parses_offers_with_string_sizes() {
        let mut values = AttributeMap::new();
        values.insert("fw_title".into(), json!("OTA test"));
        values.insert("fw_version".into(), json!(2.1));
        assert_eq!(FirmwareOffer::from_attributes(&values), None);

        values.insert("fw_size".into(), json!("4096"));
        let offer = FirmwareOffer::from_attributes(&values).unwrap();
        assert_eq!(offer.version, "2.1");
        assert_eq!(offer.size, 4096);
        assert_eq!(offer.checksum, None);
    }

    #[test]
    fn ready_latches_and_then_stays_quiet() {
        let mut harness = Harness::new(
            MockTransport::connected(),
            MockInstaller::new(),
            firmware_config(5),
        );

        assert!(harness
            .client
            .ota
            .ensure_update_ready(&mut harness.client.session, &harness.flags, 0));
        assert_eq!(harness.client.ota.state(), OtaState::SubscriptionActive);
        let calls = harness.broker.lock().unwrap().calls;

        assert!(harness
            .client
            .ota
            .ensure_update_ready(&mut harness.client.session, &harness.flags, 10));
        assert_eq!(harness.broker.lock().unwrap().calls, calls);

        let info = harness.broker.lock().unwrap().published_json(TOPIC_TELEMETRY);
        assert_eq!(
            info,
            vec![json!({ "current_fw_title": "OTA test", "current_fw_version": "2.0" })]
        );
    }

    #[test]
    fn downloads_verifies_and_requests_one_restart() {
        let firmware = image(10);
        let mut harness = Harness::new(
            serving(firmware.clone()),
            MockInstaller::new(),
            firmware_config(5),
        );
        harness.offer(offer_for(&firmware, "2.1"));

        let controls = harness.pump_until_quiet(100);

        assert_eq!(
            controls.iter().filter(|control| **control == LoopControl::Restart).count(),
            1
        );
        assert_eq!(harness.client.ota.state(), OtaState::Success);
        assert!(harness.client.session.is_halted());
        assert_eq!(harness.installs.lock().unwrap().image, firmware);
        assert_eq!(harness.installs.lock().unwrap().finalized, 1);
        assert_eq!(*harness.finished.lock().unwrap(), vec![true]);
        assert_eq!(
            harness.fw_states(),
            vec!["DOWNLOADING", "DOWNLOADED", "VERIFIED", "UPDATING"]
        );
    }

    #[test]
    fn progress_is_monotonic_and_reported_once_per_step() {
        let firmware = image(10);
        let installer = MockInstaller::new();
        let installer = (installer.0.fail_once_at(6 * CHUNK), installer.1);
        let mut harness = Harness::new(serving(firmware.clone()), installer, firmware_config(5));
        harness.offer(offer_for(&firmware, "2.1"));

        harness.pump_until_quiet(100);

        let progress = harness.progress.lock().unwrap();
        assert_eq!(progress.len(), 10);
        assert!(progress.windows(2).all(|pair| pair[0].0 < pair[1].0));
        assert_eq!(progress.last(), Some(&(10 * CHUNK, 10 * CHUNK)));
        assert_eq!(harness.installs.lock().unwrap().write_attempts, 11);
    }

    #[test]
    fn progress_is_reported_once_per_percent_across_a_second_download() {
        const SMALL_CHUNK: usize = 256;
        let firmware: Vec<u8> = (0..250 * SMALL_CHUNK + 17)
            .map(|index| (index % 241) as u8)
            .collect();
        let total = firmware.len();
        let mut offer = offer_for(&firmware, "2.1");
        offer["fw_checksum"] = json!("00");
        let config = FirmwareConfig {
            packet_size: SMALL_CHUNK as u16,
            ..firmware_config(2)
        };
        let mut harness = Harness::new(
            serving_in(firmware, SMALL_CHUNK),
            MockInstaller::new(),
            config,
        );
        harness.offer(offer);

        harness.pump_until_quiet(100);

        assert_eq!(harness.client.ota.state(), OtaState::Failed);
        assert_eq!(harness.installs.lock().unwrap().begun.len(), 2);
        assert_eq!(harness.installs.lock().unwrap().write_attempts, 2 * 251);

        let progress = harness.progress.lock().unwrap();
        let percents: Vec<usize> = progress
            .iter()
            .map(|(current, total)| current * 100 / total)
            .collect();
        assert_eq!(percents.len(), 101);
        assert!(percents.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(percents.first(), Some(&0));
        assert_eq!(progress.last(), Some(&(total, total)));
    }

    #[test]
    fn always_failing_installer_exhausts_the_budget() {
        let firmware = image(4);
        let mut harness = Harness::new(
            serving(firmware.clone()),
            MockInstaller::failing(),
            firmware_config(3),
        );
        harness.offer(offer_for(&firmware, "2.1"));

        let controls = harness.pump_until_quiet(100);

        assert!(controls.iter().all(|control| *control == LoopControl::Continue));
        assert_eq!(harness.installs.lock().unwrap().write_attempts, 3);
        assert_eq!(harness.installs.lock().unwrap().aborted, 1);
        assert_eq!(harness.client.ota.state(), OtaState::Failed);
        assert_eq!(*harness.finished.lock().unwrap(), vec![false]);
        assert!(!harness.flags.is_set(Latch::FirmwareUpdateSubscribed));
        assert!(harness.progress.lock().unwrap().is_empty());
        assert_eq!(harness.fw_states().last().map(String::as_str), Some("FAILED"));
    }

    #[test]
    fn missing_chunks_time_out_against_the_budget() {
        let firmware = image(2);
        let mut harness = Harness::new(
            MockTransport::connected(),
            MockInstaller::new(),
            firmware_config(2),
        );
        harness.offer(offer_for(&firmware, "2.1"));

        assert_eq!(harness.client.pump_once(&harness.flags, 0), LoopControl::Continue);
        assert_eq!(harness.client.ota.state(), OtaState::Updating);

        harness.client.pump_once(&harness.flags, 4_999);
        assert_eq!(harness.client.ota.state(), OtaState::Updating);
        harness.client.pump_once(&harness.flags, 5_000);
        harness.client.pump_once(&harness.flags, 10_000);

        assert_eq!(harness.client.ota.state(), OtaState::Failed);
        let chunk_requests = harness
            .broker
            .lock()
            .unwrap()
            .published_topics()
            .into_iter()
            .filter(|topic| topic == "v2/fw/request/1/chunk/0")
            .count();
        assert_eq!(chunk_requests, 2);
    }

    #[test]
    fn checksum_mismatch_downloads_again_then_fails() {
        let firmware = image(2);
        let mut offer = offer_for(&firmware, "2.1");
        offer["fw_checksum"] = json!(sha256_hex(b"another image"));
        let mut harness = Harness::new(serving(firmware), MockInstaller::new(), firmware_config(2));
        harness.offer(offer);

        harness.pump_until_quiet(100);

        let installs = harness.installs.lock().unwrap();
        assert_eq!(installs.begun.len(), 2);
        assert_eq!(installs.finalized, 0);
        assert_eq!(harness.client.ota.state(), OtaState::Failed);
        assert_eq!(*harness.finished.lock().unwrap(), vec![false]);
    }

    #[test]
    fn foreign_title_is_reported_and_not_installed() {
        let mut harness = Harness::new(
            MockTransport::connected(),
            MockInstaller::new(),
            firmware_config(5),
        );
        harness.offer(json!({ "fw_title": "other", "fw_version": "9.9", "fw_size": 100 }));

        harness.client.pump_once(&harness.flags, 0);

        assert!(harness.installs.lock().unwrap().begun.is_empty());
        assert_eq!(harness.fw_states(), vec!["FAILED"]);
        assert!(harness.finished.lock().unwrap().is_empty());
    }

    #[test]
    fn running_version_is_reported_as_updated() {
        let mut harness = Harness::new(
            MockTransport::connected(),
            MockInstaller::new(),
            firmware_config(5),
        );
        harness.offer(json!({ "fw_title": "OTA test", "fw_version": "2.0", "fw_size": 100 }));

        harness.client.pump_once(&harness.flags, 0);

        assert!(harness.installs.lock().unwrap().begun.is_empty());
        assert_eq!(harness.fw_states(), vec!["UPDATED"]);
        assert_eq!(harness.client.ota.state(), OtaState::SubscriptionActive);
    }
}
