use std::{
    fs::{self, File},
    io::{ErrorKind, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc as std_mpsc, Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, Incoming, MqttOptions, QoS};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use envnode_common::{
    BlinkTimer, CloudClient, CloudSession, FirmwareInstaller, InboundMessage, InstallerError,
    LinkInfo, LinkMonitor, LoopControl, MqttTransport, NetworkSession, NodeConfig, OtaDriver,
    Sensor, SessionOrchestrator, StatusFlags, StatusIndicator, SyntheticPower, TelemetryProducer,
    WifiLink,
};

type HostClient = CloudClient<RumqttTransport, FileInstaller>;

const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("ENVNODE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"));
    let mut config = load_config(&data_dir.join("envnode.json"))
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load node config: {err:#}");
            NodeConfig::default()
        });
    apply_env_overrides(&mut config);
    config.sanitize();
    config.validate().context("invalid node configuration")?;

    info!(
        "{} {} starting ({})",
        config.firmware.title, config.firmware.version, config.firmware.device_type
    );

    let network = NetworkSession::new(SimulatedLink::default(), config.wifi.clone());
    let link = network.monitor();
    let network = Arc::new(std::sync::Mutex::new(network));

    let transport = RumqttTransport::new(config.inbound_buffer_size());
    let installer = FileInstaller::new(data_dir.join("firmware"));
    let client: Arc<Mutex<HostClient>> = Arc::new(Mutex::new(CloudClient::new(
        CloudSession::new(transport, config.cloud.max_message_size),
        OtaDriver::new(installer, config.firmware.clone(), config.cloud.request_timeout_ms),
    )));

    let flags = Arc::new(StatusFlags::new());
    let orchestrator = SessionOrchestrator::new(&config, flags.clone());
    let producer = TelemetryProducer::new(SimulatedSensor::default(), SyntheticPower::new());
    let (restart_tx, mut restart_rx) = mpsc::channel::<()>(1);

    let intervals = &config.intervals;
    spawn_reconnect_loop(network, intervals.reconnect_ms);
    spawn_orchestrate_loop(client.clone(), orchestrator, link.clone(), intervals.orchestrate_ms);
    spawn_blink_loop(intervals.blink_ms, intervals.blink_poll_ms);
    spawn_pump_loop(client.clone(), flags, restart_tx, intervals.pump_ms);
    spawn_telemetry_loop(client, producer, link, intervals.telemetry_ms);

    info!("node activities started");

    if restart_rx.recv().await.is_some() {
        tokio::time::sleep(Duration::from_millis(config.firmware.restart_grace_ms)).await;
        info!("restarting into the new firmware image");
    }
    Ok(())
}

async fn load_config(path: &Path) -> anyhow::Result<NodeConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice::<NodeConfig>(&raw)
            .with_context(|| format!("malformed config at {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(NodeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn apply_env_overrides(config: &mut NodeConfig) {
    if let Ok(ssid) = std::env::var("WIFI_SSID") {
        config.wifi.ssid = ssid;
    }
    if let Ok(password) = std::env::var("WIFI_PASSWORD") {
        config.wifi.password = password;
    }
    if let Ok(server) = std::env::var("TB_SERVER") {
        config.cloud.server = server;
    }
    if let Some(port) = std::env::var("TB_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        config.cloud.port = port;
    }
    if let Ok(token) = std::env::var("TB_TOKEN") {
        config.cloud.token = token;
    }
}

fn spawn_reconnect_loop(
    network: Arc<std::sync::Mutex<NetworkSession<SimulatedLink>>>,
    period_ms: u64,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms));

        loop {
            interval.tick().await;
            let network = network.clone();
            let attempt = tokio::task::spawn_blocking(move || {
                network
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .ensure_connected(monotonic_ms())
            })
            .await;

            match attempt {
                Ok(true) => {}
                Ok(false) => warn!("network unavailable, retrying in {period_ms} ms"),
                Err(err) => warn!("network reconnect task failed: {err}"),
            }
        }
    });
}

fn spawn_orchestrate_loop(
    client: Arc<Mutex<HostClient>>,
    mut orchestrator: SessionOrchestrator,
    link: LinkMonitor,
    period_ms: u64,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms));

        loop {
            interval.tick().await;
            let mut client = client.lock().await;
            let info = link.info();
            // Connecting waits for the broker's acknowledgement.
            let outcome = tokio::task::block_in_place(|| {
                orchestrator.tick(&mut *client, link.is_up(), &info.mac_address, monotonic_ms())
            });
            debug!("orchestrator tick: {outcome:?}");
        }
    });
}

fn spawn_blink_loop(blink_ms: u64, poll_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(poll_ms));
        let mut timer = BlinkTimer::new(blink_ms);
        let mut led = LogIndicator;

        loop {
            interval.tick().await;
            timer.drive(&mut led, monotonic_ms());
        }
    });
}

fn spawn_pump_loop(
    client: Arc<Mutex<HostClient>>,
    flags: Arc<StatusFlags>,
    restart: mpsc::Sender<()>,
    period_ms: u64,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms));

        loop {
            interval.tick().await;
            let control = {
                let mut client = client.lock().await;
                client.pump_once(&flags, monotonic_ms())
            };

            if control == LoopControl::Restart {
                if let Err(err) = restart.send(()).await {
                    warn!("restart signal lost: {err}");
                }
                break;
            }
        }
    });
}

fn spawn_telemetry_loop(
    client: Arc<Mutex<HostClient>>,
    mut producer: TelemetryProducer<SimulatedSensor, SyntheticPower>,
    link: LinkMonitor,
    period_ms: u64,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms));

        loop {
            interval.tick().await;
            let mut client = client.lock().await;
            let outcome = producer.tick(
                &mut client.session,
                &link.info(),
                monotonic_ms(),
                Some(chrono::Utc::now().timestamp_millis()),
            );
            debug!("telemetry tick: {outcome:?}");
        }
    });
}

/// MQTT transport over a rumqttc event loop running on the tokio runtime.
struct RumqttTransport {
    runtime: tokio::runtime::Handle,
    max_packet_size: usize,
    client: Option<AsyncClient>,
    event_loop: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
    inbound_tx: std_mpsc::Sender<InboundMessage>,
    inbound_rx: std_mpsc::Receiver<InboundMessage>,
}

impl RumqttTransport {
    fn new(max_packet_size: usize) -> Self {
        let (inbound_tx, inbound_rx) = std_mpsc::channel();
        Self {
            runtime: tokio::runtime::Handle::current(),
            max_packet_size,
            client: None,
            event_loop: None,
            connected: Arc::new(AtomicBool::new(false)),
            inbound_tx,
            inbound_rx,
        }
    }
}

impl MqttTransport for RumqttTransport {
    fn connect(&mut self, host: &str, port: u16, client_id: &str, username: &str) -> bool {
        self.disconnect();

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_credentials(username, "");
        options.set_keep_alive(Duration::from_secs(30));
        options.set_max_packet_size(self.max_packet_size, self.max_packet_size);

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        let (ack_tx, ack_rx) = std_mpsc::sync_channel::<bool>(1);
        let connected = self.connected.clone();
        let inbound = self.inbound_tx.clone();

        let task = self.runtime.spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        let accepted = ack.code == ConnectReturnCode::Success;
                        connected.store(accepted, Ordering::Release);
                        let _ = ack_tx.try_send(accepted);
                        if !accepted {
                            warn!("mqtt connection refused: {:?}", ack.code);
                            break;
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(message))) => {
                        let message = InboundMessage {
                            topic: message.topic,
                            payload: message.payload.to_vec(),
                        };
                        if inbound.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => {
                        connected.store(false, Ordering::Release);
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("mqtt poll error: {err}");
                        connected.store(false, Ordering::Release);
                        let _ = ack_tx.try_send(false);
                        break;
                    }
                }
            }
        });

        self.client = Some(client);
        self.event_loop = Some(task);

        match ack_rx.recv_timeout(CONNACK_TIMEOUT) {
            Ok(true) => {
                info!("mqtt connected to {host}:{port}");
                true
            }
            Ok(false) => false,
            Err(_) => {
                warn!("no mqtt connack from {host}:{port} within {CONNACK_TIMEOUT:?}");
                self.disconnect();
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::Acquire)
    }

    fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.try_disconnect();
        }
        if let Some(task) = self.event_loop.take() {
            task.abort();
        }
        self.connected.store(false, Ordering::Release);
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        let Some(client) = self.client.as_ref() else {
            return false;
        };
        match client.try_publish(topic, QoS::AtMostOnce, false, payload.to_vec()) {
            Ok(()) => true,
            Err(err) => {
                warn!("mqtt publish to {topic} failed: {err}");
                false
            }
        }
    }

    fn subscribe(&mut self, topic: &str) -> bool {
        let Some(client) = self.client.as_ref() else {
            return false;
        };
        match client.try_subscribe(topic, QoS::AtMostOnce) {
            Ok(()) => true,
            Err(err) => {
                warn!("mqtt subscribe to {topic} failed: {err}");
                false
            }
        }
    }

    fn unsubscribe(&mut self, topic: &str) -> bool {
        let Some(client) = self.client.as_ref() else {
            return false;
        };
        client.try_unsubscribe(topic).is_ok()
    }

    fn poll(&mut self) -> Option<InboundMessage> {
        self.inbound_rx.try_recv().ok()
    }
}

/// Writes the downloaded image next to the other node data.
struct FileInstaller {
    dir: PathBuf,
    file: Option<File>,
    total_size: usize,
}

impl FileInstaller {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            file: None,
            total_size: 0,
        }
    }

    fn partial_path(&self) -> PathBuf {
        self.dir.join("firmware.bin.part")
    }
}

impl FirmwareInstaller for FileInstaller {
    fn begin(&mut self, total_size: usize) -> Result<(), InstallerError> {
        fs::create_dir_all(&self.dir)
            .map_err(|err| InstallerError::Unavailable(err.to_string()))?;
        let file = File::create(self.partial_path())
            .map_err(|err| InstallerError::Unavailable(err.to_string()))?;
        self.file = Some(file);
        self.total_size = total_size;
        Ok(())
    }

    fn write(&mut self, offset: usize, chunk: &[u8]) -> Result<(), InstallerError> {
        let end = offset.saturating_add(chunk.len());
        if end > self.total_size {
            return Err(InstallerError::TooLarge(end));
        }
        let file = self.file.as_mut().ok_or(InstallerError::NotStarted)?;

        file.seek(SeekFrom::Start(offset as u64))
            .and_then(|_| file.write_all(chunk))
            .map_err(|err| InstallerError::Write {
                offset,
                len: chunk.len(),
                reason: err.to_string(),
            })
    }

    fn finalize(&mut self) -> Result<(), InstallerError> {
        let file = self.file.take().ok_or(InstallerError::NotStarted)?;
        file.sync_all()
            .map_err(|err| InstallerError::Finalize(err.to_string()))?;
        drop(file);

        let image = self.dir.join("firmware.bin");
        fs::rename(self.partial_path(), &image)
            .map_err(|err| InstallerError::Finalize(err.to_string()))?;
        info!("firmware image stored at {}", image.display());
        Ok(())
    }

    fn abort(&mut self) {
        self.file = None;
        if let Err(err) = fs::remove_file(self.partial_path()) {
            if err.kind() != ErrorKind::NotFound {
                warn!("failed to remove partial firmware image: {err}");
            }
        }
    }
}

/// Station that associates as soon as it is asked to.
#[derive(Default)]
struct SimulatedLink {
    ssid: Option<String>,
}

impl WifiLink for SimulatedLink {
    fn begin(&mut self, ssid: &str, _password: &str) {
        self.ssid = Some(ssid.to_string());
    }

    fn is_connected(&self) -> bool {
        self.ssid.is_some()
    }

    fn disconnect(&mut self) {
        self.ssid = None;
    }

    fn info(&self) -> LinkInfo {
        LinkInfo {
            rssi: -55,
            channel: 6,
            bssid: "02:00:00:00:00:00".to_string(),
            local_ip: "127.0.0.1".to_string(),
            mac_address: "02:00:00:00:00:01".to_string(),
        }
    }
}

#[derive(Default)]
struct SimulatedSensor {
    tick: u64,
}

impl Sensor for SimulatedSensor {
    fn read(&mut self) -> (f32, f32) {
        self.tick = self.tick.saturating_add(1);

        // The ESP build reads a DHT20 over I2C instead.
        let temperature_c = 21.0 + ((self.tick % 8) as f32 * 0.2);
        let humidity = 42.0 + ((self.tick % 6) as f32 * 0.5);
        (temperature_c, humidity)
    }
}

struct LogIndicator;

impl StatusIndicator for LogIndicator {
    fn set(&mut self, on: bool) {
        debug!("status led {}", if on { "on" } else { "off" });
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
