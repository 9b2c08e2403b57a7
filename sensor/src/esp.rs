use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, MutexGuard, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::BLOCK,
    gpio::{AnyOutputPin, Output, OutputPin, PinDriver},
    i2c::{I2cConfig, I2cDriver},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    log::EspLogger,
    mqtt::client::{EspMqttClient, MqttClientConfiguration},
    nvs::EspDefaultNvsPartition,
    ota::EspOta,
    sys,
    wifi::EspWifi,
};
use log::{debug, info, warn};

use envnode_common::{
    dht20, BlinkTimer, CloudClient, CloudSession, FirmwareInstaller, InboundMessage,
    InstallerError, LinkInfo, LoopControl, MqttTransport, NetworkSession, NodeConfig, OtaDriver,
    Sensor, SessionOrchestrator, StatusFlags, StatusIndicator, SyntheticPower, TelemetryProducer,
    WifiLink,
};

type DeviceClient = CloudClient<EspTransport, EspInstaller>;

const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);
const I2C_BAUDRATE_HZ: u32 = 100_000;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut config = NodeConfig::default();
    config.sanitize();
    config
        .validate()
        .context("invalid build-time node configuration")?;

    info!(
        "{} {} starting ({})",
        config.firmware.title, config.firmware.version, config.firmware.device_type
    );

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals {
        modem, pins, i2c0, ..
    } = Peripherals::take()?;

    let i2c = I2cDriver::new(
        i2c0,
        pins.gpio11,
        pins.gpio12,
        &I2cConfig::new().baudrate(Hertz(I2C_BAUDRATE_HZ)),
    )
    .context("failed to initialize I2C bus")?;
    let led = PinDriver::output(pins.gpio48.downgrade_output())
        .context("failed to initialize status LED")?;

    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition)).context("wifi init failed")?;

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let network = NetworkSession::new(EspLink::new(wifi), config.wifi.clone());
    let link = network.monitor();
    let network = Arc::new(Mutex::new(network));

    let client: Arc<Mutex<DeviceClient>> = Arc::new(Mutex::new(CloudClient::new(
        CloudSession::new(
            EspTransport::new(config.inbound_buffer_size()),
            config.cloud.max_message_size,
        ),
        OtaDriver::new(
            EspInstaller::spawn()?,
            config.firmware.clone(),
            config.cloud.request_timeout_ms,
        ),
    )));
    let flags = Arc::new(StatusFlags::new());

    arm_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let intervals = config.intervals.clone();
    let (restart_tx, restart_rx) = mpsc::channel::<()>();

    {
        let network = network.clone();
        spawn_periodic("net-reconnect", 6 * 1024, intervals.reconnect_ms, move || {
            if !lock(&network).ensure_connected(monotonic_ms()) {
                warn!("network unavailable, retrying later");
            }
            true
        })?;
    }

    {
        let client = client.clone();
        let link = link.clone();
        let mut orchestrator = SessionOrchestrator::new(&config, flags.clone());
        spawn_periodic("orchestrator", 8 * 1024, intervals.orchestrate_ms, move || {
            let info = link.info();
            let outcome = orchestrator.tick(
                &mut *lock(&client),
                link.is_up(),
                &info.mac_address,
                monotonic_ms(),
            );
            debug!("orchestrator tick: {outcome:?}");
            true
        })?;
    }

    {
        let mut timer = BlinkTimer::new(intervals.blink_ms);
        let mut led = Led(led);
        spawn_periodic("status-led", 2 * 1024, intervals.blink_poll_ms, move || {
            timer.drive(&mut led, monotonic_ms());
            true
        })?;
    }

    {
        let client = client.clone();
        let flags = flags.clone();
        spawn_periodic("mqtt-pump", 8 * 1024, intervals.pump_ms, move || {
            let control = lock(&client).pump_once(&flags, monotonic_ms());
            if control == LoopControl::Restart {
                let _ = restart_tx.send(());
                return false;
            }
            true
        })?;
    }

    {
        let mut producer = TelemetryProducer::new(Dht20::new(i2c), SyntheticPower::new());
        spawn_periodic("telemetry", 6 * 1024, intervals.telemetry_ms, move || {
            let outcome = producer.tick(
                &mut lock(&client).session,
                &link.info(),
                monotonic_ms(),
                None,
            );
            debug!("telemetry tick: {outcome:?}");
            true
        })?;
    }

    loop {
        feed_watchdog();
        match restart_rx.recv_timeout(Duration::from_secs(1)) {
            Ok(()) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("message pump stopped unexpectedly"));
            }
        }
    }

    info!(
        "firmware installed; restarting in {} ms",
        config.firmware.restart_grace_ms
    );
    thread::sleep(Duration::from_millis(config.firmware.restart_grace_ms));
    restart();
    Ok(())
}

fn spawn_periodic(
    name: &str,
    stack_size: usize,
    period_ms: u64,
    mut tick: impl FnMut() -> bool + Send + 'static,
) -> anyhow::Result<()> {
    let period = Duration::from_millis(period_ms);
    thread::Builder::new()
        .name(name.to_string())
        .stack_size(stack_size)
        .spawn(move || loop {
            let started = Instant::now();
            if !tick() {
                break;
            }
            thread::sleep(period.saturating_sub(started.elapsed()));
        })
        .with_context(|| format!("failed to spawn {name} thread"))?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct EspLink {
    wifi: EspWifi<'static>,
    power_save_disabled: bool,
}

impl EspLink {
    fn new(wifi: EspWifi<'static>) -> Self {
        Self {
            wifi,
            power_save_disabled: false,
        }
    }

    fn configure(&mut self, ssid: &str, password: &str) -> anyhow::Result<()> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
                password: password
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))?;

        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        if !self.power_save_disabled {
            disable_wifi_power_save();
            self.power_save_disabled = true;
        }
        self.wifi.connect()?;
        Ok(())
    }
}

impl WifiLink for EspLink {
    fn begin(&mut self, ssid: &str, password: &str) {
        if let Err(err) = self.configure(ssid, password) {
            warn!("wifi connect request failed: {err:#}");
        }
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.wifi.sta_netif().is_up().unwrap_or(false)
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            debug!("wifi disconnect: {err:?}");
        }
    }

    fn info(&self) -> LinkInfo {
        let mut ap_info = sys::wifi_ap_record_t::default();
        let associated = unsafe { sys::esp_wifi_sta_get_ap_info(&mut ap_info) } == sys::ESP_OK;
        let netif = self.wifi.sta_netif();

        LinkInfo {
            rssi: if associated { i32::from(ap_info.rssi) } else { 0 },
            channel: if associated { ap_info.primary } else { 0 },
            bssid: if associated {
                format_mac(&ap_info.bssid)
            } else {
                String::new()
            },
            local_ip: netif
                .get_ip_info()
                .map(|ip_info| ip_info.ip.to_string())
                .unwrap_or_default(),
            mac_address: netif.get_mac().map(|mac| format_mac(&mac)).unwrap_or_default(),
        }
    }
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// esp-mqtt client; inbound publishes are queued by a receiver thread.
struct EspTransport {
    buffer_size: usize,
    client: Option<EspMqttClient<'static>>,
    connected: Arc<AtomicBool>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
}

impl EspTransport {
    fn new(buffer_size: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel();
        Self {
            buffer_size,
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            inbound_tx,
            inbound_rx,
        }
    }
}

impl MqttTransport for EspTransport {
    fn connect(&mut self, host: &str, port: u16, client_id: &str, username: &str) -> bool {
        self.disconnect();

        let url = format!("mqtt://{host}:{port}");
        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            username: Some(username),
            buffer_size: self.buffer_size,
            ..Default::default()
        };
        let (client, mut conn) = match EspMqttClient::new(&url, &conf) {
            Ok(pair) => pair,
            Err(err) => {
                warn!("mqtt client for {url} not created: {err:?}");
                return false;
            }
        };

        let (ack_tx, ack_rx) = mpsc::sync_channel::<bool>(1);
        let connected = self.connected.clone();
        let inbound = self.inbound_tx.clone();
        let spawned = thread::Builder::new()
            .name("mqtt-rx".into())
            .stack_size(8 * 1024)
            .spawn(move || {
                // Ends once the client is dropped.
                while let Ok(event) = conn.next() {
                    match event.payload() {
                        EventPayload::Connected(_) => {
                            connected.store(true, Ordering::Release);
                            let _ = ack_tx.try_send(true);
                        }
                        EventPayload::Disconnected => {
                            connected.store(false, Ordering::Release);
                        }
                        EventPayload::Received {
                            topic: Some(topic),
                            data,
                            details: Details::Complete,
                            ..
                        } => {
                            let message = InboundMessage {
                                topic: topic.to_string(),
                                payload: data.to_vec(),
                            };
                            if inbound.send(message).is_err() {
                                break;
                            }
                        }
                        EventPayload::Received { .. } => {
                            warn!("dropping fragmented mqtt message");
                        }
                        EventPayload::Error(err) => {
                            warn!("mqtt error: {err:?}");
                        }
                        _ => {}
                    }
                }
                connected.store(false, Ordering::Release);
            });
        if let Err(err) = spawned {
            warn!("failed to spawn mqtt receiver: {err}");
            return false;
        }
        self.client = Some(client);

        match ack_rx.recv_timeout(CONNACK_TIMEOUT) {
            Ok(accepted) => accepted,
            Err(_) => {
                warn!("no mqtt connack from {url} within {CONNACK_TIMEOUT:?}");
                self.disconnect();
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::Acquire)
    }

    fn disconnect(&mut self) {
        self.client = None;
        self.connected.store(false, Ordering::Release);
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        let Some(client) = self.client.as_mut() else {
            return false;
        };
        match client.enqueue(topic, QoS::AtMostOnce, false, payload) {
            Ok(_) => true,
            Err(err) => {
                warn!("mqtt publish to {topic} failed: {err:?}");
                false
            }
        }
    }

    fn subscribe(&mut self, topic: &str) -> bool {
        let Some(client) = self.client.as_mut() else {
            return false;
        };
        match client.subscribe(topic, QoS::AtMostOnce) {
            Ok(_) => true,
            Err(err) => {
                warn!("mqtt subscribe to {topic} failed: {err:?}");
                false
            }
        }
    }

    fn unsubscribe(&mut self, topic: &str) -> bool {
        self.client
            .as_mut()
            .is_some_and(|client| client.unsubscribe(topic).is_ok())
    }

    fn poll(&mut self) -> Option<InboundMessage> {
        self.inbound_rx.try_recv().ok()
    }
}

enum InstallCommand {
    Begin {
        total_size: usize,
        reply: mpsc::SyncSender<Result<(), InstallerError>>,
    },
    Write {
        offset: usize,
        chunk: Vec<u8>,
        reply: mpsc::SyncSender<Result<(), InstallerError>>,
    },
    Finalize {
        reply: mpsc::SyncSender<Result<(), InstallerError>>,
    },
    Abort,
}

/// Handle to the `ota-writer` thread, which owns the `EspOta` update for the
/// lifetime of each download.
struct EspInstaller {
    commands: mpsc::Sender<InstallCommand>,
}

impl EspInstaller {
    fn spawn() -> anyhow::Result<Self> {
        let (commands, inbox) = mpsc::channel();
        thread::Builder::new()
            .name("ota-writer".into())
            .stack_size(8 * 1024)
            .spawn(move || run_ota_writer(inbox))
            .context("failed to spawn ota-writer thread")?;
        Ok(Self { commands })
    }

    fn call(
        &self,
        command: impl FnOnce(mpsc::SyncSender<Result<(), InstallerError>>) -> InstallCommand,
    ) -> Result<(), InstallerError> {
        let stopped = || InstallerError::Unavailable("ota-writer thread stopped".to_string());
        let (reply, response) = mpsc::sync_channel(1);
        self.commands.send(command(reply)).map_err(|_| stopped())?;
        response.recv().map_err(|_| stopped())?
    }
}

impl FirmwareInstaller for EspInstaller {
    fn begin(&mut self, total_size: usize) -> Result<(), InstallerError> {
        self.call(|reply| InstallCommand::Begin { total_size, reply })
    }

    fn write(&mut self, offset: usize, chunk: &[u8]) -> Result<(), InstallerError> {
        self.call(|reply| InstallCommand::Write {
            offset,
            chunk: chunk.to_vec(),
            reply,
        })
    }

    fn finalize(&mut self) -> Result<(), InstallerError> {
        self.call(|reply| InstallCommand::Finalize { reply })
    }

    fn abort(&mut self) {
        let _ = self.commands.send(InstallCommand::Abort);
    }
}

fn run_ota_writer(inbox: mpsc::Receiver<InstallCommand>) {
    let mut ota = match EspOta::new() {
        Ok(ota) => ota,
        Err(err) => {
            warn!("OTA unavailable: {err:?}");
            for command in inbox {
                reply_to(command, Err(InstallerError::Unavailable(format!("{err:?}"))));
            }
            return;
        }
    };

    let mut next = None;
    loop {
        let command = match next.take() {
            Some(command) => command,
            None => match inbox.recv() {
                Ok(command) => command,
                Err(_) => return,
            },
        };
        let (total_size, reply) = match command {
            InstallCommand::Begin { total_size, reply } => (total_size, reply),
            other => {
                reply_to(other, Err(InstallerError::NotStarted));
                continue;
            }
        };

        let mut update = match ota.initiate_update() {
            Ok(update) => update,
            Err(err) => {
                let _ = reply.send(Err(InstallerError::Unavailable(format!(
                    "failed to initiate OTA update: {err:?}"
                ))));
                continue;
            }
        };
        let _ = reply.send(Ok(()));
        info!("OTA update initiated for {total_size} bytes");

        let mut written = 0_usize;
        loop {
            let Ok(command) = inbox.recv() else {
                return;
            };
            match command {
                InstallCommand::Write {
                    offset,
                    chunk,
                    reply,
                } => {
                    let result = if offset != written {
                        Err(format!("expected offset {written}"))
                    } else if written + chunk.len() > total_size {
                        Err(format!("image larger than {total_size} bytes"))
                    } else {
                        update
                            .write(&chunk)
                            .map_err(|err| format!("failed writing OTA data: {err:?}"))
                    };
                    if result.is_ok() {
                        written += chunk.len();
                    }
                    let _ = reply.send(result.map_err(|reason| InstallerError::Write {
                        offset,
                        len: chunk.len(),
                        reason,
                    }));
                }
                InstallCommand::Finalize { reply } => {
                    let result = update.complete().map_err(|err| {
                        InstallerError::Finalize(format!("failed finalizing OTA image: {err:?}"))
                    });
                    if result.is_ok() {
                        info!("boot partition switched after {written} bytes");
                    }
                    let _ = reply.send(result);
                    break;
                }
                InstallCommand::Abort => {
                    if let Err(err) = update.abort() {
                        warn!("OTA abort failed: {err:?}");
                    }
                    break;
                }
                begin @ InstallCommand::Begin { .. } => {
                    if let Err(err) = update.abort() {
                        warn!("OTA abort failed: {err:?}");
                    }
                    next = Some(begin);
                    break;
                }
            }
        }
    }
}

fn reply_to(command: InstallCommand, result: Result<(), InstallerError>) {
    match command {
        InstallCommand::Begin { reply, .. }
        | InstallCommand::Write { reply, .. }
        | InstallCommand::Finalize { reply } => {
            let _ = reply.send(result);
        }
        InstallCommand::Abort => {}
    }
}

/// DHT20 temperature/humidity sensor on I2C (SDA GPIO11, SCL GPIO12).
struct Dht20 {
    i2c: I2cDriver<'static>,
    initialized: bool,
}

impl Dht20 {
    fn new(i2c: I2cDriver<'static>) -> Self {
        Self {
            i2c,
            initialized: false,
        }
    }

    // Status without both ready bits means the calibration registers need
    // restoring once after power-up.
    fn initialize(&mut self) -> anyhow::Result<()> {
        let mut status = [0_u8; 1];
        self.i2c.read(dht20::I2C_ADDRESS, &mut status, BLOCK)?;
        if dht20::needs_register_reset(status[0]) {
            info!("DHT20 status {:#04x}, restoring registers", status[0]);
            for register in dht20::RESET_REGISTERS {
                self.reset_register(register)?;
            }
            thread::sleep(Duration::from_millis(10));
        }
        self.initialized = true;
        Ok(())
    }

    fn reset_register(&mut self, register: u8) -> anyhow::Result<()> {
        self.i2c
            .write(dht20::I2C_ADDRESS, &[register, 0x00, 0x00], BLOCK)?;
        thread::sleep(Duration::from_millis(5));
        let mut readback = [0_u8; 3];
        self.i2c.read(dht20::I2C_ADDRESS, &mut readback, BLOCK)?;
        thread::sleep(Duration::from_millis(10));
        self.i2c.write(
            dht20::I2C_ADDRESS,
            &dht20::register_restore(register, &readback),
            BLOCK,
        )?;
        thread::sleep(Duration::from_millis(5));
        Ok(())
    }

    fn measure(&mut self) -> anyhow::Result<(f32, f32)> {
        if !self.initialized {
            self.initialize()?;
        }

        self.i2c
            .write(dht20::I2C_ADDRESS, &dht20::TRIGGER_MEASUREMENT, BLOCK)?;
        thread::sleep(Duration::from_millis(dht20::MEASUREMENT_DELAY_MS));

        let mut frame = [0_u8; 7];
        self.i2c.read(dht20::I2C_ADDRESS, &mut frame, BLOCK)?;
        dht20::decode(&frame).ok_or_else(|| anyhow!("DHT20 frame busy or failed CRC"))
    }
}

impl Sensor for Dht20 {
    fn read(&mut self) -> (f32, f32) {
        match self.measure() {
            Ok((temperature_c, humidity)) => {
                info!("[DHT20] {temperature_c:.1}°C, {humidity:.1}%");
                (temperature_c, humidity)
            }
            Err(err) => {
                warn!("failed to read DHT20: {err:#}");
                (f32::NAN, f32::NAN)
            }
        }
    }
}

struct Led(PinDriver<'static, AnyOutputPin, Output>);

impl StatusIndicator for Led {
    fn set(&mut self, on: bool) {
        let result = if on {
            self.0.set_high()
        } else {
            self.0.set_low()
        };
        if let Err(err) = result {
            warn!("status LED write failed: {err:?}");
        }
    }
}

/// Subscribes the calling task to the task watchdog.
fn arm_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    // ESP_ERR_INVALID_STATE: already initialised or already subscribed.
    let tolerate = |rc: sys::esp_err_t, call: &str| {
        if rc == sys::ESP_OK || rc == sys::ESP_ERR_INVALID_STATE {
            Ok(())
        } else {
            Err(anyhow!("{call} failed with code {rc}"))
        }
    };
    tolerate(unsafe { sys::esp_task_wdt_init(&config) }, "esp_task_wdt_init")?;
    tolerate(
        unsafe { sys::esp_task_wdt_add(core::ptr::null_mut()) },
        "esp_task_wdt_add",
    )
}

fn feed_watchdog() {
    let _ = unsafe { sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { sys::esp_wifi_set_ps(sys::wifi_ps_type_t_WIFI_PS_NONE) };
    if rc != sys::ESP_OK {
        warn!("wifi power save still enabled: esp_err_t={rc}");
    }
}

fn restart() {
    unsafe { sys::esp_restart() };
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
