use log::{debug, warn};
use serde_json::{json, Value};

use crate::{
    cloud::CloudSession,
    topics::{
        KEY_BSSID, KEY_CHANNEL, KEY_HUMIDITY, KEY_LOCAL_IP, KEY_POWER_CONSUMPTION, KEY_RSSI,
        KEY_TEMPERATURE,
    },
    transport::MqttTransport,
    types::{LinkInfo, SensorReading},
};

/// Temperature (°C) and relative humidity (%). A failed read yields NaN.
pub trait Sensor {
    fn read(&mut self) -> (f32, f32);
}

pub trait PowerSource {
    fn sample(&mut self) -> u8;
}

/// Placeholder power reading: the board has no power meter, so this is a
/// random value in `1..=99`.
pub struct SyntheticPower(fastrand::Rng);

impl SyntheticPower {
    pub fn new() -> Self {
        Self(fastrand::Rng::new())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self(fastrand::Rng::with_seed(seed))
    }
}

impl Default for SyntheticPower {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerSource for SyntheticPower {
    fn sample(&mut self) -> u8 {
        self.0.u8(1..=99)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryOutcome {
    InvalidSample,
    Offline,
    Published { telemetry: bool, attributes: bool },
}

pub struct TelemetryProducer<S, P> {
    sensor: S,
    power: P,
}

impl<S: Sensor, P: PowerSource> TelemetryProducer<S, P> {
    pub fn new(sensor: S, power: P) -> Self {
        Self { sensor, power }
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }

    /// Samples once and publishes the reading plus a link snapshot. Nothing
    /// is retried; the next period simply samples again.
    pub fn tick<T: MqttTransport>(
        &mut self,
        session: &mut CloudSession<T>,
        link: &LinkInfo,
        now_ms: u64,
        wall_clock_ms: Option<i64>,
    ) -> TelemetryOutcome {
        let (temperature_c, humidity) = self.sensor.read();
        let reading = SensorReading {
            temperature_c,
            humidity,
            timestamp_ms: now_ms,
        };
        if !reading.is_valid() {
            warn!("sensor read failed, skipping telemetry");
            return TelemetryOutcome::InvalidSample;
        }

        if !session.is_connected() {
            debug!("cloud offline, dropping reading {reading:?}");
            return TelemetryOutcome::Offline;
        }

        let values = json!({
            KEY_TEMPERATURE: round_tenths(reading.temperature_c),
            KEY_HUMIDITY: round_tenths(reading.humidity),
            KEY_POWER_CONSUMPTION: self.power.sample(),
        });
        let payload = match wall_clock_ms {
            Some(ts) => json!({ "ts": ts, "values": values }),
            None => values,
        };
        let telemetry = session.publish_telemetry(&payload);
        if !telemetry {
            warn!("telemetry publish failed");
        }

        let attributes = session.publish_attributes(&link_attributes(link));
        if !attributes {
            warn!("link attribute publish failed");
        }

        TelemetryOutcome::Published {
            telemetry,
            attributes,
        }
    }
}

fn link_attributes(link: &LinkInfo) -> Value {
    json!({
        KEY_RSSI: link.rssi,
        KEY_CHANNEL: link.channel,
        KEY_BSSID: link.bssid,
        KEY_LOCAL_IP: link.local_ip,
    })
}

fn round_tenths(value: f32) -> f64 {
    (f64::from(value) * 10.0).round() / 10.0
}
