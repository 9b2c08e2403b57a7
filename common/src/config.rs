use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_WIFI_SSID: &str = match option_env!("ENVNODE_WIFI_SSID") {
    Some(value) => value,
    None => "",
};
const DEFAULT_WIFI_PASSWORD: &str = match option_env!("ENVNODE_WIFI_PASSWORD") {
    Some(value) => value,
    None => "",
};
const DEFAULT_CLOUD_TOKEN: &str = match option_env!("ENVNODE_TB_TOKEN") {
    Some(value) => value,
    None => "",
};

pub const FIRMWARE_TITLE: &str = "OTA test";
pub const FIRMWARE_VERSION: &str = "2.0";
pub const DEVICE_TYPE: &str = "Complete Environment Monitor";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiConfig {
    pub ssid: String,
    pub password: String,
    pub connect_attempts: u32,
    pub retry_delay_ms: u64,
    pub settle_ms: u64,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            ssid: DEFAULT_WIFI_SSID.to_string(),
            password: DEFAULT_WIFI_PASSWORD.to_string(),
            connect_attempts: 20,
            retry_delay_ms: 500,
            settle_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    pub server: String,
    pub port: u16,
    pub token: String,
    pub client_id: String,
    pub max_message_size: usize,
    pub request_timeout_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            server: "app.coreiot.io".to_string(),
            port: 1883,
            token: DEFAULT_CLOUD_TOKEN.to_string(),
            client_id: "envnode".to_string(),
            max_message_size: 512,
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareConfig {
    pub title: String,
    pub version: String,
    pub device_type: String,
    pub failure_retries: u8,
    pub packet_size: u16,
    pub chunk_timeout_ms: u64,
    pub restart_grace_ms: u64,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            title: FIRMWARE_TITLE.to_string(),
            version: FIRMWARE_VERSION.to_string(),
            device_type: DEVICE_TYPE.to_string(),
            failure_retries: 20,
            packet_size: 8_192,
            chunk_timeout_ms: 5_000,
            restart_grace_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalConfig {
    pub reconnect_ms: u64,
    pub orchestrate_ms: u64,
    pub blink_ms: u64,
    pub blink_poll_ms: u64,
    pub pump_ms: u64,
    pub telemetry_ms: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            reconnect_ms: 10_000,
            orchestrate_ms: 5_000,
            blink_ms: 1_000,
            blink_poll_ms: 50,
            pump_ms: 50,
            telemetry_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub wifi: WifiConfig,
    pub cloud: CloudConfig,
    pub firmware: FirmwareConfig,
    #[serde(default)]
    pub intervals: IntervalConfig,
}

impl NodeConfig {
    pub fn sanitize(&mut self) {
        self.wifi.connect_attempts = self.wifi.connect_attempts.clamp(1, 120);
        self.wifi.retry_delay_ms = self.wifi.retry_delay_ms.min(10_000);

        self.cloud.max_message_size = self.cloud.max_message_size.clamp(128, 65_536);
        self.cloud.request_timeout_ms = self.cloud.request_timeout_ms.clamp(500, 300_000);

        self.firmware.failure_retries = self.firmware.failure_retries.max(1);
        self.firmware.packet_size = self.firmware.packet_size.clamp(256, 16_384);
        self.firmware.chunk_timeout_ms = self.firmware.chunk_timeout_ms.clamp(500, 120_000);

        let intervals = &mut self.intervals;
        intervals.reconnect_ms = intervals.reconnect_ms.max(1_000);
        intervals.orchestrate_ms = intervals.orchestrate_ms.max(100);
        intervals.blink_ms = intervals.blink_ms.max(intervals.blink_poll_ms.max(1));
        intervals.blink_poll_ms = intervals.blink_poll_ms.max(10);
        intervals.pump_ms = intervals.pump_ms.clamp(10, 1_000);
        intervals.telemetry_ms = intervals.telemetry_ms.max(1_000);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cloud.server.trim().is_empty() {
            return Err(ConfigError::Empty("cloud.server"));
        }
        if self.cloud.token.trim().is_empty() {
            return Err(ConfigError::Empty("cloud.token"));
        }
        if self.cloud.port == 0 {
            return Err(ConfigError::Port);
        }
        if self.firmware.title.trim().is_empty() {
            return Err(ConfigError::Empty("firmware.title"));
        }
        if self.firmware.version.trim().is_empty() {
            return Err(ConfigError::Empty("firmware.version"));
        }
        Ok(())
    }

    /// Largest inbound publish the transport must accept: a full firmware
    /// chunk plus topic and header overhead, never below the message size.
    pub fn inbound_buffer_size(&self) -> usize {
        (usize::from(self.firmware.packet_size) + 128).max(self.cloud.max_message_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut config = NodeConfig::default();
        config.wifi.connect_attempts = 0;
        config.firmware.failure_retries = 0;
        config.firmware.packet_size = 16;
        config.intervals.pump_ms = 0;

        config.sanitize();

        assert_eq!(config.wifi.connect_attempts, 1);
        assert_eq!(config.firmware.failure_retries, 1);
        assert_eq!(config.firmware.packet_size, 256);
        assert_eq!(config.intervals.pump_ms, 10);
    }

    #[test]
    fn validate_requires_token_and_port() {
        let mut config = NodeConfig::default();
        config.cloud.token = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::Empty("cloud.token")));

        config.cloud.token = "secret".to_string();
        config.cloud.port = 0;
        assert_eq!(config.validate(), Err(ConfigError::Port));

        config.cloud.port = 1883;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn inbound_buffer_fits_a_firmware_chunk() {
        let config = NodeConfig::default();
        assert!(config.inbound_buffer_size() >= usize::from(config.firmware.packet_size));
    }
}
