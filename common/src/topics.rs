pub const TOPIC_TELEMETRY: &str = "v1/devices/me/telemetry";
pub const TOPIC_ATTRIBUTES: &str = "v1/devices/me/attributes";
pub const TOPIC_ATTRIBUTE_REQUEST_PREFIX: &str = "v1/devices/me/attributes/request/";
pub const TOPIC_ATTRIBUTE_RESPONSE_PREFIX: &str = "v1/devices/me/attributes/response/";
pub const TOPIC_ATTRIBUTE_RESPONSE_SUBSCRIBE: &str = "v1/devices/me/attributes/response/+";

pub const TOPIC_FIRMWARE_REQUEST_PREFIX: &str = "v2/fw/request/";
pub const TOPIC_FIRMWARE_RESPONSE_PREFIX: &str = "v2/fw/response/";
pub const TOPIC_FIRMWARE_RESPONSE_SUBSCRIBE: &str = "v2/fw/response/+/chunk/+";

pub const KEY_TEMPERATURE: &str = "temperature";
pub const KEY_HUMIDITY: &str = "humidity";
pub const KEY_POWER_CONSUMPTION: &str = "powerConsumption";

pub const KEY_RSSI: &str = "rssi";
pub const KEY_CHANNEL: &str = "channel";
pub const KEY_BSSID: &str = "bssid";
pub const KEY_LOCAL_IP: &str = "localIp";
pub const KEY_MAC_ADDRESS: &str = "macAddress";
pub const KEY_DEVICE_TYPE: &str = "deviceType";
pub const KEY_FIRMWARE_VERSION: &str = "firmwareVersion";

pub const KEY_CURRENT_FW_TITLE: &str = "current_fw_title";
pub const KEY_CURRENT_FW_VERSION: &str = "current_fw_version";
pub const KEY_FW_STATE: &str = "fw_state";
pub const KEY_FW_ERROR: &str = "fw_error";

pub const KEY_FW_TITLE: &str = "fw_title";
pub const KEY_FW_VERSION: &str = "fw_version";
pub const KEY_FW_SIZE: &str = "fw_size";
pub const KEY_FW_CHECKSUM: &str = "fw_checksum";
pub const KEY_FW_CHECKSUM_ALGORITHM: &str = "fw_checksum_algorithm";

pub fn attribute_request_topic(request_id: u32) -> String {
    format!("{TOPIC_ATTRIBUTE_REQUEST_PREFIX}{request_id}")
}

pub fn firmware_chunk_request_topic(request_id: u32, chunk: u32) -> String {
    format!("{TOPIC_FIRMWARE_REQUEST_PREFIX}{request_id}/chunk/{chunk}")
}

pub fn parse_attribute_response_id(topic: &str) -> Option<u32> {
    topic
        .strip_prefix(TOPIC_ATTRIBUTE_RESPONSE_PREFIX)?
        .parse()
        .ok()
}

/// Splits `v2/fw/response/{request}/chunk/{index}` into its two numbers.
pub fn parse_firmware_chunk_response(topic: &str) -> Option<(u32, u32)> {
    let rest = topic.strip_prefix(TOPIC_FIRMWARE_RESPONSE_PREFIX)?;
    let (request, chunk) = rest.split_once("/chunk/")?;
    Some((request.parse().ok()?, chunk.parse().ok()?))
}
