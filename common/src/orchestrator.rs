use std::sync::{Arc, Mutex};

use log::{info, warn};
use serde_json::json;

use crate::{
    attributes::{AttributeCallback, AttributeMap, SharedKeys},
    cloud::CloudClient,
    config::{CloudConfig, NodeConfig},
    ota::FirmwareInstaller,
    status::{Latch, StatusFlags},
    topics::{
        KEY_DEVICE_TYPE, KEY_FIRMWARE_VERSION, KEY_FW_TITLE, KEY_FW_VERSION, KEY_MAC_ADDRESS,
    },
    transport::MqttTransport,
};

pub const SHARED_ATTRIBUTES: SharedKeys<2> = SharedKeys::new([KEY_FW_VERSION, KEY_FW_TITLE]);

/// Where a tick stopped. Everything but `Ready` is retried on the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    LinkDown,
    CloudUnavailable,
    AttributeRequestRejected,
    AttributeSubscribeRejected,
    FirmwareSetupPending,
    Ready,
    Halted,
}

/// Periodic reconciliation of the cloud session and its subscriptions.
pub struct SessionOrchestrator {
    cloud: CloudConfig,
    firmware_version: String,
    device_type: String,
    flags: Arc<StatusFlags>,
    shared: Arc<Mutex<AttributeMap>>,
}

impl SessionOrchestrator {
    pub fn new(config: &NodeConfig, flags: Arc<StatusFlags>) -> Self {
        Self {
            cloud: config.cloud.clone(),
            firmware_version: config.firmware.version.clone(),
            device_type: config.firmware.device_type.clone(),
            flags,
            shared: Arc::new(Mutex::new(AttributeMap::new())),
        }
    }

    pub fn flags(&self) -> Arc<StatusFlags> {
        self.flags.clone()
    }

    /// Latest values received for [`SHARED_ATTRIBUTES`].
    pub fn shared_attributes(&self) -> AttributeMap {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Runs the setup steps in order, stopping at the first one that is not
    /// accepted. Steps whose latch is already set make no transport calls.
    pub fn tick<T: MqttTransport, I: FirmwareInstaller>(
        &mut self,
        client: &mut CloudClient<T, I>,
        link_up: bool,
        mac_address: &str,
        now_ms: u64,
    ) -> TickOutcome {
        let session = &mut client.session;
        if session.is_halted() {
            return TickOutcome::Halted;
        }

        if !link_up {
            session.mark_disconnected();
            return TickOutcome::LinkDown;
        }

        if !session.is_connected() {
            let cloud = &self.cloud;
            info!("connecting to {}:{}", cloud.server, cloud.port);
            if !session.connect(&cloud.server, &cloud.token, cloud.port, &cloud.client_id) {
                warn!("cloud connection to {} failed", cloud.server);
                return TickOutcome::CloudUnavailable;
            }
            info!("cloud session established");

            let metadata = json!({
                KEY_MAC_ADDRESS: mac_address,
                KEY_DEVICE_TYPE: self.device_type,
                KEY_FIRMWARE_VERSION: self.firmware_version,
            });
            if !session.publish_attributes(&metadata) {
                warn!("device metadata not published");
            }
            self.flags.clear(Latch::FirmwareInfoSent);
        }

        if !self.flags.is_set(Latch::AttributesRequested) {
            let accepted = session.request_shared(
                SHARED_ATTRIBUTES.as_slice(),
                self.cloud.request_timeout_ms,
                now_ms,
                self.recorder("response"),
                Box::new(|| warn!("shared attribute request timed out")),
            );
            if !accepted {
                warn!("shared attribute request not accepted");
                return TickOutcome::AttributeRequestRejected;
            }
            self.flags.latch(Latch::AttributesRequested);
        }

        if !self.flags.is_set(Latch::AttributesSubscribed) {
            let subscribed = session.subscribe_shared(
                SHARED_ATTRIBUTES.as_slice(),
                self.recorder("update"),
            );
            if subscribed.is_none() {
                warn!("shared attribute subscription not accepted");
                return TickOutcome::AttributeSubscribeRejected;
            }
            self.flags.latch(Latch::AttributesSubscribed);
        }

        if !client
            .ota
            .ensure_update_ready(&mut client.session, &self.flags, now_ms)
        {
            return TickOutcome::FirmwareSetupPending;
        }
        TickOutcome::Ready
    }

    fn recorder(&self, source: &'static str) -> AttributeCallback {
        let shared = self.shared.clone();
        Box::new(move |values| {
            for (key, value) in values {
                info!("shared attribute {source}: {key} = {value}");
            }
            shared
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .extend(values.clone());
        })
    }
}
