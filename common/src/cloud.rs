//! The broker session and its message pump.

use log::{debug, info, warn};
use serde_json::Value;

use crate::{
    attributes::{AttributeCallback, AttributeChannel, SubscriptionId, TimeoutCallback},
    ota::{FirmwareInstaller, OtaDriver},
    status::StatusFlags,
    topics::{TOPIC_ATTRIBUTES, TOPIC_TELEMETRY},
    transport::{InboundMessage, MqttTransport},
    types::LoopControl,
};

/// Inbound messages handled per pump before yielding to the other activities.
pub const MAX_MESSAGES_PER_PUMP: usize = 16;

pub struct CloudSession<T> {
    transport: T,
    connected: bool,
    halted: bool,
    attributes: AttributeChannel,
    persistent_topics: Vec<String>,
    max_message_size: usize,
}

impl<T: MqttTransport> CloudSession<T> {
    pub fn new(transport: T, max_message_size: usize) -> Self {
        Self {
            transport,
            connected: false,
            halted: false,
            attributes: AttributeChannel::new(),
            persistent_topics: Vec::new(),
            max_message_size,
        }
    }

    pub fn connect(&mut self, server: &str, token: &str, port: u16, client_id: &str) -> bool {
        if self.halted {
            return false;
        }

        self.attributes.on_disconnected();
        if !self.transport.connect(server, port, client_id, token) {
            self.connected = false;
            return false;
        }
        self.connected = true;

        self.attributes.resubscribe(&mut self.transport);
        for topic in &self.persistent_topics {
            if !self.transport.subscribe(topic) {
                warn!("failed to restore subscription to {topic}");
            }
        }
        true
    }

    pub fn is_connected(&self) -> bool {
        !self.halted && self.connected && self.transport.is_connected()
    }

    /// Forgets the session without touching the transport; the next
    /// `connect` starts over.
    pub fn mark_disconnected(&mut self) {
        if self.connected {
            info!("cloud session dropped");
        }
        self.connected = false;
    }

    /// Stops all further transport traffic for good.
    pub fn halt(&mut self) {
        self.halted = true;
        self.connected = false;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn publish_telemetry(&mut self, values: &Value) -> bool {
        self.publish_json(TOPIC_TELEMETRY, values)
    }

    pub fn publish_attributes(&mut self, values: &Value) -> bool {
        self.publish_json(TOPIC_ATTRIBUTES, values)
    }

    pub fn request_shared(
        &mut self,
        keys: &[&'static str],
        timeout_ms: u64,
        now_ms: u64,
        on_result: AttributeCallback,
        on_timeout: TimeoutCallback,
    ) -> bool {
        if !self.is_connected() {
            return false;
        }
        let accepted = self.attributes.request_shared(
            &mut self.transport,
            keys,
            timeout_ms,
            now_ms,
            on_result,
            on_timeout,
        );
        self.check_link(accepted)
    }

    pub fn subscribe_shared(
        &mut self,
        keys: &[&'static str],
        on_update: AttributeCallback,
    ) -> Option<SubscriptionId> {
        if !self.is_connected() {
            return None;
        }
        let id = self
            .attributes
            .subscribe_shared(&mut self.transport, keys, on_update);
        self.check_link(id.is_some());
        id
    }

    pub fn unsubscribe_shared(&mut self, id: SubscriptionId) {
        if self.halted {
            return;
        }
        self.attributes.unsubscribe(&mut self.transport, id);
    }

    pub fn pending_requests(&self) -> usize {
        self.attributes.pending_requests()
    }

    pub(crate) fn subscribe_topic(&mut self, topic: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        let subscribed = self.transport.subscribe(topic);
        if subscribed && !self.persistent_topics.iter().any(|known| known == topic) {
            self.persistent_topics.push(topic.to_string());
        }
        self.check_link(subscribed)
    }

    pub(crate) fn unsubscribe_topic(&mut self, topic: &str) {
        let before = self.persistent_topics.len();
        self.persistent_topics.retain(|known| known != topic);
        if before != self.persistent_topics.len() && self.is_connected() {
            self.transport.unsubscribe(topic);
        }
    }

    pub(crate) fn publish_raw(&mut self, topic: &str, payload: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        let published = self.transport.publish(topic, payload);
        self.check_link(published)
    }

    fn publish_json(&mut self, topic: &str, values: &Value) -> bool {
        if !self.is_connected() {
            debug!("not connected, dropping publish to {topic}");
            return false;
        }

        let payload = values.to_string();
        if payload.len() > self.max_message_size {
            warn!(
                "payload for {topic} is {} bytes, above the {} byte limit",
                payload.len(),
                self.max_message_size
            );
            return false;
        }

        let published = self.transport.publish(topic, payload.as_bytes());
        self.check_link(published)
    }

    fn expire_requests(&mut self, now_ms: u64) {
        self.attributes.expire(now_ms);
    }

    fn next_message(&mut self) -> Option<InboundMessage> {
        if self.halted {
            return None;
        }
        self.transport.poll()
    }

    fn dispatch_attributes(&mut self, message: &InboundMessage) -> bool {
        self.attributes.dispatch(message)
    }

    // A failed operation on a dead transport drops the session.
    fn check_link(&mut self, ok: bool) -> bool {
        if !ok && !self.transport.is_connected() {
            self.mark_disconnected();
        }
        ok
    }
}

/// Cloud session plus the firmware driver fed by its inbound traffic.
pub struct CloudClient<T, I> {
    pub session: CloudSession<T>,
    pub ota: OtaDriver<I>,
}

impl<T: MqttTransport, I: FirmwareInstaller> CloudClient<T, I> {
    pub fn new(session: CloudSession<T>, ota: OtaDriver<I>) -> Self {
        Self { session, ota }
    }

    /// Runs one iteration of the message loop: request timeouts, inbound
    /// delivery, then the firmware driver. Returns [`LoopControl::Restart`]
    /// exactly once, after which the session is halted.
    pub fn pump_once(&mut self, flags: &StatusFlags, now_ms: u64) -> LoopControl {
        if self.session.is_halted() {
            return LoopControl::Continue;
        }

        self.session.expire_requests(now_ms);

        for _ in 0..MAX_MESSAGES_PER_PUMP {
            let Some(message) = self.session.next_message() else {
                break;
            };
            if self.session.dispatch_attributes(&message) {
                continue;
            }
            if !self
                .ota
                .handle_message(&mut self.session, flags, &message, now_ms)
            {
                debug!("unhandled message on {}", message.topic);
            }
        }

        let control = self.ota.poll(&mut self.session, flags, now_ms);
        if control == LoopControl::Restart {
            info!("firmware installed, halting cloud session for restart");
            self.session.halt();
        }
        control
    }
}
