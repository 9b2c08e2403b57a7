//! Shared-attribute request/response and change notifications.
//!
//! Requests are published on `v1/devices/me/attributes/request/{id}` and
//! answered on the matching response topic; change notifications arrive on
//! `v1/devices/me/attributes`. Delivery always happens from
//! [`AttributeChannel::dispatch`], which the message pump calls for every
//! inbound message.

use log::{debug, warn};
use serde_json::{json, Map, Value};

use crate::{
    topics::{
        attribute_request_topic, parse_attribute_response_id, TOPIC_ATTRIBUTES,
        TOPIC_ATTRIBUTE_RESPONSE_PREFIX, TOPIC_ATTRIBUTE_RESPONSE_SUBSCRIBE,
    },
    transport::{InboundMessage, MqttTransport},
};

pub const MAX_PENDING_REQUESTS: usize = 2;
pub const MAX_SUBSCRIPTIONS: usize = 2;

pub type AttributeMap = Map<String, Value>;
pub type AttributeCallback = Box<dyn FnMut(&AttributeMap) + Send>;
pub type TimeoutCallback = Box<dyn FnMut() + Send>;

/// Fixed set of attribute names a caller is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedKeys<const N: usize>([&'static str; N]);

impl<const N: usize> SharedKeys<N> {
    pub const fn new(keys: [&'static str; N]) -> Self {
        Self(keys)
    }

    pub fn as_slice(&self) -> &[&'static str] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u32);

struct PendingRequest {
    id: u32,
    keys: Vec<&'static str>,
    deadline_ms: u64,
    on_result: AttributeCallback,
    on_timeout: TimeoutCallback,
}

struct Subscription {
    id: SubscriptionId,
    keys: Vec<&'static str>,
    on_update: AttributeCallback,
}

#[derive(Default)]
pub struct AttributeChannel {
    next_request_id: u32,
    next_subscription_id: u32,
    pending: Vec<PendingRequest>,
    subscriptions: Vec<Subscription>,
    response_topic_active: bool,
    update_topic_active: bool,
}

impl AttributeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    /// Asks the server for the current value of `keys`. Returns whether the
    /// request was accepted; the answer or the timeout arrives later through
    /// [`Self::dispatch`] / [`Self::expire`].
    pub fn request_shared<T: MqttTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        keys: &[&'static str],
        timeout_ms: u64,
        now_ms: u64,
        on_result: AttributeCallback,
        on_timeout: TimeoutCallback,
    ) -> bool {
        if keys.is_empty() {
            return false;
        }
        if self.pending.len() >= MAX_PENDING_REQUESTS {
            warn!(
                "attribute request rejected: {} requests already pending",
                self.pending.len()
            );
            return false;
        }

        if !self.response_topic_active {
            if !transport.subscribe(TOPIC_ATTRIBUTE_RESPONSE_SUBSCRIBE) {
                return false;
            }
            self.response_topic_active = true;
        }

        self.next_request_id = self.next_request_id.wrapping_add(1);
        let id = self.next_request_id;
        let payload = json!({ "sharedKeys": keys.join(",") }).to_string();

        if !transport.publish(&attribute_request_topic(id), payload.as_bytes()) {
            return false;
        }

        debug!("attribute request {id} sent for [{}]", keys.join(", "));
        self.pending.push(PendingRequest {
            id,
            keys: keys.to_vec(),
            deadline_ms: now_ms.saturating_add(timeout_ms),
            on_result,
            on_timeout,
        });
        true
    }

    /// Registers `on_update` for server-side changes of `keys`.
    pub fn subscribe_shared<T: MqttTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        keys: &[&'static str],
        on_update: AttributeCallback,
    ) -> Option<SubscriptionId> {
        if keys.is_empty() {
            return None;
        }
        if self.subscriptions.len() >= MAX_SUBSCRIPTIONS {
            warn!(
                "attribute subscription rejected: {} subscriptions already active",
                self.subscriptions.len()
            );
            return None;
        }

        if !self.update_topic_active {
            if !transport.subscribe(TOPIC_ATTRIBUTES) {
                return None;
            }
            self.update_topic_active = true;
        }

        self.next_subscription_id = self.next_subscription_id.wrapping_add(1);
        let id = SubscriptionId(self.next_subscription_id);
        self.subscriptions.push(Subscription {
            id,
            keys: keys.to_vec(),
            on_update,
        });
        Some(id)
    }

    pub fn unsubscribe<T: MqttTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        id: SubscriptionId,
    ) {
        self.subscriptions.retain(|subscription| subscription.id != id);

        if self.subscriptions.is_empty() && self.update_topic_active {
            transport.unsubscribe(TOPIC_ATTRIBUTES);
            self.update_topic_active = false;
        }
    }

    /// Routes an inbound message to the matching request or subscriptions.
    /// Returns `false` when the topic is not an attribute topic.
    pub fn dispatch(&mut self, message: &InboundMessage) -> bool {
        if message.topic == TOPIC_ATTRIBUTES {
            self.deliver_update(&message.payload);
            return true;
        }

        if !message.topic.starts_with(TOPIC_ATTRIBUTE_RESPONSE_PREFIX) {
            return false;
        }

        let Some(id) = parse_attribute_response_id(&message.topic) else {
            warn!("malformed attribute response topic {}", message.topic);
            return true;
        };

        let Some(position) = self.pending.iter().position(|request| request.id == id) else {
            debug!("ignoring attribute response {id} with no pending request");
            return true;
        };

        let mut request = self.pending.remove(position);
        match parse_object(&message.payload) {
            Some(object) => {
                let values = filter_keys(shared_section(object), &request.keys);
                (request.on_result)(&values);
            }
            None => warn!("attribute response {id} is not a JSON object"),
        }
        true
    }

    /// Fires and drops every request whose deadline has passed.
    pub fn expire(&mut self, now_ms: u64) {
        let mut index = 0;
        while index < self.pending.len() {
            if now_ms >= self.pending[index].deadline_ms {
                let mut request = self.pending.remove(index);
                warn!("attribute request {} timed out", request.id);
                (request.on_timeout)();
            } else {
                index += 1;
            }
        }
    }

    /// The broker forgets subscriptions when the session drops.
    pub fn on_disconnected(&mut self) {
        self.response_topic_active = false;
        self.update_topic_active = false;
    }

    /// Re-issues broker subscriptions for everything still registered.
    pub fn resubscribe<T: MqttTransport + ?Sized>(&mut self, transport: &mut T) {
        if !self.subscriptions.is_empty() && !self.update_topic_active {
            self.update_topic_active = transport.subscribe(TOPIC_ATTRIBUTES);
        }
        if !self.pending.is_empty() && !self.response_topic_active {
            self.response_topic_active = transport.subscribe(TOPIC_ATTRIBUTE_RESPONSE_SUBSCRIBE);
        }
    }

    fn deliver_update(&mut self, payload: &[u8]) {
        let Some(object) = parse_object(payload) else {
            warn!("attribute update is not a JSON object");
            return;
        };
        let changed = shared_section(object);

        for subscription in &mut self.subscriptions {
            let values = filter_keys(changed.clone(), &subscription.keys);
            if !values.is_empty() {
                (subscription.on_update)(&values);
            }
        }
    }
}

fn parse_object(payload: &[u8]) -> Option<AttributeMap> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(object)) => Some(object),
        _ => None,
    }
}

fn shared_section(mut object: AttributeMap) -> AttributeMap {
    match object.remove("shared") {
        Some(Value::Object(shared)) => shared,
        Some(other) => {
            object.insert("shared".to_string(), other);
            object
        }
        None => object,
    }
}

fn filter_keys(values: AttributeMap, keys: &[&'static str]) -> AttributeMap {
    values
        .into_iter()
        .filter(|(key, _)| keys.contains(&key.as_str()))
        .collect()
}
