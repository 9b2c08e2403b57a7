#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Publish/subscribe primitives of the broker connection.
///
/// Every call is non-blocking except `connect`, which may wait for the
/// broker's acknowledgement. `publish` is fire-and-forget: `true` only means
/// the message was queued.
pub trait MqttTransport {
    fn connect(&mut self, host: &str, port: u16, client_id: &str, username: &str) -> bool;
    fn is_connected(&self) -> bool;
    fn disconnect(&mut self);
    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool;
    fn subscribe(&mut self, topic: &str) -> bool;
    fn unsubscribe(&mut self, topic: &str) -> bool;
    /// Next queued inbound message, if any.
    fn poll(&mut self) -> Option<InboundMessage>;
}
