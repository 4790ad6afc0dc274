//! Network collaborators: link transport, time source and pub/sub client.
//!
//! The task state machines only see these traits. Ethernet and cellular
//! modules differ in how `Transport` is implemented, never in the FSMs.

use core::fmt::Write;
use embassy_time::Duration;
use serde::{Deserialize, Serialize};

pub const TOPIC_LEN: usize = 96;

pub type Topic = heapless::String<TOPIC_LEN>;

/// Which physical link the module is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NetworkKind {
    Ethernet,
    Gsm,
    Wifi,
}

/// Link-level transport. Calls are non-blocking: `connect` makes progress
/// and reports whether the link is up, the caller polls it again later.
pub trait Transport {
    fn kind(&self) -> NetworkKind;
    fn connect(&mut self) -> bool;
    fn is_connected(&self) -> bool;
    /// Opens the datagram socket used by the time source.
    fn open_socket(&mut self) -> bool;
    fn disconnect(&mut self);
}

/// Network time source (NTP over the transport's datagram socket).
pub trait TimeSource {
    fn send_request(&mut self, server: &str) -> bool;
    /// Unix seconds once a response has arrived.
    fn poll_response(&mut self) -> Option<u32>;
}

/// Session parameters for [`PubSub::connect`].
#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    pub server: &'a str,
    pub port: u16,
    pub client_id: &'a str,
    pub username: &'a str,
    pub password: &'a str,
}

/// Publish/subscribe client (MQTT).
pub trait PubSub {
    fn connect(&mut self, credentials: &Credentials<'_>) -> bool;
    fn is_connected(&self) -> bool;
    fn subscribe(&mut self, topic: &str) -> bool;
    /// `true` only once the broker acknowledged delivery.
    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool;
    /// Lets the client service its socket; messages received on subscribed
    /// topics are handed to `on_message`.
    fn yield_now(&mut self, timeout: Duration, on_message: &mut dyn FnMut(&[u8]));
    fn disconnect(&mut self);
}

/// `<root>/<module>/<sensor>`, shared by the publisher and the record codec.
pub fn publish_topic(root: &str, module: &str, sensor: &str) -> Topic {
    let mut topic = Topic::new();
    let _ = write!(
        topic,
        "{}/{}/{}",
        root.trim_end_matches('/'),
        module,
        sensor
    );
    topic
}

/// Where RPC replies received on `subscribe_topic` are answered.
pub fn response_topic(subscribe_topic: &str) -> Topic {
    let mut topic = Topic::new();
    let _ = write!(topic, "{}/res", subscribe_topic.trim_end_matches('/'));
    topic
}
