//! Interfaces of the services the telemetry loop drives.
//!
//! Platform crates provide the real implementations (WiFi, SNTP, MQTT, DHT
//! driver); tests substitute recording fakes.

use std::time::Duration;

use crate::{
    credential::Credential,
    error::{LinkError, TransportError},
    types::{InboundMessage, QoS},
};

pub type MessageHandler = Box<dyn FnMut(&InboundMessage)>;

pub trait NetworkLink {
    /// Brings the link up. May block while the driver associates.
    fn connect(&mut self) -> Result<(), LinkError>;
    fn is_connected(&self) -> bool;
    /// Diagnostic only.
    fn local_address(&self) -> String;
}

pub trait TimeSource {
    fn sync(
        &mut self,
        servers: &[String],
        utc_offset_secs: i32,
        dst_offset_secs: i32,
    ) -> Result<(), LinkError>;
    fn now_epoch_secs(&self) -> u64;
}

/// Connection parameters handed to [`MessageTransport::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSession {
    pub endpoint: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub use_tls: bool,
    pub keep_alive_secs: u64,
    pub ca_pem: Option<String>,
}

pub trait MessageTransport {
    /// Opens a fresh session, replacing any previous one.
    fn connect(
        &mut self,
        session: &TransportSession,
        credential: &Credential,
    ) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;
    fn subscribe(&mut self, topic_filter: &str, qos: QoS) -> Result<(), TransportError>;
    fn on_message(&mut self, handler: MessageHandler);
    /// Services I/O and runs the message handler for anything received.
    /// Must return within the transport's own timeout.
    fn poll(&mut self);
}

pub trait SensorSource {
    /// `None` when the driver has no valid reading.
    fn read_temperature(&mut self) -> Option<f32>;
    fn read_humidity(&mut self) -> Option<f32>;
}

pub trait Sleeper {
    fn sleep_ms(&mut self, ms: u64);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep_ms(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}
