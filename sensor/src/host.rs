use std::{
    cell::Cell,
    io::ErrorKind,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    path::PathBuf,
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use rumqttc::{
    Client, ConnectReturnCode, Connection, Event, MqttOptions, Packet, RecvTimeoutError,
    TlsConfiguration, Transport,
};
use tracing::{debug, info, warn};

use telemetry_common::{
    provider_for, AuthConfig, Collaborators, ControllerConfig, Credential, InboundMessage,
    LinkError, MessageHandler, MessageTransport, NetworkLink, QoS, RuntimeConfig, SensorSource,
    TelemetryLoopController, ThreadSleeper, TickOutcome, TimeSource, TransportError,
    TransportSession,
};

const CONNACK_TIMEOUT_MS: u64 = 10_000;
const POLL_TIMEOUT_MS: u64 = 5;
const POLL_MAX_EVENTS: usize = 32;
const REQUEST_CHANNEL_CAP: usize = 16;

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::new();
    let mut runtime = store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime).context("invalid environment override")?;
    runtime.sanitize();
    runtime
        .validate()
        .context("runtime configuration is incomplete")?;

    let credentials = provider_for(&runtime.hub, &runtime.auth)
        .context("failed to set up device credentials")?;
    let config = ControllerConfig::from_runtime(&runtime);
    let tick = Duration::from_millis(runtime.telemetry.tick_ms);

    info!(
        "telemetry sensor `{}` (board {}) -> {}:{} every {} ms, auth={}",
        runtime.hub.device_id,
        runtime.hub.board_id,
        runtime.hub.host,
        runtime.hub.port,
        runtime.telemetry.interval_ms,
        runtime.auth.mode_str()
    );

    let mut controller = TelemetryLoopController::new(
        config,
        Collaborators {
            network: Box::new(HostNetworkLink::new(&runtime.hub.host, runtime.hub.port)),
            clock: Box::new(SystemClock::default()),
            transport: Box::new(RumqttTransport::default()),
            sensor: Box::new(SimulatedSensor::from_env()),
            credentials,
            sleeper: Box::new(ThreadSleeper),
        },
    );

    loop {
        match controller.tick(monotonic_ms()) {
            TickOutcome::Published { .. } | TickOutcome::PublishFailed { .. } => {
                debug!("stats: {}", serde_json::to_string(&controller.stats())?);
            }
            _ => {}
        }
        thread::sleep(tick);
    }
}

/// Host stand-in for the WiFi station: the "link" is up while the broker
/// resolves and the route to it keeps the same local address.
struct HostNetworkLink {
    host: String,
    port: u16,
    remote: Option<SocketAddr>,
    local: Cell<Option<SocketAddr>>,
}

impl HostNetworkLink {
    fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            remote: None,
            local: Cell::new(None),
        }
    }
}

/// Local address the OS would use to reach `remote`. UDP connect only
/// selects a route; nothing is sent.
fn route_to(remote: SocketAddr) -> std::io::Result<SocketAddr> {
    let bind: SocketAddr = if remote.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0_u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind)?;
    socket.connect(remote)?;
    socket.local_addr()
}

impl NetworkLink for HostNetworkLink {
    fn connect(&mut self) -> Result<(), LinkError> {
        self.local.set(None);

        let remote = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| LinkError::Unavailable(format!("`{}` did not resolve", self.host)))?;
        let local = route_to(remote)?;

        self.remote = Some(remote);
        self.local.set(Some(local));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let (Some(remote), Some(local)) = (self.remote, self.local.get()) else {
            return false;
        };

        match route_to(remote) {
            Ok(current) if current.ip() == local.ip() => true,
            Ok(current) => {
                warn!("local address changed from {} to {}", local.ip(), current.ip());
                self.local.set(None);
                false
            }
            Err(err) => {
                warn!("route to {remote} lost: {err}");
                self.local.set(None);
                false
            }
        }
    }

    fn local_address(&self) -> String {
        self.local
            .get()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unassigned".to_string())
    }
}

/// The OS keeps the wall clock in sync; offsets only matter for display.
#[derive(Default)]
struct SystemClock {
    offset_secs: i32,
}

impl TimeSource for SystemClock {
    fn sync(
        &mut self,
        servers: &[String],
        utc_offset_secs: i32,
        dst_offset_secs: i32,
    ) -> Result<(), LinkError> {
        self.offset_secs = utc_offset_secs.saturating_add(dst_offset_secs);
        debug!(
            "host clock managed by the OS; ignoring {} ntp server(s), local offset {}s",
            servers.len(),
            self.offset_secs
        );
        Ok(())
    }

    fn now_epoch_secs(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
    }
}

#[derive(Default)]
struct RumqttTransport {
    client: Option<Client>,
    connection: Option<Connection>,
    connected: bool,
    handler: Option<MessageHandler>,
}

impl RumqttTransport {
    fn build_options(
        session: &TransportSession,
        credential: &Credential,
    ) -> Result<MqttOptions, TransportError> {
        let mut options = MqttOptions::new(
            session.client_id.clone(),
            session.endpoint.clone(),
            session.port,
        );
        options.set_keep_alive(Duration::from_secs(session.keep_alive_secs));
        options.set_clean_session(true);

        if !session.username.is_empty() || credential.password().is_some() {
            options.set_credentials(
                session.username.clone(),
                credential.password().unwrap_or_default().to_string(),
            );
        }

        if session.use_tls {
            let transport = match (credential.certificate(), session.ca_pem.as_ref()) {
                (None, None) => Transport::tls_with_default_config(),
                (pair, Some(ca)) => Transport::tls_with_config(TlsConfiguration::Simple {
                    ca: ca.as_bytes().to_vec(),
                    alpn: None,
                    client_auth: pair.map(|pair| {
                        (
                            pair.cert_pem.as_bytes().to_vec(),
                            pair.key_pem.as_bytes().to_vec(),
                        )
                    }),
                }),
                (Some(_), None) => {
                    return Err(TransportError::Connect(
                        "client certificate auth needs the broker CA (ca_pem)".to_string(),
                    ))
                }
            };
            options.set_transport(transport);
        }

        Ok(options)
    }

    fn close(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.try_disconnect();
        }
        self.connection = None;
        self.connected = false;
    }

    fn dispatch(&mut self, topic: String, payload: Vec<u8>) {
        let message = InboundMessage::new(topic, payload);
        match self.handler.as_mut() {
            Some(handler) => handler(&message),
            None => debug!("dropping message on {} (no handler)", message.topic),
        }
    }
}

impl MessageTransport for RumqttTransport {
    fn connect(
        &mut self,
        session: &TransportSession,
        credential: &Credential,
    ) -> Result<(), TransportError> {
        self.close();

        let options = Self::build_options(session, credential)?;
        let (client, mut connection) = Client::new(options, REQUEST_CHANNEL_CAP);
        let deadline = Instant::now() + Duration::from_millis(CONNACK_TIMEOUT_MS);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(CONNACK_TIMEOUT_MS));
            }

            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(TransportError::Connect(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )));
                    }
                    info!("mqtt session established with {}", session.endpoint);
                    break;
                }
                Ok(Ok(event)) => debug!("mqtt event before connack: {event:?}"),
                Ok(Err(err)) => return Err(TransportError::Connect(err.to_string())),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(TransportError::Timeout(CONNACK_TIMEOUT_MS))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::Connect("event loop stopped".to_string()))
                }
            }
        }

        self.client = Some(client);
        self.connection = Some(connection);
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::NotConnected)?;
        client
            .try_publish(topic, to_rumqttc_qos(qos), retain, payload.to_vec())
            .map_err(|err| TransportError::Publish(err.to_string()))
    }

    fn subscribe(&mut self, topic_filter: &str, qos: QoS) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::NotConnected)?;
        client
            .try_subscribe(topic_filter, to_rumqttc_qos(qos))
            .map_err(|err| TransportError::Subscribe(err.to_string()))
    }

    fn on_message(&mut self, handler: MessageHandler) {
        self.handler = Some(handler);
    }

    fn poll(&mut self) {
        let mut received = Vec::new();

        if let Some(connection) = self.connection.as_mut() {
            for _ in 0..POLL_MAX_EVENTS {
                match connection.recv_timeout(Duration::from_millis(POLL_TIMEOUT_MS)) {
                    Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                        received.push((publish.topic, publish.payload.to_vec()));
                    }
                    Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                        warn!("broker sent disconnect");
                        self.connected = false;
                        break;
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        warn!("mqtt connection error: {err}");
                        self.connected = false;
                        break;
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        self.connected = false;
                        break;
                    }
                }
            }
        }

        for (topic, payload) in received {
            self.dispatch(topic, payload);
        }
    }
}

fn to_rumqttc_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

/// Deterministic readings standing in for the DHT22.
struct SimulatedSensor {
    reads: u64,
    drop_every: Option<u64>,
}

impl SimulatedSensor {
    fn from_env() -> Self {
        Self {
            reads: 0,
            drop_every: std::env::var("SIM_SENSOR_DROP_EVERY")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|every| *every > 0),
        }
    }

    fn dropped(&self) -> bool {
        self.drop_every
            .map(|every| self.reads % every == 0)
            .unwrap_or(false)
    }
}

impl SensorSource for SimulatedSensor {
    fn read_temperature(&mut self) -> Option<f32> {
        self.reads = self.reads.saturating_add(1);
        if self.dropped() {
            return Some(f32::NAN);
        }
        Some(21.0 + (self.reads % 8) as f32 * 0.2)
    }

    fn read_humidity(&mut self) -> Option<f32> {
        if self.dropped() {
            return Some(f32::NAN);
        }
        Some(45.0 + (self.reads % 6) as f32 * 0.5)
    }
}

struct ConfigStore {
    runtime_path: PathBuf,
}

impl ConfigStore {
    fn new() -> Self {
        let data_dir = std::env::var("TELEMETRY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.telemetry"));

        Self {
            runtime_path: data_dir.join("runtime.json"),
        }
    }

    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match std::fs::read(&self.runtime_path) {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) -> anyhow::Result<()> {
    if let Ok(host) = std::env::var("IOT_HUB_HOST") {
        runtime.hub.host = host;
    }
    if let Ok(port) = std::env::var("IOT_HUB_PORT") {
        runtime.hub.port = port.parse().context("IOT_HUB_PORT")?;
    }
    if let Ok(device_id) = std::env::var("IOT_DEVICE_ID") {
        runtime.hub.device_id = device_id;
    }
    if let Ok(board_id) = std::env::var("IOT_BOARD_ID") {
        runtime.hub.board_id = board_id.parse().context("IOT_BOARD_ID")?;
    }
    if let Ok(interval) = std::env::var("TELEMETRY_INTERVAL_MS") {
        runtime.telemetry.interval_ms = interval.parse().context("TELEMETRY_INTERVAL_MS")?;
    }
    if let Ok(path) = std::env::var("IOT_HUB_CA") {
        runtime.hub.ca_pem = Some(read_pem(&path)?);
    }

    if let Ok(device_key) = std::env::var("IOT_DEVICE_KEY") {
        let (token_duration_minutes, refresh_margin_secs) = match &runtime.auth {
            AuthConfig::SasToken {
                token_duration_minutes,
                refresh_margin_secs,
                ..
            } => (*token_duration_minutes, *refresh_margin_secs),
            AuthConfig::Certificate { .. } => (60, 30),
        };
        runtime.auth = AuthConfig::SasToken {
            device_key,
            token_duration_minutes,
            refresh_margin_secs,
        };
    } else if let Ok(cert_path) = std::env::var("IOT_DEVICE_CERT") {
        let key_path = std::env::var("IOT_DEVICE_CERT_KEY")
            .context("IOT_DEVICE_CERT_KEY must accompany IOT_DEVICE_CERT")?;
        runtime.auth = AuthConfig::Certificate {
            cert_pem: read_pem(&cert_path)?,
            key_pem: read_pem(&key_path)?,
        };
    }

    Ok(())
}

fn read_pem(path: &str) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read PEM file `{path}`"))
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

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn simulated_sensor_drops_every_nth_reading() {
        let mut sensor = SimulatedSensor {
            reads: 0,
            drop_every: Some(3),
        };

        let temperatures: Vec<bool> = (0..6)
            .map(|_| {
                let temperature = sensor.read_temperature().unwrap();
                let humidity = sensor.read_humidity().unwrap();
                assert_eq!(temperature.is_nan(), humidity.is_nan());
                temperature.is_nan()
            })
            .collect();

        assert_eq!(temperatures, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn loopback_link_stays_up_while_route_is_unchanged() {
        let mut link = HostNetworkLink::new("127.0.0.1", 8883);
        assert!(!link.is_connected());

        link.connect().unwrap();

        assert!(link.is_connected());
        assert_eq!(link.local_address(), "127.0.0.1");
    }

    #[test]
    fn link_reports_down_once_local_address_changes() {
        let link = HostNetworkLink {
            host: "127.0.0.1".to_string(),
            port: 8883,
            remote: Some(([127, 0, 0, 1], 8883).into()),
            local: Cell::new(Some(([10, 255, 255, 1], 40_000).into())),
        };

        assert!(!link.is_connected());
        assert_eq!(link.local_address(), "unassigned");
        assert!(!link.is_connected());
    }

    #[test]
    fn missing_store_file_yields_defaults() {
        let store = ConfigStore {
            runtime_path: PathBuf::from("./does-not-exist/runtime.json"),
        };

        let runtime = store.load_runtime_config().unwrap();

        assert_eq!(runtime.telemetry.interval_ms, 5_000);
        assert!(runtime.hub.host.is_empty());
    }

    #[test]
    fn certificate_without_ca_is_rejected_before_connecting() {
        let session = TransportSession {
            endpoint: "broker.local".to_string(),
            port: 8883,
            client_id: "esp32-1".to_string(),
            username: String::new(),
            use_tls: true,
            keep_alive_secs: 240,
            ca_pem: None,
        };
        let credential = Credential::Certificate(telemetry_common::CertificatePair {
            cert_pem: "CERT".to_string(),
            key_pem: "KEY".to_string(),
        });

        let result = RumqttTransport::build_options(&session, &credential);

        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
