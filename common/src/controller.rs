use std::fmt::Display;

use log::{debug, error, info, warn};

use crate::{
    collaborators::{
        MessageHandler, MessageTransport, NetworkLink, SensorSource, Sleeper, TimeSource,
        TransportSession,
    },
    config::{AuthConfig, BrokerKind, RetryPolicy, RuntimeConfig, TimeConfig},
    credential::{Credential, CredentialProvider},
    error::LinkError,
    topics::{c2d_subscribe_topic, hub_username, telemetry_topic},
    types::{
        ConnectionState, ControllerStats, InboundMessage, PublishSchedule, QoS, TelemetrySample,
    },
};

/// Clocks reporting less than this (13 Nov 2017) have not been synchronized.
pub const MIN_VALID_EPOCH_SECS: u64 = 1_510_592_825;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub session: TransportSession,
    pub device_id: String,
    pub board_id: i32,
    pub telemetry_topic: String,
    /// Cloud-to-device filter; `None` when the broker needs no subscribe step.
    pub command_topic: Option<String>,
    pub interval_ms: u64,
    pub token_duration_minutes: u32,
    pub refresh_margin_secs: u64,
    pub time: TimeConfig,
    pub retry: RetryPolicy,
}

impl ControllerConfig {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        let hub = &runtime.hub;
        let username = match hub.broker {
            BrokerKind::AzureIotHub => hub_username(&hub.host, &hub.device_id),
            BrokerKind::Generic => hub.username.clone(),
        };
        let (token_duration_minutes, refresh_margin_secs) = match &runtime.auth {
            AuthConfig::SasToken {
                token_duration_minutes,
                refresh_margin_secs,
                ..
            } => (*token_duration_minutes, *refresh_margin_secs),
            AuthConfig::Certificate { .. } => (0, 0),
        };

        Self {
            session: TransportSession {
                endpoint: hub.host.clone(),
                port: hub.port,
                client_id: hub.device_id.clone(),
                username,
                use_tls: hub.use_tls,
                keep_alive_secs: hub.keep_alive_secs,
                ca_pem: hub.ca_pem.clone(),
            },
            device_id: hub.device_id.clone(),
            board_id: hub.board_id,
            telemetry_topic: telemetry_topic(&hub.device_id),
            command_topic: Some(c2d_subscribe_topic(&hub.device_id)),
            interval_ms: runtime.telemetry.interval_ms,
            token_duration_minutes,
            refresh_margin_secs,
            time: runtime.time.clone(),
            retry: runtime.retry,
        }
    }
}

pub struct Collaborators {
    pub network: Box<dyn NetworkLink>,
    pub clock: Box<dyn TimeSource>,
    pub transport: Box<dyn MessageTransport>,
    pub sensor: Box<dyn SensorSource>,
    pub credentials: Box<dyn CredentialProvider>,
    pub sleeper: Box<dyn Sleeper>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Connection establishment did not complete this tick.
    Connecting,
    /// Connection reached `Ready` this tick; publishing resumes next tick.
    Connected,
    CredentialRefreshed,
    CredentialFailed,
    Idle,
    Published { sequence_number: u64 },
    PublishFailed { sequence_number: u64 },
}

/// Owns connectivity state, the active credential, the publish schedule and
/// the telemetry sequence counter. Driven by [`tick`](Self::tick) on a fixed
/// external cadence from a single thread.
pub struct TelemetryLoopController {
    config: ControllerConfig,
    network: Box<dyn NetworkLink>,
    clock: Box<dyn TimeSource>,
    transport: Box<dyn MessageTransport>,
    sensor: Box<dyn SensorSource>,
    credentials: Box<dyn CredentialProvider>,
    sleeper: Box<dyn Sleeper>,

    state: ConnectionState,
    credential: Option<Credential>,
    schedule: PublishSchedule,
    sequence_number: u64,
    stats: ControllerStats,
}

impl TelemetryLoopController {
    pub fn new(config: ControllerConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            network,
            clock,
            mut transport,
            sensor,
            credentials,
            sleeper,
        } = collaborators;

        transport.on_message(Box::new(log_inbound_message));
        let schedule = PublishSchedule::new(config.interval_ms);

        Self {
            config,
            network,
            clock,
            transport,
            sensor,
            credentials,
            sleeper,
            state: ConnectionState::Disconnected,
            credential: None,
            schedule,
            sequence_number: 0,
            stats: ControllerStats::default(),
        }
    }

    pub fn set_message_handler(&mut self, handler: MessageHandler) {
        self.transport.on_message(handler);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Sequence number the next sample will carry.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn schedule(&self) -> PublishSchedule {
        self.schedule
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn telemetry_topic(&self) -> &str {
        &self.config.telemetry_topic
    }

    pub fn stats(&self) -> ControllerStats {
        self.stats
    }

    pub fn tick(&mut self, now_ms: u64) -> TickOutcome {
        if self.state.is_at_least(ConnectionState::TransportUp) {
            self.transport.poll();
        }

        self.check_liveness();

        if self.state < ConnectionState::Ready {
            return if self.establish_connection() {
                TickOutcome::Connected
            } else {
                TickOutcome::Connecting
            };
        }

        let now_secs = self.clock.now_epoch_secs();
        if self.credential_needs_refresh(now_secs) {
            return self.refresh_credential(now_secs);
        }

        if !self.schedule.is_due(now_ms) {
            return TickOutcome::Idle;
        }

        self.publish_sample(now_ms)
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            info!(
                "connection state {} -> {}",
                self.state.as_str(),
                next.as_str()
            );
            self.state = next;
        }
    }

    fn check_liveness(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        if !self.network.is_connected() {
            warn!("network link lost");
            self.set_state(ConnectionState::Disconnected);
        } else if self.state.is_at_least(ConnectionState::TransportUp)
            && !self.transport.is_connected()
        {
            warn!("transport reported disconnected");
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn establish_connection(&mut self) -> bool {
        if self.state < ConnectionState::NetworkUp {
            if !self.connect_network() {
                return false;
            }
            self.set_state(ConnectionState::NetworkUp);
        }

        if self.state < ConnectionState::TransportUp {
            if !self.sync_time() {
                return false;
            }

            let now_secs = self.clock.now_epoch_secs();
            if self.credential_missing_or_stale(now_secs) && !self.issue_credential(now_secs) {
                return false;
            }

            if !self.connect_transport() {
                return false;
            }
            self.set_state(ConnectionState::TransportUp);
        }

        if !self.subscribe_commands() {
            return false;
        }
        self.set_state(ConnectionState::Ready);
        true
    }

    fn connect_network(&mut self) -> bool {
        let network = &mut self.network;
        let connected = retry_blocking(
            &self.config.retry,
            self.sleeper.as_mut(),
            "network connect",
            || network.connect(),
        );

        if connected.is_some() {
            self.stats.network_connects += 1;
            info!(
                "network connected, local address {}",
                self.network.local_address()
            );
            true
        } else {
            false
        }
    }

    fn sync_time(&mut self) -> bool {
        let time = &self.config.time;
        info!("synchronizing time using {}", time.ntp_servers.join(", "));
        if let Err(err) =
            self.clock
                .sync(&time.ntp_servers, time.utc_offset_secs, time.dst_offset_secs)
        {
            warn!("time sync request failed: {err}");
            return false;
        }

        let clock = &self.clock;
        let synced = retry_blocking(
            &self.config.retry,
            self.sleeper.as_mut(),
            "time sync",
            || {
                let now_epoch_secs = clock.now_epoch_secs();
                if now_epoch_secs > MIN_VALID_EPOCH_SECS {
                    Ok(now_epoch_secs)
                } else {
                    Err(LinkError::ClockNotSynced { now_epoch_secs })
                }
            },
        );

        match synced {
            Some(now_secs) => {
                match time.format_local(now_secs) {
                    Some(local) => info!("time initialized: {local}"),
                    None => info!("time initialized: epoch {now_secs}"),
                }
                true
            }
            None => false,
        }
    }

    fn credential_missing_or_stale(&self, now_secs: u64) -> bool {
        match &self.credential {
            None => true,
            Some(credential) => credential.needs_refresh(now_secs, self.config.refresh_margin_secs),
        }
    }

    fn credential_needs_refresh(&self, now_secs: u64) -> bool {
        self.credentials.is_refreshable() && self.credential_missing_or_stale(now_secs)
    }

    fn issue_credential(&mut self, now_secs: u64) -> bool {
        match self
            .credentials
            .generate(now_secs, self.config.token_duration_minutes)
        {
            Ok(credential) => {
                if let Some(expiry) = credential.expires_at_epoch_secs() {
                    debug!("issued credential valid until epoch {expiry}");
                }
                self.stats.credentials_issued += 1;
                self.credential = Some(credential);
                true
            }
            Err(err) => {
                error!("failed generating credential: {err}");
                false
            }
        }
    }

    fn connect_transport(&mut self) -> bool {
        let Some(credential) = self.credential.as_ref() else {
            return false;
        };
        let session = &self.config.session;
        let transport = &mut self.transport;

        info!(
            "connecting transport to {}:{} as `{}`",
            session.endpoint, session.port, session.client_id
        );
        let connected = retry_blocking(
            &self.config.retry,
            self.sleeper.as_mut(),
            "transport connect",
            || transport.connect(session, credential),
        );

        if connected.is_some() {
            self.stats.transport_connects += 1;
            true
        } else {
            false
        }
    }

    fn subscribe_commands(&mut self) -> bool {
        let Some(topic) = self.config.command_topic.as_deref() else {
            return true;
        };

        match self.transport.subscribe(topic, QoS::AtLeastOnce) {
            Ok(()) => {
                info!("subscribed for cloud-to-device messages on {topic}");
                true
            }
            Err(err) => {
                error!("could not subscribe for cloud-to-device messages: {err}");
                false
            }
        }
    }

    fn refresh_credential(&mut self, now_secs: u64) -> TickOutcome {
        info!(
            "credential expires within {}s, reconnecting with a new one",
            self.config.refresh_margin_secs
        );
        if !self.issue_credential(now_secs) {
            return TickOutcome::CredentialFailed;
        }

        if !self.connect_transport() {
            self.set_state(ConnectionState::NetworkUp);
        } else if !self.subscribe_commands() {
            self.set_state(ConnectionState::TransportUp);
        }

        TickOutcome::CredentialRefreshed
    }

    fn acquire_sample(&mut self) -> TelemetrySample {
        let temperature = self.sensor.read_temperature().filter(|value| value.is_finite());
        let humidity = self.sensor.read_humidity().filter(|value| value.is_finite());

        if temperature.is_none() {
            warn!("failed to read temperature from sensor");
            self.stats.sensor_failures += 1;
        }
        if humidity.is_none() {
            warn!("failed to read humidity from sensor");
            self.stats.sensor_failures += 1;
        }

        TelemetrySample {
            device_id: self.config.device_id.clone(),
            board_id: self.config.board_id,
            sequence_number: self.sequence_number,
            temperature: temperature.unwrap_or(0.0),
            humidity: humidity.unwrap_or(0.0),
            timestamp_epoch_secs: self.clock.now_epoch_secs(),
        }
    }

    fn publish_sample(&mut self, now_ms: u64) -> TickOutcome {
        let sample = self.acquire_sample();
        let sequence_number = sample.sequence_number;
        debug!(
            "sample #{sequence_number}: {:.1}C {:.1}% at {}",
            sample.temperature, sample.humidity, sample.timestamp_epoch_secs
        );

        let result = match sample.encode() {
            Ok(payload) => self
                .transport
                .publish(&self.config.telemetry_topic, &payload, QoS::AtLeastOnce, false)
                .map_err(|err| err.to_string()),
            Err(err) => Err(format!("failed to encode payload: {err}")),
        };

        let outcome = match result {
            Ok(()) => {
                info!(
                    "published telemetry #{sequence_number} to {}",
                    self.config.telemetry_topic
                );
                self.stats.published += 1;
                TickOutcome::Published { sequence_number }
            }
            Err(err) => {
                error!("failed publishing telemetry #{sequence_number}: {err}");
                self.stats.publish_failures += 1;
                TickOutcome::PublishFailed { sequence_number }
            }
        };

        self.sequence_number += 1;
        self.schedule.advance(now_ms);
        outcome
    }
}

/// Runs `op` until it succeeds or `policy` gives up, sleeping between tries.
fn retry_blocking<T, E: Display>(
    policy: &RetryPolicy,
    sleeper: &mut dyn Sleeper,
    what: &str,
    mut op: impl FnMut() -> Result<T, E>,
) -> Option<T> {
    let mut attempts = 0_u32;
    loop {
        attempts = attempts.saturating_add(1);
        match op() {
            Ok(value) => {
                if attempts > 1 {
                    info!("{what} succeeded on attempt {attempts}");
                }
                return Some(value);
            }
            Err(err) => warn!("{what} attempt {attempts} failed: {err}"),
        }

        if !policy.allows_retry(attempts) {
            warn!("{what} gave up after {attempts} attempt(s)");
            return None;
        }
        sleeper.sleep_ms(policy.delay_ms(attempts));
    }
}

fn log_inbound_message(message: &InboundMessage) {
    info!(
        "received [{}]: {} ({} bytes)",
        message.topic,
        String::from_utf8_lossy(&message.payload),
        message.payload.len()
    );
}
