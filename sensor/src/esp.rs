use core::convert::TryInto;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use dht_sensor::dht22;
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS as MqttQoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SntpConf, SyncStatus},
    tls::X509,
    wifi::{BlockingWifi, EspWifi},
};
use log::{error, info, warn};

use telemetry_common::{
    broker_uri, config::NetworkConfig, provider_for, AuthConfig, Collaborators,
    ControllerConfig, Credential, InboundMessage, LinkError, MessageHandler, MessageTransport,
    NetworkLink, QoS, RuntimeConfig, SensorSource, Sleeper, TelemetryLoopController, TimeSource,
    TransportError, TransportSession,
};

const NVS_NAMESPACE: &str = "telemetry";
const NVS_RUNTIME_KEY: &str = "runtime_json";

const DHT22_PIN: i32 = 4;
/// DHT22 cannot be sampled faster than this.
const DHT22_MIN_INTERVAL_MS: u64 = 2_000;

const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const MQTT_CONNECT_TIMEOUT_MS: u64 = 15_000;
const MQTT_CONNECT_POLL_MS: u64 = 100;
const MAX_INBOUND_QUEUE: usize = 16;
const MAX_MQTT_PAYLOAD_BYTES: usize = 4096;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = match nvs_store.load_runtime_config() {
        Ok(Some(runtime)) => runtime,
        Ok(None) => build_default_runtime(),
        Err(err) => {
            warn!("failed to load runtime config from NVS: {err:#}");
            build_default_runtime()
        }
    };
    ensure_build_defaults(&mut runtime);
    runtime.sanitize();

    if let Err(err) = runtime.validate() {
        halt(&format!("runtime configuration is incomplete: {err}"));
    }
    let credentials = match provider_for(&runtime.hub, &runtime.auth) {
        Ok(credentials) => credentials,
        Err(err) => halt(&format!("device credentials unavailable: {err}")),
    };

    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let sensor = match Dht22Sensor::new(pins.gpio4.downgrade()) {
        Ok(sensor) => sensor,
        Err(err) => halt(&format!("DHT22 on GPIO{DHT22_PIN} unavailable: {err:#}")),
    };
    let network = EspNetworkLink::new(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    info!(
        "telemetry sensor `{}` (board {}) -> {}:{}, auth={}",
        runtime.hub.device_id,
        runtime.hub.board_id,
        runtime.hub.host,
        runtime.hub.port,
        runtime.auth.mode_str()
    );

    let mut controller = TelemetryLoopController::new(
        ControllerConfig::from_runtime(&runtime),
        Collaborators {
            network: Box::new(network),
            clock: Box::new(EspClock::default()),
            transport: Box::new(EspMqttTransport::default()),
            sensor: Box::new(sensor),
            credentials,
            sleeper: Box::new(WatchdogSleeper),
        },
    );

    let tick = Duration::from_millis(runtime.telemetry.tick_ms);
    loop {
        feed_watchdog();
        controller.tick(monotonic_ms());
        thread::sleep(tick);
    }
}

/// Parks the main task for good. Used when the device cannot do anything
/// useful without reprovisioning.
fn halt(reason: &str) -> ! {
    error!("{reason}; halting");
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

struct EspNetworkLink {
    wifi: BlockingWifi<EspWifi<'static>>,
    ssid: String,
    power_save_disabled: bool,
}

impl EspNetworkLink {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
        network: &NetworkConfig,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
        let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

        let auth_method = if network.wifi_pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };

        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: network
                .wifi_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: network
                .wifi_pass
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;
        wifi.start()?;
        info!("wifi started, station for `{}`", network.wifi_ssid);

        Ok(Self {
            wifi,
            ssid: network.wifi_ssid.clone(),
            power_save_disabled: false,
        })
    }
}

impl NetworkLink for EspNetworkLink {
    fn connect(&mut self) -> Result<(), LinkError> {
        if self.is_connected() {
            return Ok(());
        }

        info!("connecting to wifi `{}`", self.ssid);
        let result = self
            .wifi
            .connect()
            .and_then(|()| self.wifi.wait_netif_up());
        if let Err(err) = result {
            let _ = self.wifi.disconnect();
            return Err(LinkError::Unavailable(format!("{err}")));
        }

        if !self.power_save_disabled {
            disable_wifi_power_save();
            self.power_save_disabled = true;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn local_address(&self) -> String {
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .map(|info| info.ip.to_string())
            .unwrap_or_else(|err| format!("unknown ({err})"))
    }
}

#[derive(Default)]
struct EspClock {
    sntp: Option<EspSntp<'static>>,
}

impl TimeSource for EspClock {
    fn sync(
        &mut self,
        servers: &[String],
        _utc_offset_secs: i32,
        _dst_offset_secs: i32,
    ) -> Result<(), LinkError> {
        if let Some(sntp) = self.sntp.as_ref() {
            if sntp.get_sync_status() == SyncStatus::Completed {
                return Ok(());
            }
        }

        let mut conf = SntpConf::default();
        for (slot, server) in conf.servers.iter_mut().zip(servers) {
            *slot = server.as_str();
        }

        // Drop the previous client first; only one SNTP service may run.
        self.sntp = None;
        let sntp = EspSntp::new(&conf)
            .map_err(|err| LinkError::Unavailable(format!("failed to start SNTP: {err}")))?;
        self.sntp = Some(sntp);
        info!("SNTP started");
        Ok(())
    }

    fn now_epoch_secs(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
    }
}

#[derive(Default)]
struct MqttShared {
    connected: AtomicBool,
    inbox: Mutex<VecDeque<InboundMessage>>,
}

impl MqttShared {
    fn push(&self, message: InboundMessage) {
        let mut inbox = self
            .inbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if inbox.len() >= MAX_INBOUND_QUEUE {
            warn!("inbound queue full, dropping oldest message");
            inbox.pop_front();
        }
        inbox.push_back(message);
    }

    fn drain(&self) -> Vec<InboundMessage> {
        self.inbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect()
    }
}

#[derive(Default)]
struct EspMqttTransport {
    client: Option<EspMqttClient<'static>>,
    /// Fresh per session so a stale receiver thread cannot flip the flag.
    shared: Arc<MqttShared>,
    handler: Option<MessageHandler>,
    /// PEM buffers handed to ESP-IDF must outlive every session.
    pems: Vec<(String, &'static [u8])>,
}

impl EspMqttTransport {
    fn static_pem(&mut self, pem: &str) -> &'static [u8] {
        if let Some((_, bytes)) = self.pems.iter().find(|(source, _)| source == pem) {
            return *bytes;
        }
        let bytes: &'static [u8] = Box::leak(format!("{pem}\0").into_bytes().into_boxed_slice());
        self.pems.push((pem.to_string(), bytes));
        bytes
    }
}

impl MessageTransport for EspMqttTransport {
    fn connect(
        &mut self,
        session: &TransportSession,
        credential: &Credential,
    ) -> Result<(), TransportError> {
        self.client = None;
        self.shared = Arc::new(MqttShared::default());

        let server_certificate = session
            .ca_pem
            .as_deref()
            .map(|ca| X509::pem_until_nul(self.static_pem(ca)));
        let (client_certificate, private_key) = match credential.certificate() {
            Some(pair) => (
                Some(X509::pem_until_nul(self.static_pem(&pair.cert_pem))),
                Some(X509::pem_until_nul(self.static_pem(&pair.key_pem))),
            ),
            None => (None, None),
        };
        let use_bundle = session.use_tls && server_certificate.is_none();

        let conf = MqttClientConfiguration {
            client_id: Some(session.client_id.as_str()),
            username: if session.username.is_empty() {
                None
            } else {
                Some(session.username.as_str())
            },
            password: credential.password(),
            keep_alive_interval: Some(Duration::from_secs(session.keep_alive_secs)),
            crt_bundle_attach: if use_bundle {
                Some(esp_idf_svc::sys::esp_crt_bundle_attach)
            } else {
                None
            },
            server_certificate,
            client_certificate,
            private_key,
            ..Default::default()
        };

        let url = broker_uri(&session.endpoint, session.port, session.use_tls);
        let (client, connection) = EspMqttClient::new(&url, &conf)
            .map_err(|err| TransportError::Connect(format!("{err}")))?;
        spawn_mqtt_receiver(connection, self.shared.clone())
            .map_err(|err| TransportError::Connect(format!("{err}")))?;
        self.client = Some(client);

        let deadline = Instant::now() + Duration::from_millis(MQTT_CONNECT_TIMEOUT_MS);
        while !self.shared.connected.load(Ordering::Relaxed) {
            if Instant::now() >= deadline {
                self.client = None;
                return Err(TransportError::Timeout(MQTT_CONNECT_TIMEOUT_MS));
            }
            feed_watchdog();
            thread::sleep(Duration::from_millis(MQTT_CONNECT_POLL_MS));
        }

        info!("mqtt session established with {url}");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.shared.connected.load(Ordering::Relaxed)
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        let client = self.client.as_mut().ok_or(TransportError::NotConnected)?;
        client
            .publish(topic, to_mqtt_qos(qos), retain, payload)
            .map(|_| ())
            .map_err(|err| TransportError::Publish(format!("{err}")))
    }

    fn subscribe(&mut self, topic_filter: &str, qos: QoS) -> Result<(), TransportError> {
        let client = self.client.as_mut().ok_or(TransportError::NotConnected)?;
        client
            .subscribe(topic_filter, to_mqtt_qos(qos))
            .map(|_| ())
            .map_err(|err| TransportError::Subscribe(format!("{err}")))
    }

    fn on_message(&mut self, handler: MessageHandler) {
        self.handler = Some(handler);
    }

    fn poll(&mut self) {
        let messages = self.shared.drain();
        let Some(handler) = self.handler.as_mut() else {
            return;
        };
        for message in &messages {
            handler(message);
        }
    }
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    shared: Arc<MqttShared>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            while let Ok(event) = conn.next() {
                match event.payload() {
                    EventPayload::Connected(_) => shared.connected.store(true, Ordering::Relaxed),
                    EventPayload::Disconnected => {
                        warn!("mqtt disconnected");
                        shared.connected.store(false, Ordering::Relaxed);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }
                        shared.push(InboundMessage::new(topic, data));
                    }
                    EventPayload::Error(err) => warn!("mqtt error event: {err:?}"),
                    _ => {}
                }
            }
            shared.connected.store(false, Ordering::Relaxed);
            info!("mqtt receiver stopped");
        })?;
    Ok(())
}

fn to_mqtt_qos(qos: QoS) -> MqttQoS {
    match qos {
        QoS::AtMostOnce => MqttQoS::AtMostOnce,
        QoS::AtLeastOnce => MqttQoS::AtLeastOnce,
    }
}

struct Dht22Sensor {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
    /// Last attempt and its reading, if it succeeded.
    last: Option<(Instant, Option<(f32, f32)>)>,
}

impl Dht22Sensor {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;

        Ok(Self {
            pin,
            delay: Ets,
            last: None,
        })
    }

    fn sample(&mut self) -> Option<(f32, f32)> {
        if let Some((at, reading)) = self.last {
            if at.elapsed() < Duration::from_millis(DHT22_MIN_INTERVAL_MS) {
                return reading;
            }
        }

        let reading = self.read_now();
        self.last = Some((Instant::now(), reading));
        reading
    }

    fn read_now(&mut self) -> Option<(f32, f32)> {
        if let Err(err) = self.pin.set_high() {
            warn!("failed to set DHT22 line high before read: {err:?}");
            return None;
        }

        match dht22::blocking::read(&mut self.delay, &mut self.pin) {
            Ok(reading) => {
                info!(
                    "[DHT22] Temperature: {:.1}°C Humidity: {:.1}%",
                    reading.temperature, reading.relative_humidity
                );
                Some((reading.temperature, reading.relative_humidity))
            }
            Err(err) => {
                warn!("failed to read DHT22 on GPIO{}: {err:?}", DHT22_PIN);
                None
            }
        }
    }
}

impl SensorSource for Dht22Sensor {
    fn read_temperature(&mut self) -> Option<f32> {
        self.sample().map(|(temperature, _)| temperature)
    }

    fn read_humidity(&mut self) -> Option<f32> {
        self.sample().map(|(_, humidity)| humidity)
    }
}

/// Sleeps in one second slices so long connect backoffs keep the task
/// watchdog fed.
struct WatchdogSleeper;

impl Sleeper for WatchdogSleeper {
    fn sleep_ms(&mut self, ms: u64) {
        let mut remaining = ms;
        while remaining > 0 {
            feed_watchdog();
            let slice = remaining.min(1_000);
            thread::sleep(Duration::from_millis(slice));
            remaining -= slice;
        }
        feed_watchdog();
    }
}

struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<Option<RuntimeConfig>> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(Some(serde_json::from_str::<RuntimeConfig>(value)?)),
            None => Ok(None),
        }
    }
}

fn build_default_runtime() -> RuntimeConfig {
    let mut runtime = RuntimeConfig::default();
    if let Some(board_id) = option_env!("IOT_BOARD_ID").and_then(|value| value.parse().ok()) {
        runtime.hub.board_id = board_id;
    }
    if let Some(port) = option_env!("IOT_HUB_PORT").and_then(|value| value.parse().ok()) {
        runtime.hub.port = port;
    }
    runtime
}

fn ensure_build_defaults(runtime: &mut RuntimeConfig) {
    fill_if_empty(&mut runtime.network.wifi_ssid, option_env!("WIFI_SSID"));
    fill_if_empty(&mut runtime.network.wifi_pass, option_env!("WIFI_PASS"));
    fill_if_empty(&mut runtime.hub.host, option_env!("IOT_HUB_HOST"));
    fill_if_empty(&mut runtime.hub.device_id, option_env!("IOT_DEVICE_ID"));

    if let AuthConfig::SasToken { device_key, .. } = &mut runtime.auth {
        fill_if_empty(device_key, option_env!("IOT_DEVICE_KEY"));
    }
}

fn fill_if_empty(field: &mut String, build_value: Option<&str>) {
    if field.trim().is_empty() {
        if let Some(value) = build_value {
            *field = value.to_string();
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
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
