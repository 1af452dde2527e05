pub const HUB_API_VERSION: &str = "2020-09-30";
pub const DEVICE_CLIENT_TYPE: &str = concat!("rust%2F", env!("CARGO_PKG_VERSION"), "(esp32)");

pub const DEFAULT_MQTTS_PORT: u16 = 8883;

pub fn telemetry_topic(device_id: &str) -> String {
    format!("devices/{device_id}/messages/events/")
}

/// Telemetry topic with an url-encoded property bag appended.
pub fn telemetry_topic_with_properties(device_id: &str, properties: &[(&str, &str)]) -> String {
    let mut topic = telemetry_topic(device_id);
    let bag = properties
        .iter()
        .map(|(key, value)| format!("{}={}", url_encode(key), url_encode(value)))
        .collect::<Vec<_>>()
        .join("&");
    topic.push_str(&bag);
    topic
}

pub fn c2d_subscribe_topic(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/#")
}

pub fn hub_username(host: &str, device_id: &str) -> String {
    format!(
        "{host}/{device_id}/?api-version={HUB_API_VERSION}&DeviceClientType={DEVICE_CLIENT_TYPE}"
    )
}

pub fn broker_uri(host: &str, port: u16, use_tls: bool) -> String {
    let scheme = if use_tls { "mqtts" } else { "mqtt" };
    format!("{scheme}://{host}:{port}")
}

/// Percent-encodes everything except RFC 3986 unreserved characters.
pub fn url_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => {
                use core::fmt::Write as _;
                let _ = write!(&mut encoded, "%{byte:02X}");
            }
        }
    }
    encoded
}
