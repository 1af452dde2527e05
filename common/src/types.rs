use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    NetworkUp,
    TransportUp,
    Ready,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::NetworkUp => "NETWORK_UP",
            Self::TransportUp => "TRANSPORT_UP",
            Self::Ready => "READY",
        }
    }

    pub fn is_at_least(self, other: ConnectionState) -> bool {
        self >= other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

/// One reading, built fresh for every publish attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub device_id: String,
    pub board_id: i32,
    pub sequence_number: u64,
    pub temperature: f32,
    pub humidity: f32,
    pub timestamp_epoch_secs: u64,
}

/// Wire form of a [`TelemetrySample`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub id: i32,
    #[serde(rename = "msgCount")]
    pub msg_count: u64,
    pub temperature: f32,
    pub humidity: f32,
}

impl TelemetrySample {
    pub fn payload(&self) -> TelemetryPayload {
        TelemetryPayload {
            id: self.board_id,
            msg_count: self.sequence_number,
            temperature: self.temperature,
            humidity: self.humidity,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.payload())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishSchedule {
    pub next_due_ms: u64,
    pub interval_ms: u64,
}

impl PublishSchedule {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            next_due_ms: 0,
            interval_ms,
        }
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms >= self.next_due_ms
    }

    pub fn advance(&mut self, now_ms: u64) {
        self.next_due_ms = now_ms.saturating_add(self.interval_ms);
    }
}

/// Cloud-to-device message handed to the registered handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn payload_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.payload).ok()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControllerStats {
    pub published: u64,
    #[serde(rename = "publishFailures")]
    pub publish_failures: u64,
    #[serde(rename = "sensorFailures")]
    pub sensor_failures: u64,
    #[serde(rename = "networkConnects")]
    pub network_connects: u64,
    #[serde(rename = "transportConnects")]
    pub transport_connects: u64,
    #[serde(rename = "credentialsIssued")]
    pub credentials_issued: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn payload_uses_wire_field_names() {
        let sample = TelemetrySample {
            device_id: "sensor-01".to_string(),
            board_id: 1,
            sequence_number: 42,
            temperature: 23.5,
            humidity: 60.1,
            timestamp_epoch_secs: 1_700_000_000,
        };

        let encoded = String::from_utf8(sample.encode().unwrap()).unwrap();

        assert_eq!(
            encoded,
            r#"{"id":1,"msgCount":42,"temperature":23.5,"humidity":60.1}"#
        );
    }

    #[test]
    fn payload_values_survive_decoding() {
        let sample = TelemetrySample {
            device_id: "sensor-01".to_string(),
            board_id: 3,
            sequence_number: 7,
            temperature: 0.0,
            humidity: 48.25,
            timestamp_epoch_secs: 0,
        };

        let decoded: serde_json::Value = serde_json::from_slice(&sample.encode().unwrap()).unwrap();

        assert_eq!(decoded["id"], 3);
        assert_eq!(decoded["msgCount"], 7);
        assert_eq!(decoded["temperature"].as_f64(), Some(0.0));
        assert_eq!(decoded["humidity"].as_f64(), Some(48.25));
        assert!(decoded.get("device_id").is_none());
    }

    #[test]
    fn schedule_is_due_at_exact_deadline() {
        let mut schedule = PublishSchedule::new(5_000);
        schedule.next_due_ms = 10_000;

        assert!(!schedule.is_due(9_999));
        assert!(schedule.is_due(10_000));

        schedule.advance(10_000);
        assert_eq!(schedule.next_due_ms, 15_000);
    }

    #[test]
    fn connection_states_are_ordered() {
        assert!(ConnectionState::Ready.is_at_least(ConnectionState::TransportUp));
        assert!(ConnectionState::NetworkUp.is_at_least(ConnectionState::NetworkUp));
        assert!(!ConnectionState::Disconnected.is_at_least(ConnectionState::NetworkUp));
        assert_eq!(ConnectionState::TransportUp.as_str(), "TRANSPORT_UP");
    }
}
