use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, topics::DEFAULT_MQTTS_PORT};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    AzureIotHub,
    Generic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    pub device_id: String,
    pub board_id: i32,
    pub use_tls: bool,
    pub keep_alive_secs: u64,
    pub broker: BrokerKind,
    /// Only used by generic brokers; the hub derives its own.
    pub username: String,
    /// PEM of the broker CA; platform trust store when absent.
    pub ca_pem: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_MQTTS_PORT,
            device_id: String::new(),
            board_id: 0,
            use_tls: true,
            keep_alive_secs: 240,
            broker: BrokerKind::AzureIotHub,
            username: String::new(),
            ca_pem: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthConfig {
    SasToken {
        device_key: String,
        token_duration_minutes: u32,
        refresh_margin_secs: u64,
    },
    Certificate {
        cert_pem: String,
        key_pem: String,
    },
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::SasToken {
            device_key: String::new(),
            token_duration_minutes: 60,
            refresh_margin_secs: 30,
        }
    }
}

impl AuthConfig {
    pub fn mode_str(&self) -> &'static str {
        match self {
            Self::SasToken { .. } => "sas_token",
            Self::Certificate { .. } => "certificate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub interval_ms: u64,
    pub tick_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            tick_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeConfig {
    pub ntp_servers: Vec<String>,
    pub utc_offset_secs: i32,
    pub dst_offset_secs: i32,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            ntp_servers: vec!["pool.ntp.org".to_string(), "time.nist.gov".to_string()],
            utc_offset_secs: 9 * 3600,
            dst_offset_secs: 0,
        }
    }
}

impl TimeConfig {
    pub fn local_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_secs.saturating_add(self.dst_offset_secs))
    }

    /// Renders `epoch_secs` in the configured local zone, e.g. `2023 Nov 15 Wed, 07:13:20`.
    pub fn format_local(&self, epoch_secs: u64) -> Option<String> {
        let offset = self.local_offset()?;
        let utc = DateTime::from_timestamp(i64::try_from(epoch_secs).ok()?, 0)?;
        Some(
            utc.with_timezone(&offset)
                .format("%Y %b %d %a, %H:%M:%S")
                .to_string(),
        )
    }
}

/// Bound and pacing for the blocking connect/sync waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// `None` keeps retrying until success.
    pub max_attempts: Option<u32>,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff_ms,
            max_backoff_ms: backoff_ms.saturating_mul(8),
        }
    }

    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        self.max_attempts
            .map(|max| attempts_made < max)
            .unwrap_or(true)
    }

    pub fn delay_ms(&self, attempts_made: u32) -> u64 {
        let shift = attempts_made.saturating_sub(1).min(16);
        self.backoff_ms
            .saturating_mul(1_u64 << shift)
            .min(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    pub hub: HubConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub time: TimeConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.telemetry.interval_ms = self.telemetry.interval_ms.max(1_000);
        self.telemetry.tick_ms = self.telemetry.tick_ms.clamp(10, 1_000);
        self.hub.keep_alive_secs = self.hub.keep_alive_secs.clamp(30, 1_200);

        if self.hub.port == 0 {
            self.hub.port = DEFAULT_MQTTS_PORT;
        }

        if let AuthConfig::SasToken {
            token_duration_minutes,
            refresh_margin_secs,
            ..
        } = &mut self.auth
        {
            *token_duration_minutes = (*token_duration_minutes).clamp(1, 1_440);
            let duration_secs = u64::from(*token_duration_minutes) * 60;
            if *refresh_margin_secs >= duration_secs {
                *refresh_margin_secs = duration_secs / 2;
            }
        }

        self.retry.backoff_ms = self.retry.backoff_ms.max(10);
        self.retry.max_backoff_ms = self.retry.max_backoff_ms.max(self.retry.backoff_ms);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hub.host.trim().is_empty() {
            return Err(ConfigError::Empty { field: "hub.host" });
        }
        if self.hub.device_id.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "hub.device_id",
            });
        }
        if self.hub.broker == BrokerKind::Generic
            && self.hub.use_tls
            && self.hub.ca_pem.is_none()
            && matches!(self.auth, AuthConfig::Certificate { .. })
        {
            return Err(ConfigError::Invalid {
                field: "hub.ca_pem",
                reason: "required for certificate auth against a generic broker".to_string(),
            });
        }
        if self.time.ntp_servers.is_empty() {
            return Err(ConfigError::Empty {
                field: "time.ntp_servers",
            });
        }

        match &self.auth {
            AuthConfig::SasToken { device_key, .. } => {
                if device_key.trim().is_empty() {
                    return Err(ConfigError::Empty {
                        field: "auth.device_key",
                    });
                }
                if self.hub.broker == BrokerKind::Generic {
                    return Err(ConfigError::Invalid {
                        field: "auth.mode",
                        reason: "SAS tokens are only issued by Azure IoT Hub".to_string(),
                    });
                }
            }
            AuthConfig::Certificate { cert_pem, key_pem } => {
                if cert_pem.trim().is_empty() {
                    return Err(ConfigError::Empty {
                        field: "auth.cert_pem",
                    });
                }
                if key_pem.trim().is_empty() {
                    return Err(ConfigError::Empty {
                        field: "auth.key_pem",
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn valid_config() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.hub.host = "myhub.azure-devices.net".to_string();
        config.hub.device_id = "sensor-01".to_string();
        config.auth = AuthConfig::SasToken {
            device_key: "MDEyMzQ1Njc4OWFiY2RlZg==".to_string(),
            token_duration_minutes: 60,
            refresh_margin_secs: 30,
        };
        config
    }

    #[test]
    fn minimal_json_takes_defaults() {
        let raw = r#"{"hub":{"host":"h","port":8883,"device_id":"d","board_id":2,
            "use_tls":true,"keep_alive_secs":240,"broker":"azure_iot_hub"}}"#;
        let config: RuntimeConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.telemetry.interval_ms, 5_000);
        assert_eq!(config.time, TimeConfig::default());
        assert_eq!(config.retry.max_attempts, None);
        assert_eq!(config.auth.mode_str(), "sas_token");
        assert_eq!(config.hub.board_id, 2);
    }

    #[test]
    fn hub_section_with_identity_only_takes_defaults() {
        let raw = r#"{"hub":{"host":"myhub.azure-devices.net","device_id":"sensor-01"},
            "auth":{"mode":"sas_token","device_key":"a2V5",
            "token_duration_minutes":60,"refresh_margin_secs":30}}"#;
        let config: RuntimeConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.hub.host, "myhub.azure-devices.net");
        assert_eq!(config.hub.port, 8883);
        assert_eq!(config.hub.board_id, 0);
        assert!(config.hub.use_tls);
        assert_eq!(config.hub.keep_alive_secs, 240);
        assert_eq!(config.hub.broker, BrokerKind::AzureIotHub);
        assert_eq!(config.hub.ca_pem, None);
        assert_eq!(config.auth.mode_str(), "sas_token");
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn auth_mode_is_tagged() {
        let raw = r#"{"mode":"certificate","cert_pem":"C","key_pem":"K"}"#;
        let auth: AuthConfig = serde_json::from_str(raw).unwrap();

        assert!(matches!(auth, AuthConfig::Certificate { .. }));
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut config = valid_config();
        config.telemetry.interval_ms = 10;
        config.telemetry.tick_ms = 0;
        config.hub.keep_alive_secs = 5;
        config.auth = AuthConfig::SasToken {
            device_key: "a2V5".to_string(),
            token_duration_minutes: 1,
            refresh_margin_secs: 600,
        };

        config.sanitize();

        assert_eq!(config.telemetry.interval_ms, 1_000);
        assert_eq!(config.telemetry.tick_ms, 10);
        assert_eq!(config.hub.keep_alive_secs, 30);
        match config.auth {
            AuthConfig::SasToken {
                refresh_margin_secs,
                ..
            } => assert_eq!(refresh_margin_secs, 30),
            AuthConfig::Certificate { .. } => panic!("auth mode changed"),
        }
    }

    #[test]
    fn validate_rejects_missing_identity() {
        let mut config = valid_config();
        assert_eq!(config.validate(), Ok(()));

        config.hub.device_id = " ".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::Empty {
                field: "hub.device_id"
            })
        );
    }

    #[test]
    fn validate_rejects_empty_certificate() {
        let mut config = valid_config();
        config.auth = AuthConfig::Certificate {
            cert_pem: "-----BEGIN CERTIFICATE-----".to_string(),
            key_pem: String::new(),
        };

        assert_eq!(
            config.validate(),
            Err(ConfigError::Empty {
                field: "auth.key_pem"
            })
        );
    }

    #[test]
    fn formats_local_time_with_offsets() {
        let time = TimeConfig {
            utc_offset_secs: 9 * 3600,
            dst_offset_secs: 3600,
            ..TimeConfig::default()
        };

        assert_eq!(
            time.format_local(1_700_000_000).as_deref(),
            Some("2023 Nov 15 Wed, 08:13:20")
        );
        assert_eq!(
            TimeConfig {
                utc_offset_secs: 100_000,
                ..TimeConfig::default()
            }
            .local_offset(),
            None
        );
    }

    #[test]
    fn retry_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_attempts: Some(5),
            backoff_ms: 100,
            max_backoff_ms: 350,
        };

        assert_eq!(policy.delay_ms(1), 100);
        assert_eq!(policy.delay_ms(2), 200);
        assert_eq!(policy.delay_ms(3), 350);
        assert!(policy.allows_retry(4));
        assert!(!policy.allows_retry(5));
        assert!(RetryPolicy::default().allows_retry(u32::MAX));
    }
}
