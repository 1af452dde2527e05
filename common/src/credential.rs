use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{
    config::{AuthConfig, HubConfig},
    error::CredentialError,
    topics::url_encode,
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePair {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Broker credential. Replaced wholesale on refresh, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    SasToken {
        token: String,
        expires_at_epoch_secs: u64,
    },
    Certificate(CertificatePair),
}

impl Credential {
    /// MQTT password carried by this credential, if any.
    pub fn password(&self) -> Option<&str> {
        match self {
            Self::SasToken { token, .. } => Some(token.as_str()),
            Self::Certificate(_) => None,
        }
    }

    pub fn certificate(&self) -> Option<&CertificatePair> {
        match self {
            Self::SasToken { .. } => None,
            Self::Certificate(pair) => Some(pair),
        }
    }

    pub fn expires_at_epoch_secs(&self) -> Option<u64> {
        match self {
            Self::SasToken {
                expires_at_epoch_secs,
                ..
            } => Some(*expires_at_epoch_secs),
            Self::Certificate(_) => None,
        }
    }

    pub fn is_expired(&self, now_epoch_secs: u64) -> bool {
        self.needs_refresh(now_epoch_secs, 0)
    }

    pub fn needs_refresh(&self, now_epoch_secs: u64, margin_secs: u64) -> bool {
        self.expires_at_epoch_secs()
            .map(|expiry| now_epoch_secs.saturating_add(margin_secs) >= expiry)
            .unwrap_or(false)
    }
}

pub trait CredentialProvider {
    fn generate(
        &mut self,
        now_epoch_secs: u64,
        duration_minutes: u32,
    ) -> Result<Credential, CredentialError>;

    /// Whether issued credentials expire and must be regenerated.
    fn is_refreshable(&self) -> bool;
}

/// Issues Azure IoT Hub shared access signatures from a device key.
pub struct SasTokenProvider {
    resource_uri: String,
    key: Vec<u8>,
}

impl SasTokenProvider {
    pub fn new(
        hub_host: &str,
        device_id: &str,
        device_key_base64: &str,
    ) -> Result<Self, CredentialError> {
        let key = STANDARD
            .decode(device_key_base64.trim())
            .map_err(|err| CredentialError::InvalidKey(err.to_string()))?;
        if key.is_empty() {
            return Err(CredentialError::InvalidKey("key is empty".to_string()));
        }

        Ok(Self {
            resource_uri: format!("{hub_host}/devices/{device_id}"),
            key,
        })
    }

    fn sign(&self, string_to_sign: &str) -> Result<String, CredentialError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|err| CredentialError::Signing(err.to_string()))?;
        mac.update(string_to_sign.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

impl CredentialProvider for SasTokenProvider {
    fn generate(
        &mut self,
        now_epoch_secs: u64,
        duration_minutes: u32,
    ) -> Result<Credential, CredentialError> {
        let expiry = now_epoch_secs.saturating_add(u64::from(duration_minutes) * 60);
        let encoded_resource = url_encode(&self.resource_uri);
        let signature = self.sign(&format!("{encoded_resource}\n{expiry}"))?;

        Ok(Credential::SasToken {
            token: format!(
                "SharedAccessSignature sr={encoded_resource}&sig={}&se={expiry}",
                url_encode(&signature)
            ),
            expires_at_epoch_secs: expiry,
        })
    }

    fn is_refreshable(&self) -> bool {
        true
    }
}

/// Hands out a fixed client certificate; nothing to refresh.
pub struct StaticCertificateProvider {
    pair: CertificatePair,
}

impl StaticCertificateProvider {
    pub fn new(cert_pem: String, key_pem: String) -> Result<Self, CredentialError> {
        if cert_pem.trim().is_empty() {
            return Err(CredentialError::MissingCertificate("device certificate"));
        }
        if key_pem.trim().is_empty() {
            return Err(CredentialError::MissingCertificate("device private key"));
        }

        Ok(Self {
            pair: CertificatePair { cert_pem, key_pem },
        })
    }
}

impl CredentialProvider for StaticCertificateProvider {
    fn generate(
        &mut self,
        _now_epoch_secs: u64,
        _duration_minutes: u32,
    ) -> Result<Credential, CredentialError> {
        Ok(Credential::Certificate(self.pair.clone()))
    }

    fn is_refreshable(&self) -> bool {
        false
    }
}

/// Picks the provider matching the configured auth mode.
pub fn provider_for(
    hub: &HubConfig,
    auth: &AuthConfig,
) -> Result<Box<dyn CredentialProvider>, CredentialError> {
    match auth {
        AuthConfig::SasToken { device_key, .. } => Ok(Box::new(SasTokenProvider::new(
            &hub.host,
            &hub.device_id,
            device_key,
        )?)),
        AuthConfig::Certificate { cert_pem, key_pem } => Ok(Box::new(
            StaticCertificateProvider::new(cert_pem.clone(), key_pem.clone())?,
        )),
    }
}
