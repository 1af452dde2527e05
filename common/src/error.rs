use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("device key is not valid base64: {0}")]
    InvalidKey(String),
    #[error("{0} is missing")]
    MissingCertificate(&'static str),
    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// Failures of the network link or the clock.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("network unavailable: {0}")]
    Unavailable(String),
    #[error("clock not synchronized (now={now_epoch_secs})")]
    ClockNotSynced { now_epoch_secs: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport connect failed: {0}")]
    Connect(String),
    #[error("transport is not connected")]
    NotConnected,
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("timed out after {0} ms")]
    Timeout(u64),
}
