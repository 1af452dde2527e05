pub mod collaborators;
pub mod config;
pub mod controller;
pub mod credential;
pub mod error;
pub mod topics;
pub mod types;

pub use collaborators::{
    MessageHandler, MessageTransport, NetworkLink, SensorSource, Sleeper, ThreadSleeper,
    TimeSource, TransportSession,
};
pub use config::{
    AuthConfig, BrokerKind, HubConfig, NetworkConfig, RetryPolicy, RuntimeConfig,
    TelemetryConfig, TimeConfig,
};
pub use controller::{
    Collaborators, ControllerConfig, TelemetryLoopController, TickOutcome, MIN_VALID_EPOCH_SECS,
};
pub use credential::{
    provider_for, CertificatePair, Credential, CredentialProvider, SasTokenProvider,
    StaticCertificateProvider,
};
pub use error::{ConfigError, CredentialError, LinkError, TransportError};
pub use topics::*;
pub use types::{
    ConnectionState, ControllerStats, InboundMessage, PublishSchedule, QoS, TelemetryPayload,
    TelemetrySample,
};
