mod connector;
mod manager;
mod monitor;

#[cfg(test)]
mod tests;

pub use connector::{Connector, MqttConnector, MqttSettings, Session};
pub use manager::{ConnectionManager, ReconnectPolicy};
pub use monitor::{ConnectionPhase, Inbox, LinkMonitor};

use rumqttc::{ConnectReturnCode, ConnectionError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub fn device_topic(device_sn: &str) -> String {
    format!("/app/device/property/{device_sn}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusalCause {
    Timeout,
    ProtocolMismatch,
    BadClientId,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
    Unknown,
}

impl RefusalCause {
    pub fn from_return_code(code: ConnectReturnCode) -> Option<Self> {
        match code {
            ConnectReturnCode::Success => None,
            ConnectReturnCode::RefusedProtocolVersion => Some(Self::ProtocolMismatch),
            ConnectReturnCode::BadClientId => Some(Self::BadClientId),
            ConnectReturnCode::ServiceUnavailable => Some(Self::ServerUnavailable),
            ConnectReturnCode::BadUserNamePassword => Some(Self::BadCredentials),
            ConnectReturnCode::NotAuthorized => Some(Self::NotAuthorized),
        }
    }

    pub fn from_connection_error(err: &ConnectionError) -> Self {
        match err {
            ConnectionError::ConnectionRefused(code) => {
                Self::from_return_code(*code).unwrap_or(Self::Unknown)
            }
            ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Self::Timeout,
            _ => Self::Unknown,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Timeout => "connection timed out",
            Self::ProtocolMismatch => "incorrect protocol version",
            Self::BadClientId => "invalid client identifier",
            Self::ServerUnavailable => "server unavailable",
            Self::BadCredentials => "bad username or password",
            Self::NotAuthorized => "not authorised",
            Self::Unknown => "another error occurred",
        }
    }
}

impl fmt::Display for RefusalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("broker refused connection: {0}")]
    Refused(RefusalCause),
    #[error("MQTT transport error ({cause}): {source}")]
    Transport {
        cause: RefusalCause,
        #[source]
        source: ConnectionError,
    },
    #[error("failed to subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },
    #[error("connect attempt did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("connect attempt aborted: {0}")]
    Aborted(String),
}

impl From<ConnectionError> for ConnectError {
    fn from(source: ConnectionError) -> Self {
        match source {
            ConnectionError::ConnectionRefused(code) => {
                Self::Refused(RefusalCause::from_return_code(code).unwrap_or(RefusalCause::Unknown))
            }
            source => Self::Transport {
                cause: RefusalCause::from_connection_error(&source),
                source,
            },
        }
    }
}
