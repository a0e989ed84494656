//! Error type shared by every subsystem of the SDK core.

use std::net::IpAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Neither the virtual nor the native resolver knows the name.
    #[error("host not found: {0}")]
    HostNotFound(String),

    /// Reverse lookup miss.
    #[error("no host name for address {0}")]
    AddressNotFound(IpAddr),

    #[error("failed to install name service: {0}")]
    Install(String),

    #[error("unsupported environment: {0}")]
    UnsupportedEnvironment(String),

    /// No loaded context could satisfy the dial target. `attempts` carries
    /// one entry per context that was tried.
    #[error("service @[{target}] not available in any context ({} tried)", .attempts.len())]
    ServiceNotAvailable {
        target: String,
        attempts: Vec<DialAttempt>,
    },

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("enrollment failed: {0}")]
    Enrollment(String),

    #[error("context {0} has been removed")]
    ContextRemoved(String),

    #[error("no service matching {0} in context {1}")]
    NoMatchingService(String, String),

    #[error("dial rejected: {0}")]
    DialFailed(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("synthetic address space exhausted")]
    AddressSpaceExhausted,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// One failed per-context attempt recorded by the dial router.
#[derive(Debug, Clone)]
pub struct DialAttempt {
    pub context: String,
    pub reason: String,
}

impl std::fmt::Display for DialAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.context, self.reason)
    }
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::HostNotFound(_) | Error::AddressNotFound(_))
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(io) => io,
            Error::HostNotFound(_) | Error::AddressNotFound(_) => {
                std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string())
            }
            Error::ServiceNotAvailable { .. } => {
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, e.to_string())
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}
