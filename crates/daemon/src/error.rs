//! Error types for the registry, resolver and punching session.
//!
//! Each concern gets its own enum so the driver can decide whether a failure
//! is fatal to the process or only to the current attempt. [`ErrorKind`] is
//! the coarse, matchable classification shared by all of them.

use std::io;

/// Coarse error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing configuration
    Config,
    /// Public address lookup failed
    Resolution,
    /// Registry has no record for the requested id
    NotFound,
    /// Talking to the registry failed
    Transport,
    /// Bind, send or receive on the punching socket failed
    Socket,
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}

/// Public address resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("address echo request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("address echo service returned HTTP {0}")]
    Status(u16),

    #[error("failed to parse address echo response: {0}")]
    Parse(String),

    #[error("address echo service returned an empty ip")]
    Empty,

    #[error("not a valid ip address: {0}")]
    InvalidIp(String),

    #[error("unsupported address family: {0}")]
    Unsupported(String),

    #[error("STUN discovery failed: {0}")]
    Stun(String),
}

impl ResolveError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Resolution
    }
}

/// Errors returned by the registry client.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("peer not found: {0}")]
    NotFound(String),

    #[error("registry request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("registry rejected request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("registry returned an invalid address: {0}")]
    InvalidAddress(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::NotFound(_) => ErrorKind::NotFound,
            RegistryError::Transport(_)
            | RegistryError::Rejected { .. }
            | RegistryError::InvalidAddress(_) => ErrorKind::Transport,
        }
    }
}

/// Errors that end a single punching attempt. None of these are fatal to the
/// process.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("peer lookup failed: {0}")]
    Lookup(#[from] RegistryError),

    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect UDP socket to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),

    #[error("keepalive send failed: {0}")]
    Send(#[source] io::Error),

    #[error("keepalive task aborted: {0}")]
    KeepaliveJoin(String),

    #[error("failed to encode punch message: {0}")]
    Protocol(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Lookup(e) => e.kind(),
            _ => ErrorKind::Socket,
        }
    }
}

/// Failures while bringing the agent up. These abort the process.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to resolve external address: {0}")]
    Resolve(#[from] ResolveError),

    #[error("failed to bind local UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to register with registry: {0}")]
    Register(#[from] RegistryError),
}

impl StartupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StartupError::Config(_) => ErrorKind::Config,
            StartupError::Resolve(_) => ErrorKind::Resolution,
            StartupError::Bind { .. } => ErrorKind::Socket,
            StartupError::Register(e) => e.kind(),
        }
    }
}
