use thiserror::Error;

/// Shadowgate error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },

    /// AEAD open failed on a request record. Tampering, reordering, or a
    /// wrong PSK all land here.
    #[error("AEAD authentication failed")]
    AuthFailed,

    #[error("duplicate request salt")]
    DuplicateSalt,

    #[error("request timestamp {timestamp} outside the freshness window of server time {now}")]
    StaleTimestamp { timestamp: u64, now: u64 },

    #[error("unknown address type {0}")]
    UnknownAddressType(u8),

    #[error("invalid domain encoding")]
    InvalidDomainEncoding,

    #[error("request has neither padding nor initial payload")]
    NoInitialPayloadOrPadding,

    #[error("unexpected header type {got}, expected {expected}")]
    UnexpectedHeaderType { expected: u8, got: u8 },

    #[error("header truncated: needed {needed} bytes, got {got}")]
    TruncatedHeader { needed: usize, got: usize },

    #[error("cannot connect to remote {target}")]
    CantConnectToRemote { target: String },

    #[error("client closed the connection")]
    ClientDisconnected,

    #[error("remote closed the connection")]
    RemoteDisconnected,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new configuration error with source
    pub fn config_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get error code/category for external use
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "CONFIG",
            Self::Network { .. } => "NETWORK",
            Self::Io(_) => "IO",
            Self::Internal { .. } => "INTERNAL",
            Self::AuthFailed => "AUTH_FAILED",
            Self::DuplicateSalt => "DUPLICATE_SALT",
            Self::StaleTimestamp { .. } => "STALE_TIMESTAMP",
            Self::UnknownAddressType(_) => "UNKNOWN_ADDRESS_TYPE",
            Self::InvalidDomainEncoding => "INVALID_DOMAIN",
            Self::NoInitialPayloadOrPadding => "NO_PAYLOAD_OR_PADDING",
            Self::UnexpectedHeaderType { .. } => "UNEXPECTED_HEADER_TYPE",
            Self::TruncatedHeader { .. } => "TRUNCATED_HEADER",
            Self::CantConnectToRemote { .. } => "CANT_CONNECT",
            Self::ClientDisconnected => "CLIENT_DISCONNECTED",
            Self::RemoteDisconnected => "REMOTE_DISCONNECTED",
        }
    }

    /// Whether the session ended because a peer went away on its own.
    /// Peer closes get a graceful FIN teardown; every other session error
    /// closes the client abortively so it observes an RST.
    pub fn is_peer_close(&self) -> bool {
        match self {
            Self::ClientDisconnected | Self::RemoteDisconnected => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
