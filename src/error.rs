//! Error types for relayd.
//!
//! Construction paths (binding a listener, parsing configuration, building
//! a TLS context) return `Result<T, Error>`. Once a [`crate::connection::Connection`]
//! exists, its internal transitions never propagate an error outward: they
//! resolve to a log line and a state transition instead, matching the
//! reactor's "the state machine never throws" contract.

/// Result type alias for relayd operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories surfaced by relayd's construction paths.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O operation errors (sockets, pipes, files).
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// TLS context or session errors.
    #[error("TLS error: {message}")]
    Tls { message: String },

    /// Configuration errors (bad tunnel spec, missing cert/key pair).
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Reactor-state errors (registration on a closed loop, double init).
    #[error("reactor error: {message}")]
    Reactor { message: String },

    /// Resource exhaustion (worker queue full, fd table, allocation).
    #[error("resource exhausted: {resource}")]
    Resource { resource: String },

    /// Anything else, with context.
    #[error("{message}")]
    Other { message: String },
}

impl Error {
    /// Build a [`Error::Tls`] from a message.
    pub fn tls<S: Into<String>>(message: S) -> Self {
        Self::Tls { message: message.into() }
    }

    /// Build a [`Error::Config`] from a message.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    /// Build a [`Error::Reactor`] from a message.
    pub fn reactor<S: Into<String>>(message: S) -> Self {
        Self::Reactor { message: message.into() }
    }

    /// Build a [`Error::Resource`] from a message.
    pub fn resource<S: Into<String>>(resource: S) -> Self {
        Self::Resource { resource: resource.into() }
    }

    /// Build a [`Error::Other`] from a message.
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other { message: message.into() }
    }

    /// Category name, used in log lines so operators can grep by kind.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::Tls { .. } => "tls",
            Self::Config { .. } => "config",
            Self::Reactor { .. } => "reactor",
            Self::Resource { .. } => "resource",
            Self::Other { .. } => "other",
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(source: rustls::Error) -> Self {
        Error::Tls { message: source.to_string() }
    }
}
