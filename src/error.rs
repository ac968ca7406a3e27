//! Error types for the proxy dataplane.

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can cross a public API boundary.
///
/// Most per-connection failures never reach this type: they are resolved locally into a
/// half-close or a connection teardown (see the `conn` module). This enum exists for
/// construction-time failures and the reactor's top-level run loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O failure (bind, accept, socket option, non-blocking read/write).
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Reactor registration/poll failure.
    #[error("reactor error: {message}")]
    Reactor { message: String },

    /// Listener or target address could not be parsed or bound.
    #[error("network error: {message}")]
    Network { message: String },

    /// SOCKS negotiation failed in a way that has no recovery path.
    #[error("socks error: {message}")]
    Socks { message: String },

    /// Configuration file could not be loaded or failed validation.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// A `Protocol` implementation rejected the data it was given.
    #[error("protocol error: {message}")]
    Protocol { message: String },
}

impl Error {
    pub fn reactor<S: Into<String>>(message: S) -> Self {
        Self::Reactor { message: message.into() }
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network { message: message.into() }
    }

    pub fn socks<S: Into<String>>(message: S) -> Self {
        Self::Socks { message: message.into() }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }
}
