use std::net::SocketAddr;

use thiserror::Error;

/// Unified error type for value access, wire handling and client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Traversal landed on the empty handle and a conversion was attempted
    #[error("No such field")]
    NoField,

    /// The stored type and the requested type have no defined conversion
    #[error("No conversion defined")]
    NoConvert,

    /// The server replied to an operation with a non-success status
    #[error("Remote error: {0}")]
    Remote(String),

    /// The channel underlying an operation left the Active state
    #[error("Channel disconnected")]
    Disconnected,

    /// Pseudo-error raised by the first `pop()` after a subscription
    /// (re)connects, so callers can observe transitions in-band
    #[error("Subscription connected to {0}")]
    Connected(SocketAddr),

    /// The subscription has completed normally; no more events will arrive
    #[error("Subscription finished")]
    Finished,

    /// Malformed or bounds-violating wire bytes; fatal to the connection
    #[error("Protocol violation: {0}")]
    Protocol(&'static str),

    /// `freeze()` was called on a tree with more than one owner
    #[error("Value storage is shared")]
    Aliased,

    /// The operation was cancelled before a result was delivered
    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the monitor queue sentinels which are states, not failures.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Error::Connected(_) | Error::Disconnected | Error::Finished
        )
    }
}
