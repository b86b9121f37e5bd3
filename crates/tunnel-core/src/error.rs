use thiserror::Error;

/// Errors produced by the tunnel protocol layer.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// A `Connect()` call observed a status other than `Created`.
    #[error("already connected")]
    AlreadyConnected,

    /// A `Disconnect()` call observed a status other than `Connected`.
    #[error("not connected")]
    NotConnected,

    /// Dialing a peer exceeded the dial timeout.
    #[error("dial {0} timed out")]
    DialTimeout(String),

    /// Dialing a peer was refused (ECONNREFUSED or equivalent).
    #[error("dial {0} refused: {1}")]
    DialRefused(String, String),

    /// Malformed JSON on the A-control stream.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
