use thiserror::Error;

/// Errors raised by the Modbus engine and the inverter protocol built on top of it.
///
/// Application glue converts these into `anyhow::Error` with `?`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid protocol id: {0}")]
    InvalidProtocolId(u16),

    #[error("invalid length: {0}")]
    InvalidLength(u16),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("a session is already running on this connection")]
    SessionActive,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("quantity {0} must be between 1 and 125")]
    InvalidQuantity(u16),

    #[error("response byte count {actual} does not match requested {expected}")]
    ByteCountMismatch { expected: usize, actual: usize },

    #[error("response data is empty")]
    EmptyResponse,

    #[error("response too short: got {actual} bytes, need at least {expected}")]
    ShortResponse { expected: usize, actual: usize },

    #[error("function {function:#04x} returned exception code {code:#04x}")]
    Exception { function: u8, code: u8 },

    #[error("login rejected with vendor code {code}")]
    LoginRejected { code: u8 },

    #[error("username of {0} bytes does not fit the login request")]
    UsernameTooLong(usize),

    #[error("invalid hmac key")]
    HmacKey,
}

impl Error {
    /// Framing and transport failures leave the byte stream in an unknown
    /// state; the connection has to be torn down and re-established.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidProtocolId(_)
                | Error::InvalidLength(_)
                | Error::Io(_)
                | Error::ConnectionClosed
        )
    }
}
