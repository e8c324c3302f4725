use std::io;
use std::time::Duration;

/// Errors surfaced by the coordination primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Dial, read or write failure on the underlying socket.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// No reply arrived within the connection's read timeout.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection reset by server")]
    ConnectionReset,

    /// The store replied with a frame of an unexpected shape.
    #[error("protocol error; {0}")]
    Protocol(String),

    /// An error reply (`-ERR ...`) sent by the store.
    #[error("{0}")]
    Server(String),

    /// A nil reply where a value was required.
    #[error("nil reply")]
    Nil,

    #[error("key not found")]
    KeyNotFound,

    /// Release found no lock holding this token. It expired and was
    /// replaced, or it was already released.
    #[error("lock not found")]
    LockNotFound,

    #[error("unexpectedly deleted {deleted} keys while clearing lock for {key}")]
    LockInvariant { key: String, deleted: i64 },

    #[error("unexpected integer response: {0}")]
    UnexpectedInteger(i64),

    #[error("connection pool closed")]
    PoolClosed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("tls error: {0}")]
    Tls(String),

    #[error("invalid config: {0}")]
    Config(String),

    /// Error returned by a caller-supplied pub/sub callback.
    #[error("callback failed: {0}")]
    Callback(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn is_nil(&self) -> bool {
        matches!(self, Error::Nil)
    }

    /// `true` when the socket can no longer be trusted to be in sync with the
    /// store and must not go back into the pool.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Timeout(_) | Error::ConnectionReset | Error::Protocol(_)
        )
    }
}

impl From<String> for Error {
    fn from(src: String) -> Error {
        Error::Protocol(src)
    }
}

impl From<&str> for Error {
    fn from(src: &str) -> Error {
        src.to_string().into()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
