use thiserror::Error;
use wharf_protocol::ProtocolError;

/// Broker-internal errors. These never reach clients verbatim; the
/// dispatcher retries transport-level failures and maps terminal ones into
/// per-task error strings.
///
/// The enum is `Clone` because a single close cause fans out to every
/// pending call on a messenger.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The underlying socket failed; fatal for the connection.
    #[error("transport connection: {0}")]
    Connection(String),

    /// A frame or payload could not be (de)coded; fatal only when the frame
    /// type contradicts the negotiated subprotocol.
    #[error("transport codec: {0}")]
    Codec(String),

    /// The peer answered a request with an error string.
    #[error("remote: {0}")]
    Remote(String),

    /// A context was cancelled while waiting.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The messenger or provider is closing.
    #[error("closing: {0}")]
    Closing(String),

    /// No provider satisfies the task requirements.
    #[error("no suitable provider found")]
    NoCandidates,

    /// A submit attempt ran into its internal deadline.
    #[error("submit attempt timed out")]
    SubmitTimeout,

    /// Non-blocking run found the provider at capacity.
    #[error("no free capacity")]
    NoFreeCapacity,

    /// A task failed validation before dispatch.
    #[error("invalid task: {0}")]
    InvalidTask(String),
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Codec(e.to_string())
    }
}

impl Error {
    /// True when retrying on another provider could help: the failure was in
    /// the broker or the connection, not in the client's request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::Codec(_)
                | Error::Closing(_)
                | Error::NoCandidates
                | Error::SubmitTimeout
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
