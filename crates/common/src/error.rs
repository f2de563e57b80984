use thiserror::Error;

/// Canonical NBX error taxonomy used across crates.
///
/// Classification guidance:
/// - [`NbxError::ProducerFault`]: the batch producer (thread or native engine) failed
/// - [`NbxError::ProtocolViolation`]: a cursor, channel or frame reader was used out of contract
/// - [`NbxError::FramingCorruption`]: a framed byte stream cannot be parsed any further
/// - [`NbxError::ResourcesExhausted`]: a memory reservation exceeded the pool budget
/// - [`NbxError::Execution`]: Arrow FFI, IPC or row-conversion failures
/// - [`NbxError::InvalidConfig`]: config values or C ABI arguments are unusable
/// - [`NbxError::Io`]: raw IO failures from std APIs
///
/// None of these are retried internally; they surface to the caller of the
/// operation that detected them.
#[derive(Debug, Error)]
pub enum NbxError {
    /// Failure raised on the producer side and re-raised on the consumer.
    ///
    /// Examples:
    /// - native stream returned an error while publishing a batch
    /// - producer thread panicked or exited without answering a request
    #[error("producer fault: {0}")]
    ProducerFault(String),

    /// Out-of-contract use of a cursor or channel; indicates a caller bug.
    ///
    /// Examples:
    /// - pulling again after the channel reported end of stream
    /// - invoking a stale export after the cursor advanced
    /// - reading the next frame header before the previous payload was drained
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Byte stream ended inside a frame header, or a header is implausible.
    #[error("framing corruption: {0}")]
    FramingCorruption(String),

    /// Memory pool budget cannot satisfy a reservation.
    #[error("resources exhausted: {0}")]
    ResourcesExhausted(String),

    /// Runtime failures while moving or decoding batch data.
    #[error("execution error: {0}")]
    Execution(String),

    /// Invalid or inconsistent configuration/argument state.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard NBX result alias.
pub type Result<T> = std::result::Result<T, NbxError>;
