//! Unified error type.

/// The error type returned by portico's fallible operations.
///
/// Application-level errors (401, 415, etc.) are expressed as
/// [`ServiceResponse`](crate::ServiceResponse) values, not as `Error`s. This
/// type surfaces infrastructure failures and misuse of the emission API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Status codes outside `100..=599` are rejected at construction.
    #[error("invalid status code {0}")]
    InvalidStatus(u16),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// The response head was already committed to the wire.
    #[error("response head already committed")]
    AlreadyCommitted,

    #[error("serialize entity: {0}")]
    Serialize(#[from] serde_json::Error),
}
