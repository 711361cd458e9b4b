//! Error taxonomy for handle and session operations.

use thiserror::Error;

use crate::native::Status;

/// Convenience alias used by every fallible operation in the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors surfaced by provider handles, child handles and hash sessions.
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The provider or algorithm could not be opened or referenced.
    #[error("provider for {algorithm} unavailable: status {status}")]
    ProviderUnavailable { algorithm: String, status: Status },

    /// The provider could not allocate a native object.
    #[error("native allocation failed during {op}: status {status}")]
    ResourceExhausted { op: &'static str, status: Status },

    /// The operation is not valid in the object's current state.
    #[error("{op} is not valid in state {state}")]
    InvalidState { op: &'static str, state: &'static str },

    /// A programming contract was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(&'static str),

    /// Opaque provider failure carrying the raw status code.
    #[error("provider call {op} failed: status {status}")]
    Crypto { op: &'static str, status: Status },

    /// A hash session could not acquire its native resources.
    #[error("hash session initialization failed: {0}")]
    Initialization(#[source] Box<Error>),

    /// Destroying a resource or dropping its provider reference failed.
    /// `step` names the first step that failed.
    #[error("release of {resource} failed at {step}")]
    ReleaseFailed {
        resource: &'static str,
        step: &'static str,
    },

    /// The requested byte range does not fit the input buffer.
    #[error("range {offset}+{length} out of bounds for {len} bytes")]
    OutOfRange {
        offset: usize,
        length: usize,
        len: usize,
    },

    /// The provider returned a digest of the wrong size for the algorithm.
    #[error("digest length {actual} does not match expected {expected}")]
    DigestLength { expected: usize, actual: usize },
}

impl Error {
    /// Classify a status returned by a provider call other than `open`.
    pub(crate) fn from_status(op: &'static str, status: Status) -> Self {
        if status == Status::NO_MEMORY {
            Error::ResourceExhausted { op, status }
        } else {
            Error::Crypto { op, status }
        }
    }

    /// Classify a status returned by `open`.
    pub(crate) fn from_open_status(algorithm: &str, status: Status) -> Self {
        if status == Status::NO_MEMORY {
            Error::ResourceExhausted { op: "open", status }
        } else {
            Error::ProviderUnavailable {
                algorithm: algorithm.to_owned(),
                status,
            }
        }
    }

    pub(crate) fn initialization(inner: Error) -> Self {
        Error::Initialization(Box::new(inner))
    }

    /// The provider status carried by this error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::ProviderUnavailable { status, .. }
            | Error::ResourceExhausted { status, .. }
            | Error::Crypto { status, .. } => Some(*status),
            Error::Initialization(inner) => inner.status(),
            _ => None,
        }
    }

    /// Whether this error reports a state-machine contract violation.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Error::InvalidState { .. })
    }
}
