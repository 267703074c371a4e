//! Error type shared by every stage of the generation and retrieval pipeline.
//!
//! | Category | Variants |
//! |----------|----------|
//! | Request | `InvalidArgument`, `Cancelled` |
//! | Lifecycle | `NotInitialized`, `NotFound` |
//! | Codec | `UnsupportedSymbol`, `MalformedSequence`, `InvalidByteSequence` |
//! | Invariant | `DegenerateDistribution`, `IndexOutOfRange` |
//! | Collaborator | `InferenceFailure`, `Io`, `Serialization` |
//!
//! Request validation always happens before the first forward pass, so an
//! `InvalidArgument` never leaves partial work behind.

use std::path::PathBuf;
use thiserror::Error;

use crate::codec::Symbol;

#[derive(Debug, Error)]
pub enum ProverError {
    /// A request parameter violates its positivity, range or ordering constraint.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// An operation needed a model or store that has not been loaded.
    #[error("{what} hasn't been initialized")]
    NotInitialized { what: String },

    /// A referenced model or data file does not exist.
    #[error("Not found: {path:?}")]
    NotFound { path: PathBuf },

    /// Input byte outside the codec's alphabet.
    #[error("Unsupported symbol: byte {byte:#04x} at position {position}")]
    UnsupportedSymbol { byte: u8, position: usize },

    /// Token stream with an interior END or a non-content symbol.
    #[error("Malformed sequence: symbol {symbol} at position {position}")]
    MalformedSequence { symbol: Symbol, position: usize },

    /// Decoded bytes are not valid UTF-8.
    #[error("Invalid byte sequence: {0}")]
    InvalidByteSequence(#[from] std::string::FromUtf8Error),

    /// The sampling distribution has (almost) no mass or does not normalise.
    #[error("Degenerate distribution: {message}")]
    DegenerateDistribution { message: String },

    /// A selected premise index has no row or record.
    #[error("Index {index} out of range for {len} premises")]
    IndexOutOfRange { index: usize, len: usize },

    /// The opaque forward pass or model loader failed.
    #[error("Inference failure: {0}")]
    InferenceFailure(#[source] anyhow::Error),

    /// The caller abandoned the decode between two steps.
    #[error("Decoding cancelled at step {step}")]
    Cancelled { step: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

pub type Result<T> = std::result::Result<T, ProverError>;

impl ProverError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ProverError::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn not_initialized(what: impl Into<String>) -> Self {
        ProverError::NotInitialized { what: what.into() }
    }

    /// Internal invariant violation: fatal in debug builds, an error in release builds.
    pub(crate) fn invariant(self) -> Self {
        tracing::error!(error = %self, "invariant violated");
        debug_assert!(false, "invariant violated: {}", self);
        self
    }

    /// True for the two invariant-violation categories.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            ProverError::DegenerateDistribution { .. } | ProverError::IndexOutOfRange { .. }
        )
    }
}

impl From<serde_json::Error> for ProverError {
    fn from(e: serde_json::Error) -> Self {
        ProverError::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<safetensors::SafeTensorError> for ProverError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        ProverError::Serialization {
            message: e.to_string(),
        }
    }
}
