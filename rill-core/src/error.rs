//! Rill error abstractions.

use thiserror::Error;

/// Application error variants.
///
/// These are the user-visible failure modes of the CLI commands and the processor
/// entrypoint. Everything else flows through `anyhow` with context.
#[derive(Debug, Error)]
pub enum AppError {
    /// A required environment variable is not set.
    #[error("required environment variable '{0}' not defined")]
    MissingEnv(&'static str),
    /// A buffer lifecycle command was invoked with no buffers.
    #[error("buffer list should not be empty")]
    EmptyBufferList,
    /// The given inter-step buffer service type is not recognized.
    #[error("unsupported isb service type {0:?}")]
    UnsupportedIsbSvcType(String),
    /// The replica environment value could not be parsed as an integer.
    #[error("invalid replica {0:?}")]
    InvalidReplica(String),
    /// The vertex object environment value could not be decoded.
    #[error("failed to decode vertex string: {0}")]
    DecodeFailed(String),
    /// The processor type flag holds an unknown value.
    #[error("unrecognized processor type {0:?}")]
    UnrecognizedProcessorType(String),
    /// A buffer exists but does not match its expected configuration.
    #[error("buffer {buffer:?} is invalid: {reason}")]
    BufferInvalid { buffer: String, reason: String },
}
