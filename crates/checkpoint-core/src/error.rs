//! Error types for checkpoint-tools.

use crate::types::DType;
use thiserror::Error;

/// Result type alias for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur while transforming checkpoints.
///
/// Every variant is unrecoverable at the point of detection; the calling
/// command decides whether to abort the run or skip the current output.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Input file is unreadable, corrupt, or in an unrecognized container format
    #[error("failed to load checkpoint: {0}")]
    Load(String),

    /// Two distinct original keys renamed to the same final key
    #[error("rename collision: '{original}' and '{previous}' both rename to '{renamed}'")]
    KeyCollision {
        original: String,
        previous: String,
        renamed: String,
    },

    /// No defined conversion from the source element format to the target
    #[error("no defined cast from {from} to {to}")]
    UnsupportedCast { from: DType, to: String },

    /// No architecture signature matched the checkpoint's key set
    #[error("could not determine model architecture from checkpoint keys")]
    UnknownArchitecture,

    /// The checkpoint is not structurally consistent with the hinted architecture
    #[error("checkpoint does not look like {architecture}: missing key '{missing}'")]
    ArchitectureMismatch {
        architecture: String,
        missing: String,
    },

    /// A key matched no entry in the architecture's routing table
    #[error("unmapped key for {architecture}: '{key}'")]
    UnmappedKey { architecture: String, key: String },

    /// A quantization packing precondition was violated
    #[error("cannot quantize '{key}': {reason}")]
    Quantization { key: String, reason: String },

    /// Output serialization failure
    #[error("failed to write checkpoint: {0}")]
    Write(String),
}
