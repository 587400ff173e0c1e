//! # checkpoint-core
//!
//! Core types for the checkpoint-tools workspace.
//!
//! Provides shared abstractions for:
//! - Tensor element formats (`DType`), including the narrow fp8 variants
//! - Tensor metadata (`TensorMeta`)
//! - The common error taxonomy (`CheckpointError`)

pub mod error;
pub mod types;

pub use error::{CheckpointError, Result};
pub use types::{DType, TensorMeta};
