//! # checkpoint-tools
//!
//! Convert, combine, and re-key neural network checkpoints.
//!
//! Checkpoints flow through a pipeline of pure transforms over a
//! [`StateDict`] (an insertion-ordered name → tensor mapping):
//! load → filter/rename → precision cast → architecture split →
//! quantize → write. Inputs are legacy pickle-based archives or
//! safetensors files; outputs are always safetensors.
//!
//! ## Quick Start
//!
//! ```rust
//! use checkpoint_tools::{cast_state_dict, Precision, StateDict, Tensor};
//! use checkpoint_core::DType;
//!
//! let mut dict = StateDict::new();
//! dict.insert(
//!     "layer.weight",
//!     Tensor::from_f32(vec![2, 2], &[0.5, -0.25, 1.0, 0.0]),
//! );
//!
//! cast_state_dict(&mut dict, Precision::Float16).unwrap();
//! assert_eq!(dict.get("layer.weight").unwrap().dtype, DType::Float16);
//! ```
//!
//! ## Modules
//!
//! - [`statedict`] - The ordered state dict and its key transforms
//! - [`formats`] - Container detection, safetensors read/write
//! - [`pickle`] - Legacy PyTorch archive loading
//! - [`cast`] - Precision conversion (f16, bf16, four fp8 variants)
//! - [`arch`] - Architecture detection and component splitting
//! - [`quantize`] - nf4/int8 block quantization for split components

pub mod arch;
pub mod cast;
pub mod formats;
pub mod pickle;
pub mod quantize;
pub mod statedict;

// Re-export main types
pub use arch::{classify_and_split, detect_architecture, validate_architecture, Architecture};
pub use cast::{cast_state_dict, Precision};
pub use formats::{
    extension_for_state_dict, load_state_dict, read_safetensors, save_state_dict, sniff_format,
    ContainerFormat,
};
pub use pickle::load_legacy_checkpoint;
pub use quantize::{
    dequantize_tensor, quantize_for_model, QuantKind, MIN_QUANT_NUMEL, QUANT_BLOCK_SIZE,
};
pub use statedict::{abbreviate_count, group_thousands, MetadataSummary, StateDict, Tensor, TensorRow};
