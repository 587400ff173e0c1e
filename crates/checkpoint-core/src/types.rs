//! Common tensor types for checkpoint-tools.

use serde::{Deserialize, Serialize};

/// Data types for tensor elements.
///
/// Covers everything that can appear in a safetensors container, plus the
/// four 8-bit floating formats used as narrowing targets. The fp8 names
/// follow the PyTorch convention: `fn` variants have no infinity encoding,
/// `fnuz` variants additionally have no negative zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 64-bit floating point
    Float64,
    /// 32-bit floating point
    Float32,
    /// 16-bit floating point
    Float16,
    /// Brain floating point (16-bit)
    BFloat16,
    /// 8-bit float, 4 exponent / 3 mantissa bits, finite only
    Float8E4M3Fn,
    /// 8-bit float, 4 exponent / 3 mantissa bits, finite only, no negative zero
    Float8E4M3FnUz,
    /// 8-bit float, 5 exponent / 2 mantissa bits, IEEE-style
    Float8E5M2,
    /// 8-bit float, 5 exponent / 2 mantissa bits, finite only, no negative zero
    Float8E5M2FnUz,
    /// 64-bit signed integer
    Int64,
    /// 32-bit signed integer
    Int32,
    /// 16-bit signed integer
    Int16,
    /// 8-bit signed integer
    Int8,
    /// 8-bit unsigned integer
    UInt8,
    /// Boolean
    Bool,
}

impl DType {
    /// Size in bytes of a single element.
    #[must_use]
    pub const fn size_bytes(&self) -> usize {
        match self {
            Self::Float64 | Self::Int64 => 8,
            Self::Float32 | Self::Int32 => 4,
            Self::Float16 | Self::BFloat16 | Self::Int16 => 2,
            Self::Float8E4M3Fn
            | Self::Float8E4M3FnUz
            | Self::Float8E5M2
            | Self::Float8E5M2FnUz
            | Self::Int8
            | Self::UInt8
            | Self::Bool => 1,
        }
    }

    /// Whether this is a floating-point element format.
    #[must_use]
    pub const fn is_float(&self) -> bool {
        matches!(
            self,
            Self::Float64
                | Self::Float32
                | Self::Float16
                | Self::BFloat16
                | Self::Float8E4M3Fn
                | Self::Float8E4M3FnUz
                | Self::Float8E5M2
                | Self::Float8E5M2FnUz
        )
    }

    /// The safetensors header string for this dtype.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Float64 => "F64",
            Self::Float32 => "F32",
            Self::Float16 => "F16",
            Self::BFloat16 => "BF16",
            Self::Float8E4M3Fn => "F8_E4M3",
            Self::Float8E4M3FnUz => "F8_E4M3_FNUZ",
            Self::Float8E5M2 => "F8_E5M2",
            Self::Float8E5M2FnUz => "F8_E5M2_FNUZ",
            Self::Int64 => "I64",
            Self::Int32 => "I32",
            Self::Int16 => "I16",
            Self::Int8 => "I8",
            Self::UInt8 => "U8",
            Self::Bool => "BOOL",
        }
    }

    /// Parse a safetensors header dtype string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "F64" | "float64" => Some(Self::Float64),
            "F32" | "float32" => Some(Self::Float32),
            "F16" | "float16" => Some(Self::Float16),
            "BF16" | "bfloat16" => Some(Self::BFloat16),
            "F8_E4M3" => Some(Self::Float8E4M3Fn),
            "F8_E4M3_FNUZ" => Some(Self::Float8E4M3FnUz),
            "F8_E5M2" => Some(Self::Float8E5M2),
            "F8_E5M2_FNUZ" => Some(Self::Float8E5M2FnUz),
            "I64" | "int64" => Some(Self::Int64),
            "I32" | "int32" => Some(Self::Int32),
            "I16" | "int16" => Some(Self::Int16),
            "I8" | "int8" => Some(Self::Int8),
            "U8" | "uint8" => Some(Self::UInt8),
            "BOOL" | "bool" => Some(Self::Bool),
            _ => None,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata about a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMeta {
    /// Name/key of the tensor
    pub name: String,
    /// Shape of the tensor
    pub shape: Vec<usize>,
    /// Data type
    pub dtype: DType,
    /// Offset in bytes within storage
    pub offset: usize,
    /// Size in bytes
    pub size: usize,
}

impl TensorMeta {
    /// Create new tensor metadata.
    #[must_use]
    pub fn new(name: impl Into<String>, shape: Vec<usize>, dtype: DType) -> Self {
        let numel: usize = shape.iter().product();
        let size = numel * dtype.size_bytes();
        Self {
            name: name.into(),
            shape,
            dtype,
            offset: 0,
            size,
        }
    }

    /// Number of elements in the tensor.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}
