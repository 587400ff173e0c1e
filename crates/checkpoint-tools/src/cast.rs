//! Element-format conversion for floating-point tensors.
//!
//! The caster converts every floating tensor in a state dict to a single
//! target format; integer, boolean, and index tensors pass through
//! untouched. Narrow-format saturation policy is explicit:
//!
//! - `float16` / `bfloat16` / `float8-e5m2` follow IEEE semantics and
//!   overflow to signed infinity.
//! - The finite-only `*-fn` / `*-fn-uz` formats have no infinity encoding;
//!   out-of-range values clip to the maximum finite magnitude with the
//!   input's sign. The `-uz` variants additionally collapse negative zero
//!   to positive zero.
//!
//! All conversions round to nearest, ties to even.

use crate::statedict::{StateDict, Tensor};
use checkpoint_core::{CheckpointError, DType, Result};
use half::{bf16, f16};
use rayon::prelude::*;

/// Target precision selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// Leave every tensor in its native format
    Full,
    Float16,
    BFloat16,
    Float8E4M3Fn,
    Float8E4M3FnUz,
    Float8E5M2,
    Float8E5M2FnUz,
}

impl Precision {
    /// Flag-style name, as presented on the CLI.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Float16 => "float16",
            Self::BFloat16 => "bfloat16",
            Self::Float8E4M3Fn => "float8-e4m3-fn",
            Self::Float8E4M3FnUz => "float8-e4m3-fn-uz",
            Self::Float8E5M2 => "float8-e5m2",
            Self::Float8E5M2FnUz => "float8-e5m2-fn-uz",
        }
    }

    /// The element format this precision casts to; `None` for `full`.
    #[must_use]
    pub const fn target_dtype(&self) -> Option<DType> {
        match self {
            Self::Full => None,
            Self::Float16 => Some(DType::Float16),
            Self::BFloat16 => Some(DType::BFloat16),
            Self::Float8E4M3Fn => Some(DType::Float8E4M3Fn),
            Self::Float8E4M3FnUz => Some(DType::Float8E4M3FnUz),
            Self::Float8E5M2 => Some(DType::Float8E5M2),
            Self::Float8E5M2FnUz => Some(DType::Float8E5M2FnUz),
        }
    }
}

/// Cast every floating tensor in `dict` to `precision`, in place.
///
/// Keys and shapes never change. `Precision::Full` is a no-op. A dict
/// carrying packed quantization state cannot be re-cast; that is an
/// [`CheckpointError::UnsupportedCast`].
pub fn cast_state_dict(dict: &mut StateDict, precision: Precision) -> Result<()> {
    let Some(target) = precision.target_dtype() else {
        return Ok(());
    };

    if dict.has_quantized() {
        return Err(CheckpointError::UnsupportedCast {
            from: DType::UInt8,
            to: precision.as_str().to_string(),
        });
    }

    // Each tensor converts independently; order is fixed by the slice.
    dict.entries_mut()
        .par_iter_mut()
        .try_for_each(|(_, tensor)| {
            if !tensor.dtype.is_float() || tensor.dtype == target {
                return Ok(());
            }
            let values = decode_f32(tensor)?;
            tensor.data = encode_f32(&values, target);
            tensor.dtype = target;
            Ok(())
        })
}

/// Decode a floating tensor's elements to f32.
pub(crate) fn decode_f32(tensor: &Tensor) -> Result<Vec<f32>> {
    let data = &tensor.data;
    let values = match tensor.dtype {
        DType::Float64 => data
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes(c.try_into().unwrap()) as f32)
            .collect(),
        DType::Float32 => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect(),
        DType::Float16 => data
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        DType::BFloat16 => data
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        DType::Float8E4M3Fn => data.iter().map(|&b| decode_f8(b, &E4M3FN)).collect(),
        DType::Float8E4M3FnUz => data.iter().map(|&b| decode_f8(b, &E4M3FNUZ)).collect(),
        DType::Float8E5M2 => data.iter().map(|&b| decode_f8(b, &E5M2)).collect(),
        DType::Float8E5M2FnUz => data.iter().map(|&b| decode_f8(b, &E5M2FNUZ)).collect(),
        other => {
            return Err(CheckpointError::UnsupportedCast {
                from: other,
                to: "float32".to_string(),
            })
        }
    };
    Ok(values)
}

/// Encode f32 values as raw bytes of a floating target dtype.
pub(crate) fn encode_f32(values: &[f32], target: DType) -> Vec<u8> {
    match target {
        DType::Float64 => values
            .iter()
            .flat_map(|&v| (v as f64).to_le_bytes())
            .collect(),
        DType::Float32 => values.iter().flat_map(|&v| v.to_le_bytes()).collect(),
        DType::Float16 => values
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_le_bytes())
            .collect(),
        DType::BFloat16 => values
            .iter()
            .flat_map(|&v| bf16::from_f32(v).to_le_bytes())
            .collect(),
        DType::Float8E4M3Fn => values.iter().map(|&v| encode_f8(v, &E4M3FN)).collect(),
        DType::Float8E4M3FnUz => values.iter().map(|&v| encode_f8(v, &E4M3FNUZ)).collect(),
        DType::Float8E5M2 => values.iter().map(|&v| encode_f8(v, &E5M2)).collect(),
        DType::Float8E5M2FnUz => values.iter().map(|&v| encode_f8(v, &E5M2FNUZ)).collect(),
        other => unreachable!("not a floating encode target: {other}"),
    }
}

/// Layout of one 8-bit floating format.
struct F8Spec {
    /// Mantissa bits
    mant_bits: u32,
    /// Exponent bias
    bias: i32,
    /// Largest exponent field holding finite values
    ef_top: u32,
    /// Largest mantissa field at `ef_top` that is still finite
    mant_top: u32,
    /// Whether the format encodes infinities (IEEE-style)
    has_inf: bool,
    /// Finite-only, no negative zero; NaN is 0x80
    fnuz: bool,
}

const E4M3FN: F8Spec = F8Spec {
    mant_bits: 3,
    bias: 7,
    ef_top: 15,
    mant_top: 6, // ef=15 mant=7 is NaN
    has_inf: false,
    fnuz: false,
};

const E4M3FNUZ: F8Spec = F8Spec {
    mant_bits: 3,
    bias: 8,
    ef_top: 15,
    mant_top: 7,
    has_inf: false,
    fnuz: true,
};

const E5M2: F8Spec = F8Spec {
    mant_bits: 2,
    bias: 15,
    ef_top: 30, // ef=31 is inf/NaN
    mant_top: 3,
    has_inf: true,
    fnuz: false,
};

const E5M2FNUZ: F8Spec = F8Spec {
    mant_bits: 2,
    bias: 16,
    ef_top: 31,
    mant_top: 3,
    has_inf: false,
    fnuz: true,
};

fn f8_nan(sign_bit: u8, spec: &F8Spec) -> u8 {
    if spec.fnuz {
        return 0x80;
    }
    if spec.has_inf {
        // e5m2: quiet NaN, exponent all ones, nonzero mantissa
        sign_bit | ((spec.ef_top as u8 + 1) << spec.mant_bits) | 0x02
    } else {
        // e4m3fn: exponent and mantissa all ones
        sign_bit | ((spec.ef_top as u8) << spec.mant_bits) | (spec.mant_top as u8 + 1)
    }
}

fn f8_saturated(sign_bit: u8, spec: &F8Spec) -> u8 {
    if spec.has_inf {
        // overflow to infinity: exponent all ones, zero mantissa
        sign_bit | ((spec.ef_top as u8 + 1) << spec.mant_bits)
    } else {
        sign_bit | ((spec.ef_top as u8) << spec.mant_bits) | spec.mant_top as u8
    }
}

/// Encode an f32 into an 8-bit float, round-to-nearest-even with the
/// spec's saturation policy.
fn encode_f8(value: f32, spec: &F8Spec) -> u8 {
    let sign_bit = if value.is_sign_negative() { 0x80 } else { 0x00 };

    if value.is_nan() {
        return f8_nan(sign_bit, spec);
    }
    if value.is_infinite() {
        return f8_saturated(sign_bit, spec);
    }

    let a = f64::from(value.abs());
    if a == 0.0 {
        return if spec.fnuz { 0x00 } else { sign_bit };
    }

    // Quantize the magnitude onto the target grid. An f32 magnitude is
    // always a normal f64, so the exponent comes straight from the bits.
    let min_exp = 1 - spec.bias;
    let e_val = (((a.to_bits() >> 52) & 0x7FF) as i32) - 1023;
    let mut e = e_val.max(min_exp);
    let step = (e - spec.mant_bits as i32) as f64;
    let mut q = (a / step.exp2()).round_ties_even() as u64;

    if q == 1 << (spec.mant_bits + 1) {
        // rounded up into the next binade
        q >>= 1;
        e += 1;
    }
    if q == 0 {
        return if spec.fnuz { 0x00 } else { sign_bit };
    }

    let (ef, mant) = if q < (1 << spec.mant_bits) {
        // subnormal (only reachable when e was clamped to min_exp)
        (0u32, q as u32)
    } else {
        ((e + spec.bias) as u32, q as u32 - (1 << spec.mant_bits))
    };

    if ef > spec.ef_top || (ef == spec.ef_top && mant > spec.mant_top) {
        return f8_saturated(sign_bit, spec);
    }

    sign_bit | ((ef << spec.mant_bits) | mant) as u8
}

/// Decode an 8-bit float to f32.
fn decode_f8(byte: u8, spec: &F8Spec) -> f32 {
    if spec.fnuz && byte == 0x80 {
        return f32::NAN;
    }

    let negative = byte & 0x80 != 0;
    let exp_mask = (1u32 << (8 - 1 - spec.mant_bits)) - 1;
    let ef = (u32::from(byte) >> spec.mant_bits) & exp_mask;
    let mant = u32::from(byte) & ((1 << spec.mant_bits) - 1);

    if spec.has_inf && ef > spec.ef_top {
        let v = if mant == 0 { f32::INFINITY } else { f32::NAN };
        return if negative { -v } else { v };
    }
    if !spec.has_inf && !spec.fnuz && ef == spec.ef_top && mant > spec.mant_top {
        return f32::NAN;
    }

    let frac = mant as f64 / f64::from(1u32 << spec.mant_bits);
    let magnitude = if ef == 0 {
        frac * ((1 - spec.bias) as f64).exp2()
    } else {
        (1.0 + frac) * ((ef as i32 - spec.bias) as f64).exp2()
    };
    let v = magnitude as f32;
    if negative {
        -v
    } else {
        v
    }
}
