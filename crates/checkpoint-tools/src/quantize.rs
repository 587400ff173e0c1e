//! Weight quantization for split checkpoint components.
//!
//! Two packed kinds are supported: **nf4** (4-bit NormalFloat, QLoRA-style
//! codebook, two values per byte) and **int8** (per-block symmetric absmax).
//! Both operate on fixed blocks of 64 elements with one f32 scale per
//! block.
//!
//! A quantized tensor occupies three keys in the output dict: the packed
//! `U8` data under the original key, the per-block scales under
//! `<key>.absmax`, and a small `<key>.quant_state` descriptor recording
//! the kind, block size, source dtype, and original shape. Readers detect
//! a quantized checkpoint by the presence of any `.quant_state` key.
//!
//! Not every tensor is worth quantizing. Biases and scales (rank < 2),
//! small tensors, and precision-sensitive layers matched by the
//! architecture's exclusion patterns pass through in their current float
//! format.

use crate::arch::Architecture;
use crate::cast;
use crate::statedict::{StateDict, Tensor};
use checkpoint_core::{CheckpointError, DType, Result};
use tracing::debug;

/// Elements per quantization block; one scale is stored per block.
pub const QUANT_BLOCK_SIZE: usize = 64;

/// Tensors below this element count stay in float; the savings are
/// negligible and the accuracy cost is not.
pub const MIN_QUANT_NUMEL: usize = 4096;

/// Suffix of the per-block scale tensor accompanying a packed tensor.
pub const ABSMAX_SUFFIX: &str = ".absmax";

/// Suffix of the descriptor tensor accompanying a packed tensor.
pub const QUANT_STATE_SUFFIX: &str = ".quant_state";

const QUANT_STATE_VERSION: u8 = 1;

/// NF4 codebook: 16 levels approximating a normal distribution,
/// from the QLoRA paper (https://arxiv.org/abs/2305.14314).
const NF4_LEVELS: [f32; 16] = [
    -1.0,
    -0.6961928009986877,
    -0.5250730514526367,
    -0.39491748809814453,
    -0.28444138169288635,
    -0.18477343022823334,
    -0.09105003625154495,
    0.0,
    0.07958029955625534,
    0.16093020141124725,
    0.24611230194568634,
    0.33791524171829224,
    0.44070982933044434,
    0.5626170039176941,
    0.7229568362236023,
    1.0,
];

/// Packed representation to quantize eligible tensors into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantKind {
    Nf4,
    Int8,
}

impl QuantKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantKind::Nf4 => "nf4",
            QuantKind::Int8 => "int8",
        }
    }

    fn code(&self) -> u8 {
        match self {
            QuantKind::Nf4 => 1,
            QuantKind::Int8 => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(QuantKind::Nf4),
            2 => Some(QuantKind::Int8),
            _ => None,
        }
    }
}

fn dtype_code(dtype: DType) -> u8 {
    match dtype {
        DType::Float32 => 0,
        DType::Float16 => 1,
        DType::BFloat16 => 2,
        DType::Float64 => 3,
        DType::Float8E4M3Fn => 4,
        DType::Float8E4M3FnUz => 5,
        DType::Float8E5M2 => 6,
        DType::Float8E5M2FnUz => 7,
        // non-float dtypes are never quantized
        _ => 0,
    }
}

fn dtype_from_code(code: u8) -> Option<DType> {
    match code {
        0 => Some(DType::Float32),
        1 => Some(DType::Float16),
        2 => Some(DType::BFloat16),
        3 => Some(DType::Float64),
        4 => Some(DType::Float8E4M3Fn),
        5 => Some(DType::Float8E4M3FnUz),
        6 => Some(DType::Float8E5M2),
        7 => Some(DType::Float8E5M2FnUz),
        _ => None,
    }
}

/// Descriptor stored under `<key>.quant_state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantState {
    pub kind: QuantKind,
    pub block_size: usize,
    pub source_dtype: DType,
    pub original_shape: Vec<usize>,
}

impl QuantState {
    /// Byte layout: version, kind, block size log2, source dtype, rank,
    /// then each dimension as u32 little-endian.
    fn to_tensor(&self) -> Tensor {
        let mut bytes = vec![
            QUANT_STATE_VERSION,
            self.kind.code(),
            self.block_size.trailing_zeros() as u8,
            dtype_code(self.source_dtype),
            self.original_shape.len() as u8,
        ];
        for &dim in &self.original_shape {
            bytes.extend_from_slice(&(dim as u32).to_le_bytes());
        }
        let len = bytes.len();
        Tensor {
            dtype: DType::UInt8,
            shape: vec![len],
            data: bytes,
        }
    }

    fn from_tensor(key: &str, tensor: &Tensor) -> Result<Self> {
        let err = |reason: &str| CheckpointError::Quantization {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let b = &tensor.data;
        if b.len() < 5 || b[0] != QUANT_STATE_VERSION {
            return Err(err("unrecognized quantization descriptor"));
        }
        let kind = QuantKind::from_code(b[1]).ok_or_else(|| err("unknown quantization kind"))?;
        let source_dtype =
            dtype_from_code(b[3]).ok_or_else(|| err("unknown source dtype in descriptor"))?;
        let rank = b[4] as usize;
        if b.len() != 5 + rank * 4 {
            return Err(err("truncated quantization descriptor"));
        }
        let original_shape = (0..rank)
            .map(|i| {
                let at = 5 + i * 4;
                u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]]) as usize
            })
            .collect();
        Ok(Self {
            kind,
            block_size: 1 << b[2],
            source_dtype,
            original_shape,
        })
    }
}

/// Whether a tensor should be quantized at all.
fn eligible(arch: Architecture, component: &str, key: &str, tensor: &Tensor) -> bool {
    tensor.dtype.is_float()
        && tensor.shape.len() >= 2
        && tensor.numel() >= MIN_QUANT_NUMEL
        && !arch
            .quant_exclude_patterns(component)
            .iter()
            .any(|p| key.contains(p))
}

/// Quantize every eligible tensor of a split component to `kind`.
///
/// Components the architecture marks as unquantizable (the VAE) are
/// returned unchanged. Ineligible tensors pass through in their current
/// format. An eligible tensor whose element count does not divide the
/// block size is a `Quantization` error.
pub fn quantize_for_model(
    dict: StateDict,
    arch: Architecture,
    component: &str,
    kind: QuantKind,
) -> Result<StateDict> {
    if !arch.component_quantizable(component) {
        debug!(%component, "component is not quantizable, passing through");
        return Ok(dict);
    }

    let mut out = StateDict::new();
    for (key, tensor) in dict {
        if !eligible(arch, component, &key, &tensor) {
            out.insert(key, tensor);
            continue;
        }
        let numel = tensor.numel();
        if numel % QUANT_BLOCK_SIZE != 0 {
            return Err(CheckpointError::Quantization {
                key,
                reason: format!(
                    "element count {numel} is not a multiple of the block size {QUANT_BLOCK_SIZE}"
                ),
            });
        }

        let values = cast::decode_f32(&tensor)?;
        let state = QuantState {
            kind,
            block_size: QUANT_BLOCK_SIZE,
            source_dtype: tensor.dtype,
            original_shape: tensor.shape.clone(),
        };
        let (packed, absmax) = match kind {
            QuantKind::Nf4 => pack_nf4(&values),
            QuantKind::Int8 => pack_int8(&values),
        };

        let scale_count = absmax.len();
        out.insert(key.clone(), packed);
        out.insert(
            format!("{key}{ABSMAX_SUFFIX}"),
            Tensor::from_f32(vec![scale_count], &absmax),
        );
        out.insert(format!("{key}{QUANT_STATE_SUFFIX}"), state.to_tensor());
    }
    Ok(out)
}

/// Finite absmax of one block; zero-valued blocks get a scale of 1 so
/// division stays defined.
fn block_absmax(block: &[f32]) -> f32 {
    let absmax = block
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| v.abs())
        .fold(0.0f32, f32::max);
    if absmax == 0.0 {
        1.0
    } else {
        absmax
    }
}

fn pack_nf4(values: &[f32]) -> (Tensor, Vec<f32>) {
    let mut absmax = Vec::with_capacity(values.len() / QUANT_BLOCK_SIZE);
    let mut nibbles = Vec::with_capacity(values.len());
    for block in values.chunks(QUANT_BLOCK_SIZE) {
        let scale = block_absmax(block);
        absmax.push(scale);
        for &v in block {
            nibbles.push(nearest_nf4(v / scale));
        }
    }

    // two values per byte, first value in the low nibble
    let mut packed = Vec::with_capacity(nibbles.len() / 2);
    for pair in nibbles.chunks_exact(2) {
        packed.push((pair[1] << 4) | pair[0]);
    }
    let len = packed.len();
    (
        Tensor {
            dtype: DType::UInt8,
            shape: vec![len],
            data: packed,
        },
        absmax,
    )
}

fn pack_int8(values: &[f32]) -> (Tensor, Vec<f32>) {
    let mut absmax = Vec::with_capacity(values.len() / QUANT_BLOCK_SIZE);
    let mut packed = Vec::with_capacity(values.len());
    for block in values.chunks(QUANT_BLOCK_SIZE) {
        let a = block_absmax(block);
        absmax.push(a);
        let scale = a / 127.0;
        for &v in block {
            let q = (v / scale).round().clamp(-127.0, 127.0) as i8;
            packed.push(q as u8);
        }
    }
    let len = packed.len();
    (
        Tensor {
            dtype: DType::UInt8,
            shape: vec![len],
            data: packed,
        },
        absmax,
    )
}

fn nearest_nf4(value: f32) -> u8 {
    let clamped = value.clamp(-1.0, 1.0);
    let mut best = 0u8;
    let mut best_dist = f32::MAX;
    for (idx, &level) in NF4_LEVELS.iter().enumerate() {
        let dist = (clamped - level).abs();
        if dist < best_dist {
            best_dist = dist;
            best = idx as u8;
        }
    }
    best
}

/// Reconstruct a float tensor from its packed data and sibling tensors.
/// The result carries the descriptor's source dtype and original shape.
pub fn dequantize_tensor(key: &str, packed: &Tensor, absmax: &Tensor, state: &Tensor) -> Result<Tensor> {
    let state = QuantState::from_tensor(key, state)?;
    let scales = cast::decode_f32(absmax)?;
    let numel: usize = state.original_shape.iter().product();

    let mut values = Vec::with_capacity(numel);
    match state.kind {
        QuantKind::Nf4 => {
            for &byte in &packed.data {
                values.push(NF4_LEVELS[(byte & 0x0F) as usize]);
                values.push(NF4_LEVELS[(byte >> 4) as usize]);
            }
            values.truncate(numel);
        }
        QuantKind::Int8 => {
            values.extend(packed.data.iter().map(|&b| f32::from(b as i8)));
        }
    }
    if values.len() != numel {
        return Err(CheckpointError::Quantization {
            key: key.to_string(),
            reason: format!(
                "packed data holds {} elements but the descriptor declares {numel}",
                values.len()
            ),
        });
    }
    for (i, v) in values.iter_mut().enumerate() {
        let scale = scales
            .get(i / state.block_size)
            .copied()
            .ok_or_else(|| CheckpointError::Quantization {
                key: key.to_string(),
                reason: "scale tensor is shorter than the block count".to_string(),
            })?;
        match state.kind {
            QuantKind::Nf4 => *v *= scale,
            QuantKind::Int8 => *v = *v * scale / 127.0,
        }
    }

    let data = cast::encode_f32(&values, state.source_dtype);
    Tensor::new(state.source_dtype, state.original_shape, data)
}
