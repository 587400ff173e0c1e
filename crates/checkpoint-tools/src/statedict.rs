//! Flat tensor mappings and the key filter/rename stage.
//!
//! A [`StateDict`] is an insertion-ordered mapping from dotted tensor names
//! to [`Tensor`] values. Order is preserved through every transform so the
//! serialized output is deterministic.

use checkpoint_core::{CheckpointError, DType, Result};
use std::collections::HashMap;

/// An in-memory tensor: element format, shape, and contiguous
/// little-endian bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    /// Element format
    pub dtype: DType,
    /// Shape (row-major)
    pub shape: Vec<usize>,
    /// Raw element bytes, little-endian, contiguous
    pub data: Vec<u8>,
}

impl Tensor {
    /// Create a tensor, validating that the byte length matches the shape.
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        let expected = numel * dtype.size_bytes();
        if data.len() != expected {
            return Err(CheckpointError::Load(format!(
                "tensor byte length {} does not match shape {:?} of dtype {} (expected {})",
                data.len(),
                shape,
                dtype,
                expected
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    /// Build an F32 tensor from values.
    #[must_use]
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), values.len());
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self {
            dtype: DType::Float32,
            shape,
            data,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Insertion-ordered mapping from tensor name to tensor.
///
/// Re-inserting an existing key replaces the value but keeps the key's
/// original position, matching Python dict semantics so that `combine`
/// output order is reproducible.
#[derive(Debug, Default, Clone)]
pub struct StateDict {
    entries: Vec<(String, Tensor)>,
    index: HashMap<String, usize>,
}

impl StateDict {
    /// Create an empty state dict.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tensors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the dict holds no tensors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a tensor, replacing any existing value under the same key.
    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) {
        let key = key.into();
        if let Some(&pos) = self.index.get(&key) {
            self.entries[pos].1 = tensor;
        } else {
            self.index.insert(key.clone(), self.entries.len());
            self.entries.push((key, tensor));
        }
    }

    /// Look up a tensor by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.index.get(key).map(|&pos| &self.entries[pos].1)
    }

    /// Whether a key is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(k, t)| (k.as_str(), t))
    }

    /// Iterate keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [(String, Tensor)] {
        &mut self.entries
    }

    /// Whether any tensor carries packed quantization state.
    #[must_use]
    pub fn has_quantized(&self) -> bool {
        self.entries
            .iter()
            .any(|(k, _)| k.ends_with(".quant_state"))
    }

    /// Merge another dict into this one. Colliding keys take the other
    /// dict's value (later file wins) while keeping their original position.
    pub fn merge_from(&mut self, other: StateDict) {
        for (key, tensor) in other.entries {
            self.insert(key, tensor);
        }
    }

    /// Apply ignore rules, then ordered rename rules, producing a new dict.
    ///
    /// Ignore rules are evaluated first: a key containing any ignore pattern
    /// is dropped entirely, whether or not a rename rule would also match.
    /// Rename rules are substring replacements applied in registration
    /// order. Two distinct surviving keys renaming to the same final key is
    /// a [`CheckpointError::KeyCollision`]; silently overwriting would drop
    /// a tensor without warning.
    pub fn filtered_renamed(
        self,
        ignore_keys: &[String],
        rename_rules: &[(String, String)],
    ) -> Result<StateDict> {
        let mut out = StateDict::new();
        let mut origin: HashMap<String, String> = HashMap::new();

        for (key, tensor) in self.entries {
            if ignore_keys.iter().any(|pat| key.contains(pat.as_str())) {
                continue;
            }
            let mut renamed = key.clone();
            for (old, new) in rename_rules {
                renamed = renamed.replace(old.as_str(), new.as_str());
            }
            if let Some(previous) = origin.get(&renamed) {
                return Err(CheckpointError::KeyCollision {
                    original: key,
                    previous: previous.clone(),
                    renamed,
                });
            }
            origin.insert(renamed.clone(), key);
            out.insert(renamed, tensor);
        }
        Ok(out)
    }

    /// Structured per-tensor metadata plus the aggregate parameter count.
    #[must_use]
    pub fn summary(&self) -> MetadataSummary {
        let rows: Vec<TensorRow> = self
            .entries
            .iter()
            .map(|(key, t)| TensorRow {
                key: key.clone(),
                shape: t.shape.clone(),
                dtype: t.dtype,
                numel: t.numel(),
            })
            .collect();
        let total_params = rows.iter().map(|r| r.numel as u64).sum();
        MetadataSummary { rows, total_params }
    }
}

impl IntoIterator for StateDict {
    type Item = (String, Tensor);
    type IntoIter = std::vec::IntoIter<(String, Tensor)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<(String, Tensor)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        let mut dict = StateDict::new();
        for (key, tensor) in iter {
            dict.insert(key, tensor);
        }
        dict
    }
}

/// One row of the `metadata` listing.
#[derive(Debug, Clone)]
pub struct TensorRow {
    pub key: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub numel: usize,
}

/// Structured result of the `metadata` command; rendering (color, layout)
/// is the CLI's job.
#[derive(Debug, Clone)]
pub struct MetadataSummary {
    pub rows: Vec<TensorRow>,
    pub total_params: u64,
}

impl MetadataSummary {
    /// Abbreviate the parameter count with K/M/B/T suffixes.
    ///
    /// One decimal place below 10 units, none otherwise: 1,000,500 is
    /// "1.0M", 25,300,000 is "25M", 999 is "999".
    #[must_use]
    pub fn abbreviated_params(&self) -> String {
        abbreviate_count(self.total_params)
    }

    /// Exact parameter count with thousands separators, e.g. "1,000,500".
    #[must_use]
    pub fn exact_params(&self) -> String {
        group_thousands(self.total_params)
    }
}

/// K/M/B/T abbreviation used for parameter counts.
#[must_use]
pub fn abbreviate_count(n: u64) -> String {
    let units = ["", "K", "M", "B", "T"];
    let mut value = n as f64;
    let mut unit = "";
    for u in units {
        unit = u;
        if value < 1000.0 {
            break;
        }
        value /= 1000.0;
    }
    if unit.is_empty() {
        format!("{value:.0}")
    } else if value < 10.0 {
        format!("{value:.1}{unit}")
    } else {
        format!("{value:.0}{unit}")
    }
}

/// Comma-group a count into thousands: 1000500 becomes "1,000,500".
#[must_use]
pub fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
