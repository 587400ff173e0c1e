//! Checkpoint container reading and writing.
//!
//! Two input kinds are recognized: safetensors containers and legacy
//! PyTorch pickle archives (see [`crate::pickle`]). Output is always
//! safetensors.
//!
//! Safetensors format:
//! - 8 bytes: header size (little-endian u64)
//! - N bytes: JSON header with tensor metadata
//! - Remaining: tensor data (contiguous)

use crate::pickle;
use crate::statedict::{StateDict, Tensor};
use checkpoint_core::{CheckpointError, DType, Result, TensorMeta};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Sanity bound on the safetensors JSON header.
const MAX_HEADER_SIZE: u64 = 100_000_000;

/// Zip local-file-header magic, the start of every legacy torch archive.
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// Input container kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    /// Memory-mapped tensor container (safetensors)
    Safetensors,
    /// Legacy pickle-based archive (`torch.save` zip layout)
    LegacyPickle,
}

/// Detect the container format by extension, falling back to header
/// sniffing for unknown extensions.
pub fn sniff_format(path: &Path) -> Result<ContainerFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase);

    match ext.as_deref() {
        Some("safetensors") => return Ok(ContainerFormat::Safetensors),
        Some("ckpt") | Some("pt") | Some("pth") | Some("bin") => {
            return Ok(ContainerFormat::LegacyPickle)
        }
        _ => {}
    }

    let mut file = File::open(path)?;
    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)
        .map_err(|_| CheckpointError::Load(format!("{}: file too short", path.display())))?;

    if magic[..4] == ZIP_MAGIC {
        return Ok(ContainerFormat::LegacyPickle);
    }
    let header_size = u64::from_le_bytes(magic);
    if header_size > 0 && header_size < MAX_HEADER_SIZE {
        return Ok(ContainerFormat::Safetensors);
    }

    Err(CheckpointError::Load(format!(
        "{}: unrecognized container format",
        path.display()
    )))
}

/// Load a checkpoint of either container kind into a flat state dict,
/// with all tensors materialized in memory.
pub fn load_state_dict(path: &Path) -> Result<StateDict> {
    match sniff_format(path)? {
        ContainerFormat::Safetensors => read_safetensors(path),
        ContainerFormat::LegacyPickle => pickle::load_legacy_checkpoint(path),
    }
}

/// Read a safetensors file into a state dict.
///
/// Entries are ordered by data offset, which is the order the producing
/// writer serialized them in.
pub fn read_safetensors(path: &Path) -> Result<StateDict> {
    let file = File::open(path)?;
    let file_size = file.metadata()?.len() as usize;
    let mut reader = BufReader::new(file);

    let mut header_size_buf = [0u8; 8];
    reader
        .read_exact(&mut header_size_buf)
        .map_err(|_| CheckpointError::Load(format!("{}: file too short", path.display())))?;
    let header_size = u64::from_le_bytes(header_size_buf) as usize;

    if header_size + 8 > file_size {
        return Err(CheckpointError::Load(
            "header size exceeds file size".to_string(),
        ));
    }

    let mut header_buf = vec![0u8; header_size];
    reader.read_exact(&mut header_buf)?;

    let header_json: serde_json::Value = serde_json::from_slice(&header_buf)
        .map_err(|e| CheckpointError::Load(format!("invalid JSON header: {e}")))?;

    let mut metas = Vec::new();
    if let serde_json::Value::Object(map) = header_json {
        for (name, value) in map {
            if name == "__metadata__" {
                continue;
            }
            metas.push(parse_tensor_meta(&name, &value)?);
        }
    } else {
        return Err(CheckpointError::Load(
            "safetensors header is not a JSON object".to_string(),
        ));
    }
    metas.sort_by_key(|m| m.offset);
    debug!(tensors = metas.len(), header_size, "parsed safetensors header");

    let data_size = file_size - 8 - header_size;
    let mut data = vec![0u8; data_size];
    reader.read_exact(&mut data)?;

    let mut dict = StateDict::new();
    for meta in metas {
        let end = meta.offset + meta.size;
        if end > data.len() {
            return Err(CheckpointError::Load(format!(
                "tensor '{}' extends past end of data section",
                meta.name
            )));
        }
        let tensor = Tensor::new(meta.dtype, meta.shape, data[meta.offset..end].to_vec())?;
        dict.insert(meta.name, tensor);
    }
    Ok(dict)
}

/// Parse one tensor's metadata from the JSON header.
fn parse_tensor_meta(name: &str, value: &serde_json::Value) -> Result<TensorMeta> {
    let obj = value
        .as_object()
        .ok_or_else(|| CheckpointError::Load(format!("expected object for tensor '{name}'")))?;

    let dtype_str = obj
        .get("dtype")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CheckpointError::Load(format!("missing dtype for '{name}'")))?;
    let dtype = DType::parse(dtype_str)
        .ok_or_else(|| CheckpointError::Load(format!("unknown dtype '{dtype_str}' for '{name}'")))?;

    let shape: Vec<usize> = obj
        .get("shape")
        .and_then(|v| v.as_array())
        .ok_or_else(|| CheckpointError::Load(format!("missing shape for '{name}'")))?
        .iter()
        .filter_map(|v| v.as_u64().map(|n| n as usize))
        .collect();

    let offsets = obj
        .get("data_offsets")
        .and_then(|v| v.as_array())
        .ok_or_else(|| CheckpointError::Load(format!("missing data_offsets for '{name}'")))?;
    let start = offsets
        .first()
        .and_then(|v| v.as_u64())
        .ok_or_else(|| CheckpointError::Load(format!("invalid start offset for '{name}'")))?
        as usize;
    let end = offsets
        .get(1)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| CheckpointError::Load(format!("invalid end offset for '{name}'")))?
        as usize;
    if end < start {
        return Err(CheckpointError::Load(format!(
            "invalid data_offsets for '{name}'"
        )));
    }

    Ok(TensorMeta {
        name: name.to_string(),
        shape,
        dtype,
        offset: start,
        size: end - start,
    })
}

/// Output extension derived from the dict's content: plain float dicts get
/// `.safetensors`, dicts carrying packed quantization state get
/// `.bnb.safetensors`.
#[must_use]
pub fn extension_for_state_dict(dict: &StateDict) -> &'static str {
    if dict.has_quantized() {
        ".bnb.safetensors"
    } else {
        ".safetensors"
    }
}

/// Serialize a state dict to a safetensors file, preserving insertion
/// order in the data section.
///
/// The file is written to a temporary sibling and renamed into place, so a
/// failure never leaves a partially written checkpoint behind.
pub fn save_state_dict(dict: &StateDict, path: &Path) -> Result<()> {
    // append rather than swap the extension, so "model.safetensors" and a
    // pre-existing "model.tmp" never collide
    let tmp_path = {
        let mut name = path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    };
    write_safetensors(dict, &tmp_path)
        .and_then(|()| {
            std::fs::rename(&tmp_path, path)
                .map_err(|e| CheckpointError::Write(format!("{}: {e}", path.display())))
        })
        .inspect_err(|_| {
            let _ = std::fs::remove_file(&tmp_path);
        })
}

fn write_safetensors(dict: &StateDict, path: &Path) -> Result<()> {
    let file =
        File::create(path).map_err(|e| CheckpointError::Write(format!("{}: {e}", path.display())))?;
    let mut writer = BufWriter::new(file);

    let mut header_map = serde_json::Map::new();
    let mut current_offset: usize = 0;
    for (name, tensor) in dict.iter() {
        let start = current_offset;
        let end = start + tensor.data.len();
        current_offset = end;

        let tensor_info = serde_json::json!({
            "dtype": tensor.dtype.as_str(),
            "shape": tensor.shape,
            "data_offsets": [start, end]
        });
        header_map.insert(name.to_string(), tensor_info);
    }

    let header_json = serde_json::to_string(&serde_json::Value::Object(header_map))
        .map_err(|e| CheckpointError::Write(format!("failed to serialize header: {e}")))?;
    let header_bytes = header_json.as_bytes();

    let io_err = |e: std::io::Error| CheckpointError::Write(format!("{}: {e}", path.display()));
    writer
        .write_all(&(header_bytes.len() as u64).to_le_bytes())
        .map_err(io_err)?;
    writer.write_all(header_bytes).map_err(io_err)?;
    for (_, tensor) in dict.iter() {
        writer.write_all(&tensor.data).map_err(io_err)?;
    }
    writer.flush().map_err(io_err)?;
    Ok(())
}
