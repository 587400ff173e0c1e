//! Legacy PyTorch checkpoint loading.
//!
//! `torch.save` emits a zip archive holding a `data.pkl` pickle stream plus
//! one storage blob per tensor (`data/<n>`). This module reads that layout
//! directly: a minimal reader for stored (uncompressed) zip entries and an
//! interpreter for the pickle opcode subset the torch serializer produces.
//!
//! The interpreter rebuilds tensors from `torch._utils._rebuild_tensor_v2`
//! reduce calls and persistent storage ids; everything else in the archive
//! (epoch counters, optimizer state, metadata dicts) is skipped. Anything
//! outside the supported subset fails with a `Load` error rather than
//! guessing.

use crate::statedict::{StateDict, Tensor};
use checkpoint_core::{CheckpointError, DType, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Load a legacy pickle-based checkpoint into a flat state dict.
///
/// If the unpickled top-level dict wraps the weights under a
/// `"state_dict"` key (training checkpoints do), that inner dict is used.
pub fn load_legacy_checkpoint(path: &Path) -> Result<StateDict> {
    let bytes = std::fs::read(path)?;
    let archive = ZipArchive::parse(&bytes)?;

    let pkl_name = archive
        .names()
        .find(|n| *n == "data.pkl" || n.ends_with("/data.pkl"))
        .ok_or_else(|| CheckpointError::Load("archive has no data.pkl entry".to_string()))?
        .to_string();
    let prefix = pkl_name[..pkl_name.len() - "data.pkl".len()].to_string();

    let pickle_bytes = archive.entry_data(&pkl_name)?;
    let top = Unpickler::new(pickle_bytes).run()?;

    let Value::Dict(pairs) = top else {
        return Err(CheckpointError::Load(
            "pickle stream did not produce a dict".to_string(),
        ));
    };

    // Training checkpoints nest the weights one level down.
    let pairs = match pairs.iter().find_map(|(k, v)| match (k, v) {
        (Value::Str(s), Value::Dict(inner)) if s == "state_dict" => Some(inner.clone()),
        _ => None,
    }) {
        Some(inner) => inner,
        None => pairs,
    };

    let mut dict = StateDict::new();
    for (key, value) in pairs {
        let Value::Str(name) = key else {
            return Err(CheckpointError::Load(
                "non-string key in state dict".to_string(),
            ));
        };
        match value {
            Value::TensorStub(stub) => {
                let tensor = materialize(&archive, &prefix, &name, &stub)?;
                dict.insert(name, tensor);
            }
            other => {
                debug!(key = %name, kind = other.kind(), "skipping non-tensor entry");
            }
        }
    }
    Ok(dict)
}

/// Read a tensor's bytes out of its storage entry.
fn materialize(
    archive: &ZipArchive<'_>,
    prefix: &str,
    name: &str,
    stub: &TensorStub,
) -> Result<Tensor> {
    let numel: usize = stub.shape.iter().product();
    if !is_contiguous(&stub.shape, &stub.stride) {
        return Err(CheckpointError::Load(format!(
            "tensor '{name}' is not contiguous (stride {:?})",
            stub.stride
        )));
    }

    let entry = format!("{prefix}data/{}", stub.storage.key);
    let storage = archive.entry_data(&entry)?;

    let esize = stub.storage.dtype.size_bytes();
    let start = stub.storage_offset * esize;
    let end = start + numel * esize;
    if end > storage.len() {
        return Err(CheckpointError::Load(format!(
            "tensor '{name}' extends past its storage ({} > {})",
            end,
            storage.len()
        )));
    }

    Tensor::new(
        stub.storage.dtype,
        stub.shape.clone(),
        storage[start..end].to_vec(),
    )
}

/// Row-major contiguity check; scalars and empty tensors pass trivially.
fn is_contiguous(shape: &[usize], stride: &[usize]) -> bool {
    if stride.len() != shape.len() {
        return shape.iter().product::<usize>() <= 1;
    }
    let mut expected = 1usize;
    for (dim, st) in shape.iter().zip(stride.iter()).rev() {
        if *dim > 1 && *st != expected {
            return false;
        }
        expected *= dim.max(&1);
    }
    true
}

// ---------------------------------------------------------------------------
// Zip reading (stored entries only)
// ---------------------------------------------------------------------------

const EOCD_MAGIC: u32 = 0x0605_4B50;
const EOCD64_LOCATOR_MAGIC: u32 = 0x0706_4B50;
const EOCD64_MAGIC: u32 = 0x0606_4B50;
const CENTRAL_MAGIC: u32 = 0x0201_4B50;
const LOCAL_MAGIC: u32 = 0x0403_4B50;

struct ZipEntry {
    name: String,
    method: u16,
    compressed_size: u64,
    local_offset: u64,
}

/// Parsed central directory over a borrowed archive buffer.
///
/// Only what the torch layout needs: stored entries, read whole. CRCs are
/// not verified.
struct ZipArchive<'a> {
    bytes: &'a [u8],
    entries: Vec<ZipEntry>,
    index: HashMap<String, usize>,
}

fn le_u16(bytes: &[u8], pos: usize) -> Result<u16> {
    bytes
        .get(pos..pos + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| CheckpointError::Load("truncated zip structure".to_string()))
}

fn le_u32(bytes: &[u8], pos: usize) -> Result<u32> {
    bytes
        .get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| CheckpointError::Load("truncated zip structure".to_string()))
}

fn le_u64(bytes: &[u8], pos: usize) -> Result<u64> {
    bytes
        .get(pos..pos + 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
        .ok_or_else(|| CheckpointError::Load("truncated zip structure".to_string()))
}

impl<'a> ZipArchive<'a> {
    fn parse(bytes: &'a [u8]) -> Result<Self> {
        let eocd_pos = Self::find_eocd(bytes)?;
        let mut entry_count = u64::from(le_u16(bytes, eocd_pos + 10)?);
        let mut cd_offset = u64::from(le_u32(bytes, eocd_pos + 16)?);

        // Large archives (and torch's writer in general) use zip64.
        if entry_count == 0xFFFF || cd_offset == 0xFFFF_FFFF {
            let locator_pos = eocd_pos
                .checked_sub(20)
                .ok_or_else(|| CheckpointError::Load("missing zip64 locator".to_string()))?;
            if le_u32(bytes, locator_pos)? != EOCD64_LOCATOR_MAGIC {
                return Err(CheckpointError::Load("missing zip64 locator".to_string()));
            }
            let eocd64_pos = le_u64(bytes, locator_pos + 8)? as usize;
            if le_u32(bytes, eocd64_pos)? != EOCD64_MAGIC {
                return Err(CheckpointError::Load(
                    "bad zip64 end-of-central-directory".to_string(),
                ));
            }
            entry_count = le_u64(bytes, eocd64_pos + 32)?;
            cd_offset = le_u64(bytes, eocd64_pos + 48)?;
        }

        let mut entries = Vec::with_capacity(entry_count as usize);
        let mut index = HashMap::new();
        let mut pos = cd_offset as usize;
        for _ in 0..entry_count {
            if le_u32(bytes, pos)? != CENTRAL_MAGIC {
                return Err(CheckpointError::Load(
                    "bad central directory entry".to_string(),
                ));
            }
            let method = le_u16(bytes, pos + 10)?;
            let mut compressed_size = u64::from(le_u32(bytes, pos + 20)?);
            let uncompressed_size = u64::from(le_u32(bytes, pos + 24)?);
            let name_len = le_u16(bytes, pos + 28)? as usize;
            let extra_len = le_u16(bytes, pos + 30)? as usize;
            let comment_len = le_u16(bytes, pos + 32)? as usize;
            let mut local_offset = u64::from(le_u32(bytes, pos + 42)?);

            let name_bytes = bytes
                .get(pos + 46..pos + 46 + name_len)
                .ok_or_else(|| CheckpointError::Load("truncated zip structure".to_string()))?;
            let name = String::from_utf8_lossy(name_bytes).into_owned();

            // zip64 extra field supplies any field stored as the sentinel
            let mut extra_pos = pos + 46 + name_len;
            let extra_end = extra_pos + extra_len;
            while extra_pos + 4 <= extra_end {
                let id = le_u16(bytes, extra_pos)?;
                let field_len = le_u16(bytes, extra_pos + 2)? as usize;
                if id == 0x0001 {
                    let mut field = extra_pos + 4;
                    if uncompressed_size == 0xFFFF_FFFF {
                        field += 8;
                    }
                    if compressed_size == 0xFFFF_FFFF {
                        compressed_size = le_u64(bytes, field)?;
                        field += 8;
                    }
                    if local_offset == 0xFFFF_FFFF {
                        local_offset = le_u64(bytes, field)?;
                    }
                }
                extra_pos += 4 + field_len;
            }

            index.insert(name.clone(), entries.len());
            entries.push(ZipEntry {
                name,
                method,
                compressed_size,
                local_offset,
            });
            pos += 46 + name_len + extra_len + comment_len;
        }

        Ok(Self {
            bytes,
            entries,
            index,
        })
    }

    /// Scan backwards for the end-of-central-directory record.
    fn find_eocd(bytes: &[u8]) -> Result<usize> {
        if bytes.len() < 22 {
            return Err(CheckpointError::Load("archive too short".to_string()));
        }
        let floor = bytes.len().saturating_sub(22 + 65_536);
        let mut pos = bytes.len() - 22;
        loop {
            if le_u32(bytes, pos)? == EOCD_MAGIC {
                return Ok(pos);
            }
            if pos == floor {
                return Err(CheckpointError::Load(
                    "no end-of-central-directory record".to_string(),
                ));
            }
            pos -= 1;
        }
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Raw bytes of a stored entry.
    fn entry_data(&self, name: &str) -> Result<&'a [u8]> {
        let entry = self
            .index
            .get(name)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| CheckpointError::Load(format!("archive entry '{name}' not found")))?;
        if entry.method != 0 {
            return Err(CheckpointError::Load(format!(
                "archive entry '{name}' is compressed (method {}); only stored entries are supported",
                entry.method
            )));
        }

        let pos = entry.local_offset as usize;
        if le_u32(self.bytes, pos)? != LOCAL_MAGIC {
            return Err(CheckpointError::Load(format!(
                "bad local header for '{name}'"
            )));
        }
        let name_len = le_u16(self.bytes, pos + 26)? as usize;
        let extra_len = le_u16(self.bytes, pos + 28)? as usize;
        let start = pos + 30 + name_len + extra_len;
        let end = start + entry.compressed_size as usize;
        self.bytes
            .get(start..end)
            .ok_or_else(|| CheckpointError::Load(format!("truncated data for '{name}'")))
    }
}

// ---------------------------------------------------------------------------
// Pickle interpretation
// ---------------------------------------------------------------------------

/// A typed storage referenced by a persistent id.
#[derive(Debug, Clone, PartialEq)]
struct StorageRef {
    dtype: DType,
    key: String,
}

/// A tensor reconstructed from `_rebuild_tensor_v2`, before its storage
/// bytes are read.
#[derive(Debug, Clone, PartialEq)]
struct TensorStub {
    storage: StorageRef,
    storage_offset: usize,
    shape: Vec<usize>,
    stride: Vec<usize>,
}

/// Values the interpreter manipulates.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Global(String, String),
    Storage(StorageRef),
    TensorStub(TensorStub),
    /// Result of a reduce call we do not model; tolerated anywhere a
    /// tensor is not required.
    Opaque(String),
    /// Stack sentinel
    Mark,
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Global(_, _) => "global",
            Value::Storage(_) => "storage",
            Value::TensorStub(_) => "tensor",
            Value::Opaque(_) => "opaque",
            Value::Mark => "mark",
        }
    }
}

fn storage_dtype(class: &str) -> Result<DType> {
    match class {
        "FloatStorage" => Ok(DType::Float32),
        "DoubleStorage" => Ok(DType::Float64),
        "HalfStorage" => Ok(DType::Float16),
        "BFloat16Storage" => Ok(DType::BFloat16),
        "LongStorage" => Ok(DType::Int64),
        "IntStorage" => Ok(DType::Int32),
        "ShortStorage" => Ok(DType::Int16),
        "CharStorage" => Ok(DType::Int8),
        "ByteStorage" => Ok(DType::UInt8),
        "BoolStorage" => Ok(DType::Bool),
        other => Err(CheckpointError::Load(format!(
            "unsupported storage class 'torch.{other}'"
        ))),
    }
}

struct Unpickler<'a> {
    bytes: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    memo: HashMap<u32, Value>,
}

impl<'a> Unpickler<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            stack: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn err(msg: impl Into<String>) -> CheckpointError {
        CheckpointError::Load(format!("pickle: {}", msg.into()))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + n)
            .ok_or_else(|| Self::err("truncated stream"))?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn line(&mut self) -> Result<String> {
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
            self.pos += 1;
        }
        if self.pos >= self.bytes.len() {
            return Err(Self::err("unterminated line"));
        }
        let s = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
        self.pos += 1;
        Ok(s)
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| Self::err("stack underflow"))
    }

    /// Pop values above the topmost mark, in push order.
    fn pop_to_mark(&mut self) -> Result<Vec<Value>> {
        let mark = self
            .stack
            .iter()
            .rposition(|v| *v == Value::Mark)
            .ok_or_else(|| Self::err("no mark on stack"))?;
        let items = self.stack.split_off(mark + 1);
        self.stack.pop(); // the mark itself
        Ok(items)
    }

    fn memo_put(&mut self, idx: u32) -> Result<()> {
        let top = self
            .stack
            .last()
            .cloned()
            .ok_or_else(|| Self::err("memo of empty stack"))?;
        self.memo.insert(idx, top);
        Ok(())
    }

    fn run(mut self) -> Result<Value> {
        loop {
            let op = self.u8()?;
            match op {
                0x80 => {
                    // PROTO
                    let _version = self.u8()?;
                }
                0x95 => {
                    // FRAME (protocol 4): length is advisory
                    self.take(8)?;
                }
                0x28 => self.stack.push(Value::Mark),
                0x2E => {
                    // STOP
                    return self.pop();
                }
                0x4E => self.stack.push(Value::None),
                0x88 => self.stack.push(Value::Bool(true)),
                0x89 => self.stack.push(Value::Bool(false)),
                0x4A => {
                    let v = self.i32()?;
                    self.stack.push(Value::Int(i64::from(v)));
                }
                0x4B => {
                    let v = self.u8()?;
                    self.stack.push(Value::Int(i64::from(v)));
                }
                0x4D => {
                    let v = self.u16()?;
                    self.stack.push(Value::Int(i64::from(v)));
                }
                0x8A => {
                    // LONG1: little-endian two's complement
                    let n = self.u8()? as usize;
                    if n > 8 {
                        return Err(Self::err("integer too large"));
                    }
                    let raw = self.take(n)?;
                    let mut buf = [0u8; 8];
                    buf[..n].copy_from_slice(raw);
                    if n > 0 && raw[n - 1] & 0x80 != 0 {
                        for b in buf.iter_mut().skip(n) {
                            *b = 0xFF;
                        }
                    }
                    self.stack.push(Value::Int(i64::from_le_bytes(buf)));
                }
                0x47 => {
                    // BINFLOAT: big-endian f64
                    let b = self.take(8)?;
                    self.stack
                        .push(Value::Float(f64::from_be_bytes(b.try_into().unwrap())));
                }
                0x58 => {
                    // BINUNICODE
                    let n = self.u32()? as usize;
                    let raw = self.take(n)?;
                    self.stack
                        .push(Value::Str(String::from_utf8_lossy(raw).into_owned()));
                }
                0x8C => {
                    // SHORT_BINUNICODE
                    let n = self.u8()? as usize;
                    let raw = self.take(n)?;
                    self.stack
                        .push(Value::Str(String::from_utf8_lossy(raw).into_owned()));
                }
                0x54 | 0x55 => {
                    // BINSTRING / SHORT_BINSTRING
                    let n = if op == 0x54 {
                        self.u32()? as usize
                    } else {
                        self.u8()? as usize
                    };
                    let raw = self.take(n)?;
                    self.stack
                        .push(Value::Str(String::from_utf8_lossy(raw).into_owned()));
                }
                0x42 | 0x43 => {
                    // BINBYTES / SHORT_BINBYTES
                    let n = if op == 0x42 {
                        self.u32()? as usize
                    } else {
                        self.u8()? as usize
                    };
                    let raw = self.take(n)?;
                    self.stack.push(Value::Bytes(raw.to_vec()));
                }
                0x29 => self.stack.push(Value::Tuple(Vec::new())),
                0x74 => {
                    let items = self.pop_to_mark()?;
                    self.stack.push(Value::Tuple(items));
                }
                0x85 => {
                    let a = self.pop()?;
                    self.stack.push(Value::Tuple(vec![a]));
                }
                0x86 => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::Tuple(vec![a, b]));
                }
                0x87 => {
                    let c = self.pop()?;
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::Tuple(vec![a, b, c]));
                }
                0x5D => self.stack.push(Value::List(Vec::new())),
                0x61 => {
                    // APPEND
                    let item = self.pop()?;
                    match self.stack.last_mut() {
                        Some(Value::List(items)) => items.push(item),
                        _ => return Err(Self::err("append to non-list")),
                    }
                }
                0x65 => {
                    // APPENDS
                    let items = self.pop_to_mark()?;
                    match self.stack.last_mut() {
                        Some(Value::List(list)) => list.extend(items),
                        _ => return Err(Self::err("appends to non-list")),
                    }
                }
                0x7D => self.stack.push(Value::Dict(Vec::new())),
                0x73 => {
                    // SETITEM
                    let value = self.pop()?;
                    let key = self.pop()?;
                    match self.stack.last_mut() {
                        Some(Value::Dict(pairs)) => pairs.push((key, value)),
                        _ => return Err(Self::err("setitem on non-dict")),
                    }
                }
                0x75 => {
                    // SETITEMS
                    let items = self.pop_to_mark()?;
                    if items.len() % 2 != 0 {
                        return Err(Self::err("odd number of setitems values"));
                    }
                    match self.stack.last_mut() {
                        Some(Value::Dict(pairs)) => {
                            let mut iter = items.into_iter();
                            while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                                pairs.push((k, v));
                            }
                        }
                        _ => return Err(Self::err("setitems on non-dict")),
                    }
                }
                0x71 => {
                    let idx = self.u8()?;
                    self.memo_put(u32::from(idx))?;
                }
                0x72 => {
                    let idx = self.u32()?;
                    self.memo_put(idx)?;
                }
                0x94 => {
                    let idx = self.memo.len() as u32;
                    self.memo_put(idx)?;
                }
                0x68 => {
                    let idx = u32::from(self.u8()?);
                    let v = self
                        .memo
                        .get(&idx)
                        .cloned()
                        .ok_or_else(|| Self::err("memo miss"))?;
                    self.stack.push(v);
                }
                0x6A => {
                    let idx = self.u32()?;
                    let v = self
                        .memo
                        .get(&idx)
                        .cloned()
                        .ok_or_else(|| Self::err("memo miss"))?;
                    self.stack.push(v);
                }
                0x63 => {
                    // GLOBAL
                    let module = self.line()?;
                    let name = self.line()?;
                    self.stack.push(Value::Global(module, name));
                }
                0x93 => {
                    // STACK_GLOBAL
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module, name) {
                        (Value::Str(m), Value::Str(n)) => self.stack.push(Value::Global(m, n)),
                        _ => return Err(Self::err("stack_global expects two strings")),
                    }
                }
                0x51 => {
                    // BINPERSID
                    let pid = self.pop()?;
                    self.stack.push(resolve_persistent_id(pid)?);
                }
                0x52 => {
                    // REDUCE
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    self.stack.push(reduce(callable, args)?);
                }
                other => {
                    return Err(Self::err(format!("unsupported opcode 0x{other:02X}")));
                }
            }
        }
    }
}

/// Resolve a torch persistent id tuple:
/// `('storage', <StorageClass>, <key>, <device>, <numel>)`.
fn resolve_persistent_id(pid: Value) -> Result<Value> {
    let Value::Tuple(items) = pid else {
        return Err(Unpickler::err("persistent id is not a tuple"));
    };
    match items.as_slice() {
        [Value::Str(tag), Value::Global(_, class), Value::Str(key), _device, _numel]
            if tag == "storage" =>
        {
            Ok(Value::Storage(StorageRef {
                dtype: storage_dtype(class)?,
                key: key.clone(),
            }))
        }
        _ => Err(Unpickler::err("unrecognized persistent id layout")),
    }
}

fn usize_of(v: &Value) -> Result<usize> {
    match v {
        Value::Int(i) if *i >= 0 => Ok(*i as usize),
        _ => Err(Unpickler::err("expected non-negative integer")),
    }
}

fn usize_tuple(v: &Value) -> Result<Vec<usize>> {
    match v {
        Value::Tuple(items) | Value::List(items) => items.iter().map(usize_of).collect(),
        _ => Err(Unpickler::err("expected tuple of integers")),
    }
}

/// Model the reduce calls torch emits; anything else becomes an opaque
/// value that only errors if a tensor was required in its place.
fn reduce(callable: Value, args: Value) -> Result<Value> {
    let Value::Global(module, name) = &callable else {
        return Err(Unpickler::err("reduce callable is not a global"));
    };
    let Value::Tuple(args) = args else {
        return Err(Unpickler::err("reduce args are not a tuple"));
    };

    match (module.as_str(), name.as_str()) {
        ("torch._utils", "_rebuild_tensor_v2") | ("torch._utils", "_rebuild_tensor") => {
            if args.len() < 4 {
                return Err(Unpickler::err("rebuild_tensor with too few arguments"));
            }
            let Value::Storage(storage) = &args[0] else {
                return Err(Unpickler::err("rebuild_tensor without storage"));
            };
            Ok(Value::TensorStub(TensorStub {
                storage: storage.clone(),
                storage_offset: usize_of(&args[1])?,
                shape: usize_tuple(&args[2])?,
                stride: usize_tuple(&args[3])?,
            }))
        }
        ("torch._utils", "_rebuild_parameter") => match args.into_iter().next() {
            Some(tensor @ Value::TensorStub(_)) => Ok(tensor),
            _ => Err(Unpickler::err("rebuild_parameter without tensor")),
        },
        ("collections", "OrderedDict") => Ok(Value::Dict(Vec::new())),
        (module, name) => Ok(Value::Opaque(format!("{module}.{name}"))),
    }
}
