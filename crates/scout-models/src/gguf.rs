//! GGUF artifact reader and writer.
//!
//! Layout (little-endian):
//! ```text
//! magic "GGUF" | version u32 | n_tensors u64 | n_kv u64
//! n_kv × (key: string, type: u32, value)
//! n_tensors × (name: string, n_dims: u32, dims: u64 × n_dims, type: u32, offset: u64)
//! padding to `general.alignment` (default 32)
//! tensor data, each tensor at data_start + offset
//! ```
//! Strings are a u64 length followed by UTF-8 bytes. Dimension 0 is the
//! fastest-varying axis, so a `[out][in]` weight matrix has dims `[in, out]`.

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use scout_engine::LoadError;
use tracing::debug;

use crate::mmap::MappedFile;
use crate::quant::GgmlType;

pub const GGUF_MAGIC: &[u8; 4] = b"GGUF";
pub const GGUF_VERSION: u32 = 3;
pub const DEFAULT_ALIGNMENT: u64 = 32;

const TYPE_U8: u32 = 0;
const TYPE_I8: u32 = 1;
const TYPE_U16: u32 = 2;
const TYPE_I16: u32 = 3;
const TYPE_U32: u32 = 4;
const TYPE_I32: u32 = 5;
const TYPE_F32: u32 = 6;
const TYPE_BOOL: u32 = 7;
const TYPE_STRING: u32 = 8;
const TYPE_ARRAY: u32 = 9;
const TYPE_U64: u32 = 10;
const TYPE_I64: u32 = 11;
const TYPE_F64: u32 = 12;

/// A typed metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    /// Homogeneous array; the element type id is kept for re-serialization.
    Array(u32, Vec<MetadataValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl MetadataValue {
    pub fn type_id(&self) -> u32 {
        match self {
            MetadataValue::U8(_) => TYPE_U8,
            MetadataValue::I8(_) => TYPE_I8,
            MetadataValue::U16(_) => TYPE_U16,
            MetadataValue::I16(_) => TYPE_I16,
            MetadataValue::U32(_) => TYPE_U32,
            MetadataValue::I32(_) => TYPE_I32,
            MetadataValue::F32(_) => TYPE_F32,
            MetadataValue::Bool(_) => TYPE_BOOL,
            MetadataValue::String(_) => TYPE_STRING,
            MetadataValue::Array(..) => TYPE_ARRAY,
            MetadataValue::U64(_) => TYPE_U64,
            MetadataValue::I64(_) => TYPE_I64,
            MetadataValue::F64(_) => TYPE_F64,
        }
    }

    /// Any non-negative integer value.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            MetadataValue::U8(v) => Some(v as u64),
            MetadataValue::U16(v) => Some(v as u64),
            MetadataValue::U32(v) => Some(v as u64),
            MetadataValue::U64(v) => Some(v),
            MetadataValue::I8(v) => u64::try_from(v).ok(),
            MetadataValue::I16(v) => u64::try_from(v).ok(),
            MetadataValue::I32(v) => u64::try_from(v).ok(),
            MetadataValue::I64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            MetadataValue::I8(v) => Some(v as i64),
            MetadataValue::I16(v) => Some(v as i64),
            MetadataValue::I32(v) => Some(v as i64),
            MetadataValue::I64(v) => Some(v),
            _ => self.as_u64().and_then(|v| i64::try_from(v).ok()),
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            MetadataValue::F32(v) => Some(v),
            MetadataValue::F64(v) => Some(v as f32),
            _ => self.as_i64().map(|v| v as f32),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            MetadataValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[MetadataValue]> {
        match self {
            MetadataValue::Array(_, items) => Some(items),
            _ => None,
        }
    }

    /// Array of strings, e.g. `tokenizer.ggml.tokens`.
    pub fn string_array<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MetadataValue::Array(
            TYPE_STRING,
            items
                .into_iter()
                .map(|s| MetadataValue::String(s.into()))
                .collect(),
        )
    }

    pub fn f32_array(items: impl IntoIterator<Item = f32>) -> Self {
        MetadataValue::Array(TYPE_F32, items.into_iter().map(MetadataValue::F32).collect())
    }

    pub fn i32_array(items: impl IntoIterator<Item = i32>) -> Self {
        MetadataValue::Array(TYPE_I32, items.into_iter().map(MetadataValue::I32).collect())
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::String(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::String(s)
    }
}

impl From<u32> for MetadataValue {
    fn from(v: u32) -> Self {
        MetadataValue::U32(v)
    }
}

impl From<f32> for MetadataValue {
    fn from(v: f32) -> Self {
        MetadataValue::F32(v)
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

/// Location and type of one tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<u64>,
    pub ggml_type: GgmlType,
    /// Offset relative to the start of the tensor data section.
    pub offset: u64,
}

/// Product of `dims`, or `None` if it overflows `u64`.
fn element_count(dims: &[u64]) -> Option<u64> {
    dims.iter().try_fold(1u64, |n, &d| n.checked_mul(d))
}

impl TensorInfo {
    /// Saturates at `u64::MAX`. Headers from [`GgufHeader::parse`] never do.
    pub fn n_elements(&self) -> u64 {
        element_count(&self.dims).unwrap_or(u64::MAX)
    }

    /// Bytes occupied, if the type's block layout is known and the element
    /// count is representable.
    pub fn byte_size(&self) -> Option<u64> {
        self.ggml_type.data_size(element_count(&self.dims)?)
    }
}

/// Parsed header: metadata, tensor directory and data section offset.
#[derive(Debug, Clone)]
pub struct GgufHeader {
    pub version: u32,
    pub metadata: BTreeMap<String, MetadataValue>,
    pub tensors: Vec<TensorInfo>,
    pub alignment: u64,
    /// Absolute file offset where tensor data begins.
    pub data_offset: u64,
}

fn truncated(what: &str) -> impl Fn(io::Error) -> LoadError + '_ {
    move |_| LoadError::Malformed(format!("truncated GGUF header while reading {what}"))
}

struct HeaderReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> HeaderReader<'a> {
    fn remaining(&self) -> u64 {
        (self.cursor.get_ref().len() as u64).saturating_sub(self.cursor.position())
    }

    fn u32(&mut self, what: &str) -> Result<u32, LoadError> {
        self.cursor.read_u32::<LittleEndian>().map_err(truncated(what))
    }

    fn u64(&mut self, what: &str) -> Result<u64, LoadError> {
        self.cursor.read_u64::<LittleEndian>().map_err(truncated(what))
    }

    /// Reject a declared element count that cannot fit in the remaining bytes.
    fn check_count(&self, count: u64, min_size: u64, what: &str) -> Result<usize, LoadError> {
        if count.saturating_mul(min_size) > self.remaining() {
            return Err(LoadError::Malformed(format!(
                "{what} declares {count} entries, more than the file can hold"
            )));
        }
        usize::try_from(count).map_err(|_| LoadError::Malformed(format!("{what} count overflows")))
    }

    fn string(&mut self, what: &str) -> Result<String, LoadError> {
        let len = self.u64(what)?;
        let len = self.check_count(len, 1, what)?;
        let mut buf = vec![0u8; len];
        self.cursor.read_exact(&mut buf).map_err(truncated(what))?;
        String::from_utf8(buf)
            .map_err(|_| LoadError::Malformed(format!("{what} is not valid UTF-8")))
    }

    fn value(&mut self, type_id: u32, key: &str) -> Result<MetadataValue, LoadError> {
        let c = &mut self.cursor;
        let t = truncated(key);
        Ok(match type_id {
            TYPE_U8 => MetadataValue::U8(c.read_u8().map_err(t)?),
            TYPE_I8 => MetadataValue::I8(c.read_i8().map_err(t)?),
            TYPE_U16 => MetadataValue::U16(c.read_u16::<LittleEndian>().map_err(t)?),
            TYPE_I16 => MetadataValue::I16(c.read_i16::<LittleEndian>().map_err(t)?),
            TYPE_U32 => MetadataValue::U32(c.read_u32::<LittleEndian>().map_err(t)?),
            TYPE_I32 => MetadataValue::I32(c.read_i32::<LittleEndian>().map_err(t)?),
            TYPE_F32 => MetadataValue::F32(c.read_f32::<LittleEndian>().map_err(t)?),
            TYPE_BOOL => MetadataValue::Bool(c.read_u8().map_err(t)? != 0),
            TYPE_U64 => MetadataValue::U64(c.read_u64::<LittleEndian>().map_err(t)?),
            TYPE_I64 => MetadataValue::I64(c.read_i64::<LittleEndian>().map_err(t)?),
            TYPE_F64 => MetadataValue::F64(c.read_f64::<LittleEndian>().map_err(t)?),
            TYPE_STRING => MetadataValue::String(self.string(key)?),
            TYPE_ARRAY => {
                let elem_type = self.u32(key)?;
                if elem_type == TYPE_ARRAY {
                    return Err(LoadError::Malformed(format!("{key}: nested arrays")));
                }
                let len = self.u64(key)?;
                let len = self.check_count(len, 1, key)?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.value(elem_type, key)?);
                }
                MetadataValue::Array(elem_type, items)
            }
            other => {
                return Err(LoadError::Malformed(format!(
                    "{key}: unknown metadata type {other}"
                )))
            }
        })
    }
}

impl GgufHeader {
    /// Parse the header and tensor directory from the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, LoadError> {
        let mut r = HeaderReader {
            cursor: Cursor::new(bytes),
        };

        let mut magic = [0u8; 4];
        r.cursor.read_exact(&mut magic).map_err(truncated("magic"))?;
        if &magic != GGUF_MAGIC {
            return Err(LoadError::Malformed("missing GGUF magic".into()));
        }
        let version = r.u32("version")?;
        if !(2..=3).contains(&version) {
            return Err(LoadError::Malformed(format!(
                "unsupported GGUF version {version}"
            )));
        }

        let n_tensors = r.u64("tensor count")?;
        let n_tensors = r.check_count(n_tensors, 8, "tensor directory")?;
        let n_kv = r.u64("metadata count")?;
        let n_kv = r.check_count(n_kv, 12, "metadata")?;

        let mut metadata = BTreeMap::new();
        for _ in 0..n_kv {
            let key = r.string("metadata key")?;
            let type_id = r.u32(&key)?;
            let value = r.value(type_id, &key)?;
            metadata.insert(key, value);
        }

        let mut tensors = Vec::with_capacity(n_tensors);
        for _ in 0..n_tensors {
            let name = r.string("tensor name")?;
            let n_dims = r.u32(&name)?;
            if n_dims == 0 || n_dims > 4 {
                return Err(LoadError::Malformed(format!(
                    "tensor {name} has {n_dims} dimensions"
                )));
            }
            let mut dims = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                dims.push(r.u64(&name)?);
            }
            if element_count(&dims).is_none() {
                return Err(LoadError::Malformed(format!(
                    "tensor {name} dimensions {dims:?} overflow the element count"
                )));
            }
            let ggml_type = GgmlType::from_id(r.u32(&name)?);
            let offset = r.u64(&name)?;
            tensors.push(TensorInfo {
                name,
                dims,
                ggml_type,
                offset,
            });
        }

        let alignment = match metadata.get("general.alignment") {
            Some(v) => v
                .as_u64()
                .filter(|a| *a > 0)
                .ok_or_else(|| LoadError::Malformed("invalid general.alignment".into()))?,
            None => DEFAULT_ALIGNMENT,
        };
        let data_offset = align_to(r.cursor.position(), alignment);

        Ok(GgufHeader {
            version,
            metadata,
            tensors,
            alignment,
            data_offset,
        })
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetadataValue::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(MetadataValue::as_u64)
    }

    pub fn get_f32(&self, key: &str) -> Option<f32> {
        self.get(key).and_then(MetadataValue::as_f32)
    }

    /// A required unsigned integer key.
    pub fn require_u64(&self, key: &str) -> Result<u64, LoadError> {
        self.get_u64(key)
            .ok_or_else(|| LoadError::Malformed(format!("missing metadata key {key}")))
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// The type holding the most elements across 2-D weight tensors.
    pub fn dominant_weight_type(&self) -> Option<GgmlType> {
        let mut totals: Vec<(GgmlType, u64)> = Vec::new();
        for t in self.tensors.iter().filter(|t| t.dims.len() >= 2) {
            match totals.iter_mut().find(|(ty, _)| *ty == t.ggml_type) {
                Some((_, n)) => *n = n.saturating_add(t.n_elements()),
                None => totals.push((t.ggml_type, t.n_elements())),
            }
        }
        // Ties resolve to the first type seen.
        totals
            .into_iter()
            .fold(None, |best: Option<(GgmlType, u64)>, cur| match best {
                Some(b) if b.1 >= cur.1 => Some(b),
                _ => Some(cur),
            })
            .map(|(ty, _)| ty)
    }
}

fn align_to(offset: u64, alignment: u64) -> u64 {
    offset.div_ceil(alignment) * alignment
}

/// A memory-mapped GGUF artifact.
#[derive(Debug)]
pub struct GgufFile {
    map: MappedFile,
    header: GgufHeader,
}

impl GgufFile {
    pub fn open(path: &Path) -> Result<Self, LoadError> {
        let map = MappedFile::open(path)?;
        let header = GgufHeader::parse(map.as_bytes())?;

        let file_size = map.size() as u64;
        for t in &header.tensors {
            if let Some(size) = t.byte_size() {
                let end = header
                    .data_offset
                    .checked_add(t.offset)
                    .and_then(|start| start.checked_add(size));
                if end.map_or(true, |end| end > file_size) {
                    return Err(LoadError::Malformed(format!(
                        "tensor {} data lies outside the file",
                        t.name
                    )));
                }
            }
        }
        debug!(
            path = %path.display(),
            version = header.version,
            tensors = header.tensors.len(),
            metadata = header.metadata.len(),
            "parsed GGUF header"
        );
        Ok(GgufFile { map, header })
    }

    pub fn header(&self) -> &GgufHeader {
        &self.header
    }

    /// Raw bytes of a tensor.
    pub fn tensor_data(&self, info: &TensorInfo) -> Result<&[u8], LoadError> {
        let size = info
            .byte_size()
            .ok_or_else(|| LoadError::UnsupportedQuantization(info.ggml_type.name()))?;
        let start = self.header.data_offset + info.offset;
        self.map.slice(start as usize, size as usize)
    }

    pub fn file_size(&self) -> usize {
        self.map.size()
    }
}

struct PendingTensor {
    name: String,
    dims: Vec<u64>,
    ggml_type: GgmlType,
    data: Vec<u8>,
}

/// Builds a GGUF v3 artifact in memory.
#[derive(Default)]
pub struct GgufWriter {
    metadata: Vec<(String, MetadataValue)>,
    tensors: Vec<PendingTensor>,
}

impl GgufWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a metadata key, replacing any earlier value.
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        let key = key.into();
        let value = value.into();
        match self.metadata.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.metadata.push((key, value)),
        }
    }

    /// Add an already-encoded tensor. `data` must match the type's layout.
    pub fn add_tensor(
        &mut self,
        name: impl Into<String>,
        dims: &[u64],
        ggml_type: GgmlType,
        data: Vec<u8>,
    ) -> Result<(), LoadError> {
        let name = name.into();
        let expected = element_count(dims)
            .and_then(|n| ggml_type.data_size(n))
            .ok_or_else(|| {
                LoadError::Malformed(format!("tensor {name}: dimensions {dims:?} invalid for {ggml_type}"))
            })?;
        if expected != data.len() as u64 {
            return Err(LoadError::Malformed(format!(
                "tensor {name}: expected {expected} bytes, got {}",
                data.len()
            )));
        }
        self.tensors.push(PendingTensor {
            name,
            dims: dims.to_vec(),
            ggml_type,
            data,
        });
        Ok(())
    }

    fn alignment(&self) -> u64 {
        self.metadata
            .iter()
            .find(|(k, _)| k == "general.alignment")
            .and_then(|(_, v)| v.as_u64())
            .filter(|a| *a > 0)
            .unwrap_or(DEFAULT_ALIGNMENT)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let alignment = self.alignment();
        let mut header = Vec::new();
        header.write_all(GGUF_MAGIC)?;
        header.write_u32::<LittleEndian>(GGUF_VERSION)?;
        header.write_u64::<LittleEndian>(self.tensors.len() as u64)?;
        header.write_u64::<LittleEndian>(self.metadata.len() as u64)?;

        for (key, value) in &self.metadata {
            write_string(&mut header, key)?;
            header.write_u32::<LittleEndian>(value.type_id())?;
            write_value(&mut header, value)?;
        }

        let mut offset = 0u64;
        let mut offsets = Vec::with_capacity(self.tensors.len());
        for t in &self.tensors {
            offset = align_to(offset, alignment);
            offsets.push(offset);
            write_string(&mut header, &t.name)?;
            header.write_u32::<LittleEndian>(t.dims.len() as u32)?;
            for d in &t.dims {
                header.write_u64::<LittleEndian>(*d)?;
            }
            header.write_u32::<LittleEndian>(t.ggml_type.id())?;
            header.write_u64::<LittleEndian>(offset)?;
            offset += t.data.len() as u64;
        }

        let data_start = align_to(header.len() as u64, alignment);
        header.resize(data_start as usize, 0);
        w.write_all(&header)?;

        let mut written = 0u64;
        for (t, start) in self.tensors.iter().zip(offsets) {
            w.write_all(&vec![0u8; (start - written) as usize])?;
            w.write_all(&t.data)?;
            written = start + t.data.len() as u64;
        }
        w.flush()
    }

    pub fn write_file(&self, path: &Path) -> Result<(), LoadError> {
        let io_err = |source| LoadError::Io {
            path: path.display().to_string(),
            source,
        };
        let file = std::fs::File::create(path).map_err(io_err)?;
        let mut out = io::BufWriter::new(file);
        self.write_to(&mut out).map_err(io_err)
    }
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_u64::<LittleEndian>(s.len() as u64)?;
    w.write_all(s.as_bytes())
}

fn write_value<W: Write>(w: &mut W, value: &MetadataValue) -> io::Result<()> {
    match value {
        MetadataValue::U8(v) => w.write_u8(*v),
        MetadataValue::I8(v) => w.write_i8(*v),
        MetadataValue::U16(v) => w.write_u16::<LittleEndian>(*v),
        MetadataValue::I16(v) => w.write_i16::<LittleEndian>(*v),
        MetadataValue::U32(v) => w.write_u32::<LittleEndian>(*v),
        MetadataValue::I32(v) => w.write_i32::<LittleEndian>(*v),
        MetadataValue::F32(v) => w.write_f32::<LittleEndian>(*v),
        MetadataValue::Bool(v) => w.write_u8(*v as u8),
        MetadataValue::String(s) => write_string(w, s),
        MetadataValue::U64(v) => w.write_u64::<LittleEndian>(*v),
        MetadataValue::I64(v) => w.write_i64::<LittleEndian>(*v),
        MetadataValue::F64(v) => w.write_f64::<LittleEndian>(*v),
        MetadataValue::Array(elem_type, items) => {
            w.write_u32::<LittleEndian>(*elem_type)?;
            w.write_u64::<LittleEndian>(items.len() as u64)?;
            for item in items {
                if item.type_id() != *elem_type {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "heterogeneous metadata array",
                    ));
                }
                write_value(w, item)?;
            }
            Ok(())
        }
    }
}
