//! In-memory compiled model, as reconstructed by the parser.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::codec::{ByteReader, ByteWriter};

/// Shape entry marking an unknown dimension.
pub const UNKNOWN_DIM: i64 = -1;
/// Single-entry shape marking an unknown rank.
pub const UNKNOWN_RANK: i64 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Float16,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Bool,
}

impl DataType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Int8 | DataType::Uint8 | DataType::Bool => 1,
            DataType::Float16 | DataType::Int16 => 2,
            DataType::Float32 | DataType::Int32 => 4,
            DataType::Int64 => 8,
        }
    }

    /// Stable numeric code used in runtime tensor descriptors.
    pub fn code(&self) -> i64 {
        match self {
            DataType::Float32 => 0,
            DataType::Float16 => 1,
            DataType::Int8 => 2,
            DataType::Int32 => 3,
            DataType::Uint8 => 4,
            DataType::Int16 => 6,
            DataType::Int64 => 9,
            DataType::Bool => 12,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => DataType::Float32,
            1 => DataType::Float16,
            2 => DataType::Int8,
            3 => DataType::Int32,
            4 => DataType::Uint8,
            6 => DataType::Int16,
            9 => DataType::Int64,
            12 => DataType::Bool,
            _ => return None,
        })
    }
}

/// Tensor descriptor as declared by the model definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub name: String,
    pub dtype: DataType,
    #[serde(default)]
    pub format: i64,
    pub shape: Vec<i64>,
    #[serde(default)]
    pub original_shape: Vec<i64>,
    /// Per-dimension `(min, max)`; `max == -1` means unbounded.
    #[serde(default)]
    pub shape_range: Vec<(i64, i64)>,
}

impl TensorDesc {
    pub fn new(name: impl Into<String>, dtype: DataType, shape: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            dtype,
            format: 0,
            original_shape: shape.clone(),
            shape,
            shape_range: Vec::new(),
        }
    }

    pub fn with_range(mut self, range: Vec<(i64, i64)>) -> Self {
        self.shape_range = range;
        self
    }

    pub fn is_unknown_rank(&self) -> bool {
        self.shape == [UNKNOWN_RANK]
    }

    pub fn is_dynamic(&self) -> bool {
        self.shape.iter().any(|&d| d < 0)
    }

    pub fn element_count(shape: &[i64]) -> Option<usize> {
        shape.iter().try_fold(1usize, |acc, &d| {
            usize::try_from(d).ok().and_then(|d| acc.checked_mul(d))
        })
    }

    /// Bytes needed for the largest tensor this descriptor admits: the exact
    /// size when static, the range maximum when every dynamic dimension is
    /// bounded, `None` otherwise.
    pub fn static_byte_size(&self) -> Option<usize> {
        if self.is_unknown_rank() {
            return None;
        }
        if !self.is_dynamic() {
            return Self::element_count(&self.shape)?.checked_mul(self.dtype.size_in_bytes());
        }
        if self.shape_range.len() != self.shape.len() {
            return None;
        }
        let bounded: Option<Vec<i64>> = self
            .shape
            .iter()
            .zip(&self.shape_range)
            .map(|(&dim, &(_, max))| match (dim >= 0, max >= 0) {
                (true, _) => Some(dim),
                (false, true) => Some(max),
                (false, false) => None,
            })
            .collect();
        Self::element_count(&bounded?)?.checked_mul(self.dtype.size_in_bytes())
    }
}

/// Model-definition partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDef {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<TensorDesc>,
    #[serde(default)]
    pub outputs: Vec<TensorDesc>,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl ModelDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: BTreeMap::new(),
        }
    }

    /// Any input or output whose shape is not known up front.
    pub fn has_dynamic_shape(&self) -> bool {
        self.inputs.iter().chain(&self.outputs).any(TensorDesc::is_dynamic)
    }
}

/// One entry of the task-info partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDef {
    pub kind: String,
    #[serde(default)]
    pub kernel: Option<String>,
    #[serde(default)]
    pub stream_id: u32,
}

/// Named kernel binaries from a kernel partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelStore {
    kernels: BTreeMap<String, Vec<u8>>,
}

impl KernelStore {
    pub fn insert(&mut self, name: impl Into<String>, bin: Vec<u8>) {
        self.kernels.insert(name.into(), bin);
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.kernels.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// `[count u32]{[name_len u32][name][len u32][bytes]}*`, all consumed.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut reader = ByteReader::new(bytes);
        let count = reader.read_u32()?;
        let mut store = Self::default();
        for _ in 0..count {
            let name = std::str::from_utf8(reader.read_len_prefixed()?).ok()?;
            let bin = reader.read_len_prefixed()?;
            store.insert(name, bin.to_vec());
        }
        (reader.remaining() == 0).then_some(store)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::default();
        writer.put_u32(self.kernels.len() as u32);
        for (name, bin) in &self.kernels {
            writer.put_len_prefixed(name.as_bytes()).put_len_prefixed(bin);
        }
        writer.into_inner()
    }
}

/// One model reconstructed from its partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledModel {
    pub def: ModelDef,
    pub weights: Vec<u8>,
    pub tasks: Vec<TaskDef>,
    pub tbe_kernels: KernelStore,
    pub cust_kernels: KernelStore,
}

impl CompiledModel {
    pub fn new(def: ModelDef) -> Self {
        Self {
            def,
            weights: Vec::new(),
            tasks: Vec::new(),
            tbe_kernels: KernelStore::default(),
            cust_kernels: KernelStore::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }
}

/// Result of parsing a container: the first model plus any siblings by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootModel {
    pub root: Arc<CompiledModel>,
    pub submodels: BTreeMap<String, Arc<CompiledModel>>,
}

impl RootModel {
    pub fn has_dynamic_shape(&self) -> bool {
        self.root.def.has_dynamic_shape()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_size_is_exact() {
        let desc = TensorDesc::new("x", DataType::Float32, vec![2, 3]);
        assert!(!desc.is_dynamic());
        assert_eq!(desc.static_byte_size(), Some(24));
    }

    #[test]
    fn bounded_range_gives_maximum() {
        let desc = TensorDesc::new("x", DataType::Int16, vec![-1, 4]).with_range(vec![(1, 8), (4, 4)]);
        assert_eq!(desc.static_byte_size(), Some(64));
        let open = TensorDesc::new("y", DataType::Int16, vec![-1]).with_range(vec![(1, -1)]);
        assert_eq!(open.static_byte_size(), None);
        let unranked = TensorDesc::new("z", DataType::Int8, vec![UNKNOWN_RANK]);
        assert!(unranked.is_unknown_rank());
        assert_eq!(unranked.static_byte_size(), None);
    }

    #[test]
    fn kernel_store_rejects_trailing_bytes() {
        let mut store = KernelStore::default();
        store.insert("k0", vec![1, 2, 3]);
        let mut bytes = store.encode();
        assert_eq!(KernelStore::decode(&bytes), Some(store));
        bytes.push(0);
        assert_eq!(KernelStore::decode(&bytes), None);
    }

    #[test]
    fn dtype_codes_are_stable() {
        for dtype in [DataType::Float32, DataType::Int64, DataType::Bool] {
            assert_eq!(DataType::from_code(dtype.code()), Some(dtype));
        }
        assert_eq!(DataType::from_code(99), None);
    }
}
