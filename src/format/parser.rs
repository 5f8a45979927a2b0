//! Incremental model parser.
//!
//! Bytes arrive in arbitrarily sized chunks at strictly contiguous offsets.
//! Every stage (outer header, partition-table header, table, each partition)
//! has a known byte count once its predecessor is parsed; the parser fills
//! the current stage's destination and interprets it as soon as it is full,
//! so one chunk may complete several stages.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::codec::ByteReader;
use super::model::{CompiledModel, KernelStore, ModelDef, RootModel, TaskDef};
use super::{
    ParseError, PartitionType, ALLOWED_PARTITION_COUNTS, FORMAT_VERSION, HEADER_SIZE, MODEL_MAGIC,
    PARTITION_ENTRY_SIZE, PARTITION_TABLE_HEADER_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStage {
    Uninitialized,
    Header,
    PartitionTableHeader,
    PartitionTable,
    Partition(usize),
    Completed,
    Poisoned,
}

#[derive(Debug, Clone, Copy)]
struct PartitionEntry {
    kind: PartitionType,
    size: u64,
}

/// Pieces of the model currently being reconstructed.
#[derive(Debug, Default)]
struct PartialModel {
    def: Option<ModelDef>,
    weights: Vec<u8>,
    tasks: Vec<TaskDef>,
    tbe_kernels: KernelStore,
    cust_kernels: KernelStore,
}

#[derive(Debug)]
pub struct IncrementalModelParser {
    model_size: u64,
    consumed: u64,
    stage: ParseStage,
    /// Bytes still missing from the current stage's destination.
    need: usize,
    staging: Vec<u8>,
    model_count: u32,
    table: Vec<PartitionEntry>,
    current: PartialModel,
    finished: Vec<CompiledModel>,
    result: Option<RootModel>,
}

impl IncrementalModelParser {
    pub fn new(model_size: u64) -> Self {
        Self {
            model_size,
            consumed: 0,
            stage: ParseStage::Uninitialized,
            need: HEADER_SIZE,
            staging: Vec::with_capacity(HEADER_SIZE),
            model_count: 0,
            table: Vec::new(),
            current: PartialModel::default(),
            finished: Vec::new(),
            result: None,
        }
    }

    pub fn stage(&self) -> ParseStage {
        self.stage
    }

    /// Offset the next chunk must start at.
    pub fn expected_offset(&self) -> u64 {
        self.consumed
    }

    pub fn model_size(&self) -> u64 {
        self.model_size
    }

    pub fn is_completed(&self) -> bool {
        self.stage == ParseStage::Completed
    }

    pub fn model(&self) -> Result<&RootModel, ParseError> {
        self.result.as_ref().ok_or(ParseError::Incomplete)
    }

    /// Feed the chunk starting at `offset`.
    ///
    /// Offset and precondition failures leave the parser untouched; any other
    /// error poisons it.
    pub fn parse_and_deserialize(&mut self, offset: u64, data: &[u8]) -> Result<(), ParseError> {
        if data.is_empty() {
            return Err(ParseError::EmptyChunk);
        }
        match self.stage {
            ParseStage::Completed => return Err(ParseError::AlreadyCompleted),
            ParseStage::Poisoned => return Err(ParseError::Poisoned),
            _ => {}
        }
        if offset != self.consumed {
            return Err(ParseError::OffsetMismatch { expected: self.consumed, got: offset });
        }

        self.consume(data).map_err(|e| {
            if e.poisons() {
                tracing::warn!(error = %e, offset, "model parser poisoned");
                self.stage = ParseStage::Poisoned;
                self.staging = Vec::new();
                self.current = PartialModel::default();
            }
            e
        })
    }

    fn consume(&mut self, mut data: &[u8]) -> Result<(), ParseError> {
        if self.stage == ParseStage::Uninitialized {
            self.stage = ParseStage::Header;
        }
        while self.stage != ParseStage::Completed {
            if self.need == 0 {
                self.complete_stage()?;
                continue;
            }
            if data.is_empty() {
                break;
            }
            let take = self.need.min(data.len());
            let (head, rest) = data.split_at(take);
            if self.in_weights() {
                // Weights grow with the bytes that actually arrive, never
                // with the size the table declares.
                self.current
                    .weights
                    .try_reserve(take)
                    .map_err(|_| ParseError::OutOfMemory(take))?;
                self.current.weights.extend_from_slice(head);
            } else {
                self.staging.extend_from_slice(head);
            }
            self.need -= take;
            self.consumed += take as u64;
            data = rest;
        }

        if self.stage == ParseStage::Completed {
            if !data.is_empty() {
                return Err(ParseError::ResidualBytes(data.len()));
            }
            if self.consumed != self.model_size {
                return Err(ParseError::SizeMismatch {
                    consumed: self.consumed,
                    expected: self.model_size,
                });
            }
        }
        Ok(())
    }

    fn in_weights(&self) -> bool {
        matches!(self.stage, ParseStage::Partition(i)
            if self.table.get(i).map(|p| p.kind) == Some(PartitionType::Weights))
    }

    fn complete_stage(&mut self) -> Result<(), ParseError> {
        let staged = std::mem::take(&mut self.staging);
        match self.stage {
            ParseStage::Header => self.parse_header(&staged),
            ParseStage::PartitionTableHeader => {
                let count = ByteReader::new(&staged).read_u32().unwrap_or_default();
                if !ALLOWED_PARTITION_COUNTS.contains(&count) {
                    return Err(ParseError::BadPartitionCount(count));
                }
                self.enter(ParseStage::PartitionTable, count as usize * PARTITION_ENTRY_SIZE);
                Ok(())
            }
            ParseStage::PartitionTable => {
                self.parse_table(&staged)?;
                self.start_partition(0)
            }
            ParseStage::Partition(i) => {
                self.interpret_partition(i, &staged)?;
                self.start_partition(i + 1)
            }
            ParseStage::Uninitialized | ParseStage::Completed | ParseStage::Poisoned => Ok(()),
        }
    }

    fn enter(&mut self, stage: ParseStage, need: usize) {
        self.stage = stage;
        self.need = need;
        self.staging = Vec::with_capacity(need.min(1 << 20));
    }

    fn parse_header(&mut self, bytes: &[u8]) -> Result<(), ParseError> {
        let mut reader = ByteReader::new(bytes);
        let (magic, version, model_num, _reserved, length) = match (
            reader.read_u32(),
            reader.read_u32(),
            reader.read_u32(),
            reader.read_u32(),
            reader.read_u64(),
        ) {
            (Some(m), Some(v), Some(n), Some(r), Some(l)) => (m, v, n, r, l),
            _ => return Err(ParseError::BadMagic(0)),
        };
        if magic != MODEL_MAGIC {
            return Err(ParseError::BadMagic(magic));
        }
        if version != FORMAT_VERSION {
            return Err(ParseError::UnsupportedVersion(version));
        }
        if model_num == 0 {
            return Err(ParseError::NoModels);
        }
        let expected = self.model_size.saturating_sub(HEADER_SIZE as u64);
        if self.model_size < HEADER_SIZE as u64 || length != expected {
            return Err(ParseError::LengthMismatch { declared: length, expected });
        }
        self.model_count = model_num;
        self.enter(ParseStage::PartitionTableHeader, PARTITION_TABLE_HEADER_SIZE);
        Ok(())
    }

    fn parse_table(&mut self, bytes: &[u8]) -> Result<(), ParseError> {
        let mut reader = ByteReader::new(bytes);
        let mut seen = BTreeSet::new();
        let mut table = Vec::new();
        let mut total: u64 = 0;
        while reader.remaining() > 0 {
            let (Some(raw), Some(size)) = (reader.read_u32(), reader.read_u64()) else {
                break;
            };
            let kind = PartitionType::from_u32(raw).ok_or(ParseError::UnknownPartitionType(raw))?;
            if !seen.insert(kind) {
                return Err(ParseError::DuplicatePartition(kind));
            }
            total = total.saturating_add(size);
            table.push(PartitionEntry { kind, size });
        }
        if !seen.contains(&PartitionType::ModelDef) {
            return Err(ParseError::MissingModelDef);
        }
        let available = self.model_size.saturating_sub(self.consumed);
        if total > available {
            return Err(ParseError::PartitionOverflow { needed: total, available });
        }
        self.table = table;
        self.current = PartialModel::default();
        Ok(())
    }

    fn start_partition(&mut self, index: usize) -> Result<(), ParseError> {
        let Some(entry) = self.table.get(index).copied() else {
            return self.finish_model();
        };
        // Bounded by the remaining model size in `parse_table`.
        let size = usize::try_from(entry.size).map_err(|_| ParseError::PartitionOverflow {
            needed: entry.size,
            available: self.model_size.saturating_sub(self.consumed),
        })?;
        if entry.kind == PartitionType::Weights {
            self.stage = ParseStage::Partition(index);
            self.need = size;
        } else {
            self.enter(ParseStage::Partition(index), size);
        }
        Ok(())
    }

    fn interpret_partition(&mut self, index: usize, bytes: &[u8]) -> Result<(), ParseError> {
        let Some(entry) = self.table.get(index).copied() else {
            return Ok(());
        };
        let fail = |reason: String| ParseError::Deserialize { partition: entry.kind, reason };
        match entry.kind {
            PartitionType::ModelDef => {
                let def: ModelDef = serde_json::from_slice(bytes).map_err(|e| fail(e.to_string()))?;
                self.current.def = Some(def);
            }
            PartitionType::Weights => {}
            PartitionType::TaskInfo => {
                if !bytes.is_empty() {
                    self.current.tasks =
                        serde_json::from_slice(bytes).map_err(|e| fail(e.to_string()))?;
                }
            }
            PartitionType::TbeKernels => {
                self.current.tbe_kernels = decode_kernels(bytes).ok_or_else(|| fail("malformed kernel store".into()))?;
            }
            PartitionType::CustAicpuKernels => {
                self.current.cust_kernels = decode_kernels(bytes).ok_or_else(|| fail("malformed kernel store".into()))?;
            }
        }
        Ok(())
    }

    fn finish_model(&mut self) -> Result<(), ParseError> {
        let partial = std::mem::take(&mut self.current);
        let def = partial.def.ok_or(ParseError::MissingModelDef)?;
        tracing::debug!(model = %def.name, weights = partial.weights.len(), "model partitions parsed");
        self.finished.push(CompiledModel {
            def,
            weights: partial.weights,
            tasks: partial.tasks,
            tbe_kernels: partial.tbe_kernels,
            cust_kernels: partial.cust_kernels,
        });
        self.table.clear();

        if self.finished.len() < self.model_count as usize {
            self.enter(ParseStage::PartitionTableHeader, PARTITION_TABLE_HEADER_SIZE);
            return Ok(());
        }

        let mut models = std::mem::take(&mut self.finished).into_iter();
        let Some(root) = models.next() else {
            return Err(ParseError::NoModels);
        };
        let mut submodels = BTreeMap::new();
        for model in models {
            let name = model.name().to_string();
            if name == root.name() || submodels.insert(name.clone(), Arc::new(model)).is_some() {
                return Err(ParseError::DuplicateModel(name));
            }
        }
        self.result = Some(RootModel { root: Arc::new(root), submodels });
        self.stage = ParseStage::Completed;
        self.need = 0;
        Ok(())
    }
}

/// An empty kernel partition decodes to an empty store.
fn decode_kernels(bytes: &[u8]) -> Option<KernelStore> {
    if bytes.is_empty() {
        return Some(KernelStore::default());
    }
    KernelStore::decode(bytes)
}
