//! Serialized model container format.
//!
//! ```text
//! [magic u32 | version u32 | model_num u32 | reserved u32 | length u64]
//! per model:
//!   [num_partitions u32]
//!   [{type u32, size u64} * num_partitions]
//!   [partition_0] .. [partition_{n-1}]
//! ```
//!
//! All integers are little endian. `length` counts every byte after the
//! outer header.

mod codec;
mod model;
mod parser;
mod writer;

pub use codec::{ByteReader, ByteWriter};
pub use model::{
    CompiledModel, DataType, KernelStore, ModelDef, RootModel, TaskDef, TensorDesc, UNKNOWN_DIM,
    UNKNOWN_RANK,
};
pub use parser::{IncrementalModelParser, ParseStage};
pub use writer::serialize_models;

use thiserror::Error;

use crate::status::{HasStatus, StatusCode};

pub const MODEL_MAGIC: u32 = 0x444D_4747;
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 24;
pub const PARTITION_TABLE_HEADER_SIZE: usize = 4;
pub const PARTITION_ENTRY_SIZE: usize = 12;

/// Partition counts a table may declare: the four mandatory partitions, plus
/// the optional custom-kernel partition.
pub const ALLOWED_PARTITION_COUNTS: [u32; 2] = [4, 5];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionType {
    ModelDef,
    Weights,
    TaskInfo,
    TbeKernels,
    CustAicpuKernels,
}

impl PartitionType {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => PartitionType::ModelDef,
            1 => PartitionType::Weights,
            2 => PartitionType::TaskInfo,
            3 => PartitionType::TbeKernels,
            4 => PartitionType::CustAicpuKernels,
            _ => return None,
        })
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            PartitionType::ModelDef => 0,
            PartitionType::Weights => 1,
            PartitionType::TaskInfo => 2,
            PartitionType::TbeKernels => 3,
            PartitionType::CustAicpuKernels => 4,
        }
    }
}

impl std::fmt::Display for PartitionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PartitionType::ModelDef => "model_def",
            PartitionType::Weights => "weights",
            PartitionType::TaskInfo => "task_info",
            PartitionType::TbeKernels => "tbe_kernels",
            PartitionType::CustAicpuKernels => "cust_aicpu_kernels",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Empty chunk")]
    EmptyChunk,

    #[error("Chunk offset {got} does not match expected offset {expected}")]
    OffsetMismatch { expected: u64, got: u64 },

    #[error("Model already completed")]
    AlreadyCompleted,

    #[error("Parser poisoned by an earlier error")]
    Poisoned,

    #[error("Model not completed")]
    Incomplete,

    #[error("Bad magic 0x{0:08x}")]
    BadMagic(u32),

    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u32),

    #[error("Container declares no models")]
    NoModels,

    #[error("Declared length {declared} does not match model size minus header ({expected})")]
    LengthMismatch { declared: u64, expected: u64 },

    #[error("Partition count {0} not allowed")]
    BadPartitionCount(u32),

    #[error("Unknown partition type {0}")]
    UnknownPartitionType(u32),

    #[error("Duplicate {0} partition")]
    DuplicatePartition(PartitionType),

    #[error("Model has no model_def partition")]
    MissingModelDef,

    #[error("Partitions overrun the model: {needed} bytes declared, {available} left")]
    PartitionOverflow { needed: u64, available: u64 },

    #[error("Failed to deserialize {partition} partition: {reason}")]
    Deserialize {
        partition: PartitionType,
        reason: String,
    },

    #[error("Duplicate model name {0} in container")]
    DuplicateModel(String),

    #[error("{0} residual bytes after the last model")]
    ResidualBytes(usize),

    #[error("Consumed {consumed} bytes, model size is {expected}")]
    SizeMismatch { consumed: u64, expected: u64 },

    #[error("Could not grow the weight buffer by {0} bytes")]
    OutOfMemory(usize),
}

impl ParseError {
    /// Whether the parser must be discarded after this error.
    pub fn poisons(&self) -> bool {
        !matches!(
            self,
            ParseError::EmptyChunk
                | ParseError::OffsetMismatch { .. }
                | ParseError::AlreadyCompleted
                | ParseError::Poisoned
                | ParseError::Incomplete
        )
    }
}

impl HasStatus for ParseError {
    fn status(&self) -> StatusCode {
        match self {
            ParseError::EmptyChunk
            | ParseError::OffsetMismatch { .. }
            | ParseError::BadMagic(_)
            | ParseError::UnsupportedVersion(_)
            | ParseError::NoModels
            | ParseError::BadPartitionCount(_) => StatusCode::ParamInvalid,
            ParseError::OutOfMemory(_) => StatusCode::ResourceExhaustion,
            _ => StatusCode::Failed,
        }
    }
}
