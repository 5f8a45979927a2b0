//! Runtime tensor descriptor: the fixed-size header carried in front of a
//! dynamic tensor's data.
//!
//! ```text
//! dtype i64 | format i64 | shape: [dim_num i64][dims i64 * MAX_DIM_NUM]
//!           | original_shape: [dim_num i64][dims i64 * MAX_DIM_NUM] | zero padding
//! ```

use crate::format::{ByteReader, ByteWriter, DataType, TensorDesc};

use super::ExecutorError;

pub const MAX_DIM_NUM: usize = 32;
pub const RUNTIME_TENSOR_DESC_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeTensorDesc {
    pub dtype: i64,
    pub format: i64,
    pub shape: Vec<i64>,
    pub original_shape: Vec<i64>,
}

impl RuntimeTensorDesc {
    pub fn from_tensor(desc: &TensorDesc) -> Self {
        Self {
            dtype: desc.dtype.code(),
            format: desc.format,
            shape: desc.shape.clone(),
            original_shape: desc.original_shape.clone(),
        }
    }

    /// Copy shape and original shape onto a cached descriptor.
    pub fn apply_to(&self, desc: &mut TensorDesc) {
        desc.shape = self.shape.clone();
        desc.original_shape = self.original_shape.clone();
    }

    pub fn encode_into(&self, header: &mut [u8]) -> Result<(), ExecutorError> {
        if header.len() < RUNTIME_TENSOR_DESC_SIZE {
            return Err(ExecutorError::TensorDesc(format!(
                "header region of {} bytes, need {}",
                header.len(),
                RUNTIME_TENSOR_DESC_SIZE
            )));
        }
        let mut writer = ByteWriter::with_capacity(RUNTIME_TENSOR_DESC_SIZE);
        writer.put_i64(self.dtype).put_i64(self.format);
        for dims in [&self.shape, &self.original_shape] {
            if dims.len() > MAX_DIM_NUM {
                return Err(ExecutorError::TensorDesc(format!(
                    "rank {} exceeds {}",
                    dims.len(),
                    MAX_DIM_NUM
                )));
            }
            writer.put_i64(dims.len() as i64);
            for slot in 0..MAX_DIM_NUM {
                writer.put_i64(dims.get(slot).copied().unwrap_or(0));
            }
        }
        let bytes = writer.into_inner();
        header[..bytes.len()].copy_from_slice(&bytes);
        header[bytes.len()..RUNTIME_TENSOR_DESC_SIZE].fill(0);
        Ok(())
    }

    pub fn decode(header: &[u8]) -> Result<Self, ExecutorError> {
        let malformed = || ExecutorError::TensorDesc("truncated runtime tensor descriptor".into());
        if header.len() < RUNTIME_TENSOR_DESC_SIZE {
            return Err(malformed());
        }
        let mut reader = ByteReader::new(header);
        let dtype = reader.read_i64().ok_or_else(malformed)?;
        let format = reader.read_i64().ok_or_else(malformed)?;
        if DataType::from_code(dtype).is_none() {
            return Err(ExecutorError::TensorDesc(format!("unknown dtype code {}", dtype)));
        }
        let mut read_dims = || -> Result<Vec<i64>, ExecutorError> {
            let dim_num = reader.read_i64().ok_or_else(malformed)?;
            let dim_num = usize::try_from(dim_num)
                .ok()
                .filter(|&n| n <= MAX_DIM_NUM)
                .ok_or_else(|| ExecutorError::TensorDesc(format!("bad dim count {}", dim_num)))?;
            let mut dims = Vec::with_capacity(dim_num);
            for slot in 0..MAX_DIM_NUM {
                let dim = reader.read_i64().ok_or_else(malformed)?;
                if slot < dim_num {
                    dims.push(dim);
                }
            }
            Ok(dims)
        };
        let shape = read_dims()?;
        let original_shape = read_dims()?;
        Ok(Self { dtype, format, shape, original_shape })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fits_and_decodes() {
        let desc = RuntimeTensorDesc {
            dtype: DataType::Int32.code(),
            format: 2,
            shape: vec![3, 5],
            original_shape: vec![15],
        };
        let mut header = vec![0xFFu8; RUNTIME_TENSOR_DESC_SIZE];
        desc.encode_into(&mut header).unwrap();
        assert_eq!(RuntimeTensorDesc::decode(&header).unwrap(), desc);
        assert!(header[600..].iter().all(|&b| b == 0));
    }

    #[test]
    fn short_header_is_rejected() {
        let err = RuntimeTensorDesc::decode(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, ExecutorError::TensorDesc(_)));
    }

    #[test]
    fn rank_is_bounded() {
        let desc = RuntimeTensorDesc {
            dtype: 0,
            format: 0,
            shape: vec![1; MAX_DIM_NUM + 1],
            original_shape: vec![],
        };
        let mut header = vec![0u8; RUNTIME_TENSOR_DESC_SIZE];
        assert!(desc.encode_into(&mut header).is_err());
    }
}
