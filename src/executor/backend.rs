//! Execution backend seam and the tensors it reads and writes.

use crate::device::Mbuf;
use crate::format::{CompiledModel, TensorDesc};

use super::ExecutorError;

/// Input data for one execution; `data` excludes any descriptor header.
#[derive(Debug)]
pub struct InputTensor<'a> {
    pub desc: &'a TensorDesc,
    pub data: &'a [u8],
}

/// Output destination for one execution.
///
/// Outputs with a known maximum size write straight into a preallocated mbuf
/// behind `header_len` bytes; deferred outputs collect into a host buffer
/// and are copied into an mbuf once the produced length is known.
#[derive(Debug)]
pub struct OutputTensor {
    desc: TensorDesc,
    dynamic: bool,
    header_len: usize,
    buffer: Option<Mbuf>,
    deferred: Vec<u8>,
    written: usize,
}

impl OutputTensor {
    pub(crate) fn preallocated(desc: TensorDesc, dynamic: bool, header_len: usize, buffer: Mbuf) -> Self {
        Self { desc, dynamic, header_len, buffer: Some(buffer), deferred: Vec::new(), written: 0 }
    }

    pub(crate) fn deferred(desc: TensorDesc) -> Self {
        Self { desc, dynamic: true, header_len: 0, buffer: None, deferred: Vec::new(), written: 0 }
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn is_deferred(&self) -> bool {
        self.buffer.is_none()
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Data capacity of a preallocated output; `None` when deferred.
    pub fn capacity(&self) -> Option<usize> {
        self.buffer.as_ref().map(|b| b.len() - self.header_len)
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn buffer(&self) -> Option<&Mbuf> {
        self.buffer.as_ref()
    }

    /// Record the produced shape of a dynamic output.
    pub fn set_shape(&mut self, shape: Vec<i64>) {
        self.desc.original_shape = shape.clone();
        self.desc.shape = shape;
    }

    /// Append produced bytes.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), ExecutorError> {
        match self.buffer.as_mut() {
            None => self.deferred.extend_from_slice(bytes),
            Some(buffer) => {
                let mut view = buffer.view_mut(self.header_len)?;
                let capacity = view.data_mut().len();
                if self.written + bytes.len() > capacity {
                    return Err(ExecutorError::OutputOverflow {
                        name: self.desc.name.clone(),
                        capacity,
                        requested: self.written + bytes.len(),
                    });
                }
                view.write_data(self.written, bytes)?;
            }
        }
        self.written += bytes.len();
        Ok(())
    }

    pub(crate) fn buffer_mut(&mut self) -> Option<&mut Mbuf> {
        self.buffer.as_mut()
    }

    pub(crate) fn set_buffer(&mut self, buffer: Mbuf, header_len: usize) {
        self.buffer = Some(buffer);
        self.header_len = header_len;
    }

    pub(crate) fn take_deferred(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.deferred)
    }

    pub(crate) fn into_buffer(self) -> Option<Mbuf> {
        self.buffer
    }
}

/// Computes a model's outputs from its inputs.
pub trait ExecutionBackend: Send + Sync {
    fn execute(
        &self,
        model: &CompiledModel,
        inputs: &[InputTensor<'_>],
        outputs: &mut [OutputTensor],
    ) -> Result<(), ExecutorError>;
}

/// Copies input `i` to output `i`; used to check queue wiring end to end.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityBackend;

impl ExecutionBackend for IdentityBackend {
    fn execute(
        &self,
        _model: &CompiledModel,
        inputs: &[InputTensor<'_>],
        outputs: &mut [OutputTensor],
    ) -> Result<(), ExecutorError> {
        for (input, output) in inputs.iter().zip(outputs.iter_mut()) {
            if output.is_dynamic() {
                output.set_shape(input.desc.shape.clone());
            }
            let len = output.capacity().map_or(input.data.len(), |c| c.min(input.data.len()));
            output.write(&input.data[..len])?;
        }
        Ok(())
    }
}
