//! One execution cycle: PrepareInputs, PrepareOutputs, Execute,
//! UpdateOutputs, then publish the outputs on their queues.

use std::sync::Arc;
use std::time::Duration;

use crate::device::{DeviceRuntime, Mbuf, QueueId};
use crate::format::{CompiledModel, TensorDesc};

use super::backend::{ExecutionBackend, InputTensor, OutputTensor};
use super::tensor_desc::{RuntimeTensorDesc, RUNTIME_TENSOR_DESC_SIZE};
use super::ExecutorError;

/// Cached descriptor plus whether its shape travels with the data.
#[derive(Debug, Clone)]
struct TensorSlot {
    desc: TensorDesc,
    dynamic: bool,
}

impl TensorSlot {
    fn new(desc: &TensorDesc) -> Self {
        Self { desc: desc.clone(), dynamic: desc.is_dynamic() }
    }

    fn header_len(&self) -> usize {
        if self.dynamic {
            RUNTIME_TENSOR_DESC_SIZE
        } else {
            0
        }
    }
}

/// Dequeued inputs of one cycle, headers already applied.
#[derive(Debug)]
pub struct PreparedInputs {
    mbufs: Vec<Mbuf>,
    header_lens: Vec<usize>,
}

impl PreparedInputs {
    pub fn len(&self) -> usize {
        self.mbufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mbufs.is_empty()
    }
}

/// Queue-bound execution state of one loaded model.
pub struct ExecutionCycle {
    model: Arc<CompiledModel>,
    runtime: Arc<DeviceRuntime>,
    backend: Arc<dyn ExecutionBackend>,
    inputs: Vec<TensorSlot>,
    outputs: Vec<TensorSlot>,
    input_queues: Vec<QueueId>,
    control_queues: Vec<QueueId>,
    output_queues: Vec<QueueId>,
    queue_timeout: Duration,
}

impl ExecutionCycle {
    /// `input_queues` lists data inputs first; queues past the model's input
    /// count are control inputs whose mbufs only trigger execution.
    pub fn new(
        model: Arc<CompiledModel>,
        runtime: Arc<DeviceRuntime>,
        backend: Arc<dyn ExecutionBackend>,
        input_queues: &[QueueId],
        output_queues: &[QueueId],
        queue_timeout: Duration,
    ) -> Result<Self, ExecutorError> {
        let def = &model.def;
        if input_queues.len() < def.inputs.len() {
            return Err(ExecutorError::InvalidBinding(format!(
                "model {} has {} inputs but {} input queues",
                def.name,
                def.inputs.len(),
                input_queues.len()
            )));
        }
        if output_queues.len() != def.outputs.len() {
            return Err(ExecutorError::InvalidBinding(format!(
                "model {} has {} outputs but {} output queues",
                def.name,
                def.outputs.len(),
                output_queues.len()
            )));
        }
        if input_queues.is_empty() {
            return Err(ExecutorError::InvalidBinding(format!(
                "model {} has no input queue to trigger it",
                def.name
            )));
        }
        let (data, control) = input_queues.split_at(def.inputs.len());
        Ok(Self {
            inputs: def.inputs.iter().map(TensorSlot::new).collect(),
            outputs: def.outputs.iter().map(TensorSlot::new).collect(),
            input_queues: data.to_vec(),
            control_queues: control.to_vec(),
            output_queues: output_queues.to_vec(),
            model,
            runtime,
            backend,
            queue_timeout,
        })
    }

    pub fn model(&self) -> &Arc<CompiledModel> {
        &self.model
    }

    /// Every queue whose arrivals activate this model: data inputs, then
    /// control inputs.
    pub fn activation_queues(&self) -> Vec<QueueId> {
        self.input_queues.iter().chain(&self.control_queues).copied().collect()
    }

    /// Whether every data and control input has an mbuf waiting.
    ///
    /// The model is the only consumer of its input queues, so a ready cycle
    /// stays ready until it dequeues.
    pub fn inputs_ready(&self) -> Result<bool, ExecutorError> {
        for queue in self.input_queues.iter().chain(&self.control_queues) {
            if self.runtime.queue(*queue)?.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Current descriptor of input `index`, as updated by the last header.
    pub fn input_desc(&self, index: usize) -> Option<&TensorDesc> {
        self.inputs.get(index).map(|s| &s.desc)
    }

    /// Dequeue one mbuf per input, or nothing at all while some input is
    /// still missing.
    pub fn prepare_inputs(&mut self) -> Result<Option<PreparedInputs>, ExecutorError> {
        if !self.inputs_ready()? {
            return Ok(None);
        }
        let mut mbufs = Vec::with_capacity(self.input_queues.len());
        let mut header_lens = Vec::with_capacity(self.input_queues.len());
        for (slot, &queue) in self.inputs.iter_mut().zip(&self.input_queues) {
            let mbuf = self.runtime.dequeue(queue, self.queue_timeout)?;
            let header_len = slot.header_len();
            if slot.dynamic {
                let view = mbuf.view(header_len).map_err(|_| {
                    ExecutorError::TensorDesc(format!(
                        "input {} of {} bytes has no descriptor header",
                        slot.desc.name,
                        mbuf.len()
                    ))
                })?;
                RuntimeTensorDesc::decode(view.header())?.apply_to(&mut slot.desc);
            }
            mbufs.push(mbuf);
            header_lens.push(header_len);
        }
        for &queue in &self.control_queues {
            // Control inputs carry no tensor data.
            drop(self.runtime.dequeue(queue, self.queue_timeout)?);
        }
        Ok(Some(PreparedInputs { mbufs, header_lens }))
    }

    pub fn prepare_outputs(&self) -> Result<Vec<OutputTensor>, ExecutorError> {
        self.outputs
            .iter()
            .map(|slot| match slot.desc.static_byte_size() {
                Some(size) => {
                    let header_len = slot.header_len();
                    let buffer = self.runtime.alloc_mbuf(header_len + size)?;
                    Ok(OutputTensor::preallocated(slot.desc.clone(), slot.dynamic, header_len, buffer))
                }
                None => Ok(OutputTensor::deferred(slot.desc.clone())),
            })
            .collect()
    }

    pub fn execute(&self, inputs: &PreparedInputs, outputs: &mut [OutputTensor]) -> Result<(), ExecutorError> {
        let tensors: Vec<InputTensor<'_>> = self
            .inputs
            .iter()
            .zip(inputs.mbufs.iter().zip(&inputs.header_lens))
            .map(|(slot, (mbuf, &header_len))| InputTensor {
                desc: &slot.desc,
                data: &mbuf.as_slice()[header_len..],
            })
            .collect();
        self.backend.execute(&self.model, &tensors, outputs)
    }

    /// Finalize outputs: deferred ones are allocated from their produced
    /// length, dynamic ones get their header written and are trimmed to
    /// header plus produced bytes. Static outputs are left as allocated.
    pub fn update_outputs(&self, outputs: Vec<OutputTensor>) -> Result<Vec<Mbuf>, ExecutorError> {
        let mut finished = Vec::with_capacity(outputs.len());
        for mut output in outputs {
            if output.is_deferred() {
                let data = output.take_deferred();
                let mut buffer = self.runtime.alloc_mbuf(RUNTIME_TENSOR_DESC_SIZE + data.len())?;
                buffer.view_mut(RUNTIME_TENSOR_DESC_SIZE)?.write_data(0, &data)?;
                output.set_buffer(buffer, RUNTIME_TENSOR_DESC_SIZE);
            }
            if output.is_dynamic() {
                let header = RuntimeTensorDesc::from_tensor(output.desc());
                let keep = output.header_len() + output.written();
                if let Some(buffer) = output.buffer_mut() {
                    header.encode_into(buffer.as_mut_slice())?;
                    buffer.truncate(keep);
                }
            }
            if let Some(buffer) = output.into_buffer() {
                finished.push(buffer);
            }
        }
        Ok(finished)
    }

    pub fn publish(&self, outputs: Vec<Mbuf>) -> Result<(), ExecutorError> {
        for (mbuf, &queue) in outputs.into_iter().zip(&self.output_queues) {
            self.runtime.enqueue(queue, mbuf, self.queue_timeout)?;
        }
        Ok(())
    }

    /// Run one full cycle. Returns `false` without touching any queue when
    /// an input has not arrived yet; its arrival activates the model again.
    pub fn run(&mut self) -> Result<bool, ExecutorError> {
        let Some(inputs) = self.prepare_inputs()? else {
            return Ok(false);
        };
        let mut outputs = self.prepare_outputs()?;
        self.execute(&inputs, &mut outputs)?;
        drop(inputs);
        let outputs = self.update_outputs(outputs)?;
        self.publish(outputs)?;
        Ok(true)
    }
}

impl std::fmt::Debug for ExecutionCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCycle")
            .field("model", &self.model.name())
            .field("input_queues", &self.input_queues)
            .field("control_queues", &self.control_queues)
            .field("output_queues", &self.output_queues)
            .finish()
    }
}

/// Subscribe `model_id` to every queue in `queues`. On failure the queues
/// already subscribed are released again.
pub(crate) fn subscribe_all(runtime: &DeviceRuntime, queues: &[QueueId], model_id: u32) -> Result<(), ExecutorError> {
    for (i, &queue) in queues.iter().enumerate() {
        if let Err(e) = runtime.subscribe(queue, model_id) {
            unsubscribe_all(runtime, &queues[..i], model_id);
            return Err(e.into());
        }
    }
    Ok(())
}

pub(crate) fn unsubscribe_all(runtime: &DeviceRuntime, queues: &[QueueId], model_id: u32) {
    for &queue in queues {
        if let Err(e) = runtime.unsubscribe(queue) {
            tracing::debug!(model_id, queue, error = %e, "activation queue already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::backend::IdentityBackend;
    use crate::format::{DataType, ModelDef};
    use crate::planner::DeviceInfo;

    const WAIT: Duration = Duration::from_millis(50);

    fn setup(input: TensorDesc, output: TensorDesc) -> (Arc<DeviceRuntime>, ExecutionCycle, QueueId, QueueId) {
        let runtime = Arc::new(DeviceRuntime::new(DeviceInfo::new(0, 0, 0), 1 << 20));
        let mut def = ModelDef::new("m");
        def.inputs.push(input);
        def.outputs.push(output);
        let model = Arc::new(CompiledModel::new(def));
        let qin = runtime.create_queue("in", 4).unwrap();
        let qout = runtime.create_queue("out", 4).unwrap();
        let cycle = ExecutionCycle::new(
            model,
            Arc::clone(&runtime),
            Arc::new(IdentityBackend),
            &[qin],
            &[qout],
            WAIT,
        )
        .unwrap();
        (runtime, cycle, qin, qout)
    }

    #[test]
    fn static_outputs_are_exact_and_untouched() {
        let (runtime, mut cycle, qin, _) = setup(
            TensorDesc::new("x", DataType::Float32, vec![2]),
            TensorDesc::new("y", DataType::Float32, vec![2]),
        );
        runtime.enqueue(qin, runtime.mbuf_from(&[1u8; 8]).unwrap(), WAIT).unwrap();
        let inputs = cycle.prepare_inputs().unwrap().unwrap();
        let mut outputs = cycle.prepare_outputs().unwrap();
        assert_eq!(outputs[0].buffer().unwrap().len(), 8);
        cycle.execute(&inputs, &mut outputs).unwrap();
        let before = outputs[0].buffer().unwrap().as_slice().to_vec();
        let finished = cycle.update_outputs(outputs).unwrap();
        assert_eq!(finished[0].as_slice(), before.as_slice());
    }

    #[test]
    fn dynamic_output_gets_header_and_trim() {
        let (runtime, mut cycle, qin, qout) = setup(
            TensorDesc::new("x", DataType::Uint8, vec![-1]),
            TensorDesc::new("y", DataType::Uint8, vec![-1]),
        );
        let mut mbuf = runtime.alloc_mbuf(RUNTIME_TENSOR_DESC_SIZE + 5).unwrap();
        let header = RuntimeTensorDesc {
            dtype: DataType::Uint8.code(),
            format: 0,
            shape: vec![5],
            original_shape: vec![5],
        };
        header.encode_into(mbuf.as_mut_slice()).unwrap();
        mbuf.view_mut(RUNTIME_TENSOR_DESC_SIZE).unwrap().write_data(0, b"hello").unwrap();
        runtime.enqueue(qin, mbuf, WAIT).unwrap();

        assert!(cycle.run().unwrap());
        assert_eq!(cycle.input_desc(0).unwrap().shape, vec![5]);
        let out = runtime.dequeue(qout, WAIT).unwrap();
        assert_eq!(out.len(), RUNTIME_TENSOR_DESC_SIZE + 5);
        assert_eq!(RuntimeTensorDesc::decode(out.as_slice()).unwrap().shape, vec![5]);
        assert_eq!(&out.as_slice()[RUNTIME_TENSOR_DESC_SIZE..], b"hello");
    }

    #[test]
    fn missing_input_waits_without_consuming() {
        let (_runtime, mut cycle, _, _) = setup(
            TensorDesc::new("x", DataType::Uint8, vec![1]),
            TensorDesc::new("y", DataType::Uint8, vec![1]),
        );
        assert!(!cycle.run().unwrap());
    }

    #[test]
    fn late_second_input_keeps_the_first() {
        let runtime = Arc::new(DeviceRuntime::new(DeviceInfo::new(0, 0, 0), 1 << 20));
        let mut def = ModelDef::new("pair");
        def.inputs.push(TensorDesc::new("a", DataType::Uint8, vec![4]));
        def.inputs.push(TensorDesc::new("b", DataType::Uint8, vec![4]));
        def.outputs.push(TensorDesc::new("y", DataType::Uint8, vec![4]));
        let qa = runtime.create_queue("a", 4).unwrap();
        let qb = runtime.create_queue("b", 4).unwrap();
        let qout = runtime.create_queue("out", 4).unwrap();
        let mut cycle = ExecutionCycle::new(
            Arc::new(CompiledModel::new(def)),
            Arc::clone(&runtime),
            Arc::new(IdentityBackend),
            &[qa, qb],
            &[qout],
            WAIT,
        )
        .unwrap();
        assert_eq!(cycle.activation_queues(), vec![qa, qb]);

        runtime.enqueue(qa, runtime.mbuf_from(b"AAAA").unwrap(), WAIT).unwrap();
        assert!(!cycle.run().unwrap());
        std::thread::sleep(WAIT * 2);
        assert!(!cycle.run().unwrap());
        assert_eq!(runtime.queue(qa).unwrap().len(), 1);

        runtime.enqueue(qb, runtime.mbuf_from(b"BBBB").unwrap(), WAIT).unwrap();
        assert!(cycle.run().unwrap());
        assert!(runtime.queue(qa).unwrap().is_empty());
        assert!(runtime.queue(qb).unwrap().is_empty());
        assert_eq!(runtime.dequeue(qout, WAIT).unwrap().as_slice(), b"AAAA");
    }
}
