//! Model handles driven through the executor context on one device runtime.

use std::sync::Arc;
use std::time::Duration;

use gg_deploy::device::{DeviceEvent, DeviceRuntime, EventChannel, QueueId};
use gg_deploy::executor::{
    EventDispatcher, ExecutorConfig, ExecutorContext, ExecutorEnv, IdentityBackend, RuntimeTensorDesc,
    RUNTIME_TENSOR_DESC_SIZE,
};
use gg_deploy::format::{serialize_models, CompiledModel, DataType, ModelDef, TensorDesc};
use gg_deploy::planner::DeviceInfo;
use gg_deploy::StatusCode;

const WAIT: Duration = Duration::from_secs(2);

struct Device {
    runtime: Arc<DeviceRuntime>,
    dispatcher: Arc<EventDispatcher>,
    context: ExecutorContext,
}

impl Device {
    fn new() -> Self {
        Self::with_queue_timeout(WAIT)
    }

    fn with_queue_timeout(queue_timeout: Duration) -> Self {
        let runtime = Arc::new(DeviceRuntime::new(DeviceInfo::new(0, 0, 0), 4 << 20));
        let dispatcher = EventDispatcher::start(Arc::clone(&runtime), Duration::from_millis(5)).unwrap();
        let env = ExecutorEnv::new(
            Arc::clone(&runtime),
            Arc::clone(&dispatcher),
            Arc::new(IdentityBackend),
            ExecutorConfig { queue_timeout, worker_poll: Duration::from_millis(10), ..ExecutorConfig::default() },
        );
        let context = ExecutorContext::new(Arc::new(env));
        Self { runtime, dispatcher, context }
    }

    /// Download `bytes` in small chunks, then load.
    fn install(&mut self, root: u32, model_id: u32, bytes: &[u8], inputs: &[QueueId], outputs: &[QueueId]) {
        self.context.add_model(root, model_id, bytes.len() as u64).unwrap();
        let handle = self.context.model_mut(root, model_id).unwrap();
        for (i, chunk) in bytes.chunks(13).enumerate() {
            handle.parse_partial_model((i * 13) as u64, chunk).unwrap();
        }
        self.context.load_model(root, model_id, inputs, outputs).unwrap();
    }

    fn feed(&self, queue: QueueId, bytes: &[u8]) {
        self.runtime.enqueue(queue, self.runtime.mbuf_from(bytes).unwrap(), WAIT).unwrap();
    }

    fn take(&self, queue: QueueId) -> Vec<u8> {
        self.runtime.dequeue(queue, WAIT).unwrap().into_vec()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.context.clear();
        self.dispatcher.stop();
    }
}

fn passthrough(name: &str, output_shape: Vec<i64>) -> Vec<u8> {
    let mut def = ModelDef::new(name);
    def.inputs.push(TensorDesc::new("x", DataType::Uint8, vec![4]));
    def.outputs.push(TensorDesc::new("y", DataType::Uint8, output_shape));
    serialize_models(&[CompiledModel::new(def)])
}

#[test]
fn static_model_copies_input_to_output() {
    let mut device = Device::new();
    let qin = device.runtime.create_queue("in", 4).unwrap();
    let qout = device.runtime.create_queue("out", 4).unwrap();
    device.install(1, 0, &passthrough("m", vec![4]), &[qin], &[qout]);

    device.feed(qin, b"ping");
    assert_eq!(device.take(qout), b"ping");
    let end = device.runtime.events(EventChannel::Notify).wait(WAIT).unwrap();
    assert!(matches!(end, Some(DeviceEvent::EndGraph { status: StatusCode::Success, .. })));
}

#[test]
fn dynamic_output_carries_its_shape() {
    let mut device = Device::new();
    let qin = device.runtime.create_queue("in", 4).unwrap();
    let qout = device.runtime.create_queue("out", 4).unwrap();
    device.install(1, 0, &passthrough("dyn", vec![-1]), &[qin], &[qout]);
    assert!(device.context.model_mut(1, 0).unwrap().is_dynamic());

    device.feed(qin, b"wxyz");
    let out = device.take(qout);
    assert_eq!(out.len(), RUNTIME_TENSOR_DESC_SIZE + 4);
    let header = RuntimeTensorDesc::decode(&out[..RUNTIME_TENSOR_DESC_SIZE]).unwrap();
    assert_eq!(header.shape, vec![4]);
    assert_eq!(&out[RUNTIME_TENSOR_DESC_SIZE..], b"wxyz");
}

#[test]
fn chained_models_forward_through_shared_queue() {
    let mut device = Device::new();
    let qin = device.runtime.create_queue("in", 4).unwrap();
    let qmid = device.runtime.create_queue("mid", 4).unwrap();
    let qout = device.runtime.create_queue("out", 4).unwrap();
    device.install(1, 0, &passthrough("first", vec![4]), &[qin], &[qmid]);
    device.install(1, 1, &passthrough("second", vec![4]), &[qmid], &[qout]);
    assert_eq!(device.dispatcher.registered(), 2);

    for payload in [b"aaaa", b"bbbb", b"cccc"] {
        device.feed(qin, payload);
    }
    assert_eq!(device.take(qout), b"aaaa");
    assert_eq!(device.take(qout), b"bbbb");
    assert_eq!(device.take(qout), b"cccc");
}

#[test]
fn control_input_is_consumed_per_cycle() {
    let mut device = Device::new();
    let qin = device.runtime.create_queue("in", 4).unwrap();
    let qctl = device.runtime.create_queue("ctl", 4).unwrap();
    let qout = device.runtime.create_queue("out", 4).unwrap();
    device.install(1, 0, &passthrough("gated", vec![4]), &[qin, qctl], &[qout]);

    device.feed(qctl, b"go");
    device.feed(qin, b"data");
    assert_eq!(device.take(qout), b"data");
    assert!(device.runtime.queue(qctl).unwrap().is_empty());
}

fn pair(name: &str, output_shape: Vec<i64>) -> Vec<u8> {
    let mut def = ModelDef::new(name);
    def.inputs.push(TensorDesc::new("a", DataType::Uint8, vec![4]));
    def.inputs.push(TensorDesc::new("b", DataType::Uint8, vec![4]));
    def.outputs.push(TensorDesc::new("y", DataType::Uint8, output_shape));
    serialize_models(&[CompiledModel::new(def)])
}

#[test]
fn second_input_arriving_late_still_pairs_with_the_first() {
    for (root, shape) in [(1, vec![4]), (2, vec![-1])] {
        let mut device = Device::with_queue_timeout(Duration::from_millis(50));
        let qa = device.runtime.create_queue("a", 4).unwrap();
        let qb = device.runtime.create_queue("b", 4).unwrap();
        let qout = device.runtime.create_queue("out", 4).unwrap();
        device.install(root, 0, &pair("pair", shape.clone()), &[qa, qb], &[qout]);

        device.feed(qa, b"AAAA");
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(device.runtime.queue(qa).unwrap().len(), 1);
        assert!(!device.dispatcher.is_stopped());

        device.feed(qb, b"BBBB");
        let out = device.take(qout);
        let data = if shape == vec![-1] { &out[RUNTIME_TENSOR_DESC_SIZE..] } else { &out[..] };
        assert_eq!(data, b"AAAA");
        assert!(device.runtime.queue(qa).unwrap().is_empty());
        assert!(device.runtime.queue(qb).unwrap().is_empty());
    }
}

#[test]
fn unload_root_stops_every_submodel() {
    let mut device = Device::new();
    let qin = device.runtime.create_queue("in", 4).unwrap();
    let qmid = device.runtime.create_queue("mid", 4).unwrap();
    let qout = device.runtime.create_queue("out", 4).unwrap();
    device.install(7, 0, &passthrough("first", vec![4]), &[qin], &[qmid]);
    device.install(7, 1, &passthrough("second", vec![-1]), &[qmid], &[qout]);
    assert_eq!(device.context.root_count(), 1);

    let failures = device.context.unload_root(7).unwrap();
    assert!(failures.is_empty());
    assert_eq!(device.dispatcher.registered(), 0);
    assert_eq!(device.context.root_count(), 0);

    // Nothing is subscribed any more: the input just sits in its queue.
    device.feed(qin, b"late");
    assert!(device.runtime.dequeue(qout, Duration::from_millis(50)).is_err());
    assert_eq!(device.runtime.queue(qin).unwrap().len(), 1);
}

#[test]
fn mismatched_binding_fails_to_load() {
    let mut device = Device::new();
    let qin = device.runtime.create_queue("in", 4).unwrap();
    let bytes = passthrough("m", vec![4]);
    device.context.add_model(1, 0, bytes.len() as u64).unwrap();
    device.context.model_mut(1, 0).unwrap().parse_partial_model(0, &bytes).unwrap();
    assert!(device.context.load_model(1, 0, &[qin], &[]).is_err());
    assert_eq!(device.dispatcher.registered(), 0);
}
