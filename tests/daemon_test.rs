//! Device daemon served through the local client, one request at a time.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use gg_deploy::daemon::{
    encode_response, request_seq, CommLibrary, DaemonConfig, DaemonError, DeployRequest, DeployResponse,
    DeviceDaemon, SharedContentDesc, VarManagerInfo, DEFAULT_MAX_MESSAGE_SIZE, RANK_TABLE_INIT_SYMBOL,
    REQUEST_QUEUE_NAME, RESPONSE_QUEUE_NAME,
};
use gg_deploy::deployer::{DeployError, DeviceClient, LocalDeviceClient};
use gg_deploy::device::{DeviceEvent, DeviceRuntime, EventChannel};
use gg_deploy::executor::IdentityBackend;
use gg_deploy::format::{serialize_models, CompiledModel, DataType, ModelDef, TensorDesc};
use gg_deploy::planner::DeviceInfo;
use gg_deploy::StatusCode;

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    runtime: Arc<DeviceRuntime>,
    client: LocalDeviceClient,
    thread: Option<JoinHandle<Result<(), DaemonError>>>,
}

impl Harness {
    fn start(comm: CommLibrary) -> Self {
        let runtime = Arc::new(DeviceRuntime::new(DeviceInfo::new(0, 2, 0), 4 << 20));
        let config = DaemonConfig { event_poll: Duration::from_millis(10), ..DaemonConfig::default() };
        let daemon = DeviceDaemon::new(Arc::clone(&runtime), Arc::new(IdentityBackend), comm, config).unwrap();
        let thread = daemon.spawn().unwrap();
        let client = LocalDeviceClient::connect(Arc::clone(&runtime), WAIT, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        Self { runtime, client, thread: Some(thread) }
    }

    async fn status(&self, request: DeployRequest) -> StatusCode {
        self.client.send(request).await.unwrap().status()
    }

    fn finalize(&mut self) -> Result<(), DaemonError> {
        self.runtime.events(EventChannel::Daemon).submit(DeviceEvent::Finalize).unwrap();
        self.thread.take().unwrap().join().unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.finalize();
        }
        self.runtime.shutdown();
    }
}

fn model_bytes() -> Vec<u8> {
    let mut def = ModelDef::new("echo");
    def.inputs.push(TensorDesc::new("x", DataType::Uint8, vec![3]));
    def.outputs.push(TensorDesc::new("y", DataType::Uint8, vec![3]));
    serialize_models(&[CompiledModel::new(def)])
}

#[tokio::test(flavor = "multi_thread")]
async fn download_load_execute_unload() {
    let mut h = Harness::start(CommLibrary::new());
    let qin = h.runtime.create_queue("r1.in", 4).unwrap();
    let qout = h.runtime.create_queue("r1.out", 4).unwrap();
    let bytes = model_bytes();

    let pre = DeployRequest::PreDownload { root_model_id: 1, model_id: 0, model_size: bytes.len() as u64 };
    assert_eq!(h.status(pre).await, StatusCode::Success);
    for (i, chunk) in bytes.chunks(32).enumerate() {
        let download = DeployRequest::Download {
            root_model_id: 1,
            model_id: 0,
            offset: (i * 32) as u64,
            model_data: chunk.to_vec(),
        };
        assert_eq!(h.status(download).await, StatusCode::Success);
    }
    let load = DeployRequest::Load {
        root_model_id: 1,
        model_id: 0,
        input_queues: vec!["r1.in".into()],
        output_queues: vec!["r1.out".into()],
    };
    assert_eq!(h.status(load).await, StatusCode::Success);

    h.runtime.enqueue(qin, h.runtime.mbuf_from(b"abc").unwrap(), WAIT).unwrap();
    assert_eq!(h.runtime.dequeue(qout, WAIT).unwrap().into_vec(), b"abc");

    assert_eq!(h.status(DeployRequest::Unload { model_id: 1 }).await, StatusCode::Success);
    assert_eq!(h.status(DeployRequest::Unload { model_id: 1 }).await, StatusCode::NotFound);
    h.finalize().unwrap();
    assert!(h.runtime.queue_id(REQUEST_QUEUE_NAME).is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_pre_download_is_answered_in_band() {
    let h = Harness::start(CommLibrary::new());
    let huge = DeployRequest::PreDownload { root_model_id: 2, model_id: 0, model_size: 1 << 61 };
    assert_eq!(h.status(huge).await, StatusCode::ResourceExhaustion);

    // The daemon is still serving.
    let bytes = model_bytes();
    let pre = DeployRequest::PreDownload { root_model_id: 2, model_id: 0, model_size: bytes.len() as u64 };
    assert_eq!(h.status(pre).await, StatusCode::Success);
}

#[tokio::test(flavor = "multi_thread")]
async fn out_of_order_download_is_rejected_and_recoverable() {
    let h = Harness::start(CommLibrary::new());
    let bytes = model_bytes();
    let pre = DeployRequest::PreDownload { root_model_id: 3, model_id: 1, model_size: bytes.len() as u64 };
    assert_eq!(h.status(pre).await, StatusCode::Success);

    let skipped = DeployRequest::Download { root_model_id: 3, model_id: 1, offset: 8, model_data: bytes[8..].to_vec() };
    assert_eq!(h.status(skipped).await, StatusCode::ParamInvalid);
    let whole = DeployRequest::Download { root_model_id: 3, model_id: 1, offset: 0, model_data: bytes };
    assert_eq!(h.status(whole).await, StatusCode::Success);
}

#[tokio::test(flavor = "multi_thread")]
async fn shared_content_fills_after_seeding() {
    let h = Harness::start(CommLibrary::new());
    let chunk = |offset: u64, content: &[u8]| {
        DeployRequest::SharedContentDesc(SharedContentDesc {
            session_id: 5,
            head_offset: 64,
            total_length: 8,
            current_offset: offset,
            mem_type: 0,
            node_name: "embedding".into(),
            tensor_desc: None,
            om_content: content.to_vec(),
        })
    };

    // Unknown session before seeding.
    assert_eq!(h.status(chunk(0, b"abcd")).await, StatusCode::NotFound);

    let seed = DeployRequest::MultiVarManagerInfo {
        var_manager_info: vec![VarManagerInfo {
            device_id: 2,
            session_id: 5,
            graph_mem_max_size: 1 << 20,
            var_mem_max_size: 1 << 10,
        }],
    };
    assert_eq!(h.status(seed).await, StatusCode::Success);
    assert_eq!(h.status(chunk(0, b"abcd")).await, StatusCode::Success);
    assert_eq!(h.status(chunk(6, b"gh")).await, StatusCode::ProtocolViolation);
    assert_eq!(h.status(chunk(4, b"efgh")).await, StatusCode::Success);
}

#[tokio::test(flavor = "multi_thread")]
async fn rank_table_goes_through_injected_symbol() {
    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let comm = CommLibrary::new().with_symbol(RANK_TABLE_INIT_SYMBOL, move |table: &str, rank: i32| {
        *sink.lock() = Some((table.to_string(), rank));
        Ok(())
    });
    let h = Harness::start(comm);

    let bad = DeployRequest::DeployRankTableMessage { rank_table: "not json".into(), rank_id: 0 };
    assert_eq!(h.status(bad).await, StatusCode::ParamInvalid);
    let good = DeployRequest::DeployRankTableMessage { rank_table: r#"{"ranks":[0,1]}"#.into(), rank_id: 1 };
    assert_eq!(h.status(good).await, StatusCode::Success);
    assert_eq!(*seen.lock(), Some((r#"{"ranks":[0,1]}"#.to_string(), 1)));
}

#[test]
fn silent_device_times_out() {
    let runtime = Arc::new(DeviceRuntime::new(DeviceInfo::new(0, 9, 0), 1 << 20));
    runtime.create_queue(REQUEST_QUEUE_NAME, 4).unwrap();
    runtime.create_queue(RESPONSE_QUEUE_NAME, 4).unwrap();
    let client = LocalDeviceClient::connect(Arc::clone(&runtime), Duration::from_millis(50), 4096).unwrap();

    let err = tokio_test::block_on(client.send(DeployRequest::Unload { model_id: 1 })).unwrap_err();
    assert_eq!(err, DeployError::Timeout { device: DeviceInfo::new(0, 9, 0), kind: "unload" });
    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn late_answer_to_a_timed_out_request_is_discarded() {
    let runtime = Arc::new(DeviceRuntime::new(DeviceInfo::new(0, 5, 0), 1 << 20));
    let requests = runtime.create_queue(REQUEST_QUEUE_NAME, 4).unwrap();
    let responses = runtime.create_queue(RESPONSE_QUEUE_NAME, 4).unwrap();
    let client = LocalDeviceClient::connect(Arc::clone(&runtime), Duration::from_millis(200), 4096).unwrap();

    let err = client.send(DeployRequest::Unload { model_id: 1 }).await.unwrap_err();
    assert!(matches!(err, DeployError::Timeout { kind: "unload", .. }));

    // A slow daemon answers both requests only once the second is queued.
    let device = Arc::clone(&runtime);
    let slow_daemon = std::thread::spawn(move || {
        let answer = |bytes: &[u8], status: StatusCode| {
            let response = DeployResponse::error(status, "").with_seq(request_seq(bytes));
            let mbuf = device.mbuf_from(&encode_response(&response).unwrap()).unwrap();
            device.enqueue(responses, mbuf, WAIT).unwrap();
            device
                .events(EventChannel::Response)
                .submit(DeviceEvent::RequestDone { success: status == StatusCode::Success })
                .unwrap();
        };
        let first = device.dequeue(requests, WAIT).unwrap().into_vec();
        let second = device.dequeue(requests, WAIT).unwrap().into_vec();
        assert_ne!(request_seq(&first), request_seq(&second));
        answer(&first, StatusCode::NotFound);
        answer(&second, StatusCode::Success);
    });

    let response = client.send(DeployRequest::Unload { model_id: 2 }).await.unwrap();
    assert!(response.is_success());
    slow_daemon.join().unwrap();
    runtime.shutdown();
}

#[test]
fn connect_needs_the_control_queues() {
    let runtime = Arc::new(DeviceRuntime::new(DeviceInfo::new(0, 0, 0), 1 << 20));
    assert!(LocalDeviceClient::connect(runtime, WAIT, 4096).is_err());
}
