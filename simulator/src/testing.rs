//! In-memory doubles for the collaborator traits.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use thing_common::{DesiredConfig, ReportedState, RuntimeConfig};
use tokio::{
    sync::{mpsc, Notify},
    time::Instant,
};

use crate::{
    collaborators::{
        BlobUploader, CaptureDevice, Frame, InboundMessage, RemoteHandler, Session, Transport,
    },
    error::{CaptureError, TransportError},
    simulator::{Shared, Simulator},
};

const MOCK_RECEIVE_WINDOW: Duration = Duration::from_millis(1_000);
const GAP_TOLERANCE_MS: u64 = 5;

pub fn desired(value: Value) -> DesiredConfig {
    match value {
        Value::Object(map) => map,
        other => panic!("desired config must be an object, got {other}"),
    }
}

/// Asserts that `later - earlier` is `expected_ms` within a few millis.
pub fn assert_gap(earlier: Instant, later: Instant, expected_ms: u64) {
    let gap = later.duration_since(earlier).as_millis() as u64;
    assert!(
        gap.abs_diff(expected_ms) <= GAP_TOLERANCE_MS,
        "expected a gap of {expected_ms} ms, got {gap} ms"
    );
}

/// Decrements `counter` if positive; true when a failure was consumed.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

pub struct MockSession {
    published: Mutex<Vec<(Instant, Vec<u8>)>>,
    reported: Mutex<Vec<ReportedState>>,
    acknowledged: Mutex<Vec<u64>>,
    desired: Mutex<DesiredConfig>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    next_id: AtomicU64,
    publish_gate: Mutex<Option<Arc<Notify>>>,
    publish_started: Notify,
    fail_publishes: AtomicBool,
    receive_failures_left: AtomicUsize,
    closes: AtomicUsize,
}

impl Default for MockSession {
    fn default() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            published: Mutex::new(Vec::new()),
            reported: Mutex::new(Vec::new()),
            acknowledged: Mutex::new(Vec::new()),
            desired: Mutex::new(DesiredConfig::new()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            next_id: AtomicU64::new(1),
            publish_gate: Mutex::new(None),
            publish_started: Notify::new(),
            fail_publishes: AtomicBool::new(false),
            receive_failures_left: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }
}

impl MockSession {
    pub fn set_desired(&self, desired: DesiredConfig) {
        *self.desired.lock().unwrap() = desired;
    }

    pub fn push_inbound(&self, body: &[u8]) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.inbound_tx
            .send(InboundMessage {
                id,
                topic: "things/thing-test/inbox".to_string(),
                body: body.to_vec(),
            })
            .unwrap();
        id
    }

    pub fn acknowledged(&self) -> Vec<u64> {
        self.acknowledged.lock().unwrap().clone()
    }

    pub fn published_json(&self) -> Vec<Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body)| serde_json::from_slice(body).unwrap())
            .collect()
    }

    pub fn publish_times(&self) -> Vec<Instant> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn reported(&self) -> Vec<ReportedState> {
        self.reported.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Blocks every publish until `gate` is notified once per publish.
    pub fn hold_publishes(&self, gate: Arc<Notify>) {
        *self.publish_gate.lock().unwrap() = Some(gate);
    }

    pub fn publish_started(&self) -> &Notify {
        &self.publish_started
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_receives(&self, count: usize) {
        self.receive_failures_left.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Session for MockSession {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.publish_started.notify_one();
        let gate = self.publish_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::Client("broker unavailable".to_string()));
        }
        self.published
            .lock()
            .unwrap()
            .push((Instant::now(), payload));
        Ok(())
    }

    async fn receive(&self) -> Result<Option<InboundMessage>, TransportError> {
        if take_one(&self.receive_failures_left) {
            return Err(TransportError::Client("connection reset".to_string()));
        }
        let mut inbound = self.inbound_rx.lock().await;
        match tokio::time::timeout(MOCK_RECEIVE_WINDOW, inbound.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Err(TransportError::NotOpen),
            Err(_) => Ok(None),
        }
    }

    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), TransportError> {
        self.acknowledged.lock().unwrap().push(message.id);
        Ok(())
    }

    async fn desired_config(&self) -> Result<DesiredConfig, TransportError> {
        Ok(self.desired.lock().unwrap().clone())
    }

    async fn report_state(&self, reported: ReportedState) -> Result<(), TransportError> {
        self.reported.lock().unwrap().push(reported);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockTransport {
    pub session: Arc<MockSession>,
    handler: Mutex<Option<Arc<dyn RemoteHandler>>>,
}

impl MockTransport {
    /// The handler registered by `Simulator::initialize`.
    pub fn handler(&self) -> Arc<dyn RemoteHandler> {
        self.handler
            .lock()
            .unwrap()
            .clone()
            .expect("remote handler not registered")
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn set_remote_handler(&self, handler: Arc<dyn RemoteHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    async fn open(&self) -> Result<Arc<dyn Session>, TransportError> {
        Ok(self.session.clone())
    }
}

#[derive(Default)]
pub struct MockCamera {
    captures: AtomicUsize,
    failures_left: AtomicUsize,
    panic_on_capture: AtomicBool,
    writes: Mutex<Vec<PathBuf>>,
}

impl MockCamera {
    pub fn fail_next_captures(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn panic_on_capture(&self) {
        self.panic_on_capture.store(true, Ordering::SeqCst);
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<PathBuf> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl CaptureDevice for MockCamera {
    async fn capture_frame(&self) -> Result<Frame, CaptureError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_capture.load(Ordering::SeqCst) {
            panic!("camera driver crashed");
        }
        if take_one(&self.failures_left) {
            return Err(CaptureError::Device("lens cap on".to_string()));
        }
        Ok(Frame::new(4, 3))
    }

    async fn write_frame(&self, _frame: &Frame, path: &Path) -> Result<(), CaptureError> {
        self.writes.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub name: String,
    pub local_path: PathBuf,
    pub at: Instant,
}

#[derive(Default)]
pub struct MockUploader {
    uploads: Mutex<Vec<Upload>>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl MockUploader {
    pub fn fail_next_uploads(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlobUploader for MockUploader {
    async fn upload(&self, name: &str, local_path: &Path) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failures_left) {
            return Err(TransportError::Client("container unavailable".to_string()));
        }
        self.uploads.lock().unwrap().push(Upload {
            name: name.to_string(),
            local_path: local_path.to_path_buf(),
            at: Instant::now(),
        });
        Ok(())
    }
}

pub fn test_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.network.connection_string = "HostName=localhost;DeviceId=thing-test".to_string();
    config.simulator.telemetry_cycle_ms = 5_000;
    config.simulator.update_interval_ms = 1_000;
    config
}

pub struct Harness {
    pub simulator: Arc<Simulator>,
    pub transport: Arc<MockTransport>,
    pub camera: Arc<MockCamera>,
    pub uploader: Arc<MockUploader>,
}

impl Harness {
    pub fn new() -> Self {
        let transport = Arc::new(MockTransport::default());
        let camera = Arc::new(MockCamera::default());
        let uploader = Arc::new(MockUploader::default());
        let simulator = Arc::new(Simulator::new(
            &test_config(),
            transport.clone(),
            camera.clone(),
            uploader.clone(),
        ));
        Self {
            simulator,
            transport,
            camera,
            uploader,
        }
    }

    pub async fn start(&self) {
        self.simulator.initialize().await.unwrap();
        self.simulator.start().unwrap();
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        self.simulator.shared()
    }

    /// The simulator's remote handler, whether or not a session is open.
    pub fn handler(&self) -> Arc<dyn RemoteHandler> {
        self.simulator.shared()
    }
}
