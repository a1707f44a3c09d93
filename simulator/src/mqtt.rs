//! MQTT-backed session with the remote management service.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, Publish, QoS};
use serde_json::{json, Value};
use thing_common::{
    desired::parse_desired,
    topics::{self, InboundTopic},
    DesiredConfig, NetworkConfig, ReportedState,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    collaborators::{
        CommandRequest, CommandResponse, InboundMessage, RemoteHandler, Session, Transport,
    },
    error::TransportError,
};

const REQUEST_CAPACITY: usize = 64;
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(2);
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

fn client_error(err: rumqttc::ClientError) -> TransportError {
    TransportError::Client(err.to_string())
}

pub struct MqttTransport {
    network: NetworkConfig,
    device_id: String,
    handler: Mutex<Option<Arc<dyn RemoteHandler>>>,
}

impl MqttTransport {
    pub fn new(network: NetworkConfig) -> Self {
        let device_id = network.device_id();
        Self {
            network,
            device_id,
            handler: Mutex::new(None),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.device_id.clone(),
            self.network.mqtt_host.clone(),
            self.network.mqtt_port,
        );
        options.set_keep_alive(Duration::from_secs(self.network.keep_alive_secs));
        options.set_manual_acks(true);
        if !self.network.mqtt_user.is_empty() {
            options.set_credentials(
                self.network.mqtt_user.clone(),
                self.network.mqtt_pass.clone(),
            );
        }
        options
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn set_remote_handler(&self, handler: Arc<dyn RemoteHandler>) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    async fn open(&self) -> Result<Arc<dyn Session>, TransportError> {
        let (client, eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);

        for filter in [
            topics::inbox_filter(&self.device_id),
            topics::command_filter(&self.device_id),
            topics::desired_topic(&self.device_id),
            topics::desired_patch_topic(&self.device_id),
        ] {
            client
                .subscribe(filter, QoS::AtLeastOnce)
                .await
                .map_err(client_error)?;
        }

        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let (dispatcher, session) = link(client, self.device_id.clone(), handler, &self.network);
        let handle = tokio::spawn(dispatcher.run(eventloop));
        *session
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(
            "mqtt session opening to {}:{} as {}",
            self.network.mqtt_host, self.network.mqtt_port, self.device_id
        );
        Ok(Arc::new(session))
    }
}

/// Wires a dispatcher and a session around one client.
fn link(
    client: AsyncClient,
    device_id: String,
    handler: Option<Arc<dyn RemoteHandler>>,
    network: &NetworkConfig,
) -> (Dispatcher, MqttSession) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (desired_tx, desired_rx) = watch::channel(None);
    let pending = Arc::new(Mutex::new(HashMap::new()));
    let closed = CancellationToken::new();

    let dispatcher = Dispatcher {
        client: client.clone(),
        device_id: device_id.clone(),
        handler,
        inbound: inbound_tx,
        pending: pending.clone(),
        desired: desired_tx,
        next_id: AtomicU64::new(1),
        closed: closed.clone(),
    };
    let session = MqttSession {
        client,
        device_id,
        inbound: tokio::sync::Mutex::new(inbound_rx),
        pending,
        desired: desired_rx,
        closed,
        dispatcher: Mutex::new(None),
        receive_timeout: Duration::from_millis(network.receive_timeout_ms),
        desired_timeout: Duration::from_millis(network.desired_config_timeout_ms),
    };
    (dispatcher, session)
}

type PendingAcks = Arc<Mutex<HashMap<u64, Publish>>>;

/// Owns the event loop: routes incoming publishes to the inbox, the remote
/// handler or the desired-document slot.
struct Dispatcher {
    client: AsyncClient,
    device_id: String,
    handler: Option<Arc<dyn RemoteHandler>>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    pending: PendingAcks,
    desired: watch::Sender<Option<DesiredConfig>>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl Dispatcher {
    async fn run(self, mut eventloop: EventLoop) {
        loop {
            let event = tokio::select! {
                _ = self.closed.cancelled() => break,
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Incoming::Publish(publish))) => self.dispatch(publish).await,
                Ok(Event::Incoming(Incoming::ConnAck(_))) => info!("mqtt connected"),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("mqtt disconnect sent");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::select! {
                        _ = self.closed.cancelled() => break,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        debug!("mqtt dispatcher stopped");
    }

    async fn dispatch(&self, publish: Publish) {
        match topics::classify(&self.device_id, &publish.topic) {
            InboundTopic::Inbox => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let message = InboundMessage {
                    id,
                    topic: publish.topic.clone(),
                    body: publish.payload.to_vec(),
                };
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id, publish.clone());
                // Acked by the session once the receive loop has handled it.
                if self.inbound.send(message).is_err() {
                    debug!("inbox receiver dropped");
                }
                return;
            }
            InboundTopic::Command { name, request_id } => {
                let request = CommandRequest {
                    name: name.to_string(),
                    request_id: request_id.to_string(),
                    payload: publish.payload.to_vec(),
                };
                self.spawn_command(request);
            }
            InboundTopic::Desired => match parse_desired(&publish.payload) {
                Ok(desired) => {
                    self.desired.send_replace(Some(desired));
                }
                Err(err) => warn!("ignoring desired document: {err}"),
            },
            InboundTopic::DesiredPatch => match parse_desired(&publish.payload) {
                Ok(patch) => self.spawn_desired_update(patch),
                Err(err) => warn!("ignoring desired patch: {err}"),
            },
            InboundTopic::Other => debug!(topic = %publish.topic, "unrouted publish"),
        }

        // Never wait on the request channel here: only this task drains it.
        if let Err(err) = self.client.try_ack(&publish) {
            warn!("failed to ack {}: {err}", publish.topic);
        }
    }

    fn spawn_command(&self, request: CommandRequest) {
        let Some(handler) = self.handler.clone() else {
            warn!("command {} received with no handler registered", request.name);
            return;
        };
        let client = self.client.clone();
        let topic = topics::command_response_topic(&self.device_id, &request.request_id);
        tokio::spawn(async move {
            let response = handler.on_command(request).await;
            let body = command_response_body(&response);
            let sent = bounded(client.publish(topic, QoS::AtLeastOnce, false, body)).await;
            if let Err(err) = sent {
                warn!("failed to publish command response: {err}");
            }
        });
    }

    fn spawn_desired_update(&self, patch: DesiredConfig) {
        let Some(handler) = self.handler.clone() else {
            warn!("desired patch received with no handler registered");
            return;
        };
        tokio::spawn(async move { handler.on_desired_update(patch).await });
    }
}

/// `{ "status": <code>, "payload": <json or string> }`
fn command_response_body(response: &CommandResponse) -> Vec<u8> {
    let payload = serde_json::from_slice::<Value>(&response.body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&response.body).into_owned()));
    json!({ "status": response.status, "payload": payload })
        .to_string()
        .into_bytes()
}

pub struct MqttSession {
    client: AsyncClient,
    device_id: String,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    pending: PendingAcks,
    desired: watch::Receiver<Option<DesiredConfig>>,
    closed: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    receive_timeout: Duration,
    desired_timeout: Duration,
}

impl MqttSession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::NotOpen);
        }
        Ok(())
    }

    /// Queues a publish, giving up once the request channel has stayed full
    /// for `REQUEST_TIMEOUT`.
    async fn send(&self, topic: String, payload: Vec<u8>) -> Result<(), TransportError> {
        bounded(self.client.publish(topic, QoS::AtLeastOnce, false, payload)).await
    }
}

async fn bounded(
    request: impl std::future::Future<Output = Result<(), rumqttc::ClientError>>,
) -> Result<(), TransportError> {
    match tokio::time::timeout(REQUEST_TIMEOUT, request).await {
        Ok(result) => result.map_err(client_error),
        Err(_) => Err(TransportError::Timeout),
    }
}

#[async_trait]
impl Session for MqttSession {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.send(topics::telemetry_topic(&self.device_id), payload)
            .await
    }

    async fn receive(&self) -> Result<Option<InboundMessage>, TransportError> {
        self.ensure_open()?;
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::NotOpen),
            received = tokio::time::timeout(self.receive_timeout, inbound.recv()) => match received {
                Ok(Some(message)) => Ok(Some(message)),
                Ok(None) => Err(TransportError::NotOpen),
                Err(_) => Ok(None),
            },
        }
    }

    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), TransportError> {
        let publish = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&message.id);
        match publish {
            Some(publish) => bounded(self.client.ack(&publish)).await,
            None => {
                debug!("message {} already acknowledged", message.id);
                Ok(())
            }
        }
    }

    /// The retained desired document, or an empty one if the broker holds
    /// none within the configured window.
    async fn desired_config(&self) -> Result<DesiredConfig, TransportError> {
        self.ensure_open()?;
        let mut desired = self.desired.clone();
        let waited = tokio::time::timeout(self.desired_timeout, async move {
            desired
                .wait_for(Option::is_some)
                .await
                .map(|doc| doc.clone().unwrap_or_default())
        })
        .await;

        match waited {
            Ok(Ok(doc)) => Ok(doc),
            Ok(Err(_)) => Err(TransportError::NotOpen),
            Err(_) => {
                debug!("no retained desired document");
                Ok(DesiredConfig::new())
            }
        }
    }

    async fn report_state(&self, reported: ReportedState) -> Result<(), TransportError> {
        self.ensure_open()?;
        let body = serde_json::to_vec(&Value::Object(reported))?;
        self.send(topics::reported_topic(&self.device_id), body)
            .await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        let result = bounded(self.client.disconnect()).await;

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = dispatcher {
            if tokio::time::timeout(CLOSE_GRACE, handle).await.is_err() {
                warn!("mqtt dispatcher did not stop within {CLOSE_GRACE:?}");
            }
        }
        self.closed.cancel();
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct RecordingHandler {
        commands: StdMutex<Vec<CommandRequest>>,
        patches: StdMutex<Vec<DesiredConfig>>,
    }

    #[async_trait]
    impl RemoteHandler for RecordingHandler {
        async fn on_command(&self, request: CommandRequest) -> CommandResponse {
            self.commands.lock().unwrap().push(request);
            CommandResponse {
                status: 200,
                body: b"{}".to_vec(),
            }
        }

        async fn on_desired_update(&self, desired: DesiredConfig) {
            self.patches.lock().unwrap().push(desired);
        }
    }

    fn network() -> NetworkConfig {
        NetworkConfig {
            connection_string: "HostName=hub;DeviceId=dev1".to_string(),
            receive_timeout_ms: 200,
            desired_config_timeout_ms: 100,
            ..NetworkConfig::default()
        }
    }

    fn wired(handler: Arc<RecordingHandler>) -> (Dispatcher, MqttSession, EventLoop) {
        let options = MqttOptions::new("dev1", "127.0.0.1", 1883);
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (dispatcher, session) = link(client, "dev1".to_string(), Some(handler), &network());
        (dispatcher, session, eventloop)
    }

    fn publish(topic: &str, payload: &[u8]) -> Publish {
        Publish::new(topic, QoS::AtLeastOnce, payload.to_vec())
    }

    #[tokio::test]
    async fn inbox_publish_is_received_and_acknowledged_once() {
        let (dispatcher, session, _eventloop) = wired(Arc::default());

        dispatcher
            .dispatch(publish("things/dev1/inbox/alerts", b"hello"))
            .await;
        let message = session.receive().await.unwrap().unwrap();

        assert_eq!(message.topic, "things/dev1/inbox/alerts");
        assert_eq!(message.body, b"hello".to_vec());
        session.acknowledge(&message).await.unwrap();
        assert!(dispatcher.pending.lock().unwrap().is_empty());
        session.acknowledge(&message).await.unwrap();
    }

    #[tokio::test]
    async fn receive_times_out_with_none() {
        let (_dispatcher, session, _eventloop) = wired(Arc::default());
        assert_eq!(session.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn retained_desired_document_is_returned() {
        let (dispatcher, session, _eventloop) = wired(Arc::default());

        assert!(session.desired_config().await.unwrap().is_empty());

        dispatcher
            .dispatch(publish(
                "things/dev1/config/desired",
                br#"{"telemetry-cycle-msec":2000}"#,
            ))
            .await;
        let desired = session.desired_config().await.unwrap();
        assert_eq!(desired["telemetry-cycle-msec"], json!(2000));
    }

    #[tokio::test]
    async fn commands_and_patches_reach_the_handler() {
        let handler = Arc::new(RecordingHandler::default());
        let (dispatcher, _session, _eventloop) = wired(handler.clone());

        dispatcher
            .dispatch(publish("things/dev1/commands/reboot/r-9", b"{}"))
            .await;
        dispatcher
            .dispatch(publish("things/dev1/config/desired/patch", br#"{"a":1}"#))
            .await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let commands = handler.commands.lock().unwrap().clone();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].name, "reboot");
        assert_eq!(commands[0].request_id, "r-9");
        assert_eq!(handler.patches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_session_rejects_io() {
        let (_dispatcher, session, _eventloop) = wired(Arc::default());

        session.close().await.unwrap();
        session.close().await.unwrap();

        assert!(matches!(session.receive().await, Err(TransportError::NotOpen)));
        assert!(matches!(
            session.publish(b"x".to_vec()).await,
            Err(TransportError::NotOpen)
        ));
    }

    async fn fill_request_channel(session: &MqttSession) {
        for _ in 0..REQUEST_CAPACITY {
            session.publish(b"{}".to_vec()).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publish_times_out_while_requests_back_up() {
        let (_dispatcher, session, _eventloop) = wired(Arc::default());
        fill_request_channel(&session).await;

        let started = tokio::time::Instant::now();
        let outcome = session.publish(b"{}".to_vec()).await;

        assert!(matches!(outcome, Err(TransportError::Timeout)));
        assert!(started.elapsed() >= REQUEST_TIMEOUT);
        assert!(matches!(
            session.report_state(ReportedState::new()).await,
            Err(TransportError::Timeout)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_does_not_wait_for_request_capacity() {
        let (dispatcher, session, _eventloop) = wired(Arc::default());
        fill_request_channel(&session).await;

        let started = tokio::time::Instant::now();
        dispatcher
            .dispatch(publish(
                "things/dev1/config/desired",
                br#"{"telemetry-cycle-msec":2000}"#,
            ))
            .await;

        assert_eq!(started.elapsed(), Duration::ZERO);
        let desired = session.desired_config().await.unwrap();
        assert_eq!(desired["telemetry-cycle-msec"], json!(2000));
    }

    #[test]
    fn command_response_wraps_json_or_text_payload() {
        let json_body = command_response_body(&CommandResponse {
            status: 200,
            body: br#"{"ok":true}"#.to_vec(),
        });
        let text_body = command_response_body(&CommandResponse {
            status: 500,
            body: b"boom".to_vec(),
        });

        let json_body: Value = serde_json::from_slice(&json_body).unwrap();
        let text_body: Value = serde_json::from_slice(&text_body).unwrap();
        assert_eq!(json_body, json!({ "status": 200, "payload": { "ok": true } }));
        assert_eq!(text_body, json!({ "status": 500, "payload": "boom" }));
    }
}
