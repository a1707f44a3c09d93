use std::{
    convert::Infallible,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thing_common::{
    desired::telemetry_cycle_ms, ConfigParseError, RuntimeConfig, SensorReading, TelemetryEnvelope,
    Thing, ThingStatus,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cadence,
    capture::{self, CapturePlan},
    collaborators::{BlobUploader, CaptureDevice, Session, Transport},
    error::{Result, SimulatorError},
    observers::{
        CommandInvoked, DesiredConfigUpdated, EventHub, MessageReceived, ObserverId,
    },
    receive, telemetry,
};

/// Simulator-owned fields shared by the loops and the remote handlers.
#[derive(Debug, Clone)]
pub(crate) struct SimulatorState {
    pub room_temperature: f64,
    pub room_humidity: f64,
    pub telemetry_interval_ms: u64,
    pub capture_interval_ms: u64,
    pub running: bool,
}

/// State reachable from every background task and transport callback.
///
/// Lock order is `state` (outer) then `thing` (inner). Code holding `thing`
/// must never acquire `state`, and no guard is held across an `.await`.
pub(crate) struct Shared {
    state: Mutex<SimulatorState>,
    thing: Mutex<Thing>,
    session: RwLock<Option<Arc<dyn Session>>>,
    pub events: EventHub,
}

impl Shared {
    pub(crate) fn new(state: SimulatorState, thing: Thing) -> Self {
        Self {
            state: Mutex::new(state),
            thing: Mutex::new(thing),
            session: RwLock::new(None),
            events: EventHub::default(),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SimulatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inner lock on its own, for paths that touch only the thing.
    pub(crate) fn thing(&self) -> MutexGuard<'_, Thing> {
        self.thing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with both locks held, acquired outer then inner.
    pub(crate) fn with_state_and_thing<R>(
        &self,
        f: impl FnOnce(&mut SimulatorState, &mut Thing) -> R,
    ) -> R {
        let mut state = self.state();
        let mut thing = self.thing();
        f(&mut state, &mut thing)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state().running
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.state().running = running;
    }

    pub(crate) fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.state().telemetry_interval_ms)
    }

    pub(crate) fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.state().capture_interval_ms)
    }

    pub(crate) fn set_telemetry_interval_ms(&self, interval_ms: u64) {
        self.state().telemetry_interval_ms = interval_ms;
    }

    pub(crate) fn session(&self) -> Option<Arc<dyn Session>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_session(&self, session: Option<Arc<dyn Session>>) -> Option<Arc<dyn Session>> {
        let mut slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, session)
    }
}

/// Consistent view of the simulator, taken under both locks.
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorStatus {
    #[serde(rename = "roomTemperature")]
    pub room_temperature: f64,
    #[serde(rename = "roomHumidity")]
    pub room_humidity: f64,
    #[serde(rename = "telemetryCycleMs")]
    pub telemetry_interval_ms: u64,
    #[serde(rename = "captureIntervalMs")]
    pub capture_interval_ms: u64,
    pub running: bool,
    pub capturing: bool,
    #[serde(rename = "targetTemperature")]
    pub target_temperature: f64,
    #[serde(rename = "targetHumidity")]
    pub target_humidity: f64,
    pub reading: SensorReading,
}

#[derive(Default)]
struct BackgroundTasks {
    cadence: Option<JoinHandle<()>>,
    telemetry: Option<JoinHandle<()>>,
    receive: Option<JoinHandle<()>>,
}

struct CaptureTask {
    cancel: CancellationToken,
    handle: JoinHandle<Result<Infallible>>,
}

/// Orchestrates the simulated thing, its session and its background loops.
pub struct Simulator {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    capture_device: Arc<dyn CaptureDevice>,
    uploader: Arc<dyn BlobUploader>,
    capture_plan: CapturePlan,
    update_interval_ms: u64,
    tasks: Mutex<BackgroundTasks>,
    capture: Mutex<Option<CaptureTask>>,
}

impl Simulator {
    pub fn new(
        config: &RuntimeConfig,
        transport: Arc<dyn Transport>,
        capture_device: Arc<dyn CaptureDevice>,
        uploader: Arc<dyn BlobUploader>,
    ) -> Self {
        let settings = &config.simulator;
        let state = SimulatorState {
            room_temperature: settings.room_temperature,
            room_humidity: settings.room_humidity,
            telemetry_interval_ms: settings.telemetry_cycle_ms,
            capture_interval_ms: settings.capture_interval_ms,
            running: false,
        };

        Self {
            shared: Arc::new(Shared::new(state, Thing::new(config.thing.clone()))),
            transport,
            capture_device,
            uploader,
            capture_plan: CapturePlan::from_config(
                &config.capture,
                &config.network.connection_string,
            ),
            update_interval_ms: settings.update_interval_ms,
            tasks: Mutex::new(BackgroundTasks::default()),
            capture: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.shared.events
    }

    pub fn on_command_invoked(
        &self,
        observer: impl Fn(&CommandInvoked) + Send + Sync + 'static,
    ) -> ObserverId {
        self.shared.events.command_invoked.subscribe(Arc::new(observer))
    }

    pub fn on_desired_config_updated(
        &self,
        observer: impl Fn(&DesiredConfigUpdated) + Send + Sync + 'static,
    ) -> ObserverId {
        self.shared
            .events
            .desired_config_updated
            .subscribe(Arc::new(observer))
    }

    pub fn on_message_received(
        &self,
        observer: impl Fn(&MessageReceived) + Send + Sync + 'static,
    ) -> ObserverId {
        self.shared.events.message_received.subscribe(Arc::new(observer))
    }

    pub fn capture_plan(&self) -> &CapturePlan {
        &self.capture_plan
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    /// Registers the remote handler, opens the session and adopts the
    /// telemetry cadence from the service's current desired configuration.
    pub async fn initialize(&self) -> Result<()> {
        self.transport
            .set_remote_handler(self.shared.clone())
            .await;
        let session = self.transport.open().await?;
        self.shared.replace_session(Some(session.clone()));

        let desired = session.desired_config().await?;
        match telemetry_cycle_ms(&desired) {
            Some(Ok(interval_ms)) => {
                self.shared.set_telemetry_interval_ms(interval_ms);
                info!("adopted desired telemetry cycle of {interval_ms} ms");
            }
            Some(Err(err)) => warn!("ignoring desired telemetry cycle: {err}"),
            None => {}
        }

        info!("simulator session initialized");
        Ok(())
    }

    /// Primes the thing from room conditions and launches the cadence,
    /// telemetry and receive loops. A simulator starts at most once.
    pub fn start(&self) -> Result<()> {
        let session = self.shared.session().ok_or(SimulatorError::NotInitialized)?;
        let update_interval_ms = self.update_interval_ms;

        self.shared.with_state_and_thing(|state, thing| {
            if state.running || thing.status() != ThingStatus::Initializing {
                return Err(SimulatorError::AlreadyStarted);
            }
            thing.prime(state.room_temperature, state.room_humidity);
            thing.initialize(update_interval_ms);
            state.running = true;
            Ok(())
        })?;

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.cadence = Some(tokio::spawn(cadence::run(self.shared.clone())));
        tasks.telemetry = Some(tokio::spawn(telemetry::run(
            self.shared.clone(),
            session.clone(),
        )));
        tasks.receive = Some(tokio::spawn(receive::run(self.shared.clone(), session)));

        info!("simulator started");
        Ok(())
    }

    /// Terminates the thing and waits for its cadence to wind down.
    ///
    /// The run flag is left untouched, so telemetry and receive loops keep
    /// going until [`Simulator::halt`] clears it.
    pub async fn stop(&self) {
        self.shared.thing().terminate();

        let cadence = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cadence
            .take();
        if let Some(handle) = cadence {
            if let Err(err) = handle.await {
                warn!("thing cadence task failed: {err}");
            }
        }
        info!("thing terminated");
    }

    /// Clears the run flag and waits for the telemetry and receive loops to
    /// observe it.
    pub async fn halt(&self) {
        self.shared.set_running(false);

        let (telemetry, receive) = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            (tasks.telemetry.take(), tasks.receive.take())
        };
        for (name, handle) in [("telemetry", telemetry), ("receive", receive)] {
            if let Some(handle) = handle {
                if let Err(err) = handle.await {
                    warn!("{name} loop failed: {err}");
                }
            }
        }
        info!("simulator loops halted");
    }

    /// Closes the session. Safe to call when none is open.
    pub async fn terminate(&self) -> Result<()> {
        if let Some(session) = self.shared.replace_session(None) {
            session.close().await?;
            info!("simulator session closed");
        }
        Ok(())
    }

    /// Records the ambient temperature and, while the thing is stable,
    /// makes it the thing's target.
    pub fn room(&self, temperature: f64) {
        self.shared.with_state_and_thing(|state, thing| {
            state.room_temperature = temperature;
            if thing.status() == ThingStatus::Stable {
                thing.set_target_temperature(temperature);
            }
        });
    }

    /// Records the ambient humidity and always makes it the thing's target.
    pub fn humidity(&self, humidity: f64) {
        self.shared.with_state_and_thing(|state, thing| {
            state.room_humidity = humidity;
            thing.set_target_humidity(humidity);
        });
    }

    pub fn change_capture_interval(&self, interval_ms: u64) {
        self.shared.state().capture_interval_ms = interval_ms;
    }

    pub fn start_capture(&self, interval_ms: u64) -> Result<()> {
        let mut capture = self.capture.lock().unwrap_or_else(PoisonError::into_inner);
        if capture
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
        {
            return Err(SimulatorError::CaptureAlreadyRunning);
        }

        self.change_capture_interval(interval_ms);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(capture::run(
            self.shared.clone(),
            self.capture_device.clone(),
            self.uploader.clone(),
            self.capture_plan.clone(),
            cancel.clone(),
        ));
        *capture = Some(CaptureTask { cancel, handle });

        info!("capture loop started with {interval_ms} ms interval");
        Ok(())
    }

    /// Cancels the capture loop and waits until it has exited. Loop failures
    /// are logged, never returned.
    pub async fn end_capture(&self) {
        let task = self
            .capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return;
        };

        task.cancel.cancel();
        match task.handle.await {
            Ok(Err(err)) if err.is_cancelled() => info!("capture loop stopped"),
            Ok(Err(err)) => warn!("capture loop ended with error: {err}"),
            Ok(Ok(never)) => match never {},
            Err(err) => warn!("capture loop stopped abnormally: {err}"),
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Publishes `message` in a telemetry envelope, structured when the text
    /// is a JSON object.
    pub async fn send_event(&self, message: &str) -> Result<()> {
        let session = self.shared.session().ok_or(SimulatorError::NotInitialized)?;
        let envelope = TelemetryEnvelope::from_text(Utc::now(), message);
        session.publish(serde_json::to_vec(&envelope)?).await?;
        Ok(())
    }

    /// Reports a JSON object as the device's state.
    pub async fn update_reported_state(&self, json: &str) -> Result<()> {
        let session = self.shared.session().ok_or(SimulatorError::NotInitialized)?;
        let Value::Object(reported) = serde_json::from_str::<Value>(json)? else {
            return Err(ConfigParseError::NotAnObject.into());
        };
        session.report_state(reported).await?;
        Ok(())
    }

    pub fn snapshot(&self) -> SimulatorStatus {
        self.snapshot_at(Utc::now())
    }

    fn snapshot_at(&self, at: DateTime<Utc>) -> SimulatorStatus {
        let capturing = self.is_capturing();
        self.shared.with_state_and_thing(|state, thing| SimulatorStatus {
            room_temperature: state.room_temperature,
            room_humidity: state.room_humidity,
            telemetry_interval_ms: state.telemetry_interval_ms,
            capture_interval_ms: state.capture_interval_ms,
            running: state.running,
            capturing,
            target_temperature: thing.target_temperature(),
            target_humidity: thing.target_humidity(),
            reading: thing.read(at),
        })
    }
}
