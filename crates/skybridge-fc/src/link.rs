//! [`FlightControllerLink`] – owner of the autopilot session.
//!
//! # Lifecycle
//!
//! [`FlightControllerLink::run`] drives one session from start to finish:
//!
//! 1. Poll the device for presence with a growing delay
//!    (`poll_start`, ×`poll_factor`, capped at `poll_cap`).
//! 2. Open it on a blocking worker and wait for the first autopilot beacon.
//! 3. Send one identifying beacon, then spawn the background task set:
//!
//! | Task          | Job                                                        |
//! |---------------|------------------------------------------------------------|
//! | reader        | decode frames; beacons, acks, params, telemetry, logs      |
//! | liveness      | beacon exchange, device-loss detection, stale-command sweep|
//! | stream rates  | periodic `REQUEST_DATA_STREAM` for the classic streams     |
//! | param fetch   | one full parameter download on connect                     |
//!
//! 4. On [`FlightControllerLink::stop`] (or device loss) abort the task set,
//!    close the transport and emit the final shutdown diagnostic.
//!
//! The link is the single writer of the [`StateTable`] and the only
//! producer on the change-log queue. Everything it has to report goes
//! through the injected [`RelaySink`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use skybridge_types::logs::{self, LogVariables, log_vars};
use skybridge_types::{
    BridgeError, ChangeEvent, ChangeLogWriter, CommandDispatcher, CommandId, CommandParam,
    CommandRequest, OutboundMessage, RelaySink, StateTable, StateView, TelemetryFrame, symbols,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::frame::{
    AutopilotFrame, DataStream, NOISE_FIELDS, OutboundFrame, is_telemetry_category,
};
use crate::liveness::{BeaconMonitor, BeaconWait, LinkHealth};
use crate::params::{ParameterFetchSession, ParameterStore};
use crate::pending::PendingCommands;
use crate::transport::{AutopilotDevice, AutopilotSession, AutopilotTransport};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Timing tunables of the link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    /// First delay between device-presence probes.
    pub poll_start: Duration,
    /// Growth factor applied to the probe delay after each miss.
    pub poll_factor: f64,
    /// Upper bound of the probe delay.
    pub poll_cap: Duration,
    /// How long one liveness cycle waits for an autopilot beacon.
    pub beacon_timeout: Duration,
    /// Age after which an unacknowledged command is reported.
    pub stale_command_age: Duration,
    /// Default acknowledgement timeout for dispatched commands.
    pub command_timeout: Duration,
    pub param_poll: Duration,
    /// A parameter download ends after this long without a new frame.
    pub param_idle: Duration,
    /// Rate requested for every classic data stream.
    pub stream_rate_hz: u16,
    pub stream_request_delay: Duration,
    pub stream_request_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            poll_start: Duration::from_secs(1),
            poll_factor: 1.1,
            poll_cap: Duration::from_secs(5),
            beacon_timeout: Duration::from_secs(2),
            stale_command_age: Duration::from_secs(5),
            command_timeout: Duration::from_secs(3),
            param_poll: Duration::from_millis(500),
            param_idle: Duration::from_secs(5),
            stream_rate_hz: 1,
            stream_request_delay: Duration::from_secs(6),
            stream_request_interval: Duration::from_secs(10),
        }
    }
}

/// Observable link flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub connected: bool,
    pub params_loaded: bool,
    pub health: LinkHealth,
}

// ────────────────────────────────────────────────────────────────────────────
// FlightControllerLink
// ────────────────────────────────────────────────────────────────────────────

/// Handle to the autopilot session. Cheap to clone; all clones share one
/// session.
#[derive(Clone)]
pub struct FlightControllerLink {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct ParamState {
    store: ParameterStore,
    session: Option<ParameterFetchSession>,
}

struct Inner {
    device: Box<dyn AutopilotDevice>,
    config: LinkConfig,
    sink: Arc<dyn RelaySink>,
    state: StateTable,
    changelog: ChangeLogWriter,
    transport: OnceLock<Arc<dyn AutopilotTransport>>,
    liveness: BeaconMonitor,
    pending: PendingCommands,
    params: Mutex<ParamState>,
    stream_rates: Mutex<BTreeMap<DataStream, u16>>,
    boot_estimate: Mutex<Option<f64>>,
    connected: AtomicBool,
    params_loaded: AtomicBool,
    stop: watch::Sender<bool>,
}

impl FlightControllerLink {
    /// Build a link over `device`. Nothing is opened until [`run`](Self::run).
    pub fn new(
        device: impl AutopilotDevice + 'static,
        sink: Arc<dyn RelaySink>,
        state: StateTable,
        changelog: ChangeLogWriter,
        config: LinkConfig,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                device: Box::new(device),
                config,
                sink,
                state,
                changelog,
                transport: OnceLock::new(),
                liveness: BeaconMonitor::new(),
                pending: PendingCommands::new(),
                params: Mutex::default(),
                stream_rates: Mutex::default(),
                boot_estimate: Mutex::new(None),
                connected: AtomicBool::new(false),
                params_loaded: AtomicBool::new(false),
                stop,
            }),
        }
    }

    /// Run the session until [`stop`](Self::stop) is called or the device
    /// disappears. Never fails; every problem is reported through the sink.
    pub async fn run(&self) {
        let inner = &self.inner;
        let mut stop = inner.stop.subscribe();

        let connected = tokio::select! {
            result = self.connect() => result,
            _ = stop_requested(&mut stop) => {
                self.shutdown();
                return;
            }
        };
        let frames = match connected {
            Ok(frames) => frames,
            Err(e) => {
                inner.report_error("connecting to autopilot", &e, &inner.device.describe());
                self.shutdown();
                return;
            }
        };

        let mut tasks = JoinSet::new();
        tasks.spawn(reader_loop(Arc::clone(inner), frames));
        tasks.spawn(liveness_loop(Arc::clone(inner)));
        tasks.spawn(stream_rate_loop(Arc::clone(inner)));
        {
            let link = self.clone();
            tasks.spawn(async move {
                if let Err(e) = link.fetch_parameters().await {
                    link.inner.report_error("fetching parameters", &e, "");
                }
            });
        }

        stop_requested(&mut stop).await;
        tasks.abort_all();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Err(e) if !e.is_cancelled() => warn!(error = %e, "Link task failed"),
                _ => {}
            }
        }
        self.shutdown();
    }

    /// Ask [`run`](Self::run) to unwind. Idempotent.
    pub fn stop(&self) {
        self.inner.stop.send_replace(true);
    }

    /// Read-only view of the state table this link writes.
    pub fn state(&self) -> StateView {
        self.inner.state.view()
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            connected: self.inner.connected.load(Ordering::SeqCst),
            params_loaded: self.inner.params_loaded.load(Ordering::SeqCst),
            health: self.inner.liveness.health(),
        }
    }

    /// Snapshot of the permanent parameter store.
    pub fn parameters(&self) -> BTreeMap<String, f32> {
        self.inner.lock_params().store.snapshot()
    }

    /// Send `command` and wait for its acknowledgement.
    ///
    /// `command` may be numeric or a `MAV_CMD_*` name; `params` are
    /// resolved through the symbol tables and zero-padded to seven. A later
    /// dispatch of the same command id supersedes this one, which then
    /// only ends through its own timeout.
    pub async fn dispatch(
        &self,
        command: &CommandId,
        params: &[CommandParam],
        timeout: Option<Duration>,
    ) -> Result<String, BridgeError> {
        let inner = &self.inner;
        let command = symbols::resolve_command(command)?;
        let params = symbols::resolve_params(params).inspect_err(|e| {
            if let BridgeError::InvalidParameter(name) = e {
                inner.log(logs::INVALID_PARAMETER, log_vars([("parameter", name.clone())]));
            }
        })?;
        let transport = inner.transport()?;

        let deadline = Instant::now() + timeout.unwrap_or(inner.config.command_timeout);
        let (ticket, ack) = inner.pending.register(command);
        if let Err(e) = transport.send(&OutboundFrame::CommandLong { command, params }) {
            inner.pending.withdraw(&ticket);
            return Err(e);
        }
        debug!(command, "COMMAND_LONG sent");

        match tokio::time::timeout_at(deadline, ack).await {
            Ok(Ok(status)) => Ok(status),
            // Superseded by a later dispatch of the same id.
            Ok(Err(_)) => {
                tokio::time::sleep_until(deadline).await;
                Err(BridgeError::CommandTimeout { command })
            }
            Err(_) => {
                inner.pending.withdraw(&ticket);
                Err(BridgeError::CommandTimeout { command })
            }
        }
    }

    /// Download the full parameter list into the permanent store.
    ///
    /// Returns the store size once every enumerated index has arrived or
    /// the download has been idle for `param_idle`.
    pub async fn fetch_parameters(&self) -> Result<usize, BridgeError> {
        let inner = &self.inner;
        let transport = inner.transport()?;

        inner.log(logs::PARAM_FETCH_START, LogVariables::new());
        inner.lock_params().session = Some(ParameterFetchSession::new());
        if let Err(e) = transport.send(&OutboundFrame::ParamRequestList) {
            inner.lock_params().session = None;
            return Err(e);
        }

        loop {
            tokio::time::sleep(inner.config.param_poll).await;
            let finished = match inner.lock_params().session.as_ref() {
                Some(session) => {
                    session.is_complete() || session.idle_for() >= inner.config.param_idle
                }
                None => true,
            };
            if finished {
                break;
            }
        }

        let (count, snapshot) = {
            let mut params = inner.lock_params();
            if let Some(session) = params.session.take() {
                params.store.merge(session);
            }
            (params.store.len(), params.store.snapshot())
        };
        inner.params_loaded.store(true, Ordering::SeqCst);
        info!(count, "Parameter download finished");
        inner.log(logs::PARAM_FETCH_DONE, log_vars([("number", count.to_string())]));
        inner.sink.deliver(OutboundMessage::Params(snapshot));
        Ok(count)
    }

    /// Set the rate of one data stream now and for every later refresh.
    pub fn request_stream_rate(&self, stream: DataStream, rate_hz: u16) -> Result<(), BridgeError> {
        self.inner
            .stream_rates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stream, rate_hz);
        self.inner
            .transport()?
            .send(&OutboundFrame::RequestDataStream { stream, rate_hz })
    }

    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<AutopilotFrame>, BridgeError> {
        let inner = &self.inner;
        let device = inner.device.describe();

        let mut delay = inner.config.poll_start;
        while !inner.device.is_present() {
            tokio::time::sleep(delay).await;
            inner.log(
                logs::DEVICE_WAIT,
                log_vars([
                    ("device", device.clone()),
                    ("duration", format!("{:.2}", delay.as_secs_f64())),
                ]),
            );
            delay = delay.mul_f64(inner.config.poll_factor).min(inner.config.poll_cap);
        }

        let opener = Arc::clone(inner);
        let AutopilotSession {
            transport,
            mut frames,
        } = tokio::task::spawn_blocking(move || opener.device.open())
            .await
            .map_err(|e| BridgeError::Device(e.to_string()))??;
        inner.log(logs::LINK_OPENED, log_vars([("device", device.clone())]));

        let (system_id, component_id) = loop {
            match frames.recv().await {
                Some(AutopilotFrame::Heartbeat {
                    system_id,
                    component_id,
                }) => break (system_id, component_id),
                Some(_) => continue,
                None => return Err(BridgeError::LinkClosed),
            }
        };
        inner.liveness.beacon();
        inner.connected.store(true, Ordering::SeqCst);
        info!(device = %device, system_id, component_id, "Autopilot beacon received");
        inner.log(
            logs::FIRST_BEACON,
            log_vars([
                ("SysID", system_id.to_string()),
                ("CompID", component_id.to_string()),
            ]),
        );

        if let Err(e) = transport.send(&OutboundFrame::Heartbeat) {
            inner.report_error("sending identifying heartbeat", &e, "");
        }
        if inner.transport.set(transport).is_err() {
            return Err(BridgeError::Device("link session already established".into()));
        }
        Ok(frames)
    }

    /// Close the transport and emit the final diagnostic. Never fails.
    fn shutdown(&self) {
        let inner = &self.inner;
        inner.connected.store(false, Ordering::SeqCst);
        let params = inner.lock_params().store.len();
        inner.log(
            logs::LINK_SHUTDOWN,
            log_vars([
                ("categories", inner.state.category_count().to_string()),
                ("params", params.to_string()),
            ]),
        );
        if let Some(transport) = inner.transport.get() {
            match transport.close() {
                Ok(()) => inner.log(
                    logs::TRANSPORT_CLOSED,
                    log_vars([("device", inner.device.describe())]),
                ),
                Err(e) => inner.report_error("closing autopilot transport", &e, ""),
            }
        }
        info!("Flight-controller link stopped");
    }
}

#[async_trait]
impl CommandDispatcher for FlightControllerLink {
    async fn send_command(&self, request: CommandRequest) -> Result<String, BridgeError> {
        let timeout = request
            .timeout
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64);
        self.dispatch(&request.command, &request.params, timeout)
            .await
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Frame handling
// ────────────────────────────────────────────────────────────────────────────

impl Inner {
    fn transport(&self) -> Result<Arc<dyn AutopilotTransport>, BridgeError> {
        self.transport.get().cloned().ok_or(BridgeError::LinkClosed)
    }

    fn send(&self, frame: &OutboundFrame) -> Result<(), BridgeError> {
        self.transport()?.send(frame)
    }

    fn lock_params(&self) -> MutexGuard<'_, ParamState> {
        self.params.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stream_rate(&self, stream: DataStream) -> u16 {
        self.stream_rates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&stream)
            .copied()
            .unwrap_or(self.config.stream_rate_hz)
    }

    fn log(&self, log_id: &str, variables: LogVariables) {
        self.sink.log(log_id, variables);
    }

    /// Traced by the sink alongside delivery.
    fn report_error(&self, location: &str, error: &BridgeError, message: &str) {
        self.log(logs::LINK_ERROR, logs::error_vars(location, error, message));
    }

    fn process_frame(&self, frame: AutopilotFrame) {
        match frame {
            AutopilotFrame::Heartbeat { .. } => self.liveness.beacon(),
            AutopilotFrame::CommandAck { command, result } => self.on_command_ack(command, result),
            AutopilotFrame::ParamValue {
                name,
                index,
                count,
                value,
            } => {
                let mut params = self.lock_params();
                match params.session.as_mut() {
                    Some(session) => session.record(&name, index, count, value),
                    None => params.store.set(&name, value),
                }
            }
            AutopilotFrame::StatusText { severity, text } => {
                self.log(&logs::status_text(severity), log_vars([("text", text)]));
            }
            AutopilotFrame::TimeSync { ts1, .. } => self.on_timesync(ts1),
            AutopilotFrame::Telemetry(frame) if is_telemetry_category(&frame.category) => {
                self.ingest(frame);
            }
            AutopilotFrame::Telemetry(frame) => {
                let body = serde_json::to_string(&frame).unwrap_or_default();
                self.log(
                    logs::UNHANDLED_FRAME,
                    log_vars([
                        ("type", frame.category),
                        ("message", logs::truncate(&body, logs::MAX_CONTEXT_LEN)),
                    ]),
                );
            }
        }
    }

    fn on_command_ack(&self, command: u16, result: u8) {
        let status = symbols::result_name(result);
        let name = symbols::command_name(command)
            .map_or_else(|| command.to_string(), str::to_string);
        self.log(
            logs::COMMAND_ACK,
            log_vars([("command", name.clone()), ("result", status.clone())]),
        );
        if !self.pending.resolve(command, status.clone()) {
            self.log(
                logs::UNEXPECTED_ACK,
                log_vars([("command", name), ("result", status)]),
            );
        }
    }

    /// Estimate the autopilot boot time and report drift; observational.
    fn on_timesync(&self, ts1: i64) {
        let now = Utc::now().timestamp_micros() as f64 / 1e6;
        let boot = now - ts1 as f64 / 1e9;
        let mut estimate = self
            .boot_estimate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *estimate {
            self.log(
                logs::CLOCK_DRIFT,
                log_vars([("time", format!("{:.6}", boot - previous))]),
            );
        }
        *estimate = Some(boot);
    }

    fn ingest(&self, frame: TelemetryFrame) {
        let changes = self
            .state
            .apply(&frame.category, frame.fields.clone(), NOISE_FIELDS);
        if changes.is_empty() {
            return;
        }
        let time = Utc::now();
        self.changelog
            .extend(changes.into_iter().map(|change| ChangeEvent {
                time,
                category: frame.category.clone(),
                field: change.field,
                old: change.old,
                new: change.new,
            }));
        self.sink.deliver(OutboundMessage::Telemetry(frame));
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Background tasks
// ────────────────────────────────────────────────────────────────────────────

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn reader_loop(inner: Arc<Inner>, mut frames: mpsc::UnboundedReceiver<AutopilotFrame>) {
    while let Some(frame) = frames.recv().await {
        inner.process_frame(frame);
    }
    inner.report_error(
        "reading autopilot frames",
        &BridgeError::LinkClosed,
        &inner.device.describe(),
    );
}

async fn liveness_loop(inner: Arc<Inner>) {
    loop {
        if let Err(e) = inner.send(&OutboundFrame::Heartbeat) {
            debug!(error = %e, "Heartbeat not sent");
        }

        if let BeaconWait::Missing { gap } =
            inner.liveness.wait_for_beacon(inner.config.beacon_timeout).await
        {
            inner.log(
                logs::BEACON_MISSING,
                log_vars([("missed_by_s", format!("{:.1}", gap.as_secs_f64()))]),
            );
            if !inner.device.is_present() {
                inner.log(
                    logs::DEVICE_LOST,
                    log_vars([("device", inner.device.describe())]),
                );
                inner.liveness.terminate();
                inner.stop.send_replace(true);
                return;
            }
        }

        for (command, age) in inner.pending.sweep_stale(inner.config.stale_command_age) {
            inner.log(
                logs::COMMAND_STALE,
                log_vars([
                    ("command", command.to_string()),
                    ("duration", format!("{:.1}", age.as_secs_f64())),
                ]),
            );
        }
    }
}

async fn stream_rate_loop(inner: Arc<Inner>) {
    tokio::time::sleep(inner.config.stream_request_delay).await;
    let mut ticker = tokio::time::interval(inner.config.stream_request_interval);
    loop {
        ticker.tick().await;
        for stream in DataStream::ALL {
            let rate_hz = inner.stream_rate(stream);
            if let Err(e) = inner.send(&OutboundFrame::RequestDataStream { stream, rate_hz }) {
                debug!(stream = stream.name(), error = %e, "Stream request not sent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::scripted::{ScriptedDevice, ScriptedHandle};
    use skybridge_types::{ChangeLogReader, FieldValue, change_log};
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct RecordingSink {
        logs: Mutex<Vec<(String, LogVariables)>>,
        delivered: Mutex<Vec<OutboundMessage>>,
    }

    impl RelaySink for RecordingSink {
        fn log(&self, log_id: &str, variables: LogVariables) {
            self.logs
                .lock()
                .unwrap()
                .push((log_id.to_string(), variables));
        }

        fn deliver(&self, message: OutboundMessage) {
            self.delivered.lock().unwrap().push(message);
        }
    }

    impl RecordingSink {
        fn logged(&self, log_id: &str) -> Vec<LogVariables> {
            self.logs
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == log_id)
                .map(|(_, vars)| vars.clone())
                .collect()
        }

        fn has_log(&self, log_id: &str) -> bool {
            !self.logged(log_id).is_empty()
        }

        fn delivered(&self) -> Vec<OutboundMessage> {
            self.delivered.lock().unwrap().clone()
        }
    }

    struct Fixture {
        link: FlightControllerLink,
        device: ScriptedHandle,
        sink: Arc<RecordingSink>,
        changes: ChangeLogReader,
        runner: JoinHandle<()>,
    }

    fn build(present: bool) -> Fixture {
        let (device, handle) = ScriptedDevice::new(present);
        let sink = Arc::new(RecordingSink::default());
        let (writer, changes) = change_log();
        let link = FlightControllerLink::new(
            device,
            sink.clone(),
            StateTable::new(),
            writer,
            LinkConfig::default(),
        );
        let runner = tokio::spawn({
            let link = link.clone();
            async move { link.run().await }
        });
        Fixture {
            link,
            device: handle,
            sink,
            changes,
            runner,
        }
    }

    async fn connected() -> Fixture {
        let fx = build(true);
        fx.device.heartbeat();
        wait_until(|| fx.link.status().connected).await;
        fx
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn spawn_dispatch(
        link: &FlightControllerLink,
        command: u16,
        timeout: Option<Duration>,
    ) -> JoinHandle<Result<String, BridgeError>> {
        let link = link.clone();
        tokio::spawn(async move {
            link.dispatch(&CommandId::Numeric(command), &[], timeout)
                .await
        })
    }

    fn vfr_hud(alt: f64, time_boot_ms: i64) -> AutopilotFrame {
        AutopilotFrame::Telemetry(TelemetryFrame {
            category: "VFR_HUD".into(),
            fields: BTreeMap::from([
                ("alt".to_string(), FieldValue::Float(alt)),
                ("time_boot_ms".to_string(), FieldValue::Int(time_boot_ms)),
            ]),
        })
    }

    // ── connection ──────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn waits_for_device_with_growing_backoff() {
        let fx = build(false);
        wait_until(|| fx.sink.logged(logs::DEVICE_WAIT).len() >= 3).await;

        let durations: Vec<String> = fx
            .sink
            .logged(logs::DEVICE_WAIT)
            .into_iter()
            .map(|vars| vars["duration"].clone())
            .collect();
        assert_eq!(&durations[..3], ["1.00", "1.10", "1.21"]);

        fx.device.set_present(true);
        fx.device.heartbeat();
        wait_until(|| fx.link.status().connected).await;
        assert!(fx.sink.has_log(logs::FIRST_BEACON));
    }

    #[test]
    fn backoff_is_capped() {
        let config = LinkConfig::default();
        let mut delay = config.poll_start;
        for _ in 0..50 {
            delay = delay.mul_f64(config.poll_factor).min(config.poll_cap);
        }
        assert_eq!(delay, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn sends_identifying_heartbeat_after_first_beacon() {
        let fx = connected().await;
        assert_eq!(fx.device.sent().first(), Some(&OutboundFrame::Heartbeat));
        let vars = &fx.sink.logged(logs::FIRST_BEACON)[0];
        assert_eq!(vars["SysID"], "1");
        assert_eq!(fx.link.status().health, LinkHealth::BeaconOk);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_before_connect_reports_closed_link() {
        let fx = build(false);
        let result = fx
            .link
            .dispatch(&CommandId::Numeric(400), &[], None)
            .await;
        assert_eq!(result, Err(BridgeError::LinkClosed));
    }

    // ── commands ────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn acknowledged_command_returns_result_name() {
        let fx = connected().await;
        let call = spawn_dispatch(&fx.link, 400, None);
        wait_until(|| {
            fx.device
                .sent()
                .iter()
                .any(|f| matches!(f, OutboundFrame::CommandLong { command: 400, .. }))
        })
        .await;

        fx.device.inject(AutopilotFrame::CommandAck {
            command: 400,
            result: 0,
        });
        assert_eq!(call.await.unwrap(), Ok("MAV_RESULT_ACCEPTED".to_string()));
        let ack = &fx.sink.logged(logs::COMMAND_ACK)[0];
        assert_eq!(ack["command"], "MAV_CMD_COMPONENT_ARM_DISARM");
    }

    #[tokio::test(start_paused = true)]
    async fn later_dispatch_supersedes_earlier_one() {
        let fx = connected().await;
        let t0 = Instant::now();

        let first = spawn_dispatch(&fx.link, 400, None);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = spawn_dispatch(&fx.link, 400, None);
        tokio::time::sleep(Duration::from_secs(1)).await;

        fx.device.inject(AutopilotFrame::CommandAck {
            command: 400,
            result: 0,
        });
        assert_eq!(second.await.unwrap(), Ok("MAV_RESULT_ACCEPTED".to_string()));
        assert!(!first.is_finished());

        assert_eq!(
            first.await.unwrap(),
            Err(BridgeError::CommandTimeout { command: 400 })
        );
        let elapsed = t0.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3100), "{elapsed:?}");
        assert!(!fx.sink.has_log(logs::UNEXPECTED_ACK));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_command_times_out_and_is_reported_stale() {
        let fx = connected().await;
        let call = spawn_dispatch(&fx.link, 22, Some(Duration::from_secs(10)));

        wait_until(|| fx.sink.has_log(logs::COMMAND_STALE)).await;
        assert!(!call.is_finished());
        assert_eq!(fx.sink.logged(logs::COMMAND_STALE)[0]["command"], "22");

        assert_eq!(
            call.await.unwrap(),
            Err(BridgeError::CommandTimeout { command: 22 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ack_without_waiter_is_unexpected() {
        let fx = connected().await;
        fx.device.inject(AutopilotFrame::CommandAck {
            command: 176,
            result: 4,
        });
        wait_until(|| fx.sink.has_log(logs::UNEXPECTED_ACK)).await;
        let vars = &fx.sink.logged(logs::UNEXPECTED_ACK)[0];
        assert_eq!(vars["result"], "MAV_RESULT_FAILED");
    }

    #[tokio::test(start_paused = true)]
    async fn symbolic_params_are_resolved_and_padded() {
        let fx = connected().await;
        let link = fx.link.clone();
        let call = tokio::spawn(async move {
            link.dispatch(
                &CommandId::Symbolic("MAV_CMD_NAV_TAKEOFF".into()),
                &[
                    CommandParam::Number(0.0),
                    CommandParam::Symbol("MAV_FRAME_GLOBAL_RELATIVE_ALT".into()),
                ],
                Some(Duration::from_millis(100)),
            )
            .await
        });
        assert!(call.await.unwrap().is_err());

        let sent = fx.device.sent();
        let params = sent.iter().find_map(|f| match f {
            OutboundFrame::CommandLong {
                command: 22,
                params,
            } => Some(*params),
            _ => None,
        });
        assert_eq!(params, Some([0.0, 3.0, 0.0, 0.0, 0.0, 0.0, 0.0]));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_symbolic_param_is_logged_and_rejected() {
        let fx = connected().await;
        let result = fx
            .link
            .dispatch(
                &CommandId::Numeric(400),
                &[CommandParam::Symbol("NOT_A_CONSTANT".into())],
                None,
            )
            .await;
        assert_eq!(
            result,
            Err(BridgeError::InvalidParameter("NOT_A_CONSTANT".into()))
        );
        assert_eq!(
            fx.sink.logged(logs::INVALID_PARAMETER)[0]["parameter"],
            "NOT_A_CONSTANT"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn command_dispatcher_honours_request_timeout() {
        let fx = connected().await;
        let start = Instant::now();
        let mut request = CommandRequest::new(CommandId::Numeric(400), vec![]);
        request.timeout = Some(0.5);
        let result = CommandDispatcher::send_command(&fx.link, request).await;
        assert_eq!(result, Err(BridgeError::CommandTimeout { command: 400 }));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    // ── parameters ──────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn initial_fetch_completes_when_all_indexes_arrive() {
        let fx = connected().await;
        wait_until(|| fx.device.sent().contains(&OutboundFrame::ParamRequestList)).await;
        let start = Instant::now();

        for (index, name) in ["A", "B", "C"].into_iter().enumerate() {
            fx.device.inject(AutopilotFrame::ParamValue {
                name: name.into(),
                index: index as u16,
                count: 3,
                value: index as f32,
            });
        }
        fx.device.inject(AutopilotFrame::ParamValue {
            name: "STAT_RUNTIME".into(),
            index: crate::frame::DYNAMIC_PARAM_INDEX,
            count: 0,
            value: 99.0,
        });

        wait_until(|| fx.link.status().params_loaded).await;
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(fx.link.parameters().len(), 4);
        assert_eq!(fx.sink.logged(logs::PARAM_FETCH_DONE)[0]["number"], "4");
        assert!(
            fx.sink
                .delivered()
                .iter()
                .any(|m| matches!(m, OutboundMessage::Params(p) if p.len() == 4))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_fetch_stops_after_quiet_period() {
        let fx = connected().await;
        wait_until(|| fx.device.sent().contains(&OutboundFrame::ParamRequestList)).await;
        fx.device.inject(AutopilotFrame::ParamValue {
            name: "A".into(),
            index: 0,
            count: 500,
            value: 1.0,
        });
        let start = Instant::now();
        wait_until(|| fx.link.status().params_loaded).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(fx.link.parameters().get("A"), Some(&1.0));
    }

    // ── telemetry ───────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn telemetry_change_updates_state_and_changelog() {
        let fx = connected().await;
        let state = fx.link.state();

        fx.device.inject(vfr_hud(10.0, 1));
        wait_until(|| state.get("VFR_HUD", "alt").is_some()).await;

        let events = fx.changes.drain(100);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].field, "alt");
        assert_eq!(events[0].old, None);
        assert!(
            fx.sink
                .delivered()
                .iter()
                .any(|m| matches!(m, OutboundMessage::Telemetry(f) if f.category == "VFR_HUD"))
        );

        // Only the noise field moved: no event, no relay.
        fx.device.inject(vfr_hud(10.0, 2));
        fx.device.inject(vfr_hud(12.5, 3));
        wait_until(|| state.get("VFR_HUD", "alt") == Some(FieldValue::Float(12.5))).await;

        let events = fx.changes.drain(100);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old, Some(FieldValue::Float(10.0)));
        assert_eq!(state.get("VFR_HUD", "time_boot_ms"), None);
        let relays = fx
            .sink
            .delivered()
            .iter()
            .filter(|m| matches!(m, OutboundMessage::Telemetry(_)))
            .count();
        assert_eq!(relays, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unhandled_frames_are_reported() {
        let fx = connected().await;
        fx.device.inject(AutopilotFrame::Telemetry(TelemetryFrame {
            category: "CAMERA_FEEDBACK".into(),
            fields: BTreeMap::new(),
        }));
        wait_until(|| fx.sink.has_log(logs::UNHANDLED_FRAME)).await;
        assert_eq!(
            fx.sink.logged(logs::UNHANDLED_FRAME)[0]["type"],
            "CAMERA_FEEDBACK"
        );
        assert_eq!(fx.link.state().category("CAMERA_FEEDBACK"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn status_text_is_logged_by_severity() {
        let fx = connected().await;
        fx.device.inject(AutopilotFrame::StatusText {
            severity: 4,
            text: "PreArm: GPS not healthy".into(),
        });
        wait_until(|| fx.sink.has_log("PH4000")).await;
        assert_eq!(fx.sink.logged("PH4000")[0]["text"], "PreArm: GPS not healthy");
    }

    #[tokio::test(start_paused = true)]
    async fn timesync_reports_drift_from_second_estimate() {
        let fx = connected().await;
        fx.device.inject(AutopilotFrame::TimeSync {
            tc1: 0,
            ts1: 1_000_000_000,
        });
        fx.device.inject(AutopilotFrame::TimeSync {
            tc1: 0,
            ts1: 2_000_000_000,
        });
        wait_until(|| fx.sink.has_log(logs::CLOCK_DRIFT)).await;
        assert_eq!(fx.sink.logged(logs::CLOCK_DRIFT).len(), 1);
    }

    // ── liveness, streams, shutdown ─────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn missing_beacon_is_reported_but_not_fatal() {
        let fx = connected().await;
        wait_until(|| fx.sink.has_log(logs::BEACON_MISSING)).await;
        assert!(fx.link.status().connected);
        assert_eq!(fx.link.status().health, LinkHealth::BeaconMissing);

        fx.device.heartbeat();
        wait_until(|| fx.link.status().health == LinkHealth::BeaconOk).await;
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_fails_dispatch_but_not_supervision() {
        let fx = connected().await;
        fx.device.fail_sends(true);
        let result = fx
            .link
            .dispatch(&CommandId::Numeric(400), &[], None)
            .await;
        assert_eq!(result, Err(BridgeError::Transport("unplugged".into())));

        // Heartbeats fail too; supervision carries on regardless.
        wait_until(|| fx.sink.has_log(logs::BEACON_MISSING)).await;
        assert!(fx.link.status().connected);
        assert!(!fx.runner.is_finished());

        fx.device.fail_sends(false);
        let call = spawn_dispatch(&fx.link, 400, None);
        wait_until(|| {
            fx.device
                .sent()
                .iter()
                .any(|f| matches!(f, OutboundFrame::CommandLong { command: 400, .. }))
        })
        .await;
        fx.device.inject(AutopilotFrame::CommandAck {
            command: 400,
            result: 0,
        });
        assert_eq!(call.await.unwrap(), Ok("MAV_RESULT_ACCEPTED".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn device_loss_terminates_the_link() {
        let fx = connected().await;
        fx.device.set_present(false);
        fx.runner.await.unwrap();

        assert!(fx.sink.has_log(logs::DEVICE_LOST));
        assert!(fx.sink.has_log(logs::LINK_SHUTDOWN));
        assert!(fx.device.is_closed());
        assert_eq!(fx.link.status().health, LinkHealth::Terminated);
        assert!(!fx.link.status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_rates_are_requested_periodically() {
        let fx = connected().await;
        fx.link
            .request_stream_rate(DataStream::Extra1, 4)
            .unwrap();

        let requests = |fx: &Fixture| {
            fx.device
                .sent()
                .into_iter()
                .filter(|f| matches!(f, OutboundFrame::RequestDataStream { .. }))
                .count()
        };
        wait_until(|| requests(&fx) >= 1 + 2 * DataStream::ALL.len()).await;
        assert!(fx.device.sent().contains(&OutboundFrame::RequestDataStream {
            stream: DataStream::Position,
            rate_hz: 1,
        }));
        let extra1 = fx
            .device
            .sent()
            .into_iter()
            .filter(|f| {
                matches!(
                    f,
                    OutboundFrame::RequestDataStream {
                        stream: DataStream::Extra1,
                        rate_hz: 4
                    }
                )
            })
            .count();
        assert_eq!(extra1, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_closes_transport_and_reports_counts() {
        let fx = connected().await;
        fx.device.inject(vfr_hud(1.0, 1));
        wait_until(|| fx.link.state().category_count() == 1).await;

        fx.link.stop();
        fx.runner.await.unwrap();

        let vars = &fx.sink.logged(logs::LINK_SHUTDOWN)[0];
        assert_eq!(vars["categories"], "1");
        assert!(fx.sink.has_log(logs::TRANSPORT_CLOSED));
        assert!(fx.device.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_waiting_for_device_still_shuts_down() {
        let fx = build(false);
        wait_until(|| fx.device.probes() > 1).await;
        fx.link.stop();
        fx.runner.await.unwrap();
        assert!(fx.sink.has_log(logs::LINK_SHUTDOWN));
        assert!(!fx.sink.has_log(logs::TRANSPORT_CLOSED));
    }

    /// Counts WARN events seen by the current-thread subscriber.
    struct WarnCounter(Arc<std::sync::atomic::AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarnCounter {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn link_errors_go_to_the_sink_untraced() {
        use tracing_subscriber::layer::SubscriberExt;

        let warnings = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(WarnCounter(warnings.clone()));

        let (device, _handle) = ScriptedDevice::new(true);
        // A second open fails, so the link hits a connect error.
        drop(device.open().unwrap());
        let sink = Arc::new(RecordingSink::default());
        let (writer, _changes) = change_log();
        let link = FlightControllerLink::new(
            device,
            sink.clone(),
            StateTable::new(),
            writer,
            LinkConfig::default(),
        );

        tracing::subscriber::with_default(subscriber, || {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
                .block_on(link.run());
        });

        let vars = &sink.logged(logs::LINK_ERROR)[0];
        assert_eq!(vars["location"], "connecting to autopilot");
        assert!(sink.has_log(logs::LINK_SHUTDOWN));
        assert_eq!(warnings.load(Ordering::SeqCst), 0);
    }
}
