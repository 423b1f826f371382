//! [`RelayTransportClient`] – the ground-station uplink.
//!
//! ```text
//!            ┌──────────────── run() ────────────────┐
//!            ▼                                       │
//!       CONNECTING ──ok──▶ CONNECTED ──close/error──▶┘
//!        │    ▲              │ replay queued messages first,
//!        fail │              │ then select! over:
//!        │  5s delay         │   outbound channel · inbound frames
//!        └────┘              │   sampler tick · drain tick · stop
//! ```
//!
//! Everything headed for the ground station enters one unbounded channel
//! through a [`RelayHandle`]. While disconnected the channel simply fills
//! up; a message whose send failed mid-session goes back to the front of
//! the replay queue, so ordering survives reconnects.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use skybridge_types::logs::{self, LogVariables, log_vars};
use skybridge_types::{
    ChangeLogReader, CommandDispatcher, CommandRequest, CommandResponse, InboundError,
    InboundMessage, LogRecord, OutboundMessage, RelaySink, StateView,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use crate::changelog::{DrainPacer, OVERFLOW_THRESHOLD, OverflowGuard};
use crate::sampler::{RateChange, RateSampler};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Uplink tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Ground-station WebSocket URL.
    pub url: String,
    /// Wait after a failed connection attempt.
    pub reconnect_delay: Duration,
    /// Pause between the end of one session and the next attempt.
    pub cycle_pause: Duration,
    pub sampler_tick: Duration,
    pub drain_interval: Duration,
    pub overflow_threshold: usize,
    /// Upper bound on delivering queued messages once stop is requested.
    pub shutdown_flush: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765".to_string(),
            reconnect_delay: Duration::from_secs(5),
            cycle_pause: Duration::from_secs(2),
            sampler_tick: Duration::from_millis(10),
            drain_interval: Duration::from_millis(100),
            overflow_threshold: OVERFLOW_THRESHOLD,
            shutdown_flush: Duration::from_secs(1),
        }
    }
}

impl RelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RelayHandle
// ────────────────────────────────────────────────────────────────────────────

/// Cloneable sender side of the uplink. Never blocks, never fails loudly.
#[derive(Clone)]
pub struct RelayHandle {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
}

/// Receiver side handed to [`RelayTransportClient::new`].
pub struct Outbox {
    rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

/// Create the uplink queue. The handle can be given to producers before
/// the client exists.
pub fn relay_channel() -> (RelayHandle, Outbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RelayHandle { outbound: tx }, Outbox { rx })
}

impl RelayHandle {
    /// Queue `message` for the ground station. Returns `false` only when
    /// the client is gone.
    pub fn send(&self, message: OutboundMessage) -> bool {
        self.outbound.send(message).is_ok()
    }
}

impl RelaySink for RelayHandle {
    fn log(&self, log_id: &str, variables: LogVariables) {
        // Third digit 2 marks an error-level identifier.
        if log_id.as_bytes().get(2) == Some(&b'2') {
            warn!(log_id, ?variables, "Bridge log");
        } else {
            info!(log_id, ?variables, "Bridge log");
        }
        if !self.send(OutboundMessage::Log(LogRecord::new(log_id, variables))) {
            error!(log_id, "Relay gone; log event not shipped");
        }
    }

    fn deliver(&self, message: OutboundMessage) {
        if !self.send(message) {
            debug!("Relay gone; message dropped");
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RelayTransportClient
// ────────────────────────────────────────────────────────────────────────────

enum SessionEnd {
    Stopped,
    Disconnected,
}

/// Owns the WebSocket session with the ground station.
pub struct RelayTransportClient {
    config: RelayConfig,
    state: StateView,
    changelog: ChangeLogReader,
    dispatcher: Arc<dyn CommandDispatcher>,
    handle: RelayHandle,
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    replay: VecDeque<OutboundMessage>,
    sampler: RateSampler,
    pacer: DrainPacer,
    overflow: OverflowGuard,
    tasks: JoinSet<()>,
    stop: watch::Receiver<bool>,
}

impl RelayTransportClient {
    pub fn new(
        config: RelayConfig,
        (handle, outbox): (RelayHandle, Outbox),
        state: StateView,
        changelog: ChangeLogReader,
        dispatcher: Arc<dyn CommandDispatcher>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let overflow = OverflowGuard::new(config.overflow_threshold);
        Self {
            config,
            state,
            changelog,
            dispatcher,
            handle,
            outbound: outbox.rx,
            replay: VecDeque::new(),
            sampler: RateSampler::new(),
            pacer: DrainPacer::new(),
            overflow,
            tasks: JoinSet::new(),
            stop,
        }
    }

    /// A handle feeding this client's queue.
    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// Connect, serve, reconnect; until the stop signal flips.
    pub async fn run(mut self) {
        info!(url = %self.config.url, "Relay client starting");
        while !*self.stop.borrow() {
            let connected = tokio::select! {
                result = connect_async(self.config.url.as_str()) => result,
                _ = stopped(&mut self.stop) => break,
            };
            match connected {
                Ok((ws, _)) => {
                    info!(url = %self.config.url, "Connected to ground station");
                    if let SessionEnd::Stopped = self.session(ws).await {
                        break;
                    }
                    warn!(url = %self.config.url, "Ground-station session ended");
                }
                Err(e) => {
                    self.report("connecting", &e, "");
                    if pause(&mut self.stop, self.config.reconnect_delay).await {
                        break;
                    }
                    continue;
                }
            }
            if pause(&mut self.stop, self.config.cycle_pause).await {
                break;
            }
        }

        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        info!(replay = self.replay.len(), "Relay client stopped");
    }

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut ws_tx, mut ws_rx) = ws.split();

        // Queued traffic goes out before anything inbound is looked at.
        if !self.flush_queued(&mut ws_tx).await {
            return SessionEnd::Disconnected;
        }

        let mut sample_tick = tokio::time::interval(self.config.sampler_tick);
        sample_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut drain_tick = tokio::time::interval(self.config.drain_interval);
        drain_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stopped(&mut self.stop) => {
                    let limit = self.config.shutdown_flush;
                    if tokio::time::timeout(limit, self.flush_queued(&mut ws_tx)).await.is_err() {
                        warn!(replay = self.replay.len(), "Shutdown flush timed out");
                    }
                    let _ = ws_tx.close().await;
                    return SessionEnd::Stopped;
                }
                // ── Downstream: queue → ground station ─────────────────────
                Some(message) = self.outbound.recv() => {
                    if !self.transmit(&mut ws_tx, message).await {
                        return SessionEnd::Disconnected;
                    }
                }
                // ── Upstream: ground station → bridge ──────────────────────
                frame = ws_rx.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_inbound(text.as_str()),
                        Some(Ok(Message::Close(_))) | None => {
                            self.report_closed("recv loop");
                            return SessionEnd::Disconnected;
                        }
                        Some(Err(e)) => {
                            self.report("recv loop", &e, "");
                            return SessionEnd::Disconnected;
                        }
                        _ => {}
                    }
                }
                _ = sample_tick.tick() => {
                    let batch = self.sampler.sample(&self.state, Instant::now());
                    if !batch.is_empty()
                        && !self.transmit(&mut ws_tx, OutboundMessage::RequestedTelemetry(batch)).await
                    {
                        return SessionEnd::Disconnected;
                    }
                }
                _ = drain_tick.tick() => {
                    while self.tasks.try_join_next().is_some() {}
                    if let Some(batch) = self.next_changelog_batch() {
                        if !self.transmit(&mut ws_tx, batch).await {
                            return SessionEnd::Disconnected;
                        }
                    }
                }
            }
        }
    }

    /// Send the replay queue, then whatever is already waiting in the
    /// channel. Returns `false` on the first failed send.
    async fn flush_queued<S>(&mut self, sink: &mut S) -> bool
    where
        S: Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        while let Some(message) = self
            .replay
            .pop_front()
            .or_else(|| self.outbound.try_recv().ok())
        {
            if !self.transmit(sink, message).await {
                return false;
            }
        }
        true
    }

    /// Serialise and send one message. On failure the message is queued
    /// for replay and `false` is returned.
    async fn transmit<S>(&mut self, sink: &mut S, message: OutboundMessage) -> bool
    where
        S: Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                self.report("serializing message", &e, message.kind());
                return true;
            }
        };
        match sink.send(Message::Text(json.into())).await {
            Ok(()) => true,
            Err(e) => {
                self.report("sending message", &e, message.kind());
                self.replay.push_front(message);
                false
            }
        }
    }

    fn next_changelog_batch(&mut self) -> Option<OutboundMessage> {
        let backlog = self.changelog.len();
        if self.overflow.observe(backlog) {
            self.handle
                .log(logs::CHANGELOG_OVERFLOW, log_vars([("length", backlog.to_string())]));
        }
        let size = self.pacer.next_batch(backlog);
        if size == 0 {
            return None;
        }
        Some(OutboundMessage::ChangelogBatch(self.changelog.drain(size)))
    }

    // ── Inbound dispatch ────────────────────────────────────────────────────

    fn handle_inbound(&mut self, text: &str) {
        match InboundMessage::parse(text) {
            Ok(InboundMessage::Ping(body)) => {
                self.handle.send(OutboundMessage::Pong(body));
            }
            Ok(InboundMessage::RateRequest(request)) => {
                let change = self.sampler.upsert(
                    &request.category,
                    &request.field,
                    request.rate,
                    Instant::now(),
                );
                let (category, field) = (request.category, request.field);
                match change {
                    RateChange::Created => self.handle.log(
                        logs::RATE_CREATED,
                        log_vars([
                            ("category", category),
                            ("field", field),
                            ("new", request.rate.to_string()),
                        ]),
                    ),
                    RateChange::Updated { old } => self.handle.log(
                        logs::RATE_UPDATED,
                        log_vars([
                            ("category", category),
                            ("field", field),
                            ("old", old.to_string()),
                            ("new", request.rate.to_string()),
                        ]),
                    ),
                }
            }
            Ok(InboundMessage::TelemetryUpdate) => {
                let snapshot = self.state.snapshot();
                let dump = serde_json::to_string(&snapshot).unwrap_or_default();
                info!(categories = snapshot.len(), state = %dump, "State snapshot requested");
            }
            Ok(InboundMessage::Command(request)) => self.forward_command(request),
            Ok(InboundMessage::Log(record)) => {
                info!(log_id = %record.log_id, variables = ?record.variables, "Ground-station log");
            }
            Err(InboundError::UnknownType { kind, body }) => self.handle.log(
                logs::UNKNOWN_MESSAGE,
                log_vars([
                    ("type", kind),
                    (
                        "message",
                        logs::truncate(&body.to_string(), logs::MAX_CONTEXT_LEN),
                    ),
                ]),
            ),
            Err(e) => self.report("parsing message", &e, text),
        }
    }

    fn forward_command(&mut self, request: CommandRequest) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let handle = self.handle.clone();
        self.tasks.spawn(async move {
            let command = request.command.to_string();
            let response = match dispatcher.send_command(request).await {
                Ok(result) => CommandResponse {
                    command,
                    result: Some(result),
                    error: None,
                },
                Err(e) => CommandResponse {
                    command,
                    result: None,
                    error: Some(e.to_string()),
                },
            };
            handle.send(OutboundMessage::CommandResponse(response));
        });
    }

    // ── Diagnostics ─────────────────────────────────────────────────────────

    /// Reported through the handle, which also traces it locally.
    fn report(&self, location: &str, error: &dyn std::fmt::Display, message: &str) {
        self.handle
            .log(logs::NETWORK_ERROR, logs::error_vars(location, error, message));
    }

    fn report_closed(&self, location: &str) {
        self.report(location, &"ConnectionClosed", "");
    }
}

/// Resolves once the stop flag is set; pends forever if the sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Sleep for `duration` unless stopped first. Returns `true` when stopped.
async fn pause(stop: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = stopped(stop) => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
