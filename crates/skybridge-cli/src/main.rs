//! `skybridge` – onboard relay between the autopilot and the ground station.
//!
//! This binary is the composition root. It:
//!
//! 1. Loads `~/.skybridge/config.toml`, writing the defaults on first run.
//! 2. Builds the shared state table and change-log queue.
//! 3. Wires the [`FlightControllerLink`] to the relay's [`RelayHandle`] and
//!    the [`RelayTransportClient`] back to the link as its command
//!    dispatcher.
//! 4. Intercepts **Ctrl-C** to stop both sides. A lost device ends the
//!    link only; the relay keeps serving the ground station until Ctrl-C.

mod config;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;

use skybridge_fc::{FlightControllerLink, LinkConfig, MavlinkDevice};
use skybridge_relay::{RelayConfig, RelayHandle, RelayTransportClient, relay_channel};
use skybridge_types::{StateTable, change_log};
use tokio::sync::watch;
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let _guard = telemetry::init_tracing("skybridge");

    let cfg = load_config();
    info!(
        server_url = %cfg.server_url,
        device = %cfg.device,
        baud = cfg.baud,
        "skybridge v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to start the Tokio runtime");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run(cfg));
    ExitCode::SUCCESS
}

async fn run(cfg: config::Config) {
    let state = StateTable::new();
    let view = state.view();
    let (writer, reader) = change_log();
    let (handle, outbox) = relay_channel();

    let device = MavlinkDevice::new(cfg.device.clone(), cfg.baud)
        .with_source_system(cfg.source_system);
    let link_config = LinkConfig {
        command_timeout: cfg.command_timeout(),
        stream_rate_hz: cfg.stream_rate_hz,
        ..LinkConfig::default()
    };
    let sink: Arc<RelayHandle> = Arc::new(handle.clone());
    let link = FlightControllerLink::new(device, sink, state, writer, link_config);

    let (relay_stop, stop_rx) = watch::channel(false);
    let (interrupt, interrupted) = watch::channel(false);
    let relay = RelayTransportClient::new(
        RelayConfig::new(cfg.server_url.clone()),
        (handle, outbox),
        view,
        reader,
        Arc::new(link.clone()),
        stop_rx,
    );

    {
        let link = link.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            warn!("Ctrl-C received; shutting down");
            interrupt.send_replace(true);
            link.stop();
        }) {
            warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
        }
    }

    serve(link, relay, relay_stop, interrupted).await;
    info!("skybridge stopped");
}

/// Run the link and the relay side by side.
///
/// The relay is stopped only once `interrupted` turns true, and only after
/// the link has finished, so the link's shutdown diagnostics are already
/// queued when the relay makes its final flush.
async fn serve(
    link: FlightControllerLink,
    relay: RelayTransportClient,
    relay_stop: watch::Sender<bool>,
    mut interrupted: watch::Receiver<bool>,
) {
    let relay_task = tokio::spawn(relay.run());
    link.run().await;
    let status = link.status();
    info!(
        connected = status.connected,
        params_loaded = status.params_loaded,
        health = ?status.health,
        "Autopilot link ended"
    );

    if interrupted.wait_for(|i| *i).await.is_err() {
        // No handler left to interrupt us; keep relaying until killed.
        std::future::pending::<()>().await;
    }
    relay_stop.send_replace(true);
    if let Err(e) = relay_task.await {
        error!(error = %e, "Relay client task failed");
    }
}

fn load_config() -> config::Config {
    match config::load() {
        Ok(Some(cfg)) => {
            info!(path = %config::config_path().display(), "Config loaded");
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            match config::save(&cfg) {
                Ok(()) => info!(
                    path = %config::config_path().display(),
                    "No config found; wrote defaults"
                ),
                Err(e) => warn!(error = %e, "No config found and defaults could not be saved"),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            warn!(error = %e, "Config error; using defaults");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}
