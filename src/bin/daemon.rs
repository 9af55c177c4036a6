// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! gridctl-daemon: system service that owns the Grid's serial port, runs
//! the polling loop, and accepts commands from CLI clients over a Unix
//! domain socket.

use clap::Parser;
use grid_fan_control::config::{self, Config};
use grid_fan_control::controller::GridController;
use grid_fan_control::error::GridError;
use grid_fan_control::grid::FanId;
use grid_fan_control::polling::{
    FanControl, PollingEvent, PollingFailure, PollingSnapshot, SimulatedTemps, TelemetrySink,
};
use grid_fan_control::protocol::{self, FanSettingsInfo, Request, Response, StatusInfo};
use grid_fan_control::sensors::HwmonSensors;
use grid_fan_control::serial::{self, SerialChannel};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, Notify, broadcast, mpsc};
use tokio::task;
use tokio::time::Duration;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gridctl-daemon", about = "Grid+ V2 fan control daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Override the socket path.
    #[arg(short, long)]
    socket: Option<String>,

    /// Override the serial port to connect to on startup.
    #[arg(short, long)]
    port: Option<String>,
}

// ---------------------------------------------------------------------------
// Shared daemon state
// ---------------------------------------------------------------------------

struct DaemonState {
    config: Config,
    controller: GridController,
    config_path: PathBuf,
}

/// Latest output of the polling loop.
#[derive(Default)]
struct Telemetry {
    snapshot: Option<PollingSnapshot>,
    last_error: Option<PollingFailure>,
}

struct Shared {
    state: Mutex<DaemonState>,
    telemetry: Mutex<Telemetry>,
    events: broadcast::Sender<PollingEvent>,
}

/// Hands polling events from the loop thread to the async side.
struct ForwardSink(mpsc::UnboundedSender<PollingEvent>);

impl TelemetrySink for ForwardSink {
    fn publish(&self, event: PollingEvent) {
        let _ = self.0.send(event);
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_path = config::resolve_config_path(Some(&cli.config));
    let mut cfg = config::load_config(&config_path).unwrap_or_else(|e| {
        log::warn!("Could not load config: {e}, using defaults");
        Config::default()
    });
    if let Some(port) = cli.port.clone() {
        cfg.serial.port = Some(port);
    }

    let socket_path = cli
        .socket
        .clone()
        .unwrap_or_else(|| cfg.daemon.socket_path.clone());

    match serial::list_ports() {
        Ok(ports) => log::info!("Found {} serial port(s): {}", ports.len(), ports.join(", ")),
        Err(e) => log::warn!("Could not enumerate serial ports: {e}"),
    }

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let mut controller = GridController::new(
        Arc::new(SerialChannel::system()),
        Arc::new(HwmonSensors::new(&cfg.sensors.hwmon_root)),
        cfg.polling_settings(),
        cfg.manual_speeds(),
        Arc::new(ForwardSink(event_tx)),
    );

    // Connect on startup if a port is configured
    if let Some(port) = cfg.serial.port.clone() {
        if let Err(e) = task::block_in_place(|| controller.connect(&port)) {
            log::error!("Could not connect to {port}: {e}");
        }
    }

    let (events, _) = broadcast::channel(64);
    let shared = Arc::new(Shared {
        state: Mutex::new(DaemonState {
            config: cfg,
            controller,
            config_path,
        }),
        telemetry: Mutex::new(Telemetry::default()),
        events,
    });

    tokio::spawn(forward_events(event_rx, shared.clone()));

    // Clean up old socket file
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;

    // Make socket accessible to non-root users
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o666);
        std::fs::set_permissions(&socket_path, perms)?;
    }

    log::info!("Listening on {socket_path}");

    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = shutdown.clone();

    // Signal handler
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        log::info!("Received shutdown signal");
        shutdown_signal.notify_waiters();
    });

    // Accept client connections
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        tokio::spawn(handle_client(stream, shared.clone()));
                    }
                    Err(e) => {
                        log::error!("Failed to accept connection: {e}");
                    }
                }
            }
            _ = shutdown.notified() => {
                log::info!("Daemon shutting down");
                break;
            }
        }
    }

    {
        let mut st = shared.state.lock().await;
        task::block_in_place(|| st.controller.disconnect());
    }

    // Cleanup socket
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

// ---------------------------------------------------------------------------
// Telemetry forwarding
// ---------------------------------------------------------------------------

async fn forward_events(mut rx: mpsc::UnboundedReceiver<PollingEvent>, shared: Arc<Shared>) {
    while let Some(event) = rx.recv().await {
        {
            let mut telemetry = shared.telemetry.lock().await;
            match &event {
                PollingEvent::Snapshot(snapshot) => telemetry.snapshot = Some(snapshot.clone()),
                PollingEvent::Error(failure) => {
                    // The loop has already closed the port; drop the stale readings.
                    log::error!("Polling loop stopped: {}", failure.message);
                    telemetry.snapshot = None;
                    telemetry.last_error = Some(failure.clone());
                }
            }
        }
        // No subscribers is fine.
        let _ = shared.events.send(event);
    }
}

// ---------------------------------------------------------------------------
// Client connection handler
// ---------------------------------------------------------------------------

async fn handle_client(stream: UnixStream, shared: Arc<Shared>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let (response, subscribe) = match protocol::decode::<Request>(&line) {
            Ok(Request::Subscribe) => (Response::ok("Subscribed"), true),
            Ok(req) => (process_request(req, &shared).await, false),
            Err(e) => (Response::error(format!("Invalid request: {e}")), false),
        };

        if !send(&mut writer, &response).await {
            break; // Client disconnected
        }

        if subscribe {
            stream_events(&mut writer, shared.events.subscribe()).await;
            break;
        }
    }
}

/// Write one response line. Returns false once the client is gone.
async fn send(writer: &mut OwnedWriteHalf, response: &Response) -> bool {
    let encoded = match protocol::encode(response) {
        Ok(s) => s,
        Err(e) => {
            log::error!("Failed to encode response: {e}");
            return true;
        }
    };
    writer.write_all(encoded.as_bytes()).await.is_ok()
}

async fn stream_events(writer: &mut OwnedWriteHalf, mut rx: broadcast::Receiver<PollingEvent>) {
    loop {
        let response = match rx.recv().await {
            Ok(PollingEvent::Snapshot(snapshot)) => Response::Snapshot { snapshot },
            Ok(PollingEvent::Error(failure)) => Response::error(failure.message),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::debug!("Subscriber lagged, skipped {skipped} event(s)");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if !send(writer, &response).await {
            break;
        }
    }
}

fn outcome(result: Result<(), GridError>, message: String) -> Response {
    match result {
        Ok(()) => Response::ok(message),
        Err(e) => Response::error(e.to_string()),
    }
}

async fn process_request(req: Request, shared: &Shared) -> Response {
    let mut guard = shared.state.lock().await;
    let st = &mut *guard;

    match req {
        Request::GetStatus => {
            let telemetry = shared.telemetry.lock().await;
            Response::Status(status_info(st, &telemetry))
        }

        Request::ListPorts => match serial::list_ports() {
            Ok(ports) => Response::Ports { ports },
            Err(e) => Response::error(format!("Failed to list ports: {e}")),
        },

        Request::Connect { port } => {
            let result = task::block_in_place(|| st.controller.connect(&port));
            {
                let mut telemetry = shared.telemetry.lock().await;
                telemetry.snapshot = None;
                if result.is_ok() {
                    telemetry.last_error = None;
                }
            }
            if result.is_ok() {
                st.config.serial.port = Some(port.clone());
            }
            outcome(result, format!("Connected to {port}"))
        }

        Request::Disconnect => {
            task::block_in_place(|| st.controller.disconnect());
            shared.telemetry.lock().await.snapshot = None;
            Response::ok("Disconnected")
        }

        Request::SetPollInterval { interval_ms } => {
            let interval = Duration::from_millis(interval_ms);
            let result = task::block_in_place(|| st.controller.set_poll_interval(interval));
            if result.is_ok() {
                st.config.daemon.poll_interval_ms = interval_ms;
            }
            outcome(result, format!("Poll interval set to {interval_ms} ms"))
        }

        Request::SetMode { mode } => {
            let result = task::block_in_place(|| st.controller.set_mode(mode));
            st.config.mode = mode;
            outcome(result, format!("Mode set to {mode:?}"))
        }

        Request::SetManual { fan, percent } => {
            let result = task::block_in_place(|| st.controller.set_manual_speed(fan, percent));
            if percent <= 100 {
                st.config.fan_mut(fan).manual_percent = percent;
            }
            outcome(result, format!("Set {fan} to {percent}%"))
        }

        Request::SetVoltage { fan, volts } => {
            match task::block_in_place(|| st.controller.set_fan_voltage(fan, volts)) {
                Ok(step) => Response::ok(format!("Set {fan} to {step}")),
                Err(e) => Response::error(e.to_string()),
            }
        }

        Request::SetCurve {
            fan,
            curve,
            temp_source,
        } => {
            let result = st
                .controller
                .set_fan_control(fan, FanControl { curve, temp_source });
            if result.is_ok() {
                let entry = st.config.fan_mut(fan);
                entry.curve = curve;
                entry.temp_source = temp_source;
            }
            outcome(result, format!("Curve updated for {fan}"))
        }

        Request::SetSensors { cpu, gpu } => {
            st.controller.set_sensor_selection(cpu.clone(), gpu.clone());
            st.config.sensors.cpu = cpu;
            st.config.sensors.gpu = gpu;
            Response::ok("Sensor selection updated")
        }

        Request::SetAggregation { cpu, gpu } => {
            st.controller.set_aggregation(cpu, gpu);
            st.config.sensors.cpu_aggregate = cpu;
            st.config.sensors.gpu_aggregate = gpu;
            Response::ok("Aggregation updated")
        }

        Request::Simulate {
            cpu_temp_c,
            gpu_temp_c,
        } => {
            st.controller.simulate(Some(SimulatedTemps {
                cpu_temp_c,
                gpu_temp_c,
            }));
            Response::ok(format!(
                "Simulating CPU {cpu_temp_c:.1}C / GPU {gpu_temp_c:.1}C"
            ))
        }

        Request::StopSimulation => {
            st.controller.simulate(None);
            Response::ok("Simulation stopped")
        }

        Request::SaveConfig => match config::save_config(&st.config_path, &st.config) {
            Ok(()) => Response::ok(format!("Config saved to {}", st.config_path.display())),
            Err(e) => Response::error(format!("Failed to save config: {e}")),
        },

        Request::ReloadConfig => match config::load_config(&st.config_path) {
            Ok(cfg) => {
                if cfg.sensors.hwmon_root != st.config.sensors.hwmon_root {
                    log::warn!("hwmon_root change takes effect after a restart");
                }
                let result = task::block_in_place(|| {
                    st.controller
                        .apply(cfg.polling_settings(), cfg.manual_speeds())
                });
                st.config = cfg;
                outcome(result, "Config reloaded".to_string())
            }
            Err(e) => Response::error(format!("Failed to reload config: {e}")),
        },

        // Handled per connection in handle_client.
        Request::Subscribe => Response::ok("Subscribed"),
    }
}

fn status_info(st: &DaemonState, telemetry: &Telemetry) -> StatusInfo {
    let settings = st.controller.settings();
    StatusInfo {
        connected: st.controller.is_connected(),
        port: st.controller.port(),
        engine: st.controller.engine_state(),
        mode: settings.mode,
        poll_interval_ms: settings.interval.as_millis() as u64,
        manual_speeds: st.controller.manual_speeds().to_vec(),
        fans: FanId::ALL
            .into_iter()
            .map(|fan| {
                let control = settings.fans[fan.index()];
                FanSettingsInfo {
                    fan,
                    temp_source: control.temp_source,
                    curve: control.curve,
                }
            })
            .collect(),
        cpu_sensors: settings.cpu_sensors,
        gpu_sensors: settings.gpu_sensors,
        cpu_aggregate: settings.cpu_aggregate,
        gpu_aggregate: settings.gpu_aggregate,
        simulated: settings.simulated,
        snapshot: telemetry.snapshot.clone(),
        last_error: telemetry.last_error.clone(),
    }
}
