// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! gridctl: command-line client for gridctl-daemon.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use grid_fan_control::config;
use grid_fan_control::curve::FanCurveConfig;
use grid_fan_control::grid::FanId;
use grid_fan_control::polling::{ControlMode, PollingSnapshot, TempSource};
use grid_fan_control::protocol::{self, Request, Response, StatusInfo};
use grid_fan_control::sensors::Aggregation;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gridctl", about = "Control a Grid+ V2 fan controller through gridctl-daemon")]
struct Cli {
    /// Path to the daemon socket.
    #[arg(short, long, default_value = config::DEFAULT_SOCKET_PATH)]
    socket: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show connection state, settings and the latest readings.
    Status,
    /// List serial ports.
    Ports,
    /// Connect to the Grid on a serial port.
    Connect { port: String },
    /// Stop polling and close the serial port.
    Disconnect,
    /// Switch between manual and automatic control.
    Mode { mode: ModeArg },
    /// Set a fan's manual speed (0-100%).
    Set { fan: u8, percent: u8 },
    /// Drive a fan at the nearest supported voltage.
    Voltage { fan: u8, volts: f64 },
    /// Set a fan's curve and temperature source.
    Curve {
        fan: u8,
        #[arg(long, value_enum, default_value = "cpu")]
        source: SourceArg,
        #[arg(long, default_value_t = 35)]
        min_speed: u8,
        #[arg(long, default_value_t = 40.0)]
        start_temp: f64,
        #[arg(long, default_value_t = 60)]
        mid_speed: u8,
        #[arg(long, default_value_t = 60.0)]
        mid_temp: f64,
        #[arg(long, default_value_t = 100)]
        max_speed: u8,
        #[arg(long, default_value_t = 75.0)]
        max_temp: f64,
    },
    /// Select the sensors aggregated into the CPU and GPU temperatures.
    Sensors {
        #[arg(long, value_delimiter = ',')]
        cpu: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        gpu: Vec<String>,
    },
    /// Choose how sensor groups are combined.
    Aggregate {
        #[arg(long, value_enum, default_value = "max")]
        cpu: AggregateArg,
        #[arg(long, value_enum, default_value = "max")]
        gpu: AggregateArg,
    },
    /// Set the polling interval in milliseconds.
    Interval { ms: u64 },
    /// Drive curves from fixed temperatures. Without arguments, stop.
    Simulate {
        #[arg(requires = "gpu")]
        cpu: Option<f64>,
        gpu: Option<f64>,
    },
    /// Save the daemon's configuration to disk.
    Save,
    /// Reload the daemon's configuration from disk.
    Reload,
    /// Print every snapshot as it arrives.
    Watch,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Manual,
    Auto,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SourceArg {
    Cpu,
    Gpu,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AggregateArg {
    Max,
    Average,
}

impl From<AggregateArg> for Aggregation {
    fn from(arg: AggregateArg) -> Self {
        match arg {
            AggregateArg::Max => Aggregation::Max,
            AggregateArg::Average => Aggregation::Average,
        }
    }
}

// ---------------------------------------------------------------------------
// Daemon connection
// ---------------------------------------------------------------------------

struct Connection {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

impl Connection {
    fn connect(path: &str) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        // Connect and interval changes run a full handshake on the daemon side.
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { stream, reader })
    }

    fn send_request(&mut self, req: &Request) -> io::Result<Response> {
        let encoded = protocol::encode(req).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("Encode error: {e}"))
        })?;
        self.stream.write_all(encoded.as_bytes())?;
        self.stream.flush()?;
        self.read_response()
    }

    fn read_response(&mut self) -> io::Result<Response> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Daemon closed the connection",
            ));
        }
        protocol::decode(&line).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("Decode error: {e}"))
        })
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let mut conn = Connection::connect(&cli.socket)
        .with_context(|| format!("Could not connect to daemon at {}", cli.socket))?;
    log::info!("Connected to daemon at {}", cli.socket);

    if let Command::Watch = cli.command {
        return watch(&mut conn);
    }

    let request = build_request(cli.command)?;
    match conn.send_request(&request)? {
        Response::Status(status) => print_status(&status),
        Response::Ports { ports } if ports.is_empty() => println!("No serial ports found"),
        Response::Ports { ports } => ports.iter().for_each(|p| println!("{p}")),
        Response::Snapshot { snapshot } => print_snapshot(&snapshot),
        Response::Ok { message } => println!("{message}"),
        Response::Error { message } => bail!(message),
    }
    Ok(())
}

fn fan_id(fan: u8) -> anyhow::Result<FanId> {
    Ok(FanId::new(fan)?)
}

fn build_request(command: Command) -> anyhow::Result<Request> {
    Ok(match command {
        Command::Status => Request::GetStatus,
        Command::Ports => Request::ListPorts,
        Command::Connect { port } => Request::Connect { port },
        Command::Disconnect => Request::Disconnect,
        Command::Mode { mode } => Request::SetMode {
            mode: match mode {
                ModeArg::Manual => ControlMode::Manual,
                ModeArg::Auto => ControlMode::Automatic,
            },
        },
        Command::Set { fan, percent } => Request::SetManual {
            fan: fan_id(fan)?,
            percent,
        },
        Command::Voltage { fan, volts } => Request::SetVoltage {
            fan: fan_id(fan)?,
            volts,
        },
        Command::Curve {
            fan,
            source,
            min_speed,
            start_temp,
            mid_speed,
            mid_temp,
            max_speed,
            max_temp,
        } => {
            let curve = FanCurveConfig {
                min_speed_pct: min_speed,
                start_increase_temp_c: start_temp,
                intermediate_speed_pct: mid_speed,
                intermediate_temp_c: mid_temp,
                max_speed_pct: max_speed,
                max_temp_c: max_temp,
            };
            if let Err(e) = curve.validate() {
                bail!(e);
            }
            Request::SetCurve {
                fan: fan_id(fan)?,
                curve,
                temp_source: match source {
                    SourceArg::Cpu => TempSource::Cpu,
                    SourceArg::Gpu => TempSource::Gpu,
                },
            }
        }
        Command::Sensors { cpu, gpu } => Request::SetSensors { cpu, gpu },
        Command::Aggregate { cpu, gpu } => Request::SetAggregation {
            cpu: cpu.into(),
            gpu: gpu.into(),
        },
        Command::Interval { ms } => Request::SetPollInterval { interval_ms: ms },
        Command::Simulate { cpu, gpu } => match (cpu, gpu) {
            (Some(cpu_temp_c), Some(gpu_temp_c)) => Request::Simulate {
                cpu_temp_c,
                gpu_temp_c,
            },
            _ => Request::StopSimulation,
        },
        Command::Save => Request::SaveConfig,
        Command::Reload => Request::ReloadConfig,
        Command::Watch => Request::Subscribe,
    })
}

fn watch(conn: &mut Connection) -> anyhow::Result<()> {
    conn.stream.set_read_timeout(None)?;
    if let Response::Error { message } = conn.send_request(&Request::Subscribe)? {
        bail!(message);
    }
    loop {
        match conn.read_response()? {
            Response::Snapshot { snapshot } => {
                print_snapshot(&snapshot);
                println!();
            }
            Response::Error { message } => bail!("Polling stopped: {message}"),
            other => log::debug!("Ignoring {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_status(status: &StatusInfo) {
    let port = status.port.as_deref().unwrap_or("-");
    let state = if status.connected { "connected" } else { "disconnected" };
    println!("Port:      {port} ({state}, polling {:?})", status.engine);
    println!("Mode:      {:?}", status.mode);
    println!("Interval:  {} ms", status.poll_interval_ms);
    println!(
        "Sensors:   cpu [{}] ({:?}), gpu [{}] ({:?})",
        status.cpu_sensors.join(", "),
        status.cpu_aggregate,
        status.gpu_sensors.join(", "),
        status.gpu_aggregate
    );
    if let Some(sim) = status.simulated {
        println!(
            "Simulated: CPU {:.1}C / GPU {:.1}C",
            sim.cpu_temp_c, sim.gpu_temp_c
        );
    }
    if let Some(err) = &status.last_error {
        println!("Stopped:   {} (after {} cycles)", err.message, err.cycles);
    }
    println!();
    println!("FAN  MANUAL  SOURCE  CURVE");
    for (info, manual) in status.fans.iter().zip(&status.manual_speeds) {
        let c = &info.curve;
        println!(
            "{:<4} {:>5}%  {:<6}  {}%@{}C {}%@{}C {}%@{}C",
            info.fan.get(),
            manual,
            format!("{:?}", info.temp_source).to_lowercase(),
            c.min_speed_pct,
            c.start_increase_temp_c,
            c.intermediate_speed_pct,
            c.intermediate_temp_c,
            c.max_speed_pct,
            c.max_temp_c
        );
    }
    if let Some(snapshot) = &status.snapshot {
        println!();
        print_snapshot(snapshot);
    }
}

fn print_snapshot(snapshot: &PollingSnapshot) {
    let source = if snapshot.sensor_source_connected {
        "ok"
    } else {
        "no readings"
    };
    println!(
        "CPU {:.1}C  GPU {:.1}C  (sensors: {source})",
        snapshot.cpu_temp_c, snapshot.gpu_temp_c
    );
    println!("FAN  STATUS    RPM  VOLTAGE  TARGET");
    for reading in &snapshot.fans {
        let rpm = reading
            .rpm
            .map_or_else(|| "-".to_string(), |r| r.to_string());
        let voltage = reading
            .voltage
            .map_or_else(|| "-".to_string(), |v| v.to_string());
        let target = reading
            .target
            .map_or_else(String::new, |t| format!("{}% ({})", t.percent, t.voltage));
        println!(
            "{:<4} {:<8} {:>5}  {:>7}  {target}",
            reading.fan.get(),
            format!("{:?}", reading.status()).to_lowercase(),
            rpm,
            voltage
        );
    }
}
