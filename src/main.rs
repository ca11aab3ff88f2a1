//! # Train Control Platform Entry Point
//! Runs every enabled train of the configuration against a simulated device, with
//! the host managing all of them at once.
//!
//! ## Modes
//! - **PID:** closed-loop distance control on every train.
//! - **Step:** open-loop step response (warm-up, baseline, step).
//! - **Deadband:** ramp calibration, then the result is applied to the PID.
//! - **Outage:** PID run with a broker outage in the middle; the host and the
//!   devices reconnect and resync on their own.
//!
//! ## Outputs
//! - `<log-dir>/<train>_<mode>_<unix>.csv`: one log per confirmed activation.
//! - `<log-dir>/summary.csv`: per-train counters, appended per run.

use std::{
    collections::BTreeMap,
    io::{Write, stdin, stdout},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use log::{debug, error, info, warn};
use thread_priority::{ThreadBuilderExt, ThreadPriority};

use train_control::{
    Result,
    channel::bus::Broker,
    config::{DEFAULT_CONFIG_FILE, PlatformConfig},
    device::{
        emitter::UdpSink,
        hal::SimulatedTrain,
        node::Device,
        params::{ExperimentMode, ParamKey, ParameterSet},
    },
    host::{
        param_sync::SyncEvent,
        session::{InstanceManager, InstanceSession},
    },
    utils::{log_sink::CsvSinkFactory, metrics_export::export_summary_csv},
};

const CONNECT_WAIT: Duration = Duration::from_secs(5);
const OUTAGE: Duration = Duration::from_secs(3);
const START_DISTANCE_CM: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    Pid,
    Step,
    Deadband,
    Outage,
}

#[derive(Parser, Debug)]
#[command(name = "train_control")]
#[command(about = "Multi-instance train control platform with simulated devices")]
#[command(version)]
struct CliArgs {
    /// Instance configuration (missing file: three default trains)
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Length of each experiment run
    #[arg(long, default_value = "20")]
    duration_secs: u64,

    /// Probability that the broker drops any single message
    #[arg(long, default_value = "0.0")]
    broker_loss: f64,

    /// Directory for experiment logs and the run summary
    #[arg(long, default_value = "data/logs")]
    log_dir: PathBuf,

    /// Address the telemetry receivers bind to
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Run one scenario and exit instead of showing the menu
    #[arg(long, value_enum)]
    run: Option<Scenario>,
}

struct DeviceHandle {
    name: String,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct Platform {
    broker: Broker,
    manager: InstanceManager,
    devices: Vec<DeviceHandle>,
    duration: Duration,
    log_dir: PathBuf,
}

fn main() {
    env_logger::init();
    let args = CliArgs::parse();
    info!("=== TRAIN CONTROL PLATFORM START ===");

    let platform = match Platform::start(&args) {
        Ok(p) => p,
        Err(e) => {
            error!("startup failed: {}", e);
            return;
        }
    };

    if let Some(scenario) = args.run {
        platform.run_scenario(scenario);
    } else {
        loop {
            let choice = prompt_menu();
            match choice.as_str() {
                "1" | "" => platform.run_scenario(Scenario::Pid),
                "2" => platform.run_scenario(Scenario::Step),
                "3" => platform.run_scenario(Scenario::Deadband),
                "4" => platform.run_scenario(Scenario::Outage),
                "5" => platform.print_status(),
                "6" => break,
                other => println!("Unrecognized option '{}', please try again.", other),
            }
        }
    }

    platform.shutdown();
    info!("=== TRAIN CONTROL PLATFORM FINISHED ===");
}

fn prompt_menu() -> String {
    println!("\n┌─────────────────────────────────────────────┐");
    println!("│     SELECT EXPERIMENT                       │");
    println!("├─────────────────────────────────────────────┤");
    println!("│  1) PID control (all trains)                │");
    println!("│  2) Step response (all trains)              │");
    println!("│  3) Deadband calibration + apply            │");
    println!("│  4) PID with broker outage                  │");
    println!("│  5) Status                                  │");
    println!("│  6) Exit                                    │");
    println!("└─────────────────────────────────────────────┘");
    print!("Select [1-6] (default: 1): ");
    let _ = stdout().flush();

    let mut input = String::new();
    let _ = stdin().read_line(&mut input);
    input.trim().to_string()
}

fn spawn_device(session: &InstanceSession, broker: &Broker) -> Result<DeviceHandle> {
    let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), session.telemetry_addr().port());
    let params = ParameterSet::default();
    let tick_s = params.pid.sample_period_ms as f64 / 1000.0;
    let mut device = Device::new(
        session.id(),
        session.namespace().prefix(),
        broker.connector(),
        SimulatedTrain::new(START_DISTANCE_CM, tick_s),
        UdpSink::connect(target)?,
        params,
    );

    let name = session.id().to_string();
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    let thread_name = name.clone();
    let handle = thread::Builder::new()
        .name(format!("device-{name}"))
        .spawn_with_priority(ThreadPriority::Max, move |prio| {
            if let Err(e) = prio {
                debug!("[{}] running without raised priority: {:?}", thread_name, e);
            }
            device.run(flag);
        })?;

    Ok(DeviceHandle { name, running, handle })
}

impl Platform {
    fn start(args: &CliArgs) -> Result<Self> {
        let config = PlatformConfig::load(&args.config)?;
        std::fs::create_dir_all(&args.log_dir)?;

        let broker = Broker::new();
        broker.set_loss(args.broker_loss);
        let sinks = Arc::new(CsvSinkFactory {
            dir: args.log_dir.clone(),
        });
        let manager = InstanceManager::start(&config, broker.connector(), sinks, args.bind)?;

        let mut devices = Vec::new();
        for session in manager.sessions() {
            devices.push(spawn_device(session, &broker)?);
        }
        info!("[Main] {} simulated devices running", devices.len());

        Ok(Self {
            broker,
            manager,
            devices,
            duration: Duration::from_secs(args.duration_secs),
            log_dir: args.log_dir.clone(),
        })
    }

    fn wait_connected(&self) -> bool {
        let mut all = true;
        for session in self.manager.sessions() {
            if !session.sync().wait_until(CONNECT_WAIT, |st| st.channel_connected) {
                warn!("[{}] parameter channel not connected", session.id());
                all = false;
            }
        }
        all
    }

    fn configure(&self, session: &InstanceSession, scenario: Scenario) -> Result<()> {
        let values: &[(ParamKey, f64)] = match scenario {
            Scenario::Pid | Scenario::Outage => &[
                (ParamKey::Kp, 60.0),
                (ParamKey::Ki, 2.0),
                (ParamKey::Kd, 1.0),
                (ParamKey::Reference, 10.0),
                (ParamKey::Deadzone, 5.0),
            ],
            Scenario::Step => &[
                (ParamKey::StepAmplitude, 5.0),
                (ParamKey::StepDuration, 3.0),
                (ParamKey::StepDirection, 1.0),
                (ParamKey::SupplyVoltage, 8.4),
            ],
            Scenario::Deadband => &[(ParamKey::CalibrationDirection, 1.0), (ParamKey::MotionThreshold, 0.5)],
        };
        for (key, value) in values {
            session.set_param(*key, *value)?;
        }
        Ok(())
    }

    fn mode_of(scenario: Scenario) -> ExperimentMode {
        match scenario {
            Scenario::Pid | Scenario::Outage => ExperimentMode::Pid,
            Scenario::Step => ExperimentMode::Step,
            Scenario::Deadband => ExperimentMode::Deadband,
        }
    }

    fn run_scenario(&self, scenario: Scenario) {
        info!("[Experiment] {:?} for {:?}", scenario, self.duration);
        if !self.wait_connected() {
            warn!("[Experiment] continuing with partially connected trains");
        }

        let mode = Self::mode_of(scenario);
        for session in self.manager.sessions() {
            // only calibration events of this run count
            let _ = session.sync().events().try_iter().count();
            let started = self
                .configure(session, scenario)
                .and_then(|()| session.start(mode));
            if let Err(e) = started {
                error!("[{}] could not start {:?}: {}", session.id(), mode, e);
            }
        }

        let begin = Instant::now();
        let mut outage_done = scenario != Scenario::Outage;
        let mut calibrated: BTreeMap<String, bool> = BTreeMap::new();
        while begin.elapsed() < self.duration {
            if !outage_done && begin.elapsed() >= self.duration / 3 {
                info!("[Experiment] broker outage for {:?}", OUTAGE);
                self.broker.set_online(false);
                thread::sleep(OUTAGE);
                self.broker.set_online(true);
                outage_done = true;
                self.wait_connected();
            }
            if scenario == Scenario::Deadband && self.calibrations_finished(&mut calibrated) {
                break;
            }
            thread::sleep(Duration::from_millis(250));
        }

        if scenario == Scenario::Deadband {
            self.calibrations_finished(&mut calibrated);
        }
        for session in self.manager.sessions() {
            if calibrated.get(session.id()) == Some(&true) {
                if let Err(e) = session.apply_deadband() {
                    warn!("[{}] apply failed: {}", session.id(), e);
                }
            }
            if let Err(e) = session.stop(mode) {
                warn!("[{}] stop failed: {}", session.id(), e);
            }
        }
        thread::sleep(Duration::from_millis(500));
        self.print_status();
    }

    /// Collects calibration outcomes per train; true once every train reported one.
    fn calibrations_finished(&self, outcomes: &mut BTreeMap<String, bool>) -> bool {
        for session in self.manager.sessions() {
            for event in session.sync().events().try_iter() {
                match event {
                    SyncEvent::CalibrationResult(_) => {
                        outcomes.insert(session.id().to_string(), true);
                    }
                    SyncEvent::CalibrationError(_) => {
                        outcomes.insert(session.id().to_string(), false);
                    }
                    _ => {}
                }
            }
        }
        outcomes.len() == self.manager.len()
    }

    fn print_status(&self) {
        println!(
            "\n{:<10} {:<16} {:<8} {:<9} {:>8} {:>9} {:>8} {:>8} {:>9}",
            "train", "telemetry", "channel", "mode", "packets", "malformed", "dropped", "written", "deadband"
        );
        for session in self.manager.sessions() {
            let snap = session.snapshot();
            let mode = snap.active_mode.map(|m| m.segment()).unwrap_or("-");
            let deadband = snap
                .detected_deadband
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<10} {:<16} {:<8} {:<9} {:>8} {:>9} {:>8} {:>8} {:>9}",
                snap.instance_id,
                snap.status.label(),
                if snap.channel_connected { "up" } else { "down" },
                mode,
                snap.stats.packets,
                snap.stats.malformed,
                snap.stats.dropped,
                snap.stats.written,
                deadband
            );
        }
        let b = self.broker.stats();
        println!(
            "broker: published={} delivered={} lost={} connections={}",
            b.published, b.delivered, b.lost, b.connections
        );
    }

    fn shutdown(self) {
        info!("[Main] stopping devices...");
        for dev in &self.devices {
            dev.running.store(false, Ordering::Release);
        }
        for dev in self.devices {
            match dev.handle.join() {
                Ok(()) => info!("[Main] {} joined", dev.name),
                Err(_) => error!("[Main] {} device thread panicked", dev.name),
            }
        }

        self.manager.shutdown();
        let summary = self.log_dir.join("summary.csv");
        if let Err(e) = export_summary_csv(&summary, &self.manager.summary_rows()) {
            error!("summary export failed: {}", e);
        }
    }
}
