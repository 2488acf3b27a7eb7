//! Main arm executable entry point.
//!
//! # Architecture
//!
//! The executable:
//!
//!     - Starts a session and the logger
//!     - Loads the parameters, and optionally a DH calibration file
//!     - Connects to the arm through the serial port or the simulated firmware
//!     - Runs the arm service, logging every event it publishes
//!     - Executes the command given on the command line, or reads commands
//!       from an interactive console until `exit`

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use color_eyre::{
    eyre::{eyre, WrapErr},
    Report,
};
use log::{debug, error, info, warn};
use rustyline::{error::ReadlineError, DefaultEditor};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use structopt::StructOpt;

// Internal
use arm_lib::{
    arm_ctrl::{ArmCtrl, ArmService, CmdOutput, Params},
    calib::DhArtifact,
    dev_link::{DeviceLink, SimTransport, Transport},
};
use comms_if::{
    net::{local_bus, ArmEvent, LocalSubscriber, NetError, Subscriber},
    tc::{self, arm_ctrl::ArmCmd},
};
use util::{
    host,
    logger::{logger_init, LevelFilter},
    session::Session,
};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

const PROMPT: &str = "arm $ ";

/// Console history file, relative to the software root
const HISTORY_FILE: &str = "sessions/arm_exec_history.txt";

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

#[derive(Debug, StructOpt)]
#[structopt(name = "arm_exec", about = "Chess arm motion executable")]
struct Opts {
    /// Use the simulated arm firmware instead of the serial port
    #[structopt(long)]
    sim: bool,

    /// Parameter file, relative to the parameters directory
    #[structopt(long, default_value = "arm_exec.toml")]
    params: String,

    /// DH calibration file overriding the geometry in the parameters
    #[structopt(long, parse(from_os_str))]
    calib_file: Option<PathBuf>,

    /// Log debug and trace records
    #[structopt(short, long)]
    verbose: bool,

    /// Command to execute, the console is started if none is given
    #[structopt(subcommand)]
    cmd: Option<ArmCmd>,
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {
    color_eyre::install()?;

    let opts = Opts::from_args();

    // ---- EARLY INITIALISATION ----

    let session = Session::new("arm_exec", "sessions").wrap_err("Failed to create the session")?;

    let min_level = if opts.verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };
    logger_init(min_level, &session).wrap_err("Failed to initialise logging")?;

    info!("Chess Arm Executable\n");
    info!("Session directory: {:?}\n", session.session_root);
    debug!("CLI options: {:?}", opts);

    // ---- LOAD PARAMETERS ----

    let mut params: Params =
        util::params::load(&opts.params).wrap_err("Could not load the arm parameters")?;

    if let Some(ref path) = opts.calib_file {
        DhArtifact::load(path)
            .wrap_err_with(|| format!("Could not load the calibration file {:?}", path))?
            .apply_to(&mut params.kin);
        info!("Using the DH calibration from {:?}", path);
    }

    if opts.sim {
        // The simulated firmware is ready as soon as it is opened
        params.link.open_settle_s = 0.0;
    }

    params.are_valid().wrap_err("Invalid arm parameters")?;

    info!("Exec parameters loaded");

    // ---- INITIALISE ARM ----

    let transport: Box<dyn Transport> = if opts.sim {
        info!("Using the simulated arm firmware");
        let (transport, _handle) = SimTransport::new();
        Box::new(transport)
    } else {
        hardware_transport()?
    };

    let link = DeviceLink::new(params.link.clone(), transport);
    let ctrl = ArmCtrl::new(params, link).wrap_err("Failed to initialise ArmCtrl")?;

    let (publisher, subscriber) = local_bus("arm_exec");
    let event_log_jh = spawn_event_log(subscriber)?;

    let service =
        ArmService::spawn(ctrl, Some(Box::new(publisher))).wrap_err("Failed to start the arm")?;

    let result = match service.initialize() {
        Ok(()) => {
            info!("Arm ready\n");

            match opts.cmd {
                Some(cmd) => {
                    if report(&service, cmd) {
                        Ok(())
                    } else {
                        Err(eyre!("Command failed"))
                    }
                }
                None => console(&service),
            }
        }
        Err(e) => Err(Report::new(e).wrap_err("Could not connect to the arm")),
    };

    // ---- SHUTDOWN ----

    info!("Shutting down the arm");
    service.shutdown();

    if event_log_jh.join().is_err() {
        warn!("Event log thread panicked");
    }

    session.exit();

    result
}

#[cfg(feature = "serial")]
fn hardware_transport() -> Result<Box<dyn Transport>, Report> {
    Ok(Box::new(arm_lib::dev_link::SerialTransport::new()))
}

#[cfg(not(feature = "serial"))]
fn hardware_transport() -> Result<Box<dyn Transport>, Report> {
    Err(eyre!(
        "Built without the serial feature, only --sim is available"
    ))
}

/// Log every event published by the arm service until it shuts down.
fn spawn_event_log(subscriber: LocalSubscriber) -> Result<JoinHandle<()>, Report> {
    thread::Builder::new()
        .name("event_log".into())
        .spawn(move || loop {
            match subscriber.recv_timeout(Duration::from_millis(500)) {
                Ok(Some(envelope)) => match envelope.event {
                    ArmEvent::CommandResult {
                        cmd,
                        success: true,
                        ..
                    } => info!("{} complete", cmd.name()),
                    ArmEvent::CommandResult {
                        cmd,
                        error: Some(e),
                        ..
                    } => warn!("{} failed: {}", cmd.name(), e),
                    event => debug!("Event: {:?}", event),
                },
                Ok(None) => (),
                Err(NetError::Disconnected) => break,
                Err(e) => error!("Event log error: {}", e),
            }
        })
        .wrap_err("Failed to start the event log thread")
}

/// Run a command and print its outcome, returning whether it succeeded.
fn report(service: &ArmService, cmd: ArmCmd) -> bool {
    match service.execute(cmd) {
        Ok(CmdOutput::Done) => {
            println!("ok");
            true
        }
        Ok(CmdOutput::Joints(joints)) => {
            println!("joints (deg): {:.2?}", joints.map(f64::to_degrees));
            true
        }
        Err(e) => {
            println!("error ({:?}): {}", e.kind(), e);
            false
        }
    }
}

/// Read commands from the terminal until `exit` or end of input.
fn console(service: &ArmService) -> Result<(), Report> {
    let mut rl = DefaultEditor::new().wrap_err("Could not start the console")?;

    let history = host::get_sw_root().map(|root| root.join(HISTORY_FILE)).ok();
    if let Some(ref h) = history {
        if rl.load_history(h).is_err() {
            debug!("No console history at {:?}", h);
        }
    }

    println!("Commands: home, move <from> <to>, pick <sq>, place <sq>, goto <sq> [height],");
    println!("          pose <x> <y> <z> <rx> <ry> <rz>, grip [--close], joints, stop,");
    println!("          status, exit");

    loop {
        let line = match rl.readline(PROMPT) {
            Ok(l) => l,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                error!("Console error: {}", e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        rl.add_history_entry(line).ok();

        match line {
            "exit" | "quit" => break,
            "status" => println!("{:#?}", service.status()),
            _ => match tc::from_line(line) {
                Ok(cmd) => {
                    report(service, cmd);
                }
                Err(e) => println!("{}", e),
            },
        }
    }

    if let Some(ref h) = history {
        if let Err(e) = rl.save_history(h) {
            warn!("Could not save the console history: {}", e);
        }
    }

    Ok(())
}
