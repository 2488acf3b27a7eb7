//! Logging for the arm executables
//!
//! Two sinks are installed:
//!
//! - the main log, printed to stdout and written to `<exec>.log` in the
//!   session directory
//! - the wire log, `serial.log` in the session directory, which receives
//!   every record logged with the [`WIRE_TARGET`] target, i.e. the raw lines
//!   exchanged with the arm firmware
//!
//! Wire records only reach the main log when it runs at `Trace`.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External imports
use colored::{ColoredString, Colorize};
use log::{info, Level, Record};
use std::fmt::Arguments;
use thiserror::Error;

// Internal imports
use crate::session::{self, Session};

// Re-exports
pub use log::LevelFilter;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Log target of the serial traffic records.
pub const WIRE_TARGET: &str = "wire";

/// Name of the wire log inside the session directory.
pub const WIRE_LOG_FILE_NAME: &str = "serial.log";

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Errors associated with initialising the logger.
#[derive(Debug, Error)]
pub enum LoggerInitError {
    #[error("The minimum log level must be INFO or more verbose, found `{0}`")]
    InvalidMinLogLevel(LevelFilter),

    #[error("Cannot open the log file: {0}")]
    LogFileInitError(std::io::Error),

    #[error("Cannot install the logger: {0}")]
    FernInitError(log::SetLoggerError),
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Install the logger for this execution.
///
/// `min_level` must be `Info` or more verbose. Only one logger can be
/// installed per process, a second call fails with `FernInitError`.
pub fn logger_init(min_level: LevelFilter, session: &Session) -> Result<(), LoggerInitError> {
    if min_level < Level::Info {
        return Err(LoggerInitError::InvalidMinLogLevel(min_level));
    }

    let main_file =
        fern::log_file(&session.log_file_path).map_err(LoggerInitError::LogFileInitError)?;
    let wire_log_path = session.session_root.join(WIRE_LOG_FILE_NAME);
    let wire_file = fern::log_file(&wire_log_path).map_err(LoggerInitError::LogFileInitError)?;

    let wire_level = if min_level == LevelFilter::Trace {
        LevelFilter::Trace
    } else {
        LevelFilter::Off
    };

    let main = fern::Dispatch::new()
        .format(format_main)
        .level(min_level)
        .level_for(WIRE_TARGET, wire_level)
        .level_for("serialport", LevelFilter::Info)
        .chain(std::io::stdout())
        .chain(main_file);

    let wire = fern::Dispatch::new()
        .filter(|meta| meta.target() == WIRE_TARGET)
        .format(|out, message, _| {
            out.finish(format_args!(
                "{:10.6} {}",
                session::get_elapsed_seconds(),
                message
            ))
        })
        .chain(wire_file);

    fern::Dispatch::new()
        .level(LevelFilter::Trace)
        .chain(main)
        .chain(wire)
        .apply()
        .map_err(LoggerInitError::FernInitError)?;

    info!("Logging initialised");
    info!("    Session epoch: {}", session::get_epoch());
    info!("    Log level: {:?}", min_level);
    info!("    Log file: {:?}", session.log_file_path);
    info!("    Serial log file: {:?}", wire_log_path);

    Ok(())
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn format_main(out: fern::FormatCallback, message: &Arguments, record: &Record) {
    let t = session::get_elapsed_seconds();
    let level = level_tag(record.level());

    // Debug and trace lines name the module they come from
    if record.level() > Level::Info {
        out.finish(format_args!(
            "[{:10.6} {}] {}: {}",
            t,
            level,
            record.target(),
            message
        ))
    } else {
        out.finish(format_args!("[{:10.6} {}] {}", t, level, message))
    }
}

fn level_tag(level: Level) -> ColoredString {
    match level {
        Level::Trace => "TRC".dimmed().italic(),
        Level::Debug => "DBG".dimmed(),
        Level::Info => "INF".normal(),
        Level::Warn => "WRN".yellow(),
        Level::Error => "ERR".red().bold(),
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
