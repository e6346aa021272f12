//! Debug logger.
//!
//! One line-oriented sink for the whole firmware: RTT on the flight board,
//! stderr in the simulator and under test. The writer task only logs on
//! failure, so the sink never sits in the hot flash path.

use log::{Level, Log, SetLoggerError};

/// Line logger for the flight computer board.
struct FlightLogger;

static APP_LOGGER: FlightLogger = FlightLogger;

impl Log for FlightLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        #[cfg(debug_assertions)]
        {
            metadata.level() <= Level::Trace
        }
        #[cfg(not(debug_assertions))]
        {
            metadata.level() <= Level::Info
        }
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            #[cfg(all(target_arch = "arm", target_os = "none"))]
            rtt_target::rprintln!("{{{}}}, [{}], {}", record.target(), record.level(), record.args());

            #[cfg(all(feature = "sim", not(all(target_arch = "arm", target_os = "none"))))]
            eprintln!("{{{}}}, [{}], {}", record.target(), record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Installs the global logger.
///
/// # Debug
///
/// While in debug build, uses Trace logging level.
pub fn init() -> Result<(), SetLoggerError> {
    log::set_logger(&APP_LOGGER).map(|_l| {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        {
            #[cfg(debug_assertions)]
            rtt_target::debug_rtt_init_print!();
            #[cfg(not(debug_assertions))]
            rtt_target::rtt_init_print!();
        }
        #[cfg(debug_assertions)]
        log::set_max_level(log::LevelFilter::Trace);
        #[cfg(not(debug_assertions))]
        log::set_max_level(log::LevelFilter::Info);
    })
}
