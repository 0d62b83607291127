//! Host console logger for tests and software emulation.

use std::io::Write;

use log::LevelFilter;
use spin::Once;

pub struct HostConsole;

static INSTALLED: Once<()> = Once::new();

/// Installs the host console as the global logger.
///
/// Safe to call any number of times; only the first call installs.
pub fn init() {
    INSTALLED.call_once(|| {
        if log::set_logger(&HostConsole).is_err() {
            return;
        }

        #[cfg(debug_assertions)]
        log::set_max_level(LevelFilter::Trace);

        #[cfg(not(debug_assertions))]
        log::set_max_level(LevelFilter::Info);
    });
}

impl log::Log for HostConsole {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let mut stderr = std::io::stderr().lock();
        let _ = write_log_entry_to(&mut stderr, record);
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn write_log_entry_to(writer: &mut impl Write, record: &log::Record) -> std::io::Result<()> {
    #[cfg(feature = "detailed-logging")]
    return writeln!(
        writer,
        "[{} {}:{} {}] {}",
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.target(),
        record.args()
    );
    #[cfg(not(feature = "detailed-logging"))]
    return writeln!(writer, "[{:5}] {}", record.level(), record.args());
}
