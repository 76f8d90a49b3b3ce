use crate::qemu_fmt::QemuSink;
use core::fmt::{self, Write};
use core::panic::PanicInfo;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log` backend writing to the QEMU debug port.
pub struct QemuLogger {
    max_level: LevelFilter,
}

impl QemuLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Install as the global logger. Call once during early init.
    ///
    /// # Errors
    /// Another logger is already installed.
    pub fn init(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = write_record(&mut QemuSink, record);
        }
    }

    fn flush(&self) {}
}

/// Format one record as `[LEVEL] target: message`, with the source
/// location appended in debug builds.
///
/// # Errors
/// Whatever the sink reports.
pub fn write_record(out: &mut impl Write, record: &Record) -> fmt::Result {
    write!(out, "[{}] {}: {}", record.level(), record.target(), record.args())?;
    if cfg!(debug_assertions)
        && let (Some(file), Some(line)) = (record.file(), record.line())
    {
        write!(out, " ({file}:{line})")?;
    }
    out.write_char('\n')
}

/// Format a panic report.
///
/// # Errors
/// Whatever the sink reports.
pub fn write_panic(out: &mut impl Write, info: &PanicInfo<'_>) -> fmt::Result {
    write!(out, "\n!!! kernel panic: {}", info.message())?;
    if let Some(location) = info.location() {
        write!(out, " at {}:{}", location.file(), location.line())?;
    }
    out.write_char('\n')
}
