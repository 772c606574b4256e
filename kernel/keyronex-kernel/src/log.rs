//! Kernel logging infrastructure.
//!
//! Provides a two-phase logging system:
//!
//! **Phase 1 — Early Serial (pre-heap):** [`init_early_serial`] registers
//! lightweight print/log functions that write directly to COM1 with no locks
//! and no allocation. All output during GDT, IDT, PMM, VMM, and heap init
//! goes through this path.
//!
//! **Phase 2 — Full Logger (post-heap):** [`init_logger`] creates a
//! [`Logger`] with a `Vec<Box<dyn LogSink>>` and replaces the early serial
//! functions. Additional sinks are registered via [`add_sink`].

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

#[cfg(target_arch = "x86_64")]
use crate::arch::x86_64::hw::uart16550::{COM1, Uart16550};

use crate::sync::SpinLock;

// ---------------------------------------------------------------------------
// LogSink trait
// ---------------------------------------------------------------------------

/// A dyn-compatible output sink for the kernel logger.
///
/// Uses `&self` (not `&mut self`) because `Uart16550::write_byte` takes
/// `&self` -- port I/O is stateless, so sinks need no interior mutability of
/// their own beyond what the logger's spin lock already provides.
pub trait LogSink: Send + Sync {
    /// Write a string fragment to this sink.
    fn write_str(&self, s: &str);
    /// Maximum log level accepted (messages with `level <= max_level` are written).
    fn max_level(&self) -> keyronex_base::log::LogLevel;
    /// Human-readable name for diagnostics.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// SerialSink
// ---------------------------------------------------------------------------

/// A [`LogSink`] that writes to a 16550 UART serial port.
pub struct SerialSink {
    uart: Uart16550,
    max_level: keyronex_base::log::LogLevel,
}

impl SerialSink {
    /// Creates a new serial sink.
    pub fn new(uart: Uart16550, max_level: keyronex_base::log::LogLevel) -> Self {
        Self { uart, max_level }
    }
}

impl LogSink for SerialSink {
    fn write_str(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.uart.write_byte(b'\r');
            }
            self.uart.write_byte(byte);
        }
    }

    fn max_level(&self) -> keyronex_base::log::LogLevel {
        self.max_level
    }

    fn name(&self) -> &str {
        "serial"
    }
}

// ---------------------------------------------------------------------------
// Early serial functions (Phase 1, pre-heap)
// ---------------------------------------------------------------------------

/// Wrapper around `Uart16550` that implements `fmt::Write` using `&self`
/// semantics (constructs on the stack each time, no state).
struct SerialWriter(Uart16550);

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.0.write_byte(b'\r');
            }
            self.0.write_byte(byte);
        }
        Ok(())
    }
}

/// Early print function: writes directly to COM1 with no locks.
fn early_serial_print(args: fmt::Arguments<'_>) {
    let mut w = SerialWriter(Uart16550::new(COM1));
    let _ = w.write_fmt(args);
}

/// Early log function: formats a leveled, timestamped message to COM1.
fn early_serial_log(level: keyronex_base::log::LogLevel, args: fmt::Arguments<'_>) {
    let nanos = crate::time::boot_nanos();
    let total_micros = nanos / 1_000;
    let secs = total_micros / 1_000_000;
    let micros = total_micros % 1_000_000;
    let level_str = level.name();

    let mut w = SerialWriter(Uart16550::new(COM1));
    let _ = write!(w, "[{secs:>5}.{micros:06}] {level_str} {args}\n");
}

/// Registers early serial print/log functions with `keyronex_base`.
///
/// Call this after UART hardware init and before any `kprint!`/`klog!` use.
/// No heap allocation required.
pub fn init_early_serial() {
    // SAFETY: Both functions are safe to call from any context — they
    // construct a Uart16550 on the stack (just a u16) and write bytes.
    unsafe {
        keyronex_base::log::set_print_fn(early_serial_print);
        keyronex_base::log::set_log_fn(early_serial_log);
    }
}

// ---------------------------------------------------------------------------
// Logger (Phase 2, post-heap)
// ---------------------------------------------------------------------------

/// Interior data protected by the logger's spin lock.
struct LoggerInner {
    sinks: Vec<Box<dyn LogSink>>,
}

/// The kernel logger.
///
/// Holds a `Vec<Box<dyn LogSink>>` behind a [`SpinLock`]. Output is fanned out
/// to every registered sink. Construct with [`Logger::new`] (const) and store
/// in a `static`.
pub struct Logger {
    inner: SpinLock<Option<LoggerInner>>,
}

impl Logger {
    /// Creates a new logger (uninitialized). Writes are silent no-ops until
    /// [`init_with_serial`](Self::init_with_serial) is called.
    const fn new() -> Self {
        Self {
            inner: SpinLock::new(None),
        }
    }

    /// Initializes the logger with a serial sink pre-registered, then replaces
    /// the early serial functions with the logger's functions. Zero-loss
    /// transition.
    fn init_with_serial(&self) {
        {
            let mut guard = self.inner.lock();
            let serial_sink = Box::new(SerialSink::new(
                Uart16550::new(COM1),
                keyronex_base::log::LogLevel::Trace,
            ));
            let mut sinks: Vec<Box<dyn LogSink>> = Vec::with_capacity(4);
            sinks.push(serial_sink);
            *guard = Some(LoggerInner { sinks });
        }

        // Replace early serial functions with the logger's functions.
        // SAFETY: logger_print and logger_log are safe to call from any context.
        unsafe {
            keyronex_base::log::set_print_fn(logger_print);
            keyronex_base::log::set_log_fn(logger_log);
        }
    }

    /// Registers an additional output sink.
    fn add_sink(&self, sink: Box<dyn LogSink>) {
        let mut guard = self.inner.lock();
        if let Some(inner) = guard.as_mut() {
            inner.sinks.push(sink);
        }
    }

    /// Replaces the first sink whose [`name()`](LogSink::name) matches `name`
    /// with `new_sink`. Returns `true` if a replacement was made.
    fn replace_sink_by_name(&self, name: &str, new_sink: Box<dyn LogSink>) -> bool {
        let mut guard = self.inner.lock();
        if let Some(inner) = guard.as_mut() {
            for sink in &mut inner.sinks {
                if sink.name() == name {
                    *sink = new_sink;
                    return true;
                }
            }
        }
        false
    }

    /// Raw write — fans out `args` to **all** sinks with no filtering.
    /// Used by `kprint!` / `kprintln!` (panic handlers, raw console).
    fn write_fmt(&self, args: fmt::Arguments<'_>) {
        let guard = self.inner.lock();
        if let Some(inner) = guard.as_ref() {
            for sink in &inner.sinks {
                let mut w = SinkWriter(sink.as_ref());
                let _ = fmt::Write::write_fmt(&mut w, args);
            }
        }
    }

    /// Leveled write — formats a timestamped, level-tagged message and writes
    /// it only to sinks whose `max_level >= level`.
    fn log(&self, level: keyronex_base::log::LogLevel, args: fmt::Arguments<'_>) {
        let nanos = crate::time::boot_nanos();
        let total_micros = nanos / 1_000;
        let secs = total_micros / 1_000_000;
        let micros = total_micros % 1_000_000;
        let level_str = level.name();

        let guard = self.inner.lock();
        if let Some(inner) = guard.as_ref() {
            for sink in &inner.sinks {
                if level <= sink.max_level() {
                    let mut w = SinkWriter(sink.as_ref());
                    let _ = write!(w, "[{secs:>5}.{micros:06}] {level_str} {args}\n");
                }
            }
        }
    }
}

/// Adapter that wraps a `&dyn LogSink` to implement `fmt::Write`.
struct SinkWriter<'a>(&'a dyn LogSink);

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Global logger instance and public API
// ---------------------------------------------------------------------------

/// Global logger instance.
pub static LOGGER: Logger = Logger::new();

/// Print function that forwards to the global logger (raw, unfiltered).
fn logger_print(args: fmt::Arguments<'_>) {
    LOGGER.write_fmt(args);
}

/// Log function that forwards to the global logger (leveled, timestamped).
fn logger_log(level: keyronex_base::log::LogLevel, args: fmt::Arguments<'_>) {
    LOGGER.log(level, args);
}

/// Initializes the full logger (Phase 2), replacing early serial functions.
///
/// Call this after the heap allocator is available.
pub fn init_logger() {
    LOGGER.init_with_serial();
}

/// Registers an additional output sink with the global logger.
pub fn add_sink(sink: Box<dyn LogSink>) {
    LOGGER.add_sink(sink);
}

/// Replaces a named sink in the global logger. Returns `true` on success.
pub fn replace_sink_by_name(name: &str, new_sink: Box<dyn LogSink>) -> bool {
    LOGGER.replace_sink_by_name(name, new_sink)
}

// ---------------------------------------------------------------------------
// Panic helper
// ---------------------------------------------------------------------------

/// Writes a panic message directly to COM1 via `Uart16550`.
///
/// No locks, no allocation — safe from any context including inside a
/// panic while the logger lock is held.
pub fn panic_serial(info: &core::panic::PanicInfo) {
    let mut w = SerialWriter(Uart16550::new(COM1));
    let _ = write!(w, "\n!!! KERNEL PANIC !!!\n{info}\n");
}
