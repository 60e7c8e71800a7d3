//! Kernel console output.
//!
//! Output goes through a sink registered at boot (serial or CGA on metal, a
//! host sink under test). Nothing is printed before registration.

use crate::spinlock::SpinLock;
use core::fmt::Write;

static SINK: SpinLock<Option<fn(&str)>> = SpinLock::new(None);

/// Register the console sink. The last registration wins.
pub fn register_console(sink: fn(&str)) {
    let mut guard = SINK.lock();
    *guard = Some(sink);
    guard.unlock();
}

struct SinkWriter(fn(&str));

impl Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        (self.0)(s);
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    let guard = SINK.lock();
    let sink = *guard;
    guard.unlock();
    if let Some(sink) = sink {
        let _ = SinkWriter(sink).write_fmt(args);
    }
}

/// Print to the kernel console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::kprint::_print(core::format_args!($($arg)*))
    };
}

/// Print to the kernel console, with a newline.
#[macro_export]
macro_rules! println {
    () => { $crate::print!("\n") };
    ($($arg:tt)*) => {
        $crate::kprint::_print(core::format_args!("{}\n", core::format_args!($($arg)*)))
    };
}

/// Print an informational message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::println!("[INFO] {}", core::format_args!($($arg)*))
    };
}

/// Print a warning message.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => {
        $crate::println!("[WARN] {}", core::format_args!($($arg)*))
    };
}

/// Print a debug message. Compiled out of release builds.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            $crate::println!("[DEBUG] {}", core::format_args!($($arg)*))
        }
    };
}
