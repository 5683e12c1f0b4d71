//! Opt-in file diagnostics.
//!
//! The normal output channel is the serial link, so runtime diagnostics go to
//! a log file instead of stdout where they would be useless once the process
//! is started from a desktop session.

use std::fs::File;
use std::os::unix::fs::OpenOptionsExt;

/// Debug log file path (in /tmp for easy access)
const DEBUG_LOG_PATH: &str = "/tmp/glowcast.log";
/// Debug log file permissions (owner read/write only - 0o600)
const DEBUG_LOG_MODE: u32 = 0o600;

/// Debug logger for pipeline diagnostics.
///
/// Writes to a log file when debug mode is enabled. Uses restrictive
/// permissions (0o600) to prevent other users from reading potentially
/// sensitive audio device information.
pub struct DebugLogger {
    file: Option<File>,
}

impl DebugLogger {
    /// Create a new debug logger, optionally opening a log file.
    pub fn new(debug_enabled: bool) -> Self {
        use std::fs::OpenOptions;

        let file = if debug_enabled {
            // Try exclusive create first (safe), fall back to truncate (user's own file)
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(DEBUG_LOG_MODE)
                .open(DEBUG_LOG_PATH)
                .or_else(|_| {
                    // File exists - truncate in place (atomic, no race window)
                    OpenOptions::new()
                        .write(true)
                        .truncate(true)
                        .open(DEBUG_LOG_PATH)
                })
                .ok()
        } else {
            None
        };
        Self { file }
    }

    /// Write a formatted message to the log file (if enabled).
    pub fn log(&mut self, args: std::fmt::Arguments) {
        use std::io::Write;
        if let Some(ref mut f) = self.file {
            let _ = writeln!(f, "{}", args);
            let _ = f.flush();
        }
    }
}

/// Convenience macro for debug logging with format args.
macro_rules! dbg_log {
    ($logger:expr, $($arg:tt)*) => {
        $logger.log(format_args!($($arg)*))
    };
}

pub(crate) use dbg_log;
