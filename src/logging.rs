//! Runtime log file.
//!
//! A loaded runtime cannot assume a console, so the `log` facade is backed
//! by a single file in the per-user data directory (created on first use).
//! Initialization is idempotent; the first caller wins, later calls are
//! no-ops, and when another logger is already installed (tests use
//! `pretty_env_logger`) the runtime simply logs through that one.

use {
    crate::config::data_dir,
    log::{LevelFilter, Log, Metadata, Record},
    parking_lot::Mutex,
    std::{
        fs::{create_dir_all, File, OpenOptions},
        io::Write,
        sync::Once,
        time::{SystemTime, UNIX_EPOCH},
    },
};

const LOG_FILENAME: &str = "parallax-openxr.log";

struct FileLogger {
    file: Mutex<File>,
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();

        let mut file = self.file.lock();
        let _ = writeln!(
            file,
            "{timestamp:.3} {:5} [{}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = self.file.lock().flush();
    }
}

/// Installs the file logger. Safe to call from every entry point.
pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let Some(dir) = data_dir() else {
            return;
        };

        if create_dir_all(&dir).is_err() {
            return;
        }

        let Ok(file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILENAME))
        else {
            return;
        };

        let logger = Box::new(FileLogger {
            file: Mutex::new(file),
        });

        // Another logger may already be installed; that one wins.
        if log::set_boxed_logger(logger).is_ok() {
            log::set_max_level(if cfg!(debug_assertions) {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            });
        }
    });
}
