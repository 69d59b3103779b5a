// Copyright 2024 The silt Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::db::filename::{generate_filename, FileType};
use crate::storage::{File, Storage};
use log::{LevelFilter, Log, Metadata, Record};
use slog::{o, Drain};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// A `log::Log` implementation forwarding every record to a `slog`
/// logger, so the crate can use the plain `log` macros everywhere.
pub struct Logger {
    inner: slog::Logger,
    level: LevelFilter,
}

impl Logger {
    /// Uses the given `slog::Logger` if there is one. Otherwise logs to
    /// the terminal in debug builds and into `LOG` in the db directory
    /// in release builds, rotating a previous `LOG` to `LOG.old`.
    pub fn new<S: Storage>(
        user_logger: Option<slog::Logger>,
        level: LevelFilter,
        env: &S,
        db_path: &str,
    ) -> Self {
        let inner = match user_logger {
            Some(logger) => logger,
            None => {
                if cfg!(debug_assertions) {
                    let decorator = slog_term::TermDecorator::new().build();
                    let drain = slog_term::FullFormat::new(decorator).build().fuse();
                    let drain = slog_async::Async::new(drain).build().fuse();
                    slog::Logger::root(drain, o!())
                } else {
                    let log_path = generate_filename(db_path, FileType::InfoLog, 0);
                    if env.exists(&log_path) {
                        let old = generate_filename(db_path, FileType::OldInfoLog, 0);
                        let _ = env.rename(&log_path, &old);
                    }
                    match env.create(&log_path) {
                        Ok(f) => {
                            let drain = FileBasedDrain::new(f).fuse();
                            let drain = slog_async::Async::new(drain).build().fuse();
                            slog::Logger::root(drain, o!())
                        }
                        Err(_) => slog::Logger::root(slog::Discard, o!()),
                    }
                }
            }
        };
        Self { inner, level }
    }

    /// Installs `logger` as the global `log` backend. Only the first
    /// call in a process takes effect.
    pub fn apply(logger: Logger) {
        let level = logger.level;
        if log::set_boxed_logger(Box::new(logger)).is_ok() {
            log::set_max_level(level);
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        match record.level() {
            log::Level::Error => slog::error!(self.inner, "{}", record.args()),
            log::Level::Warn => slog::warn!(self.inner, "{}", record.args()),
            log::Level::Info => slog::info!(self.inner, "{}", record.args()),
            log::Level::Debug => slog::debug!(self.inner, "{}", record.args()),
            log::Level::Trace => slog::trace!(self.inner, "{}", record.args()),
        }
    }

    fn flush(&self) {}
}

/// A `slog` drain appending formatted records to a db `File`.
struct FileBasedDrain<F: File> {
    file: Mutex<F>,
}

impl<F: File> FileBasedDrain<F> {
    fn new(f: F) -> Self {
        Self {
            file: Mutex::new(f),
        }
    }
}

impl<F: File> Drain for FileBasedDrain<F> {
    type Ok = ();
    type Err = slog::Never;

    fn log(
        &self,
        record: &slog::Record,
        _values: &slog::OwnedKVList,
    ) -> Result<Self::Ok, Self::Err> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let line = format!(
            "[{}.{:06}] [{}] {}\n",
            now.as_secs(),
            now.subsec_micros(),
            record.level().as_short_str(),
            record.msg(),
        );
        // drop the record if the file went away
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write(line.as_bytes());
            let _ = file.flush();
        }
        Ok(())
    }
}
