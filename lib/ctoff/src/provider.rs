// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Providers let the engine run in different contexts by plugging in
//! implementations of core services. Today that is only logging: the
//! engine reports through a [`LogProvider`] which maps to stdout in
//! unit tests and to a `slog::Logger` when embedded in a service.

use core::fmt;
use core::fmt::Display;

/// A logging provider provides the means to log messages to some
/// destination based on the context in which the engine is running.
///
/// Logging levels are provided by [`LogLevel`]. These levels will map
/// to the underlying provider with varying degrees of success.
pub trait LogProvider: Send + Sync {
    /// Log a message at the specified level.
    fn log(&self, level: LogLevel, msg: &str);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Note,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let level_s = match self {
            Self::Note => "[NOTE]",
            Self::Warn => "[WARN]",
            Self::Error => "[ERROR]",
        };
        write!(f, "{level_s}")
    }
}

#[derive(Clone, Copy)]
pub struct PrintlnLog;

impl LogProvider for PrintlnLog {
    fn log(&self, level: LogLevel, msg: &str) {
        println!("{level} {msg}");
    }
}

/// Forward engine logs to a [`slog::Logger`].
#[derive(Clone)]
pub struct SlogLog {
    log: slog::Logger,
}

impl SlogLog {
    pub fn new(log: slog::Logger) -> Self {
        Self { log: log.new(slog::o!("component" => "ctoff")) }
    }
}

impl LogProvider for SlogLog {
    fn log(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Note => slog::info!(self.log, "{}", msg),
            LogLevel::Warn => slog::warn!(self.log, "{}", msg),
            LogLevel::Error => slog::error!(self.log, "{}", msg),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::Drain;
    use std::sync::Arc;
    use std::sync::Mutex;

    struct Capture(Arc<Mutex<Vec<String>>>);

    impl Drain for Capture {
        type Ok = ();
        type Err = slog::Never;

        fn log(
            &self,
            record: &slog::Record,
            _values: &slog::OwnedKVList,
        ) -> Result<(), slog::Never> {
            self.0
                .lock()
                .unwrap()
                .push(format!("{} {}", record.level(), record.msg()));
            Ok(())
        }
    }

    #[test]
    fn slog_levels() {
        let lines = Arc::new(Mutex::new(vec![]));
        let root = slog::Logger::root(
            Capture(lines.clone()).fuse(),
            slog::o!(),
        );
        let log = SlogLog::new(root);
        log.log(LogLevel::Note, "zone 1 created");
        log.log(LogLevel::Warn, "restore miss");
        log.log(LogLevel::Error, "rule add failed");

        let lines = lines.lock().unwrap();
        assert_eq!(
            *lines,
            vec![
                "INFO zone 1 created".to_string(),
                "WARN restore miss".to_string(),
                "ERRO rule add failed".to_string(),
            ]
        );
    }
}
