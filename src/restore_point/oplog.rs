//! Per-invocation operation log files.
//!
//! Every orchestrated call gets its own file under the log directory, named after the
//! action and the time it started. Lines look like
//! `[2024-01-02T03:04:05+01:00] [WARN] Skipping /etc/shadow: Permission denied`
//! and the last one always carries the terminal status.

use crate::restore_point::result_error::error::Error;
use crate::restore_point::result_error::result::Result;
use chrono::{Local, NaiveDateTime, SecondsFormat};
use derive_more::Display;
use itertools::Itertools;
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

pub static TOOL_NAME: &str = "linux_restore_point";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Action {
    #[display("create")]
    Create,
    #[display("restore")]
    Restore,
    #[display("delete")]
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LogLevel {
    #[display("INFO")]
    Info,
    #[display("WARN")]
    Warn,
    #[display("ERROR")]
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum OperationStatus {
    #[display("SUCCESS")]
    Success,
    #[display("FAILURE")]
    Failure,
    #[display("ABORTED")]
    Aborted,
}

#[derive(Debug, Clone)]
pub struct OperationLogger {
    log_dir: PathBuf,
}

impl OperationLogger {
    pub fn new<P: Into<PathBuf>>(log_dir: P) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    /// Creates a fresh owner-only log file. An existing file is never reopened: a
    /// second operation started in the same second gets a numbered name.
    pub fn begin(&self, action: Action, started_at: NaiveDateTime) -> Result<OperationLog> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.log_dir)
            .map_err(|e| Error::io_at(&self.log_dir, e))?;

        let stem = format!("{}_{}_{}", TOOL_NAME, action, started_at.format("%Y%m%d_%H%M%S"));
        let mut attempt = 0;
        let (path, file) = loop {
            let path = match attempt {
                0 => self.log_dir.join(format!("{stem}.log")),
                n => self.log_dir.join(format!("{stem}_{n}.log")),
            };
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)
            {
                Ok(file) => break (path, file),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(Error::io_at(&path, e)),
            }
        };

        tracing::debug!("Operation log for {} opened at {:?}", action, path);
        let mut log = OperationLog {
            action,
            path,
            writer: BufWriter::new(file),
            warnings: 0,
        };
        log.info(format!("Operation {} started", action));
        Ok(log)
    }
}

/// An open operation log, closed with [`OperationLog::end`].
pub struct OperationLog {
    action: Action,
    path: PathBuf,
    writer: BufWriter<File>,
    warnings: usize,
}

impl OperationLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn warnings(&self) -> usize {
        self.warnings
    }

    /// Appends one line and mirrors it to tracing. Multi-line messages are folded
    /// onto that line. Failing to write the log never fails the operation being logged.
    pub fn event<S: AsRef<str>>(&mut self, level: LogLevel, message: S) {
        let message = message
            .as_ref()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .join(" ");
        let message = message.as_str();
        match level {
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warn => {
                self.warnings += 1;
                tracing::warn!("{}", message)
            }
            LogLevel::Error => tracing::error!("{}", message),
        }

        let timestamp = Local::now().to_rfc3339_opts(SecondsFormat::Secs, false);
        if let Err(e) = writeln!(self.writer, "[{}] [{}] {}", timestamp, level, message) {
            tracing::warn!("Cannot write operation log {:?}: {}", self.path, e);
        }
    }

    pub fn info<S: AsRef<str>>(&mut self, message: S) {
        self.event(LogLevel::Info, message)
    }

    pub fn warn<S: AsRef<str>>(&mut self, message: S) {
        self.event(LogLevel::Warn, message)
    }

    pub fn error<S: AsRef<str>>(&mut self, message: S) {
        self.event(LogLevel::Error, message)
    }

    /// Writes the summary line and closes the file, returning its path.
    pub fn end(mut self, status: OperationStatus) -> PathBuf {
        let level = match status {
            OperationStatus::Success => LogLevel::Info,
            OperationStatus::Aborted => LogLevel::Warn,
            OperationStatus::Failure => LogLevel::Error,
        };
        let summary = format!(
            "Operation {} finished with status {} ({} warnings)",
            self.action, status, self.warnings
        );
        self.event(level, summary);

        if let Err(e) = self
            .writer
            .flush()
            .and_then(|_| self.writer.get_ref().sync_all())
        {
            tracing::warn!("Cannot flush operation log {:?}: {}", self.path, e);
        }
        self.path
    }
}
