//! Per-session protocol transcripts.
//!
//! Every line written to or read from an agent can be appended to
//! `{log_dir}/{session_id}.log`. A transcript whose directory was not configured
//! (or could not be opened) silently discards writes, so callers never branch
//! on whether logging is enabled.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{SecondsFormat, Utc};

/// Which side of the conversation a transcript line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Stdin,
    Stdout,
    Stderr,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Stdin => "STDIN",
            Direction::Stdout => "STDOUT",
            Direction::Stderr => "STDERR",
        }
    }
}

/// Shared, append-only transcript file.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    file: Arc<Mutex<Option<File>>>,
}

impl Transcript {
    /// A transcript that drops everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Open (or create) `{log_dir}/{session_id}.log`.
    ///
    /// Failure to create the directory or file is logged and yields a
    /// disabled transcript.
    pub fn open(log_dir: Option<&Path>, session_id: &str) -> Self {
        let Some(dir) = log_dir else {
            return Self::disabled();
        };
        let path = dir.join(format!("{session_id}.log"));
        let file = std::fs::create_dir_all(dir)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));
        match file {
            Ok(file) => Self {
                file: Arc::new(Mutex::new(Some(file))),
            },
            Err(e) => {
                log::warn!("Could not open transcript {}: {}", path.display(), e);
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Append a timestamped line.
    pub fn record(&self, direction: Direction, data: &str) {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(file) = guard.as_mut() {
            let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            let _ = writeln!(file, "[{}] {}: {}", ts, direction.label(), data.trim_end());
            let _ = file.flush();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
