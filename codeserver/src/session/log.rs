use std::{
    fmt,
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};
use tracing::warn;

/// Append-only `generation.<app>.log` of one session
#[derive(Debug, Clone)]
pub struct GenerationLog {
    path: Option<PathBuf>,
}

impl GenerationLog {
    /// A log inside `dir`, disabled if `dir` is not a directory
    pub fn new(dir: &Path, app_name: &str) -> Self {
        if !dir.is_dir() {
            warn!(dir = ?dir, "Generation log directory missing, not logging");
            return Self::disabled();
        }

        Self {
            path: Some(dir.join(format!("generation.{app_name}.log"))),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Append one line, failures are only reported
    pub fn record(&self, line: fmt::Arguments<'_>) {
        let Some(ref path) = self.path else {
            return;
        };

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{line}"));

        if let Err(error) = result {
            warn!(path = ?path, error = ?error, "Failed to write generation log");
        }
    }
}
