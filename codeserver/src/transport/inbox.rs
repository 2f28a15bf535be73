use globset::{GlobBuilder, GlobMatcher};
use once_cell::sync::Lazy;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

/// prefix of request files deposited by the search server
pub const REQUEST_PREFIX: &str = "candidate";
/// prefix of result files written by the dispatcher
pub const RESULT_PREFIX: &str = "code_complete";
/// step of the one-time initialization message and of its acknowledgment
pub const INIT_STEP: i64 = -1;

pub static INIT_FILE_NAME: Lazy<String> = Lazy::new(|| format!("{REQUEST_PREFIX}.{INIT_STEP}"));

#[derive(Error, Debug)]
pub enum InboxError {
    #[error("failed to list inbox {path:?}: {source}")]
    List { path: PathBuf, source: io::Error },
    #[error("invalid request glob")]
    Glob(#[from] globset::Error),
}

/// The local directory shared with the search server
#[derive(Debug, Clone)]
pub struct Inbox {
    path: PathBuf,
}

impl Inbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn init_path(&self) -> PathBuf {
        self.path.join(INIT_FILE_NAME.as_str())
    }

    pub fn request_path(&self, step: i64) -> PathBuf {
        self.path.join(format!("{REQUEST_PREFIX}.{step}"))
    }

    pub fn result_path(&self, step: i64) -> PathBuf {
        self.path.join(format!("{RESULT_PREFIX}.{step}"))
    }

    /// Remove every request file except a pending init file.
    /// Returns the number of removed files.
    pub fn purge(&self) -> Result<usize, InboxError> {
        let matcher = request_matcher()?;
        let entries = fs::read_dir(&self.path).map_err(|source| InboxError::List {
            path: self.path.clone(),
            source,
        })?;
        let mut removed = 0;

        for entry in entries.filter_map(Result::ok) {
            let file_name = entry.file_name();
            if file_name == INIT_FILE_NAME.as_str() || !matcher.is_match(&file_name) {
                continue;
            }

            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(path = ?entry.path(), "Removed stale request");
                    removed += 1;
                }
                Err(error) => {
                    warn!(path = ?entry.path(), error = ?error, "Failed to remove stale request")
                }
            }
        }

        Ok(removed)
    }
}

fn request_matcher() -> Result<GlobMatcher, globset::Error> {
    GlobBuilder::new(&format!("{REQUEST_PREFIX}*"))
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
}

/// A request counts as present once it is a regular, non-empty file
pub fn is_present(path: &Path) -> bool {
    fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.len() > 0)
        .unwrap_or(false)
}
