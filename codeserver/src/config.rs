use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{Error, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Failed to read configuration")]
    Read(#[from] Error),
    #[error("Invalid configuration")]
    Invalid(#[from] serde_yaml::Error),
}

/// Settings of the dispatcher itself, the per-session values arrive with the init message
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DispatcherConfig {
    // inbox polling tick in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default)]
    pub setup: SetupConfig,
    // upper bound for relaying one result in seconds
    #[serde(default = "default_copy_timeout")]
    pub copy_timeout: u64,
    // where generation.<app>.log files go
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

/// The host setup procedure run on every session start
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SetupConfig {
    // run with /bin/sh, `null` skips the setup
    #[serde(default = "default_setup_script")]
    pub script: Option<PathBuf>,
    // seconds
    #[serde(default = "default_setup_timeout")]
    pub timeout: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            setup: SetupConfig::default(),
            copy_timeout: default_copy_timeout(),
            log_dir: default_log_dir(),
        }
    }
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            script: default_setup_script(),
            timeout: default_setup_timeout(),
        }
    }
}

impl DispatcherConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(|error| match error.kind() {
            ErrorKind::NotFound => ConfigErrors::FileNotFound(path.to_path_buf()),
            _ => ConfigErrors::Read(error),
        })?;

        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }

    pub fn copy_timeout(&self) -> Duration {
        Duration::from_secs(self.copy_timeout)
    }

    /// Report problems that will only surface on the first session, returns true if any was found
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        if self.poll_interval == 0 {
            warn!("poll_interval is 0, the inbox will be polled without pause");
        }

        if let Some(ref script) = self.setup.script {
            if !script.is_file() {
                warn!(
                    "setup.script {} is not a file, session initialization will fail",
                    script.to_string_lossy()
                );
                contains_error = true;
            }
        }

        if !self.log_dir.is_dir() {
            warn!(
                "log_dir {} is not a directory, generation logs will be skipped",
                self.log_dir.to_string_lossy()
            );
            contains_error = true;
        }

        contains_error
    }
}

impl SetupConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_copy_timeout() -> u64 {
    120
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_setup_script() -> Option<PathBuf> {
    Some(PathBuf::from("setup_code_gen_hosts.sh"))
}

fn default_setup_timeout() -> u64 {
    600
}
