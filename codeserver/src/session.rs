pub mod log;

use crate::{
    config::{DispatcherConfig, SetupConfig},
    executors,
    location::{Location, LocationError},
    message::{Message, MessageType},
    pool::{Pool, SlaveListError},
    transport::{
        self,
        inbox::{Inbox, InboxError, INIT_STEP},
        TransportError,
    },
};
use itertools::Itertools;
use self::log::GenerationLog;
use std::{
    io,
    path::Path,
    process::{Command, ExitStatus, Stdio},
};
use thiserror::Error;
use tracing::{debug, info, instrument};
use wait_timeout::ChildExt;

pub const SERVER_URL: &str = "CODEGEN_SERVER_URL";
pub const TARGET_URL: &str = "CODEGEN_TARGET_URL";
pub const REPLY_URL: &str = "CODEGEN_REPLY_URL";
pub const SLAVE_LIST: &str = "CODEGEN_SLAVE_LIST";
pub const SLAVE_PATH: &str = "CODEGEN_SLAVE_PATH";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to read init message: {0}")]
    Transport(#[from] TransportError),
    #[error("failed to clear the inbox: {0}")]
    Inbox(#[from] InboxError),
    #[error("message is not a session request")]
    NotASession,
    #[error("session does not define {0}")]
    MissingKey(&'static str),
    #[error("invalid {key}: {source}")]
    Location {
        key: &'static str,
        source: LocationError,
    },
    #[error("CODEGEN_SLAVE_LIST is invalid: {0}")]
    SlaveList(#[from] SlaveListError),
    #[error("failed to run host setup: {0}")]
    SetupSpawn(#[source] io::Error),
    #[error("host setup exited with {0}")]
    SetupFailed(ExitStatus),
    #[error("host setup timed out")]
    SetupTimeout,
}

/// Values of one tuning session, taken from the init message as a whole
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub app_name: String,
    pub local: Location,
    pub target: Location,
    pub reply: Location,
    pub slave_list: String,
    pub slave_path: String,
}

impl SessionConfig {
    pub fn from_message(message: &Message) -> Result<Self, SessionError> {
        let signature = match (&message.kind, &message.session) {
            (MessageType::Session, Some(signature)) => signature,
            _ => return Err(SessionError::NotASession),
        };

        let value = |key: &'static str| {
            signature
                .cfg
                .get(key)
                .cloned()
                .ok_or(SessionError::MissingKey(key))
        };
        let location = |key: &'static str| {
            Location::parse(&value(key)?).map_err(|source| SessionError::Location { key, source })
        };

        Ok(Self {
            app_name: signature.name.clone(),
            local: location(SERVER_URL)?,
            target: location(TARGET_URL)?,
            reply: location(REPLY_URL)?,
            slave_list: value(SLAVE_LIST)?,
            slave_path: value(SLAVE_PATH)?,
        })
    }
}

/// Scheduler state of a running session, replaced as a whole on re-initialization
#[derive(Debug)]
pub struct Session {
    pub config: SessionConfig,
    pub pool: Pool,
    /// number of slots that may still be handed a request
    pub ready: usize,
    /// step of the next request file
    pub timestep: i64,
    pub log: GenerationLog,
}

impl Session {
    pub fn new(config: SessionConfig, pool: Pool, log: GenerationLog) -> Self {
        Self {
            ready: pool.len(),
            timestep: 0,
            config,
            pool,
            log,
        }
    }

    /// Build a new session from the init file at `path`.
    ///
    /// Clears stale requests from the inbox, builds the pool, runs the host setup and
    /// acknowledges the session to the search server. Nothing outside the returned session is
    /// touched, so on failure the caller keeps its previous state.
    #[instrument(skip_all, fields(path = ?path))]
    pub fn initialize(
        path: &Path,
        inbox: &Inbox,
        settings: &DispatcherConfig,
    ) -> Result<Self, SessionError> {
        let message = transport::read_message(path)?;
        let removed = inbox.purge()?;
        debug!(removed, "Cleared stale requests");

        let config = SessionConfig::from_message(&message)?;
        let pool = Pool::parse(&config.slave_list)?;
        let log = GenerationLog::new(&settings.log_dir, &config.app_name);

        info!(app = %config.app_name, "Generating code");
        info!(slots = %pool.names().join(" "), "Available machines");
        log.record(format_args!("-------------------------------------------"));
        log.record(format_args!(
            "The list of available machines: {}",
            pool.names().join(" ")
        ));

        run_setup(&settings.setup, &config, &pool)?;

        transport::write_message(
            inbox,
            &message.acknowledged(),
            &config.reply,
            INIT_STEP,
            settings.copy_timeout(),
        )?;

        Ok(Self::new(config, pool, log))
    }
}

/// `/bin/sh <script> <app> <slave path> <local host> <slot...>`
pub fn setup_command(script: &Path, config: &SessionConfig, pool: &Pool) -> Command {
    let mut command = Command::new("/bin/sh");
    command
        .arg(script)
        .arg(&config.app_name)
        .arg(&config.slave_path)
        .arg(&config.local.host)
        .args(pool.names());

    command
}

/// Prepare the slot working directories, a failure fails the session
pub fn run_setup(
    setup: &SetupConfig,
    config: &SessionConfig,
    pool: &Pool,
) -> Result<(), SessionError> {
    let Some(ref script) = setup.script else {
        debug!("No host setup configured");
        return Ok(());
    };

    let mut child = setup_command(script, config, pool)
        .stdin(Stdio::null())
        .spawn()
        .map_err(SessionError::SetupSpawn)?;

    match child.wait_timeout(setup.timeout()) {
        Ok(Some(status)) if status.success() => Ok(()),
        Ok(Some(status)) => Err(SessionError::SetupFailed(status)),
        Ok(None) => {
            // reclaim before reporting, the setup must not outlive the attempt
            executors::reclaim_child(&mut child).map_err(SessionError::SetupSpawn)?;

            Err(SessionError::SetupTimeout)
        }
        Err(error) => {
            if let Err(reclaim) = executors::reclaim_child(&mut child) {
                debug!(error = ?reclaim, "Failed to reclaim host setup");
            }

            Err(SessionError::SetupSpawn(error))
        }
    }
}
