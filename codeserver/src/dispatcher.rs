use crate::{
    config::DispatcherConfig,
    executors::{command, Exit, ExitState, ExecutorError, Workers},
    pool::Worker,
    session::Session,
    transport::{
        self,
        inbox::{self, Inbox, InboxError},
        TransportError,
    },
};
use itertools::Itertools;
use nix::unistd::Pid;
use std::{
    fs, io,
    path::{Path, PathBuf},
    thread,
    time::Instant,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
mod dispatcher_test;

/// Conditions that stop the dispatcher
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("inbox unusable: {0}")]
    Inbox(#[from] InboxError),
    #[error("failed to remove {path:?}: {source}")]
    Remove { path: PathBuf, source: io::Error },
    #[error("failed to write result: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("generation on {slot} (pid {pid}) failed: {state:?}")]
    WorkerFailed {
        slot: String,
        pid: Pid,
        state: ExitState,
    },
    #[error("process {0} does not belong to any slot")]
    UnknownWorker(Pid),
    #[error("slot bookkeeping is corrupted: {0}")]
    InvariantViolation(String),
}

/// What a single pass over the inbox did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// nothing to act on, finished workers (if any) were reaped
    Idle,
    Initialized,
    /// the init file was invalid and discarded, the previous session stays
    InitRejected,
    Dispatched { slot: String, step: i64 },
    /// the request for `step` could not be read and was discarded
    Skipped { step: i64 },
}

pub struct Dispatcher<W> {
    inbox: Inbox,
    settings: DispatcherConfig,
    workers: W,
    session: Option<Session>,
}

impl<W: Workers> Dispatcher<W> {
    pub fn new(inbox: Inbox, settings: DispatcherConfig, workers: W) -> Self {
        Self {
            inbox,
            settings,
            workers,
            session: None,
        }
    }

    #[cfg(test)]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    #[cfg(test)]
    pub fn workers(&mut self) -> &mut W {
        &mut self.workers
    }

    /// Serve requests until a fatal error occurs
    #[instrument(skip(self), fields(inbox = ?self.inbox.path()))]
    pub fn run(&mut self) -> Result<(), DispatchError> {
        self.prepare()?;
        info!("Waiting to hear from the search server");

        loop {
            match self.tick()? {
                Tick::Idle => thread::sleep(self.settings.poll_interval()),
                _ => info!("Waiting to hear from the search server"),
            }
        }
    }

    /// drop requests left over from an earlier run
    pub fn prepare(&mut self) -> Result<(), DispatchError> {
        let removed = self.inbox.purge()?;
        debug!(removed, "Prepared inbox");

        Ok(())
    }

    /// One polling step: initialize on an init file, dispatch the next request, or sweep
    /// finished workers if neither is present.
    pub fn tick(&mut self) -> Result<Tick, DispatchError> {
        let init = self.inbox.init_path();
        if inbox::is_present(&init) {
            return self.initialize(&init);
        }

        if let Some(session) = self.session.as_ref() {
            let request = self.inbox.request_path(session.timestep);
            if inbox::is_present(&request) {
                return self.dispatch(&request);
            }
        }

        self.sweep()?;

        Ok(Tick::Idle)
    }

    fn initialize(&mut self, path: &Path) -> Result<Tick, DispatchError> {
        info!(path = ?path, "Initialization file found");

        let outcome = Session::initialize(path, &self.inbox, &self.settings);
        remove(path)?;

        match outcome {
            Ok(session) => {
                if let Some(previous) = self.session.replace(session) {
                    self.discard(previous)?;
                }
                info!("Beginning new code server session");

                Ok(Tick::Initialized)
            }
            Err(error) => {
                error!(error = %error, "Removed invalid configuration file");

                Ok(Tick::InitRejected)
            }
        }
    }

    /// kill whatever still runs for a replaced session
    fn discard(&mut self, previous: Session) -> Result<(), DispatchError> {
        let live = previous.pool.live_workers();
        if !live.is_empty() {
            warn!(count = live.len(), "Discarding in-flight generations of the previous session");
        }

        for pid in live {
            self.workers.reclaim(pid)?;
        }

        Ok(())
    }

    fn dispatch(&mut self, path: &Path) -> Result<Tick, DispatchError> {
        let started = Instant::now();
        let outcome = transport::read_message(path);

        if let Err(TransportError::ShortHeader | TransportError::ShortPayload { .. }) = outcome {
            // the search server is still writing, read it again on the next tick
            debug!(path = ?path, "Request is incomplete");
            self.sweep()?;

            return Ok(Tick::Idle);
        }

        let session = self.session.as_mut().ok_or_else(|| {
            DispatchError::InvariantViolation("request dispatched without a session".into())
        })?;
        let step = session.timestep;
        info!(path = ?path, step, "Request found");

        let message = match outcome {
            Ok(message) => message,
            Err(error) => {
                error!(path = ?path, error = %error, "Discarding unreadable request");
                remove(path)?;
                session.timestep += 1;

                return Ok(Tick::Skipped { step });
            }
        };

        let index = match session.pool.first_idle() {
            Some(index) if session.ready > 0 => index,
            _ => {
                return Err(DispatchError::InvariantViolation(format!(
                    "{} slots ready but none is idle",
                    session.ready
                )))
            }
        };

        let slot = session.pool.slot(index);
        let slot_name = slot.name().to_owned();
        let values = message.point.iter().join(" ");
        let command = command::build(&session.config, slot, &message.point);

        session.log.record(format_args!("{slot_name}: {values}"));
        info!(slot = %slot_name, step, command = ?command, "Executing");

        let pid = self.workers.launch(command)?;
        session.pool.assign(index, Worker { pid, step, message });
        session.ready -= 1;

        if session.ready == 0 {
            debug!("All slots busy, waiting for one to finish");
            let exit = self.workers.reap(true)?.ok_or_else(|| {
                DispatchError::InvariantViolation("pool saturated without live workers".into())
            })?;
            complete(session, &self.inbox, &self.settings, exit)?;
        }

        let elapsed = started.elapsed().as_secs_f64();
        session
            .log
            .record(format_args!("Total time for iteration {step} : {elapsed}"));
        session.log.record(format_args!("------------------"));

        remove(path)?;
        session.timestep += 1;
        check_occupancy(session)?;
        info!(step, "Iteration complete");

        Ok(Tick::Dispatched {
            slot: slot_name,
            step,
        })
    }

    /// reap every worker that already exited, without blocking
    fn sweep(&mut self) -> Result<usize, DispatchError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(0);
        };
        let mut reaped = 0;

        while let Some(exit) = self.workers.reap(false)? {
            complete(session, &self.inbox, &self.settings, exit)?;
            reaped += 1;
        }

        if reaped > 0 {
            check_occupancy(session)?;
        }

        Ok(reaped)
    }
}

/// Hand the result of an exited worker back and free its slot
fn complete(
    session: &mut Session,
    inbox: &Inbox,
    settings: &DispatcherConfig,
    exit: Exit,
) -> Result<(), DispatchError> {
    let (index, worker) = session
        .pool
        .release(exit.pid)
        .ok_or(DispatchError::UnknownWorker(exit.pid))?;
    let slot = session.pool.slot(index).name().to_owned();

    if !exit.state.success() {
        // the result of this step is lost, there are no retries
        error!(slot = %slot, pid = %exit.pid, step = worker.step, state = ?exit.state, "Generation failed");

        return Err(DispatchError::WorkerFailed {
            slot,
            pid: exit.pid,
            state: exit.state,
        });
    }

    transport::write_message(
        inbox,
        &worker.message.acknowledged(),
        &session.config.reply,
        worker.step,
        settings.copy_timeout(),
    )?;
    session.ready += 1;
    info!(slot = %slot, step = worker.step, "Generation complete");

    Ok(())
}

/// busy slots and ready slots always add up to the pool size
fn check_occupancy(session: &Session) -> Result<(), DispatchError> {
    let busy = session.pool.busy();

    if busy + session.ready != session.pool.len() {
        return Err(DispatchError::InvariantViolation(format!(
            "{busy} busy + {} ready != {} slots",
            session.ready,
            session.pool.len()
        )));
    }

    Ok(())
}

fn remove(path: &Path) -> Result<(), DispatchError> {
    fs::remove_file(path).map_err(|source| DispatchError::Remove {
        path: path.to_path_buf(),
        source,
    })
}
