pub mod command;
mod process;

pub use process::ProcessWorkers;

use nix::{sys::signal::Signal, unistd::Pid};
use std::{
    io,
    process::{Child, Command, ExitStatus},
};
use thiserror::Error;
use tracing::debug;

// tests spawning children must not overlap with tests reaping any child
#[cfg(test)]
pub(crate) static SERIAL: parking_lot::Mutex<()> = parking_lot::const_mutex(());

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("failed to spawn generation process: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to wait for generation processes: {0}")]
    Wait(#[source] nix::Error),
    #[error("failed to kill generation process {pid}: {source}")]
    Kill { pid: Pid, source: nix::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Success,
    Failed(i32),
    Signaled(Signal),
}

impl ExitState {
    pub fn success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Exit notification of one child process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    pub pid: Pid,
    pub state: ExitState,
}

/// Spawns generation processes and observes their exits.
///
/// The dispatcher only learns about finished work through `reap`, nothing is shared with the
/// spawned processes.
pub trait Workers {
    /// start `command` detached from the caller, returning its pid
    fn launch(&mut self, command: Command) -> Result<Pid, ExecutorError>;

    /// Observe the exit of any child. With `block` unset this returns `None` immediately if no
    /// child has exited yet, with `block` set `None` means there is no child left to wait for.
    fn reap(&mut self, block: bool) -> Result<Option<Exit>, ExecutorError>;

    /// kill a child and collect its exit, used when a pool is discarded
    fn reclaim(&mut self, pid: Pid) -> Result<(), ExecutorError>;
}

/// Kill a helper child (setup, relay) and collect it.
///
/// Helpers are spawned next to the workers, one left behind would show up as an unknown exit.
pub fn reclaim_child(child: &mut Child) -> io::Result<ExitStatus> {
    if let Err(error) = child.kill() {
        debug!(pid = child.id(), error = ?error, "Helper process could not be killed");
    }

    child.wait()
}
