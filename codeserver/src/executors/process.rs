use super::{Exit, ExitState, ExecutorError, Workers};
use nix::{
    errno::Errno,
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use std::process::{Command, Stdio};
use tracing::{debug, trace, warn};

/// Workers backed by plain OS child processes
#[derive(Debug, Default)]
pub struct ProcessWorkers;

impl ProcessWorkers {
    pub fn new() -> Self {
        Self
    }
}

impl Workers for ProcessWorkers {
    fn launch(&mut self, mut command: Command) -> Result<Pid, ExecutorError> {
        let child = command
            .stdin(Stdio::null())
            .spawn()
            .map_err(ExecutorError::Spawn)?;
        // the child is reaped through waitpid, dropping the handle neither waits nor kills
        let pid = Pid::from_raw(child.id() as i32);

        debug!(pid = %pid, program = ?command.get_program(), "Spawned generation process");

        Ok(pid)
    }

    fn reap(&mut self, block: bool) -> Result<Option<Exit>, ExecutorError> {
        let flags = if block { None } else { Some(WaitPidFlag::WNOHANG) };

        loop {
            match waitpid(Pid::from_raw(-1), flags) {
                Ok(WaitStatus::Exited(pid, 0)) => {
                    return Ok(Some(Exit {
                        pid,
                        state: ExitState::Success,
                    }))
                }
                Ok(WaitStatus::Exited(pid, code)) => {
                    return Ok(Some(Exit {
                        pid,
                        state: ExitState::Failed(code),
                    }))
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    return Ok(Some(Exit {
                        pid,
                        state: ExitState::Signaled(signal),
                    }))
                }
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(status) => trace!(status = ?status, "Ignoring non-terminal wait status"),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(None),
                Err(error) => return Err(ExecutorError::Wait(error)),
            }
        }
    }

    fn reclaim(&mut self, pid: Pid) -> Result<(), ExecutorError> {
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(source) => return Err(ExecutorError::Kill { pid, source }),
        }

        loop {
            match waitpid(pid, None) {
                Ok(status) => {
                    debug!(pid = %pid, status = ?status, "Reclaimed generation process");
                    return Ok(());
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    warn!(pid = %pid, "Generation process was already collected");
                    return Ok(());
                }
                Err(error) => return Err(ExecutorError::Wait(error)),
            }
        }
    }
}
