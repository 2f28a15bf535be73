use crate::{executors, location::Location};
use std::{
    path::Path,
    process::{Command, Stdio},
    time::Duration,
};
use tracing::{debug, error, warn};
use wait_timeout::ChildExt;

/// Build the scp invocation relaying `file` to `target`
pub fn copy_command(file: &Path, target: &Location) -> Command {
    let mut command = Command::new("scp");

    if !target.port.is_empty() {
        command.arg("-P").arg(&target.port);
    }
    command.arg(file).arg(target.copy_target());

    command
}

/// Relay a result file to the reply location.
///
/// Delivery is at-most-once: failures and timeouts are logged, never escalated.
pub fn copy(file: &Path, target: &Location, timeout: Duration) {
    let mut command = copy_command(file, target);

    let mut child = match command.stdin(Stdio::null()).spawn() {
        Ok(child) => child,
        Err(error) => {
            error!(path = ?file, target = %target, error = ?error, "Failed to spawn remote copy");
            return;
        }
    };

    match child.wait_timeout(timeout) {
        Ok(Some(status)) if status.success() => {
            debug!(path = ?file, target = %target, "Relayed result")
        }
        Ok(Some(status)) => {
            error!(path = ?file, target = %target, status = ?status, "Remote copy failed")
        }
        Ok(None) => {
            warn!(path = ?file, target = %target, "Remote copy timed out, killing it");
            if let Err(error) = executors::reclaim_child(&mut child) {
                error!(error = ?error, "Failed to reclaim remote copy");
            }
        }
        Err(error) => {
            error!(path = ?file, error = ?error, "Failed to wait for remote copy");
            if let Err(error) = executors::reclaim_child(&mut child) {
                error!(error = ?error, "Failed to reclaim remote copy");
            }
        }
    }
}
