use crate::{message::Value, pool::Slot, session::SessionConfig};
use itertools::Itertools;
use std::process::Command;

/// Working directory of a slot on its machine, `<slave_path>/<slot>_<app>`
pub fn workdir(session: &SessionConfig, slot: &Slot) -> String {
    format!("{}/{}_{}", session.slave_path, slot.name(), session.app_name)
}

/// Build the generation command for `point` on `slot`.
///
/// Local slots run the per-host script directly, remote slots run it through `ssh <machine>`.
/// The arguments are always
/// `<values> <machine> <workdir> <target host> <target path>`,
/// where `<values>` is the whole point as one space separated word.
pub fn build(session: &SessionConfig, slot: &Slot, point: &[Value]) -> Command {
    let machine = slot.machine();
    let workdir = workdir(session, slot);
    let script = format!("{workdir}/chill_script.{}.sh", session.app_name);
    let values = point.iter().join(" ");

    let arguments = [
        values.as_str(),
        machine,
        workdir.as_str(),
        session.target.host.as_str(),
        session.target.path.as_str(),
    ];

    if machine == session.local.host {
        let mut command = Command::new(script);
        command.args(arguments);
        command
    } else {
        // ssh hands its arguments to the remote shell as a single line
        let mut command = Command::new("ssh");
        command
            .arg(machine)
            .arg("exec")
            .arg(shell_quote(&script))
            .args(arguments.iter().map(|argument| shell_quote(argument)));
        command
    }
}

/// Quote a word for a POSIX shell, plain words are left untouched
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || b"-_./=:@,+%".contains(&byte));

    if plain {
        word.to_owned()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
