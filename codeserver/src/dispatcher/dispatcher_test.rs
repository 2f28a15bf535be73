use super::{DispatchError, Dispatcher, Tick};
use crate::{
    config::DispatcherConfig,
    executors::{Exit, ExitState, ExecutorError, Workers},
    message::{Message, MessageStatus, SessionSignature, Value},
    session::{Session, REPLY_URL, SERVER_URL, SLAVE_LIST, SLAVE_PATH, TARGET_URL},
    transport::{frame, inbox::Inbox, read_frame},
};
use assert_matches::assert_matches;
use nix::{sys::signal::Signal, unistd::Pid};
use std::{
    collections::{BTreeMap, VecDeque},
    ffi::OsString,
    fs,
    io::Cursor,
    process::Command,
};
use tempfile::TempDir;

/// Workers that never spawn anything, exits are queued by the test
#[derive(Default)]
struct ScriptedWorkers {
    last_pid: i32,
    launched: Vec<(Pid, OsString, Vec<OsString>)>,
    exits: VecDeque<Exit>,
    reclaimed: Vec<Pid>,
}

impl ScriptedWorkers {
    fn finish(&mut self, pid: Pid, state: ExitState) {
        self.exits.push_back(Exit { pid, state });
    }
}

impl Workers for ScriptedWorkers {
    fn launch(&mut self, command: Command) -> Result<Pid, ExecutorError> {
        self.last_pid += 1;
        let pid = Pid::from_raw(1000 + self.last_pid);
        self.launched.push((
            pid,
            command.get_program().to_owned(),
            command.get_args().map(|arg| arg.to_owned()).collect(),
        ));

        Ok(pid)
    }

    fn reap(&mut self, _block: bool) -> Result<Option<Exit>, ExecutorError> {
        Ok(self.exits.pop_front())
    }

    fn reclaim(&mut self, pid: Pid) -> Result<(), ExecutorError> {
        self.reclaimed.push(pid);
        Ok(())
    }
}

struct Harness {
    dir: TempDir,
    inbox: Inbox,
    dispatcher: Dispatcher<ScriptedWorkers>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let inbox = Inbox::new(dir.path());
        let mut settings = DispatcherConfig {
            log_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        settings.setup.script = None;

        Self {
            dispatcher: Dispatcher::new(inbox.clone(), settings, ScriptedWorkers::default()),
            inbox,
            dir,
        }
    }

    fn started(slave_list: &str) -> Self {
        let mut harness = Self::new();
        harness.init(slave_list);
        assert_eq!(harness.tick(), Tick::Initialized);
        harness
    }

    fn init(&self, slave_list: &str) {
        let cfg = [
            (SERVER_URL, "ssh://a/tmp/codegen"),
            (TARGET_URL, "ssh://target/scratch/out"),
            (REPLY_URL, "dir:///tmp/replies"),
            (SLAVE_LIST, slave_list),
            (SLAVE_PATH, "/tmp/slaves"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect::<BTreeMap<_, _>>();
        let message = Message::session(SessionSignature {
            name: "gemm".into(),
            cfg,
        });

        fs::write(self.inbox.init_path(), frame(&message).unwrap()).unwrap();
    }

    fn request(&self, step: i64, point: Vec<Value>) {
        fs::write(
            self.inbox.request_path(step),
            frame(&Message::fetch(point)).unwrap(),
        )
        .unwrap();
    }

    fn tick(&mut self) -> Tick {
        let tick = self.dispatcher.tick().unwrap();
        self.assert_occupancy();
        tick
    }

    fn session(&self) -> &Session {
        self.dispatcher.session().unwrap()
    }

    fn pid_of(&self, slot: usize) -> Pid {
        self.session().pool.slot(slot).worker.as_ref().unwrap().pid
    }

    fn names(&self) -> Vec<String> {
        self.session().pool.names().map(str::to_owned).collect()
    }

    fn assert_occupancy(&self) {
        if let Some(session) = self.dispatcher.session() {
            assert_eq!(session.pool.busy() + session.ready, session.pool.len());
        }
    }

    fn result(&self, step: i64) -> Message {
        let bytes = fs::read(self.inbox.result_path(step)).unwrap();
        let (_, payload) = read_frame(&mut Cursor::new(bytes)).unwrap();
        Message::decode(&payload).unwrap()
    }
}

#[test]
fn two_slots_three_requests() {
    let mut harness = Harness::started("a 2");
    assert_eq!(harness.names(), ["a_1", "a_2"]);

    harness.request(0, vec![Value::Int(0)]);
    assert_eq!(
        harness.tick(),
        Tick::Dispatched {
            slot: "a_1".into(),
            step: 0
        }
    );
    assert_eq!(harness.session().ready, 1);

    // a_1 finishes while a_2 gets its request, the saturated wait picks it up
    let first = harness.pid_of(0);
    harness
        .dispatcher
        .workers()
        .finish(first, ExitState::Success);
    harness.request(1, vec![Value::Int(1)]);
    assert_eq!(
        harness.tick(),
        Tick::Dispatched {
            slot: "a_2".into(),
            step: 1
        }
    );
    assert_eq!(harness.session().ready, 1);
    assert!(harness.session().pool.slot(0).is_idle());

    let result = harness.result(0);
    assert_eq!(result.status, MessageStatus::Ok);
    assert_eq!(result.point, [Value::Int(0)]);
    assert!(!harness.inbox.result_path(1).exists());

    // the pool fills up again with a_1, the saturated wait collects a_2
    let second = harness.pid_of(1);
    harness
        .dispatcher
        .workers()
        .finish(second, ExitState::Success);
    harness.request(2, vec![Value::Int(2)]);
    assert_eq!(
        harness.tick(),
        Tick::Dispatched {
            slot: "a_1".into(),
            step: 2
        }
    );
    assert_eq!(harness.session().timestep, 3);
    assert_eq!(harness.session().ready, 1);
    assert!(harness.session().pool.slot(1).is_idle());
    assert!(!harness.inbox.request_path(2).exists());
    assert_eq!(harness.result(1).point, [Value::Int(1)]);
    assert!(!harness.inbox.result_path(2).exists());
}

#[test]
fn idle_sweep_frees_slots() {
    let mut harness = Harness::started("a 2");
    harness.request(0, vec![Value::Int(7), Value::Int(3)]);
    harness.tick();

    let pid = harness.pid_of(0);
    harness.dispatcher.workers().finish(pid, ExitState::Success);

    assert_eq!(harness.tick(), Tick::Idle);
    assert_eq!(harness.session().ready, 2);
    assert_eq!(harness.result(0).point, [Value::Int(7), Value::Int(3)]);
}

#[test]
fn local_slot_runs_script_directly() {
    let mut harness = Harness::started("a 1, b 1");
    harness.request(0, vec![Value::Int(4), Value::Int(8)]);
    harness.request(1, vec![Value::Int(1)]);
    harness.tick();

    let pid = harness.pid_of(0);
    harness.dispatcher.workers().finish(pid, ExitState::Success);
    harness.tick();

    let launched = &harness.dispatcher.workers().launched;
    assert_eq!(launched[0].1, "/tmp/slaves/a_1_gemm/chill_script.gemm.sh");
    assert_eq!(launched[0].2[0], "4 8");
    assert_eq!(launched[1].1, "ssh");
    assert_eq!(launched[1].2[0], "b");
}

#[test]
fn corrupted_request_leaves_slots_alone() {
    let mut harness = Harness::started("a 2");
    let mut bytes = frame(&Message::fetch(vec![Value::Int(1)])).unwrap();
    bytes[0] ^= 0xff;
    fs::write(harness.inbox.request_path(0), bytes).unwrap();

    assert_eq!(harness.tick(), Tick::Skipped { step: 0 });
    assert_eq!(harness.session().ready, 2);
    assert_eq!(harness.session().pool.busy(), 0);
    assert!(harness.dispatcher.workers().launched.is_empty());
    assert!(!harness.inbox.request_path(0).exists());
    assert_eq!(harness.tick(), Tick::Idle);
}

#[test]
fn incomplete_request_is_read_again() {
    let mut harness = Harness::started("a 2");
    let bytes = frame(&Message::fetch(vec![Value::Int(9)])).unwrap();
    let path = harness.inbox.request_path(0);

    for written in [3, bytes.len() - 1] {
        fs::write(&path, &bytes[..written]).unwrap();

        assert_eq!(harness.tick(), Tick::Idle);
        assert!(path.exists());
        assert_eq!(harness.session().timestep, 0);
    }

    fs::write(&path, &bytes).unwrap();
    assert_eq!(
        harness.tick(),
        Tick::Dispatched {
            slot: "a_1".into(),
            step: 0
        }
    );
    assert_eq!(harness.dispatcher.workers().launched.len(), 1);
}

#[test]
fn failed_generation_is_fatal() {
    let mut harness = Harness::started("a 1");
    harness.request(0, vec![Value::Int(1)]);
    harness
        .dispatcher
        .workers()
        .finish(Pid::from_raw(1001), ExitState::Failed(2));

    assert_matches!(
        harness.dispatcher.tick(),
        Err(DispatchError::WorkerFailed { slot, state: ExitState::Failed(2), .. }) if slot == "a_1"
    );
}

#[test]
fn killed_generation_is_fatal() {
    let mut harness = Harness::started("a 2");
    harness.request(0, vec![Value::Int(1)]);
    harness.tick();

    let pid = harness.pid_of(0);
    harness
        .dispatcher
        .workers()
        .finish(pid, ExitState::Signaled(Signal::SIGKILL));

    assert_matches!(
        harness.dispatcher.tick(),
        Err(DispatchError::WorkerFailed { .. })
    );
}

#[test]
fn unknown_process_is_fatal() {
    let mut harness = Harness::started("a 1");
    harness.request(0, vec![Value::Int(1)]);
    harness
        .dispatcher
        .workers()
        .finish(Pid::from_raw(77), ExitState::Success);

    assert_matches!(
        harness.dispatcher.tick(),
        Err(DispatchError::UnknownWorker(pid)) if pid == Pid::from_raw(77)
    );
}

#[test]
fn saturated_without_exit_is_a_violation() {
    let mut harness = Harness::started("a 1");
    harness.request(0, vec![Value::Int(1)]);

    assert_matches!(
        harness.dispatcher.tick(),
        Err(DispatchError::InvariantViolation(_))
    );
}

#[test]
fn invalid_init_keeps_previous_session() {
    let mut harness = Harness::started("a 2");
    harness.request(0, vec![Value::Int(1)]);
    harness.tick();

    harness.init("a 2x");
    assert_eq!(harness.tick(), Tick::InitRejected);
    assert!(!harness.inbox.init_path().exists());

    assert_eq!(harness.names(), ["a_1", "a_2"]);
    assert_eq!(harness.session().timestep, 1);
    assert_eq!(harness.session().ready, 1);
    assert!(harness.dispatcher.workers().reclaimed.is_empty());
}

#[test]
fn reinitialization_replaces_pool() {
    let mut harness = Harness::started("a 2, b 1");
    let before = harness.names();
    harness.request(0, vec![Value::Int(1)]);
    harness.tick();
    let live = harness.pid_of(0);

    harness.init("a 2, b 1");
    assert_eq!(harness.tick(), Tick::Initialized);

    assert_eq!(harness.names(), before);
    assert_eq!(harness.session().timestep, 0);
    assert_eq!(harness.session().ready, 3);
    assert_eq!(harness.dispatcher.workers().reclaimed, [live]);
}

#[test]
fn requests_wait_for_a_session() {
    let mut harness = Harness::new();
    harness.request(0, vec![Value::Int(1)]);

    assert_eq!(harness.tick(), Tick::Idle);
    assert!(harness.dispatcher.session().is_none());
    assert!(harness.inbox.request_path(0).exists());
}

#[test]
fn prepare_purges_stale_requests() {
    let mut harness = Harness::new();
    harness.request(3, vec![Value::Int(1)]);
    harness.init("a 1");

    harness.dispatcher.prepare().unwrap();

    assert!(!harness.inbox.request_path(3).exists());
    assert!(harness.inbox.init_path().exists());
}

#[test]
fn generation_log_records_iterations() {
    let mut harness = Harness::started("a 2");
    harness.request(0, vec![Value::Int(5), Value::Int(6)]);
    harness.tick();

    let log = fs::read_to_string(harness.dir.path().join("generation.gemm.log")).unwrap();
    assert!(log.contains("The list of available machines: a_1 a_2"));
    assert!(log.contains("a_1: 5 6"));
    assert!(log.contains("Total time for iteration 0 : "));
}
