use crate::message::Message;
use nix::unistd::Pid;
use std::collections::HashMap;
use thiserror::Error;


#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlaveListError {
    #[error("malformed slave list entry '{0}'")]
    MalformedEntry(String),
    #[error("invalid host in slave list entry '{0}'")]
    InvalidHost(String),
    #[error("slave list '{0}' does not define any slot")]
    Empty(String),
}

/// A launched generation process and the request it works on
#[derive(Debug, Clone)]
pub struct Worker {
    pub pid: Pid,
    /// timestep the request was submitted with
    pub step: i64,
    /// the request, written back as result once the process exited
    pub message: Message,
}

/// One unit of generation capacity, named `<host>_<instance>`
#[derive(Debug, Clone)]
pub struct Slot {
    name: String,
    pub worker: Option<Worker>,
}

impl Slot {
    fn new(name: String) -> Self {
        Self { name, worker: None }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_idle(&self) -> bool {
        self.worker.is_none()
    }

    /// machine the slot runs on, i.e. the name without the trailing `_<instance>`
    pub fn machine(&self) -> &str {
        self.name
            .rsplit_once('_')
            .map_or(self.name.as_str(), |(machine, _)| machine)
    }
}

/// Fixed, ordered set of slots of one session
#[derive(Debug, Default)]
pub struct Pool {
    slots: Vec<Slot>,
    // pid -> index into `slots`
    workers: HashMap<Pid, usize>,
}

impl Pool {
    /// Parse `host count, host count, ...` into a pool.
    ///
    /// Slots are emitted in declaration order, `count` slots per host named `host_1..host_count`.
    /// Any malformed entry fails the whole list.
    pub fn parse(spec: &str) -> Result<Self, SlaveListError> {
        let mut slots = Vec::new();

        for entry in spec.split(',') {
            let mut tokens = entry.split_whitespace();
            let (host, count) = match (tokens.next(), tokens.next(), tokens.next()) {
                (Some(host), Some(count), None) => (host, count),
                _ => return Err(SlaveListError::MalformedEntry(entry.trim().to_owned())),
            };
            // hosts end up as ssh arguments
            if host.starts_with('-') {
                return Err(SlaveListError::InvalidHost(entry.trim().to_owned()));
            }
            let count = count
                .parse::<u32>()
                .map_err(|_| SlaveListError::MalformedEntry(entry.trim().to_owned()))?;

            slots.extend((1..=count).map(|instance| Slot::new(format!("{host}_{instance}"))));
        }

        if slots.is_empty() {
            return Err(SlaveListError::Empty(spec.to_owned()));
        }

        Ok(Self {
            slots,
            workers: HashMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(Slot::name)
    }

    pub fn busy(&self) -> usize {
        self.workers.len()
    }

    /// first idle slot in declaration order
    pub fn first_idle(&self) -> Option<usize> {
        self.slots.iter().position(Slot::is_idle)
    }

    pub fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    /// Bind a launched worker to an idle slot
    pub fn assign(&mut self, index: usize, worker: Worker) {
        debug_assert!(self.slots[index].is_idle());

        self.workers.insert(worker.pid, index);
        self.slots[index].worker = Some(worker);
    }

    /// Release the worker with `pid`, returning the slot index and the worker
    pub fn release(&mut self, pid: Pid) -> Option<(usize, Worker)> {
        let index = self.workers.remove(&pid)?;

        self.slots[index].worker.take().map(|worker| (index, worker))
    }

    /// pids of all live workers, in slot order
    pub fn live_workers(&self) -> Vec<Pid> {
        self.slots
            .iter()
            .filter_map(|slot| slot.worker.as_ref().map(|worker| worker.pid))
            .collect()
    }
}
