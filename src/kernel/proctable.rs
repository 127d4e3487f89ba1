//! Process table
//!
//! Maps pids to live process control blocks under one table-wide lock.
//! A pid is reserved before its process exists, so a half-built child is
//! never visible to lookups; installing it is the single step that makes
//! it reachable.

use super::error::{SyscallError, SyscallResult};
use super::lock;
use super::process::{Pid, Process};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Largest pid handed out before wrapping
pub const PID_MAX: i32 = 32767;

/// Pid of the init process
pub const INIT_PID: Pid = Pid(1);

struct TableInner {
    procs: HashMap<Pid, Arc<Process>>,
    reserved: HashSet<Pid>,
    next_pid: i32,
}

pub struct ProcessTable {
    inner: Mutex<TableInner>,
    max: usize,
}

impl ProcessTable {
    pub fn new(max: usize) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                procs: HashMap::new(),
                reserved: HashSet::new(),
                next_pid: INIT_PID.0,
            }),
            max,
        }
    }

    /// Reserve a fresh pid
    ///
    /// Fails `ENOMEM` once `max` processes (live, zombie or reserved)
    /// exist.
    pub fn alloc_pid(&self) -> SyscallResult<Pid> {
        let mut inner = lock(&self.inner);
        if inner.procs.len() + inner.reserved.len() >= self.max {
            return Err(SyscallError::NoMemory);
        }

        // At most one pass over the pid space
        for _ in 0..PID_MAX {
            let pid = Pid(inner.next_pid);
            inner.next_pid = if inner.next_pid >= PID_MAX {
                // Wrap past init
                INIT_PID.0 + 1
            } else {
                inner.next_pid + 1
            };
            if !inner.procs.contains_key(&pid) && !inner.reserved.contains(&pid) {
                inner.reserved.insert(pid);
                return Ok(pid);
            }
        }
        Err(SyscallError::NoMemory)
    }

    /// Give back a reserved pid that was never installed
    pub fn release_pid(&self, pid: Pid) {
        lock(&self.inner).reserved.remove(&pid);
    }

    /// Make a process reachable under its reserved pid
    pub fn install(&self, process: Arc<Process>) {
        let mut inner = lock(&self.inner);
        let pid = process.pid();
        let was_reserved = inner.reserved.remove(&pid);
        debug_assert!(was_reserved, "pid {} installed without reservation", pid);
        inner.procs.insert(pid, process);
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<Process>> {
        lock(&self.inner).procs.get(&pid).cloned()
    }

    pub fn remove(&self, pid: Pid) -> Option<Arc<Process>> {
        lock(&self.inner).procs.remove(&pid)
    }

    pub fn init(&self) -> Option<Arc<Process>> {
        self.get(INIT_PID)
    }

    /// Installed processes (zombies included)
    pub fn len(&self) -> usize {
        lock(&self.inner).procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = lock(&self.inner).procs.keys().copied().collect();
        pids.sort();
        pids
    }
}
