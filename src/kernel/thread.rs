//! Thread hand-off for forked children
//!
//! `fork` snapshots the parent's trap frame into a [`SavedContext`] and
//! gives it to a [`ThreadLauncher`]. The launched thread hands the context
//! back through `Kernel::enter_forked_process`, which consumes it and
//! returns the frame the child resumes with.

use super::dispatch::TrapFrame;
use super::lock;
use super::process::Process;
use super::syscall::Kernel;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// A parent's register state, owned by the child until it starts
///
/// Deliberately not `Clone`: it is consumed exactly once.
#[derive(Debug)]
pub struct SavedContext {
    frame: TrapFrame,
}

impl SavedContext {
    pub(crate) fn snapshot(frame: &TrapFrame) -> Self {
        Self { frame: *frame }
    }

    /// The frame the child resumes with: fork returns 0 there
    pub(crate) fn into_child_frame(self) -> TrapFrame {
        let mut frame = self.frame;
        frame.set_result(Ok(0));
        frame.advance_pc();
        frame
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("thread creation failed: {0}")]
pub struct LaunchError(pub String);

/// Starts a thread for a freshly forked process
pub trait ThreadLauncher: Send + Sync {
    /// Start `child`; the new thread must call
    /// `Kernel::enter_forked_process` with `ctx` before anything else
    fn launch(
        &self,
        kernel: Arc<Kernel>,
        child: Arc<Process>,
        ctx: SavedContext,
    ) -> Result<(), LaunchError>;
}

/// User code run by a forked child, starting from its resumed frame
pub type UserProgram = dyn Fn(&Arc<Kernel>, &Arc<Process>, TrapFrame) + Send + Sync;

/// Runs each forked child on its own host thread
///
/// A child whose program returns without calling exit exits with 0.
pub struct HostThreads {
    program: Arc<UserProgram>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    fail_launches: AtomicBool,
}

impl HostThreads {
    pub fn new(
        program: impl Fn(&Arc<Kernel>, &Arc<Process>, TrapFrame) + Send + Sync + 'static,
    ) -> Self {
        Self {
            program: Arc::new(program),
            handles: Mutex::new(Vec::new()),
            fail_launches: AtomicBool::new(false),
        }
    }

    /// Make every following launch fail
    pub fn set_fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    /// Join every thread launched so far, including ones launched while
    /// joining. Returns how many panicked.
    pub fn join_all(&self) -> usize {
        let mut panicked = 0;
        loop {
            let handles = std::mem::take(&mut *lock(&self.handles));
            if handles.is_empty() {
                return panicked;
            }
            for handle in handles {
                if handle.join().is_err() {
                    panicked += 1;
                }
            }
        }
    }
}

impl ThreadLauncher for HostThreads {
    fn launch(
        &self,
        kernel: Arc<Kernel>,
        child: Arc<Process>,
        ctx: SavedContext,
    ) -> Result<(), LaunchError> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(LaunchError("launches disabled".to_string()));
        }

        let program = Arc::clone(&self.program);
        let name = format!("pid-{}", child.pid());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let frame = kernel.enter_forked_process(&child, ctx);
                program(&kernel, &child, frame);
                if child.is_running() {
                    kernel.sys_exit(&child, 0);
                }
            })
            .map_err(|e| {
                warn!("host thread spawn failed: {}", e);
                LaunchError(e.to_string())
            })?;

        debug!("launched host thread {:?}", handle.thread().name());
        lock(&self.handles).push(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::dispatch::SyscallNr;

    #[test]
    fn test_child_frame_returns_zero() {
        let mut frame = TrapFrame::syscall(SyscallNr::Fork, &[]);
        frame.pc = 0x400100;
        frame.sp = 0x7fff_fff0;

        let child = SavedContext::snapshot(&frame).into_child_frame();
        assert_eq!(child.result(), 0);
        assert!(!child.error);
        assert_eq!(child.pc, 0x400104);
        assert_eq!(child.sp, 0x7fff_fff0);
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut frame = TrapFrame::syscall(SyscallNr::Fork, &[1, 2]);
        let ctx = SavedContext::snapshot(&frame);
        frame.args[0] = 99;
        assert_eq!(ctx.into_child_frame().args[0], 1);
    }
}
