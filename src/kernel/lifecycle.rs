//! Process lifecycle syscalls
//!
//! fork, execv, _exit, waitpid, getpid and getppid.
//!
//! Parent/child bookkeeping is guarded by the parent's `children` lock:
//! linking, reparenting and reaping a child, and the parent's "has a
//! child exited" wakeup all happen under it. A process publishes its own
//! exit status while holding its own `children` lock, so a concurrent fork
//! in the same process can never link a child to a process that is
//! already gone.

use super::dispatch::TrapFrame;
use super::error::{SyscallError, SyscallResult};
use super::loader::{marshal_args, UserEntry};
use super::process::{DescriptorTable, Pid, Process, ProcessState};
use super::proctable::INIT_PID;
use super::syscall::Kernel;
use super::thread::SavedContext;
use super::usermem::{AddressSpace, UserPtr};
use crate::vfs::{OpenOptions, Vnode};
use log::{debug, info, warn};
use std::sync::{Arc, Weak};

pub const WNOHANG: i32 = 1;

/// Flags for waitpid
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitFlags {
    /// Return immediately if no child has exited
    pub nohang: bool,
}

impl WaitFlags {
    pub const NONE: WaitFlags = WaitFlags { nohang: false };
    pub const NOHANG: WaitFlags = WaitFlags { nohang: true };

    pub fn from_raw(options: i32) -> SyscallResult<Self> {
        if options & !WNOHANG != 0 {
            return Err(SyscallError::InvalidArgument);
        }
        Ok(Self {
            nohang: options & WNOHANG != 0,
        })
    }
}

impl Kernel {
    // ========== PROCESS CREATION ==========

    /// Create the init process (pid 1)
    pub fn spawn_init(&self) -> SyscallResult<Arc<Process>> {
        if self.processes.init().is_some() {
            return Err(SyscallError::AlreadyExists);
        }
        self.spawn_process("init")
    }

    /// Create a process with a fresh, empty address space
    ///
    /// The first process created is init; later ones become its
    /// children. The process starts with one thread, its cwd at the
    /// root, and no open files.
    pub fn spawn_process(&self, name: &str) -> SyscallResult<Arc<Process>> {
        let pid = self.processes.alloc_pid()?;

        let space = match self.spaces.create() {
            Ok(space) => space,
            Err(e) => {
                self.processes.release_pid(pid);
                return Err(e.into());
            }
        };
        let root = match self.fs.root() {
            Ok(root) => root,
            Err(e) => {
                self.processes.release_pid(pid);
                return Err(e.into());
            }
        };

        let process = Arc::new(Process::new(
            pid,
            name,
            space,
            DescriptorTable::new(self.config.open_max),
            Some(root),
        ));
        process.attach_thread();

        match self.processes.init().filter(|_| pid != INIT_PID) {
            Some(init) => {
                let mut children = init.children();
                if init.is_running() {
                    process.set_parent(Arc::downgrade(&init));
                    children.push(Arc::clone(&process));
                }
                self.processes.install(Arc::clone(&process));
            }
            None => self.processes.install(Arc::clone(&process)),
        }

        info!("spawned {} (pid {})", name, pid);
        Ok(process)
    }

    /// Clone `cur`; returns the child's pid
    ///
    /// The child gets a copy of the address space, the same open files
    /// (shared entries), the same cwd, and resumes from `frame` with a
    /// return value of 0 on a thread from the launcher.
    pub fn sys_fork(
        self: &Arc<Self>,
        cur: &Arc<Process>,
        frame: &TrapFrame,
    ) -> SyscallResult<Pid> {
        let pid = self.processes.alloc_pid()?;

        let space = match cur.with_space(|space| Ok(space.try_clone()?)) {
            Ok(space) => space,
            Err(e) => {
                warn!("fork: pid {} address space copy failed", cur.pid());
                self.processes.release_pid(pid);
                return Err(e);
            }
        };

        let files = self.dup_descriptors(cur);
        let cwd = cur.cwd().as_ref().map(|dir| self.fs.retain(dir));
        let child = Arc::new(Process::new(pid, cur.name(), space, files, cwd));
        let ctx = SavedContext::snapshot(frame);

        // Held until the child is fully linked or fully unwound, so no
        // waiter (and no exiting child) sees it half-created
        let mut children = cur.children();

        let launched = if cur.is_running() {
            child.set_parent(Arc::downgrade(cur));
            child.attach_thread();
            self.threads
                .launch(Arc::clone(self), Arc::clone(&child), ctx)
                .map_err(|e| {
                    warn!("fork: pid {} launch failed: {}", cur.pid(), e);
                    child.detach_thread();
                    SyscallError::NoMemory
                })
        } else {
            Err(SyscallError::NoProcess)
        };

        if let Err(e) = launched {
            drop(children);
            child.set_parent(Weak::new());
            self.close_all(&child);
            drop(child.take_space());
            self.processes.release_pid(pid);
            return Err(e);
        }

        children.push(Arc::clone(&child));
        self.processes.install(child);
        drop(children);

        info!("pid {} forked pid {}", cur.pid(), pid);
        Ok(pid)
    }

    /// Entry point of a forked child's thread
    ///
    /// Activates the child's address space and returns the frame to
    /// resume user mode with.
    pub fn enter_forked_process(&self, child: &Process, ctx: SavedContext) -> TrapFrame {
        let activated = child.with_space(|space| {
            space.activate();
            Ok(())
        });
        if activated.is_err() {
            warn!("pid {} entered without an address space", child.pid());
        }
        debug!("pid {} entering user mode", child.pid());
        ctx.into_child_frame()
    }

    /// Retain every open file `cur` has and copy its descriptor table
    fn dup_descriptors(&self, cur: &Process) -> DescriptorTable {
        let files = cur.files();
        for (_, handle) in files.iter() {
            self.retain_bound(handle);
        }
        files.clone()
    }

    // ========== EXEC ==========

    /// Replace `cur`'s image
    ///
    /// On success the old address space is gone and the returned entry
    /// describes where user mode resumes. On failure nothing about `cur`
    /// has changed.
    pub fn sys_execv(
        &self,
        cur: &Process,
        path: UserPtr,
        argv: UserPtr,
    ) -> SyscallResult<UserEntry> {
        if path.is_null() {
            return Err(SyscallError::Fault);
        }
        let path = cur.copy_in_str(path, self.config.path_max)?;
        let args =
            cur.copy_in_argv(argv, self.config.user_pointer_width, self.config.arg_max)?;

        let image = {
            let cwd = cur.cwd();
            self.fs.open(cwd.as_ref(), &path, OpenOptions::new(), 0)?
        };
        let built = self.build_image(image.as_ref(), &args);
        self.close_node(image);
        let (space, entry) = built?;

        // Point of no return
        let old = cur.replace_space(space);
        cur.with_space(|space| {
            space.activate();
            Ok(())
        })?;
        drop(old);
        cur.set_name(path.rsplit('/').next().unwrap_or(&path));

        info!("pid {} exec {} argc={}", cur.pid(), path, args.len());
        Ok(entry)
    }

    fn build_image(
        &self,
        image: &dyn Vnode,
        args: &[String],
    ) -> SyscallResult<(Box<dyn AddressSpace>, UserEntry)> {
        let mut space = self.spaces.create()?;
        let entry = self.loader.load(image, space.as_mut())?;
        let top = space.define_stack()?;
        let (stack, argv) =
            marshal_args(space.as_mut(), top, args, self.config.user_pointer_width)?;

        Ok((
            space,
            UserEntry {
                entry,
                stack,
                argc: args.len(),
                argv,
            },
        ))
    }

    // ========== EXIT / WAIT ==========

    /// Terminate `cur` with the low 8 bits of `status`
    ///
    /// Everything but the PCB shell is released here. The calling thread
    /// must not return to user mode afterwards.
    pub fn sys_exit(&self, cur: &Arc<Process>, status: i32) {
        let status = status & 0xff;
        if !cur.is_running() {
            warn!("pid {} exited twice", cur.pid());
            return;
        }
        info!("pid {} exit {}", cur.pid(), status);

        self.close_all(cur);
        drop(cur.take_space());
        cur.detach_thread();

        let init = self
            .processes
            .init()
            .filter(|init| !Arc::ptr_eq(init, cur));
        {
            let mut children = cur.children();
            let orphans = std::mem::take(&mut *children);
            self.reparent(orphans, init.as_ref());
            cur.exit_signal().publish(status);
        }

        self.notify_parent(cur);
    }

    /// Hand `orphans` to init, or cut them loose when there is no init
    fn reparent(&self, orphans: Vec<Arc<Process>>, init: Option<&Arc<Process>>) {
        if orphans.is_empty() {
            return;
        }

        if let Some(init) = init {
            let mut adopted = init.children();
            if init.is_running() {
                let mut exited = false;
                for orphan in orphans {
                    info!("pid {} reparented to init", orphan.pid());
                    orphan.set_parent(Arc::downgrade(init));
                    exited |= !orphan.is_running();
                    adopted.push(orphan);
                }
                if exited {
                    init.notify_child_exited();
                }
                return;
            }
        }

        for orphan in orphans {
            orphan.set_parent(Weak::new());
            if !orphan.is_running() {
                self.reap_orphan(&orphan);
            }
        }
    }

    /// Wake whoever may wait for `cur`, or reap it if nobody can
    fn notify_parent(&self, cur: &Arc<Process>) {
        loop {
            let Some(parent) = cur.parent() else {
                self.reap_orphan(cur);
                return;
            };

            let children = parent.children();
            if children.iter().any(|c| Arc::ptr_eq(c, cur)) {
                parent.notify_child_exited();
                return;
            }
            // Reparented or reaped meanwhile; the link is updated under
            // the lock just released, so the next look sees it
        }
    }

    /// Reap a process nobody will wait for
    fn reap_orphan(&self, process: &Process) {
        if process.exit_signal().claim().is_some() {
            self.processes.remove(process.pid());
            info!("pid {} reaped (no parent)", process.pid());
        }
    }

    /// Wait for a child to exit and reap it
    ///
    /// `pid` -1 waits for any child. With `WNOHANG` and no exited child,
    /// returns pid 0. The status is written to `status` (when non-null)
    /// before the child is reaped; a fault leaves the child unreaped.
    pub fn sys_waitpid(
        &self,
        cur: &Process,
        pid: Pid,
        status: UserPtr,
        options: i32,
    ) -> SyscallResult<Pid> {
        let flags = WaitFlags::from_raw(options)?;

        let child = match pid.0 {
            -1 => match self.wait_any(cur, flags)? {
                Some(child) => child,
                None => return Ok(Pid(0)),
            },
            p if p > 0 => {
                let child = cur.children().iter().find(|c| c.pid() == pid).cloned();
                let Some(child) = child else {
                    return Err(if self.processes.get(pid).is_some() {
                        SyscallError::NoChild
                    } else {
                        SyscallError::NoProcess
                    });
                };
                if flags.nohang {
                    if child.is_running() {
                        return Ok(Pid(0));
                    }
                } else {
                    child.exit_signal().wait_terminated();
                }
                child
            }
            _ => return Err(SyscallError::InvalidArgument),
        };

        let ProcessState::Terminated(code) = child.state() else {
            // Reaped by another thread of this process
            return Err(SyscallError::NoProcess);
        };
        if !status.is_null() {
            cur.copy_out(&code.to_le_bytes(), status)?;
        }
        self.reap(cur, &child)?;
        Ok(child.pid())
    }

    /// Block until some child has exited; `None` if `nohang` and none has
    fn wait_any(&self, cur: &Process, flags: WaitFlags) -> SyscallResult<Option<Arc<Process>>> {
        let mut children = cur.children();
        loop {
            if children.is_empty() {
                return Err(SyscallError::NoChild);
            }
            if let Some(child) = children
                .iter()
                .find(|c| matches!(c.state(), ProcessState::Terminated(_)))
            {
                return Ok(Some(Arc::clone(child)));
            }
            if flags.nohang {
                return Ok(None);
            }
            children = cur.wait_for_child(children);
        }
    }

    /// Terminated -> Reaped: unlink from `parent` and the process table
    fn reap(&self, parent: &Process, child: &Arc<Process>) -> SyscallResult<()> {
        let mut children = parent.children();
        if child.exit_signal().claim().is_none() {
            return Err(SyscallError::NoProcess);
        }
        children.retain(|c| !Arc::ptr_eq(c, child));
        child.set_parent(Weak::new());
        self.processes.remove(child.pid());
        drop(children);

        info!("pid {} reaped by pid {}", child.pid(), parent.pid());
        Ok(())
    }

    pub fn sys_getpid(&self, cur: &Process) -> Pid {
        cur.pid()
    }

    /// Parent pid, 0 for a process without one
    pub fn sys_getppid(&self, cur: &Process) -> Pid {
        cur.ppid()
    }
}
