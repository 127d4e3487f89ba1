//! Process abstraction
//!
//! A process owns:
//! - an address space (dropped at exit)
//! - a descriptor table naming open-file entries
//! - a current working directory
//! - its children, which hold only a weak reference back
//!
//! Lifecycle: Running -> Terminated(status) -> Reaped. The exit status is
//! published under the process's own state lock before anyone is woken, so
//! a waiter that sees `Terminated` always sees the final status.

use super::error::{SyscallError, SyscallResult};
use super::lock;
use super::object::{AccessMode, Handle};
use super::usermem::{self, AddressSpace, UserPtr};
use crate::vfs::{OpenOptions, Vnode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub i32);

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fd(pub i32);

impl Fd {
    pub const STDIN: Fd = Fd(0);
    pub const STDOUT: Fd = Fd(1);
    pub const STDERR: Fd = Fd(2);

    pub fn is_console(self) -> bool {
        (0..FIRST_FILE_FD).contains(&self.0)
    }
}

impl std::fmt::Display for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lowest descriptor that can name an open file
pub const FIRST_FILE_FD: i32 = 3;

pub const O_RDONLY: i32 = 0;
pub const O_WRONLY: i32 = 1;
pub const O_RDWR: i32 = 2;
pub const O_ACCMODE: i32 = 3;
pub const O_CREAT: i32 = 4;
pub const O_EXCL: i32 = 8;
pub const O_TRUNC: i32 = 16;
pub const O_APPEND: i32 = 32;

const O_KNOWN: i32 = O_ACCMODE | O_CREAT | O_EXCL | O_TRUNC | O_APPEND;

/// Decoded `open` flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub access: AccessMode,
    pub create: bool,
    pub exclusive: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenFlags {
    pub fn from_raw(flags: i32) -> SyscallResult<Self> {
        if flags & !O_KNOWN != 0 {
            return Err(SyscallError::InvalidArgument);
        }
        let access = match flags & O_ACCMODE {
            O_RDONLY => AccessMode::ReadOnly,
            O_WRONLY => AccessMode::WriteOnly,
            O_RDWR => AccessMode::ReadWrite,
            _ => return Err(SyscallError::InvalidArgument),
        };
        Ok(Self {
            access,
            create: flags & O_CREAT != 0,
            exclusive: flags & O_EXCL != 0,
            truncate: flags & O_TRUNC != 0,
            append: flags & O_APPEND != 0,
        })
    }

    pub const READ: OpenFlags = OpenFlags {
        access: AccessMode::ReadOnly,
        create: false,
        exclusive: false,
        truncate: false,
        append: false,
    };

    /// What to ask the file layer for
    pub fn options(&self) -> OpenOptions {
        OpenOptions::new()
            .read(self.access.can_read())
            .write(self.access.can_write())
            .create(self.create)
            .exclusive(self.create && self.exclusive)
            .truncate(self.truncate && self.access.can_write())
    }
}

/// Per-process descriptor table
///
/// A fixed array of slots. Slots 0..3 belong to the console and are
/// never bound.
#[derive(Debug, Clone)]
pub struct DescriptorTable {
    slots: Vec<Option<Handle>>,
}

impl DescriptorTable {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: vec![None; limit],
        }
    }

    /// Number of descriptor values, console slots included
    pub fn limit(&self) -> usize {
        self.slots.len()
    }

    /// Is `fd` a valid descriptor value at all
    pub fn in_range(&self, fd: Fd) -> bool {
        fd.0 >= 0 && (fd.0 as usize) < self.slots.len()
    }

    fn file_slot(&self, fd: Fd) -> Option<usize> {
        (self.in_range(fd) && !fd.is_console()).then_some(fd.0 as usize)
    }

    pub fn get(&self, fd: Fd) -> Option<Handle> {
        self.file_slot(fd).and_then(|i| self.slots[i])
    }

    pub fn lowest_free(&self) -> Option<Fd> {
        self.slots
            .iter()
            .enumerate()
            .skip(FIRST_FILE_FD as usize)
            .find(|(_, slot)| slot.is_none())
            .map(|(i, _)| Fd(i as i32))
    }

    /// Bind the lowest free slot
    pub fn bind_lowest(&mut self, handle: Handle) -> Option<Fd> {
        let fd = self.lowest_free()?;
        self.slots[fd.0 as usize] = Some(handle);
        Some(fd)
    }

    /// Bind `fd`, returning whatever it named before
    ///
    /// # Panics
    ///
    /// Panics if `fd` is a console slot or out of range; callers validate
    /// first.
    pub fn bind_at(&mut self, fd: Fd, handle: Handle) -> Option<Handle> {
        let i = self
            .file_slot(fd)
            .unwrap_or_else(|| panic!("bind of invalid descriptor {}", fd));
        self.slots[i].replace(handle)
    }

    /// Unbind `fd`
    pub fn take(&mut self, fd: Fd) -> Option<Handle> {
        let i = self.file_slot(fd)?;
        self.slots[i].take()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Fd, Handle)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.map(|h| (Fd(i as i32), h)))
    }

    /// Bound descriptors
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unbind everything
    pub fn drain(&mut self) -> Vec<Handle> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exited with an 8-bit status, not yet waited for
    Terminated(i32),
    Reaped,
}

/// Exit publication and waiting
#[derive(Debug)]
pub struct ExitSignal {
    state: Mutex<ProcessState>,
    cv: Condvar,
}

impl ExitSignal {
    fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::Running),
            cv: Condvar::new(),
        }
    }

    /// Record the status, then wake every waiter
    pub fn publish(&self, status: i32) {
        let mut state = lock(&self.state);
        debug_assert_eq!(*state, ProcessState::Running);
        *state = ProcessState::Terminated(status);
        drop(state);
        self.cv.notify_all();
    }

    pub fn poll(&self) -> ProcessState {
        *lock(&self.state)
    }

    /// Block until the process leaves `Running`
    pub fn wait_terminated(&self) -> ProcessState {
        let mut state = lock(&self.state);
        while *state == ProcessState::Running {
            state = self
                .cv
                .wait(state)
                .unwrap_or_else(|e| panic!("exit signal poisoned: {e}"));
        }
        *state
    }

    /// Move Terminated -> Reaped; `None` if not terminated
    pub fn claim(&self) -> Option<i32> {
        let mut state = lock(&self.state);
        match *state {
            ProcessState::Terminated(status) => {
                *state = ProcessState::Reaped;
                Some(status)
            }
            _ => None,
        }
    }
}

/// Process control block
pub struct Process {
    pid: Pid,
    name: Mutex<String>,
    parent: Mutex<Weak<Process>>,
    /// Children, owned; guarded together with `child_exited`
    children: Mutex<Vec<Arc<Process>>>,
    /// Signalled (under `children`) whenever a child terminates
    child_exited: Condvar,
    exit: ExitSignal,
    space: Mutex<Option<Box<dyn AddressSpace>>>,
    files: Mutex<DescriptorTable>,
    cwd: Mutex<Option<Arc<dyn Vnode>>>,
    threads: AtomicUsize,
}

impl Process {
    pub fn new(
        pid: Pid,
        name: impl Into<String>,
        space: Box<dyn AddressSpace>,
        files: DescriptorTable,
        cwd: Option<Arc<dyn Vnode>>,
    ) -> Self {
        Self {
            pid,
            name: Mutex::new(name.into()),
            parent: Mutex::new(Weak::new()),
            children: Mutex::new(Vec::new()),
            child_exited: Condvar::new(),
            exit: ExitSignal::new(),
            space: Mutex::new(Some(space)),
            files: Mutex::new(files),
            cwd: Mutex::new(cwd),
            threads: AtomicUsize::new(0),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> String {
        lock(&self.name).clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *lock(&self.name) = name.into();
    }

    pub fn parent(&self) -> Option<Arc<Process>> {
        lock(&self.parent).upgrade()
    }

    pub(crate) fn set_parent(&self, parent: Weak<Process>) {
        *lock(&self.parent) = parent;
    }

    /// Parent pid, 0 when there is none
    pub fn ppid(&self) -> Pid {
        self.parent().map(|p| p.pid).unwrap_or(Pid(0))
    }

    pub(crate) fn children(&self) -> MutexGuard<'_, Vec<Arc<Process>>> {
        lock(&self.children)
    }

    /// Block on `child_exited`, releasing the children lock meanwhile
    pub(crate) fn wait_for_child<'a>(
        &self,
        guard: MutexGuard<'a, Vec<Arc<Process>>>,
    ) -> MutexGuard<'a, Vec<Arc<Process>>> {
        self.child_exited
            .wait(guard)
            .unwrap_or_else(|e| panic!("children lock poisoned: {e}"))
    }

    pub(crate) fn notify_child_exited(&self) {
        self.child_exited.notify_all();
    }

    pub fn child_pids(&self) -> Vec<Pid> {
        self.children().iter().map(|c| c.pid).collect()
    }

    pub fn exit_signal(&self) -> &ExitSignal {
        &self.exit
    }

    pub fn state(&self) -> ProcessState {
        self.exit.poll()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn files(&self) -> MutexGuard<'_, DescriptorTable> {
        lock(&self.files)
    }

    pub(crate) fn cwd(&self) -> MutexGuard<'_, Option<Arc<dyn Vnode>>> {
        lock(&self.cwd)
    }

    pub fn has_space(&self) -> bool {
        lock(&self.space).is_some()
    }

    pub(crate) fn take_space(&self) -> Option<Box<dyn AddressSpace>> {
        lock(&self.space).take()
    }

    /// Install `space`, returning the previous one
    pub(crate) fn replace_space(
        &self,
        space: Box<dyn AddressSpace>,
    ) -> Option<Box<dyn AddressSpace>> {
        lock(&self.space).replace(space)
    }

    /// Run `f` on the address space; no space at all faults
    pub fn with_space<R>(
        &self,
        f: impl FnOnce(&mut dyn AddressSpace) -> SyscallResult<R>,
    ) -> SyscallResult<R> {
        let mut space = lock(&self.space);
        match space.as_deref_mut() {
            Some(space) => f(space),
            None => Err(SyscallError::Fault),
        }
    }

    /// Copy user memory into `buf`
    pub fn copy_in(&self, src: UserPtr, buf: &mut [u8]) -> SyscallResult<()> {
        self.with_space(|space| Ok(space.copy_in(src, buf)?))
    }

    /// Copy `buf` out to user memory
    pub fn copy_out(&self, buf: &[u8], dst: UserPtr) -> SyscallResult<()> {
        self.with_space(|space| Ok(space.copy_out(buf, dst)?))
    }

    pub fn copy_in_str(&self, src: UserPtr, max: usize) -> SyscallResult<String> {
        self.with_space(|space| usermem::copy_in_str(space, src, max))
    }

    pub fn copy_in_argv(
        &self,
        argv: UserPtr,
        width: usize,
        arg_max: usize,
    ) -> SyscallResult<Vec<String>> {
        self.with_space(|space| usermem::copy_in_argv(space, argv, width, arg_max))
    }

    pub(crate) fn attach_thread(&self) {
        self.threads.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn detach_thread(&self) {
        let prev = self.threads.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "process {} detached a thread it never had", self.pid);
    }

    pub fn thread_count(&self) -> usize {
        self.threads.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
