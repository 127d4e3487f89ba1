//! System call interface
//!
//! This is the boundary between user programs and the kernel's shared
//! tables. Every syscall takes the calling process explicitly; user
//! buffers are named by `UserPtr` and only touched through the process's
//! address space.
//!
//! Descriptor syscalls live here. Process lifecycle syscalls (fork,
//! execv, exit, waitpid) are in `lifecycle.rs`.
//!
//! Lock order, outermost first: a process's children, then a child's
//! exit state. The process table lock is a leaf. A descriptor table is
//! locked before the open-file arena, and the arena before an entry's
//! refcount. No lock is held across a call into the file layer's `close`.

use super::config::{ConfigError, KernelConfig};
use super::console::{BufferConsole, Console};
use super::error::{SyscallError, SyscallResult};
use super::loader::{FlatLoader, ProgramLoader};
use super::memory::SimSpaces;
use super::object::{Handle, OpenFile, OpenFileTable};
use super::process::{Fd, OpenFlags, Pid, Process};
use super::proctable::ProcessTable;
use super::thread::{HostThreads, ThreadLauncher};
use super::trace::SyscallStats;
use super::usermem::{AddressSpaceFactory, UserPtr};
use crate::vfs::{FileLayer, MemoryFs, Vnode};
use log::{debug, warn};
use std::sync::Arc;

/// Bytes moved per step between user memory and a vnode
const IO_CHUNK: usize = 4096;

/// `lseek` whence values
pub const SEEK_SET: i32 = 0;
pub const SEEK_CUR: i32 = 1;
pub const SEEK_END: i32 = 2;

/// The kernel's shared state and its collaborators
pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) open_files: OpenFileTable,
    pub(crate) processes: ProcessTable,
    pub(crate) fs: Arc<dyn FileLayer>,
    pub(crate) console: Arc<dyn Console>,
    pub(crate) spaces: Arc<dyn AddressSpaceFactory>,
    pub(crate) loader: Arc<dyn ProgramLoader>,
    pub(crate) threads: Arc<dyn ThreadLauncher>,
    pub(crate) stats: SyscallStats,
}

/// Assembles a [`Kernel`]
///
/// Every collaborator has an in-memory default, so
/// `KernelBuilder::new().build()` gives a working kernel whose forked
/// children exit immediately with status 0.
pub struct KernelBuilder {
    config: KernelConfig,
    fs: Option<Arc<dyn FileLayer>>,
    console: Option<Arc<dyn Console>>,
    spaces: Option<Arc<dyn AddressSpaceFactory>>,
    loader: Option<Arc<dyn ProgramLoader>>,
    threads: Option<Arc<dyn ThreadLauncher>>,
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self {
            config: KernelConfig::default(),
            fs: None,
            console: None,
            spaces: None,
            loader: None,
            threads: None,
        }
    }

    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn file_layer(mut self, fs: Arc<dyn FileLayer>) -> Self {
        self.fs = Some(fs);
        self
    }

    pub fn console(mut self, console: Arc<dyn Console>) -> Self {
        self.console = Some(console);
        self
    }

    pub fn address_spaces(mut self, spaces: Arc<dyn AddressSpaceFactory>) -> Self {
        self.spaces = Some(spaces);
        self
    }

    pub fn loader(mut self, loader: Arc<dyn ProgramLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn threads(mut self, threads: Arc<dyn ThreadLauncher>) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn build(self) -> Result<Arc<Kernel>, ConfigError> {
        self.config.validate()?;

        let threads = self.threads.unwrap_or_else(|| {
            Arc::new(HostThreads::new(|kernel, child, _frame| {
                kernel.sys_exit(child, 0);
            }))
        });

        Ok(Arc::new(Kernel {
            open_files: OpenFileTable::new(self.config.system_open_max()),
            processes: ProcessTable::new(self.config.max_processes),
            fs: self.fs.unwrap_or_else(|| Arc::new(MemoryFs::new())),
            console: self.console.unwrap_or_else(|| Arc::new(BufferConsole::new())),
            spaces: self.spaces.unwrap_or_else(|| Arc::new(SimSpaces::new())),
            loader: self.loader.unwrap_or_else(|| Arc::new(FlatLoader::new())),
            threads,
            stats: SyscallStats::new(),
            config: self.config,
        }))
    }
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn file_layer(&self) -> &Arc<dyn FileLayer> {
        &self.fs
    }

    pub fn stats(&self) -> &SyscallStats {
        &self.stats
    }

    /// Live open-file entries system-wide
    pub fn open_file_count(&self) -> usize {
        self.open_files.len()
    }

    /// Processes in the table, zombies included
    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    pub fn process(&self, pid: Pid) -> Option<Arc<Process>> {
        self.processes.get(pid)
    }

    pub fn init_process(&self) -> Option<Arc<Process>> {
        self.processes.init()
    }

    // ========== DESCRIPTOR SYSCALLS ==========

    /// Open a file, binding the lowest free descriptor
    pub fn sys_open(
        &self,
        cur: &Process,
        path: UserPtr,
        flags: i32,
        mode: u32,
    ) -> SyscallResult<Fd> {
        let path = cur.copy_in_str(path, self.config.path_max)?;
        let flags = OpenFlags::from_raw(flags)?;

        let node = {
            let cwd = cur.cwd();
            self.fs.open(cwd.as_ref(), &path, flags.options(), mode)?
        };

        let size = match node.stat() {
            Ok(stat) => stat.size,
            Err(e) => {
                self.close_node(node);
                return Err(e.into());
            }
        };
        let offset = if flags.append { size as i64 } else { 0 };

        let handle = match self.open_files.allocate(node, flags.access, offset) {
            Ok(handle) => handle,
            Err(node) => {
                self.close_node(node);
                return Err(SyscallError::SystemTableFull);
            }
        };

        let bound = cur.files().bind_lowest(handle);
        match bound {
            Some(fd) => {
                debug!("pid {} open {:?} -> fd {} ({})", cur.pid(), path, fd, handle);
                Ok(fd)
            }
            None => {
                if let Err(e) = self.release(handle) {
                    warn!("pid {} open {:?}: releasing {} failed: {}", cur.pid(), path, handle, e);
                }
                Err(SyscallError::TooManyOpenFiles)
            }
        }
    }

    /// Unbind a descriptor; the file is released with its last reference
    pub fn sys_close(&self, cur: &Process, fd: Fd) -> SyscallResult<()> {
        let handle = cur.files().take(fd).ok_or(SyscallError::BadFd)?;
        debug!("pid {} close fd {} ({})", cur.pid(), fd, handle);
        self.release(handle)
    }

    /// Read up to `len` bytes into user memory at `buf`
    pub fn sys_read(
        &self,
        cur: &Process,
        fd: Fd,
        buf: UserPtr,
        len: usize,
    ) -> SyscallResult<usize> {
        if fd.is_console() {
            if fd != Fd::STDIN {
                return Err(SyscallError::BadFd);
            }
            return self.console_read(cur, buf, len);
        }

        let file = self.resolve(cur, fd)?;
        if !file.access().can_read() {
            return Err(SyscallError::BadFd);
        }

        let offset = file.offset();
        let size = file.node().stat()?.size as i64;
        let available = (size - offset).max(0) as usize;
        let mut remaining = len.min(available);
        let mut total = 0usize;
        let mut chunk = vec![0u8; remaining.min(IO_CHUNK)];

        while remaining > 0 {
            let want = remaining.min(IO_CHUNK);
            let step = file
                .node()
                .read_at(offset as u64 + total as u64, &mut chunk[..want])
                .map_err(SyscallError::from)
                .and_then(|n| {
                    let dst = buf.offset(total as u64).ok_or(SyscallError::Fault)?;
                    cur.copy_out(&chunk[..n], dst)?;
                    Ok(n)
                });

            match step {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    remaining -= n;
                }
                Err(e) if total == 0 => return Err(e),
                Err(_) => break,
            }
        }

        file.advance(total);
        Ok(total)
    }

    /// Write `len` bytes from user memory at `buf`
    ///
    /// A short count from the file layer ends the write and is returned
    /// as is.
    pub fn sys_write(
        &self,
        cur: &Process,
        fd: Fd,
        buf: UserPtr,
        len: usize,
    ) -> SyscallResult<usize> {
        if fd.is_console() {
            if fd == Fd::STDIN {
                return Err(SyscallError::BadFd);
            }
            return self.console_write(cur, buf, len);
        }

        let file = self.resolve(cur, fd)?;
        if !file.access().can_write() {
            return Err(SyscallError::BadFd);
        }

        let offset = file.offset();
        let mut total = 0usize;
        let mut chunk = vec![0u8; len.min(IO_CHUNK)];

        while total < len {
            let want = (len - total).min(IO_CHUNK);
            let step = buf
                .offset(total as u64)
                .ok_or(SyscallError::Fault)
                .and_then(|src| cur.copy_in(src, &mut chunk[..want]))
                .and_then(|()| {
                    Ok(file
                        .node()
                        .write_at(offset as u64 + total as u64, &chunk[..want])?)
                });

            match step {
                Ok(n) => {
                    total += n;
                    if n < want {
                        break;
                    }
                }
                Err(e) if total == 0 => return Err(e),
                Err(_) => break,
            }
        }

        file.advance(total);
        Ok(total)
    }

    /// Reposition a descriptor's offset
    pub fn sys_lseek(&self, cur: &Process, fd: Fd, offset: i64, whence: i32) -> SyscallResult<i64> {
        let file = self.resolve(cur, fd)?;

        let base = match whence {
            SEEK_SET => 0,
            SEEK_CUR => file.offset(),
            SEEK_END => file.node().stat()?.size as i64,
            _ => return Err(SyscallError::InvalidArgument),
        };

        let new = base
            .checked_add(offset)
            .filter(|&pos| pos >= 0)
            .ok_or(SyscallError::InvalidArgument)?;
        file.set_offset(new);
        Ok(new)
    }

    /// Duplicate onto the lowest free descriptor
    pub fn sys_dup(&self, cur: &Process, oldfd: Fd) -> SyscallResult<Fd> {
        let mut files = cur.files();
        let handle = files.get(oldfd).ok_or(SyscallError::BadFd)?;
        let newfd = files.lowest_free().ok_or(SyscallError::TooManyOpenFiles)?;

        self.retain_bound(handle);
        files.bind_at(newfd, handle);
        debug!("pid {} dup {} -> {}", cur.pid(), oldfd, newfd);
        Ok(newfd)
    }

    /// Duplicate onto `newfd`, closing whatever it named
    pub fn sys_dup2(&self, cur: &Process, oldfd: Fd, newfd: Fd) -> SyscallResult<Fd> {
        let previous = {
            let mut files = cur.files();
            if !files.in_range(newfd) || newfd.is_console() {
                return Err(SyscallError::BadFd);
            }
            let handle = files.get(oldfd).ok_or(SyscallError::BadFd)?;
            if oldfd == newfd {
                return Ok(newfd);
            }

            self.retain_bound(handle);
            files.bind_at(newfd, handle)
        };

        if let Some(previous) = previous {
            if let Err(e) = self.release(previous) {
                warn!("pid {} dup2: closing previous fd {} failed: {}", cur.pid(), newfd, e);
            }
        }
        debug!("pid {} dup2 {} -> {}", cur.pid(), oldfd, newfd);
        Ok(newfd)
    }

    /// Change the working directory
    pub fn sys_chdir(&self, cur: &Process, path: UserPtr) -> SyscallResult<()> {
        if path.is_null() {
            return Err(SyscallError::Fault);
        }
        let path = cur.copy_in_str(path, self.config.path_max)?;

        let dir = {
            let cwd = cur.cwd();
            self.fs.lookup_dir(cwd.as_ref(), &path)?
        };

        // The new cwd is in place; a failed close of the old one is only logged
        let old = cur.cwd().replace(dir);
        if let Some(old) = old {
            if let Err(e) = self.fs.close(old) {
                warn!("pid {} chdir {:?}: closing old cwd failed: {}", cur.pid(), path, e);
            }
        }
        Ok(())
    }

    /// Write the working directory path (NUL-terminated) to `buf`
    ///
    /// Returns the path length, terminator excluded.
    pub fn sys_getcwd(&self, cur: &Process, buf: UserPtr, size: usize) -> SyscallResult<usize> {
        let path = {
            let cwd = cur.cwd();
            match cwd.as_ref() {
                Some(dir) => self.fs.path_of(dir)?,
                None => "/".to_string(),
            }
        };

        if path.len() + 1 > size {
            return Err(SyscallError::NameTooLong);
        }
        let mut bytes = path.into_bytes();
        bytes.push(0);
        cur.copy_out(&bytes, buf)?;
        Ok(bytes.len() - 1)
    }

    // ========== HELPERS ==========

    /// The open file a descriptor names
    fn resolve(&self, cur: &Process, fd: Fd) -> SyscallResult<Arc<OpenFile>> {
        let files = cur.files();
        let handle = files.get(fd).ok_or(SyscallError::BadFd)?;
        // Bound handles stay live while the descriptor table is locked
        let file = self.open_files.get(handle).unwrap_or_else(|| {
            panic!("fd {} of pid {} names dead open file {}", fd, cur.pid(), handle)
        });
        Ok(file)
    }

    /// Take a reference on a handle some descriptor still names
    pub(crate) fn retain_bound(&self, handle: Handle) {
        if !self.open_files.retain(handle) {
            panic!("bound open file {} could not be retained", handle);
        }
    }

    pub(crate) fn release(&self, handle: Handle) -> SyscallResult<()> {
        self.open_files.release(handle, self.fs.as_ref())?;
        Ok(())
    }

    /// Close a vnode reference, logging failures
    pub(crate) fn close_node(&self, node: Arc<dyn Vnode>) {
        if let Err(e) = self.fs.close(node) {
            warn!("vnode close failed: {}", e);
        }
    }

    /// Release every descriptor and the cwd of `cur`
    pub(crate) fn close_all(&self, cur: &Process) {
        let handles = cur.files().drain();
        for handle in handles {
            if let Err(e) = self.release(handle) {
                warn!("pid {}: close of {} failed: {}", cur.pid(), handle, e);
            }
        }
        let cwd = cur.cwd().take();
        if let Some(cwd) = cwd {
            self.close_node(cwd);
        }
    }

    fn console_read(&self, cur: &Process, buf: UserPtr, len: usize) -> SyscallResult<usize> {
        let mut total = 0usize;
        let mut chunk = Vec::with_capacity(len.min(IO_CHUNK));

        while total < len {
            let want = (len - total).min(IO_CHUNK);
            chunk.clear();
            while chunk.len() < want {
                match self.console.getch() {
                    Some(ch) => chunk.push(ch),
                    None => break,
                }
            }
            if chunk.is_empty() {
                break;
            }
            let dst = buf.offset(total as u64).ok_or(SyscallError::Fault)?;
            cur.copy_out(&chunk, dst)?;
            total += chunk.len();
            if chunk.len() < want {
                // Input ran dry
                break;
            }
        }
        Ok(total)
    }

    fn console_write(&self, cur: &Process, buf: UserPtr, len: usize) -> SyscallResult<usize> {
        let mut total = 0usize;
        let mut chunk = vec![0u8; len.min(IO_CHUNK)];

        while total < len {
            let want = (len - total).min(IO_CHUNK);
            let src = buf.offset(total as u64).ok_or(SyscallError::Fault)?;
            cur.copy_in(src, &mut chunk[..want])?;
            for &ch in &chunk[..want] {
                self.console.putch(ch);
            }
            total += want;
        }
        Ok(total)
    }
}
