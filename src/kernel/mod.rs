//! The kernel - processes, descriptors, and the syscalls over them
//!
//! Three shared tables hold all state:
//! - the system-wide open-file table (`object`)
//! - one descriptor table per process (`process`)
//! - the process table (`proctable`)
//!
//! Syscalls are methods on [`Kernel`] taking the calling process
//! explicitly. [`dispatch`] runs one from a trap frame.

pub mod config;
pub mod console;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod loader;
pub mod memory;
pub mod object;
pub mod process;
pub mod proctable;
pub mod syscall;
pub mod thread;
pub mod trace;
pub mod usermem;


pub use config::{ConfigError, KernelConfig};
pub use console::{BufferConsole, Console};
pub use dispatch::{dispatch, Trap, TrapFrame, SyscallNr};
pub use error::{ErrorKind, SyscallError, SyscallResult};
pub use lifecycle::{WaitFlags, WNOHANG};
pub use loader::{FlatLoader, ProgramLoader, UserEntry};
pub use memory::{SimAddressSpace, SimSpaces, SpaceKnobs};
pub use object::{AccessMode, Handle, OpenFile, OpenFileTable};
pub use process::{DescriptorTable, Fd, OpenFlags, Pid, Process, ProcessState};
pub use proctable::{ProcessTable, INIT_PID};
pub use syscall::{Kernel, KernelBuilder, SEEK_CUR, SEEK_END, SEEK_SET};
pub use thread::{HostThreads, LaunchError, SavedContext, ThreadLauncher};
pub use trace::{SyscallCounter, SyscallStats};
pub use usermem::{AddressSpace, AddressSpaceFactory, Fault, OutOfMemory, UserPtr};

use std::sync::{Mutex, MutexGuard};

/// Lock a kernel mutex
///
/// A poisoned lock means a thread panicked mid-update; the tables may be
/// inconsistent, so this panics too.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock()
        .unwrap_or_else(|_| panic!("kernel lock poisoned"))
}
