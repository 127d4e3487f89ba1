//! Trap-level syscall dispatch
//!
//! Decodes a syscall from a trap frame, runs it, and writes the outcome
//! back: on success `retval` holds the result and `error` is clear; on
//! failure `retval` holds the positive errno and `error` is set. The
//! program counter is stepped past the trapping instruction so the same
//! call is not repeated on return.

use super::error::{SyscallError, SyscallResult};
use super::loader::UserEntry;
use super::process::{Fd, Pid, Process};
use super::syscall::Kernel;
use super::usermem::UserPtr;
use std::sync::Arc;

/// Width of the trapping instruction
pub const INSN_SIZE: u64 = 4;

// ========== SYSCALL NUMBERS ==========

/// Syscall numbers
///
/// Numbers are part of the user ABI and never change meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SyscallNr {
    // Descriptors
    Read = 0,
    Write = 1,
    Open = 2,
    Close = 3,
    Lseek = 5,
    Dup = 41,
    Dup2 = 42,

    // Processes
    Exit = 100,
    Getpid = 101,
    Getppid = 102,
    Fork = 103,
    Waitpid = 104,
    Execv = 109,

    // Working directory
    Getcwd = 105,
    Chdir = 106,
}

impl SyscallNr {
    pub const ALL: [SyscallNr; 15] = [
        SyscallNr::Read,
        SyscallNr::Write,
        SyscallNr::Open,
        SyscallNr::Close,
        SyscallNr::Lseek,
        SyscallNr::Dup,
        SyscallNr::Dup2,
        SyscallNr::Exit,
        SyscallNr::Getpid,
        SyscallNr::Getppid,
        SyscallNr::Fork,
        SyscallNr::Waitpid,
        SyscallNr::Execv,
        SyscallNr::Getcwd,
        SyscallNr::Chdir,
    ];

    pub fn from_num(num: u32) -> Option<SyscallNr> {
        Self::ALL.iter().copied().find(|nr| nr.num() == num)
    }

    /// Get the syscall name (for tracing/debugging)
    pub fn name(&self) -> &'static str {
        match self {
            SyscallNr::Read => "read",
            SyscallNr::Write => "write",
            SyscallNr::Open => "open",
            SyscallNr::Close => "close",
            SyscallNr::Lseek => "lseek",
            SyscallNr::Dup => "dup",
            SyscallNr::Dup2 => "dup2",
            SyscallNr::Exit => "_exit",
            SyscallNr::Getpid => "getpid",
            SyscallNr::Getppid => "getppid",
            SyscallNr::Fork => "fork",
            SyscallNr::Waitpid => "waitpid",
            SyscallNr::Execv => "execv",
            SyscallNr::Getcwd => "__getcwd",
            SyscallNr::Chdir => "chdir",
        }
    }

    /// Get the syscall number
    pub fn num(&self) -> u32 {
        *self as u32
    }
}

impl std::fmt::Display for SyscallNr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.name())
    }
}

// ========== TRAP FRAME ==========

/// Registers saved when a user thread traps into the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrapFrame {
    /// Syscall number on entry
    pub callno: u32,
    /// Argument registers
    pub args: [u64; 6],
    /// Return value (or errno when `error` is set)
    pub retval: i64,
    pub error: bool,
    pub pc: u64,
    pub sp: u64,
}

impl TrapFrame {
    /// A frame as user code would leave it when trapping for `nr`
    pub fn syscall(nr: SyscallNr, args: &[u64]) -> Self {
        let mut frame = TrapFrame {
            callno: nr.num(),
            ..TrapFrame::default()
        };
        frame.args[..args.len()].copy_from_slice(args);
        frame
    }

    pub fn set_result(&mut self, result: SyscallResult<i64>) {
        match result {
            Ok(value) => {
                self.retval = value;
                self.error = false;
            }
            Err(e) => {
                self.retval = e.errno() as i64;
                self.error = true;
            }
        }
    }

    pub fn advance_pc(&mut self) {
        self.pc += INSN_SIZE;
    }

    /// Result as libc would return it: the value, or `-errno`
    pub fn result(&self) -> i64 {
        if self.error { -self.retval } else { self.retval }
    }
}

/// What the trap handler does next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// Resume the thread with the updated frame
    Return,
    /// The process exited; the thread must not return to user mode
    Exit,
    /// A new image was loaded; the frame now enters it
    Exec(UserEntry),
}

/// Run the syscall described by `frame` on behalf of `cur`
pub fn dispatch(kernel: &Arc<Kernel>, cur: &Arc<Process>, frame: &mut TrapFrame) -> Trap {
    let Some(nr) = SyscallNr::from_num(frame.callno) else {
        kernel.stats.record_unknown();
        frame.set_result(Err(SyscallError::NoSys));
        frame.advance_pc();
        return Trap::Return;
    };

    let a = frame.args;
    let fd = |i: usize| Fd(a[i] as i32);

    let result: SyscallResult<i64> = match nr {
        SyscallNr::Read => kernel
            .sys_read(cur, fd(0), UserPtr(a[1]), a[2] as usize)
            .map(|n| n as i64),
        SyscallNr::Write => kernel
            .sys_write(cur, fd(0), UserPtr(a[1]), a[2] as usize)
            .map(|n| n as i64),
        SyscallNr::Open => kernel
            .sys_open(cur, UserPtr(a[0]), a[1] as i32, a[2] as u32)
            .map(|fd| fd.0 as i64),
        SyscallNr::Close => kernel.sys_close(cur, fd(0)).map(|()| 0),
        SyscallNr::Lseek => kernel.sys_lseek(cur, fd(0), a[1] as i64, a[2] as i32),
        SyscallNr::Dup => kernel.sys_dup(cur, fd(0)).map(|fd| fd.0 as i64),
        SyscallNr::Dup2 => kernel.sys_dup2(cur, fd(0), fd(1)).map(|fd| fd.0 as i64),
        SyscallNr::Chdir => kernel.sys_chdir(cur, UserPtr(a[0])).map(|()| 0),
        SyscallNr::Getcwd => kernel
            .sys_getcwd(cur, UserPtr(a[0]), a[1] as usize)
            .map(|n| n as i64),
        SyscallNr::Getpid => Ok(kernel.sys_getpid(cur).0 as i64),
        SyscallNr::Getppid => Ok(kernel.sys_getppid(cur).0 as i64),
        SyscallNr::Fork => kernel.sys_fork(cur, frame).map(|pid| pid.0 as i64),
        SyscallNr::Waitpid => kernel
            .sys_waitpid(cur, Pid(a[0] as i32), UserPtr(a[1]), a[2] as i32)
            .map(|pid| pid.0 as i64),
        SyscallNr::Execv => match kernel.sys_execv(cur, UserPtr(a[0]), UserPtr(a[1])) {
            Ok(entry) => {
                kernel.stats.record(nr, &Ok::<_, SyscallError>(()));
                entry.install(frame);
                return Trap::Exec(entry);
            }
            Err(e) => Err(e),
        },
        SyscallNr::Exit => {
            kernel.stats.record(nr, &Ok::<_, SyscallError>(()));
            kernel.sys_exit(cur, a[0] as i32);
            return Trap::Exit;
        }
    };

    kernel.stats.record(nr, &result);
    frame.set_result(result);
    frame.advance_pc();
    Trap::Return
}
