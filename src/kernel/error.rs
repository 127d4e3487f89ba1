//! Syscall errors
//!
//! Every failure a syscall can report is one `SyscallError` variant. The
//! trap layer turns it into a positive errno with [`SyscallError::errno`];
//! [`SyscallError::kind`] groups errnos into the coarse categories callers
//! usually branch on.

use super::usermem::{Fault, OutOfMemory};
use std::io;
use thiserror::Error;

/// Result type for syscalls
pub type SyscallResult<T> = Result<T, SyscallError>;

/// Coarse error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidDescriptor,
    InvalidArgument,
    ResourceExhausted,
    NotFound,
    NoSpace,
    FaultyUserPointer,
    PermissionOrIO,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyscallError {
    /// Descriptor out of range, unbound, or opened with the wrong access mode
    #[error("bad file descriptor")]
    BadFd,
    #[error("invalid argument")]
    InvalidArgument,
    /// A user pointer could not be read or written
    #[error("bad address")]
    Fault,
    /// System open-file table full
    #[error("too many open files in system")]
    SystemTableFull,
    /// Per-process descriptor table full
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("out of memory")]
    NoMemory,
    #[error("no such file or directory")]
    NotFound,
    #[error("no such process")]
    NoProcess,
    #[error("no child processes")]
    NoChild,
    #[error("no space left on device")]
    NoSpace,
    #[error("file name too long")]
    NameTooLong,
    #[error("argument list too long")]
    ArgListTooLong,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("file exists")]
    AlreadyExists,
    #[error("exec format error")]
    NotExecutable,
    #[error("permission denied")]
    PermissionDenied,
    /// Unknown syscall number
    #[error("function not implemented")]
    NoSys,
    /// Anything else the file layer reported
    #[error("I/O error: {0}")]
    Io(String),
}

impl SyscallError {
    /// Positive errno value (Linux numbering)
    pub fn errno(&self) -> i32 {
        match self {
            SyscallError::NotFound => 2,
            SyscallError::NoProcess => 3,
            SyscallError::Io(_) => 5,
            SyscallError::ArgListTooLong => 7,
            SyscallError::NotExecutable => 8,
            SyscallError::BadFd => 9,
            SyscallError::NoChild => 10,
            SyscallError::NoMemory => 12,
            SyscallError::PermissionDenied => 13,
            SyscallError::Fault => 14,
            SyscallError::AlreadyExists => 17,
            SyscallError::NotADirectory => 20,
            SyscallError::IsADirectory => 21,
            SyscallError::InvalidArgument => 22,
            SyscallError::SystemTableFull => 23,
            SyscallError::TooManyOpenFiles => 24,
            SyscallError::NoSpace => 28,
            SyscallError::NameTooLong => 36,
            SyscallError::NoSys => 38,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyscallError::BadFd => ErrorKind::InvalidDescriptor,
            SyscallError::InvalidArgument
            | SyscallError::NameTooLong
            | SyscallError::ArgListTooLong
            | SyscallError::NotExecutable
            | SyscallError::NoSys => ErrorKind::InvalidArgument,
            SyscallError::Fault => ErrorKind::FaultyUserPointer,
            SyscallError::SystemTableFull
            | SyscallError::TooManyOpenFiles
            | SyscallError::NoMemory => ErrorKind::ResourceExhausted,
            SyscallError::NotFound | SyscallError::NoProcess | SyscallError::NoChild => {
                ErrorKind::NotFound
            }
            SyscallError::NoSpace => ErrorKind::NoSpace,
            SyscallError::NotADirectory
            | SyscallError::IsADirectory
            | SyscallError::AlreadyExists
            | SyscallError::PermissionDenied
            | SyscallError::Io(_) => ErrorKind::PermissionOrIO,
        }
    }
}

impl From<io::Error> for SyscallError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => SyscallError::NotFound,
            io::ErrorKind::PermissionDenied => SyscallError::PermissionDenied,
            io::ErrorKind::AlreadyExists => SyscallError::AlreadyExists,
            io::ErrorKind::StorageFull => SyscallError::NoSpace,
            io::ErrorKind::NotADirectory => SyscallError::NotADirectory,
            io::ErrorKind::IsADirectory => SyscallError::IsADirectory,
            io::ErrorKind::InvalidInput => SyscallError::InvalidArgument,
            io::ErrorKind::OutOfMemory => SyscallError::NoMemory,
            _ => SyscallError::Io(e.to_string()),
        }
    }
}

impl From<Fault> for SyscallError {
    fn from(_: Fault) -> Self {
        SyscallError::Fault
    }
}

impl From<OutOfMemory> for SyscallError {
    fn from(_: OutOfMemory) -> Self {
        SyscallError::NoMemory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let e: SyscallError = io::Error::new(io::ErrorKind::NotFound, "x").into();
        assert_eq!(e, SyscallError::NotFound);

        let e: SyscallError = io::Error::new(io::ErrorKind::StorageFull, "x").into();
        assert_eq!(e, SyscallError::NoSpace);
        assert_eq!(e.kind(), ErrorKind::NoSpace);

        let e: SyscallError = io::Error::other("disk on fire").into();
        assert_eq!(e.errno(), 5);
        assert_eq!(e.kind(), ErrorKind::PermissionOrIO);
    }

    #[test]
    fn test_taxonomy() {
        assert_eq!(SyscallError::BadFd.kind(), ErrorKind::InvalidDescriptor);
        assert_eq!(SyscallError::SystemTableFull.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(SyscallError::TooManyOpenFiles.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(SyscallError::Fault.kind(), ErrorKind::FaultyUserPointer);
        assert_eq!(SyscallError::NoChild.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_errno_values() {
        assert_eq!(SyscallError::BadFd.errno(), 9);
        assert_eq!(SyscallError::SystemTableFull.errno(), 23);
        assert_eq!(SyscallError::TooManyOpenFiles.errno(), 24);
        assert_eq!(SyscallError::NoSpace.errno(), 28);
        assert_eq!(SyscallError::Fault.errno(), 14);
    }

    #[test]
    fn test_fault_conversion() {
        let e: SyscallError = Fault { addr: 0xdead }.into();
        assert_eq!(e, SyscallError::Fault);
    }
}
