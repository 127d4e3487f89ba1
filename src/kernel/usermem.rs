//! User memory access
//!
//! All traffic between kernel buffers and user memory goes through the
//! [`AddressSpace`] copy primitives. The helpers here layer C-string,
//! pointer and argv decoding on top of them; console and file I/O use the
//! same `copy_in`/`copy_out` pair.

use super::error::{SyscallError, SyscallResult};
use thiserror::Error;

/// Chunk size for string scans; never crosses a page boundary
const SCAN_CHUNK: u64 = 4096;

/// An address in a user address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct UserPtr(pub u64);

impl UserPtr {
    pub const NULL: UserPtr = UserPtr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn addr(self) -> u64 {
        self.0
    }

    /// `self + n`, or `None` on overflow
    pub fn offset(self, n: u64) -> Option<UserPtr> {
        self.0.checked_add(n).map(UserPtr)
    }
}

impl std::fmt::Display for UserPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An access touched an address the space does not map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("bad user address {addr:#x}")]
pub struct Fault {
    pub addr: u64,
}

/// The address-space layer could not allocate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("out of memory")]
pub struct OutOfMemory;

/// One process's user address space
pub trait AddressSpace: Send {
    /// Copy `buf.len()` bytes from user address `src`
    fn copy_in(&self, src: UserPtr, buf: &mut [u8]) -> Result<(), Fault>;

    /// Copy `buf` to user address `dst`
    fn copy_out(&mut self, buf: &[u8], dst: UserPtr) -> Result<(), Fault>;

    /// Map `[base, base + len)`
    fn define_region(&mut self, base: UserPtr, len: u64) -> Result<(), OutOfMemory>;

    /// Map the user stack and return its initial (top) pointer
    fn define_stack(&mut self) -> Result<UserPtr, OutOfMemory>;

    /// Duplicate for fork
    fn try_clone(&self) -> Result<Box<dyn AddressSpace>, OutOfMemory>;

    /// Make this the space the current CPU translates through
    fn activate(&self);
}

/// Creates empty address spaces
pub trait AddressSpaceFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn AddressSpace>, OutOfMemory>;
}

/// Copy a NUL-terminated string of at most `max` bytes (terminator included)
///
/// Too long is `NameTooLong`, invalid UTF-8 is `InvalidArgument`, and a
/// null pointer faults.
pub fn copy_in_str(space: &dyn AddressSpace, src: UserPtr, max: usize) -> SyscallResult<String> {
    if src.is_null() {
        return Err(SyscallError::Fault);
    }

    let mut bytes = Vec::new();
    let mut addr = src;
    let mut chunk = [0u8; SCAN_CHUNK as usize];

    while bytes.len() < max {
        let to_page_end = SCAN_CHUNK - (addr.0 % SCAN_CHUNK);
        let want = (to_page_end as usize).min(max - bytes.len());
        space.copy_in(addr, &mut chunk[..want])?;

        if let Some(nul) = chunk[..want].iter().position(|&b| b == 0) {
            bytes.extend_from_slice(&chunk[..nul]);
            return String::from_utf8(bytes).map_err(|_| SyscallError::InvalidArgument);
        }
        bytes.extend_from_slice(&chunk[..want]);
        addr = addr.offset(want as u64).ok_or(SyscallError::Fault)?;
    }

    Err(SyscallError::NameTooLong)
}

/// Read a `width`-byte little-endian user pointer
pub fn read_pointer(space: &dyn AddressSpace, at: UserPtr, width: usize) -> Result<UserPtr, Fault> {
    let mut raw = [0u8; 8];
    space.copy_in(at, &mut raw[..width])?;
    Ok(UserPtr(u64::from_le_bytes(raw)))
}

/// Write a `width`-byte little-endian user pointer
pub fn write_pointer(
    space: &mut dyn AddressSpace,
    at: UserPtr,
    value: UserPtr,
    width: usize,
) -> Result<(), Fault> {
    let raw = value.0.to_le_bytes();
    space.copy_out(&raw[..width], at)
}

/// Copy a NULL-terminated argv vector of strings
///
/// The strings plus their terminators may total at most `arg_max` bytes.
pub fn copy_in_argv(
    space: &dyn AddressSpace,
    argv: UserPtr,
    width: usize,
    arg_max: usize,
) -> SyscallResult<Vec<String>> {
    if argv.is_null() {
        return Err(SyscallError::Fault);
    }

    let mut args = Vec::new();
    let mut used = 0usize;
    let mut slot = argv;

    loop {
        let ptr = read_pointer(space, slot, width)?;
        if ptr.is_null() {
            return Ok(args);
        }

        let budget = arg_max - used;
        if budget == 0 {
            return Err(SyscallError::ArgListTooLong);
        }
        let arg = match copy_in_str(space, ptr, budget) {
            Err(SyscallError::NameTooLong) => return Err(SyscallError::ArgListTooLong),
            other => other?,
        };
        used += arg.len() + 1;
        args.push(arg);

        slot = slot.offset(width as u64).ok_or(SyscallError::Fault)?;
    }
}
