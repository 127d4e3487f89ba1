//! Program loading and the initial user stack
//!
//! `FlatLoader` accepts an ELF header only to find the entry point and
//! class; the whole file is then mapped as one flat image at
//! [`LOAD_BASE`]. Real segment loading belongs to a richer loader behind
//! the same trait.

use super::dispatch::TrapFrame;
use super::error::{SyscallError, SyscallResult};
use super::memory::PAGE_SIZE;
use super::usermem::{self, AddressSpace, UserPtr};
use crate::vfs::Vnode;

/// Where flat images are mapped
pub const LOAD_BASE: u64 = 0x0040_0000;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const EHDR32_SIZE: usize = 52;
const EHDR64_SIZE: usize = 64;
/// Offset of `e_entry` in both header classes
const E_ENTRY: usize = 24;

/// Loads an executable into a fresh address space
pub trait ProgramLoader: Send + Sync {
    /// Map `image` into `space`, returning the entry point
    fn load(&self, image: &dyn Vnode, space: &mut dyn AddressSpace) -> SyscallResult<UserPtr>;
}

/// Maps the whole executable file at `LOAD_BASE`
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatLoader;

impl FlatLoader {
    pub fn new() -> Self {
        Self
    }

    /// A minimal 32-bit executable whose entry is the first byte of `code`
    pub fn image(code: &[u8]) -> Vec<u8> {
        let mut image = vec![0u8; EHDR32_SIZE];
        image[..4].copy_from_slice(ELF_MAGIC);
        image[4] = ELFCLASS32;
        // Little-endian, version 1
        image[5] = 1;
        image[6] = 1;
        let entry = (LOAD_BASE + EHDR32_SIZE as u64) as u32;
        image[E_ENTRY..E_ENTRY + 4].copy_from_slice(&entry.to_le_bytes());
        image.extend_from_slice(code);
        image
    }

    fn entry_point(image: &[u8]) -> SyscallResult<u64> {
        if image.len() < EHDR32_SIZE || &image[..4] != ELF_MAGIC {
            return Err(SyscallError::NotExecutable);
        }
        match image[4] {
            ELFCLASS32 => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&image[E_ENTRY..E_ENTRY + 4]);
                Ok(u32::from_le_bytes(raw) as u64)
            }
            ELFCLASS64 if image.len() >= EHDR64_SIZE => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&image[E_ENTRY..E_ENTRY + 8]);
                Ok(u64::from_le_bytes(raw))
            }
            _ => Err(SyscallError::NotExecutable),
        }
    }
}

impl ProgramLoader for FlatLoader {
    fn load(&self, image: &dyn Vnode, space: &mut dyn AddressSpace) -> SyscallResult<UserPtr> {
        let stat = image.stat()?;
        if stat.is_dir() {
            return Err(SyscallError::NotExecutable);
        }

        let mut bytes = vec![0u8; stat.size as usize];
        let mut done = 0;
        while done < bytes.len() {
            let n = image.read_at(done as u64, &mut bytes[done..])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        bytes.truncate(done);

        let entry = Self::entry_point(&bytes)?;
        let end = LOAD_BASE + bytes.len() as u64;
        if entry < LOAD_BASE || entry >= end {
            return Err(SyscallError::NotExecutable);
        }

        let mapped = (bytes.len() as u64).div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;
        space.define_region(UserPtr(LOAD_BASE), mapped)?;
        space.copy_out(&bytes, UserPtr(LOAD_BASE))?;
        Ok(UserPtr(entry))
    }
}

/// Where a freshly loaded image starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserEntry {
    pub entry: UserPtr,
    pub stack: UserPtr,
    pub argc: usize,
    pub argv: UserPtr,
}

impl UserEntry {
    /// Point `frame` at the new image: pc at the entry, argc/argv in the
    /// first two argument registers
    pub fn install(&self, frame: &mut TrapFrame) {
        *frame = TrapFrame {
            pc: self.entry.0,
            sp: self.stack.0,
            ..TrapFrame::default()
        };
        frame.args[0] = self.argc as u64;
        frame.args[1] = self.argv.0;
    }
}

/// Lay out argv on a new stack whose top is `top`
///
/// Strings go first, last argument highest, each NUL-terminated and
/// padded to the pointer width. Below them sits the NULL-terminated
/// pointer vector. The returned stack pointer is aligned down to two
/// pointers. Returns `(sp, argv)`.
pub fn marshal_args(
    space: &mut dyn AddressSpace,
    top: UserPtr,
    args: &[String],
    width: usize,
) -> SyscallResult<(UserPtr, UserPtr)> {
    let width64 = width as u64;
    let mut sp = top.0;
    let mut addrs = Vec::with_capacity(args.len() + 1);

    for arg in args.iter().rev() {
        let padded = (arg.len() as u64 + 1).div_ceil(width64) * width64;
        sp = sp.checked_sub(padded).ok_or(SyscallError::ArgListTooLong)?;

        let mut bytes = arg.as_bytes().to_vec();
        bytes.resize(padded as usize, 0);
        space.copy_out(&bytes, UserPtr(sp))?;
        addrs.push(UserPtr(sp));
    }
    addrs.reverse();
    addrs.push(UserPtr::NULL);

    let vector = addrs.len() as u64 * width64;
    sp = sp.checked_sub(vector).ok_or(SyscallError::ArgListTooLong)?;
    let argv = UserPtr(sp);
    for (i, addr) in addrs.iter().enumerate() {
        usermem::write_pointer(space, UserPtr(sp + i as u64 * width64), *addr, width)?;
    }

    let align = 2 * width64;
    Ok((UserPtr(sp & !(align - 1)), argv))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::memory::{SimAddressSpace, USER_STACK_TOP};
    use crate::vfs::{FileLayer, MemoryFs, OpenOptions};

    fn node_with(fs: &MemoryFs, path: &str, data: &[u8]) -> std::sync::Arc<dyn Vnode> {
        fs.write_file(path, data).unwrap();
        fs.open(None, path, OpenOptions::new(), 0).unwrap()
    }

    #[test]
    fn test_load_flat_image() {
        let fs = MemoryFs::new();
        let node = node_with(&fs, "/bin/true", &FlatLoader::image(b"\x01\x02\x03\x04"));
        let mut space = SimAddressSpace::new();

        let entry = FlatLoader::new().load(node.as_ref(), &mut space).unwrap();
        assert_eq!(entry, UserPtr(LOAD_BASE + 52));

        let mut code = [0u8; 4];
        space.copy_in(entry, &mut code).unwrap();
        assert_eq!(code, [1, 2, 3, 4]);
        fs.close(node).unwrap();
    }

    #[test]
    fn test_reject_non_elf() {
        let fs = MemoryFs::new();
        let node = node_with(&fs, "/text", b"#!/bin/sh\necho hi\n");
        let mut space = SimAddressSpace::new();
        assert_eq!(
            FlatLoader::new().load(node.as_ref(), &mut space),
            Err(SyscallError::NotExecutable)
        );
        fs.close(node).unwrap();
    }

    #[test]
    fn test_reject_entry_outside_image() {
        let mut image = FlatLoader::image(b"");
        image[E_ENTRY..E_ENTRY + 4].copy_from_slice(&0x10u32.to_le_bytes());
        let fs = MemoryFs::new();
        let node = node_with(&fs, "/bad", &image);
        let mut space = SimAddressSpace::new();
        assert_eq!(
            FlatLoader::new().load(node.as_ref(), &mut space),
            Err(SyscallError::NotExecutable)
        );
        fs.close(node).unwrap();
    }

    #[test]
    fn test_reject_directory() {
        let fs = MemoryFs::new();
        let root = fs.root().unwrap();
        let mut space = SimAddressSpace::new();
        assert_eq!(
            FlatLoader::new().load(root.as_ref(), &mut space),
            Err(SyscallError::NotExecutable)
        );
        fs.close(root).unwrap();
    }

    #[test]
    fn test_marshal_layout() {
        let mut space = SimAddressSpace::new();
        let top = space.define_stack().unwrap();
        let args = vec!["prog".to_string(), "a".to_string()];

        let (sp, argv) = marshal_args(&mut space, top, &args, 4).unwrap();
        // "a\0" padded to 4, "prog\0" padded to 8, then 3 pointers
        assert_eq!(argv, UserPtr(USER_STACK_TOP - 4 - 8 - 12));
        assert_eq!(sp.0 % 8, 0);
        assert!(sp <= argv);

        let p0 = usermem::read_pointer(&space, argv, 4).unwrap();
        let p1 = usermem::read_pointer(&space, UserPtr(argv.0 + 4), 4).unwrap();
        let p2 = usermem::read_pointer(&space, UserPtr(argv.0 + 8), 4).unwrap();
        assert_eq!(usermem::copy_in_str(&space, p0, 64).unwrap(), "prog");
        assert_eq!(usermem::copy_in_str(&space, p1, 64).unwrap(), "a");
        assert!(p2.is_null());
        // Last argument sits highest
        assert!(p1 > p0);
    }

    #[test]
    fn test_marshal_wide_pointers() {
        let mut space = SimAddressSpace::new();
        let top = space.define_stack().unwrap();
        let (sp, argv) = marshal_args(&mut space, top, &["x".to_string()], 8).unwrap();
        assert_eq!(argv, UserPtr(USER_STACK_TOP - 8 - 16));
        assert_eq!(sp.0 % 16, 0);
    }

    #[test]
    fn test_install_entry() {
        let entry = UserEntry {
            entry: UserPtr(0x400040),
            stack: UserPtr(0x7fff_ff00),
            argc: 2,
            argv: UserPtr(0x7fff_ff10),
        };
        let mut frame = TrapFrame::default();
        frame.error = true;
        entry.install(&mut frame);
        assert_eq!(frame.pc, 0x400040);
        assert_eq!(frame.sp, 0x7fff_ff00);
        assert_eq!(frame.args[..2], [2, 0x7fff_ff10]);
        assert!(!frame.error);
    }
}
