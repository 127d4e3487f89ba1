//! procfd - process and file-descriptor management for a teaching kernel
//!
//! The resource layer between user programs and the file system:
//! - a system-wide table of open files with shared offsets
//! - per-process descriptor tables
//! - process control blocks with fork, execv, exit and waitpid
//!
//! Storage, address spaces, threads and the console sit behind traits so
//! the kernel can run hosted; the crate ships in-memory versions of each.

pub mod kernel;
pub mod vfs;
