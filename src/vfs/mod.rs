//! Virtual File System contract
//!
//! The process layer never looks inside a filesystem. It sees vnodes
//! (open, reference-counted file objects that can be read and written at
//! an explicit offset) and a file layer that resolves paths to vnodes.
//!
//! Design: trait-based abstraction, keeping it simple. `MemoryFs` is the
//! in-memory reference backend used by tests and by hosts that don't
//! bring their own filesystem.

pub mod memory;

pub use memory::{MemoryFs, MAX_FILE_SIZE};

use std::io;
use std::sync::Arc;

/// What a vnode refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// Vnode metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Length in bytes (0 for directories)
    pub size: u64,
    pub kind: NodeKind,
}

impl Stat {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// An open filesystem object
///
/// Vnodes carry no offset of their own; the caller passes one on every
/// transfer. A vnode handed out by [`FileLayer`] stays valid until it is
/// given back through [`FileLayer::close`].
pub trait Vnode: Send + Sync {
    /// Identity within the owning file layer
    fn ino(&self) -> u64;

    /// Read up to `buf.len()` bytes starting at `offset`
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write `buf` at `offset`, returning how many bytes were stored
    ///
    /// A short count is not an error. `StorageFull` is returned only when
    /// nothing at all could be written.
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<usize>;

    fn stat(&self) -> io::Result<Stat>;
}

impl std::fmt::Debug for dyn Vnode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vnode:{}", self.ino())
    }
}

/// File open modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub exclusive: bool,
    pub truncate: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            create: false,
            exclusive: false,
            truncate: false,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }
}

/// Path resolution and vnode lifetime
///
/// Relative paths are resolved against `cwd`; `None` means the root.
/// Every vnode returned by `open`, `lookup_dir`, `root` or `retain` must
/// be handed back to `close` exactly once.
pub trait FileLayer: Send + Sync {
    /// Open (and possibly create) a file or directory
    fn open(
        &self,
        cwd: Option<&Arc<dyn Vnode>>,
        path: &str,
        options: OpenOptions,
        mode: u32,
    ) -> io::Result<Arc<dyn Vnode>>;

    /// Resolve a path that must name a directory
    fn lookup_dir(&self, cwd: Option<&Arc<dyn Vnode>>, path: &str) -> io::Result<Arc<dyn Vnode>>;

    /// Take another reference on an already open vnode
    fn retain(&self, node: &Arc<dyn Vnode>) -> Arc<dyn Vnode>;

    /// Drop one reference
    fn close(&self, node: Arc<dyn Vnode>) -> io::Result<()>;

    /// The root directory
    fn root(&self) -> io::Result<Arc<dyn Vnode>>;

    /// Absolute path of an open vnode
    fn path_of(&self, node: &Arc<dyn Vnode>) -> io::Result<String>;
}
