//! In-memory filesystem implementation
//!
//! Simple, fast, ephemeral. Inodes live in a slab keyed by their inode
//! number; a path index maps absolute paths to inode numbers. Every
//! vnode reference handed out is counted so tests can check that the
//! process layer gives back exactly what it took.

use super::{FileLayer, NodeKind, OpenOptions, Stat, Vnode};
use slab::Slab;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

/// Largest file a `MemoryFs` stores unless told otherwise
pub const MAX_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// A stored file or directory
enum Node {
    File(Vec<u8>),
    Directory,
}

struct Inode {
    path: String,
    node: Node,
    /// Outstanding references handed out through the file layer
    refs: usize,
}

struct FsState {
    paths: HashMap<String, usize>,
    inodes: Slab<Inode>,
    used_bytes: u64,
    capacity: Option<u64>,
    max_file_size: u64,
    closes: u64,
}

impl FsState {
    fn inode(&self, ino: u64) -> io::Result<&Inode> {
        self.inodes
            .get(ino as usize)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "stale vnode"))
    }

    fn inode_mut(&mut self, ino: u64) -> io::Result<&mut Inode> {
        self.inodes
            .get_mut(ino as usize)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "stale vnode"))
    }

    fn base_path(&self, cwd: Option<&Arc<dyn Vnode>>) -> io::Result<String> {
        match cwd {
            Some(node) => Ok(self.inode(node.ino())?.path.clone()),
            None => Ok("/".to_string()),
        }
    }
}

/// In-memory filesystem
#[derive(Clone)]
pub struct MemoryFs {
    state: Arc<Mutex<FsState>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut inodes = Slab::new();
        let root = inodes.insert(Inode {
            path: "/".to_string(),
            node: Node::Directory,
            refs: 0,
        });
        let mut paths = HashMap::new();
        paths.insert("/".to_string(), root);

        Self {
            state: Arc::new(Mutex::new(FsState {
                paths,
                inodes,
                used_bytes: 0,
                capacity: None,
                max_file_size: MAX_FILE_SIZE,
                closes: 0,
            })),
        }
    }

    /// A filesystem that stores at most `bytes` of file data
    pub fn with_capacity(bytes: u64) -> Self {
        let fs = Self::new();
        fs.lock().capacity = Some(bytes);
        fs
    }

    /// Cap every file at `bytes`; writes past it fail with `StorageFull`
    pub fn with_max_file_size(self, bytes: u64) -> Self {
        self.lock().max_file_size = bytes;
        self
    }

    fn lock(&self) -> MutexGuard<'_, FsState> {
        self.state
            .lock()
            .unwrap_or_else(|e| panic!("memoryfs lock poisoned: {e}"))
    }

    /// Normalize `path` against `base` into an absolute path
    ///
    /// `.` and `..` are folded; `..` at the root stays at the root.
    fn resolve(base: &str, path: &str) -> io::Result<String> {
        if path.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "empty path"));
        }

        let mut parts: Vec<&str> = Vec::new();
        let joined;
        let full = if path.starts_with('/') {
            path
        } else {
            joined = format!("{}/{}", base, path);
            &joined
        };

        for component in full.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                other => parts.push(other),
            }
        }

        Ok(format!("/{}", parts.join("/")))
    }

    fn parent_path(path: &str) -> Option<String> {
        if path == "/" {
            return None;
        }
        let idx = path.rfind('/')?;
        if idx == 0 {
            Some("/".to_string())
        } else {
            Some(path[..idx].to_string())
        }
    }

    fn vnode(&self, ino: usize) -> Arc<dyn Vnode> {
        Arc::new(MemVnode {
            state: Arc::clone(&self.state),
            ino,
        })
    }

    /// Create a directory (parent must exist)
    pub fn create_dir(&self, path: &str) -> io::Result<()> {
        let mut st = self.lock();
        let path = Self::resolve("/", path)?;

        if st.paths.contains_key(&path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "Path already exists",
            ));
        }
        Self::check_parent(&st, &path)?;

        let ino = st.inodes.insert(Inode {
            path: path.clone(),
            node: Node::Directory,
            refs: 0,
        });
        st.paths.insert(path, ino);
        Ok(())
    }

    /// Create or replace a file with the given contents
    pub fn write_file(&self, path: &str, contents: &[u8]) -> io::Result<()> {
        let node = self.open(
            None,
            path,
            OpenOptions::new().write(true).create(true).truncate(true),
            0o644,
        )?;
        let written = node.write_at(0, contents)?;
        self.close(node)?;
        if written < contents.len() {
            return Err(io::Error::new(io::ErrorKind::StorageFull, "short write"));
        }
        Ok(())
    }

    /// Read a whole file
    pub fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        let st = self.lock();
        let path = Self::resolve("/", path)?;
        let ino = *st
            .paths
            .get(&path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "File not found"))?;
        match &st.inodes[ino].node {
            Node::File(data) => Ok(data.clone()),
            Node::Directory => Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                "Is a directory",
            )),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        match Self::resolve("/", path) {
            Ok(path) => self.lock().paths.contains_key(&path),
            Err(_) => false,
        }
    }

    /// Total vnode references currently handed out
    pub fn open_refs(&self) -> usize {
        self.lock().inodes.iter().map(|(_, inode)| inode.refs).sum()
    }

    /// Vnode references handed out for one path
    pub fn refs_of(&self, path: &str) -> usize {
        let st = self.lock();
        Self::resolve("/", path)
            .ok()
            .and_then(|p| st.paths.get(&p).copied())
            .map(|ino| st.inodes[ino].refs)
            .unwrap_or(0)
    }

    /// Number of successful `close` calls so far
    pub fn close_count(&self) -> u64 {
        self.lock().closes
    }

    fn check_parent(st: &FsState, path: &str) -> io::Result<()> {
        if let Some(parent) = Self::parent_path(path) {
            match st.paths.get(&parent).map(|&ino| &st.inodes[ino].node) {
                Some(Node::Directory) => {}
                Some(Node::File(_)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotADirectory,
                        format!("Not a directory: {}", parent),
                    ));
                }
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("Parent directory not found: {}", parent),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileLayer for MemoryFs {
    fn open(
        &self,
        cwd: Option<&Arc<dyn Vnode>>,
        path: &str,
        options: OpenOptions,
        _mode: u32,
    ) -> io::Result<Arc<dyn Vnode>> {
        let mut st = self.lock();
        let base = st.base_path(cwd)?;
        let path = Self::resolve(&base, path)?;

        let ino = match st.paths.get(&path).copied() {
            Some(ino) => {
                if options.create && options.exclusive {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("File exists: {}", path),
                    ));
                }
                let mut freed = 0u64;
                match &mut st.inodes[ino].node {
                    Node::Directory if options.write => {
                        return Err(io::Error::new(
                            io::ErrorKind::IsADirectory,
                            "Cannot open directory for writing",
                        ));
                    }
                    Node::File(data) if options.truncate && options.write => {
                        freed = data.len() as u64;
                        data.clear();
                    }
                    _ => {}
                }
                st.used_bytes -= freed;
                ino
            }
            None => {
                if !options.create {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("File not found: {}", path),
                    ));
                }
                Self::check_parent(&st, &path)?;
                let ino = st.inodes.insert(Inode {
                    path: path.clone(),
                    node: Node::File(Vec::new()),
                    refs: 0,
                });
                st.paths.insert(path, ino);
                ino
            }
        };

        st.inodes[ino].refs += 1;
        Ok(self.vnode(ino))
    }

    fn lookup_dir(&self, cwd: Option<&Arc<dyn Vnode>>, path: &str) -> io::Result<Arc<dyn Vnode>> {
        let mut st = self.lock();
        let base = st.base_path(cwd)?;
        let path = Self::resolve(&base, path)?;

        let ino = *st.paths.get(&path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("Directory not found: {}", path))
        })?;
        let inode = &mut st.inodes[ino];
        if !matches!(inode.node, Node::Directory) {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("Not a directory: {}", path),
            ));
        }
        inode.refs += 1;
        Ok(self.vnode(ino))
    }

    fn retain(&self, node: &Arc<dyn Vnode>) -> Arc<dyn Vnode> {
        let mut st = self.lock();
        if let Some(inode) = st.inodes.get_mut(node.ino() as usize) {
            inode.refs += 1;
        }
        Arc::clone(node)
    }

    fn close(&self, node: Arc<dyn Vnode>) -> io::Result<()> {
        let mut st = self.lock();
        let inode = st.inode_mut(node.ino())?;
        if inode.refs == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("vnode {} closed more times than opened", inode.path),
            ));
        }
        inode.refs -= 1;
        st.closes += 1;
        Ok(())
    }

    fn root(&self) -> io::Result<Arc<dyn Vnode>> {
        let mut st = self.lock();
        let ino = *st
            .paths
            .get("/")
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no root"))?;
        st.inodes[ino].refs += 1;
        Ok(self.vnode(ino))
    }

    fn path_of(&self, node: &Arc<dyn Vnode>) -> io::Result<String> {
        Ok(self.lock().inode(node.ino())?.path.clone())
    }
}

/// A vnode backed by a `MemoryFs` inode
struct MemVnode {
    state: Arc<Mutex<FsState>>,
    ino: usize,
}

impl MemVnode {
    fn lock(&self) -> MutexGuard<'_, FsState> {
        self.state
            .lock()
            .unwrap_or_else(|e| panic!("memoryfs lock poisoned: {e}"))
    }
}

impl Vnode for MemVnode {
    fn ino(&self) -> u64 {
        self.ino as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let st = self.lock();
        match &st.inode(self.ino as u64)?.node {
            Node::File(data) => {
                let start = (offset as usize).min(data.len());
                let to_read = buf.len().min(data.len() - start);
                buf[..to_read].copy_from_slice(&data[start..start + to_read]);
                Ok(to_read)
            }
            Node::Directory => Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                "Cannot read a directory",
            )),
        }
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let mut st = self.lock();
        let capacity = st.capacity;
        let used = st.used_bytes;
        let max_file_size = st.max_file_size;
        let inode = st.inode_mut(self.ino as u64)?;

        let data = match &mut inode.node {
            Node::File(data) => data,
            Node::Directory => {
                return Err(io::Error::new(
                    io::ErrorKind::IsADirectory,
                    "Cannot write a directory",
                ));
            }
        };

        let len = data.len() as u64;
        let wanted_end = offset + buf.len() as u64;
        let n = match capacity {
            Some(cap) => {
                let room = cap.saturating_sub(used);
                if wanted_end <= len + room {
                    buf.len()
                } else {
                    ((len + room).saturating_sub(offset) as usize).min(buf.len())
                }
            }
            None => buf.len(),
        };
        let n = n.min(max_file_size.saturating_sub(offset).min(usize::MAX as u64) as usize);

        if n == 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::StorageFull,
                "No space left on device",
            ));
        }

        let end = offset as usize + n;
        let grown = end.saturating_sub(data.len()) as u64;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(&buf[..n]);
        st.used_bytes += grown;
        Ok(n)
    }

    fn stat(&self) -> io::Result<Stat> {
        let st = self.lock();
        Ok(match &st.inode(self.ino as u64)?.node {
            Node::File(data) => Stat {
                size: data.len() as u64,
                kind: NodeKind::File,
            },
            Node::Directory => Stat {
                size: 0,
                kind: NodeKind::Directory,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_paths() {
        assert_eq!(MemoryFs::resolve("/", "a/b").unwrap(), "/a/b");
        assert_eq!(MemoryFs::resolve("/home", "../tmp/./x").unwrap(), "/tmp/x");
        assert_eq!(MemoryFs::resolve("/home", "/etc/").unwrap(), "/etc");
        assert_eq!(MemoryFs::resolve("/", "..").unwrap(), "/");
        assert!(MemoryFs::resolve("/", "").is_err());
    }

    #[test]
    fn test_open_create_read_write() {
        let fs = MemoryFs::new();
        let node = fs
            .open(None, "/hello.txt", OpenOptions::new().write(true).create(true), 0)
            .unwrap();
        assert_eq!(node.write_at(0, b"Hello, World!").unwrap(), 13);

        let mut buf = [0u8; 5];
        assert_eq!(node.read_at(7, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"World");
        assert_eq!(node.stat().unwrap().size, 13);

        // Past the end reads nothing
        assert_eq!(node.read_at(100, &mut buf).unwrap(), 0);
        fs.close(node).unwrap();
    }

    #[test]
    fn test_open_missing_file() {
        let fs = MemoryFs::new();
        let err = fs.open(None, "/nope", OpenOptions::new(), 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_exclusive_create() {
        let fs = MemoryFs::new();
        fs.write_file("/x", b"1").unwrap();
        let err = fs
            .open(
                None,
                "/x",
                OpenOptions::new().write(true).create(true).exclusive(true),
                0,
            )
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_truncate() {
        let fs = MemoryFs::new();
        fs.write_file("/t", b"abcdef").unwrap();
        let node = fs
            .open(None, "/t", OpenOptions::new().write(true).truncate(true), 0)
            .unwrap();
        assert_eq!(node.stat().unwrap().size, 0);
        fs.close(node).unwrap();
    }

    #[test]
    fn test_relative_open_uses_cwd() {
        let fs = MemoryFs::new();
        fs.create_dir("/home").unwrap();
        fs.write_file("/home/notes", b"n").unwrap();

        let home = fs.lookup_dir(None, "/home").unwrap();
        let node = fs.open(Some(&home), "notes", OpenOptions::new(), 0).unwrap();
        assert_eq!(fs.path_of(&node).unwrap(), "/home/notes");
        fs.close(node).unwrap();
        fs.close(home).unwrap();
    }

    #[test]
    fn test_lookup_dir_rejects_file() {
        let fs = MemoryFs::new();
        fs.write_file("/f", b"").unwrap();
        let err = fs.lookup_dir(None, "/f").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotADirectory);
    }

    #[test]
    fn test_reference_counting() {
        let fs = MemoryFs::new();
        fs.write_file("/r", b"data").unwrap();
        assert_eq!(fs.open_refs(), 0);

        let a = fs.open(None, "/r", OpenOptions::new(), 0).unwrap();
        let b = fs.retain(&a);
        assert_eq!(fs.refs_of("/r"), 2);

        fs.close(a).unwrap();
        fs.close(b).unwrap();
        assert_eq!(fs.open_refs(), 0);

        // One close too many is reported
        let c = fs.open(None, "/r", OpenOptions::new(), 0).unwrap();
        let extra = Arc::clone(&c);
        fs.close(c).unwrap();
        assert!(fs.close(extra).is_err());
    }

    #[test]
    fn test_capacity_short_write_then_full() {
        let fs = MemoryFs::with_capacity(8);
        let node = fs
            .open(None, "/big", OpenOptions::new().write(true).create(true), 0)
            .unwrap();

        assert_eq!(node.write_at(0, b"0123456789").unwrap(), 8);
        let err = node.write_at(8, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::StorageFull);

        // Overwriting in place needs no new space
        assert_eq!(node.write_at(0, b"ab").unwrap(), 2);
        fs.close(node).unwrap();
    }

    #[test]
    fn test_write_far_past_end_is_refused() {
        let fs = MemoryFs::new();
        let node = fs
            .open(None, "/sparse", OpenOptions::new().write(true).create(true), 0)
            .unwrap();

        let err = node.write_at(1 << 50, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::StorageFull);
        assert_eq!(node.stat().unwrap().size, 0);
        fs.close(node).unwrap();
    }

    #[test]
    fn test_max_file_size_short_write() {
        let fs = MemoryFs::new().with_max_file_size(16);
        let node = fs
            .open(None, "/f", OpenOptions::new().write(true).create(true), 0)
            .unwrap();

        assert_eq!(node.write_at(12, b"abcdefgh").unwrap(), 4);
        assert_eq!(node.stat().unwrap().size, 16);
        assert_eq!(
            node.write_at(16, b"x").unwrap_err().kind(),
            io::ErrorKind::StorageFull
        );
        fs.close(node).unwrap();
    }

    #[test]
    fn test_directory_io_rejected() {
        let fs = MemoryFs::new();
        let root = fs.root().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(
            root.read_at(0, &mut buf).unwrap_err().kind(),
            io::ErrorKind::IsADirectory
        );
        assert!(root.stat().unwrap().is_dir());
        fs.close(root).unwrap();
    }
}
