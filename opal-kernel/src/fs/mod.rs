//! The filesystem node contract.
//!
//! The VFS proper and the concrete drivers (block, PTY, pipe) live outside
//! the kernel core; everything here is the stable surface the core depends
//! on. A node is one flat record that implements whichever capabilities it
//! supports; sockets are nodes too, reached through `as_socket`.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spinning_top::RwSpinlock;

use crate::net::Socket;
use crate::object::Watcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Regular,
    Directory,
    BlockDevice,
    CharDevice,
    Symlink,
    Socket,
    Pipe,
}

impl NodeType {
    /// The `S_IF*` bits for a `stat` record.
    pub fn mode_bits(self) -> u32 {
        use opal_abi::stat;
        match self {
            NodeType::Regular => stat::S_IFREG,
            NodeType::Directory => stat::S_IFDIR,
            NodeType::BlockDevice => stat::S_IFBLK,
            NodeType::CharDevice => stat::S_IFCHR,
            NodeType::Symlink => stat::S_IFLNK,
            NodeType::Socket => stat::S_IFSOCK,
            NodeType::Pipe => stat::S_IFIFO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    NotDirectory,
    IsDirectory,
    NotSupported,
    NotEmpty,
    Exists,
    Access,
    NameTooLong,
    InvalidArgument,
    BrokenPipe,
    /// The operation would block; the caller parks and retries.
    WouldBlock,
    Io,
}

impl FsError {
    pub fn errno(self) -> isize {
        use opal_abi::errno;
        match self {
            FsError::NotFound => errno::ENOENT,
            FsError::NotDirectory => errno::ENOTDIR,
            FsError::IsDirectory => errno::EISDIR,
            FsError::NotSupported => errno::ENOSYS,
            FsError::NotEmpty => errno::ENOTEMPTY,
            FsError::Exists => errno::EEXIST,
            FsError::Access => errno::EACCES,
            FsError::NameTooLong => errno::ENAMETOOLONG,
            FsError::InvalidArgument => errno::EINVAL,
            FsError::BrokenPipe => errno::EPIPE,
            FsError::WouldBlock => errno::EAGAIN,
            FsError::Io => errno::EIO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub node_type: NodeType,
    pub inode: u64,
}

pub trait FsNode: Send + Sync {
    fn node_type(&self) -> NodeType;

    fn inode(&self) -> u64 {
        0
    }

    fn size(&self) -> u64 {
        0
    }

    fn uid(&self) -> u32 {
        0
    }

    /// Read at `offset`. May return fewer bytes than requested.
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, FsError> {
        Err(FsError::NotSupported)
    }

    /// Write at `offset`. May write fewer bytes than requested.
    fn write(&self, _offset: u64, _buf: &[u8]) -> Result<usize, FsError> {
        Err(FsError::NotSupported)
    }

    /// The directory entry at `index`, or `None` past the end.
    fn read_dir(&self, _index: usize) -> Result<Option<DirEntry>, FsError> {
        Err(FsError::NotDirectory)
    }

    /// Create a child in this directory.
    fn create(&self, _name: &str, _directory: bool) -> Result<Arc<dyn FsNode>, FsError> {
        Err(FsError::NotDirectory)
    }

    /// Link an existing node into this directory.
    fn link(&self, _name: &str, _target: &Arc<dyn FsNode>) -> Result<(), FsError> {
        Err(FsError::NotDirectory)
    }

    /// Remove an entry from this directory.
    fn unlink(&self, _name: &str, _remove_dir: bool) -> Result<(), FsError> {
        Err(FsError::NotDirectory)
    }

    fn truncate(&self, _size: u64) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn ioctl(&self, _cmd: u64, _arg: u64) -> Result<isize, FsError> {
        Err(FsError::NotSupported)
    }

    fn read_link(&self, _buf: &mut [u8]) -> Result<usize, FsError> {
        Err(FsError::InvalidArgument)
    }

    /// Would a read make progress right now?
    fn can_read(&self) -> bool {
        true
    }

    /// Would a write make progress right now?
    fn can_write(&self) -> bool {
        true
    }

    /// Subscribe `watcher` to readiness changes matching `events`.
    fn watch(&self, _watcher: &Watcher, _events: u32) {}

    fn unwatch(&self, _watcher: &Watcher) {}

    /// Called when a file descriptor to this node is created.
    fn on_open(&self) {}

    /// Called when a file descriptor to this node is closed.
    fn on_close(&self) {}

    fn as_socket(&self) -> Option<&Socket> {
        None
    }

    /// Pending poll events, restricted to those in `requested`.
    fn poll_events(&self, requested: i16) -> i16 {
        use opal_abi::poll::{POLLIN, POLLOUT};
        let mut revents = 0;
        if requested & POLLIN != 0 && self.can_read() {
            revents |= POLLIN;
        }
        if requested & POLLOUT != 0 && self.can_write() {
            revents |= POLLOUT;
        }
        revents
    }
}

/// The mount/resolution surface implemented by the external VFS.
pub trait Vfs: Send + Sync {
    /// Resolve an absolute or cwd-relative path to a node.
    fn resolve(&self, path: &str, cwd: &str, follow_symlinks: bool) -> Option<Arc<dyn FsNode>>;

    /// Resolve the parent directory of `path`.
    fn resolve_parent(&self, path: &str, cwd: &str) -> Option<Arc<dyn FsNode>>;

    /// Construct a pipe, returning the (read, write) nodes.
    fn create_pipe(&self) -> Result<(Arc<dyn FsNode>, Arc<dyn FsNode>), FsError>;

    fn rename(
        &self,
        _old_parent: &Arc<dyn FsNode>,
        _old_name: &str,
        _new_parent: &Arc<dyn FsNode>,
        _new_name: &str,
    ) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn mount(&self, _source: &str, _target: &str) -> Result<(), FsError> {
        Ok(())
    }
}

static VFS: RwSpinlock<Option<&'static dyn Vfs>> = RwSpinlock::new(None);

pub fn init(vfs: &'static dyn Vfs) {
    *VFS.write() = Some(vfs);
}

pub fn vfs() -> Option<&'static dyn Vfs> {
    *VFS.read()
}

pub fn resolve_path(path: &str, cwd: &str, follow_symlinks: bool) -> Option<Arc<dyn FsNode>> {
    vfs()?.resolve(path, cwd, follow_symlinks)
}

pub fn resolve_parent(path: &str, cwd: &str) -> Option<Arc<dyn FsNode>> {
    vfs()?.resolve_parent(path, cwd)
}

/// Final component of a path.
pub fn base_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("/")
}

/// Join `path` onto `cwd` if relative and normalise `.`/`..` components.
pub fn canonicalize(path: &str, cwd: &str) -> String {
    let mut components: Vec<&str> = Vec::new();
    let absolute = path.starts_with('/');
    let combined = if absolute {
        String::from(path)
    } else {
        let mut joined = String::from(cwd);
        if !joined.ends_with('/') {
            joined.push('/');
        }
        joined.push_str(path);
        joined
    };

    for component in combined.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            other => components.push(other),
        }
    }

    let mut result = String::from("/");
    for (index, component) in components.iter().enumerate() {
        if index > 0 {
            result.push('/');
        }
        result.push_str(component);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_handles_dots_and_relative_paths() {
        assert_eq!(canonicalize("/a/b/../c", "/"), "/a/c");
        assert_eq!(canonicalize("x/y", "/home"), "/home/x/y");
        assert_eq!(canonicalize("./x/./y", "/home/"), "/home/x/y");
        assert_eq!(canonicalize("../../..", "/a/b"), "/");
    }

    #[test]
    fn base_name_takes_the_final_component() {
        assert_eq!(base_name("/a/b/c"), "c");
        assert_eq!(base_name("/a/b/"), "b");
        assert_eq!(base_name("/"), "/");
        assert_eq!(base_name("plain"), "plain");
    }
}
