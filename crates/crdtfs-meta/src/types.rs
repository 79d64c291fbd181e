use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crdtfs_store::StoreError;

/// Bit mask for the file type bit field.
pub const S_IFMT: u32 = 0o170000;
/// Regular file type bits.
pub const S_IFREG: u32 = 0o100000;
/// Directory type bits.
pub const S_IFDIR: u32 = 0o040000;
/// Symbolic link type bits.
pub const S_IFLNK: u32 = 0o120000;
/// Named pipe type bits.
pub const S_IFIFO: u32 = 0o010000;
/// Character device type bits.
pub const S_IFCHR: u32 = 0o020000;
/// Block device type bits.
pub const S_IFBLK: u32 = 0o060000;
/// Socket type bits.
pub const S_IFSOCK: u32 = 0o140000;

/// Mode of a regular file created without explicit permission bits.
pub const DEFAULT_FILE_MODE: u32 = S_IFREG | 0o777;
/// Mode of a directory created without explicit permission bits.
pub const DEFAULT_DIR_MODE: u32 = S_IFDIR | 0o777;
/// Mode of every symbolic link (`r--r--r--`).
pub const SYMLINK_MODE: u32 = S_IFLNK | 0o444;
/// Reported size of every directory.
pub const DIR_SIZE: u64 = 4096;
/// Owner of every inode; ownership is not enforced.
pub const DEFAULT_UID: u32 = 1000;
/// Group of every inode; ownership is not enforced.
pub const DEFAULT_GID: u32 = 1000;

/// Represents a unique identifier for an inode
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeId(u64);

impl InodeId {
    /// The root inode ID (always 1)
    pub const ROOT_INODE: InodeId = InodeId(1);

    /// Creates a new InodeId from a raw u64 value
    pub const fn new(id: u64) -> Self {
        InodeId(id)
    }

    /// Returns the raw u64 value of this inode ID
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Store key of this inode's metadata map (`inode_<id>`).
    pub fn meta_key(&self) -> String {
        format!("inode_{}", self.0)
    }

    /// Store key of this inode's content register (`data_<id>`).
    pub fn data_key(&self) -> String {
        format!("data_{}", self.0)
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(InodeId)
    }
}

/// Current time as unix seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Object type as reported to the kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    /// Regular file.
    RegularFile,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Named pipe.
    NamedPipe,
    /// Character device.
    CharDevice,
    /// Block device.
    BlockDevice,
    /// Unix domain socket.
    Socket,
}

/// Variant-specific part of an attribute record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttrKind {
    /// Regular file or symbolic link.
    File,
    /// Directory with its resolved entries.
    Directory {
        /// Entry name to child inode.
        children: BTreeMap<String, InodeId>,
    },
}

/// Normalized metadata of one inode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attr {
    /// Self id.
    pub ino: InodeId,
    /// Type bits OR permission bits.
    pub mode: u32,
    /// Change time, unix seconds.
    pub ctime: i64,
    /// Modification time, unix seconds.
    pub mtime: i64,
    /// Access time, unix seconds.
    pub atime: i64,
    /// Device number, device files only.
    pub rdev: u32,
    /// Byte length for files, [`DIR_SIZE`] for directories.
    pub size: u64,
    /// Number of hard links.
    pub nlink: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Parent directory to the entry name referencing this inode there.
    pub hlinks: BTreeMap<InodeId, String>,
    /// File or directory payload.
    pub kind: AttrKind,
}

impl Attr {
    fn with_kind(ino: InodeId, mode: u32, size: u64, nlink: u32, kind: AttrKind) -> Self {
        let now = unix_now();
        Self {
            ino,
            mode,
            ctime: now,
            mtime: now,
            atime: now,
            rdev: 0,
            size,
            nlink,
            uid: DEFAULT_UID,
            gid: DEFAULT_GID,
            hlinks: BTreeMap::new(),
            kind,
        }
    }

    /// New file with one link.
    pub fn new_file(ino: InodeId, mode: u32, size: u64) -> Self {
        Self::with_kind(ino, mode, size, 1, AttrKind::File)
    }

    /// New empty directory (`nlink == 2`).
    pub fn new_directory(ino: InodeId, mode: u32) -> Self {
        Self::with_kind(
            ino,
            mode,
            DIR_SIZE,
            2,
            AttrKind::Directory {
                children: BTreeMap::new(),
            },
        )
    }

    /// New symbolic link whose target is `target_len` bytes long.
    pub fn new_symlink(ino: InodeId, target_len: u64) -> Self {
        Self::with_kind(ino, SYMLINK_MODE, target_len, 1, AttrKind::File)
    }

    /// True for regular files and symbolic links.
    pub fn is_file(&self) -> bool {
        matches!(self.kind, AttrKind::File)
    }

    /// True for directories.
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, AttrKind::Directory { .. })
    }

    /// Type as reported to the kernel.
    pub fn file_kind(&self) -> FileKind {
        match self.kind {
            AttrKind::Directory { .. } => FileKind::Directory,
            AttrKind::File => match self.mode & S_IFMT {
                S_IFLNK => FileKind::Symlink,
                S_IFIFO => FileKind::NamedPipe,
                S_IFCHR => FileKind::CharDevice,
                S_IFBLK => FileKind::BlockDevice,
                S_IFSOCK => FileKind::Socket,
                _ => FileKind::RegularFile,
            },
        }
    }

    /// Directory entries, `None` for files.
    pub fn children(&self) -> Option<&BTreeMap<String, InodeId>> {
        match &self.kind {
            AttrKind::Directory { children } => Some(children),
            AttrKind::File => None,
        }
    }

    /// Resolved child of a directory.
    pub fn child(&self, name: &str) -> Option<InodeId> {
        self.children().and_then(|c| c.get(name).copied())
    }

    /// Adds an entry; no-op on files.
    pub fn add_child(&mut self, name: impl Into<String>, ino: InodeId) {
        if let AttrKind::Directory { children } = &mut self.kind {
            children.insert(name.into(), ino);
        }
    }

    /// Records that `parent` references this inode as `name`.
    pub fn add_hard_link_ref(&mut self, parent: InodeId, name: impl Into<String>) {
        self.hlinks.insert(parent, name.into());
    }
}

/// Error types for metadata operations
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// The replicated store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A field could not be encoded or decoded.
    #[error("codec error in field '{field}': {msg}")]
    Codec {
        /// Field being encoded or decoded.
        field: String,
        /// Underlying serializer message.
        msg: String,
    },

    /// Conflicting entries kept reappearing during normalization.
    #[error("inode {ino} still has conflicting entries after {rounds} repair rounds")]
    Unresolved {
        /// Directory being normalized.
        ino: InodeId,
        /// Repair rounds attempted.
        rounds: u32,
    },

    /// No unused inode id was found.
    #[error("no unused inode id found after {attempts} attempts")]
    InodeSpaceExhausted {
        /// Number of ids drawn.
        attempts: u32,
    },
}
