use thiserror::Error;

use crdtfs_meta::{InodeId, MetaError};
use crdtfs_store::StoreError;

/// Failure of a filesystem operation, mapped to one errno.
#[derive(Debug, Error)]
pub enum FsError {
    /// Inode or entry does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Inode or `parent/name` that was missing.
        what: String,
    },

    /// Entry name already taken.
    #[error("name already exists: {name}")]
    AlreadyExists {
        /// Name in the target directory.
        name: String,
    },

    /// Directory still has entries.
    #[error("directory not empty: {ino}")]
    NotEmpty {
        /// The directory.
        ino: InodeId,
    },

    /// A directory was required.
    #[error("not a directory: {ino}")]
    NotADirectory {
        /// The offending inode.
        ino: InodeId,
    },

    /// A non-directory was required.
    #[error("is a directory: {ino}")]
    IsADirectory {
        /// The offending inode.
        ino: InodeId,
    },

    /// Parent directory missing during mknod, mkdir or rmdir.
    #[error("no such device: parent {ino} missing")]
    NoSuchDevice {
        /// The missing parent.
        ino: InodeId,
    },

    /// Operation not implemented.
    #[error("operation not supported: {op}")]
    Unsupported {
        /// Callback name.
        op: &'static str,
    },

    /// Arguments violate the operation's contract.
    #[error("invalid argument: {msg}")]
    InvalidArgument {
        /// Explanation.
        msg: String,
    },

    /// Metadata layer failed.
    #[error("metadata error: {0}")]
    Meta(#[from] MetaError),
}

impl From<StoreError> for FsError {
    fn from(err: StoreError) -> Self {
        FsError::Meta(MetaError::Store(err))
    }
}

/// Result alias for filesystem operations.
pub type Result<T> = std::result::Result<T, FsError>;

impl FsError {
    /// Missing inode.
    pub fn inode_not_found(ino: InodeId) -> Self {
        FsError::NotFound {
            what: format!("inode {}", ino),
        }
    }

    /// Missing entry in a directory.
    pub fn entry_not_found(parent: InodeId, name: &str) -> Self {
        FsError::NotFound {
            what: format!("{}/{}", parent, name),
        }
    }

    /// Errno reported to the kernel.
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            FsError::NotFound { .. } => ENOENT,
            FsError::AlreadyExists { .. } => EEXIST,
            FsError::NotEmpty { .. } => ENOTEMPTY,
            FsError::NotADirectory { .. } => ENOTDIR,
            FsError::IsADirectory { .. } => EISDIR,
            FsError::NoSuchDevice { .. } => ENXIO,
            FsError::Unsupported { .. } => ENOSYS,
            FsError::InvalidArgument { .. } => EINVAL,
            FsError::Meta(_) => EIO,
        }
    }
}
