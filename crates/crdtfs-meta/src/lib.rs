#![warn(missing_docs)]

//! crdtfs metadata subsystem: inode records encoded as composable CRDTs,
//! normalized on read, with deterministic repair of colliding entries.

pub mod codec;
pub mod inode;
pub mod reader;
pub mod resolver;
pub mod types;

pub use inode::InodeAllocator;
pub use reader::{MetadataReader, RawAttr};
pub use resolver::{ConflictResolver, Resolution};
pub use types::{Attr, AttrKind, FileKind, InodeId, MetaError};
