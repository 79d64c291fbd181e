#![warn(missing_docs)]

//! crdtfs filesystem subsystem: operation handlers over the replicated
//! metadata store, errno mapping, mount configuration and the `fuser` bridge.

pub mod bridge;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod seed;

pub use bridge::FuseBridge;
pub use config::CrdtFsConfig;
pub use error::{FsError, Result};
pub use filesystem::{CrdtFs, DirEntry, SetAttrRequest, StatFs, TimeSpec};
