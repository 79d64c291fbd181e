//! Read-time normalization of inode records.
//!
//! The store can hand back a record in a state no single writer produced:
//! scalar registers with several concurrent values, or a directory slot whose
//! set holds more than one inode. [`MetadataReader::read`] turns such a record
//! into one [`Attr`], repairing colliding slots through the
//! [`ConflictResolver`] and re-reading until the record is clean.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crdtfs_store::{MapValue, ReplicatedStore};

use crate::codec::{self, data_handle, decode_value, meta_handle};
use crate::inode::InodeAllocator;
use crate::resolver::ConflictResolver;
use crate::types::{Attr, AttrKind, InodeId, MetaError, DEFAULT_GID, DEFAULT_UID, DIR_SIZE};

/// Resolve-then-reread rounds before a read gives up.
pub const DEFAULT_MAX_ROUNDS: u32 = 8;

/// A record as stored, before slot collisions are repaired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawAttr {
    /// Self id.
    pub ino: InodeId,
    /// Type and permission bits.
    pub mode: u32,
    /// Change time.
    pub ctime: i64,
    /// Modification time.
    pub mtime: i64,
    /// Access time.
    pub atime: i64,
    /// Device number.
    pub rdev: u32,
    /// Byte size.
    pub size: u64,
    /// Raw counter value; may transiently be out of range.
    pub nlink: i64,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// File or directory.
    pub is_file: bool,
    /// Every member of every slot, sorted by inode id.
    pub children: BTreeMap<String, Vec<InodeId>>,
    /// Parent directory to entry name.
    pub hlinks: BTreeMap<InodeId, String>,
}

impl RawAttr {
    /// Decodes a metadata map. Returns `None` for an empty map and for a
    /// partial record without an `isFile` field.
    pub fn decode(ino: InodeId, map: &MapValue) -> Result<Option<Self>, MetaError> {
        if map.is_empty() {
            return Ok(None);
        }
        let is_file = match scalar::<bool>(ino, map, codec::F_IS_FILE)? {
            Some(is_file) => is_file,
            None => {
                debug!("inode {} has a partial record without {}", ino, codec::F_IS_FILE);
                return Ok(None);
            }
        };

        let default_size = if is_file { 0 } else { DIR_SIZE };
        let mut raw = RawAttr {
            ino,
            mode: scalar(ino, map, codec::F_MODE)?.unwrap_or(0),
            ctime: scalar(ino, map, codec::F_CTIME)?.unwrap_or(0),
            mtime: scalar(ino, map, codec::F_MTIME)?.unwrap_or(0),
            atime: scalar(ino, map, codec::F_ATIME)?.unwrap_or(0),
            rdev: scalar(ino, map, codec::F_RDEV)?.unwrap_or(0),
            size: scalar(ino, map, codec::F_SIZE)?.unwrap_or(default_size),
            nlink: map.counter(codec::F_NLINK).unwrap_or(0),
            uid: scalar(ino, map, codec::F_UID)?.unwrap_or(DEFAULT_UID),
            gid: scalar(ino, map, codec::F_GID)?.unwrap_or(DEFAULT_GID),
            is_file,
            children: BTreeMap::new(),
            hlinks: BTreeMap::new(),
        };

        if let Some(children) = map.map(codec::F_CHILDREN) {
            for (name, _) in children.iter() {
                let members = children.set(name).unwrap_or_default();
                let mut ids = members
                    .iter()
                    .map(|m| decode_value::<u64>(codec::F_CHILDREN, m).map(InodeId::new))
                    .collect::<Result<Vec<_>, _>>()?;
                ids.sort();
                ids.dedup();
                if !ids.is_empty() {
                    raw.children.insert(name.clone(), ids);
                }
            }
        }

        if let Some(hlinks) = map.map(codec::F_HLINKS) {
            for (parent, _) in hlinks.iter() {
                let parent_id = match parent.parse::<InodeId>() {
                    Ok(id) => id,
                    Err(_) => {
                        warn!("inode {} has malformed hlinks key '{}'", ino, parent);
                        continue;
                    }
                };
                let field = format!("{}.{}", codec::F_HLINKS, parent);
                if let Some(name) = scalar::<String>(ino, hlinks, parent)
                    .map_err(|e| rename_field(e, &field))?
                {
                    raw.hlinks.insert(parent_id, name);
                }
            }
        }

        Ok(Some(raw))
    }

    /// Names whose slot holds more than one inode.
    pub fn conflicted_names(&self) -> Vec<String> {
        self.children
            .iter()
            .filter(|(_, members)| members.len() > 1)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Collapses the record into an [`Attr`]. Expects every slot to hold a
    /// single member; a leftover collision keeps its lowest id.
    pub fn into_attr(self) -> Attr {
        debug_assert!(
            self.conflicted_names().is_empty(),
            "inode {} collapsed with unresolved slots",
            self.ino
        );
        let kind = if self.is_file {
            AttrKind::File
        } else {
            AttrKind::Directory {
                children: self
                    .children
                    .into_iter()
                    .filter_map(|(name, members)| members.first().map(|id| (name, *id)))
                    .collect(),
            }
        };
        Attr {
            ino: self.ino,
            mode: self.mode,
            ctime: self.ctime,
            mtime: self.mtime,
            atime: self.atime,
            rdev: self.rdev,
            size: self.size,
            nlink: u32::try_from(self.nlink.max(0)).unwrap_or(u32::MAX),
            uid: self.uid,
            gid: self.gid,
            hlinks: self.hlinks,
            kind,
        }
    }
}

fn rename_field(err: MetaError, field: &str) -> MetaError {
    match err {
        MetaError::Codec { msg, .. } => MetaError::Codec {
            field: field.to_string(),
            msg,
        },
        other => other,
    }
}

/// Decodes a scalar register. Concurrent values resolve to the largest one so
/// every replica picks the same value.
fn scalar<T>(ino: InodeId, map: &MapValue, field: &str) -> Result<Option<T>, MetaError>
where
    T: DeserializeOwned + Ord,
{
    let values = match map.register(field) {
        Some(values) if !values.is_empty() => values,
        _ => return Ok(None),
    };
    let decoded = values
        .iter()
        .map(|bytes| decode_value::<T>(field, bytes))
        .collect::<Result<Vec<_>, _>>()?;
    if decoded.len() > 1 {
        warn!(
            "inode {} field '{}' has {} concurrent values, keeping the largest",
            ino,
            field,
            decoded.len()
        );
    }
    Ok(decoded.into_iter().max())
}

/// Reads and decodes a record without repairing it.
pub async fn read_raw(
    store: &dyn ReplicatedStore,
    ino: InodeId,
) -> Result<Option<RawAttr>, MetaError> {
    let map = store.read_map(&meta_handle(ino)).await?;
    RawAttr::decode(ino, &map)
}

/// Normalizing reader over a replicated store.
pub struct MetadataReader {
    store: Arc<dyn ReplicatedStore>,
    resolver: ConflictResolver,
    max_rounds: u32,
}

impl MetadataReader {
    /// Creates a reader; `inodes` supplies ids for merged directories.
    pub fn new(store: Arc<dyn ReplicatedStore>, inodes: Arc<InodeAllocator>) -> Self {
        let resolver = ConflictResolver::new(store.clone(), inodes);
        Self {
            store,
            resolver,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    /// Overrides the repair round limit.
    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }

    /// Store this reader reads from.
    pub fn store(&self) -> &Arc<dyn ReplicatedStore> {
        &self.store
    }

    /// Reads one inode as a single coherent record, repairing colliding
    /// directory entries first. `Ok(None)` means the inode does not exist.
    pub async fn read(&self, ino: InodeId) -> Result<Option<Attr>, MetaError> {
        for round in 0..=self.max_rounds {
            let raw = match read_raw(self.store.as_ref(), ino).await? {
                Some(raw) => raw,
                None => return Ok(None),
            };
            let conflicted = raw.conflicted_names();
            if conflicted.is_empty() {
                return Ok(Some(raw.into_attr()));
            }
            if round == self.max_rounds {
                break;
            }
            debug!(
                "inode {} round {}: repairing {} conflicted slot(s)",
                ino,
                round,
                conflicted.len()
            );
            for name in &conflicted {
                self.resolver.resolve(&raw, name).await?;
            }
        }
        Err(MetaError::Unresolved {
            ino,
            rounds: self.max_rounds,
        })
    }

    /// Reads a record without repairing it.
    pub async fn read_raw(&self, ino: InodeId) -> Result<Option<RawAttr>, MetaError> {
        read_raw(self.store.as_ref(), ino).await
    }

    /// Reads a content blob; `None` when it was never written. Concurrent
    /// writes resolve to the largest value.
    pub async fn read_data(&self, ino: InodeId) -> Result<Option<Vec<u8>>, MetaError> {
        let values = self.store.read_register(&data_handle(ino)).await?;
        if values.len() > 1 {
            warn!("data of inode {} has {} concurrent values", ino, values.len());
        }
        Ok(values.into_iter().max())
    }
}

impl std::fmt::Debug for MetadataReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataReader")
            .field("max_rounds", &self.max_rounds)
            .finish()
    }
}
