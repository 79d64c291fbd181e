//! Attribute records to store operations.
//!
//! An inode lives under `inode_<id>` as a map of registers (scalars), one
//! counter (`nlink`), a `children` map of name to add-wins set and an
//! `hlinks` map of parent id to name register. Directory entries are always
//! written as set additions, never by overwriting the set, so concurrent
//! creates under one name merge instead of losing an entry.
//!
//! Scalars are serialized with bincode; file content goes into `data_<id>`
//! as raw bytes.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crdtfs_store::{MapHandle, Op, RegisterHandle};

use crate::types::{Attr, AttrKind, InodeId, MetaError};

/// Field holding the inode's own id.
pub const F_INODE: &str = "inode";
/// Field holding type and permission bits.
pub const F_MODE: &str = "mode";
/// Field holding the change time.
pub const F_CTIME: &str = "ctime";
/// Field holding the modification time.
pub const F_MTIME: &str = "mtime";
/// Field holding the access time.
pub const F_ATIME: &str = "atime";
/// Field holding the device number.
pub const F_RDEV: &str = "rdev";
/// Field holding the byte size.
pub const F_SIZE: &str = "size";
/// Counter field holding the link count.
pub const F_NLINK: &str = "nlink";
/// Field holding the owner.
pub const F_UID: &str = "uid";
/// Field holding the group.
pub const F_GID: &str = "gid";
/// Field discriminating files from directories.
pub const F_IS_FILE: &str = "isFile";
/// Map of entry name to set of child inodes.
pub const F_CHILDREN: &str = "children";
/// Map of parent inode to entry name.
pub const F_HLINKS: &str = "hlinks";

/// Every field of an inode record.
pub const ALL_FIELDS: [&str; 13] = [
    F_INODE, F_MODE, F_CTIME, F_MTIME, F_ATIME, F_RDEV, F_SIZE, F_NLINK, F_UID, F_GID, F_IS_FILE,
    F_CHILDREN, F_HLINKS,
];

/// Handle to an inode's metadata map.
pub fn meta_handle(ino: InodeId) -> MapHandle {
    MapHandle::new(ino.meta_key())
}

/// Handle to an inode's content register.
pub fn data_handle(ino: InodeId) -> RegisterHandle {
    RegisterHandle::new(ino.data_key())
}

/// Serializes one field value.
pub fn encode_value<T: Serialize>(field: &str, value: &T) -> Result<Vec<u8>, MetaError> {
    bincode::serialize(value).map_err(|e| MetaError::Codec {
        field: field.to_string(),
        msg: e.to_string(),
    })
}

/// Deserializes one field value.
pub fn decode_value<T: DeserializeOwned>(field: &str, bytes: &[u8]) -> Result<T, MetaError> {
    bincode::deserialize(bytes).map_err(|e| MetaError::Codec {
        field: field.to_string(),
        msg: e.to_string(),
    })
}

/// Full write of a record: scalars, link count, entries and back-references.
pub fn encode(attr: &Attr) -> Result<Vec<Op>, MetaError> {
    let map = meta_handle(attr.ino);
    let mut ops = encode_scalars(attr)?;
    ops.push(map.counter(F_NLINK).set(i64::from(attr.nlink)));

    if let AttrKind::Directory { children } = &attr.kind {
        for (name, child) in children {
            ops.push(encode_add_child(attr.ino, name, *child)?);
        }
    }
    for (parent, name) in &attr.hlinks {
        ops.push(encode_hlink(attr.ino, *parent, name)?);
    }
    Ok(ops)
}

/// Every scalar register of an inode record.
pub const SCALAR_FIELDS: [&str; 10] = [
    F_INODE, F_MODE, F_CTIME, F_MTIME, F_ATIME, F_RDEV, F_SIZE, F_UID, F_GID, F_IS_FILE,
];

/// Scalar registers only, never touching the link count or re-adding
/// removed entries.
pub fn encode_scalars(attr: &Attr) -> Result<Vec<Op>, MetaError> {
    encode_fields(attr, &SCALAR_FIELDS)
}

/// Registers for the listed scalar fields of `attr` and nothing else.
///
/// Updates that name only the fields they changed let concurrent writers
/// of disjoint fields merge without either side reassigning the other's.
pub fn encode_fields(attr: &Attr, fields: &[&str]) -> Result<Vec<Op>, MetaError> {
    fields.iter().map(|field| encode_scalar(attr, field)).collect()
}

fn encode_scalar(attr: &Attr, field: &str) -> Result<Op, MetaError> {
    let bytes = match field {
        F_INODE => encode_value(field, &attr.ino.as_u64())?,
        F_MODE => encode_value(field, &attr.mode)?,
        F_CTIME => encode_value(field, &attr.ctime)?,
        F_MTIME => encode_value(field, &attr.mtime)?,
        F_ATIME => encode_value(field, &attr.atime)?,
        F_RDEV => encode_value(field, &attr.rdev)?,
        F_SIZE => encode_value(field, &attr.size)?,
        F_UID => encode_value(field, &attr.uid)?,
        F_GID => encode_value(field, &attr.gid)?,
        F_IS_FILE => encode_value(field, &attr.is_file())?,
        other => {
            return Err(MetaError::Codec {
                field: other.to_string(),
                msg: "not a scalar register".to_string(),
            })
        }
    };
    Ok(meta_handle(attr.ino).register(field).set(bytes))
}

/// Removes every field of the record in one operation.
pub fn encode_delete(ino: InodeId) -> Op {
    meta_handle(ino).remove_fields(ALL_FIELDS)
}

/// Removes the whole `name` slot, whatever members it holds.
pub fn encode_delete_child_slot(parent: InodeId, name: &str) -> Op {
    meta_handle(parent).map(F_CHILDREN).remove_fields([name])
}

/// Adds `child` to the `name` slot of `parent`.
pub fn encode_add_child(parent: InodeId, name: &str, child: InodeId) -> Result<Op, MetaError> {
    Ok(meta_handle(parent)
        .map(F_CHILDREN)
        .set(name)
        .add(encode_value(F_CHILDREN, &child.as_u64())?))
}

/// Removes only `child`'s membership from the `name` slot of `parent`.
pub fn encode_remove_child_member(
    parent: InodeId,
    name: &str,
    child: InodeId,
) -> Result<Op, MetaError> {
    Ok(meta_handle(parent)
        .map(F_CHILDREN)
        .set(name)
        .remove(encode_value(F_CHILDREN, &child.as_u64())?))
}

/// Sets `hlinks[parent] = name` on `ino`.
pub fn encode_hlink(ino: InodeId, parent: InodeId, name: &str) -> Result<Op, MetaError> {
    Ok(meta_handle(ino)
        .map(F_HLINKS)
        .register(parent.to_string())
        .set(encode_value(F_HLINKS, &name)?))
}

/// Drops `hlinks[parent]` on `ino`.
pub fn encode_remove_hlink(ino: InodeId, parent: InodeId) -> Op {
    meta_handle(ino)
        .map(F_HLINKS)
        .remove_fields([parent.to_string()])
}

/// New hard link: bumps `nlink` and records the back-reference together.
pub fn encode_link(ino: InodeId, parent: InodeId, name: &str) -> Result<Vec<Op>, MetaError> {
    Ok(vec![
        meta_handle(ino).counter(F_NLINK).increment(1),
        encode_hlink(ino, parent, name)?,
    ])
}

/// Removed hard link: drops the back-reference and decrements `nlink` together.
pub fn encode_unlink(attr: &Attr, parent: InodeId) -> Vec<Op> {
    debug_assert!(attr.is_file(), "unlink encoded for directory {}", attr.ino);
    vec![
        encode_remove_hlink(attr.ino, parent),
        encode_drop_link_count(attr.ino),
    ]
}

/// One fewer link, with the back-reference handled by the caller.
pub fn encode_drop_link_count(ino: InodeId) -> Op {
    meta_handle(ino).counter(F_NLINK).decrement(1)
}

/// Replaces the content blob.
pub fn encode_data(ino: InodeId, data: impl Into<Vec<u8>>) -> Op {
    data_handle(ino).set(data)
}

/// Drops the content blob.
pub fn encode_delete_data(ino: InodeId) -> Op {
    data_handle(ino).clear()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
    use crdtfs_store::Action;

    #[test]
    fn test_encode_file_ops() {
        let mut attr = Attr::new_file(InodeId::new(1500), DEFAULT_FILE_MODE, 11);
        attr.add_hard_link_ref(InodeId::ROOT_INODE, "file.txt");

        let ops = encode(&attr).unwrap();
        // 10 scalars + nlink + one hlink
        assert_eq!(ops.len(), 12);
        assert!(ops.iter().all(|op| op.path.key() == "inode_1500"));
        assert!(ops
            .iter()
            .any(|op| op.path.fields() == [F_NLINK] && op.action == Action::SetCounter(1)));
        assert!(ops
            .iter()
            .any(|op| op.path.fields() == [F_HLINKS.to_string(), "1".to_string()]));
    }

    #[test]
    fn test_encode_directory_adds_children_individually() {
        let mut attr = Attr::new_directory(InodeId::new(1600), DEFAULT_DIR_MODE);
        attr.add_child("a", InodeId::new(2000));
        attr.add_child("b", InodeId::new(2001));

        let ops = encode(&attr).unwrap();
        let adds: Vec<&Op> = ops
            .iter()
            .filter(|op| matches!(op.action, Action::AddElements(_)))
            .collect();
        assert_eq!(adds.len(), 2);
        assert_eq!(adds[0].path.to_string(), "inode_1600/children/a");
        assert_eq!(adds[1].path.to_string(), "inode_1600/children/b");
    }

    #[test]
    fn test_encode_scalars_skips_collections() {
        let mut attr = Attr::new_directory(InodeId::new(1600), DEFAULT_DIR_MODE);
        attr.add_child("a", InodeId::new(2000));
        let ops = encode_scalars(&attr).unwrap();
        assert_eq!(ops.len(), 10);
        assert!(ops
            .iter()
            .all(|op| matches!(op.action, Action::Assign(_))));
    }

    #[test]
    fn test_encode_fields_writes_only_named_registers() {
        let attr = Attr::new_file(InodeId::new(1500), DEFAULT_FILE_MODE, 3);
        let ops = encode_fields(&attr, &[F_MODE, F_CTIME]).unwrap();
        let fields: Vec<String> = ops.iter().map(|op| op.path.to_string()).collect();
        assert_eq!(fields, vec!["inode_1500/mode", "inode_1500/ctime"]);

        assert!(matches!(
            encode_fields(&attr, &[F_NLINK]),
            Err(MetaError::Codec { .. })
        ));
        assert!(encode_fields(&attr, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_encode_delete_covers_every_field() {
        let op = encode_delete(InodeId::new(3));
        assert_eq!(op.path.to_string(), "inode_3");
        match op.action {
            Action::RemoveFields(fields) => {
                assert_eq!(fields.len(), ALL_FIELDS.len());
                assert!(fields.iter().any(|f| f == F_CHILDREN));
                assert!(fields.iter().any(|f| f == F_HLINKS));
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_encode_unlink_pairs_hlink_and_counter() {
        let attr = Attr::new_file(InodeId::new(2000), DEFAULT_FILE_MODE, 0);
        let ops = encode_unlink(&attr, InodeId::new(1700));
        assert_eq!(ops.len(), 2);
        assert_eq!(
            ops[0].action,
            Action::RemoveFields(vec!["1700".to_string()])
        );
        assert_eq!(ops[1].action, Action::Increment(-1));
    }

    #[test]
    fn test_child_slot_ops() {
        let parent = InodeId::new(1);
        let slot = encode_delete_child_slot(parent, "x");
        assert_eq!(slot.path.to_string(), "inode_1/children");
        assert_eq!(slot.action, Action::RemoveFields(vec!["x".to_string()]));

        let remove = encode_remove_child_member(parent, "x", InodeId::new(5)).unwrap();
        assert_eq!(remove.path.to_string(), "inode_1/children/x");
        assert!(matches!(remove.action, Action::RemoveElements(_)));
    }

    #[test]
    fn test_value_round_trip() {
        let bytes = encode_value(F_HLINKS, &"hello".to_string()).unwrap();
        let back: String = decode_value(F_HLINKS, &bytes).unwrap();
        assert_eq!(back, "hello");
        assert!(decode_value::<u64>(F_SIZE, &[1, 2]).is_err());
    }
}
