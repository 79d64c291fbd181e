//! Typed CRDT handles and the operations they build.
//!
//! Handles only describe *where* a field lives; they never touch the store.
//! Every mutating method returns an [`Op`] that is later submitted as part of
//! a batch through [`crate::ReplicatedStore::update`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// The CRDT type of a stored field.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Multi-value register.
    Register,
    /// Counter supporting increment and reset-to-value.
    Counter,
    /// Add-wins set.
    Set,
    /// Map of named nested fields.
    Map,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::Register => "register",
            NodeKind::Counter => "counter",
            NodeKind::Set => "set",
            NodeKind::Map => "map",
        };
        f.write_str(name)
    }
}

/// Location of a field: a top-level key followed by nested map field names.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldPath {
    key: String,
    fields: Vec<String>,
}

impl FieldPath {
    /// Path of a top-level object.
    pub fn root(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: Vec::new(),
        }
    }

    /// Path of a field nested inside the map at this path.
    pub fn child(&self, field: impl Into<String>) -> Self {
        let mut fields = self.fields.clone();
        fields.push(field.into());
        Self {
            key: self.key.clone(),
            fields,
        }
    }

    /// Top-level key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Nested field names below the top-level key.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)?;
        for field in &self.fields {
            write!(f, "/{}", field)?;
        }
        Ok(())
    }
}

/// A mutation of one field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Replace every observed register value with this one.
    Assign(Vec<u8>),
    /// Drop every observed register value.
    ClearRegister,
    /// Add a (possibly negative) delta to a counter.
    Increment(i64),
    /// Reset a counter to a value; concurrent increments still apply.
    SetCounter(i64),
    /// Add elements to a set.
    AddElements(Vec<Vec<u8>>),
    /// Remove observed elements from a set.
    RemoveElements(Vec<Vec<u8>>),
    /// Remove named fields, with everything nested below them, from a map.
    RemoveFields(Vec<String>),
}

impl Action {
    /// CRDT type the targeted field must have.
    pub fn node_kind(&self) -> NodeKind {
        match self {
            Action::Assign(_) | Action::ClearRegister => NodeKind::Register,
            Action::Increment(_) | Action::SetCounter(_) => NodeKind::Counter,
            Action::AddElements(_) | Action::RemoveElements(_) => NodeKind::Set,
            Action::RemoveFields(_) => NodeKind::Map,
        }
    }

    /// Whether applying the action materializes a missing field.
    pub fn creates(&self) -> bool {
        matches!(
            self,
            Action::Assign(_) | Action::Increment(_) | Action::SetCounter(_) | Action::AddElements(_)
        )
    }
}

/// One operation of an update batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    /// Field the action applies to.
    pub path: FieldPath,
    /// What to do with it.
    pub action: Action,
}

impl Op {
    /// Builds an operation.
    pub fn new(path: FieldPath, action: Action) -> Self {
        Self { path, action }
    }
}

/// Handle to a map, either a top-level object or a nested field.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MapHandle {
    path: FieldPath,
}

impl MapHandle {
    /// Handle to the top-level map stored under `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            path: FieldPath::root(key),
        }
    }

    /// Location of this map.
    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    /// Register field of this map.
    pub fn register(&self, field: impl Into<String>) -> RegisterHandle {
        RegisterHandle {
            path: self.path.child(field),
        }
    }

    /// Counter field of this map.
    pub fn counter(&self, field: impl Into<String>) -> CounterHandle {
        CounterHandle {
            path: self.path.child(field),
        }
    }

    /// Set field of this map.
    pub fn set(&self, field: impl Into<String>) -> SetHandle {
        SetHandle {
            path: self.path.child(field),
        }
    }

    /// Nested map field of this map.
    pub fn map(&self, field: impl Into<String>) -> MapHandle {
        MapHandle {
            path: self.path.child(field),
        }
    }

    /// Removes the named fields in a single operation.
    pub fn remove_fields<I, S>(&self, fields: I) -> Op
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Op::new(
            self.path.clone(),
            Action::RemoveFields(fields.into_iter().map(Into::into).collect()),
        )
    }
}

/// Handle to a multi-value register.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RegisterHandle {
    path: FieldPath,
}

impl RegisterHandle {
    /// Handle to the top-level register stored under `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            path: FieldPath::root(key),
        }
    }

    /// Location of this register.
    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    /// Assigns a value.
    pub fn set(&self, value: impl Into<Vec<u8>>) -> Op {
        Op::new(self.path.clone(), Action::Assign(value.into()))
    }

    /// Drops the register's observed values.
    pub fn clear(&self) -> Op {
        Op::new(self.path.clone(), Action::ClearRegister)
    }
}

/// Handle to a counter.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CounterHandle {
    path: FieldPath,
}

impl CounterHandle {
    /// Location of this counter.
    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    /// Adds `delta` to the counter.
    pub fn increment(&self, delta: i64) -> Op {
        Op::new(self.path.clone(), Action::Increment(delta))
    }

    /// Subtracts `delta` from the counter.
    pub fn decrement(&self, delta: i64) -> Op {
        Op::new(self.path.clone(), Action::Increment(-delta))
    }

    /// Resets the counter to `value`.
    pub fn set(&self, value: i64) -> Op {
        Op::new(self.path.clone(), Action::SetCounter(value))
    }
}

/// Handle to an add-wins set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SetHandle {
    path: FieldPath,
}

impl SetHandle {
    /// Location of this set.
    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    /// Adds one element.
    pub fn add(&self, element: impl Into<Vec<u8>>) -> Op {
        Op::new(self.path.clone(), Action::AddElements(vec![element.into()]))
    }

    /// Adds several elements in one operation.
    pub fn add_all<I>(&self, elements: I) -> Op
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        Op::new(
            self.path.clone(),
            Action::AddElements(elements.into_iter().collect()),
        )
    }

    /// Removes one element.
    pub fn remove(&self, element: impl Into<Vec<u8>>) -> Op {
        Op::new(self.path.clone(), Action::RemoveElements(vec![element.into()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_paths() {
        let inode = MapHandle::new("inode_1");
        let slot = inode.map("children").set("a.txt");
        assert_eq!(slot.path().key(), "inode_1");
        assert_eq!(slot.path().fields(), &["children".to_string(), "a.txt".to_string()]);
        assert_eq!(slot.path().to_string(), "inode_1/children/a.txt");
    }

    #[test]
    fn test_action_kinds() {
        let inode = MapHandle::new("inode_9");
        assert_eq!(inode.register("size").set(vec![1]).action.node_kind(), NodeKind::Register);
        assert_eq!(inode.counter("nlink").decrement(1).action, Action::Increment(-1));
        assert_eq!(inode.set("s").remove(vec![2]).action.node_kind(), NodeKind::Set);
        assert_eq!(
            inode.remove_fields(["size", "mode"]).action,
            Action::RemoveFields(vec!["size".to_string(), "mode".to_string()])
        );
    }

    #[test]
    fn test_removals_do_not_create() {
        assert!(!Action::ClearRegister.creates());
        assert!(!Action::RemoveElements(vec![]).creates());
        assert!(!Action::RemoveFields(vec![]).creates());
        assert!(Action::SetCounter(3).creates());
    }
}
