//! In-memory replica of the CRDT store.
//!
//! Each `MemoryStore` is one replica (site). Every leaf field is a dot store:
//! its entries are tagged with the [`Dot`] of the write that produced them,
//! and the replica's [`VersionVector`] records every dot it has observed.
//! Joining two replica states keeps an entry if both sides have it, or if one
//! side has it and the other has never observed its dot. That single rule
//! yields multi-value registers, add-wins sets, mergeable counters and
//! removable map fields.
//!
//! Clones share the same replica; use [`MemoryStore::fork`] for a new site.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::dot::{Dot, VersionVector};
use crate::error::{Result, StoreError};
use crate::handle::{Action, FieldPath, MapHandle, NodeKind, Op, RegisterHandle};
use crate::store::ReplicatedStore;
use crate::value::{FieldValue, MapValue};

type Fields = BTreeMap<String, Node>;

#[derive(Clone, Debug)]
enum Node {
    Register(BTreeMap<Dot, Vec<u8>>),
    Counter(BTreeMap<Dot, i64>),
    Set(BTreeMap<Vec<u8>, BTreeSet<Dot>>),
    Map(Fields),
}

impl Node {
    fn empty(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Register => Node::Register(BTreeMap::new()),
            NodeKind::Counter => Node::Counter(BTreeMap::new()),
            NodeKind::Set => Node::Set(BTreeMap::new()),
            NodeKind::Map => Node::Map(BTreeMap::new()),
        }
    }

    fn kind(&self) -> NodeKind {
        match self {
            Node::Register(_) => NodeKind::Register,
            Node::Counter(_) => NodeKind::Counter,
            Node::Set(_) => NodeKind::Set,
            Node::Map(_) => NodeKind::Map,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Node::Register(entries) => entries.is_empty(),
            Node::Counter(entries) => entries.is_empty(),
            Node::Set(elements) => elements.values().all(BTreeSet::is_empty),
            Node::Map(fields) => fields.values().all(Node::is_empty),
        }
    }

    /// Drops empty set elements and empty map fields.
    fn prune(&mut self) {
        match self {
            Node::Set(elements) => elements.retain(|_, dots| !dots.is_empty()),
            Node::Map(fields) => prune_fields(fields),
            Node::Register(_) | Node::Counter(_) => {}
        }
    }

    fn join(&mut self, ctx: &VersionVector, other: &Node, other_ctx: &VersionVector) {
        match (self, other) {
            (Node::Register(ours), Node::Register(theirs)) => {
                join_dots(ours, ctx, theirs, other_ctx)
            }
            (Node::Counter(ours), Node::Counter(theirs)) => join_dots(ours, ctx, theirs, other_ctx),
            (Node::Set(ours), Node::Set(theirs)) => {
                let elements: BTreeSet<Vec<u8>> =
                    ours.keys().chain(theirs.keys()).cloned().collect();
                let none = BTreeSet::new();
                for element in elements {
                    let their_dots = theirs.get(&element).unwrap_or(&none);
                    let our_dots = ours.entry(element).or_default();
                    join_dot_set(our_dots, ctx, their_dots, other_ctx);
                }
                ours.retain(|_, dots| !dots.is_empty());
            }
            (Node::Map(ours), Node::Map(theirs)) => join_fields(ours, ctx, theirs, other_ctx),
            (ours, theirs) => {
                warn!(
                    "keeping local {} over concurrent {} during merge",
                    ours.kind(),
                    theirs.kind()
                );
            }
        }
    }

    fn value(&self) -> FieldValue {
        match self {
            Node::Register(entries) => FieldValue::Register(register_values(entries)),
            Node::Counter(entries) => FieldValue::Counter(entries.values().sum()),
            Node::Set(elements) => FieldValue::Set(
                elements
                    .iter()
                    .filter(|(_, dots)| !dots.is_empty())
                    .map(|(element, _)| element.clone())
                    .collect(),
            ),
            Node::Map(fields) => FieldValue::Map(map_value(fields)),
        }
    }
}

fn register_values(entries: &BTreeMap<Dot, Vec<u8>>) -> Vec<Vec<u8>> {
    let values: BTreeSet<&Vec<u8>> = entries.values().collect();
    values.into_iter().cloned().collect()
}

fn map_value(fields: &Fields) -> MapValue {
    let mut value = MapValue::new();
    for (name, node) in fields {
        if !node.is_empty() {
            value.insert(name.clone(), node.value());
        }
    }
    value
}

fn prune_fields(fields: &mut Fields) {
    for node in fields.values_mut() {
        node.prune();
    }
    fields.retain(|_, node| !node.is_empty());
}

fn join_dots<V: Clone>(
    ours: &mut BTreeMap<Dot, V>,
    ctx: &VersionVector,
    theirs: &BTreeMap<Dot, V>,
    other_ctx: &VersionVector,
) {
    ours.retain(|dot, _| theirs.contains_key(dot) || !other_ctx.contains(dot));
    for (dot, value) in theirs {
        if !ours.contains_key(dot) && !ctx.contains(dot) {
            ours.insert(*dot, value.clone());
        }
    }
}

fn join_dot_set(
    ours: &mut BTreeSet<Dot>,
    ctx: &VersionVector,
    theirs: &BTreeSet<Dot>,
    other_ctx: &VersionVector,
) {
    ours.retain(|dot| theirs.contains(dot) || !other_ctx.contains(dot));
    for dot in theirs {
        if !ours.contains(dot) && !ctx.contains(dot) {
            ours.insert(*dot);
        }
    }
}

fn join_fields(ours: &mut Fields, ctx: &VersionVector, theirs: &Fields, other_ctx: &VersionVector) {
    let names: BTreeSet<String> = ours.keys().chain(theirs.keys()).cloned().collect();
    for name in names {
        let their_node = theirs.get(&name);
        if let Some(our_node) = ours.get_mut(&name) {
            let empty;
            let their_node = match their_node {
                Some(node) => node,
                None => {
                    empty = Node::empty(our_node.kind());
                    &empty
                }
            };
            our_node.join(ctx, their_node, other_ctx);
        } else if let Some(their_node) = their_node {
            let mut fresh = Node::empty(their_node.kind());
            fresh.join(ctx, their_node, other_ctx);
            ours.insert(name, fresh);
        }
    }
    prune_fields(ours);
}

/// Walks to the node at `path`, creating intermediate maps and the target
/// when `create` is set.
fn locate<'a>(
    root: &'a mut Fields,
    path: &FieldPath,
    kind: NodeKind,
    create: bool,
) -> Result<Option<&'a mut Node>> {
    let mut segments: Vec<&str> = Vec::with_capacity(path.fields().len() + 1);
    segments.push(path.key());
    segments.extend(path.fields().iter().map(String::as_str));
    let target = segments.pop().unwrap_or_default();

    let mut fields = root;
    for segment in segments {
        if create {
            fields
                .entry(segment.to_string())
                .or_insert_with(|| Node::empty(NodeKind::Map));
        }
        match fields.get_mut(segment) {
            Some(Node::Map(inner)) => fields = inner,
            Some(other) => {
                return Err(StoreError::TypeMismatch {
                    path: path.to_string(),
                    expected: NodeKind::Map,
                    found: other.kind(),
                })
            }
            None => return Ok(None),
        }
    }

    if create {
        fields
            .entry(target.to_string())
            .or_insert_with(|| Node::empty(kind));
    }
    match fields.get_mut(target) {
        Some(node) if node.kind() == kind => Ok(Some(node)),
        Some(node) => Err(StoreError::TypeMismatch {
            path: path.to_string(),
            expected: kind,
            found: node.kind(),
        }),
        None => Ok(None),
    }
}

/// Full state of one replica.
#[derive(Clone, Debug)]
struct Replica {
    site: u64,
    clock: VersionVector,
    objects: Fields,
    closed: bool,
}

impl Replica {
    fn new(site: u64) -> Self {
        Self {
            site,
            clock: VersionVector::new(),
            objects: BTreeMap::new(),
            closed: false,
        }
    }

    fn apply(&mut self, op: &Op) -> Result<()> {
        let kind = op.action.node_kind();
        let node = match locate(&mut self.objects, &op.path, kind, op.action.creates())? {
            Some(node) => node,
            None => return Ok(()),
        };
        let site = self.site;
        let clock = &mut self.clock;

        match (&op.action, node) {
            (Action::Assign(value), Node::Register(entries)) => {
                entries.clear();
                entries.insert(clock.next_dot(site), value.clone());
            }
            (Action::ClearRegister, Node::Register(entries)) => entries.clear(),
            (Action::Increment(delta), Node::Counter(entries)) => {
                entries.insert(clock.next_dot(site), *delta);
            }
            (Action::SetCounter(value), Node::Counter(entries)) => {
                entries.clear();
                entries.insert(clock.next_dot(site), *value);
            }
            (Action::AddElements(elements), Node::Set(set)) => {
                let dot = clock.next_dot(site);
                for element in elements {
                    let dots = set.entry(element.clone()).or_default();
                    dots.clear();
                    dots.insert(dot);
                }
            }
            (Action::RemoveElements(elements), Node::Set(set)) => {
                for element in elements {
                    set.remove(element);
                }
            }
            (Action::RemoveFields(names), Node::Map(fields)) => {
                for name in names {
                    fields.remove(name);
                }
            }
            // locate() only returns nodes of the action's kind
            (action, node) => {
                return Err(StoreError::TypeMismatch {
                    path: op.path.to_string(),
                    expected: action.node_kind(),
                    found: node.kind(),
                })
            }
        }
        Ok(())
    }

    fn merge(&mut self, other: &Replica) {
        join_fields(&mut self.objects, &self.clock, &other.objects, &other.clock);
        self.clock.merge(&other.clock);
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Thread-safe handle to one in-memory replica.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    replica: Arc<RwLock<Replica>>,
}

impl MemoryStore {
    /// Creates an empty replica for `site`.
    pub fn new(site: u64) -> Self {
        Self {
            replica: Arc::new(RwLock::new(Replica::new(site))),
        }
    }

    /// Site id of this replica.
    pub fn site(&self) -> Result<u64> {
        Ok(self.read_state()?.site)
    }

    /// Creates a new replica for `site` starting from a copy of this state.
    pub fn fork(&self, site: u64) -> Result<MemoryStore> {
        let mut copy = self.read_state()?.clone();
        copy.site = site;
        copy.closed = false;
        Ok(Self {
            replica: Arc::new(RwLock::new(copy)),
        })
    }

    /// Joins `other`'s state into this replica.
    pub fn merge_from(&self, other: &MemoryStore) -> Result<()> {
        if Arc::ptr_eq(&self.replica, &other.replica) {
            return Ok(());
        }
        let snapshot = other.read_state()?.clone();
        let mut state = self.write_state()?;
        state.merge(&snapshot);
        debug!(site = state.site, from = snapshot.site, "merged replica state");
        Ok(())
    }

    /// Exchanges state in both directions so the two replicas converge.
    pub fn sync_with(&self, other: &MemoryStore) -> Result<()> {
        self.merge_from(other)?;
        other.merge_from(self)
    }

    /// Names of the top-level objects currently holding data.
    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self.read_state()?.objects.keys().cloned().collect())
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, Replica>> {
        self.replica
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, Replica>> {
        self.replica
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

#[async_trait]
impl ReplicatedStore for MemoryStore {
    async fn read_map(&self, map: &MapHandle) -> Result<MapValue> {
        let mut state = self.write_state()?;
        state.check_open()?;
        match locate(&mut state.objects, map.path(), NodeKind::Map, false)? {
            Some(Node::Map(fields)) => Ok(map_value(fields)),
            _ => Ok(MapValue::new()),
        }
    }

    async fn read_register(&self, register: &RegisterHandle) -> Result<Vec<Vec<u8>>> {
        let mut state = self.write_state()?;
        state.check_open()?;
        match locate(&mut state.objects, register.path(), NodeKind::Register, false)? {
            Some(Node::Register(entries)) => Ok(register_values(entries)),
            _ => Ok(Vec::new()),
        }
    }

    async fn update(&self, ops: Vec<Op>) -> Result<()> {
        let mut state = self.write_state()?;
        state.check_open()?;
        debug!(site = state.site, ops = ops.len(), "applying update batch");
        for op in &ops {
            state.apply(op)?;
        }
        prune_fields(&mut state.objects);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.write_state()?;
        state.closed = true;
        Ok(())
    }
}
