//! The replicated store client interface.

use async_trait::async_trait;

use crate::error::Result;
use crate::handle::{MapHandle, Op, RegisterHandle};
use crate::value::MapValue;

/// Client session to a replicated, eventually-consistent CRDT store.
///
/// A single [`update`](ReplicatedStore::update) batch is applied together at
/// the local replica. The store promises convergence across replicas, not
/// cross-key atomicity or mutual exclusion.
#[async_trait]
pub trait ReplicatedStore: Send + Sync {
    /// Reads a map. An absent object reads as an empty map.
    async fn read_map(&self, map: &MapHandle) -> Result<MapValue>;

    /// Reads every concurrently assigned value of a register (empty when unset).
    async fn read_register(&self, register: &RegisterHandle) -> Result<Vec<Vec<u8>>>;

    /// Applies a batch of operations.
    async fn update(&self, ops: Vec<Op>) -> Result<()>;

    /// Ends the session; later calls fail with [`crate::StoreError::Closed`].
    async fn close(&self) -> Result<()>;
}
