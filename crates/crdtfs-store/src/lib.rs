#![warn(missing_docs)]

//! crdtfs replicated store subsystem: typed CRDT handles, batched updates and
//! an in-memory replica used for tests and single-node mounts.

pub mod dot;
pub mod error;
pub mod handle;
pub mod memory;
pub mod store;
pub mod value;

pub use error::{Result, StoreError};
pub use handle::{Action, CounterHandle, FieldPath, MapHandle, NodeKind, Op, RegisterHandle, SetHandle};
pub use memory::MemoryStore;
pub use store::ReplicatedStore;
pub use value::{FieldValue, MapValue};
