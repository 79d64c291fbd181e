//! Random inode id allocation.
//!
//! Replicas allocate without coordinating, so ids are drawn uniformly from
//! `[INODE_LOW, INODE_HIGH)` and checked against the local replica. Two
//! replicas can still pick the same id concurrently; the resolver treats
//! that like any other collision.

use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crdtfs_store::ReplicatedStore;

use crate::codec::meta_handle;
use crate::types::{InodeId, MetaError};

/// Lowest id handed out; everything below is reserved (root is 1).
pub const INODE_LOW: u64 = 1000;
/// Exclusive upper bound of allocated ids.
pub const INODE_HIGH: u64 = 1 << 20;
/// Draws attempted before giving up.
pub const MAX_ALLOC_ATTEMPTS: u32 = 16;

/// Hands out inode ids that are unused in the local replica.
pub struct InodeAllocator {
    store: Arc<dyn ReplicatedStore>,
    rng: Mutex<StdRng>,
    low: u64,
    high: u64,
}

impl InodeAllocator {
    /// Allocator seeded from OS entropy.
    pub fn new(store: Arc<dyn ReplicatedStore>) -> Self {
        Self::with_rng(store, StdRng::from_entropy())
    }

    /// Allocator with a fixed seed, for reproducible runs.
    pub fn with_seed(store: Arc<dyn ReplicatedStore>, seed: u64) -> Self {
        Self::with_rng(store, StdRng::seed_from_u64(seed))
    }

    fn with_rng(store: Arc<dyn ReplicatedStore>, rng: StdRng) -> Self {
        Self {
            store,
            rng: Mutex::new(rng),
            low: INODE_LOW,
            high: INODE_HIGH,
        }
    }

    /// Restricts the range ids are drawn from. `low..high` must be non-empty.
    pub fn with_range(mut self, low: u64, high: u64) -> Self {
        assert!(low < high, "empty inode range {}..{}", low, high);
        self.low = low;
        self.high = high;
        self
    }

    /// Draws one candidate id without checking the store.
    pub fn draw(&self) -> InodeId {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        InodeId::new(rng.gen_range(self.low..self.high))
    }

    /// Draws ids until one has no metadata in the local replica.
    pub async fn allocate(&self) -> Result<InodeId, MetaError> {
        for attempt in 1..=MAX_ALLOC_ATTEMPTS {
            let candidate = self.draw();
            let existing = self.store.read_map(&meta_handle(candidate)).await?;
            if existing.is_empty() {
                debug!("allocated inode {} after {} draw(s)", candidate, attempt);
                return Ok(candidate);
            }
            debug!("inode {} already in use, drawing again", candidate);
        }
        warn!(
            "no free inode id in {}..{} after {} attempts",
            self.low, self.high, MAX_ALLOC_ATTEMPTS
        );
        Err(MetaError::InodeSpaceExhausted {
            attempts: MAX_ALLOC_ATTEMPTS,
        })
    }
}

impl std::fmt::Debug for InodeAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeAllocator")
            .field("low", &self.low)
            .field("high", &self.high)
            .finish()
    }
}
