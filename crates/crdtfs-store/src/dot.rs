//! Dots and version vectors.
//!
//! Every write a replica applies is tagged with a fresh [`Dot`]. A replica's
//! [`VersionVector`] summarizes every dot it has observed, which is the causal
//! context used when two replica states are joined.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A unique write tag: the `counter`-th write issued by `site`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dot {
    /// Site that issued the write.
    pub site: u64,
    /// Per-site sequence number, starting at 1.
    pub counter: u64,
}

impl Dot {
    /// Creates a dot from its parts.
    pub fn new(site: u64, counter: u64) -> Self {
        Self { site, counter }
    }
}

impl fmt::Display for Dot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.site, self.counter)
    }
}

/// Per-site high-water marks of observed dots.
///
/// Replicas exchange whole states, so the dots a replica has seen from any
/// site always form a contiguous prefix `1..=n`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector(BTreeMap<u64, u64>);

impl VersionVector {
    /// Creates an empty version vector.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Highest counter observed from `site`.
    pub fn get(&self, site: u64) -> u64 {
        self.0.get(&site).copied().unwrap_or(0)
    }

    /// Issues the next dot for `site` and records it as observed.
    pub fn next_dot(&mut self, site: u64) -> Dot {
        let counter = self.0.entry(site).or_insert(0);
        *counter += 1;
        Dot::new(site, *counter)
    }

    /// Returns true if the dot has been observed.
    pub fn contains(&self, dot: &Dot) -> bool {
        self.get(dot.site) >= dot.counter
    }

    /// Pointwise maximum with another vector.
    pub fn merge(&mut self, other: &VersionVector) {
        for (site, counter) in &other.0 {
            let entry = self.0.entry(*site).or_insert(0);
            if *counter > *entry {
                *entry = *counter;
            }
        }
    }
}
