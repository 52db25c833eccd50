//! Load-balancing index selection.
//!
//! Given a strategy, a selection key and a candidate count, [`Selector`]
//! returns an index into the candidate list. Round-robin counters are kept
//! per key for the lifetime of the selector.

use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Load-balancing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Always the first candidate
    First,
    /// Uniform pick from the OS random source
    #[default]
    Random,
    /// Per-key cyclic order
    RoundRobin,
    /// Hash of the key salted with the current time; not stable across calls
    Hash,
}

impl Strategy {
    /// Parse a configured strategy name. Unknown names fall back to random.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "first" => Strategy::First,
            "random" | "rand" => Strategy::Random,
            "round_robin" | "rr" => Strategy::RoundRobin,
            "hash" => Strategy::Hash,
            other => {
                tracing::warn!(strategy = %other, "Unknown load balancing strategy, using random");
                Strategy::Random
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::First => "first",
            Strategy::Random => "random",
            Strategy::RoundRobin => "round_robin",
            Strategy::Hash => "hash",
        }
    }
}

/// Index selector holding the round-robin counters.
pub struct Selector {
    counters: DashMap<String, Arc<AtomicU32>>,
}

impl Selector {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Pick an index in `[0, n)`.
    ///
    /// Callers must not pass `n == 0`; it is treated like a single candidate
    /// and yields 0.
    pub fn select(&self, strategy: Strategy, key: &str, n: usize) -> usize {
        // Nothing to rotate; round-robin counters only advance on a real choice
        if n <= 1 {
            return 0;
        }

        match strategy {
            Strategy::First => 0,
            Strategy::Random => OsRng.gen_range(0..n),
            Strategy::RoundRobin => self.next_round_robin(key, n),
            Strategy::Hash => hash_index(key, n),
        }
    }

    fn next_round_robin(&self, key: &str, n: usize) -> usize {
        let counter = match self.counters.get(key) {
            Some(counter) => counter.clone(),
            None => self
                .counters
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AtomicU32::new(0)))
                .clone(),
        };

        // Wraps at u32::MAX
        let ticket = counter.fetch_add(1, Ordering::Relaxed);
        ticket as usize % n
    }

    /// Number of keys with a round-robin counter.
    pub fn tracked_keys(&self) -> usize {
        self.counters.len()
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_index(key: &str, n: usize) -> usize {
    let salt = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();

    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    salt.hash(&mut hasher);
    (hasher.finish() % n as u64) as usize
}
