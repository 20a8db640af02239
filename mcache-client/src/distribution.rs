//! # Key Distribution
//!
//! Purpose: Map a namespaced key to the index of the server that owns it.
//!
//! ## Design Principles
//! 1. **Closed Strategy Set**: `Distribution` names the strategies; each one
//!    satisfies the same contract (same key, same pool => same server).
//! 2. **Build Once**: Ring state is computed at construction and shared by
//!    clones through an `Arc`.
//! 3. **libmemcached Compatibility**: Modula uses the one-at-a-time hash and
//!    the ring follows the ketama point layout.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use md5::{Digest, Md5};

use crate::error::Error;
use crate::server::ServerPool;

/// Virtual nodes placed on the ring per server.
const POINTS_PER_SERVER: usize = 160;

/// Named distribution strategy selected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Distribution {
    /// Hash the key and reduce modulo the pool length.
    #[default]
    Modula,
    /// Ketama consistent hashing; pool changes remap ~1/N of keys.
    Consistent,
}

impl FromStr for Distribution {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "modula" => Ok(Distribution::Modula),
            "consistent" | "ketama" => Ok(Distribution::Consistent),
            other => Err(Error::Configuration(format!("unknown distribution {other:?}"))),
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::Modula => f.write_str("modula"),
            Distribution::Consistent => f.write_str("consistent"),
        }
    }
}

/// Prepared selector for one server pool.
#[derive(Debug, Clone)]
pub(crate) enum Distributor {
    Modula { servers: usize },
    Consistent(Arc<Ring>),
}

impl Distributor {
    pub(crate) fn new(distribution: Distribution, pool: &ServerPool) -> Self {
        match distribution {
            Distribution::Modula => Distributor::Modula {
                servers: pool.len(),
            },
            Distribution::Consistent => {
                let identities: Vec<String> = pool.iter().map(|s| s.to_string()).collect();
                Distributor::Consistent(Arc::new(Ring::build(&identities)))
            }
        }
    }

    /// Returns the owning server index for `key`.
    #[inline]
    pub(crate) fn select(&self, key: &[u8]) -> usize {
        match self {
            Distributor::Modula { servers } => {
                if *servers <= 1 {
                    return 0;
                }
                one_at_a_time(key) as usize % servers
            }
            Distributor::Consistent(ring) => ring.route(key),
        }
    }
}

/// Jenkins one-at-a-time hash, the libmemcached default key hash.
pub fn one_at_a_time(key: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &b in key {
        hash = hash.wrapping_add(b as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

/// Immutable ketama ring of `(point, server_index)` pairs.
#[derive(Debug, Clone)]
pub(crate) struct Ring {
    points: Box<[(u32, u32)]>,
    servers: usize,
}

impl Ring {
    fn build(identities: &[String]) -> Self {
        let mut points = Vec::with_capacity(identities.len() * POINTS_PER_SERVER);
        for (index, identity) in identities.iter().enumerate() {
            // Each MD5 digest yields 4 points.
            for i in 0..POINTS_PER_SERVER / 4 {
                let digest = Md5::digest(format!("{identity}-{i}").as_bytes());
                for chunk in digest.chunks_exact(4) {
                    let point = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    points.push((point, index as u32));
                }
            }
        }
        points.sort_unstable_by_key(|&(point, _)| point);

        Ring {
            points: points.into_boxed_slice(),
            servers: identities.len(),
        }
    }

    fn route(&self, key: &[u8]) -> usize {
        if self.servers <= 1 {
            return 0;
        }
        let digest = Md5::digest(key);
        let hash = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
        let idx = self.points.partition_point(|&(point, _)| point < hash);
        let idx = if idx == self.points.len() { 0 } else { idx };
        self.points[idx].1 as usize
    }

    #[cfg(test)]
    fn point_count(&self) -> usize {
        self.points.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> ServerPool {
        let servers: Vec<String> = (0..n).map(|i| format!("10.0.0.{i}:11211")).collect();
        ServerPool::parse(&servers).unwrap()
    }

    #[test]
    fn one_at_a_time_known_values() {
        assert_eq!(one_at_a_time(b""), 0);
        assert_eq!(one_at_a_time(b"a"), 0xca2e_9442);
        assert_ne!(one_at_a_time(b"key1"), one_at_a_time(b"key2"));
    }

    #[test]
    fn parses_names() {
        assert_eq!("modula".parse::<Distribution>().unwrap(), Distribution::Modula);
        assert_eq!(
            "consistent".parse::<Distribution>().unwrap(),
            Distribution::Consistent
        );
        assert!(matches!(
            "random".parse::<Distribution>(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn single_server_always_zero() {
        for dist in [Distribution::Modula, Distribution::Consistent] {
            let selector = Distributor::new(dist, &pool(1));
            assert_eq!(selector.select(b"anything"), 0);
            assert_eq!(selector.select(b""), 0);
        }
    }

    #[test]
    fn deterministic_across_instances() {
        let servers = pool(3);
        for dist in [Distribution::Modula, Distribution::Consistent] {
            let a = Distributor::new(dist, &servers);
            let b = Distributor::new(dist, &servers);
            for i in 0..500 {
                let key = format!("key-{i}");
                let first = a.select(key.as_bytes());
                assert!(first < 3);
                assert_eq!(first, a.select(key.as_bytes()));
                assert_eq!(first, b.select(key.as_bytes()));
            }
        }
    }

    #[test]
    fn modula_spreads_keys() {
        let selector = Distributor::new(Distribution::Modula, &pool(2));
        let mut counts = [0u32; 2];
        for i in 0..2_000 {
            counts[selector.select(format!("key-{i}").as_bytes())] += 1;
        }
        assert!(counts.iter().all(|&c| c > 600), "{counts:?}");
    }

    #[test]
    fn ring_has_160_points_per_server() {
        let identities: Vec<String> = vec!["s0:11211".into(), "s1:11211".into()];
        let ring = Ring::build(&identities);
        assert_eq!(ring.point_count(), 320);
    }

    #[test]
    fn ring_remaps_a_minority_on_growth() {
        let three = Distributor::new(Distribution::Consistent, &pool(3));
        let four = Distributor::new(Distribution::Consistent, &pool(4));
        let total = 5_000;
        let moved = (0..total)
            .filter(|i| {
                let key = format!("key-{i}");
                three.select(key.as_bytes()) != four.select(key.as_bytes())
            })
            .count();
        assert!(moved * 100 / total < 40, "moved {moved} of {total}");
    }
}
