//! Address-keyed caches with expiry and LRU eviction.
//!
//! Two instances exist: the route cache (3 s lifetime) and the discovery
//! history (30 s lifetime). Entries expire at an absolute tick; when the
//! cache is full the least recently inserted entry is evicted.

use std::collections::{HashMap, VecDeque};

use crate::net::addr::NetworkAddress;

struct Entry<V> {
    val: V,
    expires: u64,
}

pub struct TtlCache<V> {
    map: HashMap<NetworkAddress, Entry<V>>,
    order: VecDeque<NetworkAddress>,
    cap: usize,
    ttl_ticks: u64,
}

impl<V> TtlCache<V> {
    pub fn new(cap: usize, ttl_ticks: u64) -> Self {
        TtlCache { map: HashMap::new(), order: VecDeque::new(), cap, ttl_ticks }
    }

    /// Insert (or replace) the entry for `key`, evicting the oldest entry
    /// if the cache is full.
    pub fn put(&mut self, now: u64, key: NetworkAddress, val: V) {
        if self.map.remove(&key).is_some() {
            self.order.retain(|k| *k != key);
        }
        while self.map.len() >= self.cap {
            match self.order.pop_front() {
                Some(old) => {
                    self.map.remove(&old);
                }
                None => break,
            }
        }
        self.map.insert(key, Entry { val, expires: now + self.ttl_ticks });
        self.order.push_back(key);
    }

    /// Look up `key`; an expired entry is dropped and reported missing.
    pub fn get(&mut self, now: u64, key: NetworkAddress) -> Option<&V> {
        if let Some(e) = self.map.get(&key) {
            if e.expires < now {
                self.map.remove(&key);
                self.order.retain(|k| *k != key);
                return None;
            }
        }
        self.map.get(&key).map(|e| &e.val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(n: u32) -> NetworkAddress {
        NetworkAddress::new(n, 1)
    }

    #[test]
    fn hit_and_expiry() {
        let mut c = TtlCache::new(4, 10);
        c.put(100, a(1), "x");
        assert_eq!(c.get(105, a(1)), Some(&"x"));
        assert_eq!(c.get(110, a(1)), Some(&"x"));
        assert_eq!(c.get(111, a(1)), None);
        // And it is really gone, not just hidden.
        assert_eq!(c.get(100, a(1)), None);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut c = TtlCache::new(2, 100);
        c.put(0, a(1), 1);
        c.put(0, a(2), 2);
        c.put(0, a(3), 3);
        assert_eq!(c.get(1, a(1)), None);
        assert_eq!(c.get(1, a(2)), Some(&2));
        assert_eq!(c.get(1, a(3)), Some(&3));
    }

    #[test]
    fn replace_refreshes_expiry() {
        let mut c = TtlCache::new(2, 10);
        c.put(0, a(1), 1);
        c.put(8, a(1), 2);
        assert_eq!(c.get(15, a(1)), Some(&2));
    }
}
