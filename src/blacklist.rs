//! A fixed-size table of recently-failed remote addresses.
//!
//! This is deliberately a dumb table, not a cache: 32 slots, linear scan,
//! first free slot wins on insert, and a hit count that frees the slot
//! once it reaches zero. An address that keeps failing to connect stays
//! blacklisted only for [`BLACKLIST_HITS`] more attempts, not forever, and
//! a full table simply stops recording new failures until a slot frees up
//! rather than evicting an older entry. Do not "improve" this into an LRU
//! or a hash set — the bound on its size and the bound on how long an
//! entry survives are both load-bearing: this exists to damp a host that
//! is momentarily unreachable, not to remember failures indefinitely.

use std::net::SocketAddr;

const BLACKLIST_SIZE: usize = 32;
const DEFAULT_BLACKLIST_HITS: u8 = 3;

struct Entry {
    addr: SocketAddr,
    hits: u8,
}

/// Addresses that have recently failed to connect.
pub struct Blacklist {
    slots: [Option<Entry>; BLACKLIST_SIZE],
    hits: u8,
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::new()
    }
}

impl Blacklist {
    /// A blacklist whose entries survive [`DEFAULT_BLACKLIST_HITS`] checks.
    pub fn new() -> Self {
        Self::with_hits(DEFAULT_BLACKLIST_HITS)
    }

    /// A blacklist whose entries survive `hits` checks, per the tunnel
    /// spec's `b=hits` option.
    pub fn with_hits(hits: u8) -> Self {
        Self { slots: std::array::from_fn(|_| None), hits: hits.max(1) }
    }

    /// Record a connect failure to `addr`. Silently dropped if the table
    /// is full.
    pub fn add(&mut self, addr: SocketAddr) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) {
            *slot = Some(Entry { addr, hits: self.hits });
        }
    }

    /// Check whether `addr` is currently blacklisted. Each check against a
    /// blacklisted address consumes one hit; the entry is freed once its
    /// hits reach zero, whether or not the caller goes on to try `addr`
    /// again.
    pub fn check(&mut self, addr: SocketAddr) -> bool {
        for slot in self.slots.iter_mut() {
            let hit = matches!(slot, Some(e) if e.addr == addr);
            if !hit {
                continue;
            }
            let entry = slot.as_mut().unwrap();
            entry.hits -= 1;
            if entry.hits == 0 {
                *slot = None;
            }
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn unlisted_address_is_not_blacklisted() {
        let mut bl = Blacklist::new();
        assert!(!bl.check(addr(1)));
    }

    #[test]
    fn listed_address_is_blacklisted_until_hits_exhausted() {
        let mut bl = Blacklist::new();
        bl.add(addr(1));
        for _ in 0..DEFAULT_BLACKLIST_HITS {
            assert!(bl.check(addr(1)));
        }
        assert!(!bl.check(addr(1)));
    }

    #[test]
    fn full_table_drops_new_entries() {
        let mut bl = Blacklist::new();
        for i in 0..BLACKLIST_SIZE as u16 {
            bl.add(addr(i));
        }
        bl.add(addr(9999));
        assert!(!bl.check(addr(9999)));
        assert!(bl.check(addr(0)));
    }

    #[test]
    fn freed_slot_can_be_reused() {
        let mut bl = Blacklist::new();
        for i in 0..BLACKLIST_SIZE as u16 {
            bl.add(addr(i));
        }
        for _ in 0..DEFAULT_BLACKLIST_HITS {
            bl.check(addr(0));
        }
        bl.add(addr(9999));
        assert!(bl.check(addr(9999)));
    }

    #[test]
    fn with_hits_overrides_the_default_count() {
        let mut bl = Blacklist::with_hits(1);
        bl.add(addr(1));
        assert!(bl.check(addr(1)));
        assert!(!bl.check(addr(1)));
    }

    proptest::proptest! {
        /// Whatever hit count an entry is given, it must survive exactly
        /// that many checks and then be gone, regardless of how many other
        /// addresses share the table.
        #[test]
        fn an_entry_survives_exactly_its_hit_count(
            hits in 1u8..=50,
            other_ports in proptest::collection::vec(2u16..=1000, 0..20),
        ) {
            let mut bl = Blacklist::with_hits(hits);
            for port in other_ports {
                bl.add(addr(port));
            }
            bl.add(addr(1));

            for _ in 0..hits {
                proptest::prop_assert!(bl.check(addr(1)));
            }
            proptest::prop_assert!(!bl.check(addr(1)));
        }

        /// However many distinct addresses get added, at most `BLACKLIST_SIZE`
        /// of them can be blacklisted at once; the rest are silently dropped.
        #[test]
        fn table_never_exceeds_its_fixed_capacity(
            ports in proptest::collection::hash_set(1u16..=5000, 0..200)
        ) {
            let mut bl = Blacklist::new();
            for &port in &ports {
                bl.add(addr(port));
            }
            let blacklisted = ports.iter().filter(|&&port| bl.check(addr(port))).count();
            proptest::prop_assert!(blacklisted <= BLACKLIST_SIZE);
        }
    }
}
