// Numan Thabit 2026
// lut.rs - learned routes: service id -> link, preferring the lowest ttd

use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::io::LinkId;
use crate::wire::ServiceId;

/// One learned route: `service` was last heard on `link` after `ttd` hops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LutEntry {
    pub service: ServiceId,
    pub link: LinkId,
    pub ttd: u8,
    pub last_seen: Instant,
}

/// Lookup table mapping service ids to the links that reach them.
///
/// Entries expire `ttl` after their last refresh. Per service the table
/// prefers the lowest ttd it has seen: strictly worse routes are dropped
/// eagerly on update and ignored by lookups until the better one ages out.
#[derive(Debug, Clone)]
pub struct Lut {
    local: ServiceId,
    ttl: Duration,
    entries: Vec<LutEntry>,
}

impl Lut {
    pub fn new(local: ServiceId, ttl: Duration) -> Self {
        Self {
            local,
            ttl,
            entries: Vec::new(),
        }
    }

    /// Learns that `service` is reachable via `link` at `ttd` hops.
    ///
    /// The local id and broadcast addresses are never learned. Existing
    /// entries for `service` with a strictly worse ttd are dropped, an
    /// identical `(service, link, ttd)` entry is refreshed in place, and the
    /// route is inserted only when no strictly better one is present.
    pub fn update(&mut self, service: ServiceId, link: LinkId, ttd: u8, now: Instant) {
        if service == self.local || service.is_broadcast() {
            return;
        }

        self.entries
            .retain(|entry| entry.service != service || entry.ttd <= ttd);

        for entry in &mut self.entries {
            if entry.service == service && entry.link == link && entry.ttd == ttd {
                entry.last_seen = now;
                return;
            }
        }

        if self.has_better(service, ttd) {
            return;
        }

        self.entries.push(LutEntry {
            service,
            link,
            ttd,
            last_seen: now,
        });
    }

    /// Best current route for `service`: the unexpired, undominated entry
    /// with the lowest ttd. Ties go to the oldest entry.
    pub fn lookup(&self, service: ServiceId, now: Instant) -> Option<&LutEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.service == service && self.is_valid(entry, now))
            .min_by_key(|entry| entry.ttd)
    }

    /// True when some entry for `service` has a strictly lower ttd.
    ///
    /// Drives duplicate suppression: a packet whose ttd is worse than a known
    /// route already travelled the mesh by a shorter path. After a topology
    /// change the better entry ages out and unblocks the longer route.
    pub fn has_better(&self, service: ServiceId, ttd: u8) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.service == service && entry.ttd < ttd)
    }

    /// Drops expired and dominated entries.
    pub fn prune(&mut self, now: Instant) {
        let mut best: AHashMap<ServiceId, u8> = AHashMap::default();
        for entry in &self.entries {
            best.entry(entry.service)
                .and_modify(|ttd| *ttd = (*ttd).min(entry.ttd))
                .or_insert(entry.ttd);
        }

        let ttl = self.ttl;
        self.entries.retain(|entry| {
            now.saturating_duration_since(entry.last_seen) <= ttl
                && best.get(&entry.service).map_or(true, |ttd| entry.ttd <= *ttd)
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in insertion order, including any not yet pruned.
    pub fn entries(&self) -> &[LutEntry] {
        &self.entries
    }

    /// Service ids in entry order; a service heard on several links at the
    /// same ttd appears once per entry.
    pub fn services(&self) -> impl Iterator<Item = ServiceId> + '_ {
        self.entries.iter().map(|entry| entry.service)
    }

    fn is_valid(&self, entry: &LutEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_seen) <= self.ttl
            && !self.has_better(entry.service, entry.ttd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TTL: Duration = Duration::from_secs(150);

    fn lut() -> Lut {
        Lut::new(ServiceId(0x01), TTL)
    }

    #[test]
    fn learns_and_routes() {
        let now = Instant::now();
        let mut lut = lut();
        lut.update(ServiceId(0x0A), LinkId(0), 2, now);

        let entry = lut.lookup(ServiceId(0x0A), now).unwrap();
        assert_eq!(entry.link, LinkId(0));
        assert_eq!(entry.ttd, 2);
        assert!(lut.lookup(ServiceId(0x0B), now).is_none());
    }

    #[test]
    fn never_learns_local_or_broadcast_ids() {
        let now = Instant::now();
        let mut lut = lut();
        lut.update(ServiceId(0x01), LinkId(0), 1, now);
        lut.update(ServiceId(0xC0), LinkId(0), 1, now);
        lut.update(ServiceId(0xFF), LinkId(1), 3, now);
        assert!(lut.is_empty());
    }

    #[test]
    fn better_route_displaces_worse() {
        let now = Instant::now();
        let mut lut = lut();
        lut.update(ServiceId(0x0A), LinkId(0), 3, now);
        lut.update(ServiceId(0x0A), LinkId(1), 1, now);

        assert_eq!(lut.len(), 1);
        assert_eq!(lut.lookup(ServiceId(0x0A), now).unwrap().link, LinkId(1));
    }

    #[test]
    fn worse_route_is_not_inserted() {
        let now = Instant::now();
        let mut lut = lut();
        lut.update(ServiceId(0x0A), LinkId(0), 1, now);
        lut.update(ServiceId(0x0A), LinkId(1), 3, now);

        assert_eq!(lut.len(), 1);
        assert_eq!(lut.lookup(ServiceId(0x0A), now).unwrap().link, LinkId(0));
        assert!(lut.has_better(ServiceId(0x0A), 3));
        assert!(!lut.has_better(ServiceId(0x0A), 1));
    }

    #[test]
    fn identical_route_refreshes_last_seen() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(100);
        let mut lut = lut();
        lut.update(ServiceId(0x0A), LinkId(0), 2, t0);
        lut.update(ServiceId(0x0A), LinkId(0), 2, t1);

        assert_eq!(lut.len(), 1);
        // Still routable past t0's expiry because t1 refreshed it.
        assert!(lut.lookup(ServiceId(0x0A), t0 + TTL + Duration::from_secs(1)).is_some());
    }

    #[test]
    fn equal_ttd_routes_coexist_and_first_wins() {
        let now = Instant::now();
        let mut lut = lut();
        lut.update(ServiceId(0x0A), LinkId(0), 2, now);
        lut.update(ServiceId(0x0A), LinkId(1), 2, now);

        assert_eq!(lut.len(), 2);
        assert_eq!(lut.lookup(ServiceId(0x0A), now).unwrap().link, LinkId(0));
    }

    #[test]
    fn entries_expire() {
        let t0 = Instant::now();
        let mut lut = lut();
        lut.update(ServiceId(0x0A), LinkId(0), 2, t0);

        let later = t0 + TTL + Duration::from_secs(1);
        assert!(lut.lookup(ServiceId(0x0A), later).is_none());

        lut.prune(later);
        assert!(lut.is_empty());
    }

    #[test]
    fn prune_keeps_fresh_entries() {
        let t0 = Instant::now();
        let mut lut = lut();
        lut.update(ServiceId(0x0A), LinkId(0), 2, t0);
        lut.update(ServiceId(0x0B), LinkId(1), 1, t0);

        lut.prune(t0 + Duration::from_secs(10));
        assert_eq!(lut.len(), 2);
    }

    proptest! {
        // After a prune, no service keeps two entries with different ttds.
        #[test]
        fn prune_leaves_no_dominated_entries(
            ops in prop::collection::vec((0u8..4, 0usize..3, 0u8..6), 0..64)
        ) {
            let t0 = Instant::now();
            let mut lut = Lut::new(ServiceId(0x01), TTL);
            for (i, (service, link, ttd)) in ops.iter().enumerate() {
                let now = t0 + Duration::from_secs(i as u64);
                lut.update(ServiceId(10 + service), LinkId(*link), *ttd, now);
            }
            lut.prune(t0 + Duration::from_secs(ops.len() as u64));

            for entry in lut.entries() {
                prop_assert!(!lut.has_better(entry.service, entry.ttd));
            }
        }
    }
}
