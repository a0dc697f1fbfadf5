// Numan Thabit 2026
// keepalive.rs - periodic nullpacket scheduling across LUT peers

use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::wire::ServiceId;

#[derive(Debug, Clone, Copy)]
struct SentEntry {
    last_sent: Instant,
    counter: u64,
}

/// Snapshot row of the per-destination keepalive ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveSnapshot {
    pub dst: ServiceId,
    /// Keepalives sent to this destination so far.
    pub counter: u64,
    pub last_sent_ago: Duration,
}

/// Decides when to ping and whom.
///
/// At most one keepalive goes out per interval, aimed at the LUT service
/// least recently pinged, so every learned route gets refreshed well before
/// it can expire.
#[derive(Debug, Clone)]
pub struct Keepalive {
    interval: Duration,
    last_run: Option<Instant>,
    sent: AHashMap<ServiceId, SentEntry>,
}

impl Keepalive {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_run: None,
            sent: AHashMap::default(),
        }
    }

    /// True when the interval has elapsed since the last emission.
    pub fn due(&self, now: Instant) -> bool {
        self.last_run
            .map_or(true, |t| now.saturating_duration_since(t) > self.interval)
    }

    /// Picks the candidate least recently pinged. Never-pinged services win;
    /// ties go to the earliest candidate.
    pub fn pick_target<I>(&self, services: I) -> Option<ServiceId>
    where
        I: IntoIterator<Item = ServiceId>,
    {
        services
            .into_iter()
            .min_by_key(|service| self.sent.get(service).map(|entry| entry.last_sent))
    }

    /// Records an emitted keepalive and stamps the interval window.
    pub fn record(&mut self, dst: ServiceId, now: Instant) {
        self.last_run = Some(now);
        self.sent
            .entry(dst)
            .and_modify(|entry| {
                entry.last_sent = now;
                entry.counter = entry.counter.saturating_add(1);
            })
            .or_insert(SentEntry {
                last_sent: now,
                counter: 1,
            });
    }

    pub fn last_run_ago(&self, now: Instant) -> Option<Duration> {
        self.last_run.map(|t| now.saturating_duration_since(t))
    }

    /// Ledger snapshot, sorted by destination for stable output.
    pub fn snapshot(&self, now: Instant) -> Vec<KeepaliveSnapshot> {
        let mut rows: Vec<KeepaliveSnapshot> = self
            .sent
            .iter()
            .map(|(dst, entry)| KeepaliveSnapshot {
                dst: *dst,
                counter: entry.counter,
                last_sent_ago: now.saturating_duration_since(entry.last_sent),
            })
            .collect();
        rows.sort_by_key(|row| row.dst);
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(25);

    #[test]
    fn first_emission_is_immediately_due() {
        let now = Instant::now();
        let ka = Keepalive::new(INTERVAL);
        assert!(ka.due(now));
    }

    #[test]
    fn respects_the_interval() {
        let t0 = Instant::now();
        let mut ka = Keepalive::new(INTERVAL);
        ka.record(ServiceId(0x0A), t0);

        assert!(!ka.due(t0 + Duration::from_secs(25)));
        assert!(ka.due(t0 + Duration::from_secs(26)));
    }

    #[test]
    fn never_pinged_services_win() {
        let t0 = Instant::now();
        let mut ka = Keepalive::new(INTERVAL);
        ka.record(ServiceId(0x0A), t0);

        let target = ka.pick_target([ServiceId(0x0A), ServiceId(0x0B)]);
        assert_eq!(target, Some(ServiceId(0x0B)));
    }

    #[test]
    fn rotates_through_least_recently_pinged() {
        let t0 = Instant::now();
        let mut ka = Keepalive::new(INTERVAL);
        let peers = [ServiceId(0x0A), ServiceId(0x0B)];

        ka.record(ServiceId(0x0A), t0);
        ka.record(ServiceId(0x0B), t0 + Duration::from_secs(26));
        assert_eq!(ka.pick_target(peers), Some(ServiceId(0x0A)));

        ka.record(ServiceId(0x0A), t0 + Duration::from_secs(52));
        assert_eq!(ka.pick_target(peers), Some(ServiceId(0x0B)));
    }

    #[test]
    fn ties_resolve_to_the_first_candidate() {
        let ka = Keepalive::new(INTERVAL);
        let target = ka.pick_target([ServiceId(0x0C), ServiceId(0x0B), ServiceId(0x0A)]);
        assert_eq!(target, Some(ServiceId(0x0C)));
        assert_eq!(ka.pick_target(std::iter::empty()), None);
    }

    #[test]
    fn counters_accumulate_per_destination() {
        let t0 = Instant::now();
        let mut ka = Keepalive::new(INTERVAL);
        ka.record(ServiceId(0x0A), t0);
        ka.record(ServiceId(0x0A), t0 + Duration::from_secs(30));
        ka.record(ServiceId(0x0B), t0 + Duration::from_secs(60));

        let now = t0 + Duration::from_secs(60);
        let rows = ka.snapshot(now);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].dst, ServiceId(0x0A));
        assert_eq!(rows[0].counter, 2);
        assert_eq!(rows[0].last_sent_ago, Duration::from_secs(30));
        assert_eq!(rows[1].counter, 1);
        assert_eq!(ka.last_run_ago(now), Some(Duration::ZERO));
    }
}
