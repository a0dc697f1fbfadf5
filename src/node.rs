// LINE relay engine: consume, forward, or drop packets across serial links.
// Numan Thabit 2026

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, warn};

use crate::buffer::RxBuffer;
use crate::config::{Config, Timing};
use crate::io::{Link, LinkId};
use crate::keepalive::{Keepalive, KeepaliveSnapshot};
use crate::lut::Lut;
use crate::metrics::Metrics;
use crate::wire::{Packet, ServiceId, WireError};

/// A payload handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub src: ServiceId,
    pub dst: ServiceId,
    pub payload: Bytes,
    /// True when `dst` is a broadcast address.
    pub broadcast: bool,
}

/// Receiver invoked for matching deliveries during [`Node::process`].
pub type DeliveryFn = Box<dyn FnMut(&Delivery) + Send>;

/// Relay-level error.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Frame construction failed.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The node's own id must be unicast.
    #[error("service id {0} is reserved for broadcast")]
    BroadcastService(ServiceId),

    /// Broadcast subscriptions need a broadcast address.
    #[error("service id {0} is not a broadcast address")]
    NotBroadcast(ServiceId),

    /// `try_recv` is unavailable while callbacks are registered.
    #[error("deliveries are being dispatched to callbacks")]
    CallbacksActive,

    /// A link failed to read or write.
    #[error("link io error on '{link}': {source}")]
    LinkIo {
        link: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    sent_packets: u64,
    forwarded_packets: u64,
    processed_packets: u64,
    dropped_packets: u64,
    broadcast_packets: u64,
    null_packets: u64,
    garbage_bytes: u64,
    buffer_timeouts: u64,
    callback_timeouts: u64,
    buffer_rots: u64,
}

/// Routing table row with the link name resolved, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSnapshot {
    pub service: ServiceId,
    pub link: LinkId,
    pub link_name: String,
    pub ttd: u8,
    pub last_seen_ago: Duration,
}

/// Per-link receive buffer occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStats {
    pub link: LinkId,
    pub name: String,
    pub buffered_bytes: usize,
    pub rx_idle: Option<Duration>,
    pub pop_idle: Option<Duration>,
}

/// Counter snapshot returned by [`Node::stats`].
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub sent_packets: u64,
    pub forwarded_packets: u64,
    pub processed_packets: u64,
    pub dropped_packets: u64,
    pub broadcast_packets: u64,
    pub null_packets: u64,
    pub garbage_bytes: u64,
    pub buffer_timeouts: u64,
    pub callback_timeouts: u64,
    pub buffer_rots: u64,
    pub lut_entries: usize,
    pub inbox_depth: usize,
    pub callbacks: usize,
    pub broadcast_callbacks: usize,
    pub max_ttd: u8,
    pub last_keepalive_ago: Option<Duration>,
    pub keepalives: Vec<KeepaliveSnapshot>,
    pub links: Vec<LinkStats>,
}

/// What one [`Node::process`] tick accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    /// Frames popped and handled across all links.
    pub frames: usize,
    /// Deliveries dispatched to callbacks.
    pub delivered: usize,
    /// Raw bytes read off links into receive buffers.
    pub bytes_read: usize,
}

impl ProcessSummary {
    /// True when the tick moved nothing; callers may sleep before the next.
    pub fn is_idle(&self) -> bool {
        self.frames == 0 && self.delivered == 0 && self.bytes_read == 0
    }
}

struct LinkState<L> {
    link: L,
    buffer: RxBuffer,
}

/// A LINE relay node driving a fixed set of links.
///
/// Single-threaded and cooperative: the owner calls [`Node::process`] in a
/// loop (or hands the node to [`serve_forever`](Node::serve_forever) / the
/// `runtime` module). Deliveries go to registered callbacks, or pile up for
/// [`Node::try_recv`] when none are registered.
pub struct Node<L: Link> {
    service: ServiceId,
    max_ttd: u8,
    timing: Timing,
    links: Vec<LinkState<L>>,
    lut: Lut,
    keepalive: Keepalive,
    callbacks: Vec<DeliveryFn>,
    broadcast_callbacks: AHashMap<ServiceId, Vec<DeliveryFn>>,
    inbox: VecDeque<Delivery>,
    counters: Counters,
    metrics: Arc<Metrics>,
    last_activity: Option<Instant>,
}

impl<L: Link> Node<L> {
    /// Builds a relay from configuration and an opened link set.
    ///
    /// Links are owned for the node's lifetime and closed on drop. The
    /// node's own id must be unicast.
    pub fn new(config: &Config, links: Vec<L>, metrics: Arc<Metrics>) -> Result<Self, NodeError> {
        let service = ServiceId(config.node.service);
        if service.is_broadcast() {
            return Err(NodeError::BroadcastService(service));
        }

        let max_ttd = config.node.max_ttd;
        let timing = config.timing.clone();
        let lut = Lut::new(service, timing.lut_ttl(max_ttd));
        let keepalive = Keepalive::new(timing.keepalive_interval());

        Ok(Self {
            service,
            max_ttd,
            timing,
            links: links
                .into_iter()
                .map(|link| LinkState {
                    link,
                    buffer: RxBuffer::new(),
                })
                .collect(),
            lut,
            keepalive,
            callbacks: Vec::new(),
            broadcast_callbacks: AHashMap::default(),
            inbox: VecDeque::new(),
            counters: Counters::default(),
            metrics,
            last_activity: None,
        })
    }

    pub fn service(&self) -> ServiceId {
        self.service
    }

    /// Registers a receiver for unicast deliveries addressed to this node.
    pub fn register_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&Delivery) + Send + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    /// Subscribes to a broadcast address.
    ///
    /// Packets sent to `addr` are delivered here and still forwarded onward;
    /// without a subscription they are forwarded only.
    pub fn register_broadcast_callback<F>(
        &mut self,
        addr: ServiceId,
        callback: F,
    ) -> Result<(), NodeError>
    where
        F: FnMut(&Delivery) + Send + 'static,
    {
        if !addr.is_broadcast() {
            return Err(NodeError::NotBroadcast(addr));
        }
        self.broadcast_callbacks
            .entry(addr)
            .or_default()
            .push(Box::new(callback));
        Ok(())
    }

    /// Pops the next delivery in queue mode.
    ///
    /// Nodes with callbacks registered dispatch during [`Node::process`]
    /// instead; mixing the two consumption modes is a programming error.
    pub fn try_recv(&mut self) -> Result<Option<Delivery>, NodeError> {
        if self.uses_callbacks() {
            return Err(NodeError::CallbacksActive);
        }
        let delivery = self.inbox.pop_front();
        self.metrics.inbox_depth.set(self.inbox.len() as i64);
        Ok(delivery)
    }

    /// Sends `payload` to `dst` with a fresh hop budget.
    ///
    /// Routed through the LUT when a route for `dst` is known, flooded to
    /// every link otherwise.
    pub fn send(&mut self, dst: ServiceId, payload: impl Into<Bytes>) -> Result<(), NodeError> {
        let now = Instant::now();
        let packet = Packet::new(dst, self.service, 0, payload.into())?;
        self.send_packet_out(&packet, None, false, now)?;
        self.counters.sent_packets += 1;
        self.metrics.sent_packets.inc();
        self.last_activity = Some(now);
        Ok(())
    }

    /// One cooperative tick.
    ///
    /// Pumps buffered frames through the relay (bounded per link), prunes
    /// the LUT, runs the keepalive, clears rotten buffers, dispatches
    /// callbacks (bounded), then reads fresh bytes from every link.
    /// Protocol-level garbage never fails a tick; only link IO errors do.
    pub fn process(&mut self) -> Result<ProcessSummary, NodeError> {
        let mut summary = ProcessSummary::default();

        self.pump_buffers(&mut summary)?;
        self.housekeep()?;
        summary.delivered = self.dispatch_callbacks();
        summary.bytes_read = self.read_links()?;

        if !summary.is_idle() {
            self.last_activity = Some(Instant::now());
        }
        Ok(summary)
    }

    /// Blocking loop over [`Node::process`], sleeping `poll_wait` after
    /// ticks that moved nothing. Returns only on a link IO error.
    pub fn serve_forever(&mut self) -> Result<(), NodeError> {
        let wait = self.timing.poll_wait();
        loop {
            let summary = self.process()?;
            if summary.is_idle() && !wait.is_zero() {
                thread::sleep(wait);
            }
        }
    }

    /// Time since the node last moved a frame, byte, or delivery.
    pub fn idle_for(&self) -> Option<Duration> {
        self.last_activity
            .map(|t| Instant::now().saturating_duration_since(t))
    }

    /// Routing table snapshot with link names resolved.
    pub fn lut(&self) -> Vec<RouteSnapshot> {
        let now = Instant::now();
        self.lut
            .entries()
            .iter()
            .map(|entry| RouteSnapshot {
                service: entry.service,
                link: entry.link,
                link_name: self
                    .links
                    .get(entry.link.0)
                    .map(|state| state.link.name().to_string())
                    .unwrap_or_default(),
                ttd: entry.ttd,
                last_seen_ago: now.saturating_duration_since(entry.last_seen),
            })
            .collect()
    }

    /// Counter snapshot plus per-link and keepalive detail.
    pub fn stats(&self) -> NodeStats {
        let now = Instant::now();
        NodeStats {
            sent_packets: self.counters.sent_packets,
            forwarded_packets: self.counters.forwarded_packets,
            processed_packets: self.counters.processed_packets,
            dropped_packets: self.counters.dropped_packets,
            broadcast_packets: self.counters.broadcast_packets,
            null_packets: self.counters.null_packets,
            garbage_bytes: self.counters.garbage_bytes,
            buffer_timeouts: self.counters.buffer_timeouts,
            callback_timeouts: self.counters.callback_timeouts,
            buffer_rots: self.counters.buffer_rots,
            lut_entries: self.lut.len(),
            inbox_depth: self.inbox.len(),
            callbacks: self.callbacks.len(),
            broadcast_callbacks: self.broadcast_callbacks.len(),
            max_ttd: self.max_ttd,
            last_keepalive_ago: self.keepalive.last_run_ago(now),
            keepalives: self.keepalive.snapshot(now),
            links: self
                .links
                .iter()
                .enumerate()
                .map(|(idx, state)| LinkStats {
                    link: LinkId(idx),
                    name: state.link.name().to_string(),
                    buffered_bytes: state.buffer.len(),
                    rx_idle: state.buffer.rx_idle(now),
                    pop_idle: state.buffer.pop_idle(now),
                })
                .collect(),
        }
    }

    fn uses_callbacks(&self) -> bool {
        !self.callbacks.is_empty() || !self.broadcast_callbacks.is_empty()
    }

    /// Routes one inbound packet: duplicate-suppress, learn, consume,
    /// forward.
    fn handle_packet(&mut self, packet: Packet, from: LinkId, now: Instant) -> Result<(), NodeError> {
        let header = packet.header;
        let broadcast = header.dst.is_broadcast();

        // A worse-ttd copy of traffic we already route better is a duplicate
        // travelling the long way around.
        if !broadcast && self.lut.has_better(header.src, header.ttd) {
            self.counters.dropped_packets += 1;
            self.metrics.dropped_packets.inc();
            return Ok(());
        }

        self.lut.update(header.src, from, header.ttd, now);

        if header.dst == self.service || self.broadcast_callbacks.contains_key(&header.dst) {
            if packet.is_null() {
                self.counters.null_packets += 1;
                self.metrics.null_packets.inc();
            } else {
                self.inbox.push_back(Delivery {
                    src: header.src,
                    dst: header.dst,
                    payload: packet.payload.clone(),
                    broadcast,
                });
            }
            self.counters.processed_packets += 1;
            self.metrics.processed_packets.inc();
        }

        if header.dst != self.service || broadcast {
            let forwarded = Packet::new(
                header.dst,
                header.src,
                header.ttd.saturating_add(1),
                packet.payload,
            )?;
            // Broadcasts skip the LUT so they fan out on all other links.
            self.send_packet_out(&forwarded, Some(from), broadcast, now)?;
            self.counters.forwarded_packets += 1;
            self.metrics.forwarded_packets.inc();
        }

        if broadcast {
            self.counters.broadcast_packets += 1;
            self.metrics.broadcast_packets.inc();
        }
        Ok(())
    }

    /// Writes a packet to the best route for its destination, or floods it
    /// when no route is known (or `skip_lut` is set). Counts a drop when the
    /// hop budget is exhausted or nothing was actually written.
    fn send_packet_out(
        &mut self,
        packet: &Packet,
        except: Option<LinkId>,
        skip_lut: bool,
        now: Instant,
    ) -> Result<(), NodeError> {
        if packet.header.ttd >= self.max_ttd {
            self.counters.dropped_packets += 1;
            self.metrics.dropped_packets.inc();
            return Ok(());
        }

        let frame = packet.encode_frame();
        let route = if skip_lut {
            None
        } else {
            self.lut
                .lookup(packet.header.dst, now)
                .map(|entry| entry.link)
        };

        let mut wrote = false;
        match route {
            Some(link) if except != Some(link) => {
                self.write_frame(link, &frame)?;
                wrote = true;
            }
            // The only route points back where the packet came from.
            Some(_) => {}
            None => {
                for idx in 0..self.links.len() {
                    let link = LinkId(idx);
                    if except == Some(link) {
                        continue;
                    }
                    self.write_frame(link, &frame)?;
                    wrote = true;
                }
            }
        }

        if !wrote {
            self.counters.dropped_packets += 1;
            self.metrics.dropped_packets.inc();
        }
        Ok(())
    }

    fn write_frame(&mut self, link: LinkId, frame: &[u8]) -> Result<(), NodeError> {
        let state = &mut self.links[link.0];
        state
            .link
            .send_frame(frame)
            .map_err(|source| NodeError::LinkIo {
                link: state.link.name().to_string(),
                source,
            })
    }

    /// Pops and handles buffered frames, at most `buffer_budget` per link.
    fn pump_buffers(&mut self, summary: &mut ProcessSummary) -> Result<(), NodeError> {
        let budget = self.timing.buffer_budget();
        for idx in 0..self.links.len() {
            let started = Instant::now();
            loop {
                let now = Instant::now();
                let popped = match self.links[idx].buffer.pop_packet(now) {
                    Some(popped) => popped,
                    None => break,
                };

                if popped.garbage_bytes > 0 {
                    self.counters.garbage_bytes += popped.garbage_bytes as u64;
                    self.metrics.garbage_bytes.inc_by(popped.garbage_bytes as u64);
                }

                self.handle_packet(popped.packet, LinkId(idx), now)?;
                summary.frames += 1;

                if started.elapsed() > budget {
                    self.counters.buffer_timeouts += 1;
                    self.metrics.buffer_timeouts.inc();
                    break;
                }
            }
        }
        Ok(())
    }

    fn housekeep(&mut self) -> Result<(), NodeError> {
        let now = Instant::now();

        self.lut.prune(now);
        self.metrics.lut_entries.set(self.lut.len() as i64);

        self.run_keepalive(now)?;

        let rx_idle = self.timing.rot_rx_idle();
        let pop_idle = self.timing.rot_pop_idle();
        for idx in 0..self.links.len() {
            if self.links[idx].buffer.is_rotten(now, rx_idle, pop_idle) {
                let discarded = self.links[idx].buffer.clear();
                self.counters.garbage_bytes += discarded as u64;
                self.counters.buffer_rots += 1;
                self.metrics.garbage_bytes.inc_by(discarded as u64);
                self.metrics.buffer_rots.inc();
                warn!(
                    link = self.links[idx].link.name(),
                    discarded, "receive buffer rotted; cleared"
                );
            }
        }
        Ok(())
    }

    /// Pings the least recently pinged LUT peer, at most once per interval.
    fn run_keepalive(&mut self, now: Instant) -> Result<(), NodeError> {
        if self.lut.is_empty() || !self.keepalive.due(now) {
            return Ok(());
        }
        let target = match self.keepalive.pick_target(self.lut.services()) {
            Some(target) => target,
            None => return Ok(()),
        };

        let ping = Packet::new(target, self.service, 0, Bytes::new())?;
        self.send_packet_out(&ping, None, false, now)?;
        self.keepalive.record(target, now);
        self.metrics.keepalives_sent.inc();
        debug!(dst = %target, "keepalive sent");
        Ok(())
    }

    /// Drains the inbox through callbacks, at most `callback_budget` worth.
    /// Queue-mode nodes keep their inbox untouched.
    fn dispatch_callbacks(&mut self) -> usize {
        if !self.uses_callbacks() {
            self.metrics.inbox_depth.set(self.inbox.len() as i64);
            return 0;
        }

        let budget = self.timing.callback_budget();
        let started = Instant::now();
        let mut delivered = 0;

        while let Some(delivery) = self.inbox.pop_front() {
            if delivery.broadcast {
                if let Some(subscribers) = self.broadcast_callbacks.get_mut(&delivery.dst) {
                    for callback in subscribers.iter_mut() {
                        callback(&delivery);
                    }
                }
            } else {
                for callback in self.callbacks.iter_mut() {
                    callback(&delivery);
                }
            }
            delivered += 1;

            if started.elapsed() > budget {
                self.counters.callback_timeouts += 1;
                self.metrics.callback_timeouts.inc();
                break;
            }
        }

        self.metrics.inbox_depth.set(self.inbox.len() as i64);
        delivered
    }

    /// Moves whatever every link has ready into its receive buffer.
    fn read_links(&mut self) -> Result<usize, NodeError> {
        let mut total = 0;
        let mut scratch = BytesMut::new();

        for idx in 0..self.links.len() {
            scratch.clear();
            let state = &mut self.links[idx];
            let n = state
                .link
                .recv_into(&mut scratch)
                .map_err(|source| NodeError::LinkIo {
                    link: state.link.name().to_string(),
                    source,
                })?;
            if n > 0 {
                state.buffer.extend(&scratch, Instant::now());
                total += n;
            }
            self.metrics
                .buffered_bytes
                .with_label_values(&[state.link.name()])
                .set(state.buffer.len() as i64);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mem::MemLink;
    use std::sync::Mutex;

    fn test_config(service: u8) -> Config {
        let mut cfg = Config::default();
        cfg.node.service = service;
        cfg.node.max_ttd = 3;
        cfg
    }

    fn node(service: u8, links: Vec<MemLink>) -> Node<MemLink> {
        Node::new(
            &test_config(service),
            links,
            Arc::new(Metrics::new().unwrap()),
        )
        .unwrap()
    }

    fn ticks(node: &mut Node<MemLink>, n: usize) {
        for _ in 0..n {
            node.process().unwrap();
        }
    }

    fn frame(dst: u8, src: u8, ttd: u8, payload: &[u8]) -> Vec<u8> {
        Packet::new(
            ServiceId(dst),
            ServiceId(src),
            ttd,
            Bytes::copy_from_slice(payload),
        )
        .unwrap()
        .encode_frame()
    }

    fn drain(link: &mut MemLink) -> Vec<u8> {
        let mut buf = BytesMut::new();
        link.recv_into(&mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn rejects_broadcast_own_id() {
        let err = Node::<MemLink>::new(
            &test_config(0xC1),
            Vec::new(),
            Arc::new(Metrics::new().unwrap()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, NodeError::BroadcastService(_)));
    }

    #[test]
    fn send_reaches_directly_connected_peer() {
        let (a_end, b_end) = MemLink::pair("a:0", "b:0");
        let mut a = node(0x01, vec![a_end]);
        let mut b = node(0x02, vec![b_end]);

        a.send(ServiceId(0x02), &b"hello"[..]).unwrap();
        ticks(&mut b, 2);

        let delivery = b.try_recv().unwrap().unwrap();
        assert_eq!(delivery.src, ServiceId(0x01));
        assert_eq!(delivery.dst, ServiceId(0x02));
        assert_eq!(&delivery.payload[..], b"hello");
        assert!(!delivery.broadcast);
        assert!(b.try_recv().unwrap().is_none());

        // b learned the return route at ttd 0.
        let routes = b.lut();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].service, ServiceId(0x01));
        assert_eq!(routes[0].ttd, 0);
        assert_eq!(routes[0].link_name, "b:0");
        assert_eq!(a.stats().sent_packets, 1);
        assert_eq!(b.stats().processed_packets, 1);
    }

    #[test]
    fn callbacks_receive_unicast_deliveries() {
        let (a_end, b_end) = MemLink::pair("a:0", "b:0");
        let mut a = node(0x01, vec![a_end]);
        let mut b = node(0x02, vec![b_end]);

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        b.register_callback(move |delivery: &Delivery| {
            sink.lock().unwrap().push(delivery.clone());
        });

        a.send(ServiceId(0x02), &b"ping"[..]).unwrap();
        ticks(&mut b, 2);

        let seen = log.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(&seen[0].payload[..], b"ping");
        assert_eq!(b.stats().inbox_depth, 0);
    }

    #[test]
    fn try_recv_conflicts_with_callbacks() {
        let mut b = node(0x02, Vec::new());
        b.register_callback(|_| {});
        assert!(matches!(b.try_recv(), Err(NodeError::CallbacksActive)));
    }

    #[test]
    fn broadcast_subscription_requires_broadcast_address() {
        let mut b = node(0x02, Vec::new());
        let err = b
            .register_broadcast_callback(ServiceId(0x10), |_| {})
            .err()
            .unwrap();
        assert!(matches!(err, NodeError::NotBroadcast(_)));
    }

    #[test]
    fn forwards_across_two_hops() {
        let (a_end, b_left) = MemLink::pair("a:0", "b:0");
        let (b_right, c_end) = MemLink::pair("b:1", "c:0");
        let mut a = node(0x01, vec![a_end]);
        let mut b = node(0x02, vec![b_left, b_right]);
        let mut c = node(0x03, vec![c_end]);

        a.send(ServiceId(0x03), &b"relay me"[..]).unwrap();
        ticks(&mut b, 2);
        ticks(&mut c, 2);

        let delivery = c.try_recv().unwrap().unwrap();
        assert_eq!(delivery.src, ServiceId(0x01));
        assert_eq!(&delivery.payload[..], b"relay me");

        assert_eq!(b.stats().forwarded_packets, 1);
        assert_eq!(b.stats().processed_packets, 0);
        // c sees the packet one hop older.
        assert_eq!(c.lut()[0].ttd, 1);
        // Nothing bounced back toward a beyond b's keepalive.
        ticks(&mut a, 2);
        assert!(a.try_recv().unwrap().is_none());
    }

    #[test]
    fn ttd_exhaustion_drops_instead_of_forwarding() {
        let (injector, b_left) = MemLink::pair("x:0", "b:0");
        let (b_right, mut far_end) = MemLink::pair("b:1", "c:0");
        let mut cfg = test_config(0x02);
        cfg.node.max_ttd = 1;
        let mut b = Node::new(
            &cfg,
            vec![b_left, b_right],
            Arc::new(Metrics::new().unwrap()),
        )
        .unwrap();
        let mut injector = injector;

        // Already one hop old; forwarding would need ttd 1 == max_ttd.
        injector
            .send_frame(&frame(0x07, 0x05, 0, b"doomed"))
            .unwrap();
        ticks(&mut b, 2);

        let stats = b.stats();
        assert_eq!(stats.forwarded_packets, 1);
        assert_eq!(stats.dropped_packets, 1);
        // The doomed frame never left on the far link.
        assert!(drain(&mut far_end).is_empty());
        // Only b's keepalive went out, routed back toward the learned source.
        let out = drain(&mut injector);
        let ka = Packet::parse(&out[1..]).unwrap();
        assert!(ka.is_null());
        assert_eq!(ka.header.dst, ServiceId(0x05));
        assert_eq!(out.len(), ka.header.frame_len());
    }

    #[test]
    fn duplicate_via_longer_path_is_dropped() {
        let (mut near, b_left) = MemLink::pair("x:0", "b:0");
        let (b_right, mut far) = MemLink::pair("y:0", "b:1");
        let mut b = node(0x02, vec![b_left, b_right]);

        // Learn 0x05 at ttd 0 on link 0.
        near.send_frame(&frame(0x02, 0x05, 0, b"direct")).unwrap();
        ticks(&mut b, 2);
        // The same source now shows up two hops away on link 1.
        far.send_frame(&frame(0x02, 0x05, 2, b"echo")).unwrap();
        ticks(&mut b, 2);

        assert_eq!(&b.try_recv().unwrap().unwrap().payload[..], b"direct");
        assert!(b.try_recv().unwrap().is_none());
        assert_eq!(b.stats().dropped_packets, 1);
        assert_eq!(b.lut().len(), 1);
    }

    #[test]
    fn broadcast_is_delivered_and_forwarded() {
        let (mut near, b_left) = MemLink::pair("x:0", "b:0");
        let (b_right, mut far) = MemLink::pair("y:0", "b:1");
        let mut b = node(0x02, vec![b_left, b_right]);

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        b.register_broadcast_callback(ServiceId(0xC5), move |delivery: &Delivery| {
            sink.lock().unwrap().push(delivery.clone());
        })
        .unwrap();

        near.send_frame(&frame(0xC5, 0x05, 0, b"announce")).unwrap();
        ticks(&mut b, 2);

        let seen = log.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].broadcast);
        assert_eq!(seen[0].dst, ServiceId(0xC5));

        // Forwarded out the far side with the hop consumed.
        let out = drain(&mut far);
        let fwd = Packet::parse(&out[1..]).unwrap();
        assert_eq!(fwd.header.dst, ServiceId(0xC5));
        assert_eq!(fwd.header.ttd, 1);
        assert_eq!(&fwd.payload[..], b"announce");
        // Nothing bounced back out the ingress link beyond b's keepalive to
        // the learned source.
        let back = drain(&mut near);
        let ka = Packet::parse(&back[1..]).unwrap();
        assert!(ka.is_null());
        assert_eq!(ka.header.dst, ServiceId(0x05));
        assert_eq!(back.len(), ka.header.frame_len());

        let stats = b.stats();
        assert_eq!(stats.broadcast_packets, 1);
        assert_eq!(stats.forwarded_packets, 1);
        assert_eq!(stats.processed_packets, 1);
        // Broadcast sources are never learned.
        assert_eq!(stats.lut_entries, 1); // 0x05 only
    }

    #[test]
    fn unsubscribed_broadcast_forwards_without_delivery() {
        let (mut near, b_left) = MemLink::pair("x:0", "b:0");
        let (b_right, mut far) = MemLink::pair("y:0", "b:1");
        let mut b = node(0x02, vec![b_left, b_right]);

        near.send_frame(&frame(0xD0, 0x05, 0, b"noise")).unwrap();
        ticks(&mut b, 2);

        assert!(b.try_recv().unwrap().is_none());
        assert_eq!(b.stats().processed_packets, 0);
        assert_eq!(b.stats().broadcast_packets, 1);
        assert!(!drain(&mut far).is_empty());
    }

    #[test]
    fn null_packets_feed_the_lut_but_not_the_inbox() {
        let (mut near, b_end) = MemLink::pair("x:0", "b:0");
        let mut b = node(0x02, vec![b_end]);

        near.send_frame(&frame(0x02, 0x05, 0, b"")).unwrap();
        ticks(&mut b, 2);

        let stats = b.stats();
        assert_eq!(stats.null_packets, 1);
        assert_eq!(stats.processed_packets, 1);
        assert_eq!(stats.inbox_depth, 0);
        assert_eq!(stats.lut_entries, 1);
    }

    #[test]
    fn keepalive_pings_learned_peers() {
        let (mut near, b_end) = MemLink::pair("x:0", "b:0");
        let mut b = node(0x02, vec![b_end]);

        near.send_frame(&frame(0x02, 0x05, 0, b"hi")).unwrap();
        ticks(&mut b, 2);

        let out = drain(&mut near);
        let ping = Packet::parse(&out[1..]).unwrap();
        assert!(ping.is_null());
        assert_eq!(ping.header.dst, ServiceId(0x05));
        assert_eq!(ping.header.src, ServiceId(0x02));
        assert_eq!(ping.header.ttd, 0);

        let stats = b.stats();
        assert_eq!(stats.keepalives.len(), 1);
        assert_eq!(stats.keepalives[0].dst, ServiceId(0x05));
        assert_eq!(stats.keepalives[0].counter, 1);
        assert!(stats.last_keepalive_ago.is_some());

        // Within the window nothing further goes out.
        ticks(&mut b, 3);
        assert!(drain(&mut near).is_empty());
    }

    #[test]
    fn routed_forward_never_bounces_out_the_ingress_link() {
        let (mut near, b_left) = MemLink::pair("x:0", "b:0");
        let (b_right, mut far) = MemLink::pair("y:0", "b:1");
        let mut b = node(0x02, vec![b_left, b_right]);

        // b learns 0x05 on link 0, then a packet *for* 0x05 arrives on the
        // same link. The only route points back where it came from.
        near.send_frame(&frame(0x02, 0x05, 0, b"seed")).unwrap();
        ticks(&mut b, 2);
        drain(&mut near); // keepalive

        near.send_frame(&frame(0x05, 0x09, 0, b"loop")).unwrap();
        ticks(&mut b, 2);

        assert!(drain(&mut near).is_empty());
        assert!(drain(&mut far).is_empty());
        let stats = b.stats();
        assert_eq!(stats.forwarded_packets, 1);
        assert_eq!(stats.dropped_packets, 1);
    }

    #[test]
    fn junk_bytes_are_counted_and_skipped() {
        let (mut near, b_end) = MemLink::pair("x:0", "b:0");
        let mut b = node(0x02, vec![b_end]);

        near.send_frame(&[0x00, 0xFF, 0x13]).unwrap();
        near.send_frame(&frame(0x02, 0x05, 0, b"ok")).unwrap();
        ticks(&mut b, 2);

        assert_eq!(&b.try_recv().unwrap().unwrap().payload[..], b"ok");
        assert_eq!(b.stats().garbage_bytes, 3);
    }

    #[test]
    fn stale_buffers_rot_and_clear() {
        let (mut near, b_end) = MemLink::pair("x:0", "b:0");
        let mut cfg = test_config(0x02);
        cfg.timing.rot_rx_idle_ms = 0;
        cfg.timing.rot_pop_idle_ms = 0;
        let mut b = Node::new(&cfg, vec![b_end], Arc::new(Metrics::new().unwrap())).unwrap();

        near.send_frame(&[0x69, 0x01, 0x02]).unwrap(); // never completes
        ticks(&mut b, 1); // reads the bytes
        ticks(&mut b, 1); // pump finds nothing, rot clears

        let stats = b.stats();
        assert_eq!(stats.buffer_rots, 1);
        assert_eq!(stats.garbage_bytes, 3);
        assert_eq!(stats.links[0].buffered_bytes, 0);
    }

    #[test]
    fn zero_buffer_budget_handles_one_frame_per_link_per_tick() {
        let (mut near, b_end) = MemLink::pair("x:0", "b:0");
        let mut cfg = test_config(0x02);
        cfg.timing.buffer_budget_ms = 0;
        let mut b = Node::new(&cfg, vec![b_end], Arc::new(Metrics::new().unwrap())).unwrap();

        near.send_frame(&frame(0x02, 0x05, 0, &[0xAA; 2048])).unwrap();
        near.send_frame(&frame(0x02, 0x05, 0, &[0xBB; 2048])).unwrap();
        ticks(&mut b, 1);

        let summary = b.process().unwrap();
        assert_eq!(summary.frames, 1);
        assert_eq!(b.stats().buffer_timeouts, 1);

        let summary = b.process().unwrap();
        assert_eq!(summary.frames, 1);
    }

    #[test]
    fn zero_callback_budget_leaves_the_rest_for_next_tick() {
        let (mut near, b_end) = MemLink::pair("x:0", "b:0");
        let mut cfg = test_config(0x02);
        cfg.timing.callback_budget_ms = 0;
        let mut b = Node::new(&cfg, vec![b_end], Arc::new(Metrics::new().unwrap())).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        b.register_callback(move |delivery: &Delivery| {
            thread::sleep(Duration::from_millis(2));
            sink.lock().unwrap().push(delivery.clone());
        });

        near.send_frame(&frame(0x02, 0x05, 0, b"one")).unwrap();
        near.send_frame(&frame(0x02, 0x05, 0, b"two")).unwrap();
        ticks(&mut b, 1);

        let summary = b.process().unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(b.stats().callback_timeouts, 1);
        assert_eq!(b.stats().inbox_depth, 1);

        let summary = b.process().unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn oversized_payload_is_a_wire_error() {
        let mut b = node(0x02, Vec::new());
        let err = b
            .send(ServiceId(0x05), vec![0u8; 65_536])
            .err()
            .unwrap();
        assert!(matches!(err, NodeError::Wire(WireError::PayloadTooLong(_))));
    }

    #[test]
    fn send_with_no_links_counts_a_drop() {
        let mut b = node(0x02, Vec::new());
        b.send(ServiceId(0x05), &b"void"[..]).unwrap();
        let stats = b.stats();
        assert_eq!(stats.sent_packets, 1);
        assert_eq!(stats.dropped_packets, 1);
    }

    #[test]
    fn dead_link_surfaces_as_io_error() {
        let (near, b_end) = MemLink::pair("x:0", "b:0");
        let mut b = node(0x02, vec![b_end]);
        near.sever();

        let err = b.send(ServiceId(0x05), &b"x"[..]).err().unwrap();
        assert!(matches!(err, NodeError::LinkIo { .. }));
        let err = b.process().err().unwrap();
        assert!(matches!(err, NodeError::LinkIo { .. }));
    }

    #[test]
    fn idle_ticks_report_idle() {
        let (_near, b_end) = MemLink::pair("x:0", "b:0");
        let mut b = node(0x02, vec![b_end]);
        assert!(b.idle_for().is_none());

        let summary = b.process().unwrap();
        assert!(summary.is_idle());

        b.send(ServiceId(0x05), &b"wake"[..]).unwrap();
        assert!(b.idle_for().is_some());
    }
}
