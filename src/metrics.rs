// Numan Thabit 2026
// metrics.rs - Prometheus registry for relay counters
use prometheus::{IntCounter, IntGauge, IntGaugeVec, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub sent_packets: IntCounter,
    pub forwarded_packets: IntCounter,
    pub processed_packets: IntCounter,
    pub dropped_packets: IntCounter,
    pub broadcast_packets: IntCounter,
    pub null_packets: IntCounter,
    pub keepalives_sent: IntCounter,
    pub garbage_bytes: IntCounter,
    pub buffer_timeouts: IntCounter,
    pub callback_timeouts: IntCounter,
    pub buffer_rots: IntCounter,
    pub lut_entries: IntGauge,
    pub inbox_depth: IntGauge,
    pub buffered_bytes: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("lineport".into()), None)?;

        macro_rules! register_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_gauge {
            ($name:expr, $help:expr) => {{
                let gauge = IntGauge::new($name, $help)?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            }};
        }

        macro_rules! register_gauge_vec {
            ($name:expr, $help:expr, $labels:expr) => {{
                let gauge = IntGaugeVec::new(prometheus::Opts::new($name, $help), $labels)?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            }};
        }

        let sent_packets =
            register_counter!("sent_packets_total", "Packets originated by this node");
        let forwarded_packets = register_counter!(
            "forwarded_packets_total",
            "Packets relayed toward another service"
        );
        let processed_packets = register_counter!(
            "processed_packets_total",
            "Packets consumed locally (including broadcast deliveries)"
        );
        let dropped_packets = register_counter!(
            "dropped_packets_total",
            "Packets dropped: ttd exhausted, duplicate path, or no egress"
        );
        let broadcast_packets =
            register_counter!("broadcast_packets_total", "Broadcast packets handled");
        let null_packets = register_counter!(
            "null_packets_total",
            "Zero-payload keepalive packets received"
        );
        let keepalives_sent =
            register_counter!("keepalives_sent_total", "Keepalive packets emitted");
        let garbage_bytes = register_counter!(
            "garbage_bytes_total",
            "Discarded bytes that never became a frame"
        );
        let buffer_timeouts = register_counter!(
            "buffer_timeouts_total",
            "Per-link frame pumps cut short by the tick budget"
        );
        let callback_timeouts = register_counter!(
            "callback_timeouts_total",
            "Callback drains cut short by the tick budget"
        );
        let buffer_rots = register_counter!(
            "buffer_rots_total",
            "Receive buffers cleared after going stale"
        );
        let lut_entries = register_gauge!("lut_entries", "Current routing table size");
        let inbox_depth = register_gauge!("inbox_depth", "Deliveries waiting to be consumed");
        let buffered_bytes = register_gauge_vec!(
            "buffered_bytes",
            "Bytes sitting in a link's receive buffer",
            &["link"]
        );

        Ok(Self {
            registry,
            sent_packets,
            forwarded_packets,
            processed_packets,
            dropped_packets,
            broadcast_packets,
            null_packets,
            keepalives_sent,
            garbage_bytes,
            buffer_timeouts,
            callback_timeouts,
            buffer_rots,
            lut_entries,
            inbox_depth,
            buffered_bytes,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_metrics_registry() {
        let metrics = Metrics::new().expect("metrics");
        metrics.sent_packets.inc();
        metrics.lut_entries.set(3);
        metrics.buffered_bytes.with_label_values(&["/dev/ttyUSB0"]).set(42);
        assert!(!metrics.gather().is_empty());
    }
}
