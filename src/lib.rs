// lineport public library surface.
// Numan Thabit 2026

pub mod config;

pub mod wire;

pub mod buffer;

pub mod lut;

pub mod keepalive;

pub mod io;

pub mod metrics;

pub mod node;

#[cfg(feature = "runtime")]
pub mod runtime;

pub use config::{Config, ConfigError, NodeSection, SerialSection, Timing};

pub use wire::{
    find_frame, xor_fold, FrameSpan, Header, Packet, ServiceId, WireError, BROADCAST_MIN,
    FRAME_MIN_LEN, HEADER_LEN, MAX_PAYLOAD_LEN, PREAMBLE,
};

pub use buffer::{PopOutcome, RxBuffer};

pub use lut::{Lut, LutEntry};

pub use keepalive::{Keepalive, KeepaliveSnapshot};

pub use io::{Link, LinkId};

pub use node::{
    Delivery, LinkStats, Node, NodeError, NodeStats, ProcessSummary, RouteSnapshot,
};

#[cfg(feature = "runtime")]
pub use runtime::{
    spawn_node, spawn_node_with_config, NodeHandle, NodeHandleError, NodeStopReason,
    RuntimeConfig, RuntimeEvent,
};

pub use metrics::{Metrics, MetricsError};
