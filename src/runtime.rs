#![cfg(feature = "runtime")]

//! Tokio-based runtime scaffolding for driving a relay node.
//!
//! The core [`Node`](crate::Node) is synchronous and cooperative; this module
//! wraps it in an actor task that calls [`Node::process`](crate::Node::process)
//! on a fixed interval and surfaces deliveries and errors through an
//! asynchronous channel. `spawn_node` is the entry-point for launching that
//! task.
// Numan Thabit 2026

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError, Receiver, Sender},
        oneshot,
    },
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    io::Link,
    node::{Node, NodeError, NodeStats, RouteSnapshot},
    wire::ServiceId,
};

/// Configuration parameters controlling how a node actor is driven by the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Interval used to call [`Node::process`](crate::Node::process).
    pub tick: Duration,
    /// Capacity of the command channel used between the handle and actor task.
    pub command_buffer: usize,
    /// Capacity of the event channel surfaced to the caller.
    pub event_buffer: usize,
    /// Duration the node must remain idle before an [`RuntimeEvent::Idle`] notification is emitted.
    pub idle_after: Duration,
    /// Minimum gap between successive idle notifications.
    pub idle_interval: Duration,
    /// Number of consecutive `process` errors tolerated before the runtime terminates the actor.
    pub max_error_burst: usize,
    /// Grace period allowed for the actor task to stop during [`NodeHandle::shutdown`].
    pub shutdown_grace: Duration,
}

impl RuntimeConfig {
    /// Creates a new configuration with the provided tick interval and default values for the
    /// remaining parameters.
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            ..Self::default()
        }
    }

    /// Sets the command channel capacity.
    pub fn with_command_buffer(mut self, capacity: usize) -> Self {
        self.command_buffer = capacity.max(1);
        self
    }

    /// Sets the event channel capacity.
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// Sets the idle notification thresholds.
    pub fn with_idle_threshold(mut self, idle_after: Duration, idle_interval: Duration) -> Self {
        self.idle_after = idle_after;
        self.idle_interval = idle_interval;
        self
    }

    /// Sets the maximum tolerated burst of consecutive `process` errors.
    pub fn with_max_error_burst(mut self, burst: usize) -> Self {
        self.max_error_burst = burst;
        self
    }

    /// Sets the grace period used when shutting down the actor task.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn normalize(&mut self) {
        if self.command_buffer == 0 {
            self.command_buffer = 1;
        }
        if self.event_buffer == 0 {
            self.event_buffer = 1;
        }
        if self.idle_interval < self.idle_after {
            self.idle_interval = self.idle_after;
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(50),
            command_buffer: 512,
            event_buffer: 1024,
            idle_after: Duration::from_millis(500),
            idle_interval: Duration::from_secs(5),
            max_error_burst: 4,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Reason why a node actor task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStopReason {
    /// The actor shut down after an explicit [`NodeHandle::shutdown`].
    Shutdown,
    /// The handle dropped the command channel without sending a shutdown request.
    CommandChannelClosed,
    /// The event channel was dropped by the consumer and the actor stopped emitting events.
    EventChannelClosed,
    /// The runtime aborted the actor after a burst of `process` errors.
    Fatal,
}

/// Events emitted by a running node task.
#[derive(Debug)]
pub enum RuntimeEvent {
    /// A payload arrived for this node.
    Delivered(crate::node::Delivery),
    /// [`Node::process`](crate::Node::process) returned an error.
    NodeError(NodeError),
    /// The node remained idle for at least [`RuntimeConfig::idle_after`].
    Idle(Duration),
    /// The runtime terminated the actor after repeated `process` errors.
    Fatal {
        /// Number of back-to-back errors encountered before termination.
        consecutive_errors: usize,
    },
    /// The actor task finished execution.
    Stopped(NodeStopReason),
}

/// Handle used to interact with a spawned node actor.
#[derive(Debug)]
pub struct NodeHandle {
    service: ServiceId,
    commands: Sender<NodeCommand>,
    join: JoinHandle<()>,
    config: Arc<RuntimeConfig>,
}

impl NodeHandle {
    /// Returns the node's own service id.
    pub fn service(&self) -> ServiceId {
        self.service
    }

    /// Returns a reference to the runtime configuration associated with the actor.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Queues a payload for transmission to `dst`.
    pub fn send<B>(&self, dst: ServiceId, payload: B) -> Result<(), NodeHandleError>
    where
        B: Into<Bytes>,
    {
        self.commands
            .try_send(NodeCommand::Send(dst, payload.into()))
            .map_err(|err| match err {
                TrySendError::Closed(_) => NodeHandleError::ChannelClosed,
                TrySendError::Full(_) => NodeHandleError::CommandQueueFull,
            })
    }

    /// Requests a counter snapshot and awaits the result.
    pub async fn stats(&self) -> Result<NodeStats, NodeHandleError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::Stats(tx))
            .await
            .map_err(|_| NodeHandleError::ChannelClosed)?;
        rx.await.map_err(|_| NodeHandleError::ActorStopped)
    }

    /// Requests a routing table snapshot and awaits the result.
    pub async fn lut(&self) -> Result<Vec<RouteSnapshot>, NodeHandleError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::Lut(tx))
            .await
            .map_err(|_| NodeHandleError::ChannelClosed)?;
        rx.await.map_err(|_| NodeHandleError::ActorStopped)
    }

    /// Signals the node actor to terminate and waits for the join handle.
    pub async fn shutdown(self) -> Result<(), NodeHandleError> {
        let NodeHandle {
            commands,
            join,
            config,
            ..
        } = self;

        commands
            .send(NodeCommand::Shutdown)
            .await
            .map_err(|_| NodeHandleError::ChannelClosed)?;

        if config.shutdown_grace.is_zero() {
            join.await.map_err(NodeHandleError::Join)?;
            return Ok(());
        }

        match time::timeout(config.shutdown_grace, join).await {
            Ok(result) => result.map_err(NodeHandleError::Join),
            Err(_) => Err(NodeHandleError::ShutdownTimeout),
        }
    }
}

/// Errors returned by [`NodeHandle`].
#[derive(Debug)]
pub enum NodeHandleError {
    /// The runtime task has already exited and the command channel is closed.
    ChannelClosed,
    /// The runtime command queue is full.
    CommandQueueFull,
    /// The node actor stopped before responding to a request.
    ActorStopped,
    /// Joining the underlying task failed.
    Join(tokio::task::JoinError),
    /// The actor did not stop within the configured grace window.
    ShutdownTimeout,
}

impl std::fmt::Display for NodeHandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChannelClosed => f.write_str("node runtime channel closed"),
            Self::CommandQueueFull => f.write_str("node runtime command channel is full"),
            Self::ActorStopped => f.write_str("node runtime stopped unexpectedly"),
            Self::Join(err) => write!(f, "node runtime join error: {err}"),
            Self::ShutdownTimeout => f.write_str("node runtime shutdown timed out"),
        }
    }
}

impl std::error::Error for NodeHandleError {}

enum NodeCommand {
    Send(ServiceId, Bytes),
    Stats(oneshot::Sender<NodeStats>),
    Lut(oneshot::Sender<Vec<RouteSnapshot>>),
    Shutdown,
}

/// Spawns a Tokio task that continuously drives the provided `node`.
///
/// The node runs in queue mode: deliveries drained after each tick surface as
/// [`RuntimeEvent::Delivered`] on the returned receiver. The [`NodeHandle`]
/// queues outbound payloads and captures diagnostic snapshots.
pub fn spawn_node<L>(node: Node<L>, tick: Duration) -> (NodeHandle, Receiver<RuntimeEvent>)
where
    L: Link + Send + 'static,
{
    let config = RuntimeConfig::new(tick);
    spawn_node_with_config(node, config)
}

/// Spawns a Tokio task using an explicit [`RuntimeConfig`].
pub fn spawn_node_with_config<L>(
    node: Node<L>,
    mut config: RuntimeConfig,
) -> (NodeHandle, Receiver<RuntimeEvent>)
where
    L: Link + Send + 'static,
{
    config.normalize();
    let command_capacity = config.command_buffer;
    let event_capacity = config.event_buffer;
    let config = Arc::new(config);
    let (command_tx, command_rx) = mpsc::channel(command_capacity);
    let (event_tx, event_rx) = mpsc::channel(event_capacity);
    let service = node.service();

    let join = tokio::spawn(run_node(node, Arc::clone(&config), command_rx, event_tx));
    let handle = NodeHandle {
        service,
        commands: command_tx,
        join,
        config,
    };
    (handle, event_rx)
}

async fn run_node<L>(
    mut node: Node<L>,
    config: Arc<RuntimeConfig>,
    mut commands: Receiver<NodeCommand>,
    events: Sender<RuntimeEvent>,
) where
    L: Link + Send + 'static,
{
    let mut ticker = time::interval(config.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut consecutive_errors = 0usize;
    let mut last_idle_emit: Option<Instant> = None;
    let mut exit_reason: Option<NodeStopReason> = None;

    loop {
        let control = tokio::select! {
            biased;
            maybe_cmd = commands.recv() => {
                match maybe_cmd {
                    Some(cmd) => handle_command(&mut node, cmd, &events).await,
                    None => LoopControl::Break(NodeStopReason::CommandChannelClosed),
                }
            }
            _ = ticker.tick() => {
                match node.process() {
                    Ok(_summary) => {
                        consecutive_errors = 0;
                        match drain_deliveries(&mut node, &events).await {
                            Ok(_) => LoopControl::Continue,
                            Err(reason) => LoopControl::Break(reason),
                        }
                    }
                    Err(err) => {
                        consecutive_errors = consecutive_errors.saturating_add(1);
                        match push_event(&events, RuntimeEvent::NodeError(err)).await {
                            Ok(_) => {
                                if config.max_error_burst > 0 && consecutive_errors >= config.max_error_burst {
                                    let service = node.service();
                                    warn!(
                                        %service,
                                        consecutive_errors,
                                        "node runtime stopping after consecutive process errors",
                                    );
                                    match push_event(
                                        &events,
                                        RuntimeEvent::Fatal { consecutive_errors },
                                    )
                                    .await
                                    {
                                        Ok(_) => LoopControl::Break(NodeStopReason::Fatal),
                                        Err(reason) => LoopControl::Break(reason),
                                    }
                                } else {
                                    LoopControl::Continue
                                }
                            }
                            Err(reason) => LoopControl::Break(reason),
                        }
                    }
                }
            }
        };

        match control {
            LoopControl::Continue => {
                if config.idle_after != Duration::ZERO {
                    if let Some(idle_for) = node.idle_for() {
                        if idle_for >= config.idle_after {
                            let should_emit = match last_idle_emit {
                                Some(last) => last.elapsed() >= config.idle_interval,
                                None => true,
                            };
                            if should_emit {
                                match push_event(&events, RuntimeEvent::Idle(idle_for)).await {
                                    Ok(_) => {
                                        last_idle_emit = Some(Instant::now());
                                    }
                                    Err(reason) => {
                                        exit_reason = Some(reason);
                                        break;
                                    }
                                }
                            }
                        }
                    } else {
                        last_idle_emit = None;
                    }
                }
            }
            LoopControl::Break(reason) => {
                exit_reason = Some(reason);
                break;
            }
        }
    }

    let final_reason = exit_reason.unwrap_or(NodeStopReason::EventChannelClosed);
    if let Err(reason) = push_event(&events, RuntimeEvent::Stopped(final_reason)).await {
        debug!(
            service = %node.service(),
            ?final_reason,
            suppressed = ?reason,
            "failed to deliver final stop event for node runtime"
        );
    }
}

enum LoopControl {
    Continue,
    Break(NodeStopReason),
}

async fn drain_deliveries<L>(
    node: &mut Node<L>,
    events: &Sender<RuntimeEvent>,
) -> Result<(), NodeStopReason>
where
    L: Link + Send + 'static,
{
    // Nodes with callbacks registered dispatch during process(); nothing to
    // drain here.
    while let Ok(Some(delivery)) = node.try_recv() {
        push_event(events, RuntimeEvent::Delivered(delivery)).await?;
    }
    Ok(())
}

async fn push_event(
    events: &Sender<RuntimeEvent>,
    event: RuntimeEvent,
) -> Result<(), NodeStopReason> {
    match events.try_send(event) {
        Ok(_) => Ok(()),
        Err(TrySendError::Full(event)) => {
            warn!("runtime event channel full; applying backpressure");
            events
                .send(event)
                .await
                .map_err(|_| NodeStopReason::EventChannelClosed)
        }
        Err(TrySendError::Closed(_)) => Err(NodeStopReason::EventChannelClosed),
    }
}

async fn handle_command<L>(
    node: &mut Node<L>,
    command: NodeCommand,
    events: &Sender<RuntimeEvent>,
) -> LoopControl
where
    L: Link + Send + 'static,
{
    match command {
        NodeCommand::Send(dst, payload) => match node.send(dst, payload) {
            Ok(_) => LoopControl::Continue,
            Err(err) => match push_event(events, RuntimeEvent::NodeError(err)).await {
                Ok(_) => LoopControl::Continue,
                Err(reason) => LoopControl::Break(reason),
            },
        },
        NodeCommand::Stats(resp) => {
            let _ = resp.send(node.stats());
            LoopControl::Continue
        }
        NodeCommand::Lut(resp) => {
            let _ = resp.send(node.lut());
            LoopControl::Continue
        }
        NodeCommand::Shutdown => LoopControl::Break(NodeStopReason::Shutdown),
    }
}
