//! Typed command channel to the signal collector
//!
//! The collector (the vendor agent) runs on its own task and is driven by
//! correlated commands. Every command gets a fresh id. Progress updates and the
//! final reply go out on one shared event stream tagged with that id, and a
//! caller drops every event tagged with someone else's.
//!
//! The JSON form of [`CommandMessage`] and [`EventMessage`] matches the
//! postMessage protocol the browser agent frame speaks:
//! `{type: "command", action, agentData?}` in, `{type: "status"|"data"|"error", data}` out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

pub const STATUS_INITIALIZING: &str = "initializing";
pub const STATUS_INITIALIZED: &str = "initialized";
pub const STATUS_COLLECTING: &str = "collecting";
pub const STATUS_RESET_COMPLETE: &str = "reset_complete";
pub const STATUS_AGENT_DATA_HANDLED: &str = "agentDataHandled";

/// Failure reported by the collector itself
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct CollectorError(pub String);

#[derive(Error, Debug, PartialEq)]
pub enum BridgeError {
    #[error("{0}")]
    Collector(String),

    #[error("Collector bridge is closed")]
    Closed,

    #[error("Unexpected reply from collector: {0}")]
    Unexpected(String),
}

/// The vendor agent, as seen by the bridge
#[async_trait]
pub trait SignalCollector: Send {
    /// Load and initialize the agent
    async fn load(&mut self) -> Result<(), CollectorError>;

    /// Gather browser signals; the payload is opaque
    async fn collect(&mut self) -> Result<Value, CollectorError>;

    /// Apply follow-up instructions returned by the identification service
    async fn handle_agent_data(&mut self, agent_data: &Value) -> Result<(), CollectorError>;

    /// Drop the agent instance and any client-side identification state
    async fn reset(&mut self) -> Result<(), CollectorError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum BridgeCommand {
    Collect,
    Reset,
    #[serde(rename_all = "camelCase")]
    HandleAgentData { agent_data: Value },
}

/// Signals plus the timings measured around their collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectedSignals {
    pub browser_data: Value,
    /// Agent load time, ms
    pub load_latency: f64,
    /// Signal collection time, ms
    pub collect_latency: f64,
    /// From the start of agent load to the end of collection, ms
    pub total_latency: f64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum BridgeEvent {
    Status { message: String },
    Data(CollectedSignals),
    Error { message: String },
}

impl BridgeEvent {
    fn status(message: &str) -> Self {
        BridgeEvent::Status {
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "command")]
pub struct CommandMessage {
    pub id: u64,
    #[serde(flatten)]
    pub command: BridgeCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: u64,
    #[serde(flatten)]
    pub event: BridgeEvent,
}

/// Cloneable handle to a running collector task
#[derive(Clone)]
pub struct BridgeHandle {
    commands: mpsc::Sender<CommandMessage>,
    events: broadcast::Sender<EventMessage>,
    next_id: std::sync::Arc<AtomicU64>,
}

/// Statuses that report progress; any other event ends a command
fn is_progress(message: &str) -> bool {
    matches!(
        message,
        STATUS_INITIALIZING | STATUS_INITIALIZED | STATUS_COLLECTING
    )
}

impl BridgeHandle {
    /// Move `collector` onto its own task and return a handle to it
    pub fn spawn<C>(collector: C) -> Self
    where
        C: SignalCollector + 'static,
    {
        let (commands, rx) = mpsc::channel(16);
        let (events, _) = broadcast::channel(64);

        tokio::spawn(run_collector(collector, rx, events.clone()));

        Self {
            commands,
            events,
            next_id: std::sync::Arc::new(AtomicU64::new(1)),
        }
    }

    /// Send a command and wait for its final event, reporting progress
    /// updates along the way. Events carrying another command's id are dropped.
    pub async fn request<F>(
        &self,
        command: BridgeCommand,
        mut on_status: F,
    ) -> Result<BridgeEvent, BridgeError>
    where
        F: FnMut(&str),
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut events = self.events.subscribe();

        self.commands
            .send(CommandMessage { id, command })
            .await
            .map_err(|_| BridgeError::Closed)?;

        loop {
            let message = match events.recv().await {
                Ok(message) => message,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(id, skipped, "Missed collector events");
                    continue;
                }
                Err(RecvError::Closed) => return Err(BridgeError::Closed),
            };

            if message.id != id {
                debug!(expected = id, got = message.id, "Dropping uncorrelated collector event");
                continue;
            }

            match message.event {
                BridgeEvent::Status { message } if is_progress(&message) => on_status(&message),
                event => return Ok(event),
            }
        }
    }

    /// Collect signals, loading the agent first if needed
    pub async fn collect<F>(&self, on_status: F) -> Result<CollectedSignals, BridgeError>
    where
        F: FnMut(&str),
    {
        match self.request(BridgeCommand::Collect, on_status).await? {
            BridgeEvent::Data(signals) => Ok(signals),
            BridgeEvent::Error { message } => Err(BridgeError::Collector(message)),
            BridgeEvent::Status { message } => Err(BridgeError::Unexpected(message)),
        }
    }

    pub async fn reset(&self) -> Result<(), BridgeError> {
        self.expect_status(BridgeCommand::Reset, STATUS_RESET_COMPLETE)
            .await
    }

    pub async fn handle_agent_data(&self, agent_data: Value) -> Result<(), BridgeError> {
        self.expect_status(
            BridgeCommand::HandleAgentData { agent_data },
            STATUS_AGENT_DATA_HANDLED,
        )
        .await
    }

    async fn expect_status(&self, command: BridgeCommand, expected: &str) -> Result<(), BridgeError> {
        match self.request(command, |_| {}).await? {
            BridgeEvent::Status { message } if message == expected => Ok(()),
            BridgeEvent::Error { message } => Err(BridgeError::Collector(message)),
            BridgeEvent::Status { message } => Err(BridgeError::Unexpected(message)),
            BridgeEvent::Data(_) => Err(BridgeError::Unexpected("data".to_string())),
        }
    }
}

/// Collector that replays a fixed payload, for running the flow outside a browser
#[derive(Debug, Clone)]
pub struct StaticCollector {
    payload: Value,
}

impl StaticCollector {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }
}

#[async_trait]
impl SignalCollector for StaticCollector {
    async fn load(&mut self) -> Result<(), CollectorError> {
        Ok(())
    }

    async fn collect(&mut self) -> Result<Value, CollectorError> {
        Ok(self.payload.clone())
    }

    async fn handle_agent_data(&mut self, _agent_data: &Value) -> Result<(), CollectorError> {
        debug!("Static collector received agent data");
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), CollectorError> {
        Ok(())
    }
}

/// Agent load timings, kept until the next reset
struct Loaded {
    started: Instant,
    load_latency: f64,
}

async fn run_collector<C>(
    mut collector: C,
    mut commands: mpsc::Receiver<CommandMessage>,
    events: broadcast::Sender<EventMessage>,
) where
    C: SignalCollector,
{
    let mut loaded: Option<Loaded> = None;

    while let Some(CommandMessage { id, command }) = commands.recv().await {
        let publish = |event: BridgeEvent| events.send(EventMessage { id, event }).is_ok();
        let notify = |text: &str| {
            // No subscribers is fine
            publish(BridgeEvent::status(text));
        };

        let event = match command {
            BridgeCommand::Collect => collect(&mut collector, &mut loaded, &notify).await,
            BridgeCommand::Reset => {
                loaded = None;
                match collector.reset().await {
                    Ok(()) => BridgeEvent::status(STATUS_RESET_COMPLETE),
                    Err(e) => BridgeEvent::Error { message: e.0 },
                }
            }
            BridgeCommand::HandleAgentData { agent_data } => {
                if loaded.is_none() {
                    BridgeEvent::Error {
                        message: "Agent is not loaded".to_string(),
                    }
                } else {
                    match collector.handle_agent_data(&agent_data).await {
                        Ok(()) => BridgeEvent::status(STATUS_AGENT_DATA_HANDLED),
                        Err(e) => BridgeEvent::Error { message: e.0 },
                    }
                }
            }
        };

        if !publish(event) {
            debug!(id, "Requester went away before the collector replied");
        }
    }

    debug!("Collector bridge shut down");
}

async fn collect<C, N>(collector: &mut C, loaded: &mut Option<Loaded>, notify: &N) -> BridgeEvent
where
    C: SignalCollector,
    N: Fn(&str),
{
    if loaded.is_none() {
        notify(STATUS_INITIALIZING);
        let started = Instant::now();
        if let Err(e) = collector.load().await {
            warn!(error = %e, "Failed to load collector agent");
            return BridgeEvent::Error { message: e.0 };
        }
        *loaded = Some(Loaded {
            started,
            load_latency: elapsed_ms(started),
        });
        notify(STATUS_INITIALIZED);
    }

    notify(STATUS_COLLECTING);
    let collect_start = Instant::now();
    let browser_data = match collector.collect().await {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "Signal collection failed");
            return BridgeEvent::Error { message: e.0 };
        }
    };
    let collect_latency = elapsed_ms(collect_start);

    let (load_latency, total_latency) = match loaded {
        Some(l) => (l.load_latency, elapsed_ms(l.started)),
        None => (0.0, collect_latency),
    };

    BridgeEvent::Data(CollectedSignals {
        browser_data,
        load_latency,
        collect_latency,
        total_latency,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
