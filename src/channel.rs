//! Asynchronous delivery channels for trace, exception and access records.
//!
//! The queue transport is an external collaborator; [`Queue`] is the one
//! operation svcbase needs from it. Records of a single invocation go through
//! an [`Outbox`]: emitting never waits on the transport, records are delivered
//! in emission order, and [`Outbox::flush`] resolves once everything emitted
//! so far has been handed to its queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::error::{Error, Result};

#[async_trait]
pub trait Queue: Send + Sync + 'static {
    async fn send(&self, message: Value) -> Result<()>;
}

/// Collects messages in memory. Used by tests and local runs.
#[derive(Default)]
pub struct MemoryQueue {
    messages: Mutex<Vec<Value>>,
}

impl MemoryQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<Value> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn send(&self, message: Value) -> Result<()> {
        self.messages
            .lock()
            .map_err(|_| Error::channel("memory", "lock poisoned"))?
            .push(message);
        Ok(())
    }
}

/// Writes every message as a `tracing` event. The default when a deployment
/// binds no queue.
pub struct LogQueue {
    name: &'static str,
}

impl LogQueue {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self { name })
    }
}

#[async_trait]
impl Queue for LogQueue {
    async fn send(&self, message: Value) -> Result<()> {
        info!(channel = self.name, %message, "record");
        Ok(())
    }
}

/// Which observability channel a record belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelKind {
    Trace,
    Exception,
    Access,
}

impl ChannelKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "q_trace",
            Self::Exception => "q_exception",
            Self::Access => "q_access",
        }
    }
}

/// The three observability queues of a service plus its named work queues.
#[derive(Clone)]
pub struct Channels {
    pub trace: Arc<dyn Queue>,
    pub exception: Arc<dyn Queue>,
    pub access: Arc<dyn Queue>,
    pub queues: HashMap<String, Arc<dyn Queue>>,
}

impl Default for Channels {
    fn default() -> Self {
        Self {
            trace: LogQueue::new("q_trace"),
            exception: LogQueue::new("q_exception"),
            access: LogQueue::new("q_access"),
            queues: HashMap::new(),
        }
    }
}

impl Channels {
    fn get(&self, kind: ChannelKind) -> &Arc<dyn Queue> {
        match kind {
            ChannelKind::Trace => &self.trace,
            ChannelKind::Exception => &self.exception,
            ChannelKind::Access => &self.access,
        }
    }
}

enum Delivery {
    Record { kind: ChannelKind, message: Value },
    Flush(oneshot::Sender<()>),
}

/// Ordered, non-blocking sender owned by one invocation.
#[derive(Clone)]
pub struct Outbox {
    sender: mpsc::UnboundedSender<Delivery>,
}

impl Outbox {
    /// Starts the forwarding task. Must be called inside a tokio runtime.
    pub fn spawn(channels: Channels) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(forward(channels, receiver));
        Self { sender }
    }

    pub fn emit(&self, kind: ChannelKind, message: Value) {
        if self.sender.send(Delivery::Record { kind, message }).is_err() {
            warn!(channel = kind.as_str(), "outbox closed, record dropped");
        }
    }

    /// Waits until every record emitted before this call was delivered.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(Delivery::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

async fn forward(channels: Channels, mut receiver: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(delivery) = receiver.recv().await {
        match delivery {
            Delivery::Record { kind, message } => {
                if let Err(e) = channels.get(kind).send(message).await {
                    warn!(channel = kind.as_str(), error = %e, "record delivery failed");
                }
            }
            Delivery::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
