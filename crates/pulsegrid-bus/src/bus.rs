//! Broadcast-backed bus and filtered subscriptions.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::message::{Labels, Message, MessageKind};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Envelope {
    message: Message,
    labels: Labels,
}

/// Cloneable publish handle. The bus closes when the last clone drops.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Arc<Envelope>>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a message labelled from its content.
    pub fn publish(&self, message: Message) {
        let labels = message.labels();
        let kind = message.kind();
        match self.tx.send(Arc::new(Envelope { message, labels })) {
            Ok(n) => trace!(?kind, subscribers = n, "published"),
            Err(_) => trace!(?kind, "published without subscribers"),
        }
    }

    /// Open a subscription. With no filters it receives every message.
    pub fn subscribe(&self, name: &str) -> Subscription {
        Subscription {
            name: name.to_string(),
            rx: self.tx.subscribe(),
            filters: Vec::new(),
        }
    }
}

/// Kind filter with an optional `key=value` label constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub kind: MessageKind,
    pub label: Option<(String, String)>,
}

impl Filter {
    fn matches(&self, envelope: &Envelope) -> bool {
        if envelope.message.kind() != self.kind {
            return false;
        }
        match &self.label {
            Some((key, value)) => envelope.labels.get(key) == Some(value),
            None => true,
        }
    }
}

pub struct Subscription {
    name: String,
    rx: broadcast::Receiver<Arc<Envelope>>,
    filters: Vec<Filter>,
}

impl Subscription {
    pub fn add_filter(&mut self, kind: MessageKind) -> &mut Self {
        self.filters.push(Filter { kind, label: None });
        self
    }

    pub fn add_filter_with_label(&mut self, kind: MessageKind, key: &str, value: &str) -> &mut Self {
        self.filters.push(Filter {
            kind,
            label: Some((key.to_string(), value.to_string())),
        });
        self
    }

    /// Next matching message, or `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => {
                    if self.filters.is_empty() || self.filters.iter().any(|f| f.matches(&envelope)) {
                        return Some(envelope.message.clone());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(subscription = %self.name, skipped, "subscriber lagged, messages lost");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
