//! In-process event bus.
//!
//! Events fan out to subscribers over a `tokio` broadcast channel. Subjects
//! are dot-separated; in patterns `*` matches one token and `>` matches one
//! or more trailing tokens.

use async_trait::async_trait;
use cadence_core::events::Event;
use cadence_core::ports::{EventBus, EventStream};
use cadence_core::Result;
use futures::stream;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus for a single process.
#[derive(Clone)]
pub struct LocalEventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl LocalEventBus {
    /// Capacity bounds how far a slow subscriber may fall behind before it
    /// starts missing events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        let subject = event.subject();
        let receivers = self.sender.send(event).unwrap_or(0);
        debug!(subject = %subject, receivers, "Published event");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        let receiver = self.sender.subscribe();
        let pattern = pattern.to_string();
        let events = stream::unfold(receiver, move |mut receiver| {
            let pattern = pattern.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) if subject_matches(&pattern, &event.subject()) => {
                            return Some((Ok(event), receiver));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(pattern = %pattern, skipped = n, "Event subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(Box::pin(events))
    }
}

/// Matches a subject against a pattern with `*` and `>` wildcards.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
