use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::mqtt::topics::{TopicError, TopicPattern};

/// Failure inside a message callback; logged, never propagated to the transport
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid JSON payload on '{topic}': {source}")]
    Payload {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    /// The topic does not carry the levels the handler needs
    #[error("unexpected topic '{0}'")]
    Topic(String),

    #[error("payload on '{0}' is not a JSON object")]
    NotAnObject(String),

    #[error("{0}")]
    Handler(String),
}

/// Message callback, invoked with `(payload, topic)`
pub type Handler = Arc<dyn Fn(&str, &str) -> Result<(), DispatchError> + Send + Sync>;

#[derive(Clone)]
pub struct PatternSubscription {
    pub pattern: TopicPattern,
    handler: Handler,
}

impl fmt::Debug for PatternSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternSubscription")
            .field("pattern", &self.pattern.as_str())
            .finish()
    }
}

/// Pattern callbacks in registration order
#[derive(Clone, Debug, Default)]
pub struct HandlerRegistry {
    entries: Vec<PatternSubscription>,
}

impl HandlerRegistry {
    pub fn register(&mut self, pattern: &str, handler: Handler) -> Result<(), TopicError> {
        let pattern = TopicPattern::parse(pattern)?;
        self.entries.push(PatternSubscription { pattern, handler });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct patterns in first-registration order, for subscribe replay
    pub fn patterns(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .map(|entry| entry.pattern.as_str())
            .filter(|pattern| seen.insert(*pattern))
            .map(str::to_string)
            .collect()
    }

    /// Runs every matching handler; returns how many matched
    pub fn dispatch(&self, topic: &str, payload: &str) -> usize {
        let mut matched = 0;
        for entry in self.entries.iter().filter(|e| e.pattern.matches(topic)) {
            matched += 1;
            if let Err(e) = (entry.handler)(payload, topic) {
                warn!(pattern = entry.pattern.as_str(), "Message handler failed: {}", e);
            }
        }
        matched
    }
}
