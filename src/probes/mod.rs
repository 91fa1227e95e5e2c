//! Probe task handlers
//!
//! Every probe implements the same four-step contract: validate the raw
//! event payload, preprocess it (resolving addresses and producing the
//! acknowledgement), execute while streaming results through a
//! [`ResultSender`], and expose its type tag for registry routing.

pub mod ping;
pub mod webspeed;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::net::resolver::ResolveError;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("event data format invalid: missing required fields")]
    InvalidData,

    #[error("filterIP error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("task {0} received stop signal")]
    Stopped(String),

    #[error("{0}")]
    Probe(String),
}

/// Output of preprocessing: the enriched task payload plus the
/// acknowledgement frame body sent before execution starts.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub data: Value,
    pub ack: Value,
}

/// Sink for result frames. Implemented by the session's outbound queue;
/// sends that cannot be enqueued are dropped with a warning there.
#[async_trait]
pub trait ResultSender: Send + Sync {
    async fn send(&self, event: &str, body: &Value);
}

/// Uniform probe contract.
#[async_trait]
pub trait ProbeHandler: Send + Sync {
    /// Type tag routed from `request-<tag>` events.
    fn task_type(&self) -> &'static str;

    /// Check the raw event payload shape.
    fn validate(&self, data: &Value) -> Result<(), ProbeError>;

    /// Resolve addressing and build the acknowledgement.
    async fn preprocess(&self, data: Value) -> Result<Prepared, ProbeError>;

    /// Run the probe until done or the stop signal fires.
    async fn execute(
        &self,
        data: &Value,
        task_id: &str,
        stop: watch::Receiver<bool>,
        sender: Arc<dyn ResultSender>,
    ) -> Result<(), ProbeError>;
}

/// Registry mapping type tags to handlers. Filled once at startup and
/// read concurrently by every session.
#[derive(Default)]
pub struct ProbeRegistry {
    handlers: RwLock<HashMap<&'static str, Arc<dyn ProbeHandler>>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn ProbeHandler>) {
        self.handlers.write().insert(handler.task_type(), handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn ProbeHandler>> {
        self.handlers.read().get(task_type).cloned()
    }

    pub fn task_types(&self) -> Vec<&'static str> {
        self.handlers.read().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoopHandler;

    #[async_trait]
    impl ProbeHandler for NoopHandler {
        fn task_type(&self) -> &'static str {
            "noop"
        }

        fn validate(&self, _data: &Value) -> Result<(), ProbeError> {
            Ok(())
        }

        async fn preprocess(&self, data: Value) -> Result<Prepared, ProbeError> {
            Ok(Prepared {
                data,
                ack: json!({}),
            })
        }

        async fn execute(
            &self,
            _data: &Value,
            _task_id: &str,
            _stop: watch::Receiver<bool>,
            _sender: Arc<dyn ResultSender>,
        ) -> Result<(), ProbeError> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_routes_by_type_tag() {
        let registry = ProbeRegistry::new();
        registry.register(Arc::new(NoopHandler));

        assert!(registry.get("noop").is_some());
        assert!(registry.get("other").is_none());
        assert_eq!(registry.task_types(), vec!["noop"]);
    }

    #[test]
    fn test_registry_replaces_on_duplicate_tag() {
        let registry = ProbeRegistry::new();
        registry.register(Arc::new(NoopHandler));
        registry.register(Arc::new(NoopHandler));
        assert_eq!(registry.task_types().len(), 1);
    }
}
