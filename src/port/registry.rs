//! Port to capture-handler registry
//!
//! Owned by whoever builds the pipeline and shared by reference with every
//! port. Written while the graph is assembled, read by ports when they are
//! configured or enabled.

use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::handler::CaptureHandler;

/// Handler a port dispatches to
#[derive(Clone)]
pub enum PortHandler {
    /// A capture handler registered for this port
    Registered(Arc<dyn CaptureHandler>),
    /// Nothing registered: input ports produce no data, output buffers are
    /// discarded after release
    Default,
}

impl PortHandler {
    pub fn is_default(&self) -> bool {
        matches!(self, PortHandler::Default)
    }

    /// Handler name for logging
    pub fn name(&self) -> &str {
        match self {
            PortHandler::Registered(handler) => handler.name(),
            PortHandler::Default => "default",
        }
    }
}

impl std::fmt::Debug for PortHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PortHandler({})", self.name())
    }
}

/// Registry keyed by port GUID
#[derive(Default)]
pub struct CallbackRegistry {
    handlers: DashMap<Uuid, Arc<dyn CaptureHandler>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `handler` to the port with `port_guid`, replacing any previous one
    pub fn register(&self, port_guid: Uuid, handler: Arc<dyn CaptureHandler>) {
        tracing::debug!("Registering handler {} for port {}", handler.name(), port_guid);
        if self.handlers.insert(port_guid, handler).is_some() {
            tracing::debug!("Replaced existing handler for port {}", port_guid);
        }
    }

    /// Look up the handler for a port, falling back to [`PortHandler::Default`]
    pub fn find(&self, port_guid: &Uuid) -> PortHandler {
        self.handlers
            .get(port_guid)
            .map(|entry| PortHandler::Registered(entry.value().clone()))
            .unwrap_or(PortHandler::Default)
    }

    pub fn remove(&self, port_guid: &Uuid) -> Option<Arc<dyn CaptureHandler>> {
        self.handlers.remove(port_guid).map(|(_, handler)| handler)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn clear(&self) {
        self.handlers.clear();
    }
}
