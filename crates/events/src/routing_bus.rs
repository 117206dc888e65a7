//! Context-routing bus.
//!
//! Each bounded context gets its own bus. Messages carry an optional
//! `context`; the router forwards them to that context's bus, falling back to
//! the local context when none is set.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::bus::{BusError, MessageBus, ReplySink, Subscription};
use crate::message::Message;

pub struct RoutingMessageBus {
    local: String,
    routes: HashMap<String, Arc<dyn MessageBus>>,
}

impl core::fmt::Debug for RoutingMessageBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut contexts: Vec<&String> = self.routes.keys().collect();
        contexts.sort();
        f.debug_struct("RoutingMessageBus")
            .field("local", &self.local)
            .field("contexts", &contexts)
            .finish()
    }
}

impl RoutingMessageBus {
    /// Create a router whose default route is `local_context` -> `local_bus`.
    pub fn new(local_context: impl Into<String>, local_bus: Arc<dyn MessageBus>) -> Self {
        let local = local_context.into();
        let mut routes = HashMap::new();
        routes.insert(local.clone(), local_bus);
        Self { local, routes }
    }

    pub fn with_route(mut self, context: impl Into<String>, bus: Arc<dyn MessageBus>) -> Self {
        self.routes.insert(context.into(), bus);
        self
    }

    pub fn local_context(&self) -> &str {
        &self.local
    }

    fn route(&self, message: &Message) -> Result<&Arc<dyn MessageBus>, BusError> {
        let context = message.context.as_deref().unwrap_or(&self.local);
        self.routes.get(context).ok_or_else(|| {
            warn!(context, message_id = %message.id, "no bus registered for context");
            BusError::NoRoute(context.to_string())
        })
    }
}

#[async_trait]
impl MessageBus for RoutingMessageBus {
    async fn publish(&self, message: Message, replies: Option<ReplySink>) -> Result<(), BusError> {
        let bus = self.route(&message)?.clone();
        bus.publish(message, replies).await
    }

    /// Subscribes to the local context only.
    fn subscribe(&self) -> Subscription<Message> {
        match self.routes.get(&self.local) {
            Some(bus) => bus.subscribe(),
            None => Subscription::closed(),
        }
    }
}
