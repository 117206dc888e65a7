//! Events, messages and the bus/handler/projection/saga seams.
//!
//! This crate holds the data model and the traits that the coordination
//! components in `relay-infra` are written against. Transport and storage
//! engines live behind these traits.

pub mod bus;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod message;
pub mod projection;
pub mod routing_bus;
pub mod saga;

pub use bus::{BusError, MessageBus, ReplySink, Subscription};
pub use event::{AggregateRef, DomainEvent};
pub use handler::{handler_fn, HandlerError, MessageHandler};
pub use in_memory_bus::InMemoryMessageBus;
pub use message::{HandlerFailure, HandlerResponse, Message, MessageKind, Reply};
pub use projection::{Projection, ProjectionError};
pub use routing_bus::RoutingMessageBus;
pub use saga::{CommitOutcome, SagaCommand, SagaError, SagaRepository, TimeoutSaga};
