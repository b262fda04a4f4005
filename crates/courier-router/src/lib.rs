//! Courier message router
//!
//! This crate provides the message-consumption core:
//! - HandlerRegistry: ordered, typed handler registrations per job id
//! - BodyResolver: deserialization chain over candidates in registration order
//! - MessageRouter: candidate filtering, resolution and handler invocation
//! - CircuitBreakerController: per-job Closed / Open / HalfOpen state machine
//! - MessagePump: receive loop with a bounded worker pool and Start/Stop/Restart
//! - PumpManager: one pump per job over a shared registry and circuit controller

pub mod circuit_breaker;
pub mod error;
pub mod handler;
pub mod manager;
pub mod pump;
pub mod registry;
pub mod resolver;
pub mod router;

pub use circuit_breaker::{CircuitBreakerController, CircuitSnapshot, ProbeOutcome};
pub use error::RouterError;
pub use handler::{BodyDeserializer, FromMessageContext, MessageHandler};
pub use manager::PumpManager;
pub use pump::{MessagePump, PumpStats, ERROR_PROPERTY, FAILURE_PROPERTY};
pub use registry::{DeserializerKind, HandlerDescriptor, HandlerRegistration, HandlerRegistry};
pub use resolver::{BodyResolver, DeserializationFailed, ResolvedBody};
pub use router::MessageRouter;

pub type Result<T> = std::result::Result<T, RouterError>;
