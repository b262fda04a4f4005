//! Body resolution
//!
//! Offers a raw body to candidates in registration order and returns the
//! first one that both deserializes it and accepts it.

use std::any::Any;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::registry::{BodyAttempt, ErasedMessage, HandlerDescriptor};

/// No candidate could deserialize and accept the body
#[derive(Debug, Error)]
#[error("no handler could deserialize the message body ({} candidates tried: {})", .attempts.len(), .attempts.join("; "))]
pub struct DeserializationFailed {
    /// One line per candidate, in the order they were tried
    pub attempts: Vec<String>,
}

/// A body deserialized by its matching descriptor
pub struct ResolvedBody<'a> {
    pub(crate) message: ErasedMessage,
    descriptor: &'a Arc<HandlerDescriptor>,
}

impl<'a> ResolvedBody<'a> {
    pub fn descriptor(&self) -> &'a Arc<HandlerDescriptor> {
        self.descriptor
    }

    /// The deserialized message, if it is a `M`
    pub fn message<M: Any>(&self) -> Option<&M> {
        self.message.downcast_ref::<M>()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BodyResolver;

impl BodyResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve<'a, I>(&self, body: &[u8], candidates: I) -> Result<ResolvedBody<'a>, DeserializationFailed>
    where
        I: IntoIterator<Item = &'a Arc<HandlerDescriptor>>,
    {
        let mut attempts = Vec::new();

        for descriptor in candidates {
            match descriptor.try_resolve(body) {
                BodyAttempt::Matched(message) => {
                    trace!(
                        job_id = %descriptor.job_id(),
                        message_type = %descriptor.message_type(),
                        order = descriptor.order(),
                        "Resolved message body"
                    );
                    return Ok(ResolvedBody { message, descriptor });
                }
                BodyAttempt::NotApplicable => {
                    attempts.push(format!("{}: not applicable", descriptor.message_type()));
                }
                BodyAttempt::Rejected => {
                    debug!(
                        message_type = %descriptor.message_type(),
                        "Body predicate rejected deserialized message"
                    );
                    attempts.push(format!("{}: rejected by body predicate", descriptor.message_type()));
                }
                BodyAttempt::Failed(e) => {
                    warn!(
                        message_type = %descriptor.message_type(),
                        error = %e,
                        "Custom deserializer failed, trying next candidate"
                    );
                    attempts.push(format!("{}: deserializer failed: {}", descriptor.message_type(), e));
                }
            }
        }

        Err(DeserializationFailed { attempts })
    }
}
