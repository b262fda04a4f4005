//! Handler-facing contracts
//!
//! A handler processes one message type `M` with one context type `C`.
//! The context type is produced from the broker's [`MessageContext`] by a
//! [`FromMessageContext`] adapter; a handler whose context type cannot be
//! produced for an incoming message is never a candidate for it.

use async_trait::async_trait;
use courier_common::{CorrelationInfo, MessageContext};
use tokio_util::sync::CancellationToken;

/// Processes deserialized messages of type `M`.
///
/// Returning an error (or panicking) makes the router report `HandlerFailed`,
/// which pauses the job's circuit.
#[async_trait]
pub trait MessageHandler<M, C = MessageContext>: Send + Sync + 'static {
    async fn process(
        &self,
        message: M,
        context: &C,
        correlation: &CorrelationInfo,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Adapter from the broker context to a handler's declared context type.
///
/// `None` means the declared context type does not apply to this message.
pub trait FromMessageContext: Sized + Send + Sync + 'static {
    fn from_message_context(context: &MessageContext) -> Option<Self>;
}

impl FromMessageContext for MessageContext {
    fn from_message_context(context: &MessageContext) -> Option<Self> {
        Some(context.clone())
    }
}

/// Custom body deserializer.
///
/// - `Ok(Some(message))`: the body is a `M`
/// - `Ok(None)`: not applicable, try the next candidate
/// - `Err(_)`: deserialization failed; also treated as not applicable
pub trait BodyDeserializer<M>: Send + Sync + 'static {
    fn deserialize(&self, body: &[u8]) -> anyhow::Result<Option<M>>;
}

impl<M, F> BodyDeserializer<M> for F
where
    F: Fn(&[u8]) -> anyhow::Result<Option<M>> + Send + Sync + 'static,
{
    fn deserialize(&self, body: &[u8]) -> anyhow::Result<Option<M>> {
        self(body)
    }
}
