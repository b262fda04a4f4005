//! Handler registry
//!
//! Registrations are typed ([`HandlerRegistration`]) and erased into
//! [`HandlerDescriptor`]s on `register`. Descriptors are kept per job id in
//! registration order; that order is the tie-break when more than one
//! handler could accept the same message.

use std::any::{type_name, Any};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use courier_common::{CorrelationInfo, MatchedHandler, MessageContext, RecoveryOptions};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RouterError;
use crate::handler::{BodyDeserializer, FromMessageContext, MessageHandler};
use crate::Result;

/// A deserialized body whose concrete type is known only to its descriptor
pub(crate) type ErasedMessage = Box<dyn Any + Send>;

/// How a descriptor turns raw bytes into its message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeserializerKind {
    /// `serde_json` into the declared message type
    Default,
    Custom,
}

/// Outcome of offering a body to one candidate
pub(crate) enum BodyAttempt {
    Matched(ErasedMessage),
    NotApplicable,
    Failed(anyhow::Error),
    /// Deserialized, but the body predicate said no
    Rejected,
}

enum Deserializer<M> {
    Default(fn(&[u8]) -> serde_json::Result<M>),
    Custom(Arc<dyn BodyDeserializer<M>>),
}

type ContextPredicate<C> = Arc<dyn Fn(&C) -> bool + Send + Sync>;
type BodyPredicate<M> = Arc<dyn Fn(&M) -> bool + Send + Sync>;

/// Typed registration of one handler, built before it is erased into a descriptor
pub struct HandlerRegistration<M, C = MessageContext> {
    job_id: String,
    message_type: String,
    handler: Arc<dyn MessageHandler<M, C>>,
    deserializer: Deserializer<M>,
    context_predicate: Option<ContextPredicate<C>>,
    body_predicate: Option<BodyPredicate<M>>,
    recovery: Option<RecoveryOptions>,
}

impl<M, C> HandlerRegistration<M, C>
where
    M: Send + 'static,
    C: FromMessageContext,
{
    /// Register `handler` for `job_id`, deserializing bodies as JSON
    pub fn new(job_id: impl Into<String>, handler: impl MessageHandler<M, C>) -> Self
    where
        M: DeserializeOwned,
    {
        Self::build(
            job_id.into(),
            Arc::new(handler),
            Deserializer::Default(from_json::<M>),
        )
    }

    /// Register `handler` for `job_id` with a custom body deserializer
    pub fn with_deserializer(
        job_id: impl Into<String>,
        handler: impl MessageHandler<M, C>,
        deserializer: impl BodyDeserializer<M>,
    ) -> Self {
        Self::build(
            job_id.into(),
            Arc::new(handler),
            Deserializer::Custom(Arc::new(deserializer)),
        )
    }

    fn build(
        job_id: String,
        handler: Arc<dyn MessageHandler<M, C>>,
        deserializer: Deserializer<M>,
    ) -> Self {
        Self {
            job_id,
            message_type: short_type_name::<M>().to_string(),
            handler,
            deserializer,
            context_predicate: None,
            body_predicate: None,
            recovery: None,
        }
    }

    /// Only consider this handler when the context satisfies `predicate`
    pub fn when_context(mut self, predicate: impl Fn(&C) -> bool + Send + Sync + 'static) -> Self {
        self.context_predicate = Some(Arc::new(predicate));
        self
    }

    /// Only select this handler when the deserialized body satisfies `predicate`
    pub fn when_body(mut self, predicate: impl Fn(&M) -> bool + Send + Sync + 'static) -> Self {
        self.body_predicate = Some(Arc::new(predicate));
        self
    }

    /// Override the message type name used in logs and results
    pub fn message_type(mut self, name: impl Into<String>) -> Self {
        self.message_type = name.into();
        self
    }

    /// Recovery options used when this handler's failure pauses the circuit
    pub fn recovery(mut self, options: RecoveryOptions) -> Self {
        self.recovery = Some(options);
        self
    }
}

fn from_json<M: DeserializeOwned>(body: &[u8]) -> serde_json::Result<M> {
    serde_json::from_slice(body)
}

fn short_type_name<T>() -> &'static str {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    match base.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}

/// Type-erased view of a registration used by the router
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    fn accepts_context(&self, context: &MessageContext) -> bool;

    fn try_resolve(&self, body: &[u8]) -> BodyAttempt;

    async fn invoke(
        &self,
        message: ErasedMessage,
        context: &MessageContext,
        correlation: &CorrelationInfo,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

struct TypedHandler<M, C> {
    handler: Arc<dyn MessageHandler<M, C>>,
    deserializer: Deserializer<M>,
    context_predicate: Option<ContextPredicate<C>>,
    body_predicate: Option<BodyPredicate<M>>,
    _context: PhantomData<fn() -> C>,
}

#[async_trait]
impl<M, C> ErasedHandler for TypedHandler<M, C>
where
    M: Send + 'static,
    C: FromMessageContext,
{
    fn accepts_context(&self, context: &MessageContext) -> bool {
        match C::from_message_context(context) {
            Some(typed) => self.context_predicate.as_ref().map_or(true, |p| p(&typed)),
            None => false,
        }
    }

    fn try_resolve(&self, body: &[u8]) -> BodyAttempt {
        let message = match &self.deserializer {
            Deserializer::Default(deserialize) => match deserialize(body) {
                Ok(message) => message,
                Err(e) => {
                    debug!(message_type = type_name::<M>(), error = %e, "Default deserialization not applicable");
                    return BodyAttempt::NotApplicable;
                }
            },
            Deserializer::Custom(deserializer) => match deserializer.deserialize(body) {
                Ok(Some(message)) => message,
                Ok(None) => return BodyAttempt::NotApplicable,
                Err(e) => return BodyAttempt::Failed(e),
            },
        };

        if let Some(predicate) = &self.body_predicate {
            if !predicate(&message) {
                return BodyAttempt::Rejected;
            }
        }

        BodyAttempt::Matched(Box::new(message))
    }

    async fn invoke(
        &self,
        message: ErasedMessage,
        context: &MessageContext,
        correlation: &CorrelationInfo,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let message = message
            .downcast::<M>()
            .map_err(|_| anyhow::anyhow!("resolved body is not a {}", type_name::<M>()))?;
        let typed_context = C::from_message_context(context).ok_or_else(|| {
            anyhow::anyhow!("message context cannot be converted to {}", type_name::<C>())
        })?;

        self.handler
            .process(*message, &typed_context, correlation, cancel)
            .await
    }
}

/// Immutable registration record of one handler
pub struct HandlerDescriptor {
    job_id: String,
    message_type: String,
    context_type: &'static str,
    order: usize,
    deserializer: DeserializerKind,
    has_context_predicate: bool,
    has_body_predicate: bool,
    recovery: Option<RecoveryOptions>,
    handler: Arc<dyn ErasedHandler>,
}

impl HandlerDescriptor {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn context_type(&self) -> &'static str {
        self.context_type
    }

    /// Position within the job's registrations, starting at 0
    pub fn order(&self) -> usize {
        self.order
    }

    pub fn deserializer(&self) -> DeserializerKind {
        self.deserializer
    }

    pub fn has_context_predicate(&self) -> bool {
        self.has_context_predicate
    }

    pub fn has_body_predicate(&self) -> bool {
        self.has_body_predicate
    }

    pub fn recovery(&self) -> Option<&RecoveryOptions> {
        self.recovery.as_ref()
    }

    pub fn matched_handler(&self) -> MatchedHandler {
        MatchedHandler {
            message_type: self.message_type.clone(),
            order: self.order,
        }
    }

    pub(crate) fn accepts_context(&self, context: &MessageContext) -> bool {
        self.handler.accepts_context(context)
    }

    pub(crate) fn try_resolve(&self, body: &[u8]) -> BodyAttempt {
        self.handler.try_resolve(body)
    }

    pub(crate) async fn invoke(
        &self,
        message: ErasedMessage,
        context: &MessageContext,
        correlation: &CorrelationInfo,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.handler.invoke(message, context, correlation, cancel).await
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("job_id", &self.job_id)
            .field("message_type", &self.message_type)
            .field("context_type", &self.context_type)
            .field("order", &self.order)
            .field("deserializer", &self.deserializer)
            .field("has_context_predicate", &self.has_context_predicate)
            .field("has_body_predicate", &self.has_body_predicate)
            .finish()
    }
}

/// Ordered handler descriptors per job id.
///
/// Filled once at composition time, then shared read-only.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    jobs: IndexMap<String, Vec<Arc<HandlerDescriptor>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to its job's candidate list
    pub fn register<M, C>(&mut self, registration: HandlerRegistration<M, C>) -> Result<Arc<HandlerDescriptor>>
    where
        M: Send + 'static,
        C: FromMessageContext,
    {
        if registration.job_id.trim().is_empty() {
            return Err(RouterError::InvalidRegistration(format!(
                "job id must not be blank (message type {})",
                registration.message_type
            )));
        }
        if registration.message_type.trim().is_empty() {
            return Err(RouterError::InvalidRegistration(format!(
                "message type must be specified for job {}",
                registration.job_id
            )));
        }

        let candidates = self.jobs.entry(registration.job_id.clone()).or_default();
        let descriptor = Arc::new(HandlerDescriptor {
            job_id: registration.job_id,
            message_type: registration.message_type,
            context_type: short_type_name::<C>(),
            order: candidates.len(),
            deserializer: match registration.deserializer {
                Deserializer::Default(_) => DeserializerKind::Default,
                Deserializer::Custom(_) => DeserializerKind::Custom,
            },
            has_context_predicate: registration.context_predicate.is_some(),
            has_body_predicate: registration.body_predicate.is_some(),
            recovery: registration.recovery,
            handler: Arc::new(TypedHandler {
                handler: registration.handler,
                deserializer: registration.deserializer,
                context_predicate: registration.context_predicate,
                body_predicate: registration.body_predicate,
                _context: PhantomData,
            }),
        });

        debug!(
            job_id = %descriptor.job_id,
            message_type = %descriptor.message_type,
            order = descriptor.order,
            "Registered message handler"
        );

        candidates.push(Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Candidates for a job, in registration order
    pub fn candidates_for(&self, job_id: &str) -> &[Arc<HandlerDescriptor>] {
        self.jobs.get(job_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn job_ids(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }

    pub fn handler_count(&self) -> usize {
        self.jobs.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Order {
        #[allow(dead_code)]
        order_id: String,
    }

    struct NoopHandler;

    #[async_trait]
    impl MessageHandler<Order> for NoopHandler {
        async fn process(
            &self,
            _message: Order,
            _context: &MessageContext,
            _correlation: &CorrelationInfo,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_assigns_order_per_job() {
        let mut registry = HandlerRegistry::new();
        registry.register(HandlerRegistration::<Order>::new("orders", NoopHandler)).unwrap();
        registry
            .register(HandlerRegistration::<Order>::new("orders", NoopHandler).message_type("PriorityOrder"))
            .unwrap();
        registry.register(HandlerRegistration::<Order>::new("audit", NoopHandler)).unwrap();

        let candidates = registry.candidates_for("orders");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].order(), 0);
        assert_eq!(candidates[0].message_type(), "Order");
        assert_eq!(candidates[1].order(), 1);
        assert_eq!(candidates[1].message_type(), "PriorityOrder");
        assert_eq!(registry.candidates_for("audit")[0].order(), 0);
        assert_eq!(registry.handler_count(), 3);
        assert_eq!(registry.job_ids().collect::<Vec<_>>(), vec!["orders", "audit"]);
    }

    #[test]
    fn test_unknown_job_has_no_candidates() {
        let registry = HandlerRegistry::new();
        assert!(registry.candidates_for("missing").is_empty());
    }

    #[test]
    fn test_blank_message_type_is_invalid() {
        let mut registry = HandlerRegistry::new();
        let err = registry
            .register(HandlerRegistration::<Order>::new("orders", NoopHandler).message_type("  "))
            .unwrap_err();
        assert!(matches!(err, RouterError::InvalidRegistration(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_blank_job_id_is_invalid() {
        let mut registry = HandlerRegistry::new();
        let err = registry
            .register(HandlerRegistration::<Order>::new("", NoopHandler))
            .unwrap_err();
        assert!(matches!(err, RouterError::InvalidRegistration(_)));
    }

    #[test]
    fn test_descriptor_metadata() {
        let mut registry = HandlerRegistry::new();
        let recovery = RecoveryOptions::default();
        let descriptor = registry
            .register(
                HandlerRegistration::<Order>::with_deserializer(
                    "orders",
                    NoopHandler,
                    |_: &[u8]| -> anyhow::Result<Option<Order>> { Ok(None) },
                )
                .when_context(|ctx: &MessageContext| ctx.property_str("tenant").is_some())
                .when_body(|order: &Order| !order.order_id.is_empty())
                .recovery(recovery),
            )
            .unwrap();

        assert_eq!(descriptor.deserializer(), DeserializerKind::Custom);
        assert_eq!(descriptor.context_type(), "MessageContext");
        assert!(descriptor.has_context_predicate());
        assert!(descriptor.has_body_predicate());
        assert_eq!(descriptor.recovery(), Some(&recovery));
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<Order>(), "Order");
        assert_eq!(short_type_name::<Vec<String>>(), "Vec<alloc::string::String>");
        assert_eq!(short_type_name::<u32>(), "u32");
    }
}
