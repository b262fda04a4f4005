//! MessageRouter - selects and invokes exactly one handler per message
//!
//! Routing never fails with an error for message-level problems: an unmatched
//! body or a failing handler is returned as a [`ProcessingResult`]. The only
//! error is cancellation, where no result is produced at all.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use courier_common::{CorrelationInfo, MessageContext, ProcessingResult};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RouterError;
use crate::registry::HandlerRegistry;
use crate::resolver::BodyResolver;
use crate::Result;

#[derive(Debug, Clone)]
pub struct MessageRouter {
    registry: Arc<HandlerRegistry>,
    resolver: BodyResolver,
}

impl MessageRouter {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            resolver: BodyResolver::new(),
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Route one raw message to its handler.
    ///
    /// Returns `Err(RouterError::Cancelled)` when `cancel` fires before the
    /// handler completes; callers must not treat that as a handler failure.
    pub async fn route(
        &self,
        body: &[u8],
        context: &MessageContext,
        correlation: &CorrelationInfo,
        cancel: &CancellationToken,
    ) -> Result<ProcessingResult> {
        if cancel.is_cancelled() {
            return Err(cancelled(context));
        }

        let job_id = context.job_id();
        let candidates = self.registry.candidates_for(job_id);
        if candidates.is_empty() {
            warn!(job_id = %job_id, message_id = %context.message_id(), "No handlers registered for job");
            return Ok(ProcessingResult::unmatched(format!(
                "no handlers registered for job {}",
                job_id
            )));
        }

        let accepted: Vec<_> = candidates
            .iter()
            .filter(|descriptor| descriptor.accepts_context(context))
            .collect();
        if accepted.is_empty() {
            debug!(
                job_id = %job_id,
                message_id = %context.message_id(),
                candidates = candidates.len(),
                "All candidates rejected the message context"
            );
            return Ok(ProcessingResult::unmatched(format!(
                "none of the {} handlers for job {} accept the message context",
                candidates.len(),
                job_id
            )));
        }

        let resolved = match self.resolver.resolve(body, accepted) {
            Ok(resolved) => resolved,
            Err(failed) => {
                warn!(
                    job_id = %job_id,
                    message_id = %context.message_id(),
                    error = %failed,
                    "Message did not match any handler"
                );
                return Ok(ProcessingResult::unmatched(failed.to_string()));
            }
        };

        let descriptor = resolved.descriptor();
        debug!(
            job_id = %job_id,
            message_id = %context.message_id(),
            message_type = %descriptor.message_type(),
            order = descriptor.order(),
            operation_id = %correlation.operation_id(),
            "Dispatching message to handler"
        );

        let invocation = AssertUnwindSafe(descriptor.invoke(resolved.message, context, correlation, cancel))
            .catch_unwind();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(context)),
            outcome = invocation => outcome,
        };

        let result = match outcome {
            Ok(Ok(())) => ProcessingResult::success(descriptor.matched_handler()),
            Ok(Err(_)) if cancel.is_cancelled() => return Err(cancelled(context)),
            Ok(Err(e)) => ProcessingResult::handler_failed(
                descriptor.matched_handler(),
                e,
                descriptor.recovery().copied(),
            ),
            Err(panic) => ProcessingResult::handler_failed(
                descriptor.matched_handler(),
                anyhow::anyhow!("handler panicked: {}", panic_message(panic.as_ref())),
                descriptor.recovery().copied(),
            ),
        };

        Ok(result)
    }
}

fn cancelled(context: &MessageContext) -> RouterError {
    RouterError::Cancelled {
        message_id: context.message_id().to_string(),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{FromMessageContext, MessageHandler};
    use crate::registry::HandlerRegistration;
    use async_trait::async_trait;
    use courier_common::{ProcessingErrorKind, RecoveryOptions};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Deserialize)]
    struct Order {
        #[allow(dead_code)]
        order_id: String,
    }

    /// Context type that only exists for messages carrying a tenant property
    struct TenantContext {
        tenant: String,
    }

    impl FromMessageContext for TenantContext {
        fn from_message_context(context: &MessageContext) -> Option<Self> {
            context.property_str("tenant").map(|t| TenantContext { tenant: t.to_string() })
        }
    }

    #[derive(Default)]
    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageHandler<Order> for Counting {
        async fn process(
            &self,
            _message: Order,
            _context: &MessageContext,
            _correlation: &CorrelationInfo,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct TenantHandler {
        seen: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl MessageHandler<Order, TenantContext> for TenantHandler {
        async fn process(
            &self,
            _message: Order,
            context: &TenantContext,
            _correlation: &CorrelationInfo,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            self.seen.lock().push(context.tenant.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl MessageHandler<Order> for Failing {
        async fn process(
            &self,
            _message: Order,
            _context: &MessageContext,
            _correlation: &CorrelationInfo,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    struct Panicking;

    #[async_trait]
    impl MessageHandler<Order> for Panicking {
        async fn process(
            &self,
            _message: Order,
            _context: &MessageContext,
            _correlation: &CorrelationInfo,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            panic!("handler exploded")
        }
    }

    struct Slow;

    #[async_trait]
    impl MessageHandler<Order> for Slow {
        async fn process(
            &self,
            _message: Order,
            _context: &MessageContext,
            _correlation: &CorrelationInfo,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    const ORDER: &[u8] = br#"{"order_id":"o-1"}"#;

    fn ctx() -> MessageContext {
        MessageContext::new("msg-1", "orders").unwrap()
    }

    fn correlation() -> CorrelationInfo {
        CorrelationInfo::from_context(&ctx())
    }

    fn router(registry: HandlerRegistry) -> MessageRouter {
        MessageRouter::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_success_reports_matched_handler() {
        let handler = Counting::default();
        let calls = handler.calls.clone();
        let mut registry = HandlerRegistry::new();
        registry.register(HandlerRegistration::<Order>::new("orders", handler)).unwrap();

        let result = router(registry)
            .route(ORDER, &ctx(), &correlation(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.handler().unwrap().message_type, "Order");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_job_is_unmatched() {
        let result = router(HandlerRegistry::new())
            .route(ORDER, &ctx(), &correlation(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.error_kind(), Some(ProcessingErrorKind::Unmatched));
        assert!(result.handler().is_none());
    }

    #[tokio::test]
    async fn test_context_type_filters_candidates() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let fallback = Counting::default();
        let fallback_calls = fallback.calls.clone();

        let mut registry = HandlerRegistry::new();
        registry
            .register(HandlerRegistration::<Order, TenantContext>::new(
                "orders",
                TenantHandler { seen: seen.clone() },
            ))
            .unwrap();
        registry.register(HandlerRegistration::<Order>::new("orders", fallback)).unwrap();
        let router = router(registry);

        // no tenant: the tenant handler is not a candidate
        router
            .route(ORDER, &ctx(), &correlation(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
        assert!(seen.lock().is_empty());

        let tenant_ctx = ctx().with_property("tenant", "acme");
        let result = router
            .route(ORDER, &tenant_ctx, &correlation(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.handler().unwrap().order, 0);
        assert_eq!(seen.lock().as_slice(), ["acme".to_string()]);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_context_predicate_rejects_all() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                HandlerRegistration::<Order>::new("orders", Counting::default())
                    .when_context(|c: &MessageContext| c.delivery_count() > 3),
            )
            .unwrap();

        let result = router(registry)
            .route(ORDER, &ctx(), &correlation(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.error_kind(), Some(ProcessingErrorKind::Unmatched));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_handler_failed() {
        let recovery = RecoveryOptions::new(Duration::from_secs(5), Duration::from_secs(1)).unwrap();
        let mut registry = HandlerRegistry::new();
        registry
            .register(HandlerRegistration::<Order>::new("orders", Failing).recovery(recovery))
            .unwrap();

        let result = router(registry)
            .route(ORDER, &ctx(), &correlation(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.is_success());
        assert_eq!(result.error_kind(), Some(ProcessingErrorKind::HandlerFailed));
        assert_eq!(result.error().unwrap().to_string(), "boom");
        assert_eq!(result.recovery(), Some(&recovery));
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_handler_failed() {
        let mut registry = HandlerRegistry::new();
        registry.register(HandlerRegistration::<Order>::new("orders", Panicking)).unwrap();

        let result = router(registry)
            .route(ORDER, &ctx(), &correlation(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.error_kind(), Some(ProcessingErrorKind::HandlerFailed));
        assert!(result.error_message().unwrap().contains("handler exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_produces_no_result() {
        let mut registry = HandlerRegistry::new();
        registry.register(HandlerRegistration::<Order>::new("orders", Slow)).unwrap();
        let router = router(registry);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = router.route(ORDER, &ctx(), &correlation(), &cancel).await.unwrap_err();
        assert!(matches!(err, RouterError::Cancelled { ref message_id } if message_id == "msg-1"));
    }

    #[tokio::test]
    async fn test_already_cancelled_token() {
        let mut registry = HandlerRegistry::new();
        registry.register(HandlerRegistration::<Order>::new("orders", Counting::default())).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = router(registry).route(ORDER, &ctx(), &correlation(), &cancel).await;
        assert!(matches!(err, Err(RouterError::Cancelled { .. })));
    }
}
