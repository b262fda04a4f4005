//! Courier shared types
//!
//! Data model shared by the message source, the router and the pump:
//! message contexts, correlation info, processing results, circuit and
//! lifecycle states, and pump configuration.

use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod logging;

pub use logging::{init_logging, LoggingSettings};

// ============================================================================
// Message Types
// ============================================================================

/// Broker property carrying the operation id of the upstream request
pub const OPERATION_ID_PROPERTY: &str = "Operation-Id";
/// Broker property carrying the transaction id
pub const TRANSACTION_ID_PROPERTY: &str = "Transaction-Id";
/// Broker property carrying the operation parent id
pub const OPERATION_PARENT_ID_PROPERTY: &str = "Operation-Parent-Id";

/// Broker-side metadata of one inbound message.
///
/// The message id and job id are validated on construction and can never be blank.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContext {
    message_id: String,
    job_id: String,
    properties: HashMap<String, serde_json::Value>,
    delivery_count: u32,
    enqueued_at: DateTime<Utc>,
}

impl MessageContext {
    pub fn new(message_id: impl Into<String>, job_id: impl Into<String>) -> Result<Self> {
        let message_id = message_id.into();
        let job_id = job_id.into();

        if message_id.trim().is_empty() {
            return Err(CourierError::InvalidArgument("message id must not be blank".to_string()));
        }
        if job_id.trim().is_empty() {
            return Err(CourierError::InvalidArgument("job id must not be blank".to_string()));
        }

        Ok(Self {
            message_id,
            job_id,
            properties: HashMap::new(),
            delivery_count: 1,
            enqueued_at: Utc::now(),
        })
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: HashMap<String, serde_json::Value>) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count;
        self
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn properties(&self) -> &HashMap<String, serde_json::Value> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }

    /// String-valued property, `None` when missing or not a string
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    /// Number of times the broker has delivered this message (1 on first delivery)
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }
}

/// Correlation identifiers attached to every dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorrelationInfo {
    operation_id: String,
    transaction_id: Option<String>,
    operation_parent_id: Option<String>,
    cycle_id: String,
}

impl CorrelationInfo {
    /// Creates correlation info with a freshly generated cycle id
    pub fn new(operation_id: impl Into<String>) -> Result<Self> {
        let operation_id = operation_id.into();
        if operation_id.trim().is_empty() {
            return Err(CourierError::InvalidArgument("operation id must not be blank".to_string()));
        }

        Ok(Self {
            operation_id,
            transaction_id: None,
            operation_parent_id: None,
            cycle_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Reads correlation properties from the broker context.
    ///
    /// Falls back to the message id when no operation id property is present.
    pub fn from_context(context: &MessageContext) -> Self {
        let operation_id = context
            .property_str(OPERATION_ID_PROPERTY)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(context.message_id())
            .to_string();

        Self {
            operation_id,
            transaction_id: context.property_str(TRANSACTION_ID_PROPERTY).map(str::to_string),
            operation_parent_id: context.property_str(OPERATION_PARENT_ID_PROPERTY).map(str::to_string),
            cycle_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn with_operation_parent_id(mut self, operation_parent_id: impl Into<String>) -> Self {
        self.operation_parent_id = Some(operation_parent_id.into());
        self
    }

    pub fn with_cycle_id(mut self, cycle_id: impl Into<String>) -> Self {
        self.cycle_id = cycle_id.into();
        self
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    pub fn operation_parent_id(&self) -> Option<&str> {
        self.operation_parent_id.as_deref()
    }

    pub fn cycle_id(&self) -> &str {
        &self.cycle_id
    }
}

// ============================================================================
// Processing Types
// ============================================================================

/// Why a message was not processed successfully
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingErrorKind {
    /// No candidate handler accepted the message
    Unmatched,
    /// No candidate could deserialize the body (reported as `Unmatched` by the router)
    DeserializationFailed,
    /// The selected handler returned an error or panicked
    HandlerFailed,
}

impl ProcessingErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unmatched => "Unmatched",
            Self::DeserializationFailed => "DeserializationFailed",
            Self::HandlerFailed => "HandlerFailed",
        }
    }
}

impl fmt::Display for ProcessingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies the handler a message was dispatched to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedHandler {
    pub message_type: String,
    pub order: usize,
}

/// Outcome of routing one message
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    success: bool,
    error_kind: Option<ProcessingErrorKind>,
    error_message: Option<String>,
    error: Option<Arc<anyhow::Error>>,
    handler: Option<MatchedHandler>,
    recovery: Option<RecoveryOptions>,
}

impl ProcessingResult {
    pub fn success(handler: MatchedHandler) -> Self {
        Self {
            success: true,
            error_kind: None,
            error_message: None,
            error: None,
            handler: Some(handler),
            recovery: None,
        }
    }

    pub fn unmatched(message: impl Into<String>) -> Self {
        Self::failure(ProcessingErrorKind::Unmatched, message.into())
    }

    pub fn handler_failed(
        handler: MatchedHandler,
        error: anyhow::Error,
        recovery: Option<RecoveryOptions>,
    ) -> Self {
        Self {
            success: false,
            error_kind: Some(ProcessingErrorKind::HandlerFailed),
            error_message: Some(format!("{:#}", error)),
            error: Some(Arc::new(error)),
            handler: Some(handler),
            recovery,
        }
    }

    fn failure(kind: ProcessingErrorKind, message: String) -> Self {
        Self {
            success: false,
            error_kind: Some(kind),
            error_message: Some(message),
            error: None,
            handler: None,
            recovery: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn error_kind(&self) -> Option<ProcessingErrorKind> {
        self.error_kind
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// The error returned by the handler, for `HandlerFailed` results
    pub fn error(&self) -> Option<&anyhow::Error> {
        self.error.as_deref()
    }

    pub fn handler(&self) -> Option<&MatchedHandler> {
        self.handler.as_ref()
    }

    /// Recovery options declared by the failing handler, if any
    pub fn recovery(&self) -> Option<&RecoveryOptions> {
        self.recovery.as_ref()
    }
}

// ============================================================================
// Circuit Breaker Types
// ============================================================================

/// Circuit breaker state of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Messages are received and routed normally
    Closed,
    /// Receiving is suspended until the recovery period elapses
    Open,
    /// One probe message per probe interval is allowed through
    HalfOpen,
}

impl CircuitState {
    pub fn is_closed(&self) -> bool {
        matches!(self, CircuitState::Closed)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open)
    }

    pub fn is_half_open(&self) -> bool {
        matches!(self, CircuitState::HalfOpen)
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "Closed",
            Self::Open => "Open",
            Self::HalfOpen => "HalfOpen",
        };
        f.write_str(s)
    }
}

/// How long a paused circuit stays open and how often it probes afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOptions {
    pub recovery_period: Duration,
    pub probe_interval: Duration,
}

impl RecoveryOptions {
    pub const DEFAULT_RECOVERY_PERIOD: Duration = Duration::from_secs(30);
    pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

    pub fn new(recovery_period: Duration, probe_interval: Duration) -> Result<Self> {
        let options = Self { recovery_period, probe_interval };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.recovery_period.is_zero() {
            return Err(CourierError::InvalidArgument("recovery period must be positive".to_string()));
        }
        if self.probe_interval.is_zero() {
            return Err(CourierError::InvalidArgument("probe interval must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            recovery_period: Self::DEFAULT_RECOVERY_PERIOD,
            probe_interval: Self::DEFAULT_PROBE_INTERVAL,
        }
    }
}

// ============================================================================
// Pump Types
// ============================================================================

/// Lifecycle of a message pump. Only the pump itself moves between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PumpLifecycleState {
    Stopped,
    Starting,
    Running,
    /// Circuit opened while routed messages are still in flight
    Pausing,
    /// Circuit open and nothing in flight
    Paused,
    Stopping,
}

impl PumpLifecycleState {
    /// True while the receive loop is alive (including paused)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Pausing | Self::Paused)
    }
}

impl fmt::Display for PumpLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the pump does with a message no handler accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedPolicy {
    #[default]
    DeadLetter,
    Abandon,
}

/// Runtime configuration of one message pump
#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub job_id: String,
    /// Maximum number of messages being routed at the same time
    pub max_concurrent_receives: u32,
    /// Upper bound for a single receive call
    pub max_batch_size: u32,
    /// Default recovery options when the failing handler declares none
    pub recovery: RecoveryOptions,
    pub empty_poll_delay: Duration,
    pub receive_error_backoff: Duration,
    /// How long `stop` waits for in-flight routes before cancelling them
    pub drain_timeout: Duration,
    pub unmatched_policy: UnmatchedPolicy,
}

impl PumpConfig {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            max_concurrent_receives: 10,
            max_batch_size: 10,
            recovery: RecoveryOptions::default(),
            empty_poll_delay: Duration::from_millis(100),
            receive_error_backoff: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(60),
            unmatched_policy: UnmatchedPolicy::DeadLetter,
        }
    }

    pub fn with_max_concurrent_receives(mut self, max: u32) -> Self {
        self.max_concurrent_receives = max;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryOptions) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_unmatched_policy(mut self, policy: UnmatchedPolicy) -> Self {
        self.unmatched_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_id.trim().is_empty() {
            return Err(CourierError::InvalidConfiguration("job id must not be blank".to_string()));
        }
        if self.max_concurrent_receives == 0 {
            return Err(CourierError::InvalidConfiguration(format!(
                "max_concurrent_receives must be positive for job {}",
                self.job_id
            )));
        }
        if self.max_batch_size == 0 {
            return Err(CourierError::InvalidConfiguration(format!(
                "max_batch_size must be positive for job {}",
                self.job_id
            )));
        }
        for (field, value) in [
            ("empty_poll_delay", self.empty_poll_delay),
            ("receive_error_backoff", self.receive_error_backoff),
            ("drain_timeout", self.drain_timeout),
        ] {
            if value.is_zero() {
                return Err(CourierError::InvalidConfiguration(format!(
                    "{} must be positive for job {}",
                    field, self.job_id
                )));
            }
        }
        self.recovery
            .validate()
            .map_err(|e| CourierError::InvalidConfiguration(format!("job {}: {}", self.job_id, e)))
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),
}

pub type Result<T> = std::result::Result<T, CourierError>;
