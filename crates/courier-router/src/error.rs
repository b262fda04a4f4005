//! Router error types

use courier_common::{CourierError, PumpLifecycleState};
use courier_queue::QueueError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("Pump for job {job_id} cannot {operation} while {state}")]
    InvalidLifecycle {
        job_id: String,
        operation: &'static str,
        state: PumpLifecycleState,
    },

    #[error("A pump is already registered for job {0}")]
    DuplicatePump(String),

    #[error("No pump registered for job {0}")]
    UnknownJob(String),

    #[error("Routing of message {message_id} was cancelled")]
    Cancelled { message_id: String },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Common(#[from] CourierError),
}
