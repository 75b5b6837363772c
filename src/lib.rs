//! A local stand-in for an SMS / voice provider's status machinery.
//!
//! Created messages and calls are advanced through a realistic status
//! lifecycle on timers, and every status change is announced to the
//! resource's callback URL through a persistent, retrying webhook queue.
//!
//! ## Guarantees
//! - Statuses of one resource advance in lifecycle order
//! - At most one queued callback per (resource, status)
//! - Callbacks are never sent to loopback, private or link-local hosts
//! - Bounded delivery concurrency, bounded retries with backoff
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Timers surviving a restart (see [`Simulator::recover`])
//! - Ordering of deliveries across resources
//!
//! Everything runs inside one process on the caller's tokio runtime.

mod error;
mod lifecycle;
mod scheduler;
mod signing;
mod simulator;
mod storage;
mod telemetry;
mod types;
mod validation;
mod worker;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use error::{DeliveryOutcome, FailureReason, ScheduleError, StoreError, ValidationError};
pub use lifecycle::{
    talk_time_secs, LifecycleConfig, Plan, StatusCallback, Transition, MAX_CALL_DURATION_SECS,
    MIN_CALL_DURATION_SECS,
};
pub use scheduler::ScheduledTransition;
pub use signing::{
    compute_signature, is_timestamp_fresh, verify_callback, verify_signature, CallbackSigner,
    VerificationError, DEFAULT_SIGNATURE_HEADER, DEFAULT_TIMESTAMP_HEADER,
};
pub use simulator::{Simulator, SimulatorConfig};
pub use storage::{InMemoryStore, ResourceStore, WebhookQueue, DEFAULT_MAX_ATTEMPTS};
pub use types::{
    Account, AccountId, Call, CallStatus, Message, MessageStatus, NewCall, NewMessage,
    NewQueueEntry, PhoneNumber, QueueEntry, QueueEntryId, QueueStatus, Resource, ResourceId,
    ResourceKind, ResourceStatus, UnknownStatus,
};
pub use validation::{is_blocked_ip, validate_destination, validate_url};
pub use worker::{CallbackRequest, ReqwestTransport, Transport, WorkerConfig};

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStore;
