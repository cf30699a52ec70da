//! Outbound delivery for the tether agent.
//!
//! Producers (command handlers, metric collectors) push [`PendingRequest`]s
//! onto a shared [`DeliveryQueue`]; a [`ReporterPool`] drains it through a
//! [`Transport`], normally the authenticated HTTP [`Session`].
//!
//! - [`queue`]: bounded priority queue with async, wake-one dequeue
//! - [`request`]: the queued request type and its builders
//! - [`reporter`]: worker pool with retry/backoff and expiry handling
//! - [`session`]: reqwest-backed transport with agent credentials
//! - [`stats`]: per-worker moving-average counters

pub mod error;
pub mod queue;
pub mod reporter;
pub mod request;
pub mod session;
pub mod stats;

pub use error::DeliveryError;
pub use queue::DeliveryQueue;
pub use reporter::{retry_backoff, ReporterConfig, ReporterPool};
pub use request::{Method, PendingRequest, RequestBody};
pub use session::{authorization_value, Session, Transport};
pub use stats::WorkerSnapshot;
