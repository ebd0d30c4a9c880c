//! Analysis dispatch queue
//!
//! Entries move `queued -> processing -> completed`, or back to `queued`
//! with a persisted `available_at` after a failed attempt, or to `failed`
//! once `max_attempts` is reached. Retries are deferred by scheduling, never
//! by sleeping, so they survive a restart.

mod dispatcher;
mod worker;

pub use dispatcher::{DispatchOutcome, DispatchQueue};
pub use worker::DispatchWorker;
