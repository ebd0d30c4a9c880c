//! Database layer for FieldSync

mod conflicts;
mod connection;
pub(crate) mod migrations;
mod queue_repository;
mod repository;

pub use conflicts::ConflictLog;
pub use connection::Database;
pub use queue_repository::QueueRepository;
pub use repository::{CollectionRepository, UpsertOutcome};
