//! fieldsync-core - Core library for FieldSync
//!
//! This crate contains the record models, storage layer, reconciliation
//! engine, and analysis dispatch queue used by the FieldSync API server.

pub mod analysis;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod normalize;
pub mod queue;
pub mod services;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{Case, Diagnosis, Patient, Role, Vitals};
