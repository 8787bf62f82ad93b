//! Transaction store: the durable log of processed messages.
//!
//! This module is split into two submodules:
//! - `model`: claim outcomes and view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! The `processing_records` table is keyed by `message_id`; its uniqueness
//! constraint plus conditional updates are the only synchronisation between
//! workers and overlapping runs.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{ClaimOutcome, ClaimRequest, StatusCount};
