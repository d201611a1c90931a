//! Incremental embedding synchronization for travel entities.
//!
//! Hotels, places and restaurants are rendered to text, embedded once,
//! recorded in a local snapshot and pushed to a vector index in batches.
//! Interrupted runs resume from a checkpoint; queries go through
//! [`vector::QueryGateway`].

pub mod config;
pub mod dataset;
pub mod embedding;
pub mod error;
pub mod retry;
pub mod sync;
pub mod vector;

pub use error::{Error, Result};
