//! Shared building blocks for the Brainnova data services
//!
//! - `config`: environment-driven configuration (no embedded credentials)
//! - `model`: row types for the hosted store tables
//! - `normalize`: field normalizer (truncation, numeric coercion, safety clamp)
//! - `store`: REST client for the hosted store plus an in-memory store
//! - `aggregate`: dashboard statistics computed from stored results
//! - `logging`: tracing subscriber setup shared by every binary

pub mod aggregate;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod normalize;
pub mod store;

pub use error::{Result, StoreError};
