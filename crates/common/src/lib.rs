//! Shared configuration, error taxonomy and wire types for the Herald
//! push-delivery worker.

pub mod config;
pub mod error;
pub mod types;
