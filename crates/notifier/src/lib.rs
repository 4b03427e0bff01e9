//! Push notification worker.
//!
//! Consumes push requests from the Redis queue, resolves device tokens
//! through the owning service and delivers them via Firebase Cloud Messaging.

pub mod consumer;
pub mod fcm;
pub mod health;
pub mod owner;
pub mod queue;
