//! Operation-cost admission control for GraphQL APIs.
//!
//! Each operation is priced by the root fields it selects, and the price is spent from a token
//! bucket belonging to the caller. Buckets live in process memory for single-instance
//! deployments, or in Redis when several instances share the traffic of an identity.

#![warn(unreachable_pub)]

pub mod configuration;
pub mod cost;
pub mod error;
pub mod graphql;
pub mod identity;
pub mod layer;
pub mod limiter;
mod plugin;
mod redis;
pub mod services;

pub use configuration::Configuration;
pub use error::AdmissionError;
pub use layer::AdmissionLayer;
pub use layer::AdmissionService;
pub use plugin::AdmissionControl;
pub use redis::Error as RedisError;
pub use services::AdmissionRequest;
pub use services::Admitted;
