//! Tollgate - In-Process Request Admission Control
//!
//! This crate decides whether a request may proceed under configured rate
//! budgets. Requests are described by key/value descriptors, matched against
//! domain-scoped rules in priority order, and charged against a per-key
//! token bucket. Requests no rule applies to are allowed.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use config::{AdmissionSettings, RegistrySettings, TollgateConfig};
pub use error::{Result, TollgateError};
pub use ratelimit::{AdmissionResult, AdmissionService, BucketKey, Descriptor, RuleCatalog};
