//! Rate limiting logic and state management.

mod bucket;
pub mod clock;
mod descriptor;
mod matcher;
mod registry;
mod rules;
mod service;

pub use bucket::{BucketStatus, TokenBucket};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use descriptor::{BucketKey, Descriptor};
pub use matcher::{DomainPriority, RuleMatcher};
pub use registry::{BucketLimits, BucketRegistry, Refill};
pub use rules::{RateLimit, RateLimitDefinition, Rule, RuleCatalog, RuleDefinition, TimeUnit};
pub use service::{AdmissionResult, AdmissionService, AdmissionStats};
