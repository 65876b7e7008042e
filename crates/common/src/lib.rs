//! Common types shared across the Warden crates.
//!
//! - [`ids`]: certificate identifiers and validated domain sets
//! - [`types`]: renewal policy, backoff schedule and challenge kinds
//! - [`clock`]: wall-clock abstraction used for every renewal decision

pub mod clock;
pub mod ids;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::{validate_domain, CertificateId, DomainError, DomainSet};
pub use types::{span_from_secs, BackoffSchedule, ChallengeKind, RenewalPolicy};
