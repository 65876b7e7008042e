//! Warden certificate lifecycle manager
//!
//! Issues, tracks and renews TLS certificates for a fleet of domains so
//! that no managed certificate expires unnoticed.
//!
//! - **Store**: versioned records and key material on disk
//! - **ACME**: orders, HTTP-01 / DNS-01 challenges and CSR finalization
//! - **Scheduler**: periodic due checks with a bounded worker pool
//! - **Orchestrator**: the per-certificate state machine
//! - **Hooks**: post-issuance commands with retry
//!
//! # Example
//!
//! ```ignore
//! use warden_config::Config;
//! use warden_manager::App;
//!
//! let app = App::from_config(Config::from_file("/etc/warden/warden.kdl")?)?;
//! app.run(shutdown).await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod app;
pub mod errors;
pub mod hooks;
pub mod metrics;
pub mod operator;
pub mod orchestrator;
pub mod record;
pub mod scheduler;
pub mod store;

mod shell;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Errors
pub use errors::{ErrorKind, LifecycleError, StoreError};

// Records
pub use record::{
    transition, Attempt, AttemptOutcome, CertificateMaterial, CertificateRecord,
    CertificateState, LifecycleEvent, StoredArtifacts,
};

// Storage
pub use store::{CertificateStore, FsCertificateStore, MemoryCertificateStore};

// ACME
pub use acme::{AcmeAdapter, AcmeClient, AcmeError};

// Lifecycle
pub use hooks::{HookError, HookRunner, HookSpec};
pub use orchestrator::{JobOutcome, Orchestrator};
pub use scheduler::{RenewalScheduler, TickSummary};

// Operator surface
pub use app::App;
pub use metrics::Metrics;
pub use operator::{CertificateStatus, Operator, OperatorError};
