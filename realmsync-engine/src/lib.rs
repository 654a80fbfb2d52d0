pub mod admin;
pub mod config;
pub mod diff;
pub mod error;
pub mod fingerprint;
pub mod memory;
pub mod model;
pub mod orchestrator;
pub mod policy;
pub mod reconciler;
pub mod retry;

pub use admin::{AdminResult, RealmAdmin};
pub use config::{FingerprintConfig, FingerprintMode, ImportConfig, MismatchBehavior, RetryConfig};
pub use diff::ChangeSummary;
pub use error::{AdminError, ReconcileError, Result};
pub use memory::{Feature, MemoryAdmin, MemoryState};
pub use model::{DesiredRealm, RealmDocument};
pub use orchestrator::{RealmOrchestrator, ReconciliationOutcome};
pub use policy::{Category, ManagedConfig, ManagedPolicy};
pub use retry::{ManualSleeper, RetryHandler, RetryPolicy, Sleeper, TokioSleeper};
