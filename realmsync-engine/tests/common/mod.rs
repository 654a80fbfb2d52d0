//! Test helpers for realmsync-engine integration tests.

use std::sync::Arc;
use std::time::Duration;

use realmsync_engine::fingerprint::{attribute_key, fingerprint};
use realmsync_engine::{
    ImportConfig, ManualSleeper, MemoryAdmin, RealmAdmin, RealmDocument, RealmOrchestrator,
    RetryHandler, RetryPolicy, Sleeper,
};
use serde_json::Value;

pub const REALM: &str = "simple";

/// Orchestrator over `admin` whose retries never really sleep.
pub fn make_orchestrator(admin: Arc<MemoryAdmin>, config: ImportConfig) -> RealmOrchestrator {
    make_orchestrator_with_sleeper(admin, config, Arc::new(ManualSleeper::new()))
}

pub fn make_orchestrator_with_sleeper(
    admin: Arc<MemoryAdmin>,
    config: ImportConfig,
    sleeper: Arc<dyn Sleeper>,
) -> RealmOrchestrator {
    let retry = RetryHandler::new(
        RetryPolicy {
            max_attempts: 4,
            delay: Duration::from_millis(250),
        },
        sleeper,
    );
    RealmOrchestrator::new(admin, config, retry)
}

pub fn make_doc(source: &str, raw: Value) -> RealmDocument {
    RealmDocument::from_value(source, raw).unwrap()
}

/// Fingerprint attribute currently stored on the realm, if any.
pub async fn stored_fingerprint(
    admin: &MemoryAdmin,
    config: &ImportConfig,
    source: &str,
) -> Option<String> {
    let settings = admin.get_realm(REALM).await.unwrap()?;
    settings
        .attributes
        .get(&attribute_key(config.fingerprint.mode, source))
        .cloned()
}

pub fn fingerprint_of(doc: &RealmDocument) -> String {
    fingerprint(&doc.raw)
}
