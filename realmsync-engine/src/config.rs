//! Import configuration.
//!
//! Built once per run and passed by reference into the orchestrator and every
//! reconciler.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::{self, Category, ManagedConfig, ManagedPolicy};

/// How stored fingerprints are keyed on the realm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FingerprintMode {
    /// One fingerprint per realm, shared by every document targeting it.
    #[default]
    WholeDocument,
    /// One fingerprint per document source.
    PerResource,
}

/// What to do when a stored fingerprint differs from the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MismatchBehavior {
    #[default]
    Continue,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// When false every document is applied; the fingerprint is still recorded.
    pub enabled: bool,
    pub mode: FingerprintMode,
    pub on_mismatch: MismatchBehavior,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: FingerprintMode::default(),
            on_mismatch: MismatchBehavior::default(),
        }
    }
}

/// Bounds for eventual-consistency waits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 500,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub fingerprint: FingerprintConfig,
    pub managed: ManagedConfig,
    pub retry: RetryConfig,
    /// Trigger a federation sync after a user-storage component changes.
    pub sync_user_federation: bool,
}

impl ImportConfig {
    /// Deletion policy for a category.
    pub fn policy(&self, category: Category) -> ManagedPolicy {
        policy::resolve(category, &self.managed)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ImportConfig::default();
        assert!(config.fingerprint.enabled);
        assert_eq!(config.fingerprint.mode, FingerprintMode::WholeDocument);
        assert_eq!(config.fingerprint.on_mismatch, MismatchBehavior::Continue);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.delay(), Duration::from_millis(500));
        assert_eq!(config.policy(Category::Role), ManagedPolicy::Full);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ImportConfig::from_json(
            r#"{
                "fingerprint": {"mode": "per-resource", "on_mismatch": "fail"},
                "managed": {"client-scope": "no-delete"},
                "retry": {"max_attempts": 2}
            }"#,
        )
        .unwrap();
        assert!(config.fingerprint.enabled);
        assert_eq!(config.fingerprint.mode, FingerprintMode::PerResource);
        assert_eq!(config.fingerprint.on_mismatch, MismatchBehavior::Fail);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.delay_ms, 500);
        assert_eq!(config.policy(Category::ClientScope), ManagedPolicy::NoDelete);
        assert!(!config.sync_user_federation);
    }
}
