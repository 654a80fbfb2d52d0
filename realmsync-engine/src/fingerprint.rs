//! Change fingerprints.
//!
//! A document's fingerprint is the SHA-256 of its canonical JSON form (object
//! keys sorted, no whitespace). It is stored as a realm attribute after a
//! successful pass and compared on the next run to skip unchanged documents.

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::admin::RealmAdmin;
use crate::config::{FingerprintConfig, FingerprintMode, MismatchBehavior};
use crate::error::{ReconcileError, Result};
use crate::model::RealmDocument;
use crate::policy::Category;

/// Realm attribute prefix for stored fingerprints.
pub const FINGERPRINT_ATTRIBUTE_PREFIX: &str = "realmsync.import-checksum-";

/// Attribute suffix used in whole-document mode.
pub const WHOLE_DOCUMENT_KEY: &str = "default";

/// Serialize a JSON value with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hex SHA-256 of the canonical form.
pub fn fingerprint(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Realm attribute that holds the fingerprint for `source`.
pub fn attribute_key(mode: FingerprintMode, source: &str) -> String {
    match mode {
        FingerprintMode::WholeDocument => {
            format!("{}{}", FINGERPRINT_ATTRIBUTE_PREFIX, WHOLE_DOCUMENT_KEY)
        }
        FingerprintMode::PerResource => format!("{}{}", FINGERPRINT_ATTRIBUTE_PREFIX, source),
    }
}

pub fn is_fingerprint_attribute(key: &str) -> bool {
    key.starts_with(FINGERPRINT_ATTRIBUTE_PREFIX)
}

/// Result of comparing a document against the stored fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintCheck {
    pub attribute: String,
    pub computed: String,
    pub stored: Option<String>,
    pub should_reconcile: bool,
}

/// Decides whether a document needs applying and records it afterwards.
pub struct FingerprintService<'a> {
    config: &'a FingerprintConfig,
}

impl<'a> FingerprintService<'a> {
    pub fn new(config: &'a FingerprintConfig) -> Self {
        Self { config }
    }

    /// Compare a document against an already-fetched stored value.
    pub fn evaluate(&self, doc: &RealmDocument, stored: Option<&str>) -> Result<FingerprintCheck> {
        let attribute = attribute_key(self.config.mode, &doc.source);
        let computed = fingerprint(&doc.raw);
        let stored = stored.map(str::to_string);

        let should_reconcile = if !self.config.enabled {
            true
        } else {
            match stored.as_deref() {
                None => true,
                Some(previous) if previous == computed => false,
                Some(previous) => {
                    if self.config.on_mismatch == MismatchBehavior::Fail {
                        return Err(ReconcileError::FingerprintConflict {
                            realm: doc.realm.name().to_string(),
                            category: Category::Realm,
                            source_id: doc.source.clone(),
                            stored: previous.to_string(),
                            computed,
                        });
                    }
                    true
                }
            }
        };

        Ok(FingerprintCheck {
            attribute,
            computed,
            stored,
            should_reconcile,
        })
    }

    /// Look up the stored fingerprint on the realm and evaluate the document.
    pub async fn should_reconcile(
        &self,
        admin: &dyn RealmAdmin,
        doc: &RealmDocument,
    ) -> Result<FingerprintCheck> {
        let realm = doc.realm.name();
        let attribute = attribute_key(self.config.mode, &doc.source);
        let stored = admin
            .get_realm(realm)
            .await
            .map_err(|source| ReconcileError::Admin {
                realm: realm.to_string(),
                category: Category::Realm,
                entity: realm.to_string(),
                source,
            })?
            .and_then(|settings| settings.attributes.get(&attribute).cloned());

        let check = self.evaluate(doc, stored.as_deref())?;
        debug!(
            "Fingerprint for {} in realm {}: computed {}, stored {:?}",
            doc.source, realm, check.computed, check.stored
        );
        Ok(check)
    }

    /// Write the fingerprint back onto the realm.
    pub async fn record(
        &self,
        admin: &dyn RealmAdmin,
        realm: &str,
        check: &FingerprintCheck,
    ) -> Result<()> {
        let admin_err = |source| ReconcileError::Admin {
            realm: realm.to_string(),
            category: Category::Realm,
            entity: check.attribute.clone(),
            source,
        };

        let mut settings = admin
            .get_realm(realm)
            .await
            .map_err(admin_err)?
            .ok_or_else(|| admin_err(crate::error::AdminError::NotFound(realm.to_string())))?;

        if settings.attributes.get(&check.attribute) == Some(&check.computed) {
            return Ok(());
        }

        settings
            .attributes
            .insert(check.attribute.clone(), check.computed.clone());
        admin.update_realm(&settings).await.map_err(admin_err)?;
        info!("Recorded fingerprint {} for realm {}", check.computed, realm);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_doc(source: &str, raw: Value) -> RealmDocument {
        RealmDocument::from_value(source, raw).unwrap()
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a: Value =
            serde_json::from_str(r#"{"realm":"simple","loginTheme":"x","roles":{"realm":[]}}"#)
                .unwrap();
        let b: Value = serde_json::from_str(
            "{\n  \"roles\": {\"realm\": []},\n  \"loginTheme\": \"x\",\n  \"realm\": \"simple\"\n}",
        )
        .unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_sensitive_to_content() {
        let a = json!({"realm": "simple", "loginTheme": "x"});
        let b = json!({"realm": "simple", "loginTheme": "y"});
        let c = json!({"realm": "simple", "groups": [{"name": "a"}, {"name": "b"}]});
        let d = json!({"realm": "simple", "groups": [{"name": "b"}, {"name": "a"}]});
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&c), fingerprint(&d));
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": {"z": 1, "a": [true, null]}, "a": "q\"uote"});
        assert_eq!(canonical_json(&value), r#"{"a":"q\"uote","b":{"a":[true,null],"z":1}}"#);
    }

    #[test]
    fn test_attribute_key_modes() {
        assert_eq!(
            attribute_key(FingerprintMode::WholeDocument, "a.json"),
            "realmsync.import-checksum-default"
        );
        assert_eq!(
            attribute_key(FingerprintMode::PerResource, "a.json"),
            "realmsync.import-checksum-a.json"
        );
        assert!(is_fingerprint_attribute("realmsync.import-checksum-default"));
    }

    #[test]
    fn test_evaluate_skips_when_unchanged() {
        let config = FingerprintConfig::default();
        let service = FingerprintService::new(&config);
        let doc = make_doc("a.json", json!({"realm": "simple"}));
        let first = service.evaluate(&doc, None).unwrap();
        assert!(first.should_reconcile);

        let second = service.evaluate(&doc, Some(&first.computed)).unwrap();
        assert!(!second.should_reconcile);
    }

    #[test]
    fn test_evaluate_fail_on_mismatch() {
        let config = FingerprintConfig {
            on_mismatch: MismatchBehavior::Fail,
            ..Default::default()
        };
        let service = FingerprintService::new(&config);
        let doc = make_doc("a.json", json!({"realm": "simple"}));

        // First import has nothing to conflict with.
        assert!(service.evaluate(&doc, None).unwrap().should_reconcile);

        let err = service.evaluate(&doc, Some("deadbeef")).unwrap_err();
        match err {
            ReconcileError::FingerprintConflict {
                realm, source_id, ..
            } => {
                assert_eq!(realm, "simple");
                assert_eq!(source_id, "a.json");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_evaluate_disabled_always_reconciles() {
        let config = FingerprintConfig {
            enabled: false,
            on_mismatch: MismatchBehavior::Fail,
            ..Default::default()
        };
        let service = FingerprintService::new(&config);
        let doc = make_doc("a.json", json!({"realm": "simple"}));
        let computed = fingerprint(&doc.raw);
        assert!(service.evaluate(&doc, Some(&computed)).unwrap().should_reconcile);
        assert!(service.evaluate(&doc, Some("other")).unwrap().should_reconcile);
    }
}
