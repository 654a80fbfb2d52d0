//! Realm orchestrator - runs the category reconcilers for one document and
//! guards the pass with the stored fingerprint.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::admin::RealmAdmin;
use crate::config::{FingerprintConfig, ImportConfig, MismatchBehavior};
use crate::diff::ChangeSummary;
use crate::error::{ReconcileError, Result};
use crate::fingerprint::{attribute_key, FingerprintService};
use crate::model::RealmDocument;
use crate::policy::Category;
use crate::reconciler::{default_reconcilers, RealmContext, Reconciler};
use crate::retry::RetryHandler;

/// Result of reconciling one document.
#[derive(Debug)]
pub enum ReconciliationOutcome {
    /// The stored fingerprint matched; nothing was read beyond it.
    Skipped,
    /// Every managed category ran, in order.
    Applied(Vec<(Category, ChangeSummary)>),
    Failed(ReconcileError),
}

impl ReconciliationOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, ReconciliationOutcome::Failed(_))
    }

    /// Sum of all category summaries.
    pub fn total(&self) -> ChangeSummary {
        let mut total = ChangeSummary::default();
        if let ReconciliationOutcome::Applied(categories) = self {
            for (_, summary) in categories {
                total += *summary;
            }
        }
        total
    }
}

/// Fingerprint attributes written during one batch, as `(realm, attribute)`.
type Written = BTreeSet<(String, String)>;

pub struct RealmOrchestrator {
    admin: Arc<dyn RealmAdmin>,
    config: ImportConfig,
    retry: RetryHandler,
    reconcilers: Vec<Box<dyn Reconciler>>,
}

impl RealmOrchestrator {
    pub fn new(admin: Arc<dyn RealmAdmin>, config: ImportConfig, retry: RetryHandler) -> Self {
        Self {
            admin,
            config,
            retry,
            reconcilers: default_reconcilers(),
        }
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Reconcile a single document.
    pub async fn reconcile(&self, doc: &RealmDocument) -> ReconciliationOutcome {
        let mut written = Written::new();
        self.reconcile_tracked(doc, &mut written).await
    }

    /// Reconcile documents in order. A failing document does not stop the
    /// batch. When several documents share a fingerprint attribute, a later
    /// one is never refused for the value an earlier one just wrote, so the
    /// last document wins.
    pub async fn reconcile_batch(
        &self,
        docs: &[RealmDocument],
    ) -> Vec<(String, ReconciliationOutcome)> {
        let mut written = Written::new();
        let mut outcomes = Vec::with_capacity(docs.len());
        for doc in docs {
            let outcome = self.reconcile_tracked(doc, &mut written).await;
            outcomes.push((doc.source.clone(), outcome));
        }
        outcomes
    }

    async fn reconcile_tracked(
        &self,
        doc: &RealmDocument,
        written: &mut Written,
    ) -> ReconciliationOutcome {
        match self.run(doc, written).await {
            Ok(Some(categories)) => ReconciliationOutcome::Applied(categories),
            Ok(None) => ReconciliationOutcome::Skipped,
            Err(e) => {
                error!(
                    "Reconciliation of {} failed for realm {}: {}",
                    doc.source,
                    doc.realm.name(),
                    e
                );
                ReconciliationOutcome::Failed(e)
            }
        }
    }

    async fn run(
        &self,
        doc: &RealmDocument,
        written: &mut Written,
    ) -> Result<Option<Vec<(Category, ChangeSummary)>>> {
        let realm = doc.realm.name();
        let target = (
            realm.to_string(),
            attribute_key(self.config.fingerprint.mode, &doc.source),
        );

        let fingerprint = if written.contains(&target) {
            FingerprintConfig {
                on_mismatch: MismatchBehavior::Continue,
                ..self.config.fingerprint.clone()
            }
        } else {
            self.config.fingerprint.clone()
        };
        let service = FingerprintService::new(&fingerprint);
        let check = service.should_reconcile(self.admin.as_ref(), doc).await?;
        if !check.should_reconcile {
            info!("Realm {} unchanged since last import of {}, skipping", realm, doc.source);
            return Ok(None);
        }

        info!("Reconciling realm {} from {}", realm, doc.source);
        let ctx = RealmContext {
            realm,
            admin: self.admin.as_ref(),
            config: &self.config,
            retry: &self.retry,
        };

        let mut categories = Vec::with_capacity(self.reconcilers.len());
        for reconciler in &self.reconcilers {
            let category = reconciler.category();
            if !ctx.policy(category).is_managed() {
                debug!("Category {} is unmanaged, skipping realm {}", category, realm);
                continue;
            }
            let summary = reconciler.reconcile(&ctx, &doc.realm).await?;
            if summary.is_noop() {
                debug!("Category {} up to date in realm {}", category, realm);
            } else {
                info!("Category {} in realm {}: {}", category, realm, summary);
            }
            categories.push((category, summary));
        }

        service.record(self.admin.as_ref(), realm, &check).await?;
        written.insert(target);
        Ok(Some(categories))
    }
}
