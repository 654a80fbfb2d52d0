//! Realm settings reconciler.
//!
//! Settings are partial: only fields the document sets are compared and
//! written, attributes merge key-wise, and stored fingerprints survive.

use async_trait::async_trait;
use tracing::{debug, info};

use super::{RealmContext, Reconciler};
use crate::diff::ChangeSummary;
use crate::error::Result;
use crate::model::DesiredRealm;
use crate::policy::Category;

pub struct RealmSettingsReconciler;

#[async_trait]
impl Reconciler for RealmSettingsReconciler {
    fn category(&self) -> Category {
        Category::Realm
    }

    async fn reconcile(
        &self,
        ctx: &RealmContext<'_>,
        desired: &DesiredRealm,
    ) -> Result<ChangeSummary> {
        let wanted = &desired.settings;
        let admin_err = || ctx.admin_err(Category::Realm, ctx.realm);

        let Some(actual) = ctx.admin.get_realm(ctx.realm).await.map_err(admin_err())? else {
            info!("Creating realm {}", ctx.realm);
            ctx.admin.create_realm(wanted).await.map_err(admin_err())?;
            return Ok(ChangeSummary {
                created: 1,
                ..Default::default()
            });
        };

        let merged = wanted.merged_onto(&actual);
        if merged == actual {
            debug!("Realm {} settings unchanged", ctx.realm);
            return Ok(ChangeSummary {
                skipped: 1,
                ..Default::default()
            });
        }

        info!("Updating realm {} settings", ctx.realm);
        ctx.admin.update_realm(&merged).await.map_err(admin_err())?;
        Ok(ChangeSummary {
            updated: 1,
            ..Default::default()
        })
    }
}
