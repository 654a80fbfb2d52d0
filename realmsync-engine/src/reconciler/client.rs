//! Client reconciler. Clients are matched by `clientId`.

use async_trait::async_trait;
use tracing::info;

use super::{RealmContext, Reconciler};
use crate::diff::{self, ChangeSummary, Resource};
use crate::error::Result;
use crate::model::{Client, DesiredRealm};
use crate::policy::Category;

impl Resource for Client {
    type Key = String;

    fn key(&self) -> String {
        self.client_id.clone()
    }

    fn same_as(&self, actual: &Self) -> bool {
        // The server-assigned id never takes part in the comparison.
        let mut normalized = actual.clone();
        normalized.id = self.id.clone();
        *self == normalized
    }
}

pub struct ClientReconciler;

#[async_trait]
impl Reconciler for ClientReconciler {
    fn category(&self) -> Category {
        Category::Client
    }

    async fn reconcile(
        &self,
        ctx: &RealmContext<'_>,
        desired: &DesiredRealm,
    ) -> Result<ChangeSummary> {
        let Some(wanted) = desired.clients.as_deref() else {
            return Ok(ChangeSummary::default());
        };
        let actual = ctx
            .admin
            .list_clients(ctx.realm)
            .await
            .map_err(ctx.admin_err(Category::Client, ctx.realm))?;
        let plan = diff::plan(wanted, &actual);
        let mut summary = ChangeSummary {
            skipped: plan.skip.len(),
            ..Default::default()
        };

        for client in &plan.create {
            info!("Creating client {} in realm {}", client.client_id, ctx.realm);
            ctx.admin
                .create_client(ctx.realm, client)
                .await
                .map_err(ctx.admin_err(Category::Client, &client.client_id))?;
            summary.created += 1;
        }

        for (client, existing) in &plan.update {
            info!("Updating client {} in realm {}", client.client_id, ctx.realm);
            let update = Client {
                id: existing.id.clone(),
                ..(*client).clone()
            };
            ctx.admin
                .update_client(ctx.realm, &update)
                .await
                .map_err(ctx.admin_err(Category::Client, &client.client_id))?;
            summary.updated += 1;
        }

        if ctx.policy(Category::Client).allows_delete() {
            for client in &plan.delete {
                info!("Deleting client {} from realm {}", client.client_id, ctx.realm);
                ctx.admin
                    .delete_client(ctx.realm, &client.client_id)
                    .await
                    .map_err(ctx.admin_err(Category::Client, &client.client_id))?;
                summary.deleted += 1;
            }
        }

        Ok(summary)
    }
}
