//! Workflow reconciler.
//!
//! Servers without workflow support answer with an unsupported error; the
//! category is then skipped for the realm.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{RealmContext, Reconciler};
use crate::diff::{self, ChangeSummary, Resource};
use crate::error::Result;
use crate::model::{DesiredRealm, Workflow};
use crate::policy::Category;

impl Resource for Workflow {
    type Key = String;

    fn key(&self) -> String {
        self.name.clone()
    }

    fn same_as(&self, actual: &Self) -> bool {
        self == actual
    }
}

pub struct WorkflowReconciler;

impl WorkflowReconciler {
    async fn apply(ctx: &RealmContext<'_>, wanted: &[Workflow]) -> Result<ChangeSummary> {
        let actual = ctx
            .admin
            .list_workflows(ctx.realm)
            .await
            .map_err(ctx.admin_err(Category::Workflow, ctx.realm))?;
        let plan = diff::plan(wanted, &actual);
        let mut summary = ChangeSummary {
            skipped: plan.skip.len(),
            ..Default::default()
        };

        for workflow in &plan.create {
            info!("Creating workflow {} in realm {}", workflow.name, ctx.realm);
            ctx.admin
                .create_workflow(ctx.realm, workflow)
                .await
                .map_err(ctx.admin_err(Category::Workflow, &workflow.name))?;
            summary.created += 1;
        }

        for (workflow, _) in &plan.update {
            info!("Updating workflow {} in realm {}", workflow.name, ctx.realm);
            ctx.admin
                .update_workflow(ctx.realm, workflow)
                .await
                .map_err(ctx.admin_err(Category::Workflow, &workflow.name))?;
            summary.updated += 1;
        }

        if ctx.policy(Category::Workflow).allows_delete() {
            for workflow in &plan.delete {
                info!("Deleting workflow {} from realm {}", workflow.name, ctx.realm);
                ctx.admin
                    .delete_workflow(ctx.realm, &workflow.name)
                    .await
                    .map_err(ctx.admin_err(Category::Workflow, &workflow.name))?;
                summary.deleted += 1;
            }
        }

        Ok(summary)
    }
}

#[async_trait]
impl Reconciler for WorkflowReconciler {
    fn category(&self) -> Category {
        Category::Workflow
    }

    async fn reconcile(
        &self,
        ctx: &RealmContext<'_>,
        desired: &DesiredRealm,
    ) -> Result<ChangeSummary> {
        let Some(wanted) = desired.workflows.as_deref() else {
            return Ok(ChangeSummary::default());
        };
        match Self::apply(ctx, wanted).await {
            Err(e) if e.is_unsupported() => {
                warn!("Workflows are not supported by the server, skipping realm {}", ctx.realm);
                Ok(ChangeSummary::default())
            }
            result => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::RealmAdmin;
    use crate::memory::{Feature, MemoryAdmin};
    use crate::model::RealmSettings;
    use crate::reconciler::testing::{default_config, make_admin, make_desired, run, REALM};
    use serde_json::json;

    fn make_workflows(after: &str) -> DesiredRealm {
        make_desired(json!({
            "realm": REALM,
            "workflows": [{
                "name": "disable-inactive",
                "on": "user-logged-in",
                "schedule": {"after": after, "batchSize": 100},
                "steps": [{"uses": "disable-user", "after": "30d"}],
                "concurrency": {"restartInProgress": "true"}
            }]
        }))
    }

    #[tokio::test]
    async fn test_workflow_converges() {
        let admin = make_admin().await;
        let config = default_config();
        let summary = run(&WorkflowReconciler, &admin, &config, &make_workflows("1d"))
            .await
            .unwrap();
        assert_eq!(summary.created, 1);

        admin.clear_write_log().await;
        run(&WorkflowReconciler, &admin, &config, &make_workflows("1d")).await.unwrap();
        assert_eq!(admin.writes().await, 0);

        let summary = run(&WorkflowReconciler, &admin, &config, &make_workflows("2d"))
            .await
            .unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(admin.write_log().await, vec!["update_workflow disable-inactive"]);
    }

    #[tokio::test]
    async fn test_unsupported_server_is_skipped() {
        let admin = MemoryAdmin::new().without_feature(Feature::Workflows);
        admin
            .create_realm(&RealmSettings {
                realm: REALM.into(),
                ..Default::default()
            })
            .await
            .unwrap();
        admin.clear_write_log().await;

        let summary = run(&WorkflowReconciler, &admin, &default_config(), &make_workflows("1d"))
            .await
            .unwrap();
        assert!(summary.is_noop());
        assert_eq!(admin.writes().await, 0);
    }
}
