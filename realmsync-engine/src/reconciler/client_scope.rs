//! Client scope reconciler, including each scope's protocol mappers.

use async_trait::async_trait;
use tracing::info;

use super::{RealmContext, Reconciler};
use crate::diff::{self, ChangeSummary, Resource};
use crate::error::Result;
use crate::model::{ClientScope, DesiredRealm, ProtocolMapper};
use crate::policy::Category;

impl Resource for ClientScope {
    type Key = String;

    fn key(&self) -> String {
        self.name.clone()
    }

    fn same_as(&self, actual: &Self) -> bool {
        self.description == actual.description
            && self.protocol == actual.protocol
            && self.attributes == actual.attributes
    }
}

impl Resource for ProtocolMapper {
    type Key = String;

    fn key(&self) -> String {
        self.name.clone()
    }

    fn same_as(&self, actual: &Self) -> bool {
        self == actual
    }
}

pub struct ClientScopeReconciler;

#[async_trait]
impl Reconciler for ClientScopeReconciler {
    fn category(&self) -> Category {
        Category::ClientScope
    }

    async fn reconcile(
        &self,
        ctx: &RealmContext<'_>,
        desired: &DesiredRealm,
    ) -> Result<ChangeSummary> {
        let Some(wanted) = desired.client_scopes.as_deref() else {
            return Ok(ChangeSummary::default());
        };
        let actual = ctx
            .admin
            .list_client_scopes(ctx.realm)
            .await
            .map_err(ctx.admin_err(Category::ClientScope, ctx.realm))?;
        let plan = diff::plan(wanted, &actual);
        let mut summary = ChangeSummary {
            skipped: plan.skip.len(),
            ..Default::default()
        };

        for scope in &plan.create {
            info!("Creating client scope {} in realm {}", scope.name, ctx.realm);
            let bare = ClientScope {
                protocol_mappers: None,
                ..(*scope).clone()
            };
            ctx.admin
                .create_client_scope(ctx.realm, &bare)
                .await
                .map_err(ctx.admin_err(Category::ClientScope, &scope.name))?;
            summary.created += 1;
            summary += reconcile_mappers(ctx, scope, &[]).await?;
        }

        for (scope, _) in &plan.update {
            info!("Updating client scope {} in realm {}", scope.name, ctx.realm);
            ctx.admin
                .update_client_scope(ctx.realm, scope)
                .await
                .map_err(ctx.admin_err(Category::ClientScope, &scope.name))?;
            summary.updated += 1;
        }

        for (scope, existing) in plan.matched() {
            let held = existing.protocol_mappers.as_deref().unwrap_or_default();
            summary += reconcile_mappers(ctx, scope, held).await?;
        }

        if ctx.policy(Category::ClientScope).allows_delete() {
            for scope in &plan.delete {
                info!("Deleting client scope {} from realm {}", scope.name, ctx.realm);
                ctx.admin
                    .delete_client_scope(ctx.realm, &scope.name)
                    .await
                    .map_err(ctx.admin_err(Category::ClientScope, &scope.name))?;
                summary.deleted += 1;
            }
        }

        Ok(summary)
    }
}

async fn reconcile_mappers(
    ctx: &RealmContext<'_>,
    scope: &ClientScope,
    actual: &[ProtocolMapper],
) -> Result<ChangeSummary> {
    let Some(wanted) = scope.protocol_mappers.as_deref() else {
        return Ok(ChangeSummary::default());
    };
    let policy = ctx.policy(Category::ProtocolMapper);
    if !policy.is_managed() {
        return Ok(ChangeSummary::default());
    }

    let plan = diff::plan(wanted, actual);
    let mut summary = ChangeSummary {
        skipped: plan.skip.len(),
        ..Default::default()
    };
    let entity = |mapper: &ProtocolMapper| format!("{}/{}", scope.name, mapper.name);

    for mapper in &plan.create {
        info!(
            "Creating protocol mapper {} in client scope {} of realm {}",
            mapper.name, scope.name, ctx.realm
        );
        ctx.admin
            .create_protocol_mapper(ctx.realm, &scope.name, mapper)
            .await
            .map_err(ctx.admin_err(Category::ProtocolMapper, entity(mapper)))?;
        summary.created += 1;
    }

    for (mapper, _) in &plan.update {
        info!(
            "Updating protocol mapper {} in client scope {} of realm {}",
            mapper.name, scope.name, ctx.realm
        );
        ctx.admin
            .update_protocol_mapper(ctx.realm, &scope.name, mapper)
            .await
            .map_err(ctx.admin_err(Category::ProtocolMapper, entity(mapper)))?;
        summary.updated += 1;
    }

    if policy.allows_delete() {
        for mapper in &plan.delete {
            info!(
                "Deleting protocol mapper {} from client scope {} of realm {}",
                mapper.name, scope.name, ctx.realm
            );
            ctx.admin
                .delete_protocol_mapper(ctx.realm, &scope.name, &mapper.name)
                .await
                .map_err(ctx.admin_err(Category::ProtocolMapper, entity(mapper)))?;
            summary.deleted += 1;
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::RealmAdmin;
    use crate::config::ImportConfig;
    use crate::policy::ManagedPolicy;
    use crate::reconciler::testing::{default_config, make_admin, make_desired, run, REALM};
    use serde_json::json;

    fn make_scopes() -> DesiredRealm {
        make_desired(json!({
            "realm": REALM,
            "clientScopes": [{
                "name": "profile",
                "protocol": "openid-connect",
                "protocolMappers": [{
                    "name": "email",
                    "protocolMapper": "oidc-usermodel-property-mapper",
                    "config": {"claim.name": "email", "user.attribute": "email"}
                }]
            }]
        }))
    }

    #[tokio::test]
    async fn test_creates_scope_with_mappers_then_noop() {
        let admin = make_admin().await;
        let config = default_config();
        let desired = make_scopes();

        let first = run(&ClientScopeReconciler, &admin, &config, &desired).await.unwrap();
        assert_eq!(first.created, 2);

        admin.clear_write_log().await;
        let second = run(&ClientScopeReconciler, &admin, &config, &desired).await.unwrap();
        assert!(second.is_noop());
        assert_eq!(admin.writes().await, 0);
    }

    #[tokio::test]
    async fn test_mapper_config_change_updates_only_mapper() {
        let admin = make_admin().await;
        let config = default_config();
        run(&ClientScopeReconciler, &admin, &config, &make_scopes()).await.unwrap();
        admin.clear_write_log().await;

        let mut desired = make_scopes();
        let scopes = desired.client_scopes.as_mut().unwrap();
        scopes[0].protocol_mappers.as_mut().unwrap()[0]
            .config
            .insert("claim.name".into(), "mail".into());
        run(&ClientScopeReconciler, &admin, &config, &desired).await.unwrap();

        assert_eq!(
            admin.write_log().await,
            vec!["update_protocol_mapper profile/email"]
        );
    }

    #[tokio::test]
    async fn test_no_delete_keeps_extra_scope() {
        let admin = make_admin().await;
        admin
            .create_client_scope(REALM, &ClientScope {
                name: "legacy".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut config = ImportConfig::default();
        config.managed.insert(Category::ClientScope, ManagedPolicy::NoDelete);
        run(&ClientScopeReconciler, &admin, &config, &make_scopes()).await.unwrap();
        run(&ClientScopeReconciler, &admin, &config, &make_scopes()).await.unwrap();
        let names: Vec<String> = admin
            .list_client_scopes(REALM)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["legacy", "profile"]);

        let full = default_config();
        let summary = run(&ClientScopeReconciler, &admin, &full, &make_scopes()).await.unwrap();
        assert_eq!(summary.deleted, 1);
        let again = run(&ClientScopeReconciler, &admin, &full, &make_scopes()).await.unwrap();
        assert!(again.is_noop());
    }
}
