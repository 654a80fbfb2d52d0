//! Authentication flow and authenticator config reconcilers.
//!
//! Authenticator configs are not listed on their own: they are bound to the
//! executions that reference them by alias, in any flow of the document
//! (built-in and nested flows included).

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tracing::{info, warn};

use super::{RealmContext, Reconciler};
use crate::diff::{self, ChangeSummary, Resource};
use crate::error::Result;
use crate::model::{AuthenticationFlow, AuthenticatorConfig, DesiredRealm, ExecutionConfig};
use crate::policy::Category;

impl Resource for AuthenticationFlow {
    type Key = String;

    fn key(&self) -> String {
        self.alias.clone()
    }

    fn same_as(&self, actual: &Self) -> bool {
        self.description == actual.description
            && self.provider_id == actual.provider_id
            && self.top_level == actual.top_level
            && self.authentication_executions == actual.authentication_executions
    }
}

impl Resource for ExecutionConfig {
    /// `flow/execution/alias`
    type Key = String;

    fn key(&self) -> String {
        format!("{}/{}/{}", self.flow_alias, self.execution, self.config.alias)
    }

    fn same_as(&self, actual: &Self) -> bool {
        self.config.config == actual.config.config
    }
}

pub struct FlowReconciler;

#[async_trait]
impl Reconciler for FlowReconciler {
    fn category(&self) -> Category {
        Category::AuthenticationFlow
    }

    async fn reconcile(
        &self,
        ctx: &RealmContext<'_>,
        desired: &DesiredRealm,
    ) -> Result<ChangeSummary> {
        let Some(wanted) = desired.authentication_flows.as_deref() else {
            return Ok(ChangeSummary::default());
        };
        let actual = ctx
            .admin
            .list_flows(ctx.realm)
            .await
            .map_err(ctx.admin_err(Category::AuthenticationFlow, ctx.realm))?;
        let plan = diff::plan(wanted, &actual);
        let mut summary = ChangeSummary {
            skipped: plan.skip.len(),
            ..Default::default()
        };

        for flow in &plan.create {
            info!("Creating authentication flow {} in realm {}", flow.alias, ctx.realm);
            ctx.admin
                .create_flow(ctx.realm, flow)
                .await
                .map_err(ctx.admin_err(Category::AuthenticationFlow, &flow.alias))?;
            summary.created += 1;
        }

        for (flow, existing) in &plan.update {
            info!("Updating authentication flow {} in realm {}", flow.alias, ctx.realm);
            // The built-in marker belongs to the server.
            let update = AuthenticationFlow {
                built_in: existing.built_in,
                ..(*flow).clone()
            };
            ctx.admin
                .update_flow(ctx.realm, &update)
                .await
                .map_err(ctx.admin_err(Category::AuthenticationFlow, &flow.alias))?;
            summary.updated += 1;
        }

        if ctx.policy(Category::AuthenticationFlow).allows_delete() {
            for flow in plan.delete.iter().filter(|f| !f.built_in) {
                info!("Deleting authentication flow {} from realm {}", flow.alias, ctx.realm);
                ctx.admin
                    .delete_flow(ctx.realm, &flow.alias)
                    .await
                    .map_err(ctx.admin_err(Category::AuthenticationFlow, &flow.alias))?;
                summary.deleted += 1;
            }
        }

        Ok(summary)
    }
}

/// Bind every config reference in `flows` to its definition.
fn bind_configs(
    ctx: &RealmContext<'_>,
    flows: &[AuthenticationFlow],
    configs: &[AuthenticatorConfig],
) -> Result<Vec<ExecutionConfig>> {
    let by_alias: BTreeMap<&str, &AuthenticatorConfig> =
        configs.iter().map(|c| (c.alias.as_str(), c)).collect();

    let mut bound = Vec::new();
    for flow in diff::dedup_last_wins(flows, AuthenticationFlow::key) {
        for execution in &flow.authentication_executions {
            let Some(alias) = execution.authenticator_config.as_deref() else {
                continue;
            };
            let Some(config) = by_alias.get(alias) else {
                return Err(ctx.unresolved(
                    Category::AuthenticatorConfig,
                    format!("{}/{}", flow.alias, execution.provider()),
                    format!("authenticator config '{}'", alias),
                ));
            };
            bound.push(ExecutionConfig {
                flow_alias: flow.alias.clone(),
                execution: execution.provider().to_string(),
                config: (*config).clone(),
            });
        }
    }
    Ok(bound)
}

pub struct AuthenticatorConfigReconciler;

#[async_trait]
impl Reconciler for AuthenticatorConfigReconciler {
    fn category(&self) -> Category {
        Category::AuthenticatorConfig
    }

    async fn reconcile(
        &self,
        ctx: &RealmContext<'_>,
        desired: &DesiredRealm,
    ) -> Result<ChangeSummary> {
        let Some(flows) = desired.authentication_flows.as_deref() else {
            if desired.authenticator_config.is_some() {
                warn!(
                    "Realm {} declares authenticator configs without flows; ignoring them",
                    ctx.realm
                );
            }
            return Ok(ChangeSummary::default());
        };
        let configs = desired.authenticator_config.as_deref().unwrap_or_default();
        let wanted = bind_configs(ctx, flows, configs)?;

        let declared: BTreeSet<&str> = flows.iter().map(|f| f.alias.as_str()).collect();
        let actual: Vec<ExecutionConfig> = ctx
            .admin
            .list_authenticator_configs(ctx.realm)
            .await
            .map_err(ctx.admin_err(Category::AuthenticatorConfig, ctx.realm))?
            .into_iter()
            .filter(|c| declared.contains(c.flow_alias.as_str()))
            .collect();

        let plan = diff::plan(&wanted, &actual);
        let mut summary = ChangeSummary {
            skipped: plan.skip.len(),
            ..Default::default()
        };

        for config in &plan.create {
            info!("Creating authenticator config {} in realm {}", config.key(), ctx.realm);
            ctx.admin
                .create_authenticator_config(ctx.realm, config)
                .await
                .map_err(ctx.admin_err(Category::AuthenticatorConfig, config.key()))?;
            summary.created += 1;
        }

        for (config, _) in &plan.update {
            info!("Updating authenticator config {} in realm {}", config.key(), ctx.realm);
            ctx.admin
                .update_authenticator_config(ctx.realm, config)
                .await
                .map_err(ctx.admin_err(Category::AuthenticatorConfig, config.key()))?;
            summary.updated += 1;
        }

        if ctx.policy(Category::AuthenticatorConfig).allows_delete() {
            for config in &plan.delete {
                info!("Deleting authenticator config {} from realm {}", config.key(), ctx.realm);
                ctx.admin
                    .delete_authenticator_config(ctx.realm, config)
                    .await
                    .map_err(ctx.admin_err(Category::AuthenticatorConfig, config.key()))?;
                summary.deleted += 1;
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::RealmAdmin;
    use crate::error::ReconcileError;
    use crate::reconciler::testing::{default_config, make_admin, make_desired, run, REALM};
    use serde_json::json;

    fn make_flows(otp_length: &str) -> DesiredRealm {
        make_desired(json!({
            "realm": REALM,
            "authenticationFlows": [
                {
                    "alias": "browser",
                    "builtIn": true,
                    "authenticationExecutions": [
                        {
                            "authenticator": "auth-cookie",
                            "requirement": "ALTERNATIVE",
                            "priority": 10
                        },
                        {
                            "authenticatorFlow": true,
                            "flowAlias": "browser forms",
                            "requirement": "ALTERNATIVE",
                            "priority": 20
                        }
                    ]
                },
                {
                    "alias": "browser forms",
                    "topLevel": false,
                    "authenticationExecutions": [
                        {
                            "authenticator": "auth-otp-form",
                            "authenticatorConfig": "otp",
                            "requirement": "REQUIRED"
                        }
                    ]
                }
            ],
            "authenticatorConfig": [{"alias": "otp", "config": {"length": otp_length}}]
        }))
    }

    async fn apply(admin: &dyn RealmAdmin, desired: &DesiredRealm) -> Result<ChangeSummary> {
        let config = default_config();
        run(&FlowReconciler, admin, &config, desired).await?;
        run(&AuthenticatorConfigReconciler, admin, &config, desired).await
    }

    #[tokio::test]
    async fn test_config_in_nested_flow_converges() {
        let admin = make_admin().await;
        let summary = apply(&admin, &make_flows("6")).await.unwrap();
        assert_eq!(summary.created, 1);
        let stored = admin.list_authenticator_configs(REALM).await.unwrap();
        assert_eq!(stored[0].flow_alias, "browser forms");
        assert_eq!(stored[0].execution, "auth-otp-form");

        admin.clear_write_log().await;
        apply(&admin, &make_flows("6")).await.unwrap();
        assert_eq!(admin.writes().await, 0);

        let summary = apply(&admin, &make_flows("8")).await.unwrap();
        assert_eq!(summary.updated, 1);
    }

    #[tokio::test]
    async fn test_unknown_config_alias_is_fatal() {
        let admin = make_admin().await;
        let mut desired = make_flows("6");
        desired.authenticator_config = Some(vec![]);
        let err = apply(&admin, &desired).await.unwrap_err();
        match err {
            ReconcileError::UnresolvedReference { entity, missing, .. } => {
                assert_eq!(entity, "browser forms/auth-otp-form");
                assert_eq!(missing, "authenticator config 'otp'");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_built_in_flows_are_never_deleted() {
        let admin = make_admin().await;
        admin
            .create_flow(REALM, &AuthenticationFlow {
                alias: "direct grant".into(),
                built_in: true,
                top_level: true,
                provider_id: "basic-flow".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        admin
            .create_flow(REALM, &AuthenticationFlow {
                alias: "custom".into(),
                top_level: true,
                provider_id: "basic-flow".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let summary = run(&FlowReconciler, &admin, &default_config(), &make_flows("6"))
            .await
            .unwrap();
        assert_eq!(summary.deleted, 1);
        let aliases: Vec<String> = admin
            .list_flows(REALM)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.alias)
            .collect();
        assert!(aliases.contains(&"direct grant".to_string()));
        assert!(!aliases.contains(&"custom".to_string()));
    }
}
