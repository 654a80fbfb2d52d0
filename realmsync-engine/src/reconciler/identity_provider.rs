//! Identity provider and identity provider mapper reconcilers.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::info;

use super::{RealmContext, Reconciler};
use crate::diff::{self, ChangeSummary, Resource};
use crate::error::Result;
use crate::model::{DesiredRealm, IdentityProvider, IdentityProviderMapper};
use crate::policy::Category;

impl Resource for IdentityProvider {
    type Key = String;

    fn key(&self) -> String {
        self.alias.clone()
    }

    fn same_as(&self, actual: &Self) -> bool {
        self == actual
    }
}

impl Resource for IdentityProviderMapper {
    /// `alias/name`
    type Key = String;

    fn key(&self) -> String {
        format!("{}/{}", self.identity_provider_alias, self.name)
    }

    fn same_as(&self, actual: &Self) -> bool {
        self == actual
    }
}

pub struct IdentityProviderReconciler;

#[async_trait]
impl Reconciler for IdentityProviderReconciler {
    fn category(&self) -> Category {
        Category::IdentityProvider
    }

    async fn reconcile(
        &self,
        ctx: &RealmContext<'_>,
        desired: &DesiredRealm,
    ) -> Result<ChangeSummary> {
        let Some(wanted) = desired.identity_providers.as_deref() else {
            return Ok(ChangeSummary::default());
        };
        let actual = ctx
            .admin
            .list_identity_providers(ctx.realm)
            .await
            .map_err(ctx.admin_err(Category::IdentityProvider, ctx.realm))?;
        let plan = diff::plan(wanted, &actual);
        let mut summary = ChangeSummary {
            skipped: plan.skip.len(),
            ..Default::default()
        };

        for idp in &plan.create {
            info!("Creating identity provider {} in realm {}", idp.alias, ctx.realm);
            ctx.admin
                .create_identity_provider(ctx.realm, idp)
                .await
                .map_err(ctx.admin_err(Category::IdentityProvider, &idp.alias))?;
            summary.created += 1;
        }

        for (idp, _) in &plan.update {
            info!("Updating identity provider {} in realm {}", idp.alias, ctx.realm);
            ctx.admin
                .update_identity_provider(ctx.realm, idp)
                .await
                .map_err(ctx.admin_err(Category::IdentityProvider, &idp.alias))?;
            summary.updated += 1;
        }

        if ctx.policy(Category::IdentityProvider).allows_delete() {
            for idp in &plan.delete {
                info!("Deleting identity provider {} from realm {}", idp.alias, ctx.realm);
                ctx.admin
                    .delete_identity_provider(ctx.realm, &idp.alias)
                    .await
                    .map_err(ctx.admin_err(Category::IdentityProvider, &idp.alias))?;
                summary.deleted += 1;
            }
        }

        Ok(summary)
    }
}

pub struct IdentityProviderMapperReconciler;

#[async_trait]
impl Reconciler for IdentityProviderMapperReconciler {
    fn category(&self) -> Category {
        Category::IdentityProviderMapper
    }

    async fn reconcile(
        &self,
        ctx: &RealmContext<'_>,
        desired: &DesiredRealm,
    ) -> Result<ChangeSummary> {
        let Some(wanted) = desired.identity_provider_mappers.as_deref() else {
            return Ok(ChangeSummary::default());
        };
        let err = || ctx.admin_err(Category::IdentityProviderMapper, ctx.realm);

        let providers: BTreeSet<String> = ctx
            .admin
            .list_identity_providers(ctx.realm)
            .await
            .map_err(err())?
            .into_iter()
            .map(|idp| idp.alias)
            .collect();
        if let Some(orphan) = wanted
            .iter()
            .find(|m| !providers.contains(&m.identity_provider_alias))
        {
            return Err(ctx.unresolved(
                Category::IdentityProviderMapper,
                orphan.key(),
                format!("identity provider '{}'", orphan.identity_provider_alias),
            ));
        }

        let actual = ctx
            .admin
            .list_identity_provider_mappers(ctx.realm)
            .await
            .map_err(err())?;
        let plan = diff::plan(wanted, &actual);
        let mut summary = ChangeSummary {
            skipped: plan.skip.len(),
            ..Default::default()
        };

        for mapper in &plan.create {
            info!("Creating identity provider mapper {} in realm {}", mapper.key(), ctx.realm);
            ctx.admin
                .create_identity_provider_mapper(ctx.realm, mapper)
                .await
                .map_err(ctx.admin_err(Category::IdentityProviderMapper, mapper.key()))?;
            summary.created += 1;
        }

        for (mapper, _) in &plan.update {
            info!("Updating identity provider mapper {} in realm {}", mapper.key(), ctx.realm);
            ctx.admin
                .update_identity_provider_mapper(ctx.realm, mapper)
                .await
                .map_err(ctx.admin_err(Category::IdentityProviderMapper, mapper.key()))?;
            summary.updated += 1;
        }

        if ctx.policy(Category::IdentityProviderMapper).allows_delete() {
            for mapper in &plan.delete {
                info!(
                    "Deleting identity provider mapper {} from realm {}",
                    mapper.key(),
                    ctx.realm
                );
                ctx.admin
                    .delete_identity_provider_mapper(
                        ctx.realm,
                        &mapper.identity_provider_alias,
                        &mapper.name,
                    )
                    .await
                    .map_err(ctx.admin_err(Category::IdentityProviderMapper, mapper.key()))?;
                summary.deleted += 1;
            }
        }

        Ok(summary)
    }
}
