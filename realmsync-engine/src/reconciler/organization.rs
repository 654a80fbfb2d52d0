//! Organization reconciler.
//!
//! Organizations are matched by alias. Linked identity providers and members
//! are diffed as sets once the organization itself converged; members are
//! declared by username and resolved to user ids first. Every reference is
//! checked before the first write.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tracing::{info, warn};

use super::{RealmContext, Reconciler};
use crate::diff::{self, ChangeSummary, Resource};
use crate::error::Result;
use crate::model::{DesiredRealm, Organization};
use crate::policy::Category;

impl Resource for Organization {
    type Key = String;

    fn key(&self) -> String {
        self.alias.clone()
    }

    fn same_as(&self, actual: &Self) -> bool {
        self.shallow() == actual.shallow()
    }
}

pub struct OrganizationReconciler;

impl OrganizationReconciler {
    /// Resolve member usernames to user ids, failing on the first unknown user.
    async fn resolve_members(
        ctx: &RealmContext<'_>,
        wanted: &[Organization],
    ) -> Result<BTreeMap<String, String>> {
        let mut ids = BTreeMap::new();
        for org in wanted {
            for username in org.members.iter().flatten() {
                if ids.contains_key(username) {
                    continue;
                }
                let id = ctx
                    .admin
                    .find_user_id(ctx.realm, username)
                    .await
                    .map_err(ctx.admin_err(Category::Organization, &org.alias))?
                    .ok_or_else(|| {
                        ctx.unresolved(
                            Category::Organization,
                            &org.alias,
                            format!("user '{}'", username),
                        )
                    })?;
                ids.insert(username.clone(), id);
            }
        }
        Ok(ids)
    }

    async fn check_identity_providers(
        ctx: &RealmContext<'_>,
        wanted: &[Organization],
    ) -> Result<()> {
        if wanted.iter().all(|o| o.identity_providers.is_none()) {
            return Ok(());
        }
        let known: BTreeSet<String> = ctx
            .admin
            .list_identity_providers(ctx.realm)
            .await
            .map_err(ctx.admin_err(Category::Organization, ctx.realm))?
            .into_iter()
            .map(|idp| idp.alias)
            .collect();
        for org in wanted {
            let mut aliases = org.identity_providers.iter().flatten();
            if let Some(alias) = aliases.find(|a| !known.contains(*a)) {
                return Err(ctx.unresolved(
                    Category::Organization,
                    &org.alias,
                    format!("identity provider '{}'", alias),
                ));
            }
        }
        Ok(())
    }

    async fn reconcile_links(
        ctx: &RealmContext<'_>,
        org: &Organization,
        members: &BTreeMap<String, String>,
        allow_delete: bool,
    ) -> Result<ChangeSummary> {
        let err = || ctx.admin_err(Category::Organization, &org.alias);
        let mut summary = ChangeSummary::default();

        if let Some(wanted) = &org.identity_providers {
            let actual = ctx
                .admin
                .list_organization_identity_providers(ctx.realm, &org.alias)
                .await
                .map_err(err())?;
            let (link, unlink) = diff::set_changes(wanted, &actual);
            for alias in &link {
                info!("Linking identity provider {} to organization {}", alias, org.alias);
                ctx.admin
                    .link_organization_identity_provider(ctx.realm, &org.alias, alias)
                    .await
                    .map_err(err())?;
                summary.created += 1;
            }
            if allow_delete {
                for alias in &unlink {
                    info!("Unlinking identity provider {} from organization {}", alias, org.alias);
                    ctx.admin
                        .unlink_organization_identity_provider(ctx.realm, &org.alias, alias)
                        .await
                        .map_err(err())?;
                    summary.deleted += 1;
                }
            }
        }

        if let Some(usernames) = &org.members {
            let wanted: Vec<String> = usernames
                .iter()
                .filter_map(|u| members.get(u).cloned())
                .collect();
            let actual = ctx
                .admin
                .list_organization_members(ctx.realm, &org.alias)
                .await
                .map_err(err())?;
            let (add, remove) = diff::set_changes(&wanted, &actual);
            for user_id in &add {
                info!("Adding member {} to organization {}", user_id, org.alias);
                ctx.admin
                    .add_organization_member(ctx.realm, &org.alias, user_id)
                    .await
                    .map_err(err())?;
                summary.created += 1;
            }
            if allow_delete {
                for user_id in &remove {
                    info!("Removing member {} from organization {}", user_id, org.alias);
                    ctx.admin
                        .remove_organization_member(ctx.realm, &org.alias, user_id)
                        .await
                        .map_err(err())?;
                    summary.deleted += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn apply(ctx: &RealmContext<'_>, wanted: &[Organization]) -> Result<ChangeSummary> {
        let actual = ctx
            .admin
            .list_organizations(ctx.realm)
            .await
            .map_err(ctx.admin_err(Category::Organization, ctx.realm))?;
        Self::check_identity_providers(ctx, wanted).await?;
        let members = Self::resolve_members(ctx, wanted).await?;

        let allow_delete = ctx.policy(Category::Organization).allows_delete();
        let plan = diff::plan(wanted, &actual);
        let mut summary = ChangeSummary {
            skipped: plan.skip.len(),
            ..Default::default()
        };

        for org in &plan.create {
            info!("Creating organization {} in realm {}", org.alias, ctx.realm);
            ctx.admin
                .create_organization(ctx.realm, &org.shallow())
                .await
                .map_err(ctx.admin_err(Category::Organization, &org.alias))?;
            summary.created += 1;
        }

        for (org, _) in &plan.update {
            info!("Updating organization {} in realm {}", org.alias, ctx.realm);
            ctx.admin
                .update_organization(ctx.realm, &org.shallow())
                .await
                .map_err(ctx.admin_err(Category::Organization, &org.alias))?;
            summary.updated += 1;
        }

        if allow_delete {
            for org in &plan.delete {
                info!("Deleting organization {} from realm {}", org.alias, ctx.realm);
                ctx.admin
                    .delete_organization(ctx.realm, &org.alias)
                    .await
                    .map_err(ctx.admin_err(Category::Organization, &org.alias))?;
                summary.deleted += 1;
            }
        }

        let converged = plan.create.iter().copied().chain(plan.matched().map(|(d, _)| d));
        for org in converged {
            summary += Self::reconcile_links(ctx, org, &members, allow_delete).await?;
        }

        Ok(summary)
    }
}

#[async_trait]
impl Reconciler for OrganizationReconciler {
    fn category(&self) -> Category {
        Category::Organization
    }

    async fn reconcile(
        &self,
        ctx: &RealmContext<'_>,
        desired: &DesiredRealm,
    ) -> Result<ChangeSummary> {
        let Some(wanted) = desired.organizations.as_deref() else {
            return Ok(ChangeSummary::default());
        };
        match Self::apply(ctx, wanted).await {
            Err(e) if e.is_unsupported() => {
                warn!(
                    "Organizations are not supported by the server, skipping realm {}",
                    ctx.realm
                );
                Ok(ChangeSummary::default())
            }
            result => result,
        }
    }
}
