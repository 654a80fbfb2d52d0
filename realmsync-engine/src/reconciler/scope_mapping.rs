//! Scope mapping reconcilers.
//!
//! Two independent spaces: realm-role grants (`scopeMappings`) and client-role
//! grants keyed by the client owning the roles (`clientScopeMappings`). Each
//! grant is keyed by its grantee and its role set is diffed member-wise.
//! Every reference is checked before the first write, so a missing client,
//! client scope or role leaves the space untouched.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::info;

use super::{RealmContext, Reconciler};
use crate::diff::{self, ChangeSummary};
use crate::error::{ReconcileError, Result};
use crate::model::{DesiredRealm, Grantee, MappingSpace, RoleScope, ScopeMapping};
use crate::policy::Category;

/// Names that already exist on the server, used to validate references.
struct Known {
    clients: BTreeSet<String>,
    client_scopes: BTreeSet<String>,
}

impl Known {
    async fn load(ctx: &RealmContext<'_>, category: Category) -> Result<Self> {
        let err = || ctx.admin_err(category, ctx.realm);
        let clients = ctx
            .admin
            .list_clients(ctx.realm)
            .await
            .map_err(err())?
            .into_iter()
            .map(|c| c.client_id)
            .collect();
        let client_scopes = ctx
            .admin
            .list_client_scopes(ctx.realm)
            .await
            .map_err(err())?
            .into_iter()
            .map(|s| s.name)
            .collect();
        Ok(Self {
            clients,
            client_scopes,
        })
    }

    fn grantee_exists(&self, grantee: &Grantee) -> bool {
        match grantee {
            Grantee::Client(name) => self.clients.contains(name),
            Grantee::ClientScope(name) => self.client_scopes.contains(name),
        }
    }
}

fn describe(grantee: &Grantee) -> String {
    match grantee {
        Grantee::Client(name) => format!("client '{}'", name),
        Grantee::ClientScope(name) => format!("client scope '{}'", name),
    }
}

fn scope_of(space: &MappingSpace) -> RoleScope {
    match space {
        MappingSpace::RealmRoles => RoleScope::Realm,
        MappingSpace::ClientRoles(client_id) => RoleScope::Client(client_id.clone()),
    }
}

/// A grantee whose whole role set goes away once every space has been granted.
struct Revocation {
    space: MappingSpace,
    grantee: Grantee,
    roles: Vec<String>,
}

async fn revoke_all(
    ctx: &RealmContext<'_>,
    category: Category,
    revocations: Vec<Revocation>,
) -> Result<usize> {
    let count = revocations.len();
    for revocation in revocations {
        info!(
            "Revoking all {} roles from {} in realm {}",
            scope_of(&revocation.space),
            revocation.grantee,
            ctx.realm
        );
        ctx.admin
            .remove_scope_mapping_roles(
                ctx.realm,
                &revocation.space,
                &revocation.grantee,
                &revocation.roles,
            )
            .await
            .map_err(ctx.admin_err(category, &revocation.grantee))?;
    }
    Ok(count)
}

/// Grants and narrows one space. Grantees absent from `wanted` are returned
/// for the caller to revoke after all spaces are done.
async fn reconcile_space(
    ctx: &RealmContext<'_>,
    category: Category,
    known: &Known,
    space: &MappingSpace,
    wanted: &[ScopeMapping],
) -> Result<(ChangeSummary, Vec<Revocation>)> {
    // Grantees and roles must all resolve before anything is written.
    let role_scope = scope_of(space);
    let roles: BTreeSet<String> = ctx
        .admin
        .list_roles(ctx.realm, &role_scope)
        .await
        .map_err(ctx.admin_err(category, &role_scope))?
        .into_iter()
        .map(|r| r.name)
        .collect();

    let mut desired: Vec<(Grantee, &ScopeMapping)> = Vec::with_capacity(wanted.len());
    for mapping in wanted {
        let grantee = mapping.grantee().ok_or_else(|| ReconcileError::Validation {
            source_id: ctx.realm.to_string(),
            message: format!(
                "{} entry must name exactly one of client or clientScope",
                category
            ),
        })?;
        if !known.grantee_exists(&grantee) {
            return Err(ctx.unresolved(category, &grantee, describe(&grantee)));
        }
        if let Some(role) = mapping.roles.iter().find(|r| !roles.contains(*r)) {
            return Err(ctx.unresolved(
                category,
                &grantee,
                format!("{} role '{}'", role_scope, role),
            ));
        }
        desired.push((grantee, mapping));
    }

    let actual = ctx
        .admin
        .list_scope_mappings(ctx.realm, space)
        .await
        .map_err(ctx.admin_err(category, &role_scope))?;
    let actual: Vec<(Grantee, &ScopeMapping)> = actual
        .iter()
        .filter_map(|m| m.grantee().map(|g| (g, m)))
        .collect();

    let plan = diff::plan_by(
        &desired,
        &actual,
        |(grantee, _)| grantee.clone(),
        |(_, d), (_, a)| diff::set_changes(&d.roles, &a.roles) == (Vec::new(), Vec::new()),
    );
    let allow_delete = ctx.policy(category).allows_delete();
    let mut summary = ChangeSummary {
        skipped: plan.skip.len(),
        ..Default::default()
    };

    for (grantee, mapping) in &plan.create {
        let (add, _) = diff::set_changes(&mapping.roles, &[]);
        if add.is_empty() {
            continue;
        }
        info!(
            "Granting {} roles {:?} to {} in realm {}",
            role_scope, add, grantee, ctx.realm
        );
        ctx.admin
            .add_scope_mapping_roles(ctx.realm, space, grantee, &add)
            .await
            .map_err(ctx.admin_err(category, grantee))?;
        summary.created += 1;
    }

    for ((grantee, mapping), (_, held)) in &plan.update {
        let (add, remove) = diff::set_changes(&mapping.roles, &held.roles);
        let mut changed = false;
        if !add.is_empty() {
            info!(
                "Granting {} roles {:?} to {} in realm {}",
                role_scope, add, grantee, ctx.realm
            );
            ctx.admin
                .add_scope_mapping_roles(ctx.realm, space, grantee, &add)
                .await
                .map_err(ctx.admin_err(category, grantee))?;
            changed = true;
        }
        if !remove.is_empty() && allow_delete {
            info!(
                "Revoking {} roles {:?} from {} in realm {}",
                role_scope, remove, grantee, ctx.realm
            );
            ctx.admin
                .remove_scope_mapping_roles(ctx.realm, space, grantee, &remove)
                .await
                .map_err(ctx.admin_err(category, grantee))?;
            changed = true;
        }
        if changed {
            summary.updated += 1;
        } else {
            summary.skipped += 1;
        }
    }

    let revocations = if allow_delete {
        plan.delete
            .iter()
            .map(|(grantee, held)| Revocation {
                space: space.clone(),
                grantee: grantee.clone(),
                roles: held.roles.clone(),
            })
            .collect()
    } else {
        Vec::new()
    };

    Ok((summary, revocations))
}

pub struct ScopeMappingReconciler;

#[async_trait]
impl Reconciler for ScopeMappingReconciler {
    fn category(&self) -> Category {
        Category::ScopeMapping
    }

    async fn reconcile(
        &self,
        ctx: &RealmContext<'_>,
        desired: &DesiredRealm,
    ) -> Result<ChangeSummary> {
        let Some(wanted) = desired.scope_mappings.as_deref() else {
            return Ok(ChangeSummary::default());
        };
        let known = Known::load(ctx, Category::ScopeMapping).await?;
        let (mut summary, revocations) = reconcile_space(
            ctx,
            Category::ScopeMapping,
            &known,
            &MappingSpace::RealmRoles,
            wanted,
        )
        .await?;
        summary.deleted += revoke_all(ctx, Category::ScopeMapping, revocations).await?;
        Ok(summary)
    }
}

pub struct ClientScopeMappingReconciler;

#[async_trait]
impl Reconciler for ClientScopeMappingReconciler {
    fn category(&self) -> Category {
        Category::ClientScopeMapping
    }

    async fn reconcile(
        &self,
        ctx: &RealmContext<'_>,
        desired: &DesiredRealm,
    ) -> Result<ChangeSummary> {
        let Some(by_client) = &desired.client_scope_mappings else {
            return Ok(ChangeSummary::default());
        };
        let known = Known::load(ctx, Category::ClientScopeMapping).await?;
        if let Some(owner) = by_client.keys().find(|c| !known.clients.contains(*c)) {
            return Err(ctx.unresolved(
                Category::ClientScopeMapping,
                format!("roles of client '{}'", owner),
                format!("client '{}'", owner),
            ));
        }

        let mut summary = ChangeSummary::default();
        let mut revocations = Vec::new();
        for (client_id, wanted) in by_client {
            let space = MappingSpace::ClientRoles(client_id.clone());
            let (changes, pending) =
                reconcile_space(ctx, Category::ClientScopeMapping, &known, &space, wanted).await?;
            summary += changes;
            revocations.extend(pending);
        }

        // Clients dropped from the document lose every grant of their roles.
        if ctx.policy(Category::ClientScopeMapping).allows_delete() {
            for client_id in known.clients.iter().filter(|c| !by_client.contains_key(*c)) {
                let space = MappingSpace::ClientRoles(client_id.clone());
                let held = ctx
                    .admin
                    .list_scope_mappings(ctx.realm, &space)
                    .await
                    .map_err(ctx.admin_err(Category::ClientScopeMapping, client_id))?;
                revocations.extend(held.into_iter().filter_map(|mapping| {
                    mapping.grantee().map(|grantee| Revocation {
                        space: space.clone(),
                        grantee,
                        roles: mapping.roles,
                    })
                }));
            }
        }

        summary.deleted += revoke_all(ctx, Category::ClientScopeMapping, revocations).await?;
        Ok(summary)
    }
}
