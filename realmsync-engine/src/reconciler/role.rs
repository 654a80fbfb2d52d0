//! Role and composite-role reconcilers.
//!
//! Roles are matched by name within their scope (the realm, or one client).
//! Composite membership is a separate pass: it runs once every role of the
//! document exists and diffs member names as sets, independent of the role's
//! scalar fields.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{RealmContext, Reconciler};
use crate::diff::{self, ChangeSummary, Resource};
use crate::error::Result;
use crate::model::{DesiredRealm, Role, RoleComposites, RoleScope};
use crate::policy::Category;

impl Resource for Role {
    type Key = String;

    fn key(&self) -> String {
        self.name.clone()
    }

    fn same_as(&self, actual: &Self) -> bool {
        self.description == actual.description && self.attributes == actual.attributes
    }
}

async fn client_ids(ctx: &RealmContext<'_>, category: Category) -> Result<BTreeSet<String>> {
    Ok(ctx
        .admin
        .list_clients(ctx.realm)
        .await
        .map_err(ctx.admin_err(category, ctx.realm))?
        .into_iter()
        .map(|c| c.client_id)
        .collect())
}

// =============================================================================
// Roles
// =============================================================================

pub struct RoleReconciler;

#[async_trait]
impl Reconciler for RoleReconciler {
    fn category(&self) -> Category {
        Category::Role
    }

    async fn reconcile(
        &self,
        ctx: &RealmContext<'_>,
        desired: &DesiredRealm,
    ) -> Result<ChangeSummary> {
        let Some(roles) = &desired.roles else {
            return Ok(ChangeSummary::default());
        };
        let mut scopes: Vec<(RoleScope, &[Role])> = Vec::new();
        if let Some(realm_roles) = &roles.realm {
            scopes.push((RoleScope::Realm, realm_roles.as_slice()));
        }
        if let Some(client_roles) = &roles.client {
            let clients = client_ids(ctx, Category::Role).await?;
            if let Some(missing) = client_roles.keys().find(|c| !clients.contains(*c)) {
                return Err(ctx.unresolved(
                    Category::Role,
                    format!("roles of client '{}'", missing),
                    format!("client '{}'", missing),
                ));
            }
            for (client_id, wanted) in client_roles {
                scopes.push((RoleScope::Client(client_id.clone()), wanted.as_slice()));
            }
        }

        let mut summary = ChangeSummary::default();
        let mut stale: Vec<(RoleScope, String)> = Vec::new();
        for (scope, wanted) in &scopes {
            let (changes, leftover) = reconcile_scope(ctx, scope, wanted).await?;
            summary += changes;
            stale.extend(leftover.into_iter().map(|name| (scope.clone(), name)));
        }

        // Deletes wait until every scope has been created and updated.
        if ctx.policy(Category::Role).allows_delete() {
            for (scope, name) in stale {
                info!("Deleting {} role {} from realm {}", scope, name, ctx.realm);
                ctx.admin
                    .delete_role(ctx.realm, &scope, &name)
                    .await
                    .map_err(ctx.admin_err(Category::Role, format!("{}/{}", scope, name)))?;
                summary.deleted += 1;
            }
        }

        Ok(summary)
    }
}

/// Creates and updates one scope, returning the names of roles the document
/// no longer declares.
async fn reconcile_scope(
    ctx: &RealmContext<'_>,
    scope: &RoleScope,
    wanted: &[Role],
) -> Result<(ChangeSummary, Vec<String>)> {
    let actual = ctx
        .admin
        .list_roles(ctx.realm, scope)
        .await
        .map_err(ctx.admin_err(Category::Role, scope))?;
    let plan = diff::plan(wanted, &actual);
    let mut summary = ChangeSummary {
        skipped: plan.skip.len(),
        ..Default::default()
    };
    let entity = |role: &Role| format!("{}/{}", scope, role.name);

    for role in &plan.create {
        info!("Creating {} role {} in realm {}", scope, role.name, ctx.realm);
        let bare = Role {
            composites: None,
            ..(*role).clone()
        };
        ctx.admin
            .create_role(ctx.realm, scope, &bare)
            .await
            .map_err(ctx.admin_err(Category::Role, entity(role)))?;
        summary.created += 1;
    }

    for (role, _) in &plan.update {
        info!("Updating {} role {} in realm {}", scope, role.name, ctx.realm);
        ctx.admin
            .update_role(ctx.realm, scope, role)
            .await
            .map_err(ctx.admin_err(Category::Role, entity(role)))?;
        summary.updated += 1;
    }

    let leftover = plan.delete.iter().map(|role| role.name.clone()).collect();
    Ok((summary, leftover))
}

// =============================================================================
// Composite roles
// =============================================================================

/// Roles currently on the server, per scope.
struct RoleDirectory {
    clients: BTreeSet<String>,
    roles: BTreeMap<RoleScope, Vec<Role>>,
}

impl RoleDirectory {
    async fn load(ctx: &RealmContext<'_>, scopes: BTreeSet<RoleScope>) -> Result<Self> {
        let clients = client_ids(ctx, Category::CompositeRole).await?;
        let mut roles = BTreeMap::new();
        for scope in scopes {
            if let RoleScope::Client(client_id) = &scope {
                if !clients.contains(client_id) {
                    continue;
                }
            }
            let listed = ctx
                .admin
                .list_roles(ctx.realm, &scope)
                .await
                .map_err(ctx.admin_err(Category::CompositeRole, &scope))?;
            roles.insert(scope, listed);
        }
        Ok(Self { clients, roles })
    }

    fn role(&self, scope: &RoleScope, name: &str) -> Option<&Role> {
        self.roles.get(scope)?.iter().find(|r| r.name == name)
    }
}

fn member_count(members: &RoleComposites) -> usize {
    members.realm.as_ref().map_or(0, Vec::len)
        + members
            .client
            .as_ref()
            .map_or(0, |by_client| by_client.values().map(Vec::len).sum())
}

pub struct CompositeRoleReconciler;

#[async_trait]
impl Reconciler for CompositeRoleReconciler {
    fn category(&self) -> Category {
        Category::CompositeRole
    }

    async fn reconcile(
        &self,
        ctx: &RealmContext<'_>,
        desired: &DesiredRealm,
    ) -> Result<ChangeSummary> {
        let Some(roles) = &desired.roles else {
            return Ok(ChangeSummary::default());
        };

        let mut owners: Vec<(RoleScope, &Role)> = Vec::new();
        if let Some(realm_roles) = &roles.realm {
            for role in diff::dedup_last_wins(realm_roles, Role::key) {
                owners.push((RoleScope::Realm, role));
            }
        }
        if let Some(client_roles) = &roles.client {
            for (client_id, wanted) in client_roles {
                for role in diff::dedup_last_wins(wanted, Role::key) {
                    owners.push((RoleScope::Client(client_id.clone()), role));
                }
            }
        }
        owners.retain(|(_, role)| role.composites.is_some());
        if owners.is_empty() {
            return Ok(ChangeSummary::default());
        }

        let mut scopes = BTreeSet::from([RoleScope::Realm]);
        for (scope, role) in &owners {
            scopes.insert(scope.clone());
            if let Some(by_client) = role.composites.as_ref().and_then(|c| c.client.as_ref()) {
                scopes.extend(by_client.keys().cloned().map(RoleScope::Client));
            }
        }
        let directory = RoleDirectory::load(ctx, scopes).await?;
        let allow_remove = ctx.policy(Category::CompositeRole).allows_delete();

        let mut summary = ChangeSummary::default();
        let mut removals: Vec<(&RoleScope, &str, String, RoleComposites)> = Vec::new();
        for (scope, role) in &owners {
            let Some(wanted) = &role.composites else {
                continue;
            };
            let entity = format!("{}/{}", scope, role.name);
            let actual = directory.role(scope, &role.name).ok_or_else(|| {
                ctx.unresolved(
                    Category::CompositeRole,
                    &entity,
                    format!("{} role '{}'", scope, role.name),
                )
            })?;
            validate_members(ctx, &directory, &entity, wanted)?;

            let held = actual.composites.clone().unwrap_or_default();
            let (add, remove) = composite_changes(wanted, &held);

            if member_count(&add) > 0 {
                info!(
                    "Adding {} composite members to {} role {} in realm {}",
                    member_count(&add),
                    scope,
                    role.name,
                    ctx.realm
                );
                ctx.admin
                    .add_composites(ctx.realm, scope, &role.name, &add)
                    .await
                    .map_err(ctx.admin_err(Category::CompositeRole, &entity))?;
                summary.created += member_count(&add);
            }

            let removing = member_count(&remove) > 0 && allow_remove;
            if member_count(&add) == 0 && !removing {
                debug!("Composites of {} unchanged", entity);
                summary.skipped += 1;
            }
            if removing {
                removals.push((scope, role.name.as_str(), entity, remove));
            }
        }

        for (scope, name, entity, remove) in removals {
            info!(
                "Removing {} composite members from {} role {} in realm {}",
                member_count(&remove),
                scope,
                name,
                ctx.realm
            );
            ctx.admin
                .remove_composites(ctx.realm, scope, name, &remove)
                .await
                .map_err(ctx.admin_err(Category::CompositeRole, &entity))?;
            summary.deleted += member_count(&remove);
        }

        Ok(summary)
    }
}

fn validate_members(
    ctx: &RealmContext<'_>,
    directory: &RoleDirectory,
    entity: &str,
    wanted: &RoleComposites,
) -> Result<()> {
    for name in wanted.realm.iter().flatten() {
        if directory.role(&RoleScope::Realm, name).is_none() {
            return Err(ctx.unresolved(
                Category::CompositeRole,
                entity,
                format!("realm role '{}'", name),
            ));
        }
    }
    for (client_id, names) in wanted.client.iter().flatten() {
        if !directory.clients.contains(client_id) {
            return Err(ctx.unresolved(
                Category::CompositeRole,
                entity,
                format!("client '{}'", client_id),
            ));
        }
        let scope = RoleScope::Client(client_id.clone());
        if let Some(name) = names.iter().find(|n| directory.role(&scope, n).is_none()) {
            return Err(ctx.unresolved(
                Category::CompositeRole,
                entity,
                format!("role '{}' of client '{}'", name, client_id),
            ));
        }
    }
    Ok(())
}

/// Members to add and to remove. A side the document leaves out is untouched.
fn composite_changes(
    wanted: &RoleComposites,
    held: &RoleComposites,
) -> (RoleComposites, RoleComposites) {
    let mut add = RoleComposites::default();
    let mut remove = RoleComposites::default();

    if let Some(members) = &wanted.realm {
        let (a, r) = diff::set_changes(members, held.realm.as_deref().unwrap_or_default());
        add.realm = Some(a).filter(|v| !v.is_empty());
        remove.realm = Some(r).filter(|v| !v.is_empty());
    }

    if let Some(members) = &wanted.client {
        let empty = BTreeMap::new();
        let held_clients = held.client.as_ref().unwrap_or(&empty);
        let keys: BTreeSet<&String> = members.keys().chain(held_clients.keys()).collect();
        for client_id in keys {
            let (a, r) = diff::set_changes(
                members.get(client_id).map(Vec::as_slice).unwrap_or_default(),
                held_clients.get(client_id).map(Vec::as_slice).unwrap_or_default(),
            );
            if !a.is_empty() {
                add.client
                    .get_or_insert_with(BTreeMap::new)
                    .insert(client_id.clone(), a);
            }
            if !r.is_empty() {
                remove
                    .client
                    .get_or_insert_with(BTreeMap::new)
                    .insert(client_id.clone(), r);
            }
        }
    }

    (add, remove)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::RealmAdmin;
    use crate::error::ReconcileError;
    use crate::model::Client;
    use crate::reconciler::testing::{default_config, make_admin, make_desired, run, REALM};
    use serde_json::json;

    fn make_roles(composite_members: serde_json::Value) -> DesiredRealm {
        make_desired(json!({
            "realm": REALM,
            "roles": {
                "realm": [
                    {"name": "user"},
                    {"name": "auditor"},
                    {"name": "admin", "composites": {"realm": composite_members}}
                ]
            }
        }))
    }

    async fn apply(
        admin: &dyn RealmAdmin,
        desired: &DesiredRealm,
    ) -> (ChangeSummary, ChangeSummary) {
        let config = default_config();
        let roles = run(&RoleReconciler, admin, &config, desired).await.unwrap();
        let composites = run(&CompositeRoleReconciler, admin, &config, desired).await.unwrap();
        (roles, composites)
    }

    async fn held_composites(admin: &dyn RealmAdmin) -> Option<RoleComposites> {
        admin
            .list_roles(REALM, &RoleScope::Realm)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.name == "admin")
            .and_then(|r| r.composites)
    }

    #[tokio::test]
    async fn test_roles_and_composites_converge() {
        let admin = make_admin().await;
        let (roles, composites) = apply(&admin, &make_roles(json!(["user", "auditor"]))).await;
        assert_eq!(roles.created, 3);
        assert_eq!(composites.created, 2);

        admin.clear_write_log().await;
        let (roles, composites) = apply(&admin, &make_roles(json!(["user", "auditor"]))).await;
        assert!(roles.is_noop());
        assert!(composites.is_noop());
        assert_eq!(admin.writes().await, 0);
    }

    #[tokio::test]
    async fn test_removing_all_members_differs_from_none() {
        let admin = make_admin().await;
        apply(&admin, &make_roles(json!([]))).await;
        // Declared empty but never composite: no call was made.
        assert_eq!(held_composites(&admin).await, None);

        apply(&admin, &make_roles(json!(["user"]))).await;
        let (_, composites) = apply(&admin, &make_roles(json!([]))).await;
        assert_eq!(composites.deleted, 1);
        let held = held_composites(&admin).await.unwrap();
        assert_eq!(held.realm, Some(vec![]));

        admin.clear_write_log().await;
        apply(&admin, &make_roles(json!([]))).await;
        assert_eq!(admin.writes().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_composite_member_is_unresolved() {
        let admin = make_admin().await;
        let desired = make_roles(json!(["ghost"]));
        let config = default_config();
        run(&RoleReconciler, &admin, &config, &desired).await.unwrap();
        let err = run(&CompositeRoleReconciler, &admin, &config, &desired)
            .await
            .unwrap_err();
        match err {
            ReconcileError::UnresolvedReference { missing, entity, .. } => {
                assert_eq!(missing, "realm role 'ghost'");
                assert_eq!(entity, "realm/admin");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_client_roles_need_their_client() {
        let admin = make_admin().await;
        let desired = make_desired(json!({
            "realm": REALM,
            "roles": {"client": {"app": [{"name": "viewer"}]}}
        }));
        let err = run(&RoleReconciler, &admin, &default_config(), &desired)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("client 'app'"));
        assert_eq!(admin.writes().await, 0);
    }

    #[tokio::test]
    async fn test_role_deletes_follow_every_create() {
        let admin = make_admin().await;
        admin
            .create_client(REALM, &Client {
                client_id: "app".into(),
                enabled: true,
                ..Default::default()
            })
            .await
            .unwrap();
        admin
            .create_role(REALM, &RoleScope::Realm, &Role {
                name: "old".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        admin.clear_write_log().await;

        let desired = make_desired(json!({
            "realm": REALM,
            "roles": {"realm": [], "client": {"app": [{"name": "viewer"}]}}
        }));
        let summary = run(&RoleReconciler, &admin, &default_config(), &desired)
            .await
            .unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(
            admin.write_log().await,
            vec![
                "create_role client 'app'/viewer".to_string(),
                "delete_role realm/old".to_string(),
            ]
        );
    }

    #[test]
    fn test_composite_changes_client_side() {
        let wanted = RoleComposites {
            realm: None,
            client: Some(BTreeMap::from([("app".to_string(), vec!["viewer".to_string()])])),
        };
        let held = RoleComposites {
            realm: Some(vec!["user".to_string()]),
            client: Some(BTreeMap::from([
                ("app".to_string(), vec!["editor".to_string()]),
                ("old".to_string(), vec!["x".to_string()]),
            ])),
        };
        let (add, remove) = composite_changes(&wanted, &held);
        assert_eq!(add.realm, None);
        assert_eq!(add.client.unwrap()["app"], vec!["viewer".to_string()]);
        let removed = remove.client.unwrap();
        assert_eq!(removed["app"], vec!["editor".to_string()]);
        assert_eq!(removed["old"], vec!["x".to_string()]);
        // Realm members untouched because the document leaves them out.
        assert_eq!(remove.realm, None);
    }
}
