//! Component reconciler.
//!
//! Components are grouped by provider type in the document and matched by
//! `(providerType, name)` under their parent. Only provider types the document
//! declares are managed. Sub-components are handled one level at a time under
//! the `sub-component` policy.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{RealmContext, Reconciler};
use crate::diff::{self, ChangeSummary, Resource};
use crate::error::Result;
use crate::model::{Component, DesiredRealm, USER_STORAGE_PROVIDER_TYPE};
use crate::policy::Category;

impl Resource for Component {
    /// `providerType/name`
    type Key = String;

    fn key(&self) -> String {
        format!(
            "{}/{}",
            self.provider_type.as_deref().unwrap_or_default(),
            self.name
        )
    }

    fn same_as(&self, actual: &Self) -> bool {
        self.provider_id == actual.provider_id
            && self.provider_type == actual.provider_type
            && self.sub_type == actual.sub_type
            && self.config == actual.config
    }
}

/// Flatten a provider-type map, stamping each entry with its type.
fn flatten(by_type: &BTreeMap<String, Vec<Component>>) -> Vec<Component> {
    by_type
        .iter()
        .flat_map(|(provider_type, components)| {
            components.iter().map(move |c| Component {
                provider_type: Some(provider_type.clone()),
                ..c.clone()
            })
        })
        .collect()
}

struct Level {
    parent: Option<String>,
    category: Category,
    desired: Vec<Component>,
    types: BTreeSet<String>,
}

pub struct ComponentReconciler;

impl ComponentReconciler {
    async fn after_write(ctx: &RealmContext<'_>, component: &Component, id: &str) -> Result<()> {
        if !ctx.config.sync_user_federation
            || component.provider_type.as_deref() != Some(USER_STORAGE_PROVIDER_TYPE)
        {
            return Ok(());
        }
        info!(
            "Triggering federation sync for {} in realm {}",
            component.name, ctx.realm
        );
        ctx.admin
            .trigger_federation_sync(ctx.realm, id)
            .await
            .map_err(ctx.admin_err(Category::Component, component.key()))
    }
}

#[async_trait]
impl Reconciler for ComponentReconciler {
    fn category(&self) -> Category {
        Category::Component
    }

    async fn reconcile(
        &self,
        ctx: &RealmContext<'_>,
        desired: &DesiredRealm,
    ) -> Result<ChangeSummary> {
        let Some(by_type) = &desired.components else {
            return Ok(ChangeSummary::default());
        };

        let mut summary = ChangeSummary::default();
        let mut stale: Vec<(Category, String, String)> = Vec::new();
        let mut pending = VecDeque::from([Level {
            parent: None,
            category: Category::Component,
            desired: flatten(by_type),
            types: by_type.keys().cloned().collect(),
        }]);

        while let Some(level) = pending.pop_front() {
            let policy = ctx.policy(level.category);
            if !policy.is_managed() {
                debug!("Skipping unmanaged {} level in realm {}", level.category, ctx.realm);
                continue;
            }
            let parent = level.parent.as_deref();
            let actual: Vec<Component> = ctx
                .admin
                .list_components(ctx.realm, parent)
                .await
                .map_err(ctx.admin_err(level.category, parent.unwrap_or(ctx.realm)))?
                .into_iter()
                .filter(|c| {
                    c.provider_type
                        .as_ref()
                        .is_some_and(|t| level.types.contains(t))
                })
                .collect();

            let plan = diff::plan(&level.desired, &actual);
            summary.skipped += plan.skip.len();
            let mut children = Vec::new();

            for component in &plan.create {
                info!("Creating component {} in realm {}", component.key(), ctx.realm);
                let bare = Component {
                    id: None,
                    sub_components: None,
                    ..(*component).clone()
                };
                let id = ctx
                    .admin
                    .create_component(ctx.realm, parent, &bare)
                    .await
                    .map_err(ctx.admin_err(level.category, component.key()))?;
                summary.created += 1;
                Self::after_write(ctx, component, &id).await?;
                children.push((id, *component));
            }

            for (component, existing) in &plan.update {
                info!("Updating component {} in realm {}", component.key(), ctx.realm);
                let update = Component {
                    id: existing.id.clone(),
                    sub_components: None,
                    ..(*component).clone()
                };
                ctx.admin
                    .update_component(ctx.realm, &update)
                    .await
                    .map_err(ctx.admin_err(level.category, component.key()))?;
                summary.updated += 1;
                if let Some(id) = &existing.id {
                    Self::after_write(ctx, component, id).await?;
                }
            }

            for (component, existing) in plan.matched() {
                if let Some(id) = &existing.id {
                    children.push((id.clone(), component));
                }
            }

            if policy.allows_delete() {
                stale.extend(plan.delete.iter().filter_map(|component| {
                    let id = component.id.clone()?;
                    Some((level.category, id, component.key()))
                }));
            }

            for (id, component) in children {
                if let Some(sub) = &component.sub_components {
                    pending.push_back(Level {
                        parent: Some(id),
                        category: Category::SubComponent,
                        desired: flatten(sub),
                        types: sub.keys().cloned().collect(),
                    });
                }
            }
        }

        // Deletes wait until every level has been created and updated.
        for (category, id, key) in stale {
            info!("Deleting component {} from realm {}", key, ctx.realm);
            ctx.admin
                .delete_component(ctx.realm, &id)
                .await
                .map_err(ctx.admin_err(category, &key))?;
            summary.deleted += 1;
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::RealmAdmin;
    use crate::config::ImportConfig;
    use crate::reconciler::testing::{default_config, make_admin, make_desired, run, REALM};
    use serde_json::json;

    fn make_ldap(bind_dn: &str) -> DesiredRealm {
        make_desired(json!({
            "realm": REALM,
            "components": {
                "org.keycloak.storage.UserStorageProvider": [{
                    "name": "ldap",
                    "providerId": "ldap",
                    "config": {"bindDn": [bind_dn]},
                    "subComponents": {
                        "org.keycloak.storage.ldap.mappers.LDAPStorageMapper": [{
                            "name": "email",
                            "providerId": "user-attribute-ldap-mapper",
                            "config": {"ldap.attribute": ["mail"]}
                        }]
                    }
                }]
            }
        }))
    }

    #[tokio::test]
    async fn test_component_tree_converges() {
        let admin = make_admin().await;
        let config = default_config();
        let summary = run(&ComponentReconciler, &admin, &config, &make_ldap("cn=admin"))
            .await
            .unwrap();
        assert_eq!(summary.created, 2);

        admin.clear_write_log().await;
        let again = run(&ComponentReconciler, &admin, &config, &make_ldap("cn=admin"))
            .await
            .unwrap();
        assert!(again.is_noop());
        assert_eq!(admin.writes().await, 0);
    }

    #[tokio::test]
    async fn test_federation_sync_after_change() {
        let admin = make_admin().await;
        let config = ImportConfig {
            sync_user_federation: true,
            ..Default::default()
        };
        run(&ComponentReconciler, &admin, &config, &make_ldap("cn=admin"))
            .await
            .unwrap();
        run(&ComponentReconciler, &admin, &config, &make_ldap("cn=root"))
            .await
            .unwrap();
        run(&ComponentReconciler, &admin, &config, &make_ldap("cn=root"))
            .await
            .unwrap();

        let syncs = admin
            .write_log()
            .await
            .into_iter()
            .filter(|call| call.starts_with("sync_federation"))
            .count();
        assert_eq!(syncs, 2);
    }

    #[tokio::test]
    async fn test_component_deletes_follow_sub_component_creates() {
        let admin = make_admin().await;
        let config = default_config();
        run(&ComponentReconciler, &admin, &config, &make_ldap("cn=admin"))
            .await
            .unwrap();
        let stray = Component {
            name: "old-ldap".into(),
            provider_id: "ldap".into(),
            provider_type: Some(USER_STORAGE_PROVIDER_TYPE.into()),
            ..Default::default()
        };
        let stray_id = admin.create_component(REALM, None, &stray).await.unwrap();
        admin.clear_write_log().await;

        let desired = make_desired(json!({
            "realm": REALM,
            "components": {
                "org.keycloak.storage.UserStorageProvider": [{
                    "name": "ldap",
                    "providerId": "ldap",
                    "config": {"bindDn": ["cn=admin"]},
                    "subComponents": {
                        "org.keycloak.storage.ldap.mappers.LDAPStorageMapper": [
                            {
                                "name": "email",
                                "providerId": "user-attribute-ldap-mapper",
                                "config": {"ldap.attribute": ["mail"]}
                            },
                            {
                                "name": "username",
                                "providerId": "user-attribute-ldap-mapper",
                                "config": {"ldap.attribute": ["uid"]}
                            }
                        ]
                    }
                }]
            }
        }));
        let summary = run(&ComponentReconciler, &admin, &config, &desired)
            .await
            .unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(
            admin.write_log().await,
            vec![
                "create_component username".to_string(),
                format!("delete_component {}", stray_id),
            ]
        );
    }

    #[tokio::test]
    async fn test_other_provider_types_untouched() {
        let admin = make_admin().await;
        let key_provider = Component {
            name: "rsa".into(),
            provider_id: "rsa-generated".into(),
            provider_type: Some("org.keycloak.keys.KeyProvider".into()),
            ..Default::default()
        };
        admin.create_component(REALM, None, &key_provider).await.unwrap();

        run(&ComponentReconciler, &admin, &default_config(), &make_ldap("cn=admin"))
            .await
            .unwrap();
        let top = admin.list_components(REALM, None).await.unwrap();
        assert_eq!(top.len(), 2);
    }
}
