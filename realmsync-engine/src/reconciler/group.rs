//! Group and default-group reconcilers.
//!
//! Groups are matched by name within their parent, so effectively by path.
//! The tree is walked level by level: a subgroup list is only diffed when the
//! document declares it. The server may not list a freshly created group
//! right away, so every create waits until the group is visible by path
//! before its children are processed.

use std::collections::VecDeque;

use async_trait::async_trait;
use tracing::info;

use super::{RealmContext, Reconciler};
use crate::diff::{self, ChangeSummary, Resource};
use crate::error::Result;
use crate::model::{group_path, DesiredRealm, Group};
use crate::policy::Category;

impl Resource for Group {
    type Key = String;

    fn key(&self) -> String {
        self.name.clone()
    }

    fn same_as(&self, actual: &Self) -> bool {
        self.shallow() == actual.shallow()
    }
}

/// One level of the tree still to diff.
struct Level<'a> {
    parent: Option<String>,
    desired: &'a [Group],
    actual: Vec<Group>,
}

pub struct GroupReconciler;

impl GroupReconciler {
    async fn wait_until_visible(ctx: &RealmContext<'_>, path: &str) -> Result<Group> {
        let entity = format!("group '{}'", path);
        let admin = ctx.admin;
        let realm = ctx.realm;
        ctx.retry
            .with_retry(realm, Category::Group, &entity, move || async move {
                admin
                    .find_group_by_path(realm, path)
                    .await
                    .map_err(ctx.admin_err(Category::Group, path))
            })
            .await
    }
}

#[async_trait]
impl Reconciler for GroupReconciler {
    fn category(&self) -> Category {
        Category::Group
    }

    async fn reconcile(
        &self,
        ctx: &RealmContext<'_>,
        desired: &DesiredRealm,
    ) -> Result<ChangeSummary> {
        let Some(wanted) = desired.groups.as_deref() else {
            return Ok(ChangeSummary::default());
        };
        let allow_delete = ctx.policy(Category::Group).allows_delete();
        let actual = ctx
            .admin
            .list_groups(ctx.realm)
            .await
            .map_err(ctx.admin_err(Category::Group, ctx.realm))?;

        let mut summary = ChangeSummary::default();
        let mut stale: Vec<String> = Vec::new();
        let mut pending = VecDeque::from([Level {
            parent: None,
            desired: wanted,
            actual,
        }]);

        while let Some(level) = pending.pop_front() {
            let parent = level.parent.as_deref();
            let plan = diff::plan(level.desired, &level.actual);
            summary.skipped += plan.skip.len();

            for &group in &plan.create {
                let path = group_path(parent, &group.name);
                info!("Creating group {} in realm {}", path, ctx.realm);
                ctx.admin
                    .create_group(ctx.realm, parent, &group.shallow())
                    .await
                    .map_err(ctx.admin_err(Category::Group, &path))?;
                summary.created += 1;

                let created = Self::wait_until_visible(ctx, &path).await?;
                if let Some(children) = group.sub_groups.as_deref() {
                    pending.push_back(Level {
                        parent: Some(path),
                        desired: children,
                        actual: created.sub_groups.unwrap_or_default(),
                    });
                }
            }

            for (group, _) in &plan.update {
                let path = group_path(parent, &group.name);
                info!("Updating group {} in realm {}", path, ctx.realm);
                ctx.admin
                    .update_group(ctx.realm, &path, &group.shallow())
                    .await
                    .map_err(ctx.admin_err(Category::Group, &path))?;
                summary.updated += 1;
            }

            for (group, existing) in plan.matched() {
                if let Some(children) = group.sub_groups.as_deref() {
                    pending.push_back(Level {
                        parent: Some(group_path(parent, &group.name)),
                        desired: children,
                        actual: existing.sub_groups.clone().unwrap_or_default(),
                    });
                }
            }

            if allow_delete {
                stale.extend(plan.delete.iter().map(|group| group_path(parent, &group.name)));
            }
        }

        // Deletes wait until the whole tree has been created and updated.
        for path in stale {
            info!("Deleting group {} from realm {}", path, ctx.realm);
            ctx.admin
                .delete_group(ctx.realm, &path)
                .await
                .map_err(ctx.admin_err(Category::Group, &path))?;
            summary.deleted += 1;
        }

        Ok(summary)
    }
}

fn contains_path(groups: &[Group], path: &str) -> bool {
    let mut level = groups;
    let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();
    while let Some(name) = segments.next() {
        let Some(group) = level.iter().find(|g| g.name == name) else {
            return false;
        };
        if segments.peek().is_none() {
            return true;
        }
        level = group.sub_groups.as_deref().unwrap_or_default();
    }
    false
}

pub struct DefaultGroupReconciler;

#[async_trait]
impl Reconciler for DefaultGroupReconciler {
    fn category(&self) -> Category {
        Category::DefaultGroup
    }

    async fn reconcile(
        &self,
        ctx: &RealmContext<'_>,
        desired: &DesiredRealm,
    ) -> Result<ChangeSummary> {
        let Some(wanted) = desired.default_groups.as_deref() else {
            return Ok(ChangeSummary::default());
        };
        let err = || ctx.admin_err(Category::DefaultGroup, ctx.realm);
        let actual = ctx.admin.list_default_groups(ctx.realm).await.map_err(err())?;
        let (add, remove) = diff::set_changes(wanted, &actual);

        if !add.is_empty() {
            let groups = ctx.admin.list_groups(ctx.realm).await.map_err(err())?;
            if let Some(missing) = add.iter().find(|path| !contains_path(&groups, path)) {
                return Err(ctx.unresolved(
                    Category::DefaultGroup,
                    missing,
                    format!("group '{}'", missing),
                ));
            }
        }

        let mut summary = ChangeSummary {
            skipped: actual.len().saturating_sub(remove.len()),
            ..Default::default()
        };

        for path in &add {
            info!("Adding default group {} in realm {}", path, ctx.realm);
            ctx.admin
                .add_default_group(ctx.realm, path)
                .await
                .map_err(ctx.admin_err(Category::DefaultGroup, path))?;
            summary.created += 1;
        }

        if ctx.policy(Category::DefaultGroup).allows_delete() {
            for path in &remove {
                info!("Removing default group {} from realm {}", path, ctx.realm);
                ctx.admin
                    .remove_default_group(ctx.realm, path)
                    .await
                    .map_err(ctx.admin_err(Category::DefaultGroup, path))?;
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
    use crate::memory::MemoryAdmin;
    use crate::model::RealmSettings;
    use crate::reconciler::testing::{default_config, make_admin, make_desired, run, REALM};
    use serde_json::json;

    fn make_tree() -> DesiredRealm {
        make_desired(json!({
            "realm": REALM,
            "groups": [{
                "name": "staff",
                "attributes": {"team": ["core"]},
                "subGroups": [{"name": "ops"}, {"name": "dev", "subGroups": [{"name": "web"}]}]
            }]
        }))
    }

    #[tokio::test]
    async fn test_creates_tree_then_noop() {
        let admin = make_admin().await;
        let config = default_config();
        let summary = run(&GroupReconciler, &admin, &config, &make_tree()).await.unwrap();
        assert_eq!(summary.created, 4);
        assert!(admin.find_group_by_path(REALM, "/staff/dev/web").await.unwrap().is_some());

        admin.clear_write_log().await;
        let again = run(&GroupReconciler, &admin, &config, &make_tree()).await.unwrap();
        assert!(again.is_noop());
        assert_eq!(admin.writes().await, 0);
    }

    #[tokio::test]
    async fn test_waits_for_lagging_group() {
        let admin = MemoryAdmin::new().with_group_visibility_lag(2);
        admin
            .create_realm(&RealmSettings {
                realm: REALM.into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let desired = make_desired(json!({"realm": REALM, "groups": [{"name": "staff"}]}));
        run(&GroupReconciler, &admin, &default_config(), &desired)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_group_never_visible_times_out() {
        let admin = MemoryAdmin::new().with_group_visibility_lag(10);
        admin
            .create_realm(&RealmSettings {
                realm: REALM.into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let desired = make_desired(json!({"realm": REALM, "groups": [{"name": "staff"}]}));
        let err = run(&GroupReconciler, &admin, &default_config(), &desired)
            .await
            .unwrap_err();
        match err {
            ReconcileError::ConsistencyTimeout {
                realm,
                category,
                entity,
                ..
            } => {
                assert_eq!(realm, REALM);
                assert_eq!(category, Category::Group);
                assert_eq!(entity, "group '/staff'");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_undeclared_subgroups_are_left_alone() {
        let admin = make_admin().await;
        let config = default_config();
        run(&GroupReconciler, &admin, &config, &make_tree()).await.unwrap();

        let shallow = make_desired(json!({
            "realm": REALM,
            "groups": [{"name": "staff", "attributes": {"team": ["core"]}}]
        }));
        let summary = run(&GroupReconciler, &admin, &config, &shallow).await.unwrap();
        assert!(summary.is_noop());
        assert!(admin.find_group_by_path(REALM, "/staff/ops").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_group_deletes_follow_deeper_creates() {
        let admin = make_admin().await;
        let config = default_config();
        run(&GroupReconciler, &admin, &config, &make_tree()).await.unwrap();
        admin.clear_write_log().await;

        let reshaped = make_desired(json!({
            "realm": REALM,
            "groups": [{
                "name": "staff",
                "attributes": {"team": ["core"]},
                "subGroups": [{"name": "dev", "subGroups": [{"name": "web"}, {"name": "api"}]}]
            }]
        }));
        let summary = run(&GroupReconciler, &admin, &config, &reshaped).await.unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(
            admin.write_log().await,
            vec![
                "create_group /staff/dev/api".to_string(),
                "delete_group /staff/ops".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_default_group_requires_existing_path() {
        let admin = make_admin().await;
        let config = default_config();
        run(&GroupReconciler, &admin, &config, &make_tree()).await.unwrap();

        let desired = make_desired(json!({
            "realm": REALM,
            "defaultGroups": ["/staff/ops", "/nobody"]
        }));
        let err = run(&DefaultGroupReconciler, &admin, &config, &desired)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("group '/nobody'"));
        assert!(admin.list_default_groups(REALM).await.unwrap().is_empty());

        let desired = make_desired(json!({"realm": REALM, "defaultGroups": ["/staff/ops"]}));
        let summary = run(&DefaultGroupReconciler, &admin, &config, &desired).await.unwrap();
        assert_eq!(summary.created, 1);
        let again = run(&DefaultGroupReconciler, &admin, &config, &desired).await.unwrap();
        assert!(again.is_noop());
    }
}
