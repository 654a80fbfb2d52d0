//! Localized message reconciler.
//!
//! Entries are keyed by `(locale, key)`. When the document declares message
//! bundles, every locale the server knows is managed, so a locale dropped from
//! the document is emptied under `full`.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::info;

use super::{RealmContext, Reconciler};
use crate::diff::{self, ChangeSummary, Resource};
use crate::error::Result;
use crate::model::DesiredRealm;
use crate::policy::Category;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Message {
    locale: String,
    key: String,
    text: String,
}

impl Resource for Message {
    /// `locale/key`
    type Key = String;

    fn key(&self) -> String {
        format!("{}/{}", self.locale, self.key)
    }

    fn same_as(&self, actual: &Self) -> bool {
        self.text == actual.text
    }
}

pub struct MessageBundleReconciler;

#[async_trait]
impl Reconciler for MessageBundleReconciler {
    fn category(&self) -> Category {
        Category::MessageBundle
    }

    async fn reconcile(
        &self,
        ctx: &RealmContext<'_>,
        desired: &DesiredRealm,
    ) -> Result<ChangeSummary> {
        let Some(bundles) = &desired.message_bundles else {
            return Ok(ChangeSummary::default());
        };
        let wanted: Vec<Message> = bundles
            .iter()
            .flat_map(|(locale, entries)| {
                entries.iter().map(move |(key, text)| Message {
                    locale: locale.clone(),
                    key: key.clone(),
                    text: text.clone(),
                })
            })
            .collect();

        let mut locales: BTreeSet<String> = ctx
            .admin
            .list_message_locales(ctx.realm)
            .await
            .map_err(ctx.admin_err(Category::MessageBundle, ctx.realm))?
            .into_iter()
            .collect();
        locales.extend(bundles.keys().cloned());

        let mut actual = Vec::new();
        for locale in &locales {
            let messages = ctx
                .admin
                .get_messages(ctx.realm, locale)
                .await
                .map_err(ctx.admin_err(Category::MessageBundle, locale))?;
            actual.extend(messages.into_iter().map(|(key, text)| Message {
                locale: locale.clone(),
                key,
                text,
            }));
        }

        let plan = diff::plan(&wanted, &actual);
        let mut summary = ChangeSummary {
            skipped: plan.skip.len(),
            ..Default::default()
        };

        for message in &plan.create {
            info!("Creating message {} in realm {}", message.key(), ctx.realm);
            ctx.admin
                .put_message(ctx.realm, &message.locale, &message.key, &message.text)
                .await
                .map_err(ctx.admin_err(Category::MessageBundle, message.key()))?;
            summary.created += 1;
        }

        for (message, _) in &plan.update {
            info!("Updating message {} in realm {}", message.key(), ctx.realm);
            ctx.admin
                .put_message(ctx.realm, &message.locale, &message.key, &message.text)
                .await
                .map_err(ctx.admin_err(Category::MessageBundle, message.key()))?;
            summary.updated += 1;
        }

        if ctx.policy(Category::MessageBundle).allows_delete() {
            for message in &plan.delete {
                info!("Deleting message {} from realm {}", message.key(), ctx.realm);
                ctx.admin
                    .delete_message(ctx.realm, &message.locale, &message.key)
                    .await
                    .map_err(ctx.admin_err(Category::MessageBundle, message.key()))?;
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
    use crate::config::ImportConfig;
    use crate::policy::ManagedPolicy;
    use crate::reconciler::testing::{default_config, make_admin, make_desired, run, REALM};
    use serde_json::json;

    #[tokio::test]
    async fn test_messages_converge_per_locale() {
        let admin = make_admin().await;
        let config = default_config();
        let desired = make_desired(json!({
            "realm": REALM,
            "messageBundles": {
                "en": {"welcome": "Hello", "bye": "Bye"},
                "de": {"welcome": "Hallo"}
            }
        }));
        let summary = run(&MessageBundleReconciler, &admin, &config, &desired).await.unwrap();
        assert_eq!(summary.created, 3);

        admin.clear_write_log().await;
        run(&MessageBundleReconciler, &admin, &config, &desired).await.unwrap();
        assert_eq!(admin.writes().await, 0);

        let changed = make_desired(json!({
            "realm": REALM,
            "messageBundles": {"en": {"welcome": "Hi"}}
        }));
        let summary = run(&MessageBundleReconciler, &admin, &config, &changed).await.unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.deleted, 2);
        assert!(admin.get_messages(REALM, "de").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_delete_keeps_extra_messages() {
        let admin = make_admin().await;
        admin.put_message(REALM, "fr", "welcome", "Salut").await.unwrap();
        let config = ImportConfig {
            managed: [(Category::MessageBundle, ManagedPolicy::NoDelete)].into(),
            ..Default::default()
        };
        let desired = make_desired(json!({
            "realm": REALM,
            "messageBundles": {"en": {"welcome": "Hello"}}
        }));
        let summary = run(&MessageBundleReconciler, &admin, &config, &desired).await.unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.deleted, 0);
        assert_eq!(admin.get_messages(REALM, "fr").await.unwrap()["welcome"], "Salut");
    }
}
