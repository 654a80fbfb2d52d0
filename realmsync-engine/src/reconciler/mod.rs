//! Reconcilers for the realm's resource categories.
//!
//! Each reconciler reads the actual state of one category from the admin API,
//! diffs it against the desired document and issues the converging writes.
//! They run in a fixed order (see [`default_reconcilers`]) so dependencies
//! exist before their dependents.

pub mod authentication;
pub mod client;
pub mod client_scope;
pub mod component;
pub mod group;
pub mod identity_provider;
pub mod message_bundle;
pub mod organization;
pub mod realm;
pub mod role;
pub mod scope_mapping;
pub mod workflow;

use std::fmt::Display;

use async_trait::async_trait;

use crate::admin::RealmAdmin;
use crate::config::ImportConfig;
use crate::diff::ChangeSummary;
use crate::error::{AdminError, ReconcileError, Result};
use crate::model::DesiredRealm;
use crate::policy::{Category, ManagedPolicy};
use crate::retry::RetryHandler;

/// Everything a reconciler needs while working on one realm.
pub struct RealmContext<'a> {
    pub realm: &'a str,
    pub admin: &'a dyn RealmAdmin,
    pub config: &'a ImportConfig,
    pub retry: &'a RetryHandler,
}

impl RealmContext<'_> {
    pub fn policy(&self, category: Category) -> ManagedPolicy {
        self.config.policy(category)
    }

    /// Attribute an admin failure to an entity.
    pub fn admin_err(
        &self,
        category: Category,
        entity: impl Display,
    ) -> impl FnOnce(AdminError) -> ReconcileError {
        let realm = self.realm.to_string();
        let entity = entity.to_string();
        move |source| ReconcileError::Admin {
            realm,
            category,
            entity,
            source,
        }
    }

    pub fn unresolved(
        &self,
        category: Category,
        entity: impl Display,
        missing: impl Display,
    ) -> ReconcileError {
        ReconcileError::UnresolvedReference {
            realm: self.realm.to_string(),
            category,
            entity: entity.to_string(),
            missing: missing.to_string(),
        }
    }
}

/// Trait for category reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// The category whose managed policy governs this reconciler.
    fn category(&self) -> Category;

    /// Converge the category onto `desired`. Categories the document does not
    /// mention are left alone.
    async fn reconcile(&self, ctx: &RealmContext<'_>, desired: &DesiredRealm)
        -> Result<ChangeSummary>;
}

/// All reconcilers in dependency order.
pub fn default_reconcilers() -> Vec<Box<dyn Reconciler>> {
    vec![
        Box::new(realm::RealmSettingsReconciler),
        Box::new(client_scope::ClientScopeReconciler),
        Box::new(client::ClientReconciler),
        Box::new(role::RoleReconciler),
        Box::new(role::CompositeRoleReconciler),
        Box::new(group::GroupReconciler),
        Box::new(group::DefaultGroupReconciler),
        Box::new(scope_mapping::ScopeMappingReconciler),
        Box::new(scope_mapping::ClientScopeMappingReconciler),
        Box::new(identity_provider::IdentityProviderReconciler),
        Box::new(identity_provider::IdentityProviderMapperReconciler),
        Box::new(authentication::FlowReconciler),
        Box::new(authentication::AuthenticatorConfigReconciler),
        Box::new(component::ComponentReconciler),
        Box::new(message_bundle::MessageBundleReconciler),
        Box::new(workflow::WorkflowReconciler),
        Box::new(organization::OrganizationReconciler),
    ]
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconciler_order() {
        let order: Vec<Category> = default_reconcilers().iter().map(|r| r.category()).collect();
        assert_eq!(
            order,
            vec![
                Category::Realm,
                Category::ClientScope,
                Category::Client,
                Category::Role,
                Category::CompositeRole,
                Category::Group,
                Category::DefaultGroup,
                Category::ScopeMapping,
                Category::ClientScopeMapping,
                Category::IdentityProvider,
                Category::IdentityProviderMapper,
                Category::AuthenticationFlow,
                Category::AuthenticatorConfig,
                Category::Component,
                Category::MessageBundle,
                Category::Workflow,
                Category::Organization,
            ]
        );
    }
}
