//! Admin API trait.
//!
//! Abstracts the identity server's administrative API so reconcilers work
//! with representations instead of HTTP calls. Authentication, transport
//! and HTTP-level retries live behind this seam.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::AdminError;
use crate::model::{
    AuthenticationFlow, Client, ClientScope, Component, ExecutionConfig, Grantee, Group,
    IdentityProvider, IdentityProviderMapper, MappingSpace, Organization, ProtocolMapper,
    RealmSettings, Role, RoleComposites, RoleScope, ScopeMapping, Workflow,
};

/// Result type for admin API calls.
pub type AdminResult<T> = std::result::Result<T, AdminError>;

#[async_trait]
pub trait RealmAdmin: Send + Sync {
    // Realm
    async fn get_realm(&self, realm: &str) -> AdminResult<Option<RealmSettings>>;
    async fn create_realm(&self, settings: &RealmSettings) -> AdminResult<()>;
    async fn update_realm(&self, settings: &RealmSettings) -> AdminResult<()>;

    // Client scopes
    async fn list_client_scopes(&self, realm: &str) -> AdminResult<Vec<ClientScope>>;
    async fn create_client_scope(&self, realm: &str, scope: &ClientScope) -> AdminResult<()>;
    async fn update_client_scope(&self, realm: &str, scope: &ClientScope) -> AdminResult<()>;
    async fn delete_client_scope(&self, realm: &str, name: &str) -> AdminResult<()>;
    async fn create_protocol_mapper(
        &self,
        realm: &str,
        scope: &str,
        mapper: &ProtocolMapper,
    ) -> AdminResult<()>;
    async fn update_protocol_mapper(
        &self,
        realm: &str,
        scope: &str,
        mapper: &ProtocolMapper,
    ) -> AdminResult<()>;
    async fn delete_protocol_mapper(&self, realm: &str, scope: &str, name: &str)
        -> AdminResult<()>;

    // Clients
    async fn list_clients(&self, realm: &str) -> AdminResult<Vec<Client>>;
    async fn create_client(&self, realm: &str, client: &Client) -> AdminResult<()>;
    async fn update_client(&self, realm: &str, client: &Client) -> AdminResult<()>;
    async fn delete_client(&self, realm: &str, client_id: &str) -> AdminResult<()>;

    // Roles
    async fn list_roles(&self, realm: &str, scope: &RoleScope) -> AdminResult<Vec<Role>>;
    async fn create_role(&self, realm: &str, scope: &RoleScope, role: &Role) -> AdminResult<()>;
    async fn update_role(&self, realm: &str, scope: &RoleScope, role: &Role) -> AdminResult<()>;
    async fn delete_role(&self, realm: &str, scope: &RoleScope, name: &str) -> AdminResult<()>;
    async fn add_composites(
        &self,
        realm: &str,
        scope: &RoleScope,
        role: &str,
        members: &RoleComposites,
    ) -> AdminResult<()>;
    async fn remove_composites(
        &self,
        realm: &str,
        scope: &RoleScope,
        role: &str,
        members: &RoleComposites,
    ) -> AdminResult<()>;

    // Groups
    /// Top-level groups with their full subtrees.
    async fn list_groups(&self, realm: &str) -> AdminResult<Vec<Group>>;
    /// Lookup by path. May lag behind a create.
    async fn find_group_by_path(&self, realm: &str, path: &str) -> AdminResult<Option<Group>>;
    /// Create a single group (subgroups are ignored) under `parent`.
    async fn create_group(&self, realm: &str, parent: Option<&str>, group: &Group)
        -> AdminResult<()>;
    async fn update_group(&self, realm: &str, path: &str, group: &Group) -> AdminResult<()>;
    async fn delete_group(&self, realm: &str, path: &str) -> AdminResult<()>;
    async fn list_default_groups(&self, realm: &str) -> AdminResult<Vec<String>>;
    async fn add_default_group(&self, realm: &str, path: &str) -> AdminResult<()>;
    async fn remove_default_group(&self, realm: &str, path: &str) -> AdminResult<()>;

    // Scope mappings
    async fn list_scope_mappings(
        &self,
        realm: &str,
        space: &MappingSpace,
    ) -> AdminResult<Vec<ScopeMapping>>;
    async fn add_scope_mapping_roles(
        &self,
        realm: &str,
        space: &MappingSpace,
        grantee: &Grantee,
        roles: &[String],
    ) -> AdminResult<()>;
    async fn remove_scope_mapping_roles(
        &self,
        realm: &str,
        space: &MappingSpace,
        grantee: &Grantee,
        roles: &[String],
    ) -> AdminResult<()>;

    // Identity providers
    async fn list_identity_providers(&self, realm: &str) -> AdminResult<Vec<IdentityProvider>>;
    async fn create_identity_provider(&self, realm: &str, idp: &IdentityProvider)
        -> AdminResult<()>;
    async fn update_identity_provider(&self, realm: &str, idp: &IdentityProvider)
        -> AdminResult<()>;
    async fn delete_identity_provider(&self, realm: &str, alias: &str) -> AdminResult<()>;
    async fn list_identity_provider_mappers(
        &self,
        realm: &str,
    ) -> AdminResult<Vec<IdentityProviderMapper>>;
    async fn create_identity_provider_mapper(
        &self,
        realm: &str,
        mapper: &IdentityProviderMapper,
    ) -> AdminResult<()>;
    async fn update_identity_provider_mapper(
        &self,
        realm: &str,
        mapper: &IdentityProviderMapper,
    ) -> AdminResult<()>;
    async fn delete_identity_provider_mapper(
        &self,
        realm: &str,
        alias: &str,
        name: &str,
    ) -> AdminResult<()>;

    // Authentication
    async fn list_flows(&self, realm: &str) -> AdminResult<Vec<AuthenticationFlow>>;
    async fn create_flow(&self, realm: &str, flow: &AuthenticationFlow) -> AdminResult<()>;
    async fn update_flow(&self, realm: &str, flow: &AuthenticationFlow) -> AdminResult<()>;
    async fn delete_flow(&self, realm: &str, alias: &str) -> AdminResult<()>;
    async fn list_authenticator_configs(&self, realm: &str) -> AdminResult<Vec<ExecutionConfig>>;
    async fn create_authenticator_config(
        &self,
        realm: &str,
        config: &ExecutionConfig,
    ) -> AdminResult<()>;
    async fn update_authenticator_config(
        &self,
        realm: &str,
        config: &ExecutionConfig,
    ) -> AdminResult<()>;
    async fn delete_authenticator_config(
        &self,
        realm: &str,
        config: &ExecutionConfig,
    ) -> AdminResult<()>;

    // Components
    /// Direct children of `parent`, or of the realm when `parent` is `None`.
    async fn list_components(&self, realm: &str, parent: Option<&str>)
        -> AdminResult<Vec<Component>>;
    /// Returns the new component id.
    async fn create_component(
        &self,
        realm: &str,
        parent: Option<&str>,
        component: &Component,
    ) -> AdminResult<String>;
    async fn update_component(&self, realm: &str, component: &Component) -> AdminResult<()>;
    async fn delete_component(&self, realm: &str, id: &str) -> AdminResult<()>;
    async fn trigger_federation_sync(&self, realm: &str, component_id: &str) -> AdminResult<()>;

    // Message bundles
    async fn list_message_locales(&self, realm: &str) -> AdminResult<Vec<String>>;
    async fn get_messages(&self, realm: &str, locale: &str)
        -> AdminResult<BTreeMap<String, String>>;
    async fn put_message(&self, realm: &str, locale: &str, key: &str, text: &str)
        -> AdminResult<()>;
    async fn delete_message(&self, realm: &str, locale: &str, key: &str) -> AdminResult<()>;

    // Workflows
    async fn list_workflows(&self, realm: &str) -> AdminResult<Vec<Workflow>>;
    async fn create_workflow(&self, realm: &str, workflow: &Workflow) -> AdminResult<()>;
    async fn update_workflow(&self, realm: &str, workflow: &Workflow) -> AdminResult<()>;
    async fn delete_workflow(&self, realm: &str, name: &str) -> AdminResult<()>;

    // Organizations
    /// Organizations without their associations.
    async fn list_organizations(&self, realm: &str) -> AdminResult<Vec<Organization>>;
    async fn create_organization(&self, realm: &str, org: &Organization) -> AdminResult<()>;
    async fn update_organization(&self, realm: &str, org: &Organization) -> AdminResult<()>;
    async fn delete_organization(&self, realm: &str, alias: &str) -> AdminResult<()>;
    async fn list_organization_identity_providers(
        &self,
        realm: &str,
        org: &str,
    ) -> AdminResult<Vec<String>>;
    async fn link_organization_identity_provider(
        &self,
        realm: &str,
        org: &str,
        alias: &str,
    ) -> AdminResult<()>;
    async fn unlink_organization_identity_provider(
        &self,
        realm: &str,
        org: &str,
        alias: &str,
    ) -> AdminResult<()>;
    /// Member user ids.
    async fn list_organization_members(&self, realm: &str, org: &str) -> AdminResult<Vec<String>>;
    async fn add_organization_member(&self, realm: &str, org: &str, user_id: &str)
        -> AdminResult<()>;
    async fn remove_organization_member(
        &self,
        realm: &str,
        org: &str,
        user_id: &str,
    ) -> AdminResult<()>;

    // Users
    async fn find_user_id(&self, realm: &str, username: &str) -> AdminResult<Option<String>>;
}
