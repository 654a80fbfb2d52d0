//! In-memory admin backend.
//!
//! Implements [`RealmAdmin`] over a serializable snapshot. Used by tests and by
//! the CLI's file-backed state. Every write is appended to a log so callers can
//! assert exactly which calls a pass made. It can also pretend some features
//! are missing and delay group visibility after creation.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::admin::{AdminResult, RealmAdmin};
use crate::error::AdminError;
use crate::model::{
    AuthenticationFlow, Client, ClientScope, Component, ExecutionConfig, Grantee, Group,
    IdentityProvider, IdentityProviderMapper, MappingSpace, Organization, ProtocolMapper,
    RealmSettings, Role, RoleComposites, RoleScope, ScopeMapping, Workflow,
};

/// Server features that may be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Feature {
    Workflows,
    Organizations,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredComponent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub component: Component,
}

/// Everything stored for one realm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealmState {
    pub settings: RealmSettings,
    pub client_scopes: Vec<ClientScope>,
    pub clients: Vec<Client>,
    pub realm_roles: Vec<Role>,
    pub client_roles: BTreeMap<String, Vec<Role>>,
    pub groups: Vec<Group>,
    pub default_groups: Vec<String>,
    pub scope_mappings: Vec<ScopeMapping>,
    pub client_scope_mappings: BTreeMap<String, Vec<ScopeMapping>>,
    pub identity_providers: Vec<IdentityProvider>,
    pub identity_provider_mappers: Vec<IdentityProviderMapper>,
    pub flows: Vec<AuthenticationFlow>,
    pub authenticator_configs: Vec<ExecutionConfig>,
    pub components: Vec<StoredComponent>,
    pub messages: BTreeMap<String, BTreeMap<String, String>>,
    pub workflows: Vec<Workflow>,
    pub organizations: Vec<Organization>,
    /// Username -> user id.
    pub users: BTreeMap<String, String>,
}

/// Serializable snapshot of every realm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryState {
    #[serde(default)]
    pub realms: BTreeMap<String, RealmState>,
}

#[derive(Default)]
struct Inner {
    state: MemoryState,
    write_log: Vec<String>,
    /// Remaining lookups for which a new group stays invisible, by "realm:path".
    pending_groups: BTreeMap<String, u32>,
}

pub struct MemoryAdmin {
    inner: Mutex<Inner>,
    unsupported: BTreeSet<Feature>,
    group_visibility_lag: u32,
}

impl Default for MemoryAdmin {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(what: impl Into<String>) -> AdminError {
    AdminError::NotFound(what.into())
}

fn conflict(what: impl Into<String>) -> AdminError {
    AdminError::Conflict(what.into())
}

impl Inner {
    fn realm(&self, realm: &str) -> AdminResult<&RealmState> {
        self.state
            .realms
            .get(realm)
            .ok_or_else(|| not_found(format!("realm {}", realm)))
    }

    /// Mutable realm access that logs the write.
    fn write(&mut self, realm: &str, call: String) -> AdminResult<&mut RealmState> {
        if !self.state.realms.contains_key(realm) {
            return Err(not_found(format!("realm {}", realm)));
        }
        self.write_log.push(call);
        self.state
            .realms
            .get_mut(realm)
            .ok_or_else(|| not_found(format!("realm {}", realm)))
    }
}

fn roles_mut<'a>(state: &'a mut RealmState, scope: &RoleScope) -> AdminResult<&'a mut Vec<Role>> {
    match scope {
        RoleScope::Realm => Ok(&mut state.realm_roles),
        RoleScope::Client(client_id) => {
            if !state.clients.iter().any(|c| &c.client_id == client_id) {
                return Err(not_found(format!("client {}", client_id)));
            }
            Ok(state.client_roles.entry(client_id.clone()).or_default())
        }
    }
}

fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn find_group<'a>(groups: &'a [Group], segments: &[&str]) -> Option<&'a Group> {
    let (first, rest) = segments.split_first()?;
    let group = groups.iter().find(|g| g.name == *first)?;
    if rest.is_empty() {
        Some(group)
    } else {
        find_group(group.sub_groups.as_deref().unwrap_or_default(), rest)
    }
}

fn find_group_mut<'a>(groups: &'a mut [Group], segments: &[&str]) -> Option<&'a mut Group> {
    let (first, rest) = segments.split_first()?;
    let group = groups.iter_mut().find(|g| g.name == *first)?;
    if rest.is_empty() {
        Some(group)
    } else {
        find_group_mut(group.sub_groups.get_or_insert_with(Vec::new), rest)
    }
}

fn add_unique(target: &mut Vec<String>, values: &[String]) {
    for value in values {
        if !target.contains(value) {
            target.push(value.clone());
        }
    }
}

fn mappings_mut<'a>(
    state: &'a mut RealmState,
    space: &MappingSpace,
) -> AdminResult<&'a mut Vec<ScopeMapping>> {
    match space {
        MappingSpace::RealmRoles => Ok(&mut state.scope_mappings),
        MappingSpace::ClientRoles(client_id) => {
            if !state.clients.iter().any(|c| &c.client_id == client_id) {
                return Err(not_found(format!("client {}", client_id)));
            }
            Ok(state
                .client_scope_mappings
                .entry(client_id.clone())
                .or_default())
        }
    }
}

fn component_descendants(components: &[StoredComponent], id: &str) -> BTreeSet<String> {
    let mut found = BTreeSet::from([id.to_string()]);
    loop {
        let before = found.len();
        for stored in components {
            if let (Some(parent), Some(child)) = (&stored.parent, &stored.component.id) {
                if found.contains(parent) {
                    found.insert(child.clone());
                }
            }
        }
        if found.len() == before {
            return found;
        }
    }
}

impl MemoryAdmin {
    pub fn new() -> Self {
        Self::from_state(MemoryState::default())
    }

    pub fn from_state(state: MemoryState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                ..Default::default()
            }),
            unsupported: BTreeSet::new(),
            group_visibility_lag: 0,
        }
    }

    /// Make every call for `feature` fail as unsupported.
    pub fn without_feature(mut self, feature: Feature) -> Self {
        self.unsupported.insert(feature);
        self
    }

    /// New groups stay invisible to `find_group_by_path` for `lookups` calls.
    pub fn with_group_visibility_lag(mut self, lookups: u32) -> Self {
        self.group_visibility_lag = lookups;
        self
    }

    pub async fn snapshot(&self) -> MemoryState {
        self.inner.lock().await.state.clone()
    }

    pub async fn realm_state(&self, realm: &str) -> Option<RealmState> {
        self.inner.lock().await.state.realms.get(realm).cloned()
    }

    /// Register a user so organization members can be resolved.
    pub async fn add_user(&self, realm: &str, username: &str) -> AdminResult<String> {
        let mut inner = self.inner.lock().await;
        let state = inner
            .state
            .realms
            .get_mut(realm)
            .ok_or_else(|| not_found(format!("realm {}", realm)))?;
        let id = state
            .users
            .entry(username.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string());
        Ok(id.clone())
    }

    pub async fn write_log(&self) -> Vec<String> {
        self.inner.lock().await.write_log.clone()
    }

    pub async fn writes(&self) -> usize {
        self.inner.lock().await.write_log.len()
    }

    pub async fn clear_write_log(&self) {
        self.inner.lock().await.write_log.clear();
    }

    fn require(&self, feature: Feature) -> AdminResult<()> {
        if self.unsupported.contains(&feature) {
            return Err(AdminError::Unsupported(format!("{:?}", feature).to_lowercase()));
        }
        Ok(())
    }
}

#[async_trait]
impl RealmAdmin for MemoryAdmin {
    // -------------------------------------------------------------------------
    // Realm
    // -------------------------------------------------------------------------

    async fn get_realm(&self, realm: &str) -> AdminResult<Option<RealmSettings>> {
        let inner = self.inner.lock().await;
        Ok(inner.state.realms.get(realm).map(|r| r.settings.clone()))
    }

    async fn create_realm(&self, settings: &RealmSettings) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state.realms.contains_key(&settings.realm) {
            return Err(conflict(format!("realm {}", settings.realm)));
        }
        inner.write_log.push(format!("create_realm {}", settings.realm));
        inner.state.realms.insert(
            settings.realm.clone(),
            RealmState {
                settings: settings.clone(),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn update_realm(&self, settings: &RealmSettings) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(&settings.realm, format!("update_realm {}", settings.realm))?;
        state.settings = settings.clone();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Client scopes
    // -------------------------------------------------------------------------

    async fn list_client_scopes(&self, realm: &str) -> AdminResult<Vec<ClientScope>> {
        let inner = self.inner.lock().await;
        Ok(inner.realm(realm)?.client_scopes.clone())
    }

    async fn create_client_scope(&self, realm: &str, scope: &ClientScope) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.realm(realm)?.client_scopes.iter().any(|s| s.name == scope.name) {
            return Err(conflict(format!("client scope {}", scope.name)));
        }
        let state = inner.write(realm, format!("create_client_scope {}", scope.name))?;
        state.client_scopes.push(ClientScope {
            protocol_mappers: Some(Vec::new()),
            ..scope.clone()
        });
        Ok(())
    }

    async fn update_client_scope(&self, realm: &str, scope: &ClientScope) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("update_client_scope {}", scope.name))?;
        let existing = state
            .client_scopes
            .iter_mut()
            .find(|s| s.name == scope.name)
            .ok_or_else(|| not_found(format!("client scope {}", scope.name)))?;
        let mappers = existing.protocol_mappers.take();
        *existing = ClientScope {
            protocol_mappers: mappers,
            ..scope.clone()
        };
        Ok(())
    }

    async fn delete_client_scope(&self, realm: &str, name: &str) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("delete_client_scope {}", name))?;
        state.client_scopes.retain(|s| s.name != name);
        Ok(())
    }

    async fn create_protocol_mapper(
        &self,
        realm: &str,
        scope: &str,
        mapper: &ProtocolMapper,
    ) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(
            realm,
            format!("create_protocol_mapper {}/{}", scope, mapper.name),
        )?;
        let owner = state
            .client_scopes
            .iter_mut()
            .find(|s| s.name == scope)
            .ok_or_else(|| not_found(format!("client scope {}", scope)))?;
        let mappers = owner.protocol_mappers.get_or_insert_with(Vec::new);
        if mappers.iter().any(|m| m.name == mapper.name) {
            return Err(conflict(format!("protocol mapper {}", mapper.name)));
        }
        mappers.push(mapper.clone());
        Ok(())
    }

    async fn update_protocol_mapper(
        &self,
        realm: &str,
        scope: &str,
        mapper: &ProtocolMapper,
    ) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(
            realm,
            format!("update_protocol_mapper {}/{}", scope, mapper.name),
        )?;
        let existing = state
            .client_scopes
            .iter_mut()
            .find(|s| s.name == scope)
            .and_then(|s| s.protocol_mappers.as_mut())
            .and_then(|mappers| mappers.iter_mut().find(|m| m.name == mapper.name))
            .ok_or_else(|| not_found(format!("protocol mapper {}/{}", scope, mapper.name)))?;
        *existing = mapper.clone();
        Ok(())
    }

    async fn delete_protocol_mapper(
        &self,
        realm: &str,
        scope: &str,
        name: &str,
    ) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("delete_protocol_mapper {}/{}", scope, name))?;
        if let Some(mappers) = state
            .client_scopes
            .iter_mut()
            .find(|s| s.name == scope)
            .and_then(|s| s.protocol_mappers.as_mut())
        {
            mappers.retain(|m| m.name != name);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Clients
    // -------------------------------------------------------------------------

    async fn list_clients(&self, realm: &str) -> AdminResult<Vec<Client>> {
        let inner = self.inner.lock().await;
        Ok(inner.realm(realm)?.clients.clone())
    }

    async fn create_client(&self, realm: &str, client: &Client) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        if inner
            .realm(realm)?
            .clients
            .iter()
            .any(|c| c.client_id == client.client_id)
        {
            return Err(conflict(format!("client {}", client.client_id)));
        }
        let state = inner.write(realm, format!("create_client {}", client.client_id))?;
        state.clients.push(Client {
            id: Some(Uuid::new_v4().to_string()),
            ..client.clone()
        });
        Ok(())
    }

    async fn update_client(&self, realm: &str, client: &Client) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("update_client {}", client.client_id))?;
        let existing = state
            .clients
            .iter_mut()
            .find(|c| c.client_id == client.client_id)
            .ok_or_else(|| not_found(format!("client {}", client.client_id)))?;
        let id = existing.id.take();
        *existing = Client {
            id,
            ..client.clone()
        };
        Ok(())
    }

    async fn delete_client(&self, realm: &str, client_id: &str) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("delete_client {}", client_id))?;
        state.clients.retain(|c| c.client_id != client_id);
        state.client_roles.remove(client_id);
        state.client_scope_mappings.remove(client_id);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Roles
    // -------------------------------------------------------------------------

    async fn list_roles(&self, realm: &str, scope: &RoleScope) -> AdminResult<Vec<Role>> {
        let inner = self.inner.lock().await;
        let state = inner.realm(realm)?;
        match scope {
            RoleScope::Realm => Ok(state.realm_roles.clone()),
            RoleScope::Client(client_id) => {
                if !state.clients.iter().any(|c| &c.client_id == client_id) {
                    return Err(not_found(format!("client {}", client_id)));
                }
                Ok(state.client_roles.get(client_id).cloned().unwrap_or_default())
            }
        }
    }

    async fn create_role(&self, realm: &str, scope: &RoleScope, role: &Role) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("create_role {}/{}", scope, role.name))?;
        let roles = roles_mut(state, scope)?;
        if roles.iter().any(|r| r.name == role.name) {
            return Err(conflict(format!("role {}", role.name)));
        }
        roles.push(Role {
            composites: None,
            ..role.clone()
        });
        Ok(())
    }

    async fn update_role(&self, realm: &str, scope: &RoleScope, role: &Role) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("update_role {}/{}", scope, role.name))?;
        let existing = roles_mut(state, scope)?
            .iter_mut()
            .find(|r| r.name == role.name)
            .ok_or_else(|| not_found(format!("role {}", role.name)))?;
        let composites = existing.composites.take();
        *existing = Role {
            composites,
            ..role.clone()
        };
        Ok(())
    }

    async fn delete_role(&self, realm: &str, scope: &RoleScope, name: &str) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("delete_role {}/{}", scope, name))?;
        roles_mut(state, scope)?.retain(|r| r.name != name);
        Ok(())
    }

    async fn add_composites(
        &self,
        realm: &str,
        scope: &RoleScope,
        role: &str,
        members: &RoleComposites,
    ) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("add_composites {}/{}", scope, role))?;
        let existing = roles_mut(state, scope)?
            .iter_mut()
            .find(|r| r.name == role)
            .ok_or_else(|| not_found(format!("role {}", role)))?;
        let composites = existing.composites.get_or_insert_with(RoleComposites::default);
        if let Some(realm_members) = &members.realm {
            add_unique(composites.realm.get_or_insert_with(Vec::new), realm_members);
        }
        if let Some(client_members) = &members.client {
            let target = composites.client.get_or_insert_with(BTreeMap::new);
            for (client_id, names) in client_members {
                add_unique(target.entry(client_id.clone()).or_default(), names);
            }
        }
        Ok(())
    }

    async fn remove_composites(
        &self,
        realm: &str,
        scope: &RoleScope,
        role: &str,
        members: &RoleComposites,
    ) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("remove_composites {}/{}", scope, role))?;
        let existing = roles_mut(state, scope)?
            .iter_mut()
            .find(|r| r.name == role)
            .ok_or_else(|| not_found(format!("role {}", role)))?;
        let Some(composites) = existing.composites.as_mut() else {
            return Ok(());
        };
        if let (Some(current), Some(remove)) = (composites.realm.as_mut(), &members.realm) {
            current.retain(|name| !remove.contains(name));
        }
        if let (Some(current), Some(remove)) = (composites.client.as_mut(), &members.client) {
            for (client_id, names) in remove {
                if let Some(held) = current.get_mut(client_id) {
                    held.retain(|name| !names.contains(name));
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Groups
    // -------------------------------------------------------------------------

    async fn list_groups(&self, realm: &str) -> AdminResult<Vec<Group>> {
        let inner = self.inner.lock().await;
        Ok(inner.realm(realm)?.groups.clone())
    }

    async fn find_group_by_path(&self, realm: &str, path: &str) -> AdminResult<Option<Group>> {
        let mut inner = self.inner.lock().await;
        let pending_key = format!("{}:{}", realm, path);
        if let Some(remaining) = inner.pending_groups.get_mut(&pending_key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(None);
            }
            inner.pending_groups.remove(&pending_key);
        }
        let state = inner.realm(realm)?;
        Ok(find_group(&state.groups, &path_segments(path)).cloned())
    }

    async fn create_group(
        &self,
        realm: &str,
        parent: Option<&str>,
        group: &Group,
    ) -> AdminResult<()> {
        let path = crate::model::group_path(parent, &group.name);
        let lag = self.group_visibility_lag;
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("create_group {}", path))?;
        let siblings = match parent {
            None => &mut state.groups,
            Some(parent_path) => find_group_mut(&mut state.groups, &path_segments(parent_path))
                .ok_or_else(|| not_found(format!("group {}", parent_path)))?
                .sub_groups
                .get_or_insert_with(Vec::new),
        };
        if siblings.iter().any(|g| g.name == group.name) {
            return Err(conflict(format!("group {}", path)));
        }
        siblings.push(Group {
            sub_groups: Some(Vec::new()),
            ..group.shallow()
        });
        if lag > 0 {
            inner.pending_groups.insert(format!("{}:{}", realm, path), lag);
        }
        Ok(())
    }

    async fn update_group(&self, realm: &str, path: &str, group: &Group) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("update_group {}", path))?;
        let existing = find_group_mut(&mut state.groups, &path_segments(path))
            .ok_or_else(|| not_found(format!("group {}", path)))?;
        let children = existing.sub_groups.take();
        *existing = Group {
            sub_groups: children,
            ..group.shallow()
        };
        Ok(())
    }

    async fn delete_group(&self, realm: &str, path: &str) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("delete_group {}", path))?;
        let segments = path_segments(path);
        let Some((name, parent)) = segments.split_last() else {
            return Err(not_found(format!("group {}", path)));
        };
        if parent.is_empty() {
            state.groups.retain(|g| g.name != *name);
        } else if let Some(owner) = find_group_mut(&mut state.groups, parent) {
            if let Some(children) = owner.sub_groups.as_mut() {
                children.retain(|g| g.name != *name);
            }
        }
        let prefix = format!("{}/", path);
        state
            .default_groups
            .retain(|p| p != path && !p.starts_with(&prefix));
        Ok(())
    }

    async fn list_default_groups(&self, realm: &str) -> AdminResult<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.realm(realm)?.default_groups.clone())
    }

    async fn add_default_group(&self, realm: &str, path: &str) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        if find_group(&inner.realm(realm)?.groups, &path_segments(path)).is_none() {
            return Err(not_found(format!("group {}", path)));
        }
        let state = inner.write(realm, format!("add_default_group {}", path))?;
        add_unique(&mut state.default_groups, &[path.to_string()]);
        Ok(())
    }

    async fn remove_default_group(&self, realm: &str, path: &str) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("remove_default_group {}", path))?;
        state.default_groups.retain(|p| p != path);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Scope mappings
    // -------------------------------------------------------------------------

    async fn list_scope_mappings(
        &self,
        realm: &str,
        space: &MappingSpace,
    ) -> AdminResult<Vec<ScopeMapping>> {
        let inner = self.inner.lock().await;
        let state = inner.realm(realm)?;
        Ok(match space {
            MappingSpace::RealmRoles => state.scope_mappings.clone(),
            MappingSpace::ClientRoles(client_id) => state
                .client_scope_mappings
                .get(client_id)
                .cloned()
                .unwrap_or_default(),
        })
    }

    async fn add_scope_mapping_roles(
        &self,
        realm: &str,
        space: &MappingSpace,
        grantee: &Grantee,
        roles: &[String],
    ) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("add_scope_mapping {:?} {}", space, grantee))?;
        let grantee_exists = match grantee {
            Grantee::Client(name) => state.clients.iter().any(|c| &c.client_id == name),
            Grantee::ClientScope(name) => state.client_scopes.iter().any(|s| &s.name == name),
        };
        if !grantee_exists {
            return Err(not_found(grantee.to_string()));
        }
        let mappings = mappings_mut(state, space)?;
        let existing = mappings.iter_mut().find(|m| m.grantee().as_ref() == Some(grantee));
        match existing {
            Some(mapping) => add_unique(&mut mapping.roles, roles),
            None => {
                let (client, client_scope) = match grantee {
                    Grantee::Client(name) => (Some(name.clone()), None),
                    Grantee::ClientScope(name) => (None, Some(name.clone())),
                };
                mappings.push(ScopeMapping {
                    client,
                    client_scope,
                    roles: roles.to_vec(),
                });
            }
        }
        Ok(())
    }

    async fn remove_scope_mapping_roles(
        &self,
        realm: &str,
        space: &MappingSpace,
        grantee: &Grantee,
        roles: &[String],
    ) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("remove_scope_mapping {:?} {}", space, grantee))?;
        let mappings = mappings_mut(state, space)?;
        for mapping in mappings.iter_mut() {
            if mapping.grantee().as_ref() == Some(grantee) {
                mapping.roles.retain(|r| !roles.contains(r));
            }
        }
        mappings.retain(|m| !m.roles.is_empty());
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Identity providers
    // -------------------------------------------------------------------------

    async fn list_identity_providers(&self, realm: &str) -> AdminResult<Vec<IdentityProvider>> {
        let inner = self.inner.lock().await;
        Ok(inner.realm(realm)?.identity_providers.clone())
    }

    async fn create_identity_provider(
        &self,
        realm: &str,
        idp: &IdentityProvider,
    ) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        if inner
            .realm(realm)?
            .identity_providers
            .iter()
            .any(|i| i.alias == idp.alias)
        {
            return Err(conflict(format!("identity provider {}", idp.alias)));
        }
        let state = inner.write(realm, format!("create_identity_provider {}", idp.alias))?;
        state.identity_providers.push(idp.clone());
        Ok(())
    }

    async fn update_identity_provider(
        &self,
        realm: &str,
        idp: &IdentityProvider,
    ) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("update_identity_provider {}", idp.alias))?;
        let existing = state
            .identity_providers
            .iter_mut()
            .find(|i| i.alias == idp.alias)
            .ok_or_else(|| not_found(format!("identity provider {}", idp.alias)))?;
        *existing = idp.clone();
        Ok(())
    }

    async fn delete_identity_provider(&self, realm: &str, alias: &str) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("delete_identity_provider {}", alias))?;
        state.identity_providers.retain(|i| i.alias != alias);
        state
            .identity_provider_mappers
            .retain(|m| m.identity_provider_alias != alias);
        Ok(())
    }

    async fn list_identity_provider_mappers(
        &self,
        realm: &str,
    ) -> AdminResult<Vec<IdentityProviderMapper>> {
        let inner = self.inner.lock().await;
        Ok(inner.realm(realm)?.identity_provider_mappers.clone())
    }

    async fn create_identity_provider_mapper(
        &self,
        realm: &str,
        mapper: &IdentityProviderMapper,
    ) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(
            realm,
            format!(
                "create_identity_provider_mapper {}/{}",
                mapper.identity_provider_alias, mapper.name
            ),
        )?;
        if !state
            .identity_providers
            .iter()
            .any(|i| i.alias == mapper.identity_provider_alias)
        {
            return Err(not_found(format!(
                "identity provider {}",
                mapper.identity_provider_alias
            )));
        }
        state.identity_provider_mappers.push(mapper.clone());
        Ok(())
    }

    async fn update_identity_provider_mapper(
        &self,
        realm: &str,
        mapper: &IdentityProviderMapper,
    ) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(
            realm,
            format!(
                "update_identity_provider_mapper {}/{}",
                mapper.identity_provider_alias, mapper.name
            ),
        )?;
        let existing = state
            .identity_provider_mappers
            .iter_mut()
            .find(|m| {
                m.identity_provider_alias == mapper.identity_provider_alias
                    && m.name == mapper.name
            })
            .ok_or_else(|| not_found(format!("identity provider mapper {}", mapper.name)))?;
        *existing = mapper.clone();
        Ok(())
    }

    async fn delete_identity_provider_mapper(
        &self,
        realm: &str,
        alias: &str,
        name: &str,
    ) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(
            realm,
            format!("delete_identity_provider_mapper {}/{}", alias, name),
        )?;
        state
            .identity_provider_mappers
            .retain(|m| !(m.identity_provider_alias == alias && m.name == name));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Authentication
    // -------------------------------------------------------------------------

    async fn list_flows(&self, realm: &str) -> AdminResult<Vec<AuthenticationFlow>> {
        let inner = self.inner.lock().await;
        Ok(inner.realm(realm)?.flows.clone())
    }

    async fn create_flow(&self, realm: &str, flow: &AuthenticationFlow) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.realm(realm)?.flows.iter().any(|f| f.alias == flow.alias) {
            return Err(conflict(format!("flow {}", flow.alias)));
        }
        let state = inner.write(realm, format!("create_flow {}", flow.alias))?;
        state.flows.push(flow.clone());
        Ok(())
    }

    async fn update_flow(&self, realm: &str, flow: &AuthenticationFlow) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("update_flow {}", flow.alias))?;
        let existing = state
            .flows
            .iter_mut()
            .find(|f| f.alias == flow.alias)
            .ok_or_else(|| not_found(format!("flow {}", flow.alias)))?;
        *existing = flow.clone();
        Ok(())
    }

    async fn delete_flow(&self, realm: &str, alias: &str) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("delete_flow {}", alias))?;
        if state.flows.iter().any(|f| f.alias == alias && f.built_in) {
            return Err(conflict(format!("flow {} is built in", alias)));
        }
        state.flows.retain(|f| f.alias != alias);
        state.authenticator_configs.retain(|c| c.flow_alias != alias);
        Ok(())
    }

    async fn list_authenticator_configs(&self, realm: &str) -> AdminResult<Vec<ExecutionConfig>> {
        let inner = self.inner.lock().await;
        Ok(inner.realm(realm)?.authenticator_configs.clone())
    }

    async fn create_authenticator_config(
        &self,
        realm: &str,
        config: &ExecutionConfig,
    ) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(
            realm,
            format!(
                "create_authenticator_config {}/{}/{}",
                config.flow_alias, config.execution, config.config.alias
            ),
        )?;
        let flow = state
            .flows
            .iter()
            .find(|f| f.alias == config.flow_alias)
            .ok_or_else(|| not_found(format!("flow {}", config.flow_alias)))?;
        if !flow
            .authentication_executions
            .iter()
            .any(|e| e.provider() == config.execution)
        {
            return Err(not_found(format!(
                "execution {} in flow {}",
                config.execution, config.flow_alias
            )));
        }
        state.authenticator_configs.push(config.clone());
        Ok(())
    }

    async fn update_authenticator_config(
        &self,
        realm: &str,
        config: &ExecutionConfig,
    ) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(
            realm,
            format!(
                "update_authenticator_config {}/{}/{}",
                config.flow_alias, config.execution, config.config.alias
            ),
        )?;
        let existing = state
            .authenticator_configs
            .iter_mut()
            .find(|c| {
                c.flow_alias == config.flow_alias
                    && c.execution == config.execution
                    && c.config.alias == config.config.alias
            })
            .ok_or_else(|| not_found(format!("authenticator config {}", config.config.alias)))?;
        *existing = config.clone();
        Ok(())
    }

    async fn delete_authenticator_config(
        &self,
        realm: &str,
        config: &ExecutionConfig,
    ) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(
            realm,
            format!(
                "delete_authenticator_config {}/{}/{}",
                config.flow_alias, config.execution, config.config.alias
            ),
        )?;
        state.authenticator_configs.retain(|c| {
            !(c.flow_alias == config.flow_alias
                && c.execution == config.execution
                && c.config.alias == config.config.alias)
        });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Components
    // -------------------------------------------------------------------------

    async fn list_components(
        &self,
        realm: &str,
        parent: Option<&str>,
    ) -> AdminResult<Vec<Component>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .realm(realm)?
            .components
            .iter()
            .filter(|stored| stored.parent.as_deref() == parent)
            .map(|stored| stored.component.clone())
            .collect())
    }

    async fn create_component(
        &self,
        realm: &str,
        parent: Option<&str>,
        component: &Component,
    ) -> AdminResult<String> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("create_component {}", component.name))?;
        if let Some(parent_id) = parent {
            let exists = state
                .components
                .iter()
                .any(|s| s.component.id.as_deref() == Some(parent_id));
            if !exists {
                return Err(not_found(format!("component {}", parent_id)));
            }
        }
        let id = Uuid::new_v4().to_string();
        state.components.push(StoredComponent {
            parent: parent.map(str::to_string),
            component: Component {
                id: Some(id.clone()),
                sub_components: None,
                ..component.clone()
            },
        });
        Ok(id)
    }

    async fn update_component(&self, realm: &str, component: &Component) -> AdminResult<()> {
        let id = component
            .id
            .clone()
            .ok_or_else(|| not_found(format!("component {} without id", component.name)))?;
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("update_component {}", component.name))?;
        let existing = state
            .components
            .iter_mut()
            .find(|s| s.component.id.as_deref() == Some(id.as_str()))
            .ok_or_else(|| not_found(format!("component {}", id)))?;
        existing.component = Component {
            sub_components: None,
            ..component.clone()
        };
        Ok(())
    }

    async fn delete_component(&self, realm: &str, id: &str) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("delete_component {}", id))?;
        let doomed = component_descendants(&state.components, id);
        state.components.retain(|s| {
            s.component
                .id
                .as_ref()
                .map(|cid| !doomed.contains(cid))
                .unwrap_or(true)
        });
        Ok(())
    }

    async fn trigger_federation_sync(&self, realm: &str, component_id: &str) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        inner.write(realm, format!("sync_federation {}", component_id))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Message bundles
    // -------------------------------------------------------------------------

    async fn list_message_locales(&self, realm: &str) -> AdminResult<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.realm(realm)?.messages.keys().cloned().collect())
    }

    async fn get_messages(
        &self,
        realm: &str,
        locale: &str,
    ) -> AdminResult<BTreeMap<String, String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .realm(realm)?
            .messages
            .get(locale)
            .cloned()
            .unwrap_or_default())
    }

    async fn put_message(
        &self,
        realm: &str,
        locale: &str,
        key: &str,
        text: &str,
    ) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("put_message {}/{}", locale, key))?;
        state
            .messages
            .entry(locale.to_string())
            .or_default()
            .insert(key.to_string(), text.to_string());
        Ok(())
    }

    async fn delete_message(&self, realm: &str, locale: &str, key: &str) -> AdminResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("delete_message {}/{}", locale, key))?;
        if let Some(bundle) = state.messages.get_mut(locale) {
            bundle.remove(key);
            if bundle.is_empty() {
                state.messages.remove(locale);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Workflows
    // -------------------------------------------------------------------------

    async fn list_workflows(&self, realm: &str) -> AdminResult<Vec<Workflow>> {
        self.require(Feature::Workflows)?;
        let inner = self.inner.lock().await;
        Ok(inner.realm(realm)?.workflows.clone())
    }

    async fn create_workflow(&self, realm: &str, workflow: &Workflow) -> AdminResult<()> {
        self.require(Feature::Workflows)?;
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("create_workflow {}", workflow.name))?;
        state.workflows.push(workflow.clone());
        Ok(())
    }

    async fn update_workflow(&self, realm: &str, workflow: &Workflow) -> AdminResult<()> {
        self.require(Feature::Workflows)?;
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("update_workflow {}", workflow.name))?;
        let existing = state
            .workflows
            .iter_mut()
            .find(|w| w.name == workflow.name)
            .ok_or_else(|| not_found(format!("workflow {}", workflow.name)))?;
        *existing = workflow.clone();
        Ok(())
    }

    async fn delete_workflow(&self, realm: &str, name: &str) -> AdminResult<()> {
        self.require(Feature::Workflows)?;
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("delete_workflow {}", name))?;
        state.workflows.retain(|w| w.name != name);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Organizations
    // -------------------------------------------------------------------------

    async fn list_organizations(&self, realm: &str) -> AdminResult<Vec<Organization>> {
        self.require(Feature::Organizations)?;
        let inner = self.inner.lock().await;
        Ok(inner
            .realm(realm)?
            .organizations
            .iter()
            .map(Organization::shallow)
            .collect())
    }

    async fn create_organization(&self, realm: &str, org: &Organization) -> AdminResult<()> {
        self.require(Feature::Organizations)?;
        let mut inner = self.inner.lock().await;
        if inner
            .realm(realm)?
            .organizations
            .iter()
            .any(|o| o.alias == org.alias)
        {
            return Err(conflict(format!("organization {}", org.alias)));
        }
        let state = inner.write(realm, format!("create_organization {}", org.alias))?;
        state.organizations.push(Organization {
            identity_providers: Some(Vec::new()),
            members: Some(Vec::new()),
            ..org.shallow()
        });
        Ok(())
    }

    async fn update_organization(&self, realm: &str, org: &Organization) -> AdminResult<()> {
        self.require(Feature::Organizations)?;
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("update_organization {}", org.alias))?;
        let existing = state
            .organizations
            .iter_mut()
            .find(|o| o.alias == org.alias)
            .ok_or_else(|| not_found(format!("organization {}", org.alias)))?;
        *existing = Organization {
            identity_providers: existing.identity_providers.take(),
            members: existing.members.take(),
            ..org.shallow()
        };
        Ok(())
    }

    async fn delete_organization(&self, realm: &str, alias: &str) -> AdminResult<()> {
        self.require(Feature::Organizations)?;
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("delete_organization {}", alias))?;
        state.organizations.retain(|o| o.alias != alias);
        Ok(())
    }

    async fn list_organization_identity_providers(
        &self,
        realm: &str,
        org: &str,
    ) -> AdminResult<Vec<String>> {
        self.require(Feature::Organizations)?;
        let inner = self.inner.lock().await;
        inner
            .realm(realm)?
            .organizations
            .iter()
            .find(|o| o.alias == org)
            .map(|o| o.identity_providers.clone().unwrap_or_default())
            .ok_or_else(|| not_found(format!("organization {}", org)))
    }

    async fn link_organization_identity_provider(
        &self,
        realm: &str,
        org: &str,
        alias: &str,
    ) -> AdminResult<()> {
        self.require(Feature::Organizations)?;
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("link_organization_idp {}/{}", org, alias))?;
        if !state.identity_providers.iter().any(|i| i.alias == alias) {
            return Err(not_found(format!("identity provider {}", alias)));
        }
        let existing = state
            .organizations
            .iter_mut()
            .find(|o| o.alias == org)
            .ok_or_else(|| not_found(format!("organization {}", org)))?;
        add_unique(
            existing.identity_providers.get_or_insert_with(Vec::new),
            &[alias.to_string()],
        );
        Ok(())
    }

    async fn unlink_organization_identity_provider(
        &self,
        realm: &str,
        org: &str,
        alias: &str,
    ) -> AdminResult<()> {
        self.require(Feature::Organizations)?;
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("unlink_organization_idp {}/{}", org, alias))?;
        if let Some(existing) = state.organizations.iter_mut().find(|o| o.alias == org) {
            if let Some(linked) = existing.identity_providers.as_mut() {
                linked.retain(|a| a != alias);
            }
        }
        Ok(())
    }

    async fn list_organization_members(&self, realm: &str, org: &str) -> AdminResult<Vec<String>> {
        self.require(Feature::Organizations)?;
        let inner = self.inner.lock().await;
        inner
            .realm(realm)?
            .organizations
            .iter()
            .find(|o| o.alias == org)
            .map(|o| o.members.clone().unwrap_or_default())
            .ok_or_else(|| not_found(format!("organization {}", org)))
    }

    async fn add_organization_member(
        &self,
        realm: &str,
        org: &str,
        user_id: &str,
    ) -> AdminResult<()> {
        self.require(Feature::Organizations)?;
        let mut inner = self.inner.lock().await;
        let state = inner.write(realm, format!("add_organization_member {}/{}", org, user_id))?;
        let existing = state
            .organizations
            .iter_mut()
            .find(|o| o.alias == org)
            .ok_or_else(|| not_found(format!("organization {}", org)))?;
        add_unique(
            existing.members.get_or_insert_with(Vec::new),
            &[user_id.to_string()],
        );
        Ok(())
    }

    async fn remove_organization_member(
        &self,
        realm: &str,
        org: &str,
        user_id: &str,
    ) -> AdminResult<()> {
        self.require(Feature::Organizations)?;
        let mut inner = self.inner.lock().await;
        let state = inner.write(
            realm,
            format!("remove_organization_member {}/{}", org, user_id),
        )?;
        if let Some(existing) = state.organizations.iter_mut().find(|o| o.alias == org) {
            if let Some(members) = existing.members.as_mut() {
                members.retain(|m| m != user_id);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------------

    async fn find_user_id(&self, realm: &str, username: &str) -> AdminResult<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.realm(realm)?.users.get(username).cloned())
    }
}
