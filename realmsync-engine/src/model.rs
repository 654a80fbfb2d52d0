//! Realm representations shared by desired documents and the admin API.
//!
//! Field names follow the identity server's JSON export format. On the
//! desired side, a `None` collection means the document does not mention it
//! and the engine leaves that part of the realm alone.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;

fn default_true() -> bool {
    true
}

fn is_false(value: &bool) -> bool {
    !*value
}

// =============================================================================
// Realm
// =============================================================================

/// Realm-level scalar settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealmSettings {
    pub realm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_theme: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl RealmSettings {
    /// Apply every field set here onto `actual`. Attributes merge key-wise.
    pub fn merged_onto(&self, actual: &RealmSettings) -> RealmSettings {
        fn pick<T: Clone>(desired: &Option<T>, actual: &Option<T>) -> Option<T> {
            desired.clone().or_else(|| actual.clone())
        }

        let mut attributes = actual.attributes.clone();
        attributes.extend(self.attributes.clone());

        RealmSettings {
            realm: actual.realm.clone(),
            enabled: pick(&self.enabled, &actual.enabled),
            display_name: pick(&self.display_name, &actual.display_name),
            login_theme: pick(&self.login_theme, &actual.login_theme),
            account_theme: pick(&self.account_theme, &actual.account_theme),
            admin_theme: pick(&self.admin_theme, &actual.admin_theme),
            email_theme: pick(&self.email_theme, &actual.email_theme),
            attributes,
        }
    }
}

// =============================================================================
// Roles
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<Vec<Role>>,
    /// Client roles keyed by owning client id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<BTreeMap<String, Vec<Role>>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Vec<String>>,
    /// `None` means the role has never been composite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composites: Option<RoleComposites>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleComposites {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<BTreeMap<String, Vec<String>>>,
}

/// Where a role lives.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RoleScope {
    Realm,
    Client(String),
}

impl fmt::Display for RoleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleScope::Realm => f.write_str("realm"),
            RoleScope::Client(client_id) => write!(f, "client '{}'", client_id),
        }
    }
}

// =============================================================================
// Clients and client scopes
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    /// Server-assigned identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub public_client: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirect_uris: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub web_origins: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_client_scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_client_scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientScope {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_mappers: Option<Vec<ProtocolMapper>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMapper {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub protocol_mapper: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

// =============================================================================
// Groups
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub realm_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub client_roles: BTreeMap<String, Vec<String>>,
    /// `None` leaves existing subgroups untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_groups: Option<Vec<Group>>,
}

impl Group {
    /// The group without its subtree.
    pub fn shallow(&self) -> Group {
        Group {
            sub_groups: None,
            ..self.clone()
        }
    }
}

/// Join a parent path and a group name into a `/`-separated path.
pub fn group_path(parent: Option<&str>, name: &str) -> String {
    match parent {
        Some(parent) => format!("{}/{}", parent, name),
        None => format!("/{}", name),
    }
}

// =============================================================================
// Scope mappings
// =============================================================================

/// One grant of roles to a client or client scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_scope: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl ScopeMapping {
    pub fn grantee(&self) -> Option<Grantee> {
        match (&self.client, &self.client_scope) {
            (Some(client), None) => Some(Grantee::Client(client.clone())),
            (None, Some(scope)) => Some(Grantee::ClientScope(scope.clone())),
            _ => None,
        }
    }
}

/// The receiving side of a scope mapping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Grantee {
    Client(String),
    ClientScope(String),
}

impl fmt::Display for Grantee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grantee::Client(name) => write!(f, "client:{}", name),
            Grantee::ClientScope(name) => write!(f, "clientScope:{}", name),
        }
    }
}

/// Which roles a scope mapping grants: realm roles, or roles of one client.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MappingSpace {
    RealmRoles,
    ClientRoles(String),
}

// =============================================================================
// Identity providers
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityProvider {
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub provider_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub trust_email: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_broker_login_flow_alias: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityProviderMapper {
    pub name: String,
    pub identity_provider_alias: String,
    pub identity_provider_mapper: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

// =============================================================================
// Authentication
// =============================================================================

fn default_flow_provider() -> String {
    "basic-flow".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationFlow {
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_flow_provider")]
    pub provider_id: String,
    #[serde(default = "default_true")]
    pub top_level: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub built_in: bool,
    #[serde(default)]
    pub authentication_executions: Vec<AuthenticationExecution>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationExecution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticator: Option<String>,
    /// Alias of the authenticator config this execution uses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticator_config: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub authenticator_flow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_alias: Option<String>,
    pub requirement: String,
    #[serde(default)]
    pub priority: i32,
}

impl AuthenticationExecution {
    /// The authenticator id, or the sub-flow alias for flow executions.
    pub fn provider(&self) -> &str {
        self.authenticator
            .as_deref()
            .or(self.flow_alias.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatorConfig {
    pub alias: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// An authenticator config bound to an execution of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    pub flow_alias: String,
    pub execution: String,
    pub config: AuthenticatorConfig,
}

// =============================================================================
// Components
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    /// Server-assigned identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub provider_id: String,
    /// Filled from the enclosing map key on the desired side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, Vec<String>>,
    /// Children keyed by provider type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_components: Option<BTreeMap<String, Vec<Component>>>,
}

pub const USER_STORAGE_PROVIDER_TYPE: &str = "org.keycloak.storage.UserStorageProvider";

// =============================================================================
// Workflows
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<WorkflowSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<WorkflowConcurrency>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSchedule {
    pub after: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub uses: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConcurrency {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_in_progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_in_progress: Option<String>,
}

// =============================================================================
// Organizations
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub alias: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<OrganizationDomain>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Vec<String>>,
    /// Linked identity provider aliases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_providers: Option<Vec<String>>,
    /// Member usernames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<String>>,
}

impl Organization {
    /// The organization without its associations.
    pub fn shallow(&self) -> Organization {
        Organization {
            identity_providers: None,
            members: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationDomain {
    pub name: String,
    #[serde(default)]
    pub verified: bool,
}

// =============================================================================
// Desired realm
// =============================================================================

/// The parsed desired state of one realm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredRealm {
    #[serde(flatten)]
    pub settings: RealmSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Roles>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients: Option<Vec<Client>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_scopes: Option<Vec<ClientScope>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<Group>>,
    /// Paths of groups every new user joins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_groups: Option<Vec<String>>,
    /// Realm-role grants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_mappings: Option<Vec<ScopeMapping>>,
    /// Client-role grants keyed by the client owning the roles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_scope_mappings: Option<BTreeMap<String, Vec<ScopeMapping>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_providers: Option<Vec<IdentityProvider>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_provider_mappers: Option<Vec<IdentityProviderMapper>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_flows: Option<Vec<AuthenticationFlow>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticator_config: Option<Vec<AuthenticatorConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<BTreeMap<String, Vec<Component>>>,
    /// Locale -> message key -> text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_bundles: Option<BTreeMap<String, BTreeMap<String, String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflows: Option<Vec<Workflow>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizations: Option<Vec<Organization>>,
}

impl DesiredRealm {
    pub fn name(&self) -> &str {
        &self.settings.realm
    }
}

/// One desired-state document as handed over by the parser.
#[derive(Debug, Clone)]
pub struct RealmDocument {
    /// Identifier of the source, usually a file path.
    pub source: String,
    /// The document as parsed; fingerprints are computed over this.
    pub raw: serde_json::Value,
    pub realm: DesiredRealm,
}

impl RealmDocument {
    /// Map a parsed document onto the realm shape.
    pub fn from_value(
        source: impl Into<String>,
        raw: serde_json::Value,
    ) -> Result<Self, ReconcileError> {
        let source = source.into();
        let realm: DesiredRealm =
            serde_json::from_value(raw.clone()).map_err(|e| ReconcileError::Validation {
                source_id: source.clone(),
                message: e.to_string(),
            })?;
        if realm.settings.realm.trim().is_empty() {
            return Err(ReconcileError::Validation {
                source_id: source,
                message: "realm name must not be empty".to_string(),
            });
        }
        Ok(Self { source, raw, realm })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_parses_export_format() {
        let raw = json!({
            "realm": "simple",
            "loginTheme": "moped",
            "roles": {
                "realm": [{"name": "admin", "composites": {"realm": ["user"]}}],
                "client": {"app": [{"name": "viewer"}]}
            },
            "clientScopeMappings": {
                "app": [{"clientScope": "profile", "roles": ["viewer"]}]
            },
            "someFutureField": {"ignored": true}
        });
        let doc = RealmDocument::from_value("a.json", raw).unwrap();
        assert_eq!(doc.realm.name(), "simple");
        assert_eq!(doc.realm.settings.login_theme.as_deref(), Some("moped"));
        let roles = doc.realm.roles.unwrap();
        let composites = roles.realm.unwrap()[0].composites.clone().unwrap();
        assert_eq!(composites.realm, Some(vec!["user".to_string()]));
        let mappings = doc.realm.client_scope_mappings.unwrap();
        assert_eq!(
            mappings["app"][0].grantee(),
            Some(Grantee::ClientScope("profile".to_string()))
        );
        assert!(doc.realm.groups.is_none());
    }

    #[test]
    fn test_document_rejects_wrong_shape() {
        let err = RealmDocument::from_value("b.json", json!({"realm": "x", "groups": "nope"}))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Validation { .. }));
        let err = RealmDocument::from_value("c.json", json!({"realm": " "})).unwrap_err();
        assert!(err.to_string().contains("c.json"));
    }

    #[test]
    fn test_realm_settings_merge() {
        let actual = RealmSettings {
            realm: "simple".to_string(),
            login_theme: Some("keycloak".to_string()),
            display_name: Some("Simple".to_string()),
            attributes: BTreeMap::from([("keep".to_string(), "1".to_string())]),
            ..Default::default()
        };
        let desired = RealmSettings {
            realm: "simple".to_string(),
            login_theme: Some("moped".to_string()),
            attributes: BTreeMap::from([("new".to_string(), "2".to_string())]),
            ..Default::default()
        };
        let merged = desired.merged_onto(&actual);
        assert_eq!(merged.login_theme.as_deref(), Some("moped"));
        assert_eq!(merged.display_name.as_deref(), Some("Simple"));
        assert_eq!(merged.attributes.len(), 2);
    }

    #[test]
    fn test_scope_mapping_grantee_requires_exactly_one() {
        let both = ScopeMapping {
            client: Some("a".into()),
            client_scope: Some("b".into()),
            roles: vec![],
        };
        assert_eq!(both.grantee(), None);
        assert_eq!(ScopeMapping::default().grantee(), None);
    }

    #[test]
    fn test_group_path() {
        assert_eq!(group_path(None, "parent"), "/parent");
        assert_eq!(group_path(Some("/parent"), "child"), "/parent/child");
    }
}
