//! Resource categories and the managed-deletion policy that governs them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Every kind of resource the engine reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Realm,
    ClientScope,
    ProtocolMapper,
    Client,
    Role,
    CompositeRole,
    Group,
    DefaultGroup,
    ScopeMapping,
    ClientScopeMapping,
    IdentityProvider,
    IdentityProviderMapper,
    AuthenticationFlow,
    AuthenticatorConfig,
    Component,
    SubComponent,
    MessageBundle,
    Workflow,
    Organization,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Realm => "realm",
            Category::ClientScope => "client-scope",
            Category::ProtocolMapper => "protocol-mapper",
            Category::Client => "client",
            Category::Role => "role",
            Category::CompositeRole => "composite-role",
            Category::Group => "group",
            Category::DefaultGroup => "default-group",
            Category::ScopeMapping => "scope-mapping",
            Category::ClientScopeMapping => "client-scope-mapping",
            Category::IdentityProvider => "identity-provider",
            Category::IdentityProviderMapper => "identity-provider-mapper",
            Category::AuthenticationFlow => "authentication-flow",
            Category::AuthenticatorConfig => "authenticator-config",
            Category::Component => "component",
            Category::SubComponent => "sub-component",
            Category::MessageBundle => "message-bundle",
            Category::Workflow => "workflow",
            Category::Organization => "organization",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown resource category '{}'", s))
    }
}

/// Whether entries absent from the desired state are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManagedPolicy {
    /// Desired state is authoritative; extra entries are deleted.
    #[default]
    Full,
    /// Creates and updates only.
    NoDelete,
    /// The category is ignored entirely.
    Unmanaged,
}

impl ManagedPolicy {
    pub fn allows_delete(&self) -> bool {
        matches!(self, ManagedPolicy::Full)
    }

    pub fn is_managed(&self) -> bool {
        !matches!(self, ManagedPolicy::Unmanaged)
    }
}

impl std::str::FromStr for ManagedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(ManagedPolicy::Full),
            "no-delete" => Ok(ManagedPolicy::NoDelete),
            "unmanaged" => Ok(ManagedPolicy::Unmanaged),
            _ => Err(format!("unknown managed policy '{}'", s)),
        }
    }
}

/// Per-category policy overrides. Categories without an entry are `Full`.
pub type ManagedConfig = BTreeMap<Category, ManagedPolicy>;

/// Resolve the deletion policy for a category.
pub fn resolve(category: Category, config: &ManagedConfig) -> ManagedPolicy {
    config.get(&category).copied().unwrap_or_default()
}
