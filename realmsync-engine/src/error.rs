//! Error types for the admin API and the reconciliation engine.

use thiserror::Error;

use crate::policy::Category;

/// Outcomes the remote admin API can report besides success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdminError {
    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Conflict with an existing resource.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The server does not implement this operation (HTTP 501 equivalent).
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Transport-level failure talking to the server.
    #[error("transport: {0}")]
    Transport(String),
}

impl AdminError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, AdminError::Unsupported(_))
    }
}

/// Errors that abort the reconciliation of one realm.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Stored fingerprint differs from the document while `on_mismatch = fail`.
    #[error(
        "{category} fingerprint of {source_id} changed for realm '{realm}' \
         (stored {stored}, computed {computed})"
    )]
    FingerprintConflict {
        realm: String,
        category: Category,
        source_id: String,
        stored: String,
        computed: String,
    },

    /// A desired entity names a dependency that does not exist.
    #[error("cannot find {missing} referenced by {category} '{entity}' in realm '{realm}'")]
    UnresolvedReference {
        realm: String,
        category: Category,
        entity: String,
        missing: String,
    },

    /// A created entity never became visible.
    #[error("{category} {entity} in realm '{realm}' not visible after {attempts} attempts")]
    ConsistencyTimeout {
        realm: String,
        category: Category,
        entity: String,
        attempts: u32,
    },

    /// A retry wait was cancelled.
    #[error("interrupted while waiting for {category} {entity} in realm '{realm}'")]
    Interrupted {
        realm: String,
        category: Category,
        entity: String,
    },

    /// The admin API rejected a call.
    #[error("{category} '{entity}' in realm '{realm}': {source}")]
    Admin {
        realm: String,
        category: Category,
        entity: String,
        #[source]
        source: AdminError,
    },

    /// The desired document does not map onto the expected shape.
    #[error("invalid document {source_id}: {message}")]
    Validation { source_id: String, message: String },
}

impl ReconcileError {
    /// The entity the failure is attributed to, if any.
    pub fn entity(&self) -> Option<&str> {
        match self {
            ReconcileError::FingerprintConflict { source_id, .. } => Some(source_id),
            ReconcileError::UnresolvedReference { entity, .. }
            | ReconcileError::ConsistencyTimeout { entity, .. }
            | ReconcileError::Interrupted { entity, .. }
            | ReconcileError::Admin { entity, .. } => Some(entity),
            ReconcileError::Validation { .. } => None,
        }
    }

    /// True when the server lacks the capability the failing call needed.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, ReconcileError::Admin { source, .. } if source.is_unsupported())
    }
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_reference_message_names_everything() {
        let err = ReconcileError::UnresolvedReference {
            realm: "simple".to_string(),
            category: Category::ScopeMapping,
            entity: "clientScope:profile".to_string(),
            missing: "client scope 'profile'".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("simple"));
        assert!(msg.contains("scope-mapping"));
        assert!(msg.contains("client scope 'profile'"));
        assert_eq!(err.entity(), Some("clientScope:profile"));
    }

    #[test]
    fn test_timeout_and_interrupt_name_category() {
        let timeout = ReconcileError::ConsistencyTimeout {
            realm: "simple".to_string(),
            category: Category::Group,
            entity: "group '/staff'".to_string(),
            attempts: 3,
        };
        let msg = timeout.to_string();
        assert!(msg.contains("group group '/staff'"), "{msg}");
        assert!(msg.contains("simple"));

        let interrupted = ReconcileError::Interrupted {
            realm: "simple".to_string(),
            category: Category::Group,
            entity: "group '/staff'".to_string(),
        };
        assert!(interrupted.to_string().contains("for group group '/staff'"));

        let conflict = ReconcileError::FingerprintConflict {
            realm: "simple".to_string(),
            category: Category::Realm,
            source_id: "a.json".to_string(),
            stored: "aa".to_string(),
            computed: "bb".to_string(),
        };
        assert!(conflict.to_string().starts_with("realm fingerprint of a.json"));
    }

    #[test]
    fn test_admin_error_unsupported() {
        assert!(AdminError::Unsupported("workflows".into()).is_unsupported());
        assert!(!AdminError::NotFound("x".into()).is_unsupported());
    }
}
