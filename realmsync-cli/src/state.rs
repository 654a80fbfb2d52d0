//! File-backed state: the admin snapshot and the desired-state documents.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use realmsync_engine::{MemoryState, RealmDocument};
use tracing::{debug, info};

/// JSON snapshot of the remote realms, read before and written after a run.
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty server.
    pub fn load(&self) -> Result<MemoryState> {
        if !self.path.exists() {
            info!("State file {} does not exist, starting empty", self.path.display());
            return Ok(MemoryState::default());
        }
        let data = fs::read_to_string(&self.path)
            .with_context(|| format!("reading state file {}", self.path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("parsing state file {}", self.path.display()))
    }

    /// Written to a sibling temp file, then renamed into place.
    pub fn save(&self, state: &MemoryState) -> Result<()> {
        let data = serde_json::to_string_pretty(state).context("serializing state")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing state file {}", self.path.display()))?;
        debug!("Saved state to {}", self.path.display());
        Ok(())
    }
}

/// Read and parse one desired-state document. The path is its source id.
pub fn load_document(path: &Path) -> Result<RealmDocument> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading document {}", path.display()))?;
    let raw: serde_json::Value = serde_json::from_str(&data)
        .with_context(|| format!("parsing document {}", path.display()))?;
    Ok(RealmDocument::from_value(path.display().to_string(), raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use realmsync_engine::{MemoryAdmin, RealmAdmin};
    use tempfile::TempDir;

    #[test]
    fn test_missing_state_is_empty() {
        let dir = TempDir::new().unwrap();
        let state = StateFile::new(dir.path().join("state.json")).load().unwrap();
        assert!(state.realms.is_empty());
    }

    #[tokio::test]
    async fn test_state_roundtrip_through_file() {
        let dir = TempDir::new().unwrap();
        let file = StateFile::new(dir.path().join("state.json"));

        let admin = MemoryAdmin::new();
        let doc = RealmDocument::from_value(
            "inline",
            serde_json::json!({"realm": "simple", "loginTheme": "moped"}),
        )
        .unwrap();
        admin.create_realm(&doc.realm.settings).await.unwrap();
        file.save(&admin.snapshot().await).unwrap();

        let restored = MemoryAdmin::from_state(file.load().unwrap());
        let settings = restored.get_realm("simple").await.unwrap().unwrap();
        assert_eq!(settings.login_theme.as_deref(), Some("moped"));
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn test_document_source_is_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("realm.json");
        fs::write(&path, r#"{"realm": "simple"}"#).unwrap();
        let doc = load_document(&path).unwrap();
        assert_eq!(doc.source, path.display().to_string());
        assert_eq!(doc.realm.name(), "simple");
    }

    #[test]
    fn test_invalid_document_names_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{not json").unwrap();
        let err = load_document(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("broken.json"));
    }
}
