//! Persisted Hub state: settings, session snapshot and the outbox.
//!
//! Written after every mutation via an atomic replace. Writes are serialized
//! so a slower, older snapshot can never land after a newer one.

use super::outbox::OutboxItem;
use super::session::SessionSnapshot;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default)]
    pub sessions: SessionSnapshot,
    #[serde(default)]
    pub outbox: Vec<OutboxItem>,
}

pub struct StateStore {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            write_lock: Mutex::new(()),
        }
    }

    /// Store that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load the last snapshot. A missing file is an empty state; a corrupt
    /// one is an error so it is not silently overwritten.
    pub async fn load(&self) -> Result<PersistedState> {
        let Some(path) = self.path.as_deref() else {
            return Ok(PersistedState::default());
        };
        if !path.exists() {
            return Ok(PersistedState::default());
        }
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read hub state: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse hub state: {}", path.display()))
    }

    /// Take a snapshot with `snapshot` and write it. The snapshot is taken
    /// under the write lock.
    pub async fn save_with(&self, snapshot: impl FnOnce() -> PersistedState) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let state = snapshot();
        let json = serde_json::to_vec_pretty(&state).context("Failed to serialize hub state")?;
        crate::util::write_atomic(path, &json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::session::SessionTable;
    use crate::integrations::{Credentials, IntegrationKind};
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn missing_file_loads_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::at(dir.path().join("hub_state.json"));
        let state = store.load().await.unwrap();
        assert!(state.settings.is_empty());
        assert!(state.outbox.is_empty());
    }

    #[tokio::test]
    async fn saved_state_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::at(dir.path().join("hub_state.json"));

        let mut sessions = SessionTable::new();
        sessions.mark_connected(
            IntegrationKind::Bot,
            Credentials::with_token("t"),
            None,
            Utc::now(),
        );
        let mut settings = Map::new();
        settings.insert("mailing_delay".into(), json!(5));

        store
            .save_with(|| PersistedState {
                settings,
                sessions: sessions.snapshot(),
                outbox: vec![OutboxItem::new(IntegrationKind::Sms, "7999", "hi")],
            })
            .await
            .unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.settings["mailing_delay"], 5);
        assert_eq!(loaded.outbox.len(), 1);
        let bot = &loaded.sessions[&IntegrationKind::Bot];
        assert!(bot.connected);
        assert_eq!(bot.credentials.as_ref().unwrap().token.as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub_state.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(StateStore::at(path).load().await.is_err());
    }
}
