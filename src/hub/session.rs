//! Per-integration session table.
//!
//! Every transition bumps the session's generation. Code that captures a
//! generation before an await must hand it back to the `*_if` mutators, which
//! refuse to apply once the session has moved on.

use crate::integrations::{Credentials, IntegrationKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IntegrationSession {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Which context established the session (page origin, agent link).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_context: Option<String>,
    #[serde(skip)]
    generation: u64,
}

impl IntegrationSession {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Session snapshot keyed by integration name, as persisted.
pub type SessionSnapshot = BTreeMap<IntegrationKind, IntegrationSession>;

#[derive(Debug, Clone)]
pub struct SessionTable {
    sessions: BTreeMap<IntegrationKind, IntegrationSession>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    /// Every known integration, all disconnected.
    pub fn new() -> Self {
        Self {
            sessions: IntegrationKind::ALL
                .into_iter()
                .map(|kind| (kind, IntegrationSession::default()))
                .collect(),
        }
    }

    /// Rebuild from a persisted snapshot. Credentials survive, the
    /// connected flag does not: nothing is assumed live until re-verified.
    pub fn restore(snapshot: SessionSnapshot) -> Self {
        let mut table = Self::new();
        for (kind, mut session) in snapshot {
            session.connected = false;
            session.generation = 0;
            table.sessions.insert(kind, session);
        }
        table
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.sessions.clone()
    }

    pub fn get(&self, kind: IntegrationKind) -> Option<&IntegrationSession> {
        self.sessions.get(&kind)
    }

    pub fn is_connected(&self, kind: IntegrationKind) -> bool {
        self.get(kind).is_some_and(|s| s.connected)
    }

    pub fn generation(&self, kind: IntegrationKind) -> u64 {
        self.get(kind).map_or(0, IntegrationSession::generation)
    }

    /// `true` while the session is connected and has not moved past
    /// `generation`.
    pub fn is_current(&self, kind: IntegrationKind, generation: u64) -> bool {
        self.get(kind)
            .is_some_and(|s| s.connected && s.generation == generation)
    }

    /// Connected sessions with their credentials and generation, for probing.
    pub fn connected(&self) -> Vec<(IntegrationKind, Credentials, u64)> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.connected)
            .map(|(kind, s)| (*kind, s.credentials.clone().unwrap_or_default(), s.generation))
            .collect()
    }

    /// Disconnected sessions that still hold credentials from a previous run.
    pub fn restorable(&self) -> Vec<(IntegrationKind, Credentials, u64)> {
        self.sessions
            .iter()
            .filter(|(_, s)| !s.connected)
            .filter_map(|(kind, s)| {
                s.credentials
                    .clone()
                    .map(|creds| (*kind, creds, s.generation))
            })
            .collect()
    }

    pub fn mark_connected(
        &mut self,
        kind: IntegrationKind,
        credentials: Credentials,
        source_context: Option<String>,
        now: DateTime<Utc>,
    ) -> u64 {
        let session = self.sessions.entry(kind).or_default();
        session.connected = true;
        session.credentials = Some(credentials);
        session.last_sync_at = Some(now);
        session.source_context = source_context;
        session.generation += 1;
        session.generation
    }

    /// Returns `true` when the session was connected before.
    pub fn mark_disconnected(&mut self, kind: IntegrationKind) -> bool {
        let session = self.sessions.entry(kind).or_default();
        let was_connected = session.connected;
        session.connected = false;
        session.generation += 1;
        was_connected
    }

    /// Demote only if nothing happened to the session since `generation`.
    pub fn demote_if(&mut self, kind: IntegrationKind, generation: u64) -> bool {
        match self.sessions.get(&kind) {
            Some(session) if session.generation == generation && session.connected => {
                self.mark_disconnected(kind)
            }
            _ => false,
        }
    }

    /// Promote a restored session after its credentials were re-verified.
    pub fn promote_if(
        &mut self,
        kind: IntegrationKind,
        generation: u64,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(session) = self.sessions.get_mut(&kind) else {
            return false;
        };
        if session.generation != generation || session.connected {
            return false;
        }
        session.connected = true;
        session.last_sync_at = Some(now);
        session.generation += 1;
        true
    }

    /// Replace credentials after a refresh. Keeps the generation: the session
    /// did not change state, only its token.
    pub fn update_credentials_if(
        &mut self,
        kind: IntegrationKind,
        generation: u64,
        credentials: Credentials,
    ) -> bool {
        match self.sessions.get_mut(&kind) {
            Some(session) if session.generation == generation && session.connected => {
                session.credentials = Some(credentials);
                true
            }
            _ => false,
        }
    }

    pub fn touch_if(&mut self, kind: IntegrationKind, generation: u64, now: DateTime<Utc>) -> bool {
        match self.sessions.get_mut(&kind) {
            Some(session) if session.generation == generation => {
                session.last_sync_at = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Status view for callers. Credentials never leave the Hub.
    pub fn status(&self) -> Value {
        let mut out = Map::new();
        for (kind, session) in &self.sessions {
            out.insert(
                kind.to_string(),
                json!({
                    "connected": session.connected,
                    "last_sync_at": session.last_sync_at,
                    "source_context": session.source_context,
                }),
            );
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_every_integration_disconnected() {
        let table = SessionTable::new();
        for kind in IntegrationKind::ALL {
            assert!(!table.is_connected(kind));
        }
    }

    #[test]
    fn stale_generation_cannot_demote() {
        let mut table = SessionTable::new();
        let first = table.mark_connected(
            IntegrationKind::Bot,
            Credentials::with_token("a"),
            None,
            Utc::now(),
        );
        // A reconnect lands while a probe of the old session is in flight.
        table.mark_disconnected(IntegrationKind::Bot);
        table.mark_connected(
            IntegrationKind::Bot,
            Credentials::with_token("b"),
            None,
            Utc::now(),
        );

        assert!(!table.demote_if(IntegrationKind::Bot, first));
        assert!(table.is_connected(IntegrationKind::Bot));

        let current = table.generation(IntegrationKind::Bot);
        assert!(table.demote_if(IntegrationKind::Bot, current));
        assert!(!table.is_connected(IntegrationKind::Bot));
    }

    #[test]
    fn credential_update_requires_matching_generation() {
        let mut table = SessionTable::new();
        let generation = table.mark_connected(
            IntegrationKind::Spreadsheet,
            Credentials::with_token("old"),
            None,
            Utc::now(),
        );
        assert!(table.update_credentials_if(
            IntegrationKind::Spreadsheet,
            generation,
            Credentials::with_token("new"),
        ));
        assert!(!table.update_credentials_if(
            IntegrationKind::Spreadsheet,
            generation + 1,
            Credentials::with_token("newer"),
        ));
        let session = table.get(IntegrationKind::Spreadsheet).unwrap();
        assert_eq!(session.credentials.as_ref().unwrap().token.as_deref(), Some("new"));
    }

    #[test]
    fn restore_keeps_credentials_but_not_connection() {
        let mut table = SessionTable::new();
        table.mark_connected(
            IntegrationKind::Sms,
            Credentials::with_token("key"),
            Some("app://switchboard".into()),
            Utc::now(),
        );

        let restored = SessionTable::restore(table.snapshot());
        assert!(!restored.is_connected(IntegrationKind::Sms));
        let restorable = restored.restorable();
        assert_eq!(restorable.len(), 1);
        assert_eq!(restorable[0].0, IntegrationKind::Sms);

        let mut restored = restored;
        assert!(restored.promote_if(IntegrationKind::Sms, restorable[0].2, Utc::now()));
        assert!(restored.is_connected(IntegrationKind::Sms));
    }

    #[test]
    fn status_hides_credentials() {
        let mut table = SessionTable::new();
        table.mark_connected(
            IntegrationKind::Bot,
            Credentials::with_token("secret"),
            None,
            Utc::now(),
        );
        let status = table.status().to_string();
        assert!(!status.contains("secret"));
        assert!(status.contains("\"connected\":true"));
    }
}
