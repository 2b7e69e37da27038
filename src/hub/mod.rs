//! Background coordinator owning every integration session.
//!
//! All mutable Hub state lives in one [`HubState`] behind a mutex that is
//! never held across an await. Handlers capture what they need (credentials,
//! session generation), release the lock, await the external call, then
//! re-lock and revalidate before applying anything.

pub mod cache;
pub mod origin;
pub mod outbox;
pub mod retry;
mod router;
pub mod scheduler;
pub mod session;
pub mod store;

pub use cache::ResponseCache;
pub use origin::OriginPolicy;
pub use outbox::{Outbox, OutboxItem};
pub use session::{IntegrationSession, SessionTable};
pub use store::{PersistedState, StateStore};

use crate::channel::{Channel, ChannelEnd};
use crate::config::{Config, SchedulerConfig};
use crate::integrations::{AgentLink, Integration, IntegrationKind};
use crate::protocol::{Envelope, Event, EventKind, OperateRequest, RelayError};
use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything the Hub mutates.
pub struct HubState {
    pub sessions: SessionTable,
    pub cache: ResponseCache,
    pub settings: Map<String, Value>,
    pub outbox: Outbox,
}

impl HubState {
    fn persisted(&self) -> PersistedState {
        PersistedState {
            settings: self.settings.clone(),
            sessions: self.sessions.snapshot(),
            outbox: self.outbox.snapshot(),
        }
    }
}

struct PageLink {
    id: u64,
    sender: Arc<dyn Channel>,
}

struct HubInner {
    state: Mutex<HubState>,
    integrations: HashMap<IntegrationKind, Arc<dyn Integration>>,
    agent: Arc<AgentLink>,
    origins: OriginPolicy,
    store: StateStore,
    pages: Mutex<Vec<PageLink>>,
    next_page: AtomicU64,
    scheduler: SchedulerConfig,
    shutdown: CancellationToken,
}

/// Result of one outbox pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub requeued: usize,
    pub deferred: usize,
    pub dropped: usize,
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Build a Hub over the given adapters, restoring persisted state from
    /// `store`. Restored sessions start disconnected.
    pub async fn new(
        config: &Config,
        integrations: Vec<Arc<dyn Integration>>,
        agent: Arc<AgentLink>,
        store: StateStore,
    ) -> Result<Self> {
        let persisted = store.load().await?;
        let restored = persisted
            .sessions
            .values()
            .filter(|s| s.credentials.is_some())
            .count();

        let state = HubState {
            sessions: SessionTable::restore(persisted.sessions),
            cache: ResponseCache::new(config.cache.max_age(), config.cache.max_entries),
            settings: persisted.settings,
            outbox: Outbox::from_items(persisted.outbox),
        };
        tracing::info!(
            restored_sessions = restored,
            outbox = state.outbox.len(),
            "Hub state loaded"
        );

        Ok(Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(state),
                integrations: integrations
                    .into_iter()
                    .map(|integration| (integration.kind(), integration))
                    .collect(),
                agent,
                origins: OriginPolicy::new(&config.hub.allowed_origins),
                store,
                pages: Mutex::new(Vec::new()),
                next_page: AtomicU64::new(1),
                scheduler: config.scheduler.clone(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn scheduler_config(&self) -> &SchedulerConfig {
        &self.inner.scheduler
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn agent_link(&self) -> &Arc<AgentLink> {
        &self.inner.agent
    }

    pub fn is_connected(&self, kind: IntegrationKind) -> bool {
        self.inner.state.lock().sessions.is_connected(kind)
    }

    pub fn session(&self, kind: IntegrationKind) -> Option<IntegrationSession> {
        self.inner.state.lock().sessions.get(kind).cloned()
    }

    pub fn cache_len(&self) -> usize {
        self.inner.state.lock().cache.len()
    }

    pub fn outbox_len(&self) -> usize {
        self.inner.state.lock().outbox.len()
    }

    pub fn page_count(&self) -> usize {
        self.inner.pages.lock().len()
    }

    fn integration(&self, kind: IntegrationKind) -> Result<Arc<dyn Integration>, RelayError> {
        self.inner
            .integrations
            .get(&kind)
            .cloned()
            .ok_or_else(|| RelayError::InvalidRequest(format!("integration `{kind}` is not configured")))
    }

    pub fn status(&self) -> Value {
        let pages = self.page_count();
        let state = self.inner.state.lock();
        json!({
            "sessions": state.sessions.status(),
            "cache_entries": state.cache.len(),
            "outbox_pending": state.outbox.len(),
            "settings": state.settings,
            "agent_attached": self.inner.agent.is_attached(),
            "pages": pages,
        })
    }

    /// Merge a partial settings object. `null` values remove keys.
    pub(crate) fn update_settings(&self, partial: &Map<String, Value>) -> Value {
        let mut state = self.inner.state.lock();
        for (key, value) in partial {
            if value.is_null() {
                state.settings.remove(key);
            } else {
                state.settings.insert(key.clone(), value.clone());
            }
        }
        Value::Object(state.settings.clone())
    }

    pub(crate) fn clear_cache(&self) -> usize {
        self.inner.state.lock().cache.clear()
    }

    pub(crate) fn enqueue(&self, item: OutboxItem) -> usize {
        self.inner.state.lock().outbox.push(item)
    }

    fn is_origin_allowed(&self, origin: Option<&str>) -> bool {
        self.inner.origins.is_allowed(origin)
    }

    // ── Persistence ──────────────────────────────────────────────

    pub async fn persist(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .store
            .save_with(move || inner.state.lock().persisted())
            .await
    }

    /// Persist after a call-level mutation. The call already succeeded, so a
    /// failed write is logged rather than reported to the caller.
    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            tracing::warn!("Failed to persist hub state: {e:#}");
        }
    }

    // ── Events ───────────────────────────────────────────────────

    /// Push an event to every attached page, pruning links that fail.
    pub async fn broadcast(&self, event: Event) {
        let targets: Vec<(u64, Arc<dyn Channel>)> = self
            .inner
            .pages
            .lock()
            .iter()
            .map(|page| (page.id, Arc::clone(&page.sender)))
            .collect();

        let mut dead = Vec::new();
        for (id, sender) in targets {
            if let Err(e) = sender.send(Envelope::event(&event)).await {
                tracing::debug!(page = id, "Dropping page link: {e}");
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            self.inner.pages.lock().retain(|page| !dead.contains(&page.id));
        }
    }

    // ── Session operations ───────────────────────────────────────

    pub async fn connect(
        &self,
        kind: IntegrationKind,
        params: &Value,
        source_context: Option<String>,
    ) -> Result<Value, RelayError> {
        let integration = self.integration(kind)?;
        let credentials = match integration.connect(params).await {
            Ok(credentials) => credentials,
            Err(e) => {
                tracing::warn!(integration = %kind, "Handshake failed: {e}");
                return Err(e.into_relay(kind));
            }
        };

        {
            let mut state = self.inner.state.lock();
            state
                .sessions
                .mark_connected(kind, credentials, source_context, Utc::now());
            state.cache.invalidate_prefix(&ResponseCache::prefix(kind.as_str()));
        }
        tracing::info!(integration = %kind, "Integration connected");
        self.persist_logged().await;
        self.broadcast(Event::new(
            EventKind::IntegrationReady,
            json!({ "integration": kind }),
        ))
        .await;
        Ok(json!({ "integration": kind, "connected": true }))
    }

    pub async fn disconnect(&self, kind: IntegrationKind, reason: &str) -> Value {
        let was_connected = {
            let mut state = self.inner.state.lock();
            state.cache.invalidate_prefix(&ResponseCache::prefix(kind.as_str()));
            state.sessions.mark_disconnected(kind)
        };
        self.persist_logged().await;
        if was_connected {
            tracing::info!(integration = %kind, reason, "Integration disconnected");
            self.broadcast(Event::new(
                EventKind::IntegrationDisconnected,
                json!({ "integration": kind, "reason": reason }),
            ))
            .await;
        }
        json!({ "integration": kind, "connected": false })
    }

    /// Run one operation: fail fast when disconnected, serve cacheable reads
    /// from the cache, otherwise call out with one bounded refresh+retry.
    pub async fn operate(&self, request: OperateRequest) -> Result<Value, RelayError> {
        let kind = parse_integration(&request.integration)?;
        let integration = self.integration(kind)?;
        let cache_key = integration.cacheable(&request.op).then(|| match &request.cache_key {
            Some(key) => ResponseCache::scoped_key(kind.as_str(), key),
            None => ResponseCache::derive_key(kind.as_str(), &request.op, &request.args),
        });

        let (credentials, generation) = {
            let state = self.inner.state.lock();
            let Some(session) = state.sessions.get(kind).filter(|s| s.connected) else {
                return Err(RelayError::NotConnected(kind.to_string()));
            };
            if let Some(key) = cache_key.as_deref() {
                if let Some(hit) = state.cache.get(key, tokio::time::Instant::now()) {
                    tracing::debug!(integration = %kind, op = %request.op, "Cache hit");
                    return Ok(hit);
                }
            }
            (
                session.credentials.clone().unwrap_or_default(),
                session.generation(),
            )
        };

        let outcome =
            retry::operate_with_refresh(integration.as_ref(), &credentials, &request.op, &request.args)
                .await;

        let mut dirty = false;
        {
            let mut state = self.inner.state.lock();
            if let Some(fresh) = outcome.refreshed.clone() {
                if state.sessions.update_credentials_if(kind, generation, fresh) {
                    dirty = true;
                } else {
                    tracing::debug!(
                        integration = %kind,
                        "Session changed during operation, discarding refreshed credentials"
                    );
                }
            }
            if let Ok(ref value) = outcome.result {
                dirty |= state.sessions.touch_if(kind, generation, Utc::now());
                if !state.sessions.is_current(kind, generation) {
                    tracing::debug!(
                        integration = %kind,
                        "Session changed during operation, not caching the reply"
                    );
                } else if let Some(key) = cache_key {
                    state
                        .cache
                        .insert(key, value.clone(), tokio::time::Instant::now());
                } else {
                    // A write may have changed what cached reads would return.
                    state.cache.invalidate_prefix(&ResponseCache::prefix(kind.as_str()));
                }
            }
        }
        if dirty {
            self.persist_logged().await;
        }

        if outcome.credential_expired() {
            self.broadcast(Event::new(
                EventKind::CredentialExpired,
                json!({ "integration": kind }),
            ))
            .await;
        }
        outcome.result.map_err(|e| e.into_relay(kind))
    }

    /// Try once to re-verify each restored session's stored credentials.
    pub async fn reconnect_restored(&self) -> usize {
        let candidates = self.inner.state.lock().sessions.restorable();
        let mut reconnected = 0;
        for (kind, credentials, generation) in candidates {
            let Ok(integration) = self.integration(kind) else {
                continue;
            };
            if !integration.health_check(&credentials).await {
                tracing::info!(integration = %kind, "Restored session did not verify");
                continue;
            }
            let promoted = self
                .inner
                .state
                .lock()
                .sessions
                .promote_if(kind, generation, Utc::now());
            if promoted {
                reconnected += 1;
                tracing::info!(integration = %kind, "Restored session reconnected");
                self.broadcast(Event::new(
                    EventKind::IntegrationReady,
                    json!({ "integration": kind, "restored": true }),
                ))
                .await;
            }
        }
        if reconnected > 0 {
            self.persist_logged().await;
        }
        reconnected
    }

    // ── Periodic work ────────────────────────────────────────────

    /// Re-validate every connected session; demote those whose probe fails.
    pub async fn health_sweep(&self) -> Result<usize> {
        let targets = self.inner.state.lock().sessions.connected();
        let mut demoted = 0;
        for (kind, credentials, generation) in targets {
            let Ok(integration) = self.integration(kind) else {
                continue;
            };
            if integration.health_check(&credentials).await {
                continue;
            }
            let changed = self.inner.state.lock().sessions.demote_if(kind, generation);
            if changed {
                demoted += 1;
                tracing::warn!(integration = %kind, "Health check failed, session demoted");
                self.broadcast(Event::new(
                    EventKind::IntegrationDisconnected,
                    json!({ "integration": kind, "reason": "health check failed" }),
                ))
                .await;
            }
        }
        if demoted > 0 {
            self.persist().await?;
        }
        Ok(demoted)
    }

    pub fn cache_sweep(&self) -> usize {
        let evicted = self
            .inner
            .state
            .lock()
            .cache
            .sweep(tokio::time::Instant::now());
        if evicted > 0 {
            tracing::debug!(evicted, "Cache sweep");
        }
        evicted
    }

    /// Deliver what is in the outbox right now, one item at a time with
    /// `item_delay` between deliveries. Items for disconnected integrations
    /// are deferred without using up an attempt.
    pub async fn drain_outbox(&self, item_delay: Duration, max_attempts: u32) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let pass = self.inner.state.lock().outbox.len();
        if pass == 0 {
            return Ok(report);
        }

        let mut sent_any = false;
        for _ in 0..pass {
            let Some(item) = self.inner.state.lock().outbox.pop() else {
                break;
            };
            if !self.is_connected(item.integration) {
                self.inner.state.lock().outbox.push(item);
                report.deferred += 1;
                continue;
            }

            if sent_any {
                tokio::time::sleep(item_delay).await;
            }
            sent_any = true;

            let result = self
                .operate(OperateRequest {
                    integration: item.integration.to_string(),
                    op: "send".into(),
                    args: item.send_args(),
                    cache_key: None,
                })
                .await;

            match result {
                Ok(_) => {
                    report.delivered += 1;
                    tracing::debug!(id = %item.id, integration = %item.integration, "Outbox item delivered");
                }
                Err(e) => {
                    let dropped = self
                        .inner
                        .state
                        .lock()
                        .outbox
                        .retry_or_drop(item, max_attempts);
                    match dropped {
                        None => report.requeued += 1,
                        Some(item) => {
                            report.dropped += 1;
                            tracing::warn!(
                                id = %item.id,
                                integration = %item.integration,
                                attempts = item.attempts,
                                "Outbox item dropped: {e}"
                            );
                            self.broadcast(Event::new(
                                EventKind::GenericError,
                                json!({
                                    "source": "outbox",
                                    "id": item.id,
                                    "integration": item.integration,
                                    "recipient": item.recipient,
                                    "error": e.to_string(),
                                }),
                            ))
                            .await;
                        }
                    }
                }
            }
        }

        if report.delivered + report.requeued + report.dropped > 0 {
            self.persist().await?;
        }
        Ok(report)
    }

    // ── Links ────────────────────────────────────────────────────

    /// Serve a page connection: every call is handled on its own task and
    /// answered with a response envelope; events are fanned out to it.
    ///
    /// `origin` is what the transport vouches for (the peer address of a
    /// socket, or the embedder's name for an in-process link). It replaces
    /// whatever origin the page stamps on its calls.
    pub fn attach_page(&self, end: ChannelEnd, origin: impl Into<String>) -> JoinHandle<()> {
        let origin = origin.into();
        let id = self.inner.next_page.fetch_add(1, Ordering::Relaxed);
        self.inner.pages.lock().push(PageLink {
            id,
            sender: Arc::clone(&end.sender),
        });
        tracing::info!(page = id, link = end.sender.name(), %origin, "Page attached");
        tokio::spawn(self.clone().serve_page(id, origin, end))
    }

    async fn serve_page(self, id: u64, origin: String, end: ChannelEnd) {
        let ChannelEnd { sender, mut inbox } = end;
        loop {
            let envelope = tokio::select! {
                () = self.inner.shutdown.cancelled() => break,
                received = inbox.recv() => received,
            };
            let Some(mut envelope) = envelope else { break };

            let Some(correlation_id) = envelope.correlation_id.clone() else {
                tracing::debug!(kind = %envelope.kind, "Ignoring uncorrelated envelope from page");
                continue;
            };
            if envelope.origin.as_deref().is_some_and(|claimed| claimed != origin) {
                tracing::debug!(
                    page = id,
                    claimed = ?envelope.origin,
                    %origin,
                    "Page claimed a different origin than its link"
                );
            }
            envelope.origin = Some(origin.clone());
            let hub = self.clone();
            let sender = Arc::clone(&sender);
            tokio::spawn(async move {
                let result = hub.handle(&envelope).await;
                if let Err(ref e) = result {
                    tracing::debug!(kind = %envelope.kind, correlation_id = %correlation_id, "Call failed: {e}");
                }
                if let Err(e) = sender.send(Envelope::response(correlation_id, &result)).await {
                    tracing::debug!("Response undeliverable: {e}");
                }
            });
        }
        self.inner.pages.lock().retain(|page| page.id != id);
        tracing::info!(page = id, "Page detached");
    }

    /// Serve the Agent link. Replaces any previously attached Agent.
    pub fn attach_agent(&self, end: ChannelEnd) -> JoinHandle<()> {
        let token = self.inner.agent.attach(Arc::clone(&end.sender));
        tracing::info!(link = end.sender.name(), "Agent attached");
        tokio::spawn(self.clone().serve_agent(token, end.sender, end.inbox))
    }

    async fn serve_agent(
        self,
        token: u64,
        sender: Arc<dyn Channel>,
        mut inbox: mpsc::Receiver<Envelope>,
    ) {
        loop {
            let envelope = tokio::select! {
                () = self.inner.shutdown.cancelled() => return,
                received = inbox.recv() => received,
            };
            let Some(envelope) = envelope else { break };

            if envelope.is_response() {
                self.inner.agent.resolve(envelope);
            } else if let Some(event) = envelope.to_event() {
                let hub = self.clone();
                tokio::spawn(async move { hub.on_agent_event(event).await });
            } else if let Some(id) = envelope.correlation_id.clone() {
                let refused = Err(RelayError::UnknownRequest(envelope.kind.clone()));
                let _ = sender.send(Envelope::response(id, &refused)).await;
            }
        }

        if let Some(rejected) = self.inner.agent.detach(token) {
            tracing::info!(rejected, "Agent link closed");
            self.disconnect(IntegrationKind::Chat, "agent link closed").await;
        }
    }

    async fn on_agent_event(&self, event: Event) {
        match event.event {
            EventKind::IntegrationReady => {
                if self.is_connected(IntegrationKind::Chat) {
                    return;
                }
                if let Err(e) = self
                    .connect(IntegrationKind::Chat, &event.data, Some("agent".into()))
                    .await
                {
                    tracing::warn!("Chat handshake after agent ready failed: {e}");
                }
            }
            EventKind::IntegrationDisconnected => {
                let reason = event
                    .data
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("agent reported disconnect")
                    .to_string();
                self.disconnect(IntegrationKind::Chat, &reason).await;
            }
            _ => self.broadcast(event).await,
        }
    }
}

pub(crate) fn parse_integration(name: &str) -> Result<IntegrationKind, RelayError> {
    IntegrationKind::parse(name.trim())
        .ok_or_else(|| RelayError::InvalidRequest(format!("unknown integration `{name}`")))
}
