//! Pending-call table keyed by correlation id.
//!
//! Each registered call owns a oneshot completion and a timer task. Whoever
//! removes the entry from the table first (response, timeout or teardown)
//! completes it; everyone else finds nothing and does nothing. That makes
//! completion exactly-once without any further bookkeeping.

use crate::protocol::{IdSource, RelayError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

type Completion = oneshot::Sender<Result<Value, RelayError>>;

/// One outstanding call.
pub struct PendingRequest {
    pub correlation_id: String,
    pub kind: String,
    pub created_at: Instant,
    completion: Completion,
    timeout: Option<AbortHandle>,
}

/// Receiving side of a registered call.
pub struct PendingReply {
    correlation_id: String,
    rx: oneshot::Receiver<Result<Value, RelayError>>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub async fn wait(self) -> Result<Value, RelayError> {
        // A dropped sender means the table itself went away.
        self.rx.await.unwrap_or(Err(RelayError::ContextTornDown))
    }
}

#[derive(Clone)]
pub struct Correlator {
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
    ids: Arc<dyn IdSource>,
    timeout: Duration,
}

impl Correlator {
    pub fn new(ids: Arc<dyn IdSource>, timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            ids,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a new call under a fresh id and arm its timeout.
    pub fn register(&self, kind: &str) -> PendingReply {
        let correlation_id = self.ids.next_id();
        let (completion, rx) = oneshot::channel();

        self.pending.lock().insert(
            correlation_id.clone(),
            PendingRequest {
                correlation_id: correlation_id.clone(),
                kind: kind.to_string(),
                created_at: Instant::now(),
                completion,
                timeout: None,
            },
        );

        let table = Arc::clone(&self.pending);
        let id = correlation_id.clone();
        let budget = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            let expired = table.lock().remove(&id);
            if let Some(request) = expired {
                tracing::debug!(
                    correlation_id = %id,
                    kind = %request.kind,
                    "Pending call timed out"
                );
                let _ = request.completion.send(Err(RelayError::Timeout(budget)));
            }
        });

        // The entry may already be gone (instant reply); aborting a finished
        // timer is harmless, so only the live case needs the handle.
        match self.pending.lock().get_mut(&correlation_id) {
            Some(request) => request.timeout = Some(timer.abort_handle()),
            None => timer.abort(),
        }

        PendingReply { correlation_id, rx }
    }

    /// Complete the call registered under `correlation_id`.
    ///
    /// Returns `false` for unknown ids: never issued here, already timed out,
    /// or already answered.
    pub fn resolve(&self, correlation_id: &str, result: Result<Value, RelayError>) -> bool {
        let Some(request) = self.pending.lock().remove(correlation_id) else {
            tracing::debug!(correlation_id, "Ignoring reply for unknown correlation id");
            return false;
        };
        if let Some(timer) = request.timeout {
            timer.abort();
        }
        let _ = request.completion.send(result);
        true
    }

    /// Drop a call whose envelope never left this context.
    pub fn cancel(&self, correlation_id: &str, error: RelayError) -> bool {
        self.resolve(correlation_id, Err(error))
    }

    /// Reject everything outstanding, e.g. because this context is ending.
    pub fn reject_all(&self, error: &RelayError) -> usize {
        let drained: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, r)| r).collect();
        let count = drained.len();
        for request in drained {
            if let Some(timer) = request.timeout {
                timer.abort();
            }
            let _ = request.completion.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.pending.lock().contains_key(correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SequentialIdSource;
    use serde_json::json;

    fn correlator(timeout_secs: u64) -> Correlator {
        Correlator::new(
            Arc::new(SequentialIdSource::deterministic()),
            Duration::from_secs(timeout_secs),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_matching_id() {
        let table = correlator(30);
        let reply = table.register("ping");
        assert_eq!(reply.correlation_id(), "1");

        assert!(table.resolve("1", Ok(json!({ "pong": true }))));
        assert_eq!(reply.wait().await.unwrap(), json!({ "pong": true }));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn non_matching_id_is_a_noop() {
        let table = correlator(30);
        let _reply = table.register("ping");

        assert!(!table.resolve("999", Ok(Value::Null)));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn replies_resolve_out_of_order() {
        let table = correlator(30);
        let first = table.register("a");
        let second = table.register("b");

        assert!(table.resolve(second.correlation_id(), Ok(json!("b"))));
        assert!(table.resolve(first.correlation_id(), Ok(json!("a"))));
        assert_eq!(first.wait().await.unwrap(), json!("a"));
        assert_eq!(second.wait().await.unwrap(), json!("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_and_removes_entry() {
        let table = correlator(30);
        let reply = table.register("slow");
        let id = reply.correlation_id().to_string();

        let result = reply.wait().await;
        assert_eq!(result, Err(RelayError::Timeout(Duration::from_secs(30))));
        assert!(!table.contains(&id));

        // Late reply after the timeout already fired.
        assert!(!table.resolve(&id, Ok(Value::Null)));
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_call_is_not_timed_out_later() {
        let table = correlator(5);
        let reply = table.register("quick");
        let id = reply.correlation_id().to_string();
        assert!(table.resolve(&id, Ok(json!(1))));
        assert_eq!(reply.wait().await.unwrap(), json!(1));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reject_all_reports_teardown() {
        let table = correlator(30);
        let a = table.register("a");
        let b = table.register("b");

        assert_eq!(table.reject_all(&RelayError::ContextTornDown), 2);
        assert_eq!(a.wait().await, Err(RelayError::ContextTornDown));
        assert_eq!(b.wait().await, Err(RelayError::ContextTornDown));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_surfaces_transport_error() {
        let table = correlator(30);
        let reply = table.register("send");
        let id = reply.correlation_id().to_string();
        table.cancel(&id, RelayError::TransportFailure("gone".into()));
        assert_eq!(
            reply.wait().await,
            Err(RelayError::TransportFailure("gone".into()))
        );
    }
}
