//! TCP link carrying one JSON envelope per line.
//!
//! Two flavours share the line codec:
//! - [`accept`] wraps an already-connected stream (Hub side). The link dies
//!   with the stream.
//! - [`dial`] returns a channel that (re)connects lazily on send, so a Bridge
//!   probing on its fixed interval picks the Hub back up after a restart.

use super::traits::{Channel, ChannelEnd};
use crate::protocol::{Envelope, RelayError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

const INBOX_CAPACITY: usize = 256;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

struct Connection {
    id: u64,
    writer: OwnedWriteHalf,
}

type SharedWriter = Arc<Mutex<Option<Connection>>>;

async fn write_line(writer: &mut OwnedWriteHalf, envelope: &Envelope) -> Result<(), RelayError> {
    let mut line = serde_json::to_string(envelope)
        .map_err(|e| RelayError::TransportFailure(format!("encode failed: {e}")))?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| RelayError::TransportFailure(e.to_string()))
}

/// Register a freshly split stream and start its reader.
fn install(
    name: &str,
    stream: TcpStream,
    inbox: mpsc::Sender<Envelope>,
    shared: &SharedWriter,
) -> Connection {
    let (reader, writer) = stream.into_split();
    let id = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
    spawn_reader(name.to_string(), id, reader, inbox, Arc::clone(shared));
    Connection { id, writer }
}

/// Pump lines from `reader` into `inbox` until EOF, then clear the writer of
/// the same connection so the next send notices the link is gone.
fn spawn_reader(
    name: String,
    connection_id: u64,
    reader: OwnedReadHalf,
    inbox: mpsc::Sender<Envelope>,
    writer: SharedWriter,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Envelope>(&line) {
                        Ok(envelope) => {
                            if inbox.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::debug!(link = %name, "Skipping malformed envelope: {e}"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(link = %name, "Read failed: {e}");
                    break;
                }
            }
        }
        let mut guard = writer.lock().await;
        if guard.as_ref().is_some_and(|c| c.id == connection_id) {
            guard.take();
        }
        drop(guard);
        tracing::debug!(link = %name, "Link reader stopped");
    });
}

/// Channel over a stream accepted by a listener.
pub struct StreamChannel {
    name: String,
    writer: SharedWriter,
}

#[async_trait]
impl Channel for StreamChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: Envelope) -> Result<(), RelayError> {
        let mut guard = self.writer.lock().await;
        let Some(connection) = guard.as_mut() else {
            return Err(RelayError::TransportFailure(format!(
                "link `{}` is closed",
                self.name
            )));
        };
        let result = write_line(&mut connection.writer, &envelope).await;
        if result.is_err() {
            guard.take();
        }
        result
    }
}

pub fn accept(name: impl Into<String>, stream: TcpStream) -> ChannelEnd {
    let name = name.into();
    let writer: SharedWriter = Arc::new(Mutex::new(None));
    let (inbox_tx, inbox) = mpsc::channel(INBOX_CAPACITY);
    let connection = install(&name, stream, inbox_tx, &writer);
    if let Ok(mut guard) = writer.try_lock() {
        *guard = Some(connection);
    }
    ChannelEnd::new(Arc::new(StreamChannel { name, writer }), inbox)
}

/// Channel that dials `addr` whenever it has no live connection.
pub struct DialingChannel {
    name: String,
    addr: String,
    writer: SharedWriter,
    inbox_tx: mpsc::Sender<Envelope>,
}

#[async_trait]
impl Channel for DialingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: Envelope) -> Result<(), RelayError> {
        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
                RelayError::TransportFailure(format!("connect {} failed: {e}", self.addr))
            })?;
            *guard = Some(install(
                &self.name,
                stream,
                self.inbox_tx.clone(),
                &self.writer,
            ));
            tracing::debug!(link = %self.name, addr = %self.addr, "Link connected");
        }
        let Some(connection) = guard.as_mut() else {
            return Err(RelayError::TransportFailure("link closed".into()));
        };
        let result = write_line(&mut connection.writer, &envelope).await;
        if result.is_err() {
            guard.take();
        }
        result
    }
}

pub fn dial(name: impl Into<String>, addr: impl Into<String>) -> ChannelEnd {
    let (inbox_tx, inbox) = mpsc::channel(INBOX_CAPACITY);
    ChannelEnd::new(
        Arc::new(DialingChannel {
            name: name.into(),
            addr: addr.into(),
            writer: Arc::new(Mutex::new(None)),
            inbox_tx,
        }),
        inbox,
    )
}
