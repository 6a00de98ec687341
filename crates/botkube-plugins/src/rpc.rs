//! Agent side of the JSON-lines RPC connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::{
    ExecuteInput, ExecuteOutput, Executor, Metadata, Source, SourceEvent, StreamInput,
};
use crate::error::{PluginError, PluginResult};
use crate::protocol::{Frame, Reply, Request, method};

/// Buffered events per stream; further events are dropped until the
/// consumer catches up.
const STREAM_BUFFER: usize = 64;

/// Longest frame accepted from a plugin. A longer line closes the connection.
pub const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

enum Pending {
    Call {
        method: &'static str,
        tx: oneshot::Sender<PluginResult<Value>>,
    },
    Stream(mpsc::Sender<SourceEvent>),
}

#[derive(Default)]
struct PendingTable {
    closed: bool,
    entries: HashMap<u64, Pending>,
}

/// A multiplexed request/response connection to one plugin process.
pub struct RpcConnection {
    label: String,
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Arc<Mutex<PendingTable>>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConnection")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl RpcConnection {
    /// Wrap the plugin's stdout (`reader`) and stdin (`writer`).
    ///
    /// A background task routes incoming frames; when the reader hits EOF,
    /// every pending call fails with [`PluginError::ConnectionClosed`].
    pub fn new<R, W>(reader: R, writer: W, label: impl Into<String>) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_frame_limit(reader, writer, label, MAX_FRAME_LEN)
    }

    /// Like [`Self::new`], closing the connection on frames longer than
    /// `max_frame` bytes.
    pub fn with_frame_limit<R, W>(
        reader: R,
        writer: W,
        label: impl Into<String>,
        max_frame: u64,
    ) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let label = label.into();
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let reader = tokio::spawn(read_frames(
            reader,
            Arc::clone(&pending),
            label.clone(),
            max_frame,
        ));

        Self {
            label,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(1),
            reader,
        }
    }

    /// Call `method` and deserialize its result.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Rpc`] if the plugin answers with an error, or
    /// [`PluginError::ConnectionClosed`] if the plugin goes away.
    pub async fn call<P, R>(&self, method: &'static str, params: &P) -> PluginResult<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let (tx, rx) = oneshot::channel();
        let id = self.register(Pending::Call { method, tx })?;
        self.send(id, method, params).await?;
        let value = rx.await.map_err(|_| PluginError::ConnectionClosed)??;
        Ok(serde_json::from_value(value)?)
    }

    /// Start a stream; events arrive on the returned channel until the
    /// plugin ends the stream or the connection closes.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ConnectionClosed`] if the plugin is gone.
    pub async fn stream<P>(
        &self,
        method: &'static str,
        params: &P,
    ) -> PluginResult<mpsc::Receiver<SourceEvent>>
    where
        P: Serialize + ?Sized,
    {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let id = self.register(Pending::Stream(tx))?;
        self.send(id, method, params).await?;
        Ok(rx)
    }

    fn register(&self, entry: Pending) -> PluginResult<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut table = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if table.closed {
            return Err(PluginError::ConnectionClosed);
        }
        table.entries.insert(id, entry);
        Ok(id)
    }

    async fn send<P>(&self, id: u64, method: &str, params: &P) -> PluginResult<()>
    where
        P: Serialize + ?Sized,
    {
        let request = Request {
            id,
            method: method.to_owned(),
            params: serde_json::to_value(params)?,
        };
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        let mut written = writer.write_all(&line).await;
        if written.is_ok() {
            written = writer.flush().await;
        }

        if let Err(e) = written {
            debug!(plugin = %self.label, error = %e, "failed to write request");
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entries
                .remove(&id);
            return Err(PluginError::ConnectionClosed);
        }
        Ok(())
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_frames<R>(
    mut reader: R,
    pending: Arc<Mutex<PendingTable>>,
    label: String,
    max_frame: u64,
) where
    R: AsyncBufRead + Send + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match (&mut reader).take(max_frame).read_line(&mut line).await {
            Ok(0) => break,
            Ok(read) => {
                if !line.ends_with('\n') && u64::try_from(read).unwrap_or(u64::MAX) >= max_frame {
                    warn!(plugin = %label, max_frame, "plugin frame too long, closing connection");
                    break;
                }
            },
            Err(e) => {
                debug!(plugin = %label, error = %e, "plugin stdout read failed");
                break;
            },
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let frame: Frame = match serde_json::from_str(trimmed) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(plugin = %label, error = %e, "ignoring malformed frame from plugin");
                continue;
            },
        };
        dispatch(&pending, &label, frame);
    }

    let drained = {
        let mut table = pending.lock().unwrap_or_else(PoisonError::into_inner);
        table.closed = true;
        std::mem::take(&mut table.entries)
    };
    debug!(plugin = %label, pending = drained.len(), "plugin connection closed");
    for (_, entry) in drained {
        if let Pending::Call { tx, .. } = entry {
            let _ = tx.send(Err(PluginError::ConnectionClosed));
        }
    }
}

/// Route one frame. Never waits on a consumer, so a stalled stream cannot
/// hold up replies to other requests.
fn dispatch(pending: &Mutex<PendingTable>, label: &str, frame: Frame) {
    let (id, reply) = frame.into_reply();

    if let Reply::Event(payload) = reply {
        let mut table = pending.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(Pending::Stream(sender)) = table.entries.get(&id) else {
            debug!(plugin = %label, id, "event for unknown stream");
            return;
        };
        match sender.try_send(SourceEvent { payload }) {
            Ok(()) => {},
            Err(TrySendError::Full(_)) => {
                warn!(plugin = %label, id, "stream consumer is behind, dropping event");
            },
            Err(TrySendError::Closed(_)) => {
                debug!(plugin = %label, id, "stream receiver dropped");
                table.entries.remove(&id);
            },
        }
        return;
    }

    let entry = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .entries
        .remove(&id);
    match (entry, reply) {
        (Some(Pending::Call { tx, .. }), Reply::Result(value)) => {
            let _ = tx.send(Ok(value));
        },
        (Some(Pending::Call { method, tx }), Reply::Error(message)) => {
            let _ = tx.send(Err(PluginError::Rpc {
                method: method.to_owned(),
                message,
            }));
        },
        (Some(Pending::Stream(_)), Reply::Error(message)) => {
            warn!(plugin = %label, id, error = %message, "plugin ended stream with an error");
        },
        (Some(Pending::Stream(_)), _) => {
            debug!(plugin = %label, id, "plugin ended stream");
        },
        (None, _) | (Some(Pending::Call { .. }), Reply::Event(_)) => {
            debug!(plugin = %label, id, "reply for unknown request");
        },
    }
}

/// [`Executor`] over an RPC connection.
#[derive(Debug)]
pub struct RpcExecutor {
    conn: RpcConnection,
}

impl RpcExecutor {
    /// Wrap a connection.
    #[must_use]
    pub fn new(conn: RpcConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Executor for RpcExecutor {
    async fn execute(&self, input: ExecuteInput) -> PluginResult<ExecuteOutput> {
        self.conn.call(method::EXECUTE, &input).await
    }

    async fn metadata(&self) -> PluginResult<Metadata> {
        self.conn.call(method::METADATA, &Value::Null).await
    }
}

/// [`Source`] over an RPC connection.
#[derive(Debug)]
pub struct RpcSource {
    conn: RpcConnection,
}

impl RpcSource {
    /// Wrap a connection.
    #[must_use]
    pub fn new(conn: RpcConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Source for RpcSource {
    async fn stream(&self, input: StreamInput) -> PluginResult<mpsc::Receiver<SourceEvent>> {
        self.conn.stream(method::STREAM, &input).await
    }

    async fn metadata(&self) -> PluginResult<Metadata> {
        self.conn.call(method::METADATA, &Value::Null).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::io::{BufReader, DuplexStream, duplex};

    use super::*;

    /// Connection plus the plugin's end of the pipes.
    fn connect() -> (RpcConnection, BufReader<DuplexStream>, DuplexStream) {
        let (agent_out, plugin_in) = duplex(4096);
        let (plugin_out, agent_in) = duplex(4096);
        let conn = RpcConnection::new(BufReader::new(agent_in), agent_out, "test");
        (conn, BufReader::new(plugin_in), plugin_out)
    }

    async fn next_request(reader: &mut BufReader<DuplexStream>) -> Request {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn reply(writer: &mut DuplexStream, frame: &Frame) {
        let mut line = serde_json::to_vec(frame).unwrap();
        line.push(b'\n');
        writer.write_all(&line).await.unwrap();
    }

    #[tokio::test]
    async fn call_round_trip() {
        let (conn, mut plugin_in, mut plugin_out) = connect();
        let executor = RpcExecutor::new(conn);

        let plugin = tokio::spawn(async move {
            let request = next_request(&mut plugin_in).await;
            assert_eq!(request.method, method::EXECUTE);
            assert_eq!(request.params["command"], "get pods");
            reply(
                &mut plugin_out,
                &Frame::result(request.id, json!({"data": "pod-a"})),
            )
            .await;
            (plugin_in, plugin_out)
        });

        let out = executor
            .execute(ExecuteInput {
                command: "get pods".into(),
                configs: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(out.data, "pod-a");
        let _pipes = plugin.await.unwrap();
    }

    #[tokio::test]
    async fn error_reply_is_surfaced() {
        let (conn, mut plugin_in, mut plugin_out) = connect();
        let plugin = tokio::spawn(async move {
            let request = next_request(&mut plugin_in).await;
            reply(&mut plugin_out, &Frame::error(request.id, "no such command")).await;
            (plugin_in, plugin_out)
        });

        let err = conn
            .call::<_, Value>(method::EXECUTE, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Rpc { ref message, .. } if message == "no such command"));
        let _pipes = plugin.await.unwrap();
    }

    #[tokio::test]
    async fn stream_delivers_events_until_end() {
        let (conn, mut plugin_in, mut plugin_out) = connect();
        let source = RpcSource::new(conn);

        let plugin = tokio::spawn(async move {
            let request = next_request(&mut plugin_in).await;
            assert_eq!(request.method, method::STREAM);
            for n in 0..3 {
                reply(&mut plugin_out, &Frame::event(request.id, json!({"n": n}))).await;
            }
            reply(&mut plugin_out, &Frame::result(request.id, Value::Null)).await;
            (plugin_in, plugin_out)
        });

        let mut events = source.stream(StreamInput::default()).await.unwrap();
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event.payload["n"].as_i64().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2]);
        let _pipes = plugin.await.unwrap();
    }

    #[tokio::test]
    async fn eof_fails_pending_calls() {
        let (conn, mut plugin_in, plugin_out) = connect();
        let plugin = tokio::spawn(async move {
            let _request = next_request(&mut plugin_in).await;
            // The plugin dies without answering.
            drop(plugin_out);
            plugin_in
        });

        let err = conn
            .call::<_, Value>(method::METADATA, &Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::ConnectionClosed));
        let _pipe = plugin.await.unwrap();

        let err = conn
            .call::<_, Value>(method::METADATA, &Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::ConnectionClosed));
    }

    #[tokio::test]
    async fn stalled_stream_does_not_block_replies() {
        let (conn, mut plugin_in, mut plugin_out) = connect();

        let plugin = tokio::spawn(async move {
            let stream = next_request(&mut plugin_in).await;
            let call = next_request(&mut plugin_in).await;
            for n in 0..STREAM_BUFFER + 8 {
                reply(&mut plugin_out, &Frame::event(stream.id, json!({"n": n}))).await;
            }
            reply(
                &mut plugin_out,
                &Frame::result(call.id, json!({"description": "still answering"})),
            )
            .await;
            (plugin_in, plugin_out)
        });

        // Nobody reads the stream.
        let events = conn.stream(method::STREAM, &Value::Null).await.unwrap();
        let metadata: Metadata = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            conn.call(method::METADATA, &Value::Null),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(metadata.description, "still answering");
        assert_eq!(events.len(), STREAM_BUFFER);
        let _pipes = plugin.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_frame_closes_the_connection() {
        let (agent_out, plugin_in) = duplex(4096);
        let (mut plugin_out, agent_in) = duplex(4096);
        let conn = RpcConnection::with_frame_limit(BufReader::new(agent_in), agent_out, "test", 64);
        let mut plugin_in = BufReader::new(plugin_in);

        let plugin = tokio::spawn(async move {
            let request = next_request(&mut plugin_in).await;
            let padding = "x".repeat(256);
            reply(
                &mut plugin_out,
                &Frame::result(request.id, json!({ "description": padding })),
            )
            .await;
            (plugin_in, plugin_out)
        });

        let err = conn
            .call::<_, Metadata>(method::METADATA, &Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::ConnectionClosed), "{err}");
        let _pipes = plugin.await.unwrap();
    }
}
