//! One client connection: frame reading, dispatch, and event forwarding.

use crate::protocol::{Request, RequestFrame, ServerMessage, SessionParams};
use anyhow::{bail, Context, Result};
use collections::FxHashMap;
use serde_json::{json, Value};
use settings::constants::rpc::MAX_FRAME_BYTES;
use std::sync::Arc;
use terminal::{Subscription, SubscriptionGuard, TerminalManager};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Chunk size used while skipping the rest of an oversized frame.
const DISCARD_CHUNK: u64 = 8192;

/// A subscription plus the task copying its events to the client.
struct Forwarder {
    guard: SubscriptionGuard,
    task: JoinHandle<()>,
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.task.abort();
        tracing::trace!(
            session_id = self.guard.session_id(),
            subscriber = self.guard.id(),
            "Stopped forwarding"
        );
    }
}

enum Reply {
    Value(Value),
    Subscribed(Subscription),
}

/// Per-client state. Dropping it drops every subscription it created.
pub struct Connection {
    id: Uuid,
    manager: Arc<TerminalManager>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    forwarders: FxHashMap<String, Vec<Forwarder>>,
}

impl Connection {
    pub fn new(manager: Arc<TerminalManager>, outbound: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            manager,
            outbound,
            forwarders: FxHashMap::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Subscriptions this connection holds for `session_id`.
    pub fn subscription_count(&self, session_id: &str) -> usize {
        self.forwarders.get(session_id).map_or(0, Vec::len)
    }

    /// Handle one inbound frame and queue its response.
    ///
    /// Must be called from within a tokio runtime. Frames from one client are
    /// handled one at a time, so responses keep request order.
    pub async fn handle_frame(&mut self, line: &[u8]) {
        let frame: RequestFrame = match serde_json::from_slice(line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(conn_id = %self.id, "Malformed frame: {}", e);
                self.send(ServerMessage::error(Value::Null, format!("malformed frame: {}", e)));
                return;
            }
        };
        let request_id = frame.request_id.clone();
        let request = match Request::from_frame(frame) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(conn_id = %self.id, "Rejected request: {:#}", e);
                self.send(ServerMessage::error(request_id, format!("{:#}", e)));
                return;
            }
        };

        match self.dispatch(request).await {
            Ok(Reply::Value(result)) => self.send(ServerMessage::result(request_id, result)),
            Ok(Reply::Subscribed(subscription)) => {
                // Reply first so the client sees the ack before any event.
                self.send(ServerMessage::result(
                    request_id,
                    json!({ "subscriberId": subscription.id() }),
                ));
                self.start_forwarding(subscription);
            }
            Err(e) => {
                tracing::warn!(conn_id = %self.id, "Request failed: {:#}", e);
                self.send(ServerMessage::error(request_id, format!("{:#}", e)));
            }
        }
    }

    /// Tell the client its frame was too large to read.
    pub fn reject_oversized(&self) {
        tracing::warn!(conn_id = %self.id, "Dropped frame over {} bytes", MAX_FRAME_BYTES);
        self.send(ServerMessage::error(
            Value::Null,
            format!("frame exceeds {} bytes", MAX_FRAME_BYTES),
        ));
    }

    async fn dispatch(&mut self, request: Request) -> Result<Reply> {
        match request {
            Request::Subscribe(SessionParams { id }) => {
                Ok(Reply::Subscribed(self.manager.subscribe(&id)))
            }
            Request::Detach(SessionParams { id }) => Ok(Reply::Value(json!(self.detach(&id)))),
            request => {
                // Spawns, PTY writes and spool reads block; keep them off the runtime.
                let manager = self.manager.clone();
                let value = tokio::task::spawn_blocking(move || call_manager(&manager, request))
                    .await
                    .context("Manager call panicked")??;
                Ok(Reply::Value(value))
            }
        }
    }

    fn start_forwarding(&mut self, subscription: Subscription) {
        let (guard, mut receiver) = subscription.into_parts();
        let session_id = guard.session_id().to_string();
        let outbound = self.outbound.clone();
        let event_session_id = session_id.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if outbound
                    .send(ServerMessage::event(event_session_id.clone(), event))
                    .is_err()
                {
                    break;
                }
            }
        });

        tracing::debug!(conn_id = %self.id, session_id = %session_id, "Subscribed");
        self.forwarders
            .entry(session_id)
            .or_default()
            .push(Forwarder { guard, task });
    }

    /// Drop every subscription this connection holds for `session_id`.
    fn detach(&mut self, session_id: &str) -> bool {
        let Some(forwarders) = self.forwarders.remove(session_id) else {
            return false;
        };
        tracing::debug!(
            conn_id = %self.id,
            session_id,
            count = forwarders.len(),
            "Detached"
        );
        true
    }

    fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            tracing::debug!(conn_id = %self.id, "Client writer is gone");
        }
    }
}

/// Run a request that needs only the manager. May block.
fn call_manager(manager: &TerminalManager, request: Request) -> Result<Value> {
    let value = match request {
        Request::CreateOrAttach(params) => {
            let result = manager.create_or_attach(&params.id, params.options)?;
            serde_json::to_value(result)?
        }
        Request::Write(params) => json!(manager.write(&params.id, params.data.as_bytes())),
        Request::Resize(params) => {
            json!(manager.resize(&params.id, params.cols, params.rows, params.seq))
        }
        Request::Signal(params) => json!(manager.signal(&params.id, params.signal.as_deref())),
        Request::Kill(params) => json!(manager.kill(&params.id, params.options)),
        Request::GetSession(SessionParams { id }) => serde_json::to_value(manager.get_session(&id))?,
        Request::GetHistory(SessionParams { id }) => json!(manager.get_history(&id)),
        Request::GetPersistedHistory(SessionParams { id }) => json!(manager.persisted_history(&id)),
        Request::ListSessions => serde_json::to_value(manager.list_sessions())?,
        Request::Subscribe(_) | Request::Detach(_) => {
            bail!("subscribe and detach belong to a connection")
        }
    };
    Ok(value)
}

impl Drop for Connection {
    fn drop(&mut self) {
        let count: usize = self.forwarders.values().map(Vec::len).sum();
        tracing::debug!(conn_id = %self.id, subscriptions = count, "Connection closed");
    }
}

enum FrameRead {
    Frame,
    TooLarge,
    Eof,
}

/// Serve one client until it disconnects. Sessions are never killed here.
pub async fn serve_connection<R, W>(manager: Arc<TerminalManager>, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let mut connection = Connection::new(manager, outbound_tx);
    let conn_id = connection.id();
    tracing::debug!(conn_id = %conn_id, "Client connected");

    let writer_task = tokio::spawn(write_loop(conn_id, writer, outbound_rx));

    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let result = loop {
        match read_frame(&mut reader, &mut line).await {
            Ok(FrameRead::Frame) => connection.handle_frame(&line).await,
            Ok(FrameRead::TooLarge) => connection.reject_oversized(),
            Ok(FrameRead::Eof) => break Ok(()),
            Err(e) => break Err(e).context("Failed to read from RPC client"),
        }
    };

    // Closes the outbound channel once the forwarders are gone.
    drop(connection);
    if let Err(e) = writer_task.await {
        tracing::warn!(conn_id = %conn_id, "Writer task failed: {}", e);
    }
    tracing::debug!(conn_id = %conn_id, "Client disconnected");
    result
}

async fn write_loop<W>(conn_id: Uuid, mut writer: W, mut outbound: mpsc::UnboundedReceiver<ServerMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let mut frame = match serde_json::to_vec(&message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "Failed to encode frame: {}", e);
                continue;
            }
        };
        frame.push(b'\n');
        if let Err(e) = writer.write_all(&frame).await {
            tracing::debug!(conn_id = %conn_id, "Write failed: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::debug!(conn_id = %conn_id, "Flush failed: {}", e);
            break;
        }
    }
}

async fn read_frame<R>(reader: &mut R, line: &mut Vec<u8>) -> std::io::Result<FrameRead>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        line.clear();
        let read = (&mut *reader)
            .take(MAX_FRAME_BYTES as u64 + 1)
            .read_until(b'\n', line)
            .await?;
        if read == 0 {
            return Ok(FrameRead::Eof);
        }
        if line.len() > MAX_FRAME_BYTES && line.last() != Some(&b'\n') {
            discard_line(reader).await?;
            return Ok(FrameRead::TooLarge);
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return Ok(FrameRead::Frame);
    }
}

async fn discard_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut scratch = Vec::new();
    loop {
        scratch.clear();
        let read = (&mut *reader)
            .take(DISCARD_CHUNK)
            .read_until(b'\n', &mut scratch)
            .await?;
        if read == 0 || scratch.last() == Some(&b'\n') {
            return Ok(());
        }
    }
}
