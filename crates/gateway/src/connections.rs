//! Live stream connections and the per-connection fanout tasks.
//!
//! Every registered connection runs three tasks:
//! - **reader** waits on the inbound half until the peer goes away, then
//!   fires the close signal and removes its own registry entry;
//! - **pump** drains the broker subscription through the plugin chain and
//!   offers each result to the writer queue without waiting;
//! - **writer** owns the outbound half and is the only task that writes.
//!
//! The close signal is a [`CancellationToken`] shared by all three.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    async_trait::async_trait,
    pubrelay_broker::Subscription,
    pubrelay_plugins::PluginChain,
    serde::Serialize,
    serde_json::Value,
    tokio::sync::{
        Mutex,
        mpsc::{self, error::TrySendError},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{auth::Principal, error::GatewayError};

/// How long a graceful close frame may take before the half is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

// ── Stream halves ────────────────────────────────────────────────────────────

/// Outbound half of a client stream.
#[async_trait]
pub trait StreamWriter: Send + 'static {
    async fn write_text(&mut self, text: String) -> anyhow::Result<()>;

    /// Send a close frame and shut the half down. Errors are ignored.
    async fn close(&mut self);
}

/// Inbound half of a client stream.
#[async_trait]
pub trait StreamReader: Send + 'static {
    /// Wait for the next inbound frame. An error means the peer is gone.
    async fn read_frame(&mut self) -> anyhow::Result<()>;
}

// ── Connection handle ────────────────────────────────────────────────────────

pub struct ConnectionHandle {
    id: u64,
    addr: SocketAddr,
    channel: String,
    principal: Principal,
    outbound: mpsc::Sender<String>,
    closed: CancellationToken,
    dropped: AtomicU64,
    connected_at: Instant,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Fire the close signal. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Messages dropped because the writer queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue `text` for the writer without waiting.
    fn offer(&self, text: String) -> bool {
        match self.outbound.try_send(text) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(conn_id = self.id, addr = %self.addr, dropped, "writer queue full, dropping message");
                false
            },
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Point-in-time view of a connection, as reported on `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub conn_id: u64,
    pub addr: SocketAddr,
    pub channel: String,
    pub principal: String,
    pub connected_secs: u64,
    pub dropped: u64,
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// At most one live connection per remote address.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<SocketAddr, Arc<ConnectionHandle>>>,
    plugins: Arc<PluginChain>,
    write_queue: usize,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(plugins: Arc<PluginChain>, write_queue: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            plugins,
            write_queue: write_queue.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Wire a stream to its subscription. An existing connection from
    /// the same address is closed first.
    pub async fn register<W, R>(
        self: &Arc<Self>,
        addr: SocketAddr,
        channel: impl Into<String>,
        principal: Principal,
        writer: W,
        reader: R,
        subscription: Subscription,
    ) -> Arc<ConnectionHandle>
    where
        W: StreamWriter,
        R: StreamReader,
    {
        let (tx, rx) = mpsc::channel(self.write_queue);
        let handle = Arc::new(ConnectionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            addr,
            channel: channel.into(),
            principal,
            outbound: tx,
            closed: CancellationToken::new(),
            dropped: AtomicU64::new(0),
            connected_at: Instant::now(),
        });

        {
            let mut connections = self.connections.lock().await;
            if let Some(previous) = connections.remove(&addr) {
                info!(addr = %addr, conn_id = previous.id, "replacing existing connection");
                previous.close();
            }
            connections.insert(addr, Arc::clone(&handle));
        }

        info!(
            conn_id = handle.id,
            addr = %addr,
            channel = %handle.channel,
            principal = %handle.principal,
            "stream connected"
        );

        tokio::spawn(run_writer(writer, rx, Arc::clone(&handle)));
        tokio::spawn(run_pump(
            subscription,
            Arc::clone(&self.plugins),
            Arc::clone(&handle),
        ));
        tokio::spawn(run_reader(reader, Arc::clone(self), Arc::clone(&handle)));

        handle
    }

    /// Remove `handle`'s entry, unless a newer connection has taken the
    /// address since.
    pub(crate) async fn release(&self, handle: &ConnectionHandle) {
        let mut connections = self.connections.lock().await;
        if connections
            .get(&handle.addr)
            .is_some_and(|current| current.id == handle.id)
        {
            connections.remove(&handle.addr);
            debug!(conn_id = handle.id, addr = %handle.addr, "connection removed");
        }
    }

    pub async fn get(&self, addr: &SocketAddr) -> Option<Arc<ConnectionHandle>> {
        self.connections.lock().await.get(addr).cloned()
    }

    pub async fn count(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn snapshot(&self) -> Vec<ConnectionInfo> {
        let connections = self.connections.lock().await;
        let mut infos: Vec<ConnectionInfo> = connections
            .values()
            .map(|h| ConnectionInfo {
                conn_id: h.id,
                addr: h.addr,
                channel: h.channel.clone(),
                principal: h.principal.to_string(),
                connected_secs: h.connected_at.elapsed().as_secs(),
                dropped: h.dropped_count(),
            })
            .collect();
        infos.sort_by_key(|i| i.conn_id);
        infos
    }
}

// ── Tasks ────────────────────────────────────────────────────────────────────

async fn run_writer<W: StreamWriter>(
    mut writer: W,
    mut queue: mpsc::Receiver<String>,
    handle: Arc<ConnectionHandle>,
) {
    loop {
        tokio::select! {
            biased;
            () = handle.closed.cancelled() => break,
            next = queue.recv() => match next {
                Some(text) => {
                    // A peer that stopped reading can park this write forever;
                    // the close signal must still get through.
                    let written = tokio::select! {
                        biased;
                        () = handle.closed.cancelled() => {
                            debug!(conn_id = handle.id, addr = %handle.addr, "write abandoned, dropping stream");
                            return;
                        },
                        written = writer.write_text(text) => written,
                    };
                    if let Err(e) = written {
                        debug!(conn_id = handle.id, addr = %handle.addr, error = %e, "stream write failed");
                        handle.close();
                        break;
                    }
                },
                None => break,
            },
        }
    }
    if tokio::time::timeout(CLOSE_GRACE, writer.close()).await.is_err() {
        debug!(conn_id = handle.id, addr = %handle.addr, "close frame timed out, dropping stream");
    }
}

async fn run_pump(
    mut subscription: Subscription,
    plugins: Arc<PluginChain>,
    handle: Arc<ConnectionHandle>,
) {
    loop {
        let raw = tokio::select! {
            () = handle.closed.cancelled() => break,
            next = subscription.next_message() => match next {
                Some(raw) => raw,
                None => {
                    warn!(conn_id = handle.id, topic = %subscription.topic(), "subscription feed ended");
                    handle.close();
                    break;
                },
            },
        };

        match plugins.transform(Value::String(raw)) {
            Ok(payload) => {
                handle.offer(payload.to_string());
            },
            Err(e) => {
                let plugin = e.plugin.clone();
                let error = GatewayError::from(e);
                warn!(
                    conn_id = handle.id,
                    addr = %handle.addr,
                    plugin = %plugin,
                    error = %error,
                    "transform failed, dropping message"
                );
            },
        }
    }
    subscription.close();
}

async fn run_reader<R: StreamReader>(
    mut reader: R,
    registry: Arc<ConnectionRegistry>,
    handle: Arc<ConnectionHandle>,
) {
    loop {
        tokio::select! {
            () = handle.closed.cancelled() => break,
            frame = reader.read_frame() => {
                if let Err(e) = frame {
                    debug!(conn_id = handle.id, addr = %handle.addr, reason = %e, "stream reader finished");
                    break;
                }
            },
        }
    }
    handle.close();
    registry.release(&handle).await;
    info!(conn_id = handle.id, addr = %handle.addr, "stream disconnected");
}
