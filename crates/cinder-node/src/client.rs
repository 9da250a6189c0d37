//! The per-node client task and its handle.
//!
//! [`NodeClient::start`] spawns a task that owns the TCP connection to one
//! node and returns a cloneable [`NodeHandle`]. The task keeps the
//! connection alive: it connects with a timeout, performs the optional
//! AUTH / CLUSTER MYID handshake, then serves pipelined commands until the
//! connection drops, and reconnects with exponential backoff + jitter.
//!
//! Status transitions are reported on the `status_tx` channel in emission
//! order. A clean peer EOF is reported as [`DownReason::SocketClosed`] and
//! is distinct from read/write failures ([`DownReason::Io`]); consumers
//! treat the two differently.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::BytesMut;
use cinder_protocol::{encode_command, parse_frame, Frame};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::addr::Addr;
use crate::error::NodeError;

/// AUTH credentials for the connect handshake.
#[derive(Debug, Clone)]
pub struct Auth {
    /// ACL username; `None` uses the legacy single-argument AUTH.
    pub username: Option<String>,
    pub password: String,
}

/// Configuration for a node client.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// How long a single connection attempt may take.
    pub connect_timeout: Duration,
    /// Initial wait before reconnecting after a failure.
    pub reconnect_wait_min: Duration,
    /// Upper bound for the exponential reconnect backoff.
    pub reconnect_wait_max: Duration,
    /// Maximum number of in-flight commands before backpressure kicks in.
    pub queue_limit: usize,
    /// Credentials sent on every (re)connect.
    pub auth: Option<Auth>,
    /// Query `CLUSTER MYID` after connecting and report the node's id
    /// in the up event.
    pub use_cluster_id: bool,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            reconnect_wait_min: Duration::from_millis(100),
            reconnect_wait_max: Duration::from_secs(30),
            queue_limit: 128,
            auth: None,
            use_cluster_id: false,
        }
    }
}

/// Connection status reported by a client task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Connected and handshaken.
    Up {
        /// The node's cluster id, when `use_cluster_id` is set.
        cluster_id: Option<String>,
    },
    /// Not connected; the reason says why.
    Down(DownReason),
    /// The in-flight queue reached its limit; commands will be rejected.
    QueueFull,
    /// The in-flight queue drained back below the low watermark.
    QueueOk,
}

/// Why a connection went down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownReason {
    /// The peer closed the socket cleanly (EOF).
    SocketClosed,
    /// A read or write failed mid-connection.
    Io(String),
    /// A connection attempt failed.
    ConnectFailed(String),
    /// The client was stopped.
    ClientStopped,
}

/// A status event tagged with the node it concerns.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub addr: Addr,
    pub status: ConnectionStatus,
}

struct Request {
    tokens: Vec<String>,
    reply: oneshot::Sender<Result<Frame, NodeError>>,
}

/// Handle to a running node client. Cheap to clone.
///
/// Handles handed out to other components are aliases: once the owning
/// coordinator stops the client, commands on remaining clones fail with
/// [`NodeError::Stopped`].
#[derive(Debug, Clone)]
pub struct NodeHandle {
    addr: Addr,
    req_tx: mpsc::Sender<Request>,
    stop_tx: mpsc::Sender<()>,
}

impl NodeHandle {
    /// The address this client is connected to.
    pub fn addr(&self) -> &Addr {
        &self.addr
    }

    /// Enqueues a command without blocking.
    ///
    /// The returned receiver resolves with the reply, or with a
    /// [`NodeError`] if the command could not be delivered. A full queue
    /// or stopped client resolves immediately.
    pub fn command(&self, tokens: Vec<String>) -> oneshot::Receiver<Result<Frame, NodeError>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if let Err(err) = self.req_tx.try_send(Request {
            tokens,
            reply: reply_tx,
        }) {
            let (request, error) = match err {
                TrySendError::Full(r) => (r, NodeError::QueueFull),
                TrySendError::Closed(r) => (r, NodeError::Stopped),
            };
            let _ = request.reply.send(Err(error));
        }
        reply_rx
    }

    /// Sends a command and awaits the reply.
    pub async fn exec(&self, tokens: Vec<String>) -> Result<Frame, NodeError> {
        self.command(tokens).await.unwrap_or(Err(NodeError::Stopped))
    }

    /// Stops the client task. Idempotent; in-flight commands fail with
    /// [`NodeError::Stopped`].
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }
}

/// Spawns node client tasks.
pub struct NodeClient;

impl NodeClient {
    /// Starts a client for `addr` and returns its handle immediately.
    ///
    /// The task connects in the background; progress is visible on
    /// `status_tx`. The task runs until [`NodeHandle::stop`] is called or
    /// every handle is dropped.
    pub fn start(
        addr: Addr,
        options: NodeOptions,
        status_tx: mpsc::Sender<StatusUpdate>,
    ) -> NodeHandle {
        let (req_tx, req_rx) = mpsc::channel(options.queue_limit.max(1));
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task = ClientTask {
            addr: addr.clone(),
            options,
            status_tx,
            req_rx,
            stop_rx,
        };
        tokio::spawn(task.run());
        NodeHandle {
            addr,
            req_tx,
            stop_tx,
        }
    }
}

enum ServeEnd {
    Stopped,
    Down(DownReason),
}

enum Flow {
    Continue,
    Stop,
}

struct ClientTask {
    addr: Addr,
    options: NodeOptions,
    status_tx: mpsc::Sender<StatusUpdate>,
    req_rx: mpsc::Receiver<Request>,
    stop_rx: mpsc::Receiver<()>,
}

impl ClientTask {
    async fn run(mut self) {
        let mut wait = self.options.reconnect_wait_min;
        loop {
            match self.connect().await {
                Ok((conn, cluster_id)) => {
                    wait = self.options.reconnect_wait_min;
                    self.emit(ConnectionStatus::Up { cluster_id }).await;
                    match self.serve(conn).await {
                        ServeEnd::Stopped => break,
                        ServeEnd::Down(reason) => {
                            self.emit(ConnectionStatus::Down(reason)).await;
                        }
                    }
                }
                Err(e) => {
                    debug!("connect to {} failed: {e}", self.addr);
                    self.emit(ConnectionStatus::Down(DownReason::ConnectFailed(e)))
                        .await;
                }
            }

            if let Flow::Stop = self.wait_reconnect(wait).await {
                break;
            }
            wait = (wait * 2).min(self.options.reconnect_wait_max);
        }

        // reject anything still queued, then report the stop
        self.req_rx.close();
        while let Ok(request) = self.req_rx.try_recv() {
            let _ = request.reply.send(Err(NodeError::Stopped));
        }
        self.emit(ConnectionStatus::Down(DownReason::ClientStopped))
            .await;
        debug!("client for {} stopped", self.addr);
    }

    /// Connects and handshakes. Returns the connection and, when
    /// `use_cluster_id` is set, the node's reported cluster id.
    async fn connect(&mut self) -> Result<(Conn, Option<String>), String> {
        let connect = TcpStream::connect((self.addr.host(), self.addr.port()));
        let stream = timeout(self.options.connect_timeout, connect)
            .await
            .map_err(|_| "connect timed out".to_string())?
            .map_err(|e| e.to_string())?;
        let _ = stream.set_nodelay(true);
        let mut conn = Conn::new(stream);

        if let Some(auth) = &self.options.auth {
            let tokens = match &auth.username {
                Some(user) => vec!["AUTH".to_string(), user.clone(), auth.password.clone()],
                None => vec!["AUTH".to_string(), auth.password.clone()],
            };
            match conn.roundtrip(&tokens).await? {
                Frame::Simple(s) if s == "OK" => {}
                Frame::Error(e) => return Err(format!("auth failed: {e}")),
                other => return Err(format!("unexpected reply to AUTH: {other:?}")),
            }
        }

        let cluster_id = if self.options.use_cluster_id {
            let reply = conn
                .roundtrip(&["CLUSTER".to_string(), "MYID".to_string()])
                .await?;
            reply.as_str().map(str::to_string)
        } else {
            None
        };

        Ok((conn, cluster_id))
    }

    /// Serves commands on an established connection until it drops or the
    /// client is stopped. In-flight commands that cannot complete are
    /// failed before returning.
    async fn serve(&mut self, conn: Conn) -> ServeEnd {
        let ClientTask {
            addr,
            options,
            status_tx,
            req_rx,
            stop_rx,
        } = self;

        let Conn {
            stream,
            mut read_buf,
        } = conn;
        let (mut read_half, mut write_half) = stream.into_split();
        let mut write_buf = BytesMut::with_capacity(4096);
        let mut pending: VecDeque<oneshot::Sender<Result<Frame, NodeError>>> = VecDeque::new();
        let mut queue_full = false;

        let end = 'serve: loop {
            tokio::select! {
                _ = stop_rx.recv() => break 'serve ServeEnd::Stopped,

                request = req_rx.recv(), if pending.len() < options.queue_limit => {
                    let Some(Request { tokens, reply }) = request else {
                        break 'serve ServeEnd::Stopped;
                    };
                    write_buf.clear();
                    encode_command(&tokens, &mut write_buf);
                    if let Err(e) = write_half.write_all(&write_buf).await {
                        let _ = reply.send(Err(NodeError::ConnectionLost(e.to_string())));
                        break 'serve ServeEnd::Down(DownReason::Io(e.to_string()));
                    }
                    pending.push_back(reply);
                    if !queue_full && pending.len() >= options.queue_limit {
                        queue_full = true;
                        emit_status(status_tx, addr, ConnectionStatus::QueueFull).await;
                    }
                }

                result = read_half.read_buf(&mut read_buf) => match result {
                    Ok(0) => break 'serve ServeEnd::Down(DownReason::SocketClosed),
                    Ok(_) => {
                        loop {
                            match parse_frame(&read_buf) {
                                Ok(Some((frame, consumed))) => {
                                    let _ = read_buf.split_to(consumed);
                                    match pending.pop_front() {
                                        Some(reply) => {
                                            let _ = reply.send(Ok(frame));
                                        }
                                        None => warn!("unsolicited frame from {addr}"),
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    break 'serve ServeEnd::Down(DownReason::Io(
                                        format!("protocol error: {e}"),
                                    ));
                                }
                            }
                        }
                        if queue_full && pending.len() <= options.queue_limit / 2 {
                            queue_full = false;
                            emit_status(status_tx, addr, ConnectionStatus::QueueOk).await;
                        }
                    }
                    Err(e) => break 'serve ServeEnd::Down(DownReason::Io(e.to_string())),
                },
            }
        };

        let failure = match &end {
            ServeEnd::Stopped => NodeError::Stopped,
            ServeEnd::Down(_) => NodeError::ConnectionLost("connection lost before reply".into()),
        };
        for reply in pending {
            let _ = reply.send(Err(failure.clone()));
        }
        end
    }

    /// Sleeps out the backoff. Requests arriving while disconnected fail
    /// fast instead of queueing until reconnect.
    async fn wait_reconnect(&mut self, wait: Duration) -> Flow {
        let ClientTask {
            req_rx, stop_rx, ..
        } = self;

        let sleep = tokio::time::sleep(jittered(wait));
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Flow::Continue,
                _ = stop_rx.recv() => return Flow::Stop,
                request = req_rx.recv() => match request {
                    Some(Request { reply, .. }) => {
                        let _ = reply.send(Err(NodeError::Disconnected));
                    }
                    None => return Flow::Stop,
                },
            }
        }
    }

    async fn emit(&self, status: ConnectionStatus) {
        emit_status(&self.status_tx, &self.addr, status).await;
    }
}

/// Sends a status event; logs if the consumer is gone. This normally only
/// happens during shutdown.
async fn emit_status(tx: &mpsc::Sender<StatusUpdate>, addr: &Addr, status: ConnectionStatus) {
    let update = StatusUpdate {
        addr: addr.clone(),
        status,
    };
    if tx.send(update).await.is_err() {
        warn!("status channel closed, dropping event for {addr}");
    }
}

fn jittered(wait: Duration) -> Duration {
    wait.mul_f64(rand::rng().random_range(0.8..1.2))
}

/// A sequential request/response connection, used for the handshake
/// before the connection switches to pipelined serving.
struct Conn {
    stream: TcpStream,
    read_buf: BytesMut,
}

impl Conn {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    async fn roundtrip(&mut self, tokens: &[String]) -> Result<Frame, String> {
        let mut out = BytesMut::with_capacity(64);
        encode_command(tokens, &mut out);
        self.stream
            .write_all(&out)
            .await
            .map_err(|e| e.to_string())?;

        loop {
            match parse_frame(&self.read_buf) {
                Ok(Some((frame, consumed))) => {
                    let _ = self.read_buf.split_to(consumed);
                    return Ok(frame);
                }
                Ok(None) => {}
                Err(e) => return Err(format!("protocol error: {e}")),
            }
            let n = self
                .stream
                .read_buf(&mut self.read_buf)
                .await
                .map_err(|e| e.to_string())?;
            if n == 0 {
                return Err("server closed connection during handshake".into());
            }
        }
    }
}
