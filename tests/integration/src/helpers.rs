//! Test helpers: an in-process fake cluster node speaking enough RESP
//! to drive the coordinator, and event-stream assertions.

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use cinder_cluster::{Addr, ClusterEvent};
use cinder_protocol::{parse_frame, Frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

static LOG_INIT: Once = Once::new();

/// Initialises tracing output for tests, honoring `RUST_LOG`.
pub fn init_logging() {
    LOG_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .try_init();
    });
}

/// Orders broadcast to a fake node's established connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnOrder {
    /// Close with a normal FIN: the peer sees a clean EOF.
    CloseClean,
    /// Close with an RST: the peer sees a read error.
    Reset,
}

/// An in-process TCP listener that answers like a cluster node:
/// PING, AUTH, CLUSTER SLOTS (with a switchable reply), CLUSTER MYID.
pub struct FakeNode {
    addr: Addr,
    slots: Arc<Mutex<Frame>>,
    order_tx: broadcast::Sender<ConnOrder>,
    accept_task: JoinHandle<()>,
}

impl FakeNode {
    /// Starts a node on an ephemeral local port.
    pub async fn start(id: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::with_listener(id, listener)
    }

    /// Starts a node on a specific address, used to "restart" a node on
    /// the port a previous incarnation owned.
    pub async fn start_on(id: &str, addr: &Addr) -> Self {
        let listener = TcpListener::bind((addr.host(), addr.port())).await.unwrap();
        Self::with_listener(id, listener)
    }

    fn with_listener(id: &str, listener: TcpListener) -> Self {
        let port = listener.local_addr().unwrap().port();
        let addr = Addr::new("127.0.0.1", port);
        let slots = Arc::new(Mutex::new(Frame::Array(vec![])));
        let (order_tx, _) = broadcast::channel(8);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            slots.clone(),
            order_tx.clone(),
            id.to_string(),
        ));
        Self {
            addr,
            slots,
            order_tx,
            accept_task,
        }
    }

    pub fn addr(&self) -> Addr {
        self.addr.clone()
    }

    /// Replaces the reply served for `CLUSTER SLOTS`.
    pub fn set_slots(&self, reply: Frame) {
        *self.slots.lock().unwrap() = reply;
    }

    /// Closes established connections with a clean FIN. The listener
    /// keeps accepting, so clients can reconnect.
    pub fn close_connections(&self) {
        let _ = self.order_tx.send(ConnOrder::CloseClean);
    }

    /// Resets established connections (RST) so clients observe an error
    /// instead of a clean close.
    pub fn reset_connections(&self) {
        let _ = self.order_tx.send(ConnOrder::Reset);
    }

    /// Stops accepting new connections. Established connections keep
    /// serving until closed or reset explicitly.
    pub fn stop(&self) {
        self.accept_task.abort();
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    slots: Arc<Mutex<Frame>>,
    order_tx: broadcast::Sender<ConnOrder>,
    id: String,
) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(serve_conn(
            stream,
            slots.clone(),
            order_tx.subscribe(),
            id.clone(),
        ));
    }
}

async fn serve_conn(
    mut stream: TcpStream,
    slots: Arc<Mutex<Frame>>,
    mut orders: broadcast::Receiver<ConnOrder>,
    id: String,
) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        // answer every complete command already buffered
        loop {
            match parse_frame(&buf) {
                Ok(Some((frame, consumed))) => {
                    let _ = buf.split_to(consumed);
                    let reply = respond(&frame, &slots, &id);
                    let mut out = BytesMut::new();
                    reply.serialize(&mut out);
                    if stream.write_all(&out).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }

        tokio::select! {
            order = orders.recv() => match order {
                Ok(ConnOrder::CloseClean) | Err(_) => return,
                Ok(ConnOrder::Reset) => {
                    let _ = stream.set_linger(Some(Duration::ZERO));
                    return;
                }
            },
            result = stream.read_buf(&mut buf) => match result {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            },
        }
    }
}

fn respond(frame: &Frame, slots: &Arc<Mutex<Frame>>, id: &str) -> Frame {
    let Frame::Array(items) = frame else {
        return Frame::Error("ERR protocol error".into());
    };
    let tokens: Vec<String> = items
        .iter()
        .filter_map(|f| f.as_str().map(str::to_string))
        .collect();

    match tokens.first().map(|s| s.to_ascii_uppercase()).as_deref() {
        Some("PING") => Frame::Simple("PONG".into()),
        Some("AUTH") => Frame::Simple("OK".into()),
        Some("CLUSTER") => match tokens.get(1).map(|s| s.to_ascii_uppercase()).as_deref() {
            Some("SLOTS") => slots.lock().unwrap().clone(),
            Some("MYID") => Frame::Bulk(Bytes::from(id.to_string())),
            _ => Frame::Error("ERR unknown CLUSTER subcommand".into()),
        },
        _ => Frame::Error("ERR unknown command".into()),
    }
}

/// Builds a `CLUSTER SLOTS` reply frame from range descriptions.
pub fn slots_reply(entries: &[(u16, u16, Addr, Vec<Addr>)]) -> Frame {
    Frame::Array(
        entries
            .iter()
            .map(|(start, end, master, replicas)| {
                let mut fields = vec![
                    Frame::Integer(i64::from(*start)),
                    Frame::Integer(i64::from(*end)),
                    node_entry(master),
                ];
                fields.extend(replicas.iter().map(node_entry));
                Frame::Array(fields)
            })
            .collect(),
    )
}

fn node_entry(addr: &Addr) -> Frame {
    Frame::Array(vec![
        Frame::Bulk(Bytes::from(addr.host().to_string())),
        Frame::Integer(i64::from(addr.port())),
    ])
}

/// Awaits the next event matching `pred`, skipping others. Panics after
/// five seconds.
pub async fn expect_event<F>(rx: &mut mpsc::Receiver<ClusterEvent>, pred: F) -> ClusterEvent
where
    F: Fn(&ClusterEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
