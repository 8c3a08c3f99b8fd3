//! KCP listener: one UDP socket, many conversations
//!
//! Every datagram is authenticated, its conversation id peeked, and the
//! payload routed to the matching connection keyed by (peer address,
//! conv). Unknown conversations become server-side connections offered to
//! the accept channel; when that channel is full the newcomer is
//! terminated on the spot, which is the listener's back-pressure.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use socket2::SockRef;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::buf::Buffer;
use crate::error::KcpError;
use crate::header::{create_authenticator, Authenticator};

use super::config::KcpConfig;
use super::connection::{Connection, TerminationObserver};
use super::io::UdpLink;
use super::segment::read_conversation;

/// Pending connections the accept channel holds before back-pressure.
const ACCEPT_BACKLOG: usize = 64;

type SessionMap = DashMap<(SocketAddr, u16), Arc<Connection>>;

/// Drops the demux entry once a server-side connection terminates.
struct SessionReaper {
    sessions: std::sync::Weak<SessionMap>,
}

impl TerminationObserver for SessionReaper {
    fn on_terminated(&self, conv: u16, remote: SocketAddr, _reusable: bool) {
        if let Some(sessions) = self.sessions.upgrade() {
            sessions.remove(&(remote, conv));
        }
    }
}

/// Accepts KCP connections on one UDP port.
pub struct KcpListener {
    local_addr: SocketAddr,
    sessions: Arc<SessionMap>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Connection>>>,
    demux_task: JoinHandle<()>,
}

impl KcpListener {
    /// Bind `addr` and start demultiplexing.
    pub async fn bind(addr: SocketAddr, config: KcpConfig) -> Result<Self, KcpError> {
        let socket = UdpSocket::bind(addr).await?;
        let sock_ref = SockRef::from(&socket);
        let _ = sock_ref.set_recv_buffer_size(config.read_buffer_bytes());
        let _ = sock_ref.set_send_buffer_size(config.write_buffer_bytes());
        let local_addr = socket.local_addr()?;
        info!("kcp: listening on {}", local_addr);

        let socket = Arc::new(socket);
        let sessions: Arc<SessionMap> = Arc::new(DashMap::new());
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let authenticator = create_authenticator(config.header);

        let demux_task = tokio::spawn(demux_loop(
            Arc::clone(&socket),
            local_addr,
            Arc::clone(&sessions),
            accept_tx,
            config,
            authenticator,
        ));

        Ok(Self {
            local_addr,
            sessions,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            demux_task,
        })
    }

    /// Wait for the next incoming connection.
    pub async fn accept(&self) -> Result<Arc<Connection>, KcpError> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(KcpError::ClosedListener)
    }

    /// Bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live conversations currently demultiplexed.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.sessions.len()
    }

    /// Stop demultiplexing and terminate every conversation.
    pub fn close(&self) {
        self.demux_task.abort();
        // termination re-enters the session map through the reaper, so
        // never terminate while iterating it
        let connections: Vec<Arc<Connection>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for conn in connections {
            conn.terminate();
        }
        self.sessions.clear();
    }
}

impl Drop for KcpListener {
    fn drop(&mut self) {
        self.demux_task.abort();
    }
}

async fn demux_loop(
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    sessions: Arc<SessionMap>,
    accept_tx: mpsc::Sender<Arc<Connection>>,
    config: KcpConfig,
    authenticator: Arc<dyn Authenticator>,
) {
    let mut raw = vec![0u8; 2048];
    loop {
        let (n, peer) = match socket.recv_from(&mut raw).await {
            Ok(v) => v,
            Err(err) => {
                warn!("kcp: listener read error: {}", err);
                continue;
            }
        };

        let mut payload = Buffer::new();
        payload.append(&raw[..n]);
        if !authenticator.open(&mut payload) {
            trace!("kcp: dropping unauthenticated datagram from {}", peer);
            continue;
        }
        let Some(conv) = read_conversation(payload.bytes()) else {
            continue;
        };

        let key = (peer, conv);
        if let Some(conn) = sessions.get(&key).map(|e| Arc::clone(e.value())) {
            conn.input(payload.bytes());
            continue;
        }

        debug!("kcp: new conversation {} from {}", conv, peer);
        let link = Arc::new(UdpLink::addressed(Arc::clone(&socket), peer));
        let reaper = Arc::new(SessionReaper {
            sessions: Arc::downgrade(&sessions),
        });
        let conn = Connection::new(
            conv,
            config.clone(),
            &authenticator,
            link,
            local_addr,
            peer,
            Some(reaper),
        );
        match accept_tx.try_send(Arc::clone(&conn)) {
            Ok(()) => {
                conn.input(payload.bytes());
                sessions.insert(key, conn);
            }
            Err(_) => {
                warn!("kcp: accept backlog full, terminating conversation {}", conv);
                conn.terminate();
            }
        }
    }
}
