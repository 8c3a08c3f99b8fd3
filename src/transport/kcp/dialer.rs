//! KCP dialer: client-side conversations
//!
//! Each dialed connection gets its own UDP socket (fresh or from the
//! reuse pool) and a random 16-bit conversation id. Ids of live and
//! recently-terminated conversations are off limits — the latter sit in a
//! quarantine map for a while so late packets cannot bleed into a new
//! conversation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use socket2::SockRef;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::buf::Buffer;
use crate::collect::TimedMap;
use crate::error::KcpError;
use crate::header::{create_authenticator, Authenticator};
use crate::transport::reuse::ConnectionPool;

use super::config::KcpConfig;
use super::connection::{Connection, TerminationObserver};
use super::io::UdpLink;

/// How long a terminated conversation id stays unusable.
const CONV_QUARANTINE: Duration = Duration::from_secs(30);

/// How long a recycled socket stays dialable.
const SOCKET_TTL: Duration = Duration::from_secs(60);

/// Draws before giving up on a free conversation id.
const CONV_ALLOC_ATTEMPTS: usize = 64;

/// Dials KCP connections.
pub struct KcpDialer {
    config: KcpConfig,
    authenticator: Arc<dyn Authenticator>,
    active: Arc<DashMap<u16, ()>>,
    quarantine: Arc<TimedMap<u16, ()>>,
    pool: Arc<ConnectionPool<SocketAddr, Arc<UdpSocket>>>,
}

/// Returns the conversation id and socket slot when a dialed connection
/// terminates.
struct DialerReaper {
    conv: u16,
    dest: SocketAddr,
    active: std::sync::Weak<DashMap<u16, ()>>,
    quarantine: std::sync::Weak<TimedMap<u16, ()>>,
    pool: std::sync::Weak<ConnectionPool<SocketAddr, Arc<UdpSocket>>>,
    socket: Arc<UdpSocket>,
    input_stop: parking_lot::Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl TerminationObserver for DialerReaper {
    fn on_terminated(&self, conv: u16, _remote: SocketAddr, reusable: bool) {
        if let Some(stop) = self.input_stop.lock().take() {
            let _ = stop.send(());
        }
        if let Some(active) = self.active.upgrade() {
            active.remove(&self.conv);
        }
        if let Some(quarantine) = self.quarantine.upgrade() {
            quarantine.set(self.conv, (), CONV_QUARANTINE);
        }
        if reusable {
            if let Some(pool) = self.pool.upgrade() {
                debug!("kcp: recycling socket slot for conversation {}", conv);
                pool.put(self.dest, Arc::clone(&self.socket));
            }
        }
    }
}

impl KcpDialer {
    /// Create a dialer for one KCP configuration.
    #[must_use]
    pub fn new(config: KcpConfig) -> Self {
        let authenticator = create_authenticator(config.header);
        Self {
            config,
            authenticator,
            active: Arc::new(DashMap::new()),
            quarantine: Arc::new(TimedMap::new(Duration::from_secs(5))),
            pool: ConnectionPool::new(SOCKET_TTL),
        }
    }

    fn allocate_conversation(&self) -> Result<u16, KcpError> {
        let mut rng = rand::thread_rng();
        for _ in 0..CONV_ALLOC_ATTEMPTS {
            let conv: u16 = rng.gen();
            if self.active.contains_key(&conv) || self.quarantine.contains(&conv) {
                continue;
            }
            if self.active.insert(conv, ()).is_none() {
                return Ok(conv);
            }
        }
        Err(KcpError::ConversationExhausted)
    }

    async fn obtain_socket(&self, dest: SocketAddr) -> Result<Arc<UdpSocket>, KcpError> {
        if self.config.connection_reuse {
            if let Some(socket) = self.pool.take(&dest) {
                debug!("kcp: reusing pooled socket for {}", dest);
                return Ok(socket);
            }
        }
        let bind_addr: SocketAddr = if dest.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(dest).await?;
        let sock_ref = SockRef::from(&socket);
        let _ = sock_ref.set_recv_buffer_size(self.config.read_buffer_bytes());
        let _ = sock_ref.set_send_buffer_size(self.config.write_buffer_bytes());
        Ok(Arc::new(socket))
    }

    /// Open a connection to `dest`.
    pub async fn dial(&self, dest: SocketAddr) -> Result<Arc<Connection>, KcpError> {
        let socket = self.obtain_socket(dest).await?;
        let conv = self.allocate_conversation()?;
        let local_addr = socket.local_addr()?;
        debug!("kcp: dialing {} with conversation {}", dest, conv);

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        let reaper = Arc::new(DialerReaper {
            conv,
            dest,
            active: Arc::downgrade(&self.active),
            quarantine: Arc::downgrade(&self.quarantine),
            pool: Arc::downgrade(&self.pool),
            socket: Arc::clone(&socket),
            input_stop: parking_lot::Mutex::new(Some(stop_tx)),
        });

        let link = Arc::new(UdpLink::connected(Arc::clone(&socket)));
        let conn = Connection::new(
            conv,
            self.config.clone(),
            &self.authenticator,
            link,
            local_addr,
            dest,
            Some(reaper),
        );

        tokio::spawn(input_loop(
            Arc::clone(&socket),
            Arc::downgrade(&conn),
            Arc::clone(&self.authenticator),
            stop_rx,
        ));

        Ok(conn)
    }
}

async fn input_loop(
    socket: Arc<UdpSocket>,
    conn: std::sync::Weak<Connection>,
    authenticator: Arc<dyn Authenticator>,
    mut stop: tokio::sync::oneshot::Receiver<()>,
) {
    let mut raw = vec![0u8; 2048];
    loop {
        tokio::select! {
            _ = &mut stop => return,
            received = socket.recv(&mut raw) => {
                let n = match received {
                    Ok(n) => n,
                    Err(err) => {
                        trace!("kcp: dialer read error: {}", err);
                        continue;
                    }
                };
                let Some(conn) = conn.upgrade() else { return };
                let mut payload = Buffer::new();
                payload.append(&raw[..n]);
                if authenticator.open(&mut payload) {
                    conn.input(payload.bytes());
                }
            }
        }
    }
}
