//! KCP reliability under simulated loss, jitter, and reordering.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;

use raynet::buf::MultiBuffer;
use raynet::header::create_authenticator;
use raynet::transport::kcp::{Connection, DatagramLink, KcpConfig, State};

/// Loss/delay policy of one simulated link direction.
#[derive(Clone, Copy)]
struct LinkPolicy {
    /// Drop one datagram in `drop_every` (0 disables).
    drop_every: u64,
    /// Drop with this probability in percent.
    drop_percent: u32,
    /// Maximum extra delivery delay in milliseconds.
    jitter_ms: u64,
}

struct LossyLink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    policy: LinkPolicy,
    counter: AtomicU64,
}

#[async_trait]
impl DatagramLink for LossyLink {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        if self.policy.drop_every > 0 && n % self.policy.drop_every == 0 {
            return Ok(());
        }
        if self.policy.drop_percent > 0
            && rand::thread_rng().gen_range(0..100) < self.policy.drop_percent
        {
            return Ok(());
        }
        let delay = if self.policy.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.policy.jitter_ms)
        } else {
            0
        };
        let tx = self.tx.clone();
        let data = datagram.to_vec();
        if delay > 0 {
            // delayed delivery doubles as reordering
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let _ = tx.send(data);
            });
        } else {
            let _ = tx.send(data);
        }
        Ok(())
    }
}

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn lossy_pair(
    config: KcpConfig,
    client_policy: LinkPolicy,
    server_policy: LinkPolicy,
) -> (Arc<Connection>, Arc<Connection>) {
    let auth = create_authenticator(config.header);
    let (tx_ab, mut rx_ab) = mpsc::unbounded_channel::<Vec<u8>>();
    let (tx_ba, mut rx_ba) = mpsc::unbounded_channel::<Vec<u8>>();

    let client = Connection::new(
        0x0C0C,
        config.clone(),
        &auth,
        Arc::new(LossyLink {
            tx: tx_ab,
            policy: client_policy,
            counter: AtomicU64::new(0),
        }),
        addr(1),
        addr(2),
        None,
    );
    let server = Connection::new(
        0x0C0C,
        config,
        &auth,
        Arc::new(LossyLink {
            tx: tx_ba,
            policy: server_policy,
            counter: AtomicU64::new(0),
        }),
        addr(2),
        addr(1),
        None,
    );

    let to_server = Arc::downgrade(&server);
    tokio::spawn(async move {
        while let Some(datagram) = rx_ab.recv().await {
            let Some(conn) = to_server.upgrade() else { return };
            conn.input(&datagram);
        }
    });
    let to_client = Arc::downgrade(&client);
    tokio::spawn(async move {
        while let Some(datagram) = rx_ba.recv().await {
            let Some(conn) = to_client.upgrade() else { return };
            conn.input(&datagram);
        }
    });

    (client, server)
}

async fn transfer(
    client: &Arc<Connection>,
    server: &Arc<Connection>,
    payload: Vec<u8>,
    budget: Duration,
) {
    let sender = {
        let client = Arc::clone(client);
        let payload = payload.clone();
        tokio::spawn(async move {
            client
                .write(MultiBuffer::from_bytes(&payload))
                .await
                .unwrap();
        })
    };

    let deadline = tokio::time::Instant::now() + budget;
    let mut received = Vec::new();
    while received.len() < payload.len() {
        let chunk = tokio::time::timeout_at(deadline, server.read())
            .await
            .expect("lossy transfer stalled")
            .expect("read failed")
            .expect("stream ended early");
        received.extend_from_slice(&chunk.to_vec());
    }
    sender.await.unwrap();
    assert_eq!(received, payload, "payload corrupted by lossy link");
}

fn clean() -> LinkPolicy {
    LinkPolicy {
        drop_every: 0,
        drop_percent: 0,
        jitter_ms: 0,
    }
}

#[tokio::test]
async fn uniform_loss_and_jitter() {
    // 5% loss with up to 50ms of reordering jitter in both directions
    let noisy = LinkPolicy {
        drop_every: 0,
        drop_percent: 5,
        jitter_ms: 50,
    };
    let config = KcpConfig {
        tti: 10,
        congestion: true,
        ..Default::default()
    };
    let (client, server) = lossy_pair(config, noisy, noisy);
    let payload: Vec<u8> = (0..256 * 1024u32).map(|i| (i % 251) as u8).collect();
    transfer(&client, &server, payload, Duration::from_secs(60)).await;
}

#[tokio::test]
async fn every_third_datagram_dropped() {
    // deterministic drop of every third client datagram, clean reverse path
    let every_third = LinkPolicy {
        drop_every: 3,
        drop_percent: 0,
        jitter_ms: 0,
    };
    let config = KcpConfig {
        tti: 10,
        ..Default::default()
    };
    let (client, server) = lossy_pair(config, every_third, clean());
    let payload: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    transfer(&client, &server, payload, Duration::from_secs(60)).await;

    // everything was acknowledged despite the drops
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !client.sending_idle() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(client.sending_idle(), "sending buffer never drained");
}

#[tokio::test]
async fn close_handshake_survives_loss() {
    let noisy = LinkPolicy {
        drop_every: 4,
        drop_percent: 0,
        jitter_ms: 10,
    };
    let config = KcpConfig {
        tti: 10,
        ..Default::default()
    };
    let (client, server) = lossy_pair(config, noisy, noisy);

    client.write(MultiBuffer::from_bytes(b"bye")).await.unwrap();
    let chunk = tokio::time::timeout(Duration::from_secs(10), server.read())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(chunk.to_vec(), b"bye");

    client.close().unwrap();
    let _ = server.close();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(40);
    loop {
        if client.state() == State::Terminated && server.state() == State::Terminated {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "close handshake did not converge under loss (client {:?}, server {:?})",
            client.state(),
            server.state()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
