//! KCP: reliable ARQ over unreliable UDP
//!
//! A full reliability layer on top of datagrams: sliding windows with
//! selective acknowledgement, fast retransmit, RFC 6298 RTO estimation,
//! optional congestion control, a graceful four-way close, and pluggable
//! per-datagram camouflage.
//!
//! # Architecture
//!
//! ```text
//! Connection::write ──> SendingQueue ──> SendingWindow ──┐
//!                                                        v
//!                          SegmentWriter (pack + seal) ──> DatagramLink ──> UDP
//!                                                        ^
//! Connection::read <── ReceivingQueue <── ReceivingWindow┘ (via input())
//! ```
//!
//! The listener demultiplexes one UDP socket across conversations; the
//! dialer gives every conversation its own socket and a random id.

mod config;
mod connection;
mod dialer;
mod io;
mod listener;
mod receiving;
mod segment;
mod sending;

pub use config::KcpConfig;
pub use connection::{Connection, State, TerminationObserver};
pub use dialer::KcpDialer;
pub use io::{DatagramLink, SegmentWriter, UdpLink};
pub use listener::KcpListener;
pub use segment::{
    read_conversation, read_segment, AckEntry, AckSegment, CmdOnlySegment, Command, DataSegment,
    Segment, SegmentEncode, DATA_SEGMENT_OVERHEAD, MAX_ACK_COUNT, SEGMENT_OPTION_CLOSE,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::MultiBuffer;
    use crate::header::create_authenticator;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct ChannelLink {
        tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl DatagramLink for ChannelLink {
        async fn send(&self, datagram: &[u8]) -> io::Result<()> {
            self.tx
                .send(datagram.to_vec())
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
        }
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn loopback_pair(config: KcpConfig) -> (Arc<Connection>, Arc<Connection>) {
        let auth = create_authenticator(config.header);
        let (tx_ab, mut rx_ab) = mpsc::unbounded_channel::<Vec<u8>>();
        let (tx_ba, mut rx_ba) = mpsc::unbounded_channel::<Vec<u8>>();

        let a = Connection::new(
            0x1234,
            config.clone(),
            &auth,
            Arc::new(ChannelLink { tx: tx_ab }),
            addr(1),
            addr(2),
            None,
        );
        let b = Connection::new(
            0x1234,
            config,
            &auth,
            Arc::new(ChannelLink { tx: tx_ba }),
            addr(2),
            addr(1),
            None,
        );

        let to_b = Arc::downgrade(&b);
        tokio::spawn(async move {
            while let Some(datagram) = rx_ab.recv().await {
                let Some(conn) = to_b.upgrade() else { return };
                conn.input(&datagram);
            }
        });
        let to_a = Arc::downgrade(&a);
        tokio::spawn(async move {
            while let Some(datagram) = rx_ba.recv().await {
                let Some(conn) = to_a.upgrade() else { return };
                conn.input(&datagram);
            }
        });

        (a, b)
    }

    fn fast_config() -> KcpConfig {
        KcpConfig {
            tti: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_loopback_echo() {
        let (a, b) = loopback_pair(fast_config());

        a.write(MultiBuffer::from_bytes(b"hello")).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), b.read())
            .await
            .unwrap()
            .unwrap()
            .expect("payload");
        assert_eq!(got.to_vec(), b"hello");

        b.write(MultiBuffer::from_bytes(b"world")).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), a.read())
            .await
            .unwrap()
            .unwrap()
            .expect("payload");
        assert_eq!(got.to_vec(), b"world");
    }

    #[tokio::test]
    async fn test_loopback_large_transfer() {
        let (a, b) = loopback_pair(fast_config());
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let sender = {
            let a = Arc::clone(&a);
            let payload = payload.clone();
            tokio::spawn(async move {
                a.write(MultiBuffer::from_bytes(&payload)).await.unwrap();
            })
        };

        let mut received = Vec::new();
        while received.len() < payload.len() {
            let chunk = tokio::time::timeout(Duration::from_secs(30), b.read())
                .await
                .expect("transfer stalled")
                .unwrap()
                .expect("stream ended early");
            received.extend_from_slice(&chunk.to_vec());
        }
        sender.await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_close_handshake_reaches_terminated() {
        let (a, b) = loopback_pair(fast_config());

        a.write(MultiBuffer::from_bytes(b"bye")).await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(5), b.read()).await;

        a.close().unwrap();
        // reader on the passive side observes end of stream
        let eof = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match b.read().await {
                    Ok(None) => break,
                    Ok(Some(_)) => {}
                    Err(_) => break,
                }
            }
        })
        .await;
        assert!(eof.is_ok(), "passive side never saw end of stream");
        let _ = b.close();

        let both_terminated = tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                if a.state() == State::Terminated && b.state() == State::Terminated {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(both_terminated.is_ok(), "close handshake did not converge");
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (a, _b) = loopback_pair(fast_config());
        a.close().unwrap();
        assert!(a.write(MultiBuffer::from_bytes(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let (a, _b) = loopback_pair(fast_config());
        a.set_read_deadline(Some(tokio::time::Instant::now() + Duration::from_millis(50)))
            .unwrap();
        let err = a.read().await.unwrap_err();
        assert!(matches!(err, crate::error::KcpError::IoTimeout));
        // the connection survives a read timeout
        assert_eq!(a.state(), State::Active);
    }
}
