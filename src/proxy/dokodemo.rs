//! Dokodemo-door: the fixed-destination inbound
//!
//! Accepts clients on a listen address and dispatches every one of them
//! to a destination fixed in configuration. Useful as a transparent
//! port-forward and as the simplest possible exercise of the dispatch
//! plane.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::buf::{pipe, MultiBuffer};
use crate::dispatch::{
    Dispatcher, InboundContext, InboundHandler, Session,
};
use crate::error::{ConfigError, DispatchError};
use crate::net::{Address, Destination, Network};
use crate::transport::{
    ConnectionReader, ConnectionWriter, StreamConnection, StreamListener, TransportSettings,
};

/// Dokodemo options: the forward destination.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DokodemoSettings {
    /// Destination host
    pub address: String,
    /// Destination port
    pub port: u16,
    /// Destination network
    pub network: Option<Network>,
}

/// Forwards every accepted client to one fixed destination.
pub struct DokodemoHandler {
    tag: String,
    listen: SocketAddr,
    destination: Destination,
    transport: TransportSettings,
    dispatcher: Arc<Dispatcher>,
    shutdown: broadcast::Sender<()>,
}

impl DokodemoHandler {
    /// Registry factory.
    pub fn factory(context: InboundContext) -> Result<Arc<dyn InboundHandler>, ConfigError> {
        let settings: DokodemoSettings = super::decode_settings(&context.settings)?;
        if settings.address.is_empty() || settings.port == 0 {
            return Err(ConfigError::validation(
                "dokodemo-door requires a forward address and port",
            ));
        }
        let destination = Destination {
            network: settings.network.unwrap_or(Network::Tcp),
            address: Address::parse(&settings.address),
            port: settings.port,
        };
        let (shutdown, _) = broadcast::channel(1);
        Ok(Arc::new(Self {
            tag: context.tag,
            listen: context.listen,
            destination,
            transport: context.transport,
            dispatcher: context.dispatcher,
            shutdown,
        }))
    }

    async fn handle_client(&self, conn: Arc<dyn StreamConnection>) {
        let session = Session::new(self.destination.clone(), self.tag.clone());
        let ray = match self.dispatcher.dispatch(session, MultiBuffer::new()) {
            Ok(ray) => ray,
            Err(err) => {
                warn!("{}: dispatch failed: {}", self.tag, err);
                let _ = conn.close().await;
                return;
            }
        };

        let uplink = async {
            let mut reader = ConnectionReader(Arc::clone(&conn));
            let mut writer = ray.writer();
            let moved = pipe(&mut reader, &mut writer).await;
            // client stopped sending: half-close toward the outbound
            ray.close_input();
            moved
        };
        let downlink = async {
            let mut reader = ray.reader();
            let mut writer = ConnectionWriter(Arc::clone(&conn));
            pipe(&mut reader, &mut writer).await
        };
        let (up, down) = tokio::join!(uplink, downlink);
        debug!(
            "{}: session to {} done (up: {:?}, down: {:?})",
            self.tag, self.destination, up, down
        );

        let _ = conn.close().await;
        ray.close().await;
    }
}

#[async_trait]
impl InboundHandler for DokodemoHandler {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn start(self: Arc<Self>) -> Result<(), DispatchError> {
        let listener = StreamListener::bind(self.listen, &self.transport)
            .await
            .map_err(|e| DispatchError::InboundStart {
                tag: self.tag.clone(),
                reason: e.to_string(),
            })?;
        info!(
            "{}: forwarding {} -> {}",
            self.tag,
            listener.local_addr(),
            self.destination
        );

        let handler = Arc::clone(&self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("{}: stopping", handler.tag);
                        return;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok(conn) => {
                                let handler = Arc::clone(&handler);
                                tokio::spawn(async move {
                                    handler.handle_client(conn).await;
                                });
                            }
                            Err(err) if err.is_recoverable() => {
                                debug!("{}: accept error: {}", handler.tag, err);
                            }
                            Err(err) => {
                                warn!("{}: listener failed: {}", handler.tag, err);
                                return;
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn close(&self) {
        let _ = self.shutdown.send(());
    }
}
