//! Freedom: the direct-dial outbound

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::buf::{pipe, MergingReader, MultiBuffer};
use crate::dispatch::{OutboundContext, OutboundHandler, OutboundRay, Session};
use crate::error::ConfigError;
use crate::transport::{ConnectionReader, ConnectionWriter, TransportDialer};

/// Freedom options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FreedomSettings {
    /// Dial timeout in seconds.
    pub timeout: u64,
    /// Mark dialed connections for the reuse pool.
    pub reuse: bool,
}

impl Default for FreedomSettings {
    fn default() -> Self {
        Self {
            timeout: 30,
            reuse: true,
        }
    }
}

/// Dials whatever destination the session asks for and pipes both
/// directions until they drain.
pub struct FreedomHandler {
    tag: String,
    dialer: TransportDialer,
    settings: FreedomSettings,
}

impl FreedomHandler {
    /// Registry factory.
    pub fn factory(
        context: OutboundContext,
    ) -> Result<Arc<dyn OutboundHandler>, ConfigError> {
        let settings: FreedomSettings = super::decode_settings(&context.settings)?;
        Ok(Arc::new(Self {
            tag: context.tag,
            dialer: TransportDialer::new(context.transport),
            settings,
        }))
    }
}

#[async_trait]
impl OutboundHandler for FreedomHandler {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn dispatch(&self, session: Session, payload: MultiBuffer, ray: OutboundRay) {
        let dest = session.destination.clone();
        let conn = match self
            .dialer
            .dial(&dest, Duration::from_secs(self.settings.timeout))
            .await
        {
            Ok(conn) => conn,
            Err(err) => {
                warn!("freedom: failed to reach {}: {}", dest, err);
                let mut payload = payload;
                payload.release();
                return;
            }
        };
        conn.set_reusable(self.settings.reuse);

        if !payload.is_empty() {
            if let Err(err) = conn.write_chunk(payload).await {
                debug!("freedom: first payload to {} failed: {}", dest, err);
                let _ = conn.close().await;
                return;
            }
        } else {
            let mut payload = payload;
            payload.release();
        }

        let uplink = async {
            let mut reader = MergingReader::new(ray.reader());
            let mut writer = ConnectionWriter(Arc::clone(&conn));
            pipe(&mut reader, &mut writer).await
        };
        let downlink = async {
            let mut reader = ConnectionReader(Arc::clone(&conn));
            let mut writer = ray.writer();
            pipe(&mut reader, &mut writer).await
        };
        let (up, down) = tokio::join!(uplink, downlink);
        debug!(
            "freedom: session to {} finished (up: {:?}, down: {:?})",
            dest, up, down
        );

        if let Err(err) = conn.close().await {
            debug!("freedom: close error for {}: {}", dest, err);
        }
    }
}
