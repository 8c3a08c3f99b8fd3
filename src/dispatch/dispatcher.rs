//! The session dispatcher

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::{new_ray_pair, InboundRay, OutboundHandler, Session};
use crate::buf::MultiBuffer;
use crate::error::DispatchError;

/// Owns the instantiated outbound handlers and runs one per session.
///
/// The first handler added becomes the default; sessions dispatch to the
/// default unless a tag is named.
#[derive(Default)]
pub struct Dispatcher {
    handlers: DashMap<String, Arc<dyn OutboundHandler>>,
    default_tag: parking_lot::RwLock<Option<String>>,
}

impl Dispatcher {
    /// An empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler under its tag. The first one becomes the default.
    pub fn add_handler(&self, handler: Arc<dyn OutboundHandler>) {
        let tag = handler.tag().to_string();
        let mut default_tag = self.default_tag.write();
        if default_tag.is_none() {
            *default_tag = Some(tag.clone());
        }
        drop(default_tag);
        self.handlers.insert(tag, handler);
    }

    /// Look a handler up by tag.
    #[must_use]
    pub fn handler(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>> {
        self.handlers.get(tag).map(|h| Arc::clone(h.value()))
    }

    /// The default handler, when any was added.
    #[must_use]
    pub fn default_handler(&self) -> Option<Arc<dyn OutboundHandler>> {
        let tag = self.default_tag.read().clone()?;
        self.handler(&tag)
    }

    /// Dispatch a session to the default outbound.
    pub fn dispatch(
        &self,
        session: Session,
        payload: MultiBuffer,
    ) -> Result<InboundRay, DispatchError> {
        let handler = self
            .default_handler()
            .ok_or_else(|| DispatchError::OutboundNotFound {
                tag: "(default)".to_string(),
            })?;
        Ok(self.run(handler, session, payload))
    }

    /// Dispatch a session to a named outbound.
    pub fn dispatch_to(
        &self,
        tag: &str,
        session: Session,
        payload: MultiBuffer,
    ) -> Result<InboundRay, DispatchError> {
        let handler = self
            .handler(tag)
            .ok_or_else(|| DispatchError::OutboundNotFound {
                tag: tag.to_string(),
            })?;
        Ok(self.run(handler, session, payload))
    }

    fn run(
        &self,
        handler: Arc<dyn OutboundHandler>,
        session: Session,
        payload: MultiBuffer,
    ) -> InboundRay {
        let (inbound, outbound) = new_ray_pair();
        debug!(
            "dispatching session to {} via outbound {}",
            session.destination,
            handler.tag()
        );
        tokio::spawn(async move {
            handler
                .dispatch(session, payload, outbound.clone())
                .await;
            // whatever the handler did, the inbound side must observe
            // end of stream now
            outbound.finish().await;
        });
        inbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::Reader;
    use crate::dispatch::OutboundRay;
    use crate::net::{Address, Destination};
    use async_trait::async_trait;
    use std::time::Duration;

    struct UppercaseEcho;

    #[async_trait]
    impl OutboundHandler for UppercaseEcho {
        fn tag(&self) -> &str {
            "upper-echo"
        }

        async fn dispatch(&self, _session: Session, payload: MultiBuffer, ray: OutboundRay) {
            let mut writer = ray.writer();
            let upper: Vec<u8> = payload.to_vec().to_ascii_uppercase();
            let mut payload = payload;
            payload.release();
            use crate::buf::Writer as _;
            writer.write(MultiBuffer::from_bytes(&upper)).await.ok();
        }
    }

    fn session() -> Session {
        Session::new(
            Destination::tcp(Address::parse("127.0.0.1"), 80),
            "test-in",
        )
    }

    #[tokio::test]
    async fn test_dispatch_runs_default_handler() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_handler(Arc::new(UppercaseEcho));

        let ray = dispatcher
            .dispatch(session(), MultiBuffer::from_bytes(b"hello"))
            .unwrap();
        let mut reader = ray.reader();
        let reply = reader.read().await.unwrap().expect("reply chunk");
        assert_eq!(reply.to_vec(), b"HELLO");
        // handler returned, so the reply stream ends
        let eof = tokio::time::timeout(Duration::from_secs(1), reader.read())
            .await
            .unwrap()
            .unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_missing_outbound_is_an_error() {
        let dispatcher = Dispatcher::new();
        let err = dispatcher
            .dispatch(session(), MultiBuffer::new())
            .unwrap_err();
        assert!(matches!(err, DispatchError::OutboundNotFound { .. }));

        dispatcher.add_handler(Arc::new(UppercaseEcho));
        let err = dispatcher
            .dispatch_to("nope", session(), MultiBuffer::new())
            .unwrap_err();
        assert!(matches!(err, DispatchError::OutboundNotFound { .. }));
    }
}
