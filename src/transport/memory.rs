use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use super::{Communication, CommunicationError, MessageSink};
use crate::sync::protocol::{PeerMessage, SyncProtocol};
use crate::sync::HostAddress;

/// In-process network connecting nodes by host address.
///
/// Messages go through the binary codec so tests exercise the same frames
/// as the HTTP transport. Hosts can be taken down to simulate failures.
#[derive(Default)]
pub struct MemoryNetwork {
    sinks: DashMap<HostAddress, Weak<dyn MessageSink>>,
    down: DashSet<HostAddress>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, host: &str, sink: &Arc<dyn MessageSink>) {
        self.sinks.insert(host.to_string(), Arc::downgrade(sink));
    }

    pub fn set_down(&self, host: &str, down: bool) {
        if down {
            self.down.insert(host.to_string());
        } else {
            self.down.remove(host);
        }
    }

    pub fn is_down(&self, host: &str) -> bool {
        self.down.contains(host)
    }
}

#[async_trait]
impl Communication for MemoryNetwork {
    async fn send(&self, host: &str, message: &PeerMessage) -> Result<(), CommunicationError> {
        if self.is_down(host) {
            return Err(CommunicationError::PeerUnreachable(host.to_string()));
        }

        let sink = self
            .sinks
            .get(host)
            .and_then(|sink| sink.upgrade())
            .ok_or_else(|| CommunicationError::PeerUnreachable(host.to_string()))?;

        let frame = SyncProtocol::encode(message)?;
        sink.deliver(SyncProtocol::decode(&frame)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct Inbox(Mutex<Vec<PeerMessage>>);

    impl MessageSink for Inbox {
        fn deliver(&self, message: PeerMessage) {
            self.0.lock().push(message);
        }
    }

    fn reload() -> PeerMessage {
        PeerMessage::Reload {
            document_id: "notes".to_string(),
            host: "http://owner".to_string(),
        }
    }

    #[tokio::test]
    async fn test_routes_to_registered_host() {
        let network = MemoryNetwork::new();
        let inbox = Arc::new(Inbox::default());
        let sink: Arc<dyn MessageSink> = inbox.clone();
        network.register("http://a", &sink);

        assert_ok!(network.send("http://a", &reload()).await);
        assert_eq!(inbox.0.lock().as_slice(), &[reload()]);
    }

    #[tokio::test]
    async fn test_down_and_unknown_hosts_are_unreachable() {
        let network = MemoryNetwork::new();
        let sink: Arc<dyn MessageSink> = Arc::new(Inbox::default());
        network.register("http://a", &sink);

        network.set_down("http://a", true);
        assert!(matches!(
            network.send("http://a", &reload()).await,
            Err(CommunicationError::PeerUnreachable(_))
        ));
        network.set_down("http://a", false);
        assert_ok!(network.send("http://a", &reload()).await);

        assert!(matches!(
            network.send("http://b", &reload()).await,
            Err(CommunicationError::PeerUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_sink_is_unreachable() {
        let network = MemoryNetwork::new();
        let sink: Arc<dyn MessageSink> = Arc::new(Inbox::default());
        network.register("http://a", &sink);
        drop(sink);

        assert_err!(network.send("http://a", &reload()).await);
    }
}
