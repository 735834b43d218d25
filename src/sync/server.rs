//! SyncNode: the async runtime around a [`SyncController`].
//!
//! This module implements the node using:
//! - One worker task per tracked document, fed by an unbounded FIFO queue,
//!   so every document is processed by a single task while documents run in
//!   parallel. Workers retire once their document is neither open nor
//!   requested; messages about untracked documents are handled in place
//! - A delivery task routing the controller's outbox onto one courier task
//!   per destination host, so messages to a host keep their order and a slow
//!   host never delays the others
//! - A broadcast channel for graceful shutdown
//!
//! Delivery failures are queued back onto the affected document's worker,
//! so a dead peer never stalls document processing.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::controller::SyncController;
use super::protocol::{DeliveryFailure, Destination, Envelope, PeerMessage};
use super::{DocumentId, HostAddress, MemberName, SyncConfig};
use crate::editor::{EditorCommand, EditorView};
use crate::transport::{Communication, MessageSink};

/// Work queued for a document's worker
#[derive(Debug)]
enum Job {
    Message(PeerMessage),
    Command(EditorCommand),
    Failure(DeliveryFailure),
}

impl Job {
    /// Whether handling the job starts tracking its document
    fn opens_document(&self) -> bool {
        matches!(
            self,
            Job::Command(EditorCommand::CreateDocument { .. })
                | Job::Command(EditorCommand::FindDocumentRequest { .. })
        )
    }
}

/// A message waiting on a host's queue
#[derive(Debug)]
struct Parcel {
    message: PeerMessage,
    /// Broadcasts are best effort; only direct messages report failures
    direct: bool,
}

/// Queue and task delivering to one host
struct Courier {
    queue: mpsc::UnboundedSender<Parcel>,
    task: JoinHandle<()>,
}

type Workers = DashMap<DocumentId, mpsc::UnboundedSender<Job>>;

/// One peer of the mesh
pub struct SyncNode {
    controller: Arc<SyncController>,
    /// Every host of the mesh; may include our own
    peers: Vec<HostAddress>,
    communication: Arc<dyn Communication>,
    /// Queue of each tracked document's worker
    workers: Arc<Workers>,
    /// Taken by the delivery task when it starts
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    /// Node start time
    started_at: Instant,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncNode {
    /// Create a node; nothing is delivered until
    /// [`start_background_tasks`](Self::start_background_tasks) runs.
    pub fn new(
        member: impl Into<MemberName>,
        host: impl Into<HostAddress>,
        peers: Vec<HostAddress>,
        config: SyncConfig,
        editor: Arc<dyn EditorView>,
        communication: Arc<dyn Communication>,
    ) -> Arc<Self> {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let controller = SyncController::new(member, host, config, editor, outbox_tx);

        Arc::new(Self {
            controller: Arc::new(controller),
            peers,
            communication,
            workers: Arc::new(DashMap::new()),
            outbox_rx: Mutex::new(Some(outbox_rx)),
            started_at: Instant::now(),
            shutdown_tx,
        })
    }

    pub fn controller(&self) -> &Arc<SyncController> {
        &self.controller
    }

    pub fn host(&self) -> &str {
        self.controller.host()
    }

    /// Queue a message received from another peer
    pub fn receive(&self, message: PeerMessage) {
        let id = message.document_id().to_string();
        self.dispatch(id, Job::Message(message));
    }

    /// Queue an intent of the local user
    pub fn command(&self, command: EditorCommand) {
        let id = command.document_id().to_string();
        self.dispatch(id, Job::Command(command));
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get node statistics
    pub fn stats(&self) -> NodeStats {
        let controller = self.controller.stats();
        NodeStats {
            member: self.controller.member().to_string(),
            host: self.controller.host().to_string(),
            owned_documents: controller.owned_documents,
            replica_documents: controller.replica_documents,
            pending_requests: controller.pending_requests,
            workers: self.workers.len(),
            peers: self.mesh().count(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    fn dispatch(&self, id: DocumentId, job: Job) {
        let tracked = job.opens_document() || self.controller.tracks(&id);

        // Jobs are queued while the entry is held so a retiring worker
        // cannot miss one.
        match self.workers.entry(id) {
            Entry::Occupied(worker) => {
                if worker.get().send(job).is_err() {
                    warn!("Worker for {} has stopped, dropping job", worker.key());
                }
            }
            Entry::Vacant(slot) if tracked => {
                let worker = self.spawn_worker(slot.key());
                if worker.send(job).is_err() {
                    warn!("Worker for {} has stopped, dropping job", slot.key());
                }
                slot.insert(worker);
            }
            Entry::Vacant(slot) => {
                drop(slot);
                run(&self.controller, job);
            }
        }
    }

    fn spawn_worker(&self, id: &str) -> mpsc::UnboundedSender<Job> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let controller = self.controller.clone();
        let workers = self.workers.clone();
        let mut shutdown = self.shutdown_receiver();
        let id = id.to_string();

        tokio::spawn(async move {
            debug!("Worker for {} started", id);
            loop {
                tokio::select! {
                    job = rx.recv() => {
                        let Some(job) = job else { break };
                        run(&controller, job);

                        let retired = !controller.tracks(&id)
                            && workers
                                .remove_if(&id, |_, _| rx.is_empty() && !controller.tracks(&id))
                                .is_some();
                        if retired {
                            debug!("Worker for {} retired", id);
                            break;
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Worker for {} shutting down", id);
                        break;
                    }
                }
            }
        });

        tx
    }

    /// Other hosts of the mesh
    fn mesh(&self) -> impl Iterator<Item = &HostAddress> {
        let own = self.controller.host();
        self.peers.iter().filter(move |host| host.as_str() != own)
    }

    /// Put an envelope on the queue of every host it is addressed to
    fn route(self: &Arc<Self>, envelope: Envelope, couriers: &mut HashMap<HostAddress, Courier>) {
        let Envelope {
            destination,
            message,
        } = envelope;

        let parcels: Vec<(HostAddress, Parcel)> = match destination {
            Destination::Host(host) => vec![(host, Parcel { message, direct: true })],
            Destination::Mesh => self
                .mesh()
                .map(|host| {
                    let parcel = Parcel {
                        message: message.clone(),
                        direct: false,
                    };
                    (host.clone(), parcel)
                })
                .collect(),
        };

        for (host, parcel) in parcels {
            let courier = couriers
                .entry(host)
                .or_insert_with_key(|host| self.spawn_courier(host.clone()));
            if courier.queue.send(parcel).is_err() {
                debug!("Courier has stopped, dropping message");
            }
        }
    }

    fn spawn_courier(self: &Arc<Self>, host: HostAddress) -> Courier {
        let (queue, mut rx) = mpsc::unbounded_channel::<Parcel>();
        let node = self.clone();
        let mut shutdown = self.shutdown_receiver();

        let task = tokio::spawn(async move {
            debug!("Courier for {} started", host);
            loop {
                tokio::select! {
                    parcel = rx.recv() => {
                        let Some(parcel) = parcel else { break };
                        node.send_parcel(&host, parcel).await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });

        Courier { queue, task }
    }

    async fn send_parcel(&self, host: &str, parcel: Parcel) {
        let Parcel { message, direct } = parcel;
        let Err(e) = self.communication.send(host, &message).await else {
            return;
        };

        if !direct {
            debug!("Broadcast of {:?} to {} failed: {}", message.message_type(), host, e);
        } else if e.is_unreachable() {
            warn!("Delivery of {:?} to {} failed: {}", message.message_type(), host, e);
            let id = message.document_id().to_string();
            self.dispatch(
                id,
                Job::Failure(DeliveryFailure {
                    host: host.to_string(),
                    message,
                }),
            );
        } else {
            // The peer is alive; it just did not take this message
            warn!("{:?} to {} was not accepted: {}", message.message_type(), host, e);
        }
    }

    /// Start the delivery task
    pub fn start_background_tasks(self: Arc<Self>) -> SyncNodeHandles {
        let node = self.clone();
        let outbox = node.outbox_rx.lock().take();
        let mut shutdown = node.shutdown_receiver();

        let delivery_handle = tokio::spawn(async move {
            let Some(mut outbox) = outbox else {
                warn!("Delivery task already started");
                return;
            };
            info!("Node {} delivering for {}", node.host(), node.controller.member());

            let mut couriers = HashMap::new();
            loop {
                tokio::select! {
                    envelope = outbox.recv() => {
                        let Some(envelope) = envelope else { break };
                        node.route(envelope, &mut couriers);
                    }
                    _ = shutdown.recv() => {
                        info!("Delivery task shutting down");
                        break;
                    }
                }
            }

            let tasks: Vec<_> = couriers.into_values().map(|courier| courier.task).collect();
            join_all(tasks).await;
        });

        SyncNodeHandles {
            delivery_task: delivery_handle,
        }
    }
}

fn run(controller: &SyncController, job: Job) {
    match job {
        Job::Message(message) => controller.handle_message(message),
        Job::Command(command) => controller.handle_command(command),
        Job::Failure(failure) => controller.handle_delivery_failure(failure),
    }
}

impl MessageSink for SyncNode {
    fn deliver(&self, message: PeerMessage) {
        self.receive(message);
    }
}

/// Node statistics
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub member: MemberName,
    pub host: HostAddress,
    pub owned_documents: usize,
    pub replica_documents: usize,
    pub pending_requests: usize,
    pub workers: usize,
    pub peers: usize,
    pub uptime_seconds: u64,
}

/// Handles for background tasks
pub struct SyncNodeHandles {
    pub delivery_task: JoinHandle<()>,
}

impl SyncNodeHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = self.delivery_task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::HeadlessEditor;
    use crate::transport::{CommunicationError, MemoryNetwork};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct TestPeer {
        node: Arc<SyncNode>,
        editor: Arc<HeadlessEditor>,
        _handles: SyncNodeHandles,
    }

    impl TestPeer {
        fn type_text(&self, id: &str, text: &str) {
            self.editor.type_text(id, text);
            self.node.command(EditorCommand::UpdateDocument {
                id: id.to_string(),
                new_text: text.to_string(),
            });
        }

        fn text(&self, id: &str) -> Option<String> {
            self.editor.get_text(id)
        }
    }

    fn host_of(member: &str) -> String {
        format!("http://{}", member)
    }

    fn mesh(network: &Arc<MemoryNetwork>, members: &[&str]) -> Vec<TestPeer> {
        mesh_over(network, network.clone(), members)
    }

    /// Peers registered on `network` that send through `communication`
    fn mesh_over(
        network: &Arc<MemoryNetwork>,
        communication: Arc<dyn Communication>,
        members: &[&str],
    ) -> Vec<TestPeer> {
        let hosts: Vec<String> = members.iter().map(|m| host_of(m)).collect();
        members
            .iter()
            .map(|member| {
                let editor = Arc::new(HeadlessEditor::new());
                let node = SyncNode::new(
                    *member,
                    host_of(member),
                    hosts.clone(),
                    SyncConfig::default(),
                    editor.clone(),
                    communication.clone(),
                );
                let sink: Arc<dyn MessageSink> = node.clone();
                network.register(&host_of(member), &sink);
                let handles = node.clone().start_background_tasks();
                TestPeer {
                    node,
                    editor,
                    _handles: handles,
                }
            })
            .collect()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 5s");
    }

    async fn share(peers: &[TestPeer], id: &str, text: &str) {
        peers[0].editor.open(id, text);
        peers[0].node.command(EditorCommand::CreateDocument { id: id.to_string() });
        wait_until(|| peers[0].node.controller().snapshot(id).is_some()).await;

        for peer in &peers[1..] {
            peer.node
                .command(EditorCommand::FindDocumentRequest { id: id.to_string() });
        }
        wait_until(|| peers.iter().all(|p| p.text(id).as_deref() == Some(text))).await;
    }

    fn converged(peers: &[TestPeer], id: &str) -> bool {
        let Some(reference) = peers[0].node.controller().snapshot(id) else {
            return false;
        };
        peers.iter().all(|peer| {
            peer.node.controller().snapshot(id).is_some_and(|s| {
                s.hash == reference.hash
                    && s.revision_id == reference.revision_id
                    && !s.has_pending_update
            }) && peer.text(id).as_deref() == Some(reference.content.as_str())
        })
    }

    #[tokio::test]
    async fn test_node_creation() {
        let network = MemoryNetwork::new();
        let peers = mesh(&network, &["max", "anna"]);

        let stats = peers[0].node.stats();
        assert_eq!(stats.member, "max");
        assert_eq!(stats.owned_documents, 0);
        assert_eq!(stats.peers, 1);
    }

    #[tokio::test]
    async fn test_replica_edit_reaches_owner() {
        let network = MemoryNetwork::new();
        let peers = mesh(&network, &["max", "anna"]);
        share(&peers, "notes", "hello").await;

        peers[1].type_text("notes", "hello world");
        wait_until(|| peers[0].text("notes").as_deref() == Some("hello world")).await;
        wait_until(|| converged(&peers, "notes")).await;

        assert_eq!(peers[0].node.stats().owned_documents, 1);
        assert_eq!(peers[1].node.stats().replica_documents, 1);
        assert_eq!(peers[0].editor.editor_count("notes"), Some(2));
    }

    #[tokio::test]
    async fn test_concurrent_edits_converge() {
        let network = MemoryNetwork::new();
        let peers = mesh(&network, &["max", "1", "2", "3"]);
        share(&peers, "notes", "alpha beta gamma delta").await;

        peers[1].type_text("notes", "Alpha beta gamma delta");
        peers[2].type_text("notes", "alpha beta gamma delta epsilon");
        peers[3].type_text("notes", "alpha beta GAMMA delta");
        peers[0].type_text("notes", "alpha beta gamma delta!");

        wait_until(|| converged(&peers, "notes")).await;
        let owner = peers[0].node.controller().snapshot("notes").unwrap();
        assert!(owner.revision_id >= 1);
        assert!(owner.content.contains("beta"));
    }

    #[tokio::test]
    async fn test_unreachable_owner_and_takeover() {
        let network = MemoryNetwork::new();
        let peers = mesh(&network, &["max", "anna", "bob"]);
        share(&peers, "notes", "draft").await;

        network.set_down(&host_of("max"), true);
        peers[1].type_text("notes", "draft two");
        wait_until(|| peers[1].editor.is_unreachable("notes")).await;

        peers[1]
            .node
            .command(EditorCommand::TakeOwnership { id: "notes".to_string() });
        wait_until(|| {
            peers[2]
                .node
                .controller()
                .snapshot("notes")
                .is_some_and(|s| s.owner == "anna" && s.content == "draft two")
        })
        .await;

        peers[2].type_text("notes", "draft three");
        wait_until(|| peers[1].text("notes").as_deref() == Some("draft three")).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_delivery() {
        let network = MemoryNetwork::new();
        let editor = Arc::new(HeadlessEditor::new());
        let node = SyncNode::new(
            "max",
            host_of("max"),
            vec![host_of("max")],
            SyncConfig::default(),
            editor,
            network.clone(),
        );
        let handles = node.clone().start_background_tasks();

        node.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handles.wait())
            .await
            .unwrap();
    }

    /// Once switched on, refuses everything sent to one host; passes the
    /// rest through
    struct Refusing {
        inner: Arc<MemoryNetwork>,
        host: String,
        on: AtomicBool,
        refused: AtomicUsize,
    }

    #[async_trait]
    impl Communication for Refusing {
        async fn send(&self, host: &str, message: &PeerMessage) -> Result<(), CommunicationError> {
            if host == self.host && self.on.load(Ordering::SeqCst) {
                self.refused.fetch_add(1, Ordering::SeqCst);
                return Err(CommunicationError::Rejected {
                    host: host.to_string(),
                    status: 413,
                });
            }
            self.inner.send(host, message).await
        }
    }

    /// Records every send; one host hangs for a long time and then fails
    struct Stalling {
        dead: String,
        delivered: Mutex<Vec<(String, PeerMessage)>>,
    }

    #[async_trait]
    impl Communication for Stalling {
        async fn send(&self, host: &str, message: &PeerMessage) -> Result<(), CommunicationError> {
            if host == self.dead {
                tokio::time::sleep(Duration::from_secs(30)).await;
                return Err(CommunicationError::PeerUnreachable(host.to_string()));
            }
            self.delivered.lock().push((host.to_string(), message.clone()));
            Ok(())
        }
    }

    fn find(id: &str, member: &str) -> PeerMessage {
        PeerMessage::FindDocument {
            host: host_of(member),
            document_id: id.to_string(),
            member_name: member.to_string(),
        }
    }

    #[tokio::test]
    async fn test_rejected_delivery_is_not_a_failure() {
        let network = MemoryNetwork::new();
        let refusing = Arc::new(Refusing {
            inner: network.clone(),
            host: host_of("max"),
            on: AtomicBool::new(false),
            refused: AtomicUsize::new(0),
        });
        let peers = mesh_over(&network, refusing.clone(), &["max", "anna"]);
        share(&peers, "notes", "hello").await;

        refusing.on.store(true, Ordering::SeqCst);
        peers[1].type_text("notes", "hello there");
        wait_until(|| refusing.refused.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The owner answered; it is not reported as gone
        assert!(!peers[1].editor.is_unreachable("notes"));
        let replica = peers[1].node.controller().snapshot("notes").unwrap();
        assert!(replica.has_pending_update);
    }

    #[tokio::test]
    async fn test_slow_host_does_not_delay_others() {
        let stalling = Arc::new(Stalling {
            dead: host_of("dead"),
            delivered: Mutex::new(Vec::new()),
        });
        let editor = Arc::new(HeadlessEditor::new());
        let node = SyncNode::new(
            "max",
            host_of("max"),
            vec![host_of("max")],
            SyncConfig::default(),
            editor.clone(),
            stalling.clone(),
        );
        let _handles = node.clone().start_background_tasks();

        for (id, text) in [("a", "alpha"), ("b", "beta")] {
            editor.open(id, text);
            node.command(EditorCommand::CreateDocument { id: id.to_string() });
        }
        wait_until(|| node.controller().list().len() == 2).await;

        node.receive(find("a", "dead"));
        node.receive(find("b", "live"));
        let started = Instant::now();
        wait_until(|| {
            stalling
                .delivered
                .lock()
                .iter()
                .any(|(host, message)| *host == host_of("live") && message.document_id() == "b")
        })
        .await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_untracked_documents_get_no_worker() {
        let network = MemoryNetwork::new();
        let peers = mesh(&network, &["max"]);

        for i in 0..100 {
            peers[0].node.receive(find(&format!("doc{}", i), "anna"));
        }
        assert_eq!(peers[0].node.stats().workers, 0);
        assert_eq!(peers[0].node.stats().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_worker_retires_after_removal() {
        let network = MemoryNetwork::new();
        let peers = mesh(&network, &["max", "anna"]);
        share(&peers, "notes", "hello").await;
        assert_eq!(peers[1].node.stats().workers, 1);

        peers[1]
            .node
            .command(EditorCommand::RemoveDocument { id: "notes".to_string() });
        wait_until(|| peers[1].node.stats().workers == 0).await;
        assert!(peers[1].node.controller().snapshot("notes").is_none());
    }
}
