//! Peer discovery
//!
//! Pre-cluster-formation discovery of master-eligible peers, used during
//! node startup and after a master failure. While activated, the finder
//! periodically asks a hosts provider for seed addresses, probes every
//! address it has not connected to yet (one in-flight attempt per address,
//! 30s connect timeout), exchanges peer lists with every connected peer,
//! and escalates when a response names an active master with a term at
//! least as high as ours.
//!
//! # Example
//!
//! ```ignore
//! use basalt_cluster::discovery::{PeerFinder, StaticHostsProvider};
//!
//! let finder = PeerFinder::new(local_node, config, hosts, connector);
//! let mut events = finder.subscribe();
//! finder.activate(last_accepted_nodes);
//! while let Ok(event) = events.recv().await {
//!     // PeersChanged / ActiveMasterFound
//! }
//! ```

use crate::config::ClusterConfig;
use crate::error::Result;
use crate::metrics::{record_peer_probe, update_known_peers};
use crate::transport::{actions, TransportAction};
use async_trait::async_trait;
use basalt::node::{DiscoveryNode, DiscoveryNodes};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Peer list exchange request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersRequest {
    pub source_node: DiscoveryNode,
    pub known_peers: Vec<DiscoveryNode>,
}

/// Peer list exchange response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersResponse {
    /// The active master, if the responder follows one
    pub master_node: Option<DiscoveryNode>,
    pub known_peers: Vec<DiscoveryNode>,
    pub term: u64,
}

impl TransportAction for PeersRequest {
    const NAME: &'static str = actions::REQUEST_PEERS;
    type Response = PeersResponse;
}

/// Yields seed addresses to probe
#[async_trait]
pub trait HostsProvider: Send + Sync {
    async fn seed_addresses(&self) -> Vec<String>;
}

/// Fixed list of seed addresses from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticHostsProvider {
    addresses: Vec<String>,
}

impl StaticHostsProvider {
    pub fn new<S: Into<String>>(addresses: Vec<S>) -> Self {
        Self {
            addresses: addresses.into_iter().map(|s| s.into()).collect(),
        }
    }
}

#[async_trait]
impl HostsProvider for StaticHostsProvider {
    async fn seed_addresses(&self) -> Vec<String> {
        self.addresses.clone()
    }
}

/// Opens probe connections and runs the peers exchange
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Attempt an outgoing master-eligible connection to an address
    async fn connect(&self, address: &str) -> Result<DiscoveryNode>;

    /// Ask a connected peer for its view of the cluster
    async fn request_peers(&self, peer: &DiscoveryNode, request: PeersRequest)
        -> Result<PeersResponse>;
}

/// Events emitted by the peer finder
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The set of connected master-eligible peers changed
    PeersChanged(Vec<DiscoveryNode>),

    /// A response named an active master with `term >= current`
    ActiveMasterFound { master: DiscoveryNode, term: u64 },
}

#[derive(Debug, Default)]
struct Peer {
    node: Option<DiscoveryNode>,
    probe_in_flight: bool,
    request_in_flight: bool,
    failures: u32,
    cooldown_rounds: u32,
}

#[derive(Default)]
struct FinderState {
    active: bool,
    last_accepted_nodes: DiscoveryNodes,
    leader: Option<DiscoveryNode>,
    peers: HashMap<String, Peer>,
    round_task: Option<JoinHandle<()>>,
}

struct FinderInner {
    local_node: DiscoveryNode,
    config: ClusterConfig,
    hosts: Arc<dyn HostsProvider>,
    connector: Arc<dyn PeerConnector>,
    state: Mutex<FinderState>,
    term: AtomicU64,
    events: broadcast::Sender<PeerEvent>,
}

/// Discovers master-eligible peers before the cluster has formed
pub struct PeerFinder {
    inner: Arc<FinderInner>,
}

impl PeerFinder {
    pub fn new(
        local_node: DiscoveryNode,
        config: ClusterConfig,
        hosts: Arc<dyn HostsProvider>,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(FinderInner {
                local_node,
                config,
                hosts,
                connector,
                state: Mutex::new(FinderState::default()),
                term: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Subscribe to peer events
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    /// The current election term this node knows of
    pub fn current_term(&self) -> u64 {
        self.inner.term.load(Ordering::SeqCst)
    }

    pub fn set_current_term(&self, term: u64) {
        self.inner.term.fetch_max(term, Ordering::SeqCst);
    }

    /// Connected master-eligible peers
    pub fn known_peers(&self) -> Vec<DiscoveryNode> {
        self.inner
            .state
            .lock()
            .peers
            .values()
            .filter_map(|p| p.node.clone())
            .collect()
    }

    /// Start probing, seeded with the node set of the last accepted state
    pub fn activate(&self, last_accepted_nodes: DiscoveryNodes) {
        let mut state = self.inner.state.lock();
        if state.active {
            return;
        }
        info!("peer finder activated");
        state.active = true;
        state.last_accepted_nodes = last_accepted_nodes;
        state.leader = None;
        let inner = Arc::clone(&self.inner);
        state.round_task = Some(tokio::spawn(async move { run_rounds(inner).await }));
    }

    /// Stop probing; `leader` is the master we are now following, answered
    /// to peers that keep asking
    pub fn deactivate(&self, leader: Option<DiscoveryNode>) {
        let task = {
            let mut state = self.inner.state.lock();
            if !state.active {
                state.leader = leader;
                return;
            }
            info!("peer finder deactivated");
            state.active = false;
            state.leader = leader;
            state.peers.clear();
            state.round_task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        update_known_peers(0);
        let _ = self.inner.events.send(PeerEvent::PeersChanged(Vec::new()));
    }

    /// Answer a peers request from another node. A request is itself a
    /// discovery hint: the sender becomes a probe candidate.
    pub fn handle_peers_request(&self, request: PeersRequest) -> PeersResponse {
        let term = self.current_term();
        let (active, leader, known) = {
            let state = self.inner.state.lock();
            (
                state.active,
                state.leader.clone(),
                state
                    .peers
                    .values()
                    .filter_map(|p| p.node.clone())
                    .collect::<Vec<_>>(),
            )
        };
        if active
            && request.source_node.is_master_eligible()
            && request.source_node.id != self.inner.local_node.id
        {
            spawn_probe(&self.inner, request.source_node.address.clone());
        }
        if active {
            PeersResponse {
                master_node: None,
                known_peers: known,
                term,
            }
        } else {
            PeersResponse {
                master_node: leader,
                known_peers: Vec::new(),
                term,
            }
        }
    }
}

impl Drop for PeerFinder {
    fn drop(&mut self) {
        if let Some(task) = self.inner.state.lock().round_task.take() {
            task.abort();
        }
    }
}

/// Answer incoming peers requests on `node_id` with the finder's view
pub fn register_peers_handler(
    transport: &crate::transport::LocalTransport,
    node_id: &str,
    finder: Arc<PeerFinder>,
) {
    transport.register::<PeersRequest, _, _>(node_id, move |request| {
        let finder = Arc::clone(&finder);
        async move { Ok(finder.handle_peers_request(request)) }
    });
}

async fn run_rounds(inner: Arc<FinderInner>) {
    loop {
        if !inner.state.lock().active {
            return;
        }
        run_round(&inner).await;
        tokio::time::sleep(inner.config.find_peers_interval()).await;
    }
}

async fn run_round(inner: &Arc<FinderInner>) {
    // fresh seed addresses plus the master-eligible nodes of the last
    // accepted cluster state
    let mut addresses = inner.hosts.seed_addresses().await;
    {
        let state = inner.state.lock();
        addresses.extend(
            state
                .last_accepted_nodes
                .master_eligible_nodes()
                .map(|n| n.address.clone()),
        );
        addresses.extend(state.peers.keys().cloned());
    }
    addresses.sort();
    addresses.dedup();

    for address in addresses {
        spawn_probe(inner, address);
    }

    // exchange peer lists with every connected peer
    let connected: Vec<DiscoveryNode> = {
        let mut state = inner.state.lock();
        if !state.active {
            return;
        }
        let mut connected = Vec::new();
        for peer in state.peers.values_mut() {
            if let Some(node) = &peer.node {
                if !peer.request_in_flight {
                    peer.request_in_flight = true;
                    connected.push(node.clone());
                }
            }
        }
        connected
    };
    for peer in connected {
        spawn_peers_request(inner, peer);
    }
}

fn spawn_probe(inner: &Arc<FinderInner>, address: String) {
    if address == inner.local_node.address {
        return;
    }
    {
        let mut state = inner.state.lock();
        if !state.active {
            return;
        }
        let peer = state.peers.entry(address.clone()).or_default();
        if peer.probe_in_flight || peer.node.is_some() {
            return;
        }
        if peer.cooldown_rounds > 0 {
            peer.cooldown_rounds -= 1;
            return;
        }
        peer.probe_in_flight = true;
    }

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let result = tokio::time::timeout(
            inner.config.probe_connect_timeout(),
            inner.connector.connect(&address),
        )
        .await;

        let mut guard = inner.state.lock();
        let state = &mut *guard;
        let Some(peer) = state.peers.get_mut(&address) else {
            return;
        };
        peer.probe_in_flight = false;
        if !state.active {
            return;
        }
        match result {
            Ok(Ok(node)) if node.id == inner.local_node.id => {
                // connected to ourselves through a published address
                state.peers.remove(&address);
            }
            Ok(Ok(node)) if node.is_master_eligible() => {
                debug!("connected to master-eligible peer {node}");
                record_peer_probe("connected");
                peer.node = Some(node);
                peer.failures = 0;
                notify_peers_changed(&inner, state);
            }
            Ok(Ok(node)) => {
                debug!("dropping probe to {node}: not master-eligible");
                record_peer_probe("not_master_eligible");
                state.peers.remove(&address);
            }
            Ok(Err(e)) => {
                warn!("probe to {address} failed: {e}");
                record_peer_probe("failed");
                peer.failures += 1;
                peer.cooldown_rounds = backoff_rounds(peer.failures);
            }
            Err(_) => {
                warn!("probe to {address} timed out");
                record_peer_probe("timeout");
                peer.failures += 1;
                peer.cooldown_rounds = backoff_rounds(peer.failures);
            }
        }
    });
}

/// Rounds to skip before re-probing a failing address, with jitter so a
/// restarted cluster does not probe in lockstep
fn backoff_rounds(failures: u32) -> u32 {
    let base = failures.saturating_sub(1).min(5);
    base + rand::random::<u32>() % 2
}

fn spawn_peers_request(inner: &Arc<FinderInner>, peer: DiscoveryNode) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let request = PeersRequest {
            source_node: inner.local_node.clone(),
            known_peers: inner
                .state
                .lock()
                .peers
                .values()
                .filter_map(|p| p.node.clone())
                .collect(),
        };
        let result = tokio::time::timeout(
            inner.config.request_peers_timeout(),
            inner.connector.request_peers(&peer, request),
        )
        .await;

        {
            let mut state = inner.state.lock();
            if let Some(entry) = state.peers.get_mut(&peer.address) {
                entry.request_in_flight = false;
            }
            if !state.active {
                return;
            }
        }

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                debug!("peers request to {peer} failed: {e}");
                return;
            }
            Err(_) => {
                debug!("peers request to {peer} timed out");
                return;
            }
        };

        // learn addresses this peer knows about
        for node in &response.known_peers {
            if node.is_master_eligible() {
                spawn_probe(&inner, node.address.clone());
            }
        }

        let current = inner.term.load(Ordering::SeqCst);
        if let Some(master) = response.master_node {
            if response.term >= current {
                info!("peer {peer} reports active master {master} at term {}", response.term);
                inner.term.fetch_max(response.term, Ordering::SeqCst);
                let _ = inner.events.send(PeerEvent::ActiveMasterFound {
                    master,
                    term: response.term,
                });
            }
        }
    });
}

fn notify_peers_changed(inner: &FinderInner, state: &FinderState) {
    let peers: Vec<DiscoveryNode> = state.peers.values().filter_map(|p| p.node.clone()).collect();
    update_known_peers(peers.len());
    let _ = inner.events.send(PeerEvent::PeersChanged(peers));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClusterError;
    use basalt::node::NodeRole;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn node(id: &str, address: &str) -> DiscoveryNode {
        DiscoveryNode::new(id, id, address)
    }

    /// Connector over a fixed world: reachable nodes answer, blackholed
    /// addresses hang forever, everything else is refused.
    struct WorldConnector {
        nodes: HashMap<String, DiscoveryNode>,
        blackholes: HashSet<String>,
        attempts: Mutex<HashMap<String, usize>>,
        in_flight: Mutex<HashMap<String, usize>>,
        max_in_flight: AtomicUsize,
    }

    impl WorldConnector {
        fn new(nodes: Vec<DiscoveryNode>, blackholes: Vec<&str>) -> Self {
            Self {
                nodes: nodes.into_iter().map(|n| (n.address.clone(), n)).collect(),
                blackholes: blackholes.into_iter().map(|s| s.to_string()).collect(),
                attempts: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn attempts(&self, address: &str) -> usize {
            self.attempts.lock().get(address).copied().unwrap_or(0)
        }
    }

    /// Decrements the in-flight count even when the probe future is
    /// cancelled by the finder's connect timeout
    struct InFlightGuard<'a> {
        connector: &'a WorldConnector,
        address: String,
    }

    impl Drop for InFlightGuard<'_> {
        fn drop(&mut self) {
            if let Some(count) = self.connector.in_flight.lock().get_mut(&self.address) {
                *count -= 1;
            }
        }
    }

    #[async_trait]
    impl PeerConnector for WorldConnector {
        async fn connect(&self, address: &str) -> Result<DiscoveryNode> {
            *self.attempts.lock().entry(address.to_string()).or_insert(0) += 1;
            {
                let mut in_flight = self.in_flight.lock();
                let count = in_flight.entry(address.to_string()).or_insert(0);
                *count += 1;
                self.max_in_flight.fetch_max(*count, Ordering::SeqCst);
            }
            let _guard = InFlightGuard {
                connector: self,
                address: address.to_string(),
            };
            if self.blackholes.contains(address) {
                futures::future::pending::<Result<DiscoveryNode>>().await
            } else {
                match self.nodes.get(address) {
                    Some(node) => Ok(node.clone()),
                    None => Err(ClusterError::Connection(format!("refused: {address}"))),
                }
            }
        }

        async fn request_peers(
            &self,
            peer: &DiscoveryNode,
            _request: PeersRequest,
        ) -> Result<PeersResponse> {
            // peers answer with their own world view; static worlds answer
            // with every node they can see
            if !self.nodes.contains_key(&peer.address) {
                return Err(ClusterError::Connection(format!("refused: {}", peer.address)));
            }
            Ok(PeersResponse {
                master_node: None,
                known_peers: self.nodes.values().cloned().collect(),
                term: 0,
            })
        }
    }

    fn finder(
        seeds: Vec<&str>,
        connector: Arc<WorldConnector>,
    ) -> PeerFinder {
        PeerFinder::new(
            node("local", "10.0.0.1:4300"),
            ClusterConfig::default(),
            Arc::new(StaticHostsProvider::new(seeds)),
            connector,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovers_reachable_master_eligible_peers() {
        let connector = Arc::new(WorldConnector::new(
            vec![node("n2", "10.0.0.2:4300"), node("n3", "10.0.0.3:4300")],
            vec![],
        ));
        let finder = finder(vec!["10.0.0.2:4300", "10.0.0.3:4300"], Arc::clone(&connector));
        finder.activate(DiscoveryNodes::default());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let peers: HashSet<String> =
            finder.known_peers().into_iter().map(|n| n.id).collect();
        assert_eq!(peers, ["n2".to_string(), "n3".to_string()].into_iter().collect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_master_eligible_peers_are_dropped() {
        let data_only = node("n2", "10.0.0.2:4300").with_roles([NodeRole::Data]);
        let connector = Arc::new(WorldConnector::new(vec![data_only], vec![]));
        let finder = finder(vec!["10.0.0.2:4300"], Arc::clone(&connector));
        finder.activate(DiscoveryNodes::default());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(finder.known_peers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blackholed_address_times_out_then_retries() {
        let connector = Arc::new(WorldConnector::new(
            vec![node("n2", "10.0.0.2:4300")],
            vec!["10.0.0.9:4300"],
        ));
        let finder = finder(
            vec!["10.0.0.2:4300", "10.0.0.9:4300"],
            Arc::clone(&connector),
        );
        finder.activate(DiscoveryNodes::default());

        // after one interval the reachable peer is known, the blackholed
        // address is still in flight
        tokio::time::sleep(Duration::from_secs(2)).await;
        let peers: Vec<String> = finder.known_peers().into_iter().map(|n| n.id).collect();
        assert_eq!(peers, vec!["n2".to_string()]);
        assert_eq!(connector.attempts("10.0.0.9:4300"), 1);

        // after the 30s connect timeout plus an interval, a retry happens
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(connector.attempts("10.0.0.9:4300") >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_in_flight_probe_per_address() {
        let connector = Arc::new(WorldConnector::new(vec![], vec!["10.0.0.9:4300"]));
        let finder = finder(vec!["10.0.0.9:4300"], Arc::clone(&connector));
        finder.activate(DiscoveryNodes::default());

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(connector.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(connector.attempts("10.0.0.9:4300") >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitive_discovery_via_peers_request() {
        // seed only knows n2; n2's world contains n3
        let connector = Arc::new(WorldConnector::new(
            vec![node("n2", "10.0.0.2:4300"), node("n3", "10.0.0.3:4300")],
            vec![],
        ));
        let finder = finder(vec!["10.0.0.2:4300"], Arc::clone(&connector));
        finder.activate(DiscoveryNodes::default());

        tokio::time::sleep(Duration::from_secs(3)).await;
        let peers: HashSet<String> =
            finder.known_peers().into_iter().map(|n| n.id).collect();
        assert!(peers.contains("n3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_accepted_nodes_are_probed() {
        let connector = Arc::new(WorldConnector::new(vec![node("n2", "10.0.0.2:4300")], vec![]));
        let finder = finder(vec![], Arc::clone(&connector));
        let mut accepted = DiscoveryNodes::builder();
        accepted.add(node("n2", "10.0.0.2:4300"));
        finder.activate(accepted.build());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(finder.known_peers().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_clears_peers_once() {
        let connector = Arc::new(WorldConnector::new(vec![node("n2", "10.0.0.2:4300")], vec![]));
        let finder = finder(vec!["10.0.0.2:4300"], Arc::clone(&connector));
        let mut events = finder.subscribe();
        finder.activate(DiscoveryNodes::default());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(finder.known_peers().len(), 1);

        finder.deactivate(Some(node("n2", "10.0.0.2:4300")));
        assert!(finder.known_peers().is_empty());

        let mut cleared = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(&event, PeerEvent::PeersChanged(peers) if peers.is_empty()) {
                cleared += 1;
            }
        }
        assert_eq!(cleared, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_answering() {
        let connector = Arc::new(WorldConnector::new(vec![node("n2", "10.0.0.2:4300")], vec![]));
        let finder = finder(vec!["10.0.0.2:4300"], Arc::clone(&connector));
        finder.set_current_term(7);

        // inactive: answer the last known leader and no peers
        finder.deactivate(Some(node("n9", "10.0.0.9:4300")));
        let response = finder.handle_peers_request(PeersRequest {
            source_node: node("n2", "10.0.0.2:4300"),
            known_peers: vec![],
        });
        assert_eq!(response.master_node.map(|n| n.id), Some("n9".to_string()));
        assert!(response.known_peers.is_empty());
        assert_eq!(response.term, 7);

        // active: answer no master and the current peer set
        finder.activate(DiscoveryNodes::default());
        tokio::time::sleep(Duration::from_secs(2)).await;
        let response = finder.handle_peers_request(PeersRequest {
            source_node: node("n3", "10.0.0.3:4300"),
            known_peers: vec![],
        });
        assert!(response.master_node.is_none());
        assert_eq!(response.known_peers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peers_exchange_over_transport() {
        use crate::transport::{send_request, LocalTransport};

        let connector = Arc::new(WorldConnector::new(vec![], vec![]));
        let finder = Arc::new(finder(vec![], Arc::clone(&connector)));
        finder.set_current_term(3);
        finder.deactivate(Some(node("n9", "10.0.0.9:4300")));

        let transport = LocalTransport::new();
        register_peers_handler(&transport, "local", Arc::clone(&finder));

        let response = send_request(
            &transport,
            "local",
            &PeersRequest {
                source_node: node("n2", "10.0.0.2:4300"),
                known_peers: vec![],
            },
        )
        .await
        .unwrap();
        assert_eq!(response.term, 3);
        assert_eq!(response.master_node.map(|n| n.id), Some("n9".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_master_escalation() {
        struct MasterAnnouncingConnector {
            peer: DiscoveryNode,
            master: DiscoveryNode,
        }

        #[async_trait]
        impl PeerConnector for MasterAnnouncingConnector {
            async fn connect(&self, address: &str) -> Result<DiscoveryNode> {
                if address == self.peer.address {
                    Ok(self.peer.clone())
                } else {
                    Err(ClusterError::Connection("refused".into()))
                }
            }

            async fn request_peers(
                &self,
                _peer: &DiscoveryNode,
                _request: PeersRequest,
            ) -> Result<PeersResponse> {
                Ok(PeersResponse {
                    master_node: Some(self.master.clone()),
                    known_peers: vec![],
                    term: 9,
                })
            }
        }

        let peer = node("n2", "10.0.0.2:4300");
        let master = node("n3", "10.0.0.3:4300");
        let finder = PeerFinder::new(
            node("local", "10.0.0.1:4300"),
            ClusterConfig::default(),
            Arc::new(StaticHostsProvider::new(vec!["10.0.0.2:4300"])),
            Arc::new(MasterAnnouncingConnector {
                peer,
                master: master.clone(),
            }),
        );
        finder.set_current_term(5);
        let mut events = finder.subscribe();
        finder.activate(DiscoveryNodes::default());

        tokio::time::sleep(Duration::from_secs(3)).await;
        let mut found = None;
        while let Ok(event) = events.try_recv() {
            if let PeerEvent::ActiveMasterFound { master, term } = event {
                found = Some((master, term));
            }
        }
        let (found_master, term) = found.expect("master escalation");
        assert_eq!(found_master.id, master.id);
        assert_eq!(term, 9);
        assert_eq!(finder.current_term(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_term_master_not_escalated() {
        struct StaleMasterConnector {
            peer: DiscoveryNode,
        }

        #[async_trait]
        impl PeerConnector for StaleMasterConnector {
            async fn connect(&self, _address: &str) -> Result<DiscoveryNode> {
                Ok(self.peer.clone())
            }

            async fn request_peers(
                &self,
                _peer: &DiscoveryNode,
                _request: PeersRequest,
            ) -> Result<PeersResponse> {
                Ok(PeersResponse {
                    master_node: Some(node("n3", "10.0.0.3:4300")),
                    known_peers: vec![],
                    term: 2,
                })
            }
        }

        let finder = PeerFinder::new(
            node("local", "10.0.0.1:4300"),
            ClusterConfig::default(),
            Arc::new(StaticHostsProvider::new(vec!["10.0.0.2:4300"])),
            Arc::new(StaleMasterConnector {
                peer: node("n2", "10.0.0.2:4300"),
            }),
        );
        finder.set_current_term(5);
        let mut events = finder.subscribe();
        finder.activate(DiscoveryNodes::default());

        tokio::time::sleep(Duration::from_secs(3)).await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, PeerEvent::ActiveMasterFound { .. }));
        }
        assert_eq!(finder.current_term(), 5);
    }
}
