//! network - the in-memory graph of known peers and their live links.

pub mod conn;
pub mod node;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::pubsub::{Event, PubSub};
use conn::Conn;
use node::Node;

/// Topic carrying node snapshots whenever peer-graph state changes.
pub const TOPIC_NODES: &str = "network.nodes";

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network: duplicate peer [{0}]")]
    DuplicatePeer(String),
    #[error("network: unknown peer [{0}]")]
    UnknownPeer(String),
    #[error("network: tunnel state: {0}")]
    TunnelState(String),
    #[error("network: send queue overflow")]
    Backpressure,
    #[error("network: connection closed")]
    Closed,
}

/// Tuning knobs of a network, shared by every subsystem holding it.
#[derive(Debug, Clone)]
pub struct Tuning {
    pub heartbeat_ttl: Duration,
    pub dial_timeout: Duration,
    pub send_queue: usize,
}

impl Default for Tuning {
    fn default() -> Tuning {
        Tuning {
            heartbeat_ttl: Duration::from_secs(8),
            dial_timeout: Duration::from_secs(4),
            send_queue: conn::DEFAULT_SEND_QUEUE,
        }
    }
}

/// The peer graph of one booster instance: the local node, every known
/// remote node, and the live control-plane links. Reads take the read
/// lock (dispatcher, inspect); insertions and removals take the write
/// lock.
pub struct Network {
    pub local_node: Arc<Node>,
    pub pubsub: Arc<PubSub>,
    pub tuning: Tuning,
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    conns: RwLock<HashMap<String, Arc<Conn>>>,
}

impl Network {
    pub fn new(local_node: Arc<Node>, pubsub: Arc<PubSub>, tuning: Tuning) -> Arc<Network> {
        Arc::new(Network {
            local_node,
            pubsub,
            tuning,
            nodes: RwLock::new(HashMap::new()),
            conns: RwLock::new(HashMap::new()),
        })
    }

    /// Installs a connection, enforcing at most one live link per peer.
    ///
    /// On conflict the survivor is chosen deterministically: the link
    /// dialed by the endpoint with the smaller node id wins, so two peers
    /// wiring each other simultaneously converge on the same connection.
    /// The losing link is closed; if the candidate loses, `DuplicatePeer`
    /// is returned and the caller must not use it further.
    pub async fn add_conn(&self, c: Arc<Conn>) -> Result<(), NetworkError> {
        if c.id == self.local_node.id {
            return Err(NetworkError::DuplicatePeer(c.id.clone()));
        }

        let mut conns = self.conns.write().await;

        if let Some(existing) = conns.get(&c.id) {
            if !existing.is_closed() {
                // the canonical link for this pair is outbound from the
                // smaller id
                let canonical_outbound = self.local_node.id < c.id;
                let candidate_wins =
                    c.outbound == canonical_outbound && existing.outbound != canonical_outbound;
                if !candidate_wins {
                    return Err(NetworkError::DuplicatePeer(c.id.clone()));
                }
                debug!("network: replacing duplicate conn [{}]", existing.id);
                existing.close();
            }
        }

        c.set_state(conn::ConnState::Active);
        c.remote_node.set_is_active(true);

        self.nodes
            .write()
            .await
            .insert(c.id.clone(), c.remote_node.clone());
        conns.insert(c.id.clone(), c.clone());
        drop(conns);

        info!("network: new conn [{}] ({})", c.id, c.remote_node.baddr());
        self.pubsub
            .publish(TOPIC_NODES, Event::Node(c.remote_node.snapshot()));
        Ok(())
    }

    pub async fn conn(&self, id: &str) -> Option<Arc<Conn>> {
        self.conns.read().await.get(id).cloned()
    }

    pub async fn conns(&self) -> Vec<Arc<Conn>> {
        self.conns.read().await.values().cloned().collect()
    }

    /// Looks a node up by id, the local one included.
    pub async fn node(&self, id: &str) -> Option<Arc<Node>> {
        if id == self.local_node.id {
            return Some(self.local_node.clone());
        }
        self.nodes.read().await.get(id).cloned()
    }

    /// Every known node: the local one first, then the remotes.
    pub async fn nodes(&self) -> Vec<Arc<Node>> {
        let mut all = vec![self.local_node.clone()];
        all.extend(self.nodes.read().await.values().cloned());
        all
    }

    /// Tears down the link for a peer. The node stays in the graph,
    /// inactive and tunnel-less, when it is still marked for tracing;
    /// otherwise it is forgotten entirely.
    pub async fn remove_conn(&self, id: &str) -> Option<Arc<Conn>> {
        let removed = self.conns.write().await.remove(id);

        if let Some(c) = &removed {
            c.close();
            c.remote_node.set_is_active(false);
            c.remote_node.clear_tunnels();

            if !c.remote_node.to_be_traced() {
                self.nodes.write().await.remove(id);
            }

            info!("network: conn [{}] removed", id);
            self.pubsub
                .publish(TOPIC_NODES, Event::Node(c.remote_node.snapshot()));
        }
        removed
    }

    /// Closes every link, clears every tunnel set and publishes the final
    /// snapshot of each peer.
    pub async fn close_all(&self) {
        let conns: Vec<Arc<Conn>> = self.conns.write().await.drain().map(|(_, c)| c).collect();
        for c in conns {
            c.close();
            c.remote_node.set_is_active(false);
            c.remote_node.clear_tunnels();
            self.pubsub
                .publish(TOPIC_NODES, Event::Node(c.remote_node.snapshot()));
        }
        self.nodes.write().await.clear();
        self.local_node.clear_tunnels();
    }
}

/// Process-wide registry of networks, keyed by local-node id. Passed
/// explicitly to every subsystem; one runtime per test.
#[derive(Default)]
pub struct Runtime {
    nets: Mutex<HashMap<String, Arc<Network>>>,
}

impl Runtime {
    pub fn new() -> Arc<Runtime> {
        Arc::new(Runtime::default())
    }

    pub fn set(&self, id: &str, net: Arc<Network>) {
        self.nets.lock().unwrap().insert(id.to_string(), net);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Network>> {
        self.nets.lock().unwrap().get(id).cloned()
    }

    /// Drops every link of the named network. The network itself stays
    /// registered so a restarted instance reuses it.
    pub async fn close(&self, id: &str) {
        let net = self.get(id);
        if let Some(net) = net {
            net.close_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::conn::{Conn, Transport, DEFAULT_SEND_QUEUE};
    use super::*;
    use crate::protocol::payload::TunnelOp;

    fn test_net(pport: &str, bport: &str) -> Arc<Network> {
        let local = Arc::new(Node::new("localhost", pport, bport, true));
        Network::new(local, PubSub::new(), Tuning::default())
    }

    fn test_conn(pport: &str, bport: &str, outbound: bool) -> Arc<Conn> {
        let (a, _b) = tokio::io::duplex(4096);
        // the unused half leaks with the test; the conn only needs `a`
        std::mem::forget(_b);
        let (t, _rx) = Transport::new(a, None, DEFAULT_SEND_QUEUE);
        std::mem::forget(_rx);
        let node = Arc::new(Node::new("localhost", pport, bport, false));
        Conn::new(t, node, outbound)
    }

    #[tokio::test]
    async fn at_most_one_conn_per_peer() {
        let net = test_net("1080", "4884");

        let c1 = test_conn("1081", "4885", true);
        let c2 = test_conn("1081", "4885", true);
        assert_eq!(c1.id, c2.id);

        net.add_conn(c1.clone()).await.unwrap();
        match net.add_conn(c2).await {
            Err(NetworkError::DuplicatePeer(id)) => assert_eq!(id, c1.id),
            other => panic!("expected duplicate peer, got {:?}", other),
        }

        assert_eq!(net.conns().await.len(), 1);
        assert!(c1.remote_node.is_active());
    }

    #[tokio::test]
    async fn duplicate_survivor_is_outbound_from_smaller_id() {
        let net = test_net("1080", "4884");
        let local_id = net.local_node.id.clone();

        let inbound = test_conn("1081", "4885", false);
        let outbound = test_conn("1081", "4885", true);
        let remote_id = inbound.id.clone();

        net.add_conn(inbound.clone()).await.unwrap();
        let res = net.add_conn(outbound.clone()).await;

        if local_id < remote_id {
            // we are the smaller endpoint: our outbound link replaces the
            // accepted one
            res.unwrap();
            assert!(inbound.is_closed());
            let kept = net.conn(&remote_id).await.unwrap();
            assert!(kept.outbound);
        } else {
            // the peer is smaller: the accepted link stays
            assert!(matches!(res, Err(NetworkError::DuplicatePeer(_))));
            assert!(!inbound.is_closed());
        }
    }

    #[tokio::test]
    async fn own_id_is_rejected() {
        let net = test_net("1080", "4884");
        let c = test_conn("1080", "4884", true);
        assert!(matches!(
            net.add_conn(c).await,
            Err(NetworkError::DuplicatePeer(_))
        ));
    }

    #[tokio::test]
    async fn remove_conn_deactivates_and_clears_tunnels() {
        let net = test_net("1080", "4884");
        let c = test_conn("1081", "4885", true);
        net.add_conn(c.clone()).await.unwrap();

        c.remote_node.apply(TunnelOp::Open, "example.com:80").unwrap();
        c.remote_node.set_to_be_traced(true);
        assert_eq!(c.remote_node.workload(), 1);

        net.remove_conn(&c.id).await.unwrap();

        assert!(!c.remote_node.is_active());
        assert_eq!(c.remote_node.workload(), 0);
        assert!(c.is_closed());
        // still known: the tracer wants it back
        assert!(net.node(&c.id).await.is_some());
    }

    #[tokio::test]
    async fn remove_conn_forgets_untraced_peers() {
        let net = test_net("1080", "4884");
        let c = test_conn("1081", "4885", true);
        net.add_conn(c.clone()).await.unwrap();

        c.remote_node.set_to_be_traced(false);
        net.remove_conn(&c.id).await.unwrap();

        assert!(net.node(&c.id).await.is_none());
        assert_eq!(net.nodes().await.len(), 1);
    }

    #[tokio::test]
    async fn runtime_close_drops_every_conn() {
        let rt = Runtime::new();
        let net = test_net("1080", "4884");
        rt.set(&net.local_node.id, net.clone());

        let c1 = test_conn("1081", "4885", true);
        let c2 = test_conn("1082", "4886", true);
        net.add_conn(c1.clone()).await.unwrap();
        net.add_conn(c2.clone()).await.unwrap();

        rt.close(&net.local_node.id).await;

        assert!(c1.is_closed() && c2.is_closed());
        assert!(net.conns().await.is_empty());
        assert!(rt.get(&net.local_node.id).is_some());
    }
}
