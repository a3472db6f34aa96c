//! node.rs - identity, liveness and load of a single peer.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use sha1::{Digest, Sha1};

use crate::network::NetworkError;
use crate::protocol::payload::{PayloadNode, TunnelInfo, TunnelOp};

/// SHA-1 over the given byte slices, hex encoded. Node and tunnel
/// identifiers are built this way.
pub fn sha1_hex(images: &[&[u8]]) -> String {
    let mut h = Sha1::new();
    for image in images {
        h.update(image);
    }
    hex::encode(h.finalize())
}

/// One live proxied session carried by a peer. `copies` counts
/// simultaneous identical sessions towards the same target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub id: String,
    pub target: String,
    pub copies: u32,
    /// A freshly opened tunnel is pending until an Ack event confirms it.
    pub confirmed: bool,
}

impl Tunnel {
    pub fn new(target: &str) -> Tunnel {
        Tunnel {
            id: sha1_hex(&[target.as_bytes()]),
            target: target.to_string(),
            copies: 1,
            confirmed: false,
        }
    }
}

#[derive(Debug, Default)]
struct NodeState {
    is_active: bool,
    to_be_traced: bool,
    tunnels: BTreeMap<String, Tunnel>,
    rtt_ewma: Option<Duration>,
    bw_download: u64,
    bw_upload: u64,
}

/// A peer identity plus its mutable state. The id is stable per listener
/// pair: hex of SHA-1 over proxy-port and booster-port.
#[derive(Debug)]
pub struct Node {
    pub id: String,
    pub host: String,
    pub pport: String,
    pub bport: String,
    pub is_local: bool,
    state: Mutex<NodeState>,
}

/// An immutable copy of a node's state, as published on the bus and
/// serialised into Node packets.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub id: String,
    pub host: String,
    pub pport: String,
    pub bport: String,
    pub is_local: bool,
    pub is_active: bool,
    pub to_be_traced: bool,
    pub tunnels: Vec<Tunnel>,
}

impl NodeSnapshot {
    pub fn paddr(&self) -> String {
        format!("{}:{}", self.host, self.pport)
    }

    pub fn baddr(&self) -> String {
        format!("{}:{}", self.host, self.bport)
    }

    pub fn workload(&self) -> u32 {
        self.tunnels.iter().map(|t| t.copies).sum()
    }
}

impl Node {
    pub fn new(host: &str, pport: &str, bport: &str, is_local: bool) -> Node {
        Node {
            id: sha1_hex(&[pport.as_bytes(), bport.as_bytes()]),
            host: host.to_string(),
            pport: pport.to_string(),
            bport: bport.to_string(),
            is_local,
            state: Mutex::new(NodeState::default()),
        }
    }

    /// Proxy address, `host:pport`.
    pub fn paddr(&self) -> String {
        format!("{}:{}", self.host, self.pport)
    }

    /// Booster (control-plane) address, `host:bport`.
    pub fn baddr(&self) -> String {
        format!("{}:{}", self.host, self.bport)
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().is_active
    }

    pub fn set_is_active(&self, active: bool) {
        self.state.lock().unwrap().is_active = active;
    }

    pub fn to_be_traced(&self) -> bool {
        self.state.lock().unwrap().to_be_traced
    }

    pub fn set_to_be_traced(&self, trace: bool) {
        self.state.lock().unwrap().to_be_traced = trace;
    }

    /// Total active tunnel copies across the node.
    pub fn workload(&self) -> u32 {
        self.state
            .lock()
            .unwrap()
            .tunnels
            .values()
            .map(|t| t.copies)
            .sum()
    }

    /// Applies one tunnel lifecycle event atomically.
    ///
    /// `Open` inserts a pending tunnel or increments its copies. `Close`
    /// decrements and removes at zero. `Ack` flips pending to confirmed.
    /// Close or Ack of an unknown tunnel fails with `TunnelState`.
    pub fn apply(&self, op: TunnelOp, target: &str) -> Result<(), NetworkError> {
        let tid = sha1_hex(&[target.as_bytes()]);
        let mut state = self.state.lock().unwrap();

        match op {
            TunnelOp::Open => {
                match state.tunnels.get_mut(&tid) {
                    Some(t) => t.copies += 1,
                    None => {
                        state.tunnels.insert(tid, Tunnel::new(target));
                    }
                }
                Ok(())
            }
            TunnelOp::Close => {
                let t = state.tunnels.get_mut(&tid).ok_or_else(|| {
                    NetworkError::TunnelState(format!("close of unknown tunnel [{}]", target))
                })?;
                t.copies = t.copies.saturating_sub(1);
                if t.copies == 0 {
                    state.tunnels.remove(&tid);
                }
                Ok(())
            }
            TunnelOp::Ack => {
                let t = state.tunnels.get_mut(&tid).ok_or_else(|| {
                    NetworkError::TunnelState(format!("ack of unknown tunnel [{}]", target))
                })?;
                t.confirmed = true;
                Ok(())
            }
        }
    }

    /// Replaces the whole tunnel set with an authoritative snapshot.
    pub fn replace_tunnels(&self, tunnels: Vec<Tunnel>) {
        let mut state = self.state.lock().unwrap();
        state.tunnels = tunnels.into_iter().map(|t| (t.id.clone(), t)).collect();
    }

    /// Drops every tunnel, as done when the link to the peer goes away.
    pub fn clear_tunnels(&self) {
        self.state.lock().unwrap().tunnels.clear();
    }

    /// Folds a round-trip sample into the heartbeat EWMA used as the
    /// dispatcher tie-break.
    pub fn record_rtt(&self, sample: Duration) {
        let mut state = self.state.lock().unwrap();
        state.rtt_ewma = Some(match state.rtt_ewma {
            Some(prev) => prev.mul_f64(0.8) + sample.mul_f64(0.2),
            None => sample,
        });
    }

    pub fn rtt_ewma(&self) -> Option<Duration> {
        self.state.lock().unwrap().rtt_ewma
    }

    pub fn record_bandwidth(&self, download: bool, bandwidth: u64) {
        let mut state = self.state.lock().unwrap();
        if download {
            state.bw_download = bandwidth;
        } else {
            state.bw_upload = bandwidth;
        }
    }

    /// Last reported `(download, upload)` figures, in bytes per second.
    pub fn bandwidth(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap();
        (state.bw_download, state.bw_upload)
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.lock().unwrap();
        NodeSnapshot {
            id: self.id.clone(),
            host: self.host.clone(),
            pport: self.pport.clone(),
            bport: self.bport.clone(),
            is_local: self.is_local,
            is_active: state.is_active,
            to_be_traced: state.to_be_traced,
            tunnels: state.tunnels.values().cloned().collect(),
        }
    }

    /// Serialises the node for a Node packet.
    pub fn to_payload(&self) -> PayloadNode {
        let snap = self.snapshot();
        PayloadNode {
            id: snap.id.clone(),
            baddr: snap.baddr(),
            paddr: snap.paddr(),
            active: snap.is_active,
            tunnels: snap
                .tunnels
                .iter()
                .map(|t| TunnelInfo {
                    id: t.id.clone(),
                    target: t.target.clone(),
                    copies: t.copies,
                })
                .collect(),
        }
    }
}
