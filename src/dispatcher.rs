//! dispatcher.rs - the load-balancing dialer behind every proxied request.
//!
//! For each outbound connection the dispatcher scores every candidate
//! peer by effective load, dials through the cheapest one, and falls back
//! to the next candidate on failure. Adding a peer strictly widens the
//! candidate set: a fresh peer with zero load is preferred until it
//! catches up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::network::node::Node;
use crate::network::Network;

/// How long a failed peer keeps its extra load point.
const PENALTY_WINDOW: Duration = Duration::from_secs(5);

type InFlight = Arc<Mutex<HashMap<String, u32>>>;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("dial: {target} via [{node}]: {reason}")]
    DialFailure {
        target: String,
        node: String,
        reason: String,
    },
    #[error("dial: no route to {0}: all candidates exhausted")]
    NoRoute(String),
}

/// Accounting guard for one carried session: holds the chosen peer's
/// in-flight slot until dropped.
pub struct CarrierGuard {
    pub node_id: String,
    in_flight: InFlight,
}

impl Drop for CarrierGuard {
    fn drop(&mut self) {
        let mut m = self.in_flight.lock().unwrap();
        if let Some(n) = m.get_mut(&self.node_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                m.remove(&self.node_id);
            }
        }
    }
}

/// A dialed connection plus the accounting guard for the peer carrying
/// it. Keep the guard alive for the whole session.
pub struct ProxiedConn {
    pub stream: TcpStream,
    pub carrier: CarrierGuard,
}

/// The seam the SOCKS5 front-end dials through.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial_context(&self, target: &str) -> Result<ProxiedConn, DialError>;
}

pub struct Dispatcher {
    net: Arc<Network>,
    /// Recently failed peers and when their penalty expires.
    penalties: Mutex<HashMap<String, Instant>>,
    /// Sessions currently carried per peer, counted from choice to close.
    /// Keeps concurrent dials off a single idle peer before that peer's
    /// own load announcements arrive.
    in_flight: InFlight,
}

impl Dispatcher {
    pub fn new(net: Arc<Network>) -> Arc<Dispatcher> {
        Arc::new(Dispatcher {
            net,
            penalties: Mutex::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Effective load of a candidate: announced tunnel copies, plus the
    /// sessions we already route through it, plus the failure penalty.
    fn load(&self, node: &Node) -> u32 {
        let mut load = node.workload();
        if let Some(n) = self.in_flight.lock().unwrap().get(&node.id) {
            load += n;
        }
        let penalized = self
            .penalties
            .lock()
            .unwrap()
            .get(&node.id)
            .is_some_and(|until| *until > Instant::now());
        if penalized {
            load += 1;
        }
        load
    }

    /// Candidates sorted best-first: minimum load, ties broken by the
    /// shortest heartbeat round-trip, then by id so the choice is
    /// deterministic.
    async fn ranked(&self) -> Vec<Arc<Node>> {
        let mut cands: Vec<Arc<Node>> = self
            .net
            .nodes()
            .await
            .into_iter()
            .filter(|n| n.is_local || n.is_active())
            .collect();

        cands.sort_by_cached_key(|n| {
            // the local node's round-trip is zero by definition
            let rtt = if n.is_local {
                0
            } else {
                n.rtt_ewma()
                    .map(|d| d.as_micros() as u64)
                    .unwrap_or(u64::MAX)
            };
            (self.load(n), rtt, n.id.clone())
        });
        cands
    }

    fn acquire(&self, id: &str) -> CarrierGuard {
        *self
            .in_flight
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_insert(0) += 1;
        CarrierGuard {
            node_id: id.to_string(),
            in_flight: self.in_flight.clone(),
        }
    }

    fn penalize(&self, id: &str) {
        self.penalties
            .lock()
            .unwrap()
            .insert(id.to_string(), Instant::now() + PENALTY_WINDOW);
    }

    async fn dial_via(&self, node: &Node, target: &str) -> Result<TcpStream, DialError> {
        let fail = |reason: String| DialError::DialFailure {
            target: target.to_string(),
            node: node.id.clone(),
            reason,
        };

        let dial_timeout = self.net.tuning.dial_timeout;

        if node.is_local {
            return match timeout(dial_timeout, TcpStream::connect(target)).await {
                Ok(Ok(s)) => Ok(s),
                Ok(Err(e)) => Err(fail(e.to_string())),
                Err(_) => Err(fail("timeout".to_string())),
            };
        }

        // route through the peer's own proxy
        let paddr = node.paddr();
        let stream = match timeout(dial_timeout, TcpStream::connect(&paddr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(fail(e.to_string())),
            Err(_) => return Err(fail("timeout".to_string())),
        };

        match timeout(dial_timeout, socks5_connect(stream, target)).await {
            Ok(Ok(s)) => Ok(s),
            Ok(Err(e)) => Err(fail(e.to_string())),
            Err(_) => Err(fail("proxy handshake timeout".to_string())),
        }
    }
}

#[async_trait]
impl Dialer for Dispatcher {
    async fn dial_context(&self, target: &str) -> Result<ProxiedConn, DialError> {
        for node in self.ranked().await {
            let guard = self.acquire(&node.id);
            match self.dial_via(&node, target).await {
                Ok(stream) => {
                    debug!("dispatcher: {} via [{}]", target, node.id);
                    return Ok(ProxiedConn {
                        stream,
                        carrier: guard,
                    });
                }
                Err(e) => {
                    warn!("dispatcher: {}", e);
                    self.penalize(&node.id);
                    // guard drops here, releasing the slot
                }
            }
        }
        Err(DialError::NoRoute(target.to_string()))
    }
}

/// Performs the client side of a SOCKS5 CONNECT on an open stream to a
/// peer's proxy. After the reply the stream is a raw pipe to `target`.
async fn socks5_connect(mut stream: TcpStream, target: &str) -> anyhow::Result<TcpStream> {
    use anyhow::{anyhow, Context};

    // method selection: version 5, one method, NOAUTH
    stream.write_all(&[0x05, 0x01, 0x00]).await?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .context("proxy method reply")?;
    if reply != [0x05, 0x00] {
        return Err(anyhow!("proxy refused NOAUTH: {:02x?}", reply));
    }

    // request: CONNECT to host:port, host always sent as a domain name
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("target [{}] is not host:port", target))?;
    let port: u16 = port.parse().context("target port")?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.len() > 255 {
        return Err(anyhow!("target host too long"));
    }

    let mut req = Vec::with_capacity(7 + host.len());
    req.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host.len() as u8]);
    req.extend_from_slice(host.as_bytes());
    req.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&req).await?;

    // reply: VER REP RSV ATYP BND.ADDR BND.PORT
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.context("proxy reply")?;
    if head[0] != 0x05 {
        return Err(anyhow!("bad proxy reply version: {}", head[0]));
    }
    if head[1] != 0x00 {
        return Err(anyhow!("proxy connect failed: code {}", head[1]));
    }

    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => return Err(anyhow!("bad proxy reply address type: {}", other)),
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await.context("proxy reply address")?;

    Ok(stream)
}
