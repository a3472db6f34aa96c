//! tracer.rs - revives previously wired peers by periodic probing.
//!
//! Whenever a traced node drops out of the network, the tracer starts a
//! probe task for it: dial the peer's control port, expect its HELLO, and
//! publish a discovery event on success. The control-plane server is
//! subscribed and re-wires the peer. Probes back off exponentially with
//! jitter and give up after a day of continuous failure.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use log::{debug, info};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::network::conn::Transport;
use crate::network::{Network, TOPIC_NODES};
use crate::protocol::payload::{validate, Payload};
use crate::protocol::MessageKind;
use crate::pubsub::{Command, Event};

/// Topic where successful probes are announced.
pub const TOPIC_CONN_DISCOVERED: &str = "tracer.discovered";

const BACKOFF_BASE: Duration = Duration::from_secs(4);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const GIVE_UP_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

pub struct Tracer {
    net: Arc<Network>,
    /// Node ids with a live probe task, so a node is probed once at a
    /// time no matter how many closing events it produces.
    probing: Mutex<HashSet<String>>,
}

impl Tracer {
    pub fn new(net: Arc<Network>) -> Arc<Tracer> {
        Arc::new(Tracer {
            net,
            probing: Mutex::new(HashSet::new()),
        })
    }

    /// Watches the peer graph and keeps probing every traced node that
    /// went inactive. Returns when the shutdown signal fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let tracer = self.clone();
        let stopped = shutdown.clone();
        let handle = self.net.pubsub.sub(Command {
            topic: TOPIC_NODES,
            run: Box::new(move |ev| {
                if let Event::Node(snap) = ev {
                    if !snap.is_local && !snap.is_active && snap.to_be_traced {
                        let baddr = snap.baddr();
                        tracer.clone().trace(snap.id, baddr, stopped.clone());
                    }
                }
                Ok(())
            }),
            post_run: None,
        });

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        handle.cancel();
        Ok(())
    }

    /// Starts the probe loop for one node, unless one is already running.
    fn trace(self: Arc<Self>, id: String, baddr: String, mut shutdown: watch::Receiver<bool>) {
        if !self.probing.lock().unwrap().insert(id.clone()) {
            return;
        }
        info!("tracer: tracing [{}] at {}", id, baddr);

        let tracer = self;
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let mut backoff = BACKOFF_BASE;

            loop {
                let wait = jittered(backoff);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                if started.elapsed() > GIVE_UP_AFTER {
                    info!("tracer: giving up on [{}]", id);
                    break;
                }

                // the node may have been reattached, forgotten or manually
                // disconnected in the meantime
                let Some(node) = tracer.net.node(&id).await else {
                    break;
                };
                if node.is_active() || !node.to_be_traced() {
                    break;
                }

                match probe(&baddr, tracer.net.tuning.dial_timeout).await {
                    Ok(()) => {
                        info!("tracer: [{}] is back", id);
                        tracer
                            .net
                            .pubsub
                            .publish(TOPIC_CONN_DISCOVERED, Event::ConnDiscovered(id.clone()));
                        break;
                    }
                    Err(e) => {
                        debug!("tracer: probe [{}]: {:#}", id, e);
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                    }
                }
            }

            tracer.probing.lock().unwrap().remove(&id);
        });
    }
}

/// Backoff with ±25% jitter, so a mesh of tracers does not probe in step.
fn jittered(d: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    d.mul_f64(factor)
}

/// A probe is a control-plane dial plus a HELLO exchange: the peer greets
/// first, and a valid greeting means it is ready to be wired again.
async fn probe(baddr: &str, dial_timeout: Duration) -> Result<()> {
    let stream = timeout(dial_timeout, TcpStream::connect(baddr)).await??;
    let (transport, mut packets) = Transport::new(stream, None, 8);

    let p = timeout(dial_timeout, packets.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("link closed before hello"))?;
    transport.close();

    let (kind, _) = validate(&p)?;
    match Payload::from_packet(kind, &p)? {
        Payload::Hello(_) if kind == MessageKind::Hello => Ok(()),
        _ => Err(anyhow::anyhow!("peer did not greet with hello")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::node::Node;
    use crate::network::Tuning;
    use crate::protocol::payload::{compose, PayloadHello};
    use crate::pubsub::PubSub;
    use tokio::net::TcpListener;

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..64 {
            let d = jittered(Duration::from_secs(4));
            assert!(d >= Duration::from_secs(3));
            assert!(d <= Duration::from_secs(5));
        }
    }

    #[tokio::test]
    async fn probe_accepts_a_greeting_listener() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let baddr = ln.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = ln.accept().await.unwrap();
            let (transport, _rx) = Transport::new(stream, None, 8);
            let hello = compose(
                MessageKind::Hello,
                Some(&PayloadHello {
                    bport: "4885".to_string(),
                    pport: "1081".to_string(),
                }),
            )
            .unwrap();
            transport.send(hello).unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        probe(&baddr, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn probe_rejects_a_silent_listener() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let baddr = ln.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_stream, _) = ln.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        assert!(probe(&baddr, Duration::from_millis(200)).await.is_err());
    }

    #[tokio::test]
    async fn closing_event_starts_a_single_probe() {
        let local = Arc::new(Node::new("127.0.0.1", "1080", "4884", true));
        let net = Network::new(local, PubSub::new(), Tuning::default());
        let tracer = Tracer::new(net.clone());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let remote = Node::new("127.0.0.1", "1081", "4885", false);
        remote.set_to_be_traced(true);
        let id = remote.id.clone();

        tracer
            .clone()
            .trace(id.clone(), remote.baddr(), shutdown_rx.clone());
        tracer.clone().trace(id.clone(), remote.baddr(), shutdown_rx);

        assert_eq!(tracer.probing.lock().unwrap().len(), 1);
    }
}
