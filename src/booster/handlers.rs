//! handlers.rs - per-connection packet loop of the control plane.
//!
//! Packets on a single link are handled in arrival order; links are
//! handled concurrently. Heartbeats are the one exception to inline
//! handling: they sleep until their TTL, so each one runs in its own
//! task. The protocol keeps a single heartbeat in flight per direction,
//! which preserves their relative order.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::anyhow;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};

use crate::network::conn::{Conn, Transport};
use crate::network::node::Node;
use crate::protocol::packet::Packet;
use crate::protocol::payload::{
    compose, timestamp_to_system, validate, Payload, PayloadBandwidth, PayloadConnect,
    PayloadDisconnect, PayloadHeartbeat, PayloadHello, PayloadInspect, PayloadNode,
    PayloadProxyUpdate, TunnelInfo, CTRL_RESTART,
};
use crate::protocol::MessageKind;
use crate::pubsub::{CancelHandle, Command, Event};
use crate::socks::TOPIC_BANDWIDTH;

use super::{Booster, TOPIC_NET_UPDATES};
use crate::network::TOPIC_NODES;

impl Booster {
    /// Consumes a control-plane link until it closes or turns hostile.
    ///
    /// `conn` is set when the link is already installed in the network
    /// (outbound wires); inbound links start bare and are installed when
    /// the peer's HELLO arrives. Links that never greet act as command
    /// channels for connect, disconnect and inspect requests.
    pub(super) fn handle(
        self: Arc<Self>,
        transport: Transport,
        mut packets: mpsc::Receiver<Packet>,
        mut conn: Option<Arc<Conn>>,
        mut shutdown: Option<watch::Receiver<bool>>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
        let mut subs: Vec<CancelHandle> = Vec::new();

        loop {
            let p = match &mut shutdown {
                Some(rx) => tokio::select! {
                    p = packets.recv() => p,
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            transport.close();
                            break;
                        }
                        continue;
                    }
                },
                None => packets.recv().await,
            };

            let Some(p) = p else {
                break; // link closed
            };

            let (kind, _header) = match validate(&p) {
                Ok(v) => v,
                Err(e) => {
                    error!("booster: {}", e);
                    transport.close();
                    break;
                }
            };

            let payload = match Payload::from_packet(kind, &p) {
                Ok(pl) => pl,
                Err(e) => {
                    error!("booster: {}", e);
                    transport.close();
                    break;
                }
            };

            let res = match payload {
                Payload::Hello(pl) => match self.handle_hello(&transport, pl, &mut conn).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        // a rejected greeting must not end up installed
                        error!("booster: hello rejected: {:#}", e);
                        transport.close();
                        break;
                    }
                },
                Payload::Connect(pl) => self.handle_connect(&transport, pl).await,
                Payload::Disconnect(pl) => self.handle_disconnect(&transport, &conn, pl).await,
                Payload::Heartbeat(pl) => self.handle_heartbeat(&conn, pl),
                Payload::Notify => {
                    subs.push(self.serve_notify(&transport));
                    Ok(())
                }
                Payload::Inspect(pl) => {
                    subs.extend(self.serve_inspect(&transport, pl));
                    Ok(())
                }
                Payload::TunnelEvent(pl) => self.handle_tunnel(pl).await,
                Payload::Node(pl) => self.handle_node(pl).await,
                Payload::Bandwidth(pl) => {
                    self.handle_bandwidth(&conn, pl).await;
                    Ok(())
                }
                Payload::Ctrl(pl) => {
                    if pl.operation == CTRL_RESTART {
                        self.restart();
                    } else {
                        warn!("booster: unknown ctrl operation: {}", pl.operation);
                    }
                    Ok(())
                }
            };

            if let Err(e) = res {
                error!("booster: {} handler: {:#}", kind, e);
            }
        }

        for s in subs {
            s.cancel();
        }

        if let Some(conn) = conn {
            debug!("booster: conn [{}] loop ended (state {:?})", conn.id, conn.state());
            // a duplicate resolution may have replaced this conn already;
            // only remove the slot when it is still ours
            let current = self.net.conn(&conn.id).await;
            if current.is_some_and(|c| Arc::ptr_eq(&c, &conn)) {
                self.net.remove_conn(&conn.id).await;
            } else {
                conn.close();
            }
        }
        })
    }

    /// Installs an inbound link on the peer's greeting: build the node
    /// from the payload, register the conn, arm the heartbeat timer and
    /// subscribe to the peer's change-stream.
    async fn handle_hello(
        self: &Arc<Self>,
        transport: &Transport,
        pl: PayloadHello,
        conn: &mut Option<Arc<Conn>>,
    ) -> anyhow::Result<()> {
        if conn.is_some() {
            return Err(anyhow!("second hello on an installed link"));
        }

        let host = transport
            .peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "localhost".to_string());
        let node = Arc::new(Node::new(&host, &pl.pport, &pl.bport, false));

        let c = Conn::new(transport.clone(), node, false);
        c.set_state(crate::network::conn::ConnState::HelloReceived);
        self.net.add_conn(c.clone()).await?;
        c.remote_node.set_to_be_traced(true);
        c.heartbeat.reset(self.net.tuning.heartbeat_ttl * 2);

        // ask for the peer's change-stream, so both directions gossip
        let notify = crate::protocol::payload::compose_bare(MessageKind::Notify)?;
        if let Err(e) = c.send(notify) {
            self.net.remove_conn(&c.id).await;
            return Err(e.into());
        }

        info!("booster: <- hello: [{}] {}", c.id, c.remote_node.baddr());
        *conn = Some(c);
        Ok(())
    }

    /// Wires with the requested target and replies with a Node packet
    /// describing the new peer.
    async fn handle_connect(
        self: &Arc<Self>,
        reply_to: &Transport,
        pl: PayloadConnect,
    ) -> anyhow::Result<()> {
        let conn = self.wire(&pl.target).await?;
        info!("booster: <- connect: {}", pl.target);

        let reply = compose(MessageKind::Node, Some(&conn.remote_node.to_payload()))?;
        reply_to.send(reply)?;
        Ok(())
    }

    /// Drops the link to the named peer. A manual disconnect suppresses
    /// tracing, so the peer is not revived behind the operator's back.
    ///
    /// A disconnect arriving on a wired link and naming the peer that
    /// sent it is that peer's goodbye: it is dropping the link on
    /// purpose, so we must not trace it back, and no reply is expected.
    async fn handle_disconnect(
        self: &Arc<Self>,
        reply_to: &Transport,
        own: &Option<Arc<Conn>>,
        pl: PayloadDisconnect,
    ) -> anyhow::Result<()> {
        info!("booster: <- disconnect: {}", pl.id);

        if let Some(own_conn) = own {
            if own_conn.id == pl.id {
                own_conn.remote_node.set_to_be_traced(false);
                self.net.remove_conn(&own_conn.id).await;
                return Ok(());
            }
        }

        let Some(conn) = self.net.conn(&pl.id).await else {
            // report the absence without poisoning the requesting link
            let reply = compose(
                MessageKind::Node,
                Some(&PayloadNode {
                    id: pl.id.clone(),
                    ..Default::default()
                }),
            )?;
            reply_to.send(reply)?;
            return Err(crate::network::NetworkError::UnknownPeer(pl.id).into());
        };

        conn.remote_node.set_to_be_traced(false);

        // tell the peer goodbye so its tracer leaves us alone; queued
        // packets are flushed before the link closes
        let goodbye = compose(
            MessageKind::Disconnect,
            Some(&PayloadDisconnect {
                id: self.id.clone(),
            }),
        )?;
        if let Err(e) = conn.send(goodbye) {
            debug!("booster: goodbye to [{}]: {}", pl.id, e);
        }

        self.net.remove_conn(&pl.id).await;

        let reply = compose(MessageKind::Node, Some(&conn.remote_node.to_payload()))?;
        reply_to.send(reply)?;
        Ok(())
    }

    /// One leg of the heartbeat ping-pong: reject expired beats, then
    /// sleep until the peer's TTL before answering, so the link carries
    /// exactly one heartbeat per direction at the configured cadence.
    fn handle_heartbeat(
        self: &Arc<Self>,
        conn: &Option<Arc<Conn>>,
        pl: PayloadHeartbeat,
    ) -> anyhow::Result<()> {
        let Some(conn) = conn else {
            return Err(anyhow!("heartbeat on an uninstalled link"));
        };

        let Some(ttl) = pl.ttl.as_ref().map(timestamp_to_system) else {
            conn.close();
            return Err(anyhow!("heartbeat without ttl"));
        };

        let now = SystemTime::now();
        if ttl < now {
            conn.close();
            return Err(anyhow!("heartbeat expired: ttl {:?}", ttl));
        }

        // round-trip sample: time since our beat left, minus the agreed
        // ttl the peer slept through
        if let Some(elapsed) = conn.heartbeat_elapsed() {
            let ttl_wait = self.net.tuning.heartbeat_ttl;
            conn.remote_node.record_rtt(elapsed.saturating_sub(ttl_wait));
        }

        debug!("booster: <- heartbeat: {} (hops {})", pl.id, pl.hops);

        conn.heartbeat.stop();

        let b = self.clone();
        let conn = conn.clone();
        tokio::spawn(async move {
            if let Ok(wait) = ttl.duration_since(SystemTime::now()) {
                tokio::time::sleep(wait).await;
            }
            conn.heartbeat.reset(b.net.tuning.heartbeat_ttl * 2);

            let beat = match b.heartbeat_packet(Some(&pl)) {
                Ok(p) => p,
                Err(e) => {
                    error!("booster: heartbeat error: {:#}", e);
                    conn.close();
                    return;
                }
            };
            if let Err(e) = conn.send(beat) {
                debug!("booster: heartbeat send: {}", e);
                conn.close();
                return;
            }
            conn.mark_heartbeat_sent();
        });

        Ok(())
    }

    /// Streams the local change-stream over the link as TunnelEvent
    /// packets, until the subscription or the link dies.
    fn serve_notify(self: &Arc<Self>, transport: &Transport) -> CancelHandle {
        info!("booster: <- notify");

        let t = transport.clone();
        self.pubsub.sub(Command {
            topic: TOPIC_NET_UPDATES,
            run: Box::new(move |ev| {
                if let Event::Tunnel(pl) = ev {
                    let p = compose(MessageKind::TunnelEvent, Some(&pl))?;
                    t.send(p)?;
                }
                Ok(())
            }),
            post_run: Some(Box::new(|err| {
                if let Some(e) = err {
                    debug!("booster: notify stream ended: {:#}", e);
                }
            })),
        })
    }

    /// Serves the requested inspect features, each streaming updates
    /// independently until its subscription ends.
    fn serve_inspect(self: &Arc<Self>, transport: &Transport, pl: PayloadInspect) -> Vec<CancelHandle> {
        info!("booster: <- serving inspect...");
        let mut handles = Vec::new();

        for feature in &pl.features {
            match MessageKind::from_id(feature.feature) {
                Some(MessageKind::Node) => {
                    let t = transport.clone();
                    handles.push(self.pubsub.sub(Command {
                        topic: TOPIC_NODES,
                        run: Box::new(move |ev| {
                            if let Event::Node(snap) = ev {
                                let pl = PayloadNode {
                                    id: snap.id.clone(),
                                    baddr: snap.baddr(),
                                    paddr: snap.paddr(),
                                    active: snap.is_active,
                                    tunnels: snap
                                        .tunnels
                                        .iter()
                                        .map(|tn| TunnelInfo {
                                            id: tn.id.clone(),
                                            target: tn.target.clone(),
                                            copies: tn.copies,
                                        })
                                        .collect(),
                                };
                                t.send(compose(MessageKind::Node, Some(&pl))?)?;
                            }
                            Ok(())
                        }),
                        post_run: None,
                    }));
                }
                Some(MessageKind::Bandwidth) => {
                    let t = transport.clone();
                    let local_id = self.id.clone();
                    handles.push(self.pubsub.sub(Command {
                        topic: TOPIC_BANDWIDTH,
                        run: Box::new(move |ev| {
                            if let Event::Bandwidth(bm) = ev {
                                let pl = PayloadBandwidth {
                                    node_id: local_id.clone(),
                                    tot: bm.tot as i64,
                                    bandwidth: bm.bandwidth as i64,
                                    kind: if bm.download {
                                        "download".to_string()
                                    } else {
                                        "upload".to_string()
                                    },
                                };
                                t.send(compose(MessageKind::Bandwidth, Some(&pl))?)?;
                            }
                            Ok(())
                        }),
                        post_run: None,
                    }));
                }
                _ => {
                    // feature not supported, serve the others
                    warn!("booster: inspect: unsupported feature: {}", feature.feature);
                }
            }
        }

        handles
    }

    /// Applies a propagated tunnel event to the originating node's entry
    /// in the local graph and forwards it, loop-suppressed, to peers
    /// subscribed via Notify.
    async fn handle_tunnel(self: &Arc<Self>, pl: PayloadProxyUpdate) -> anyhow::Result<()> {
        debug!("booster: <- tunnel: {:?}", pl);

        if pl.node_id == self.id {
            // our own event came back around; the visited-set would drop
            // it anyway, there is just nothing to apply it to
            return Ok(());
        }

        let Some(node) = self.net.node(&pl.node_id).await else {
            debug!("booster: tunnel event for unknown node [{}]", pl.node_id);
            return Ok(());
        };

        self.update_node(&node, pl, true);
        Ok(())
    }

    /// An authoritative snapshot of a peer: replaces its tunnel set.
    async fn handle_node(self: &Arc<Self>, pl: PayloadNode) -> anyhow::Result<()> {
        let Some(node) = self.net.node(&pl.id).await else {
            debug!("booster: node snapshot for unknown node [{}]", pl.id);
            return Ok(());
        };
        if node.is_local {
            return Ok(());
        }

        node.replace_tunnels(
            pl.tunnels
                .into_iter()
                .map(|t| crate::network::node::Tunnel {
                    id: t.id,
                    target: t.target,
                    copies: t.copies,
                    confirmed: true,
                })
                .collect(),
        );
        self.pubsub
            .publish(TOPIC_NODES, Event::Node(node.snapshot()));
        Ok(())
    }

    /// Updates the sending peer's bandwidth figures.
    async fn handle_bandwidth(self: &Arc<Self>, conn: &Option<Arc<Conn>>, pl: PayloadBandwidth) {
        let node = match self.net.node(&pl.node_id).await {
            Some(n) => Some(n),
            None => conn.as_ref().map(|c| c.remote_node.clone()),
        };
        if let Some(node) = node {
            node.record_bandwidth(pl.kind == "download", pl.bandwidth.max(0) as u64);
            let (down, up) = node.bandwidth();
            debug!("booster: <- bandwidth [{}]: down {} B/s, up {} B/s", node.id, down, up);
        }
    }
}
