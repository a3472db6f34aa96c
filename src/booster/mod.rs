//! booster - the control-plane server gluing every subsystem together.
//!
//! A booster instance runs two listeners: the SOCKS5 proxy on `pport` and
//! the control plane on `bport`. The control plane pairs peers through a
//! HELLO exchange, keeps each link alive with a heartbeat ping-pong,
//! forwards local tunnel events to subscribed peers and applies remote
//! events to the local peer graph, reshaping the dispatcher's choices.

mod handlers;

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::dispatcher::Dispatcher;
use crate::network::conn::{Conn, Transport};
use crate::network::node::Node;
use crate::network::{Network, Runtime, Tuning};
use crate::protocol::packet::Packet;
use crate::protocol::payload::{
    compose, compose_bare, validate, Payload, PayloadBandwidth, PayloadConnect,
    PayloadDisconnect, PayloadHeartbeat, PayloadHello, PayloadInspect, PayloadMonitor,
    PayloadNode, PayloadProxyUpdate, TunnelOp,
};
use crate::protocol::MessageKind;
use crate::pubsub::{Command, Event, PubSub};
use crate::socks::{Socks5, TOPIC_TUNNEL_EVENTS};
use crate::tracer::{Tracer, TOPIC_CONN_DISCOVERED};

/// Topic carrying tunnel events destined for peers subscribed via Notify.
pub const TOPIC_NET_UPDATES: &str = "network.updates";

/// Bound on the propagation visited-set.
const VISITED_CAP: usize = 1024;

/// Suppresses propagation loops: an event identified by its originating
/// node id and sequence number is applied at most once.
#[derive(Default)]
struct Visited {
    set: HashSet<(String, u64)>,
    order: VecDeque<(String, u64)>,
}

impl Visited {
    /// Returns false when the key was already seen.
    fn insert(&mut self, key: (String, u64)) -> bool {
        if !self.set.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > VISITED_CAP {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

/// Wraps the parts that compose a booster node together.
pub struct Booster {
    pub id: String,
    net: Arc<Network>,
    rt: Arc<Runtime>,
    pubsub: Arc<PubSub>,
    proxy: Arc<Socks5>,
    seen: Mutex<Visited>,
    stop_tx: mpsc::Sender<()>,
    restart_tx: mpsc::Sender<()>,
    control_rx: Mutex<Option<(mpsc::Receiver<()>, mpsc::Receiver<()>)>>,
}

impl Booster {
    /// Creates a configured booster node. The internal proxy uses the
    /// dispatcher as its network dialer.
    pub fn new(rt: Arc<Runtime>, pport: u16, bport: u16, tuning: Tuning) -> Arc<Booster> {
        let local = Arc::new(Node::new(
            "localhost",
            &pport.to_string(),
            &bport.to_string(),
            true,
        ));
        let id = local.id.clone();

        let pubsub = PubSub::new();
        let net = Network::new(local, pubsub.clone(), tuning);
        rt.set(&id, net.clone());

        let dispatcher = Dispatcher::new(net.clone());
        let proxy = Socks5::new(dispatcher, pubsub.clone(), id.clone());

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (restart_tx, restart_rx) = mpsc::channel(1);

        Arc::new(Booster {
            id,
            net,
            rt,
            pubsub,
            proxy,
            seen: Mutex::new(Visited::default()),
            stop_tx,
            restart_tx,
            control_rx: Mutex::new(Some((stop_rx, restart_rx))),
        })
    }

    pub fn net(&self) -> Arc<Network> {
        self.net.clone()
    }

    /// Stops the run loop, dropping the whole booster network.
    pub fn close(&self) {
        info!("booster: closing...");
        let _ = self.stop_tx.try_send(());
    }

    /// Restarts the run loop with a cleared network.
    pub fn restart(&self) {
        info!("booster: restarting...");
        let _ = self.restart_tx.try_send(());
    }

    /// Runs the proxy and the control plane until stopped. Blocking; use
    /// `close` to stop it, which makes it return a cancellation error.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let (mut stop_rx, mut restart_rx) = self
            .control_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("booster: already running"))?;

        loop {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let mut task = tokio::spawn(self.clone().run_once(shutdown_rx));

            tokio::select! {
                res = &mut task => {
                    return res.context("booster: run task")?;
                }
                _ = stop_rx.recv() => {
                    let _ = shutdown_tx.send(true);
                    let _ = task.await;
                    self.rt.close(&self.id).await;
                    return Err(anyhow!("booster: stopped"));
                }
                _ = restart_rx.recv() => {
                    let _ = shutdown_tx.send(true);
                    let _ = task.await;
                    self.rt.close(&self.id).await;
                }
            }
        }
    }

    /// One lifetime of the instance: both listeners, the root updater and
    /// the tracer. Returns the first error any of them produces.
    async fn run_once(self: Arc<Self>, mut parent_shutdown: watch::Receiver<bool>) -> Result<()> {
        let pport: u16 = self
            .net
            .local_node
            .pport
            .parse()
            .context("booster: proxy port")?;
        let bport: u16 = self
            .net
            .local_node
            .bport
            .parse()
            .context("booster: control port")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        // mirror the parent's cancellation into this lifetime
        {
            let shutdown_tx = shutdown_tx.clone();
            tokio::spawn(async move {
                while !*parent_shutdown.borrow() {
                    if parent_shutdown.changed().await.is_err() {
                        return;
                    }
                }
                let _ = shutdown_tx.send(true);
            });
        }

        let (errc_tx, mut errc_rx) = mpsc::channel::<Result<()>>(4);

        {
            let proxy = self.proxy.clone();
            let rx = shutdown_rx.clone();
            let tx = errc_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(proxy.listen_and_serve(rx, pport).await).await;
            });
        }
        {
            let b = self.clone();
            let rx = shutdown_rx.clone();
            let tx = errc_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(b.listen_and_serve(rx, bport).await).await;
            });
        }
        {
            let b = self.clone();
            let rx = shutdown_rx.clone();
            let tx = errc_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(b.update_root(rx).await).await;
            });
        }
        {
            let tracer = Tracer::new(self.net.clone());
            let rx = shutdown_rx.clone();
            let tx = errc_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(tracer.run(rx).await).await;
            });
        }

        // re-wire peers the tracer manages to reach again
        let discovered = {
            let b = self.clone();
            self.pubsub.sub(Command {
                topic: TOPIC_CONN_DISCOVERED,
                run: Box::new(move |ev| {
                    if let Event::ConnDiscovered(id) = ev {
                        let b = b.clone();
                        tokio::spawn(async move {
                            let Some(node) = b.net.node(&id).await else {
                                return;
                            };
                            if node.is_active() {
                                return;
                            }
                            if let Err(e) = b.wire(&node.baddr()).await {
                                warn!("booster: re-wire [{}]: {:#}", id, e);
                            }
                        });
                    }
                    Ok(())
                }),
                post_run: None,
            })
        };

        // the first subsystem to return decides this lifetime's fate
        let res = errc_rx.recv().await.unwrap_or(Ok(()));
        let _ = shutdown_tx.send(true);
        discovered.cancel();
        res
    }

    /// Control-plane accept loop. Every accepted link is greeted with a
    /// HELLO packet before anything else.
    async fn listen_and_serve(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        port: u16,
    ) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("booster: bind port {}", port))?;
        info!("booster: listening on port: {}", port);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let b = self.clone();
                        let rx = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = b.accept(stream, peer, rx).await {
                                warn!("booster: conn from {}: {:#}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("booster: cannot accept conn: {}", e);
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("booster: control plane shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn accept(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let (transport, packets) =
            Transport::new(stream, Some(peer), self.net.tuning.send_queue);

        transport.send(self.hello_packet()?)?;
        self.handle(transport, packets, None, Some(shutdown)).await;
        Ok(())
    }

    fn hello_packet(&self) -> Result<Packet> {
        let local = &self.net.local_node;
        Ok(compose(
            MessageKind::Hello,
            Some(&PayloadHello {
                bport: local.bport.clone(),
                pport: local.pport.clone(),
            }),
        )?)
    }

    fn heartbeat_packet(&self, previous: Option<&PayloadHeartbeat>) -> Result<Packet> {
        let pl = PayloadHeartbeat {
            id: hex::encode(rand::random::<[u8; 8]>()),
            hops: previous.map(|p| p.hops + 1).unwrap_or(0),
            ttl: Some(crate::protocol::payload::timestamp_in(
                self.net.tuning.heartbeat_ttl,
            )),
        };
        Ok(compose(MessageKind::Heartbeat, Some(&pl))?)
    }

    /// Connects the local and the target node at the control plane:
    /// HELLO exchange, installation in the network, change-stream request
    /// and the first heartbeat of the ping-pong.
    pub async fn wire(self: &Arc<Self>, target: &str) -> Result<Arc<Conn>> {
        let tuning = &self.net.tuning;
        let (transport, packets, hello, peer) =
            open_control(target, tuning.dial_timeout, tuning.send_queue).await?;

        let fail = |err: anyhow::Error| {
            transport.close();
            Err(err)
        };

        let host = peer
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "localhost".to_string());
        let node = Arc::new(Node::new(&host, &hello.pport, &hello.bport, false));

        // answer the greeting so the peer installs us symmetrically
        if let Err(e) = transport.send(self.hello_packet()?) {
            return fail(e.into());
        }

        let conn = Conn::new(transport.clone(), node, true);
        conn.set_state(crate::network::conn::ConnState::HelloReceived);
        if let Err(e) = self.net.add_conn(conn.clone()).await {
            return fail(anyhow!("hello rejected: {}", e));
        }
        conn.remote_node.set_to_be_traced(true);

        // ask for the peer's change-stream and start the ping-pong
        let notify = compose_bare(MessageKind::Notify)?;
        if let Err(e) = conn.send(notify) {
            self.net.remove_conn(&conn.id).await;
            return fail(e.into());
        }
        let beat = self.heartbeat_packet(None)?;
        if let Err(e) = conn.send(beat) {
            self.net.remove_conn(&conn.id).await;
            return fail(e.into());
        }
        conn.mark_heartbeat_sent();
        conn.heartbeat.reset(tuning.heartbeat_ttl * 2);

        info!("booster: -> wire: {}", target);

        // the conn loop lives as long as the link; closing the network
        // tears the transport down, which ends the loop
        let b = self.clone();
        let c = conn.clone();
        tokio::spawn(async move {
            b.handle(c.transport.clone(), packets, Some(c), None).await;
        });

        Ok(conn)
    }

    /// Subscribes to the local proxy, mirroring its tunnel events onto the
    /// local node and propagating them to wired peers.
    async fn update_root(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(1);

        let b = self.clone();
        let handle = self.pubsub.sub(Command {
            topic: TOPIC_TUNNEL_EVENTS,
            run: Box::new(move |ev| {
                if let Event::Tunnel(pl) = ev {
                    let local = b.net.local_node.clone();
                    b.update_node(&local, pl, true);
                }
                Ok(())
            }),
            post_run: Some(Box::new(move |err| {
                if let Some(e) = err {
                    let _ = err_tx.try_send(e);
                }
            })),
        });

        tokio::select! {
            e = err_rx.recv() => {
                match e {
                    Some(e) => Err(anyhow!("booster: update root: {:#}", e)),
                    None => Ok(()),
                }
            }
            _ = async {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                handle.cancel();
                Ok(())
            }
        }
    }

    /// Applies a tunnel event to a node and, when asked, forwards it to
    /// every peer subscribed via Notify. Re-delivery of an already seen
    /// `(origin, seq)` pair is a no-op; invalid events are logged and
    /// never propagated.
    pub fn update_node(&self, node: &Arc<Node>, pl: PayloadProxyUpdate, propagate: bool) {
        if !self
            .seen
            .lock()
            .unwrap()
            .insert((pl.node_id.clone(), pl.seq))
        {
            return;
        }

        let Some(op) = TunnelOp::from_id(pl.operation) else {
            warn!("booster: unknown tunnel operation: {}", pl.operation);
            return;
        };

        if let Err(e) = node.apply(op, &pl.target) {
            warn!("booster: {}", e);
            return;
        }

        self.pubsub.publish(
            crate::network::TOPIC_NODES,
            Event::Node(node.snapshot()),
        );
        if propagate {
            self.pubsub.publish(TOPIC_NET_UPDATES, Event::Tunnel(pl));
        }
    }
}

/// Dials a control-plane listener and consumes its greeting. Returns the
/// framed transport, the inbound packet stream and the peer's HELLO.
pub async fn open_control(
    addr: &str,
    dial_timeout: Duration,
    send_queue: usize,
) -> Result<(
    Transport,
    mpsc::Receiver<Packet>,
    PayloadHello,
    Option<SocketAddr>,
)> {
    let stream = timeout(dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow!("booster: dial {}: timeout", addr))?
        .with_context(|| format!("booster: dial {}", addr))?;
    let peer = stream.peer_addr().ok();

    let (transport, mut packets) = Transport::new(stream, peer, send_queue);

    let p = match timeout(dial_timeout, packets.recv()).await {
        Ok(Some(p)) => p,
        Ok(None) => {
            transport.close();
            return Err(anyhow!("booster: {}: link closed before hello", addr));
        }
        Err(_) => {
            transport.close();
            return Err(anyhow!("booster: {}: no hello in time", addr));
        }
    };

    let hello = (|| -> Result<PayloadHello> {
        let (kind, _) = validate(&p)?;
        match Payload::from_packet(kind, &p)? {
            Payload::Hello(pl) => Ok(pl),
            other => Err(anyhow!("expected hello, got {:?}", other)),
        }
    })();

    match hello {
        Ok(hello) => Ok((transport, packets, hello, peer)),
        Err(e) => {
            transport.close();
            Err(e.context(format!("booster: {}: bad greeting", addr)))
        }
    }
}

// --- Client operations ---
//
// Short-lived control-plane sessions used by the command line: dial,
// consume the server's greeting, send one request and read the replies.

const CLIENT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

async fn client_request(baddr: &str, request: Packet) -> Result<(Transport, mpsc::Receiver<Packet>)> {
    let tuning = Tuning::default();
    let (transport, packets, _hello, _) =
        open_control(baddr, tuning.dial_timeout, tuning.send_queue).await?;
    transport.send(request)?;
    Ok((transport, packets))
}

async fn read_node_reply(packets: &mut mpsc::Receiver<Packet>) -> Result<PayloadNode> {
    let p = timeout(CLIENT_REPLY_TIMEOUT, packets.recv())
        .await
        .map_err(|_| anyhow!("booster: no reply in time"))?
        .ok_or_else(|| anyhow!("booster: link closed before reply"))?;

    let (kind, _) = validate(&p)?;
    match Payload::from_packet(kind, &p)? {
        Payload::Node(pl) => Ok(pl),
        other => Err(anyhow!("booster: expected node reply, got {:?}", other)),
    }
}

/// Asks the booster at `baddr` to wire with `target`. Returns the node
/// describing the new peer.
pub async fn connect_cmd(baddr: &str, target: &str) -> Result<PayloadNode> {
    let req = compose(
        MessageKind::Connect,
        Some(&PayloadConnect {
            target: target.to_string(),
        }),
    )?;
    let (transport, mut packets) = client_request(baddr, req).await?;
    let node = read_node_reply(&mut packets).await;
    transport.close();
    node
}

/// Asks the booster at `baddr` to drop the peer with the given id.
pub async fn disconnect_cmd(baddr: &str, id: &str) -> Result<PayloadNode> {
    let req = compose(
        MessageKind::Disconnect,
        Some(&PayloadDisconnect { id: id.to_string() }),
    )?;
    let (transport, mut packets) = client_request(baddr, req).await?;
    let node = read_node_reply(&mut packets).await;
    transport.close();
    node
}

/// A decoded inspect stream item.
#[derive(Debug)]
pub enum InspectItem {
    Node(PayloadNode),
    Bandwidth(PayloadBandwidth),
}

/// Streams node and bandwidth updates from the booster at `baddr`,
/// invoking `on_item` per update until the link closes.
pub async fn inspect_cmd(
    baddr: &str,
    features: &[MessageKind],
    mut on_item: impl FnMut(InspectItem),
) -> Result<()> {
    let req = compose(
        MessageKind::Inspect,
        Some(&PayloadInspect {
            features: features
                .iter()
                .map(|k| PayloadMonitor { feature: k.id() })
                .collect(),
        }),
    )?;
    let (transport, mut packets) = client_request(baddr, req).await?;

    while let Some(p) = packets.recv().await {
        let (kind, _) = validate(&p)?;
        match Payload::from_packet(kind, &p)? {
            Payload::Node(pl) => on_item(InspectItem::Node(pl)),
            Payload::Bandwidth(pl) => on_item(InspectItem::Bandwidth(pl)),
            other => warn!("booster: inspect: unexpected payload: {:?}", other),
        }
    }
    transport.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::protocol::payload::{PayloadCtrl, TunnelInfo, CTRL_RESTART};

    async fn free_port() -> u16 {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ln.local_addr().unwrap().port()
    }

    fn quick_tuning() -> Tuning {
        Tuning {
            heartbeat_ttl: Duration::from_millis(500),
            dial_timeout: Duration::from_secs(2),
            send_queue: 256,
        }
    }

    /// Starts a full instance on ephemeral ports and waits for its
    /// control plane to accept.
    async fn spawn_instance() -> (Arc<Booster>, u16, u16) {
        let pport = free_port().await;
        let bport = free_port().await;

        let rt = Runtime::new();
        let b = Booster::new(rt, pport, bport, quick_tuning());
        tokio::spawn(b.clone().run());

        for port in [bport, pport] {
            assert!(
                settle(|| async move {
                    TcpStream::connect(("127.0.0.1", port)).await.is_ok()
                })
                .await,
                "listener on {} never came up",
                port
            );
        }
        (b, pport, bport)
    }

    /// Polls an async condition until it holds or the limit passes.
    async fn settle_for<F, Fut>(limit: Duration, mut cond: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if cond().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    /// Polls an async condition until it holds or three seconds pass.
    async fn settle<F, Fut>(cond: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        settle_for(Duration::from_secs(3), cond).await
    }

    /// A scripted control-plane peer: greets every connection with a
    /// proper HELLO, then goes silent, never answering the heartbeat
    /// ping-pong. Returns its control address and node id.
    async fn spawn_silent_peer() -> (String, String) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bport = ln.local_addr().unwrap().port().to_string();
        let pport = free_port().await.to_string();
        let baddr = format!("127.0.0.1:{}", bport);
        let id = Node::new("127.0.0.1", &pport, &bport, false).id;

        let (hello_pport, hello_bport) = (pport, bport);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = ln.accept().await else {
                    return;
                };
                let pl = PayloadHello {
                    bport: hello_bport.clone(),
                    pport: hello_pport.clone(),
                };
                tokio::spawn(async move {
                    let (t, mut rx) = Transport::new(stream, None, 64);
                    let _ = t.send(compose(MessageKind::Hello, Some(&pl)).unwrap());
                    while rx.recv().await.is_some() {}
                });
            }
        });

        (baddr, id)
    }

    /// A TCP sink that echoes whatever it receives, for driving real
    /// proxied sessions.
    async fn spawn_echo_sink() -> String {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = ln.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    /// Drives a raw SOCKS5 CONNECT against a proxy port and returns the
    /// established stream.
    async fn socks_connect(pport: u16, target: &str) -> TcpStream {
        let mut stream = TcpStream::connect(("127.0.0.1", pport)).await.unwrap();

        stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        stream.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let (host, port) = target.rsplit_once(':').unwrap();
        let port: u16 = port.parse().unwrap();
        let mut req = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
        req.extend_from_slice(host.as_bytes());
        req.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&req).await.unwrap();

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await.unwrap();
        assert_eq!(head[1], 0x00, "socks reply code");
        let addr_len = match head[3] {
            0x01 => 4,
            0x04 => 16,
            other => panic!("unexpected reply atyp {}", other),
        };
        let mut rest = vec![0u8; addr_len + 2];
        stream.read_exact(&mut rest).await.unwrap();

        stream
    }

    #[tokio::test]
    async fn solo_proxy_serves_a_connect() {
        let (b, pport, _bport) = spawn_instance().await;
        let sink = spawn_echo_sink().await;

        let mut stream = socks_connect(pport, &sink).await;
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // one node (self), no remote conns, one tunnel with one copy
        let net = b.net();
        assert!(
            settle(|| {
                let net = net.clone();
                async move { net.local_node.workload() == 1 }
            })
            .await
        );
        assert_eq!(net.nodes().await.len(), 1);
        assert!(net.conns().await.is_empty());

        drop(stream);
        assert!(
            settle(|| {
                let net = net.clone();
                async move { net.local_node.workload() == 0 }
            })
            .await
        );
    }

    #[tokio::test]
    async fn two_peers_wire_up_and_gossip_tunnels() {
        let (a, a_pport, a_bport) = spawn_instance().await;
        let (b, _b_pport, b_bport) = spawn_instance().await;

        let node = connect_cmd(
            &format!("127.0.0.1:{}", a_bport),
            &format!("127.0.0.1:{}", b_bport),
        )
        .await
        .unwrap();
        assert_eq!(node.id, b.id);

        // both graphs converge on each other, active
        assert!(
            settle(|| {
                let (a, b) = (a.clone(), b.clone());
                async move {
                    let a_sees = a.net().conn(&b.id).await.is_some();
                    let b_sees = b.net().conn(&a.id).await.is_some();
                    a_sees && b_sees
                }
            })
            .await,
            "peers never wired both ways"
        );
        assert!(a.net().node(&b.id).await.unwrap().is_active());
        assert!(b.net().node(&a.id).await.unwrap().is_active());

        // a proxied session at A becomes visible in B's view of A
        let sink = spawn_echo_sink().await;
        let mut stream = socks_connect(a_pport, &sink).await;
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();

        assert!(
            settle(|| {
                let (a, b) = (a.clone(), b.clone());
                async move {
                    match b.net().node(&a.id).await {
                        Some(n) => n.workload() >= 1,
                        None => false,
                    }
                }
            })
            .await,
            "tunnel event never propagated"
        );
    }

    #[tokio::test]
    async fn heartbeats_keep_the_link_active() {
        let (a, _a_pport, a_bport) = spawn_instance().await;
        let (b, _b_pport, b_bport) = spawn_instance().await;

        connect_cmd(
            &format!("127.0.0.1:{}", a_bport),
            &format!("127.0.0.1:{}", b_bport),
        )
        .await
        .unwrap();

        assert!(
            settle(|| {
                let (a, b) = (a.clone(), b.clone());
                async move {
                    a.net().conn(&b.id).await.is_some() && b.net().conn(&a.id).await.is_some()
                }
            })
            .await
        );

        // several heartbeat periods later the link is still there
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(a.net().node(&b.id).await.unwrap().is_active());
        assert!(b.net().node(&a.id).await.unwrap().is_active());
        // and the ping-pong produced a round-trip estimate
        assert!(a.net().node(&b.id).await.unwrap().rtt_ewma().is_some());
    }

    #[tokio::test]
    async fn manual_disconnect_forgets_the_peer_on_both_sides() {
        let (a, _a_pport, a_bport) = spawn_instance().await;
        let (b, _b_pport, b_bport) = spawn_instance().await;
        let a_baddr = format!("127.0.0.1:{}", a_bport);

        connect_cmd(&a_baddr, &format!("127.0.0.1:{}", b_bport))
            .await
            .unwrap();
        assert!(
            settle(|| {
                let (a, b) = (a.clone(), b.clone());
                async move {
                    a.net().conn(&b.id).await.is_some() && b.net().conn(&a.id).await.is_some()
                }
            })
            .await
        );

        let node = disconnect_cmd(&a_baddr, &b.id).await.unwrap();
        assert_eq!(node.id, b.id);

        // the prior peer set is restored: the disconnect suppressed
        // tracing, so the node is gone rather than parked for revival
        assert!(
            settle(|| {
                let (a, b) = (a.clone(), b.clone());
                async move { a.net().node(&b.id).await.is_none() }
            })
            .await,
            "A still knows B"
        );
        assert!(
            settle(|| {
                let (a, b) = (a.clone(), b.clone());
                async move { b.net().node(&a.id).await.is_none() }
            })
            .await,
            "B still knows A, goodbye never arrived"
        );
    }

    #[tokio::test]
    async fn simultaneous_wires_converge_on_one_conn() {
        let (a, _a_pport, a_bport) = spawn_instance().await;
        let (b, _b_pport, b_bport) = spawn_instance().await;

        let a_target = format!("127.0.0.1:{}", b_bport);
        let b_target = format!("127.0.0.1:{}", a_bport);
        let wa = a.wire(&a_target);
        let wb = b.wire(&b_target);
        let _ = tokio::join!(wa, wb); // either side may lose the race

        assert!(
            settle(|| {
                let (a, b) = (a.clone(), b.clone());
                async move {
                    let ac = a.net().conns().await;
                    let bc = b.net().conns().await;
                    ac.len() == 1
                        && bc.len() == 1
                        && !ac[0].is_closed()
                        && !bc[0].is_closed()
                }
            })
            .await,
            "duplicate conns never converged"
        );

        // both sides agree: the survivor is the link dialed by the
        // smaller endpoint
        let a_is_min = a.id < b.id;
        let ac = a.net().conn(&b.id).await.unwrap();
        let bc = b.net().conn(&a.id).await.unwrap();
        assert_eq!(ac.outbound, a_is_min);
        assert_eq!(bc.outbound, !a_is_min);
    }

    #[tokio::test]
    async fn heartbeat_timeout_parks_the_peer_and_the_tracer_revives_it() {
        let (a, _a_pport, _a_bport) = spawn_instance().await;
        let (peer_baddr, peer_id) = spawn_silent_peer().await;

        a.wire(&peer_baddr).await.unwrap();
        assert!(a.net().node(&peer_id).await.unwrap().is_active());

        // the peer never answers the ping-pong: the timer fires at 2x ttl
        // and the link is torn down, the node parked for revival
        assert!(
            settle(|| {
                let (a, id) = (a.clone(), peer_id.clone());
                async move {
                    match a.net().node(&id).await {
                        Some(n) => !n.is_active(),
                        None => false,
                    }
                }
            })
            .await,
            "link never timed out"
        );
        assert!(a.net().node(&peer_id).await.unwrap().to_be_traced());
        assert!(a.net().conn(&peer_id).await.is_none());

        // the tracer probes after its first backoff, the peer greets, and
        // the discovery is wired back up
        assert!(
            settle_for(Duration::from_secs(12), || {
                let (a, id) = (a.clone(), peer_id.clone());
                async move {
                    match a.net().node(&id).await {
                        Some(n) => n.is_active(),
                        None => false,
                    }
                }
            })
            .await,
            "peer never revived"
        );
    }

    #[tokio::test]
    async fn ctrl_restart_drops_peers_and_relistens() {
        let (a, _a_pport, a_bport) = spawn_instance().await;
        let (b, _b_pport, b_bport) = spawn_instance().await;
        let a_baddr = format!("127.0.0.1:{}", a_bport);

        connect_cmd(&a_baddr, &format!("127.0.0.1:{}", b_bport))
            .await
            .unwrap();
        assert!(
            settle(|| {
                let (a, b) = (a.clone(), b.clone());
                async move { a.net().conn(&b.id).await.is_some() }
            })
            .await
        );

        let tuning = Tuning::default();
        let (t, _rx, _hello, _) =
            open_control(&a_baddr, tuning.dial_timeout, tuning.send_queue)
                .await
                .unwrap();
        let restart = compose(
            MessageKind::Ctrl,
            Some(&PayloadCtrl {
                operation: CTRL_RESTART,
            }),
        )
        .unwrap();
        t.send(restart).unwrap();

        // the whole network is dropped...
        assert!(
            settle(|| {
                let a = a.clone();
                async move { a.net().conns().await.is_empty() }
            })
            .await,
            "restart never dropped the conns"
        );
        t.close();

        // ...the control plane comes back on the same port...
        assert!(
            settle(|| async move {
                TcpStream::connect(("127.0.0.1", a_bport)).await.is_ok()
            })
            .await,
            "control plane never relistened"
        );

        // ...and B, which parked A for tracing when the link dropped,
        // re-wires the pair through the discovery path
        assert!(
            settle_for(Duration::from_secs(12), || {
                let (a, b) = (a.clone(), b.clone());
                async move {
                    a.net().conn(&b.id).await.is_some() && b.net().conn(&a.id).await.is_some()
                }
            })
            .await,
            "mesh never healed after the restart"
        );
    }

    #[tokio::test]
    async fn node_snapshot_replaces_peer_tunnels() {
        let (a, _a_pport, a_bport) = spawn_instance().await;
        let (b, b_pport, b_bport) = spawn_instance().await;
        let a_baddr = format!("127.0.0.1:{}", a_bport);

        connect_cmd(&a_baddr, &format!("127.0.0.1:{}", b_bport))
            .await
            .unwrap();
        assert!(
            settle(|| {
                let (a, b) = (a.clone(), b.clone());
                async move { a.net().conn(&b.id).await.is_some() }
            })
            .await
        );

        let tuning = Tuning::default();
        let (t, _rx, _hello, _) =
            open_control(&a_baddr, tuning.dial_timeout, tuning.send_queue)
                .await
                .unwrap();
        let snapshot = PayloadNode {
            id: b.id.clone(),
            baddr: format!("127.0.0.1:{}", b_bport),
            paddr: format!("127.0.0.1:{}", b_pport),
            active: true,
            tunnels: vec![TunnelInfo {
                id: "t1".to_string(),
                target: "sink.example:9000".to_string(),
                copies: 5,
            }],
        };
        t.send(compose(MessageKind::Node, Some(&snapshot)).unwrap())
            .unwrap();

        assert!(
            settle(|| {
                let (a, b) = (a.clone(), b.clone());
                async move {
                    match a.net().node(&b.id).await {
                        Some(n) => n.workload() == 5,
                        None => false,
                    }
                }
            })
            .await,
            "snapshot never replaced the tunnel set"
        );
        t.close();
    }

    #[tokio::test]
    async fn bandwidth_updates_the_named_peer() {
        let (a, _a_pport, a_bport) = spawn_instance().await;
        let (b, _b_pport, b_bport) = spawn_instance().await;
        let a_baddr = format!("127.0.0.1:{}", a_bport);

        connect_cmd(&a_baddr, &format!("127.0.0.1:{}", b_bport))
            .await
            .unwrap();
        assert!(
            settle(|| {
                let (a, b) = (a.clone(), b.clone());
                async move { a.net().conn(&b.id).await.is_some() }
            })
            .await
        );

        let tuning = Tuning::default();
        let (t, _rx, _hello, _) =
            open_control(&a_baddr, tuning.dial_timeout, tuning.send_queue)
                .await
                .unwrap();
        let sample = PayloadBandwidth {
            node_id: b.id.clone(),
            tot: 4096,
            bandwidth: 1234,
            kind: "download".to_string(),
        };
        t.send(compose(MessageKind::Bandwidth, Some(&sample)).unwrap())
            .unwrap();

        assert!(
            settle(|| {
                let (a, b) = (a.clone(), b.clone());
                async move {
                    match a.net().node(&b.id).await {
                        Some(n) => n.bandwidth() == (1234, 0),
                        None => false,
                    }
                }
            })
            .await,
            "bandwidth sample never applied"
        );
        t.close();
    }

    #[tokio::test]
    async fn inspect_streams_node_and_bandwidth_features() {
        let (a, a_pport, a_bport) = spawn_instance().await;
        let a_baddr = format!("127.0.0.1:{}", a_bport);

        let (item_tx, mut item_rx) = mpsc::unbounded_channel();
        let baddr = a_baddr.clone();
        let inspector = tokio::spawn(async move {
            let _ = inspect_cmd(
                &baddr,
                &[MessageKind::Node, MessageKind::Bandwidth],
                move |item| {
                    let _ = item_tx.send(item);
                },
            )
            .await;
        });
        // let the inspect request land before producing events
        tokio::time::sleep(Duration::from_millis(100)).await;

        // an open proxied session produces node updates immediately and
        // a bandwidth sample on the next one-second tick
        let sink = spawn_echo_sink().await;
        let mut stream = socks_connect(a_pport, &sink).await;
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();

        let (mut saw_node, mut saw_bandwidth) = (false, false);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !(saw_node && saw_bandwidth) {
            match tokio::time::timeout_at(deadline, item_rx.recv()).await {
                Ok(Some(InspectItem::Node(n))) => {
                    if n.id == a.id {
                        saw_node = true;
                    }
                }
                Ok(Some(InspectItem::Bandwidth(bw))) => {
                    assert_eq!(bw.node_id, a.id);
                    saw_bandwidth = true;
                }
                _ => break,
            }
        }
        assert!(saw_node, "no node update streamed");
        assert!(saw_bandwidth, "no bandwidth sample streamed");
        inspector.abort();
    }

    #[tokio::test]
    async fn replaying_a_seen_tunnel_event_is_a_noop() {
        let rt = Runtime::new();
        let b = Booster::new(rt, 1080, 4884, Tuning::default());
        let local = b.net().local_node.clone();

        let pl = PayloadProxyUpdate {
            node_id: local.id.clone(),
            target: "example.com:80".to_string(),
            operation: TunnelOp::Open as i32,
            seq: 7,
        };

        b.update_node(&local, pl.clone(), false);
        b.update_node(&local, pl, false);
        assert_eq!(local.workload(), 1);

        // a new sequence number is a genuinely new event
        b.update_node(
            &local,
            PayloadProxyUpdate {
                node_id: local.id.clone(),
                target: "example.com:80".to_string(),
                operation: TunnelOp::Open as i32,
                seq: 8,
            },
            false,
        );
        assert_eq!(local.workload(), 2);
    }

    #[test]
    fn visited_set_is_bounded() {
        let mut v = Visited::default();
        for seq in 0..(VISITED_CAP as u64 + 100) {
            assert!(v.insert(("origin".to_string(), seq)));
        }
        assert_eq!(v.set.len(), VISITED_CAP);
        // the oldest entries were evicted and would be applied again
        assert!(v.insert(("origin".to_string(), 0)));
    }
}
