//! conn.rs - a live control-plane link to a remote peer.
//!
//! `Transport` frames packets onto one TCP stream with a single-writer
//! invariant: handlers post to a bounded send queue and a dedicated task
//! owns the write half. `Conn` pairs a transport with the remote node it
//! was wired to, plus the heartbeat timer that tears the link down when
//! the peer goes silent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

use crate::network::node::Node;
use crate::network::NetworkError;
use crate::protocol::packet::{Decoder, Encoder, Packet};

/// Default depth of the per-connection send queue.
pub const DEFAULT_SEND_QUEUE: usize = 256;

/// Depth of the inbound packet channel handed to the handler loop.
const RECV_QUEUE: usize = 32;

/// Lifecycle of a control-plane link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Our HELLO is on the wire, the peer's not yet seen.
    HelloSent = 0,
    /// The peer's HELLO arrived; the link is not yet installed.
    HelloReceived = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::HelloSent,
            1 => ConnState::HelloReceived,
            2 => ConnState::Active,
            3 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// A framed, single-writer packet channel over one byte stream.
#[derive(Clone)]
pub struct Transport {
    send_tx: mpsc::Sender<Packet>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
    peer_addr: Option<SocketAddr>,
}

impl Transport {
    /// Wraps a stream, spawning the reader and writer tasks. Returns the
    /// transport and the channel inbound packets arrive on; the channel
    /// closes when the link dies.
    pub fn new<S>(stream: S, peer_addr: Option<SocketAddr>, queue: usize) -> (Transport, mpsc::Receiver<Packet>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (send_tx, mut send_rx) = mpsc::channel::<Packet>(queue);
        let (recv_tx, recv_rx) = mpsc::channel::<Packet>(RECV_QUEUE);
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        let t = Transport {
            send_tx,
            closed_tx,
            closed_rx,
            peer_addr,
        };

        // writer: the only task that touches the write half. On close it
        // drains whatever was queued first, so replies posted right before
        // the close still reach the peer; an interrupted write aborts
        // instead, the frame is already broken.
        let writer_t = t.clone();
        tokio::spawn(async move {
            let mut enc = Encoder::new(write_half);
            let mut closed = writer_t.closed_rx.clone();
            loop {
                tokio::select! {
                    p = send_rx.recv() => match p {
                        Some(p) => tokio::select! {
                            res = enc.encode(&p) => {
                                if let Err(e) = res {
                                    debug!("conn: write: {}", e);
                                    writer_t.close();
                                    return;
                                }
                            }
                            _ = closed.changed() => return,
                        },
                        None => return,
                    },
                    _ = closed.changed() => break,
                }
            }

            let _ = tokio::time::timeout(Duration::from_secs(1), async {
                while let Ok(p) = send_rx.try_recv() {
                    if enc.encode(&p).await.is_err() {
                        break;
                    }
                }
            })
            .await;
        });

        // reader: decodes packets in arrival order
        let reader_t = t.clone();
        tokio::spawn(async move {
            let mut dec = Decoder::new(read_half);
            let mut closed = reader_t.closed_rx.clone();
            loop {
                tokio::select! {
                    p = dec.decode() => match p {
                        Ok(p) => {
                            if recv_tx.send(p).await.is_err() {
                                reader_t.close();
                                return;
                            }
                        }
                        Err(e) => {
                            debug!("conn: read: {}", e);
                            reader_t.close();
                            return;
                        }
                    },
                    _ = closed.changed() => return,
                }
            }
        });

        (t, recv_rx)
    }

    /// Posts a packet to the send queue. Overflow closes the link: a peer
    /// that cannot drain its queue is not worth keeping.
    pub fn send(&self, p: Packet) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        match self.send_tx.try_send(p) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("conn: send queue overflow, closing link");
                self.close();
                Err(NetworkError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(NetworkError::Closed),
        }
    }

    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

/// Restartable deadline that closes the transport when it fires. Receiving
/// a heartbeat in time keeps pushing the deadline away.
pub struct HeartbeatTimer {
    deadline_tx: watch::Sender<Option<Instant>>,
}

impl HeartbeatTimer {
    /// Spawns the watcher task. The timer starts disarmed.
    pub fn new(transport: Transport, conn_id: String) -> HeartbeatTimer {
        let (deadline_tx, mut deadline_rx) = watch::channel::<Option<Instant>>(None);

        tokio::spawn(async move {
            loop {
                let deadline = *deadline_rx.borrow();
                match deadline {
                    Some(at) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {
                                info!("conn: no heartbeat received from [{}]: timer expired", conn_id);
                                transport.close();
                                return;
                            }
                            res = deadline_rx.changed() => {
                                if res.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    None => {
                        if deadline_rx.changed().await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        HeartbeatTimer { deadline_tx }
    }

    /// Arms (or re-arms) the timer `ttl` from now.
    pub fn reset(&self, ttl: Duration) {
        let _ = self.deadline_tx.send(Some(Instant::now() + ttl));
    }

    /// Disarms the timer until the next reset.
    pub fn stop(&self) {
        let _ = self.deadline_tx.send(None);
    }
}

/// A control-plane link installed in the network: transport plus the
/// remote peer's node. The node is owned by the Network; the conn holds
/// the id and a shared handle, never a back-reference.
pub struct Conn {
    pub id: String,
    pub remote_node: Arc<Node>,
    pub transport: Transport,
    pub heartbeat: HeartbeatTimer,
    /// True when we dialed the link, false when it was accepted. Drives
    /// the deterministic duplicate-peer resolution.
    pub outbound: bool,
    state: AtomicU8,
    last_heartbeat_sent: Mutex<Option<Instant>>,
}

impl Conn {
    /// Wraps a transport whose greeting is already on the wire; the
    /// caller advances the state as the HELLO exchange completes.
    pub fn new(transport: Transport, remote_node: Arc<Node>, outbound: bool) -> Arc<Conn> {
        let heartbeat = HeartbeatTimer::new(transport.clone(), remote_node.id.clone());
        Arc::new(Conn {
            id: remote_node.id.clone(),
            remote_node,
            transport,
            heartbeat,
            outbound,
            state: AtomicU8::new(ConnState::HelloSent as u8),
            last_heartbeat_sent: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, s: ConnState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn send(&self, p: Packet) -> Result<(), NetworkError> {
        self.transport.send(p)
    }

    /// Closes the link. All transitions out of Active are terminal;
    /// reconnection is the tracer's job.
    pub fn close(&self) {
        self.set_state(ConnState::Closing);
        self.heartbeat.stop();
        self.transport.close();
        self.set_state(ConnState::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    pub fn mark_heartbeat_sent(&self) {
        *self.last_heartbeat_sent.lock().unwrap() = Some(Instant::now());
    }

    /// Time since the last heartbeat we sent, if any.
    pub fn heartbeat_elapsed(&self) -> Option<Duration> {
        self.last_heartbeat_sent.lock().unwrap().map(|at| at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::payload::{compose, PayloadConnect};
    use crate::protocol::MessageKind;

    fn connect_packet(target: &str) -> Packet {
        compose(
            MessageKind::Connect,
            Some(&PayloadConnect {
                target: target.to_string(),
            }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn packets_cross_a_duplex_link_in_order() {
        let (a, b) = tokio::io::duplex(4096);
        let (ta, _ra) = Transport::new(a, None, DEFAULT_SEND_QUEUE);
        let (_tb, mut rb) = Transport::new(b, None, DEFAULT_SEND_QUEUE);

        for i in 0..8 {
            ta.send(connect_packet(&format!("host-{}:80", i))).unwrap();
        }

        for i in 0..8 {
            let p = tokio::time::timeout(Duration::from_secs(1), rb.recv())
                .await
                .unwrap()
                .unwrap();
            let (kind, _) = crate::protocol::payload::validate(&p).unwrap();
            assert_eq!(kind, MessageKind::Connect);
            match crate::protocol::payload::Payload::from_packet(kind, &p).unwrap() {
                crate::protocol::payload::Payload::Connect(pl) => {
                    assert_eq!(pl.target, format!("host-{}:80", i));
                }
                other => panic!("unexpected payload: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn close_ends_the_receive_channel() {
        let (a, b) = tokio::io::duplex(4096);
        let (ta, _ra) = Transport::new(a, None, DEFAULT_SEND_QUEUE);
        let (_tb, mut rb) = Transport::new(b, None, DEFAULT_SEND_QUEUE);

        ta.close();
        assert!(ta.is_closed());

        let got = tokio::time::timeout(Duration::from_secs(1), rb.recv()).await;
        assert!(matches!(got, Ok(None)));
    }

    #[tokio::test]
    async fn send_queue_overflow_closes_the_link() {
        let (a, _b) = tokio::io::duplex(16);
        let (ta, _ra) = Transport::new(a, None, 2);

        // the tiny duplex buffer and queue fill up quickly; eventually the
        // transport must refuse with a backpressure error and close.
        let mut saw_backpressure = false;
        for i in 0..64 {
            match ta.send(connect_packet(&format!("host-{}:80", i))) {
                Ok(()) => tokio::task::yield_now().await,
                Err(NetworkError::Backpressure) => {
                    saw_backpressure = true;
                    break;
                }
                Err(NetworkError::Closed) => break,
                Err(e) => panic!("unexpected error: {:?}", e),
            }
        }
        assert!(saw_backpressure);
        assert!(ta.is_closed());
    }

    #[tokio::test]
    async fn heartbeat_timer_closes_on_expiry() {
        let (a, _b) = tokio::io::duplex(4096);
        let (ta, _ra) = Transport::new(a, None, DEFAULT_SEND_QUEUE);

        let timer = HeartbeatTimer::new(ta.clone(), "peer".to_string());
        timer.reset(Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(ta.is_closed());
    }

    #[tokio::test]
    async fn heartbeat_timer_reset_defers_expiry() {
        let (a, _b) = tokio::io::duplex(4096);
        let (ta, _ra) = Transport::new(a, None, DEFAULT_SEND_QUEUE);

        let timer = HeartbeatTimer::new(ta.clone(), "peer".to_string());
        timer.reset(Duration::from_millis(100));

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            timer.reset(Duration::from_millis(100));
        }
        assert!(!ta.is_closed());

        timer.stop();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!ta.is_closed());
    }

    #[tokio::test]
    async fn conn_state_transitions_are_terminal() {
        let (a, _b) = tokio::io::duplex(4096);
        let (ta, _ra) = Transport::new(a, None, DEFAULT_SEND_QUEUE);
        let node = Arc::new(Node::new("localhost", "1081", "4885", false));

        let conn = Conn::new(ta, node, true);
        assert_eq!(conn.state(), ConnState::HelloSent);

        conn.set_state(ConnState::HelloReceived);
        conn.set_state(ConnState::Active);
        conn.close();
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(conn.is_closed());
    }
}
