//! socks.rs - SOCKS5 front-end of a booster instance.
//!
//! Terminates RFC 1928 CONNECT requests from local applications and asks
//! the dispatcher for the outbound connection, so every request rides the
//! least-loaded peer. Only CMD CONNECT and METHOD "no authentication" are
//! spoken; BIND and UDP-ASSOCIATE are refused.
//!
//! The front-end is also the instance's event source: it publishes a
//! tunnel-open event after every successful dial, an ack once the reply
//! reaches the client, a tunnel-close when either end hangs up, and a
//! bandwidth sample per direction every second while at least one tunnel
//! is open.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::BytesMut;
use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::dispatcher::Dialer;
use crate::protocol::payload::{PayloadProxyUpdate, TunnelOp};
use crate::pubsub::{Event, PubSub};

/// Topic where the proxy publishes tunnel lifecycle events.
pub const TOPIC_TUNNEL_EVENTS: &str = "proxy.tunnels";
/// Topic where the proxy publishes bandwidth samples.
pub const TOPIC_BANDWIDTH: &str = "proxy.bandwidth";

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NOAUTH: u8 = 0x00;
const METHOD_NOACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IP4: u8 = 0x01;
const ATYP_FQDN: u8 = 0x03;
const ATYP_IP6: u8 = 0x04;
const RESP_SUCCESS: u8 = 0x00;
const RESP_HOST_UNREACHABLE: u8 = 0x04;
const RESP_CMD_NOT_SUPPORTED: u8 = 0x07;
const RESP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// One bandwidth sample: total bytes so far and bytes moved over the last
/// sampling interval, per direction.
#[derive(Debug, Clone)]
pub struct BandwidthMessage {
    pub tot: u64,
    pub bandwidth: u64,
    pub download: bool,
}

#[derive(Default)]
struct DirectionStats {
    tot: AtomicU64,
    last: AtomicU64,
}

impl DirectionStats {
    fn sample(&self) -> (u64, u64) {
        let tot = self.tot.load(Ordering::Relaxed);
        let last = self.last.swap(tot, Ordering::Relaxed);
        (tot, tot.saturating_sub(last))
    }
}

#[derive(Default)]
struct ProxyStats {
    download: DirectionStats,
    upload: DirectionStats,
    open_tunnels: AtomicU64,
}

pub struct Socks5 {
    dialer: Arc<dyn Dialer>,
    pubsub: Arc<PubSub>,
    /// Identity stamped onto published tunnel events.
    local_id: String,
    seq: AtomicU64,
    stats: Arc<ProxyStats>,
}

impl Socks5 {
    pub fn new(dialer: Arc<dyn Dialer>, pubsub: Arc<PubSub>, local_id: String) -> Arc<Socks5> {
        Arc::new(Socks5 {
            dialer,
            pubsub,
            local_id,
            seq: AtomicU64::new(0),
            stats: Arc::new(ProxyStats::default()),
        })
    }

    pub fn proto(&self) -> &'static str {
        "socks5"
    }

    /// Accept loop. Returns when the shutdown signal fires or the
    /// listener breaks.
    pub async fn listen_and_serve(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        port: u16,
    ) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("socks5: bind port {}", port))?;
        info!("{}: listening on port: {}", self.proto(), port);

        self.clone().spawn_bandwidth_sampler(shutdown.clone());

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("socks5: accepted {}", peer);
                        let s = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = s.handle(stream).await {
                                debug!("socks5: session ended: {:#}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("socks5: accept: {}", e);
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("socks5: shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle(self: Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let target = negotiate(&mut stream).await?;

        let proxied = match self.dialer.dial_context(&target).await {
            Ok(p) => p,
            Err(e) => {
                write_reply(&mut stream, RESP_HOST_UNREACHABLE, None).await?;
                return Err(e.into());
            }
        };

        self.publish_tunnel(TunnelOp::Open, &target);
        self.stats.open_tunnels.fetch_add(1, Ordering::Relaxed);

        let bind_addr = proxied.stream.local_addr().ok();
        if let Err(e) = write_reply(&mut stream, RESP_SUCCESS, bind_addr).await {
            self.finish_tunnel(&target);
            return Err(e);
        }
        self.publish_tunnel(TunnelOp::Ack, &target);

        debug!("socks5: {} established, pumping", target);
        let res = self.pump(stream, proxied.stream).await;

        // the carrier guard in `proxied` is released only after the
        // session is accounted closed
        self.finish_tunnel(&target);
        res
    }

    /// Copies bytes both ways until either side closes, counting them
    /// towards the bandwidth totals.
    async fn pump(&self, client: TcpStream, target: TcpStream) -> Result<()> {
        let (mut client_read, mut client_write) = client.into_split();
        let (mut target_read, mut target_write) = target.into_split();

        let mut up_buf = BytesMut::with_capacity(16 * 1024);
        let mut down_buf = BytesMut::with_capacity(16 * 1024);

        loop {
            tokio::select! {
                res = client_read.read_buf(&mut up_buf) => match res {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        self.stats.upload.tot.fetch_add(n as u64, Ordering::Relaxed);
                        target_write.write_all(&up_buf[..n]).await?;
                        up_buf.clear();
                    }
                },
                res = target_read.read_buf(&mut down_buf) => match res {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        self.stats.download.tot.fetch_add(n as u64, Ordering::Relaxed);
                        client_write.write_all(&down_buf[..n]).await?;
                        down_buf.clear();
                    }
                },
            }
        }
        Ok(())
    }

    fn finish_tunnel(&self, target: &str) {
        self.stats.open_tunnels.fetch_sub(1, Ordering::Relaxed);
        self.publish_tunnel(TunnelOp::Close, target);
    }

    fn publish_tunnel(&self, op: TunnelOp, target: &str) {
        self.pubsub.publish(
            TOPIC_TUNNEL_EVENTS,
            Event::Tunnel(PayloadProxyUpdate {
                node_id: self.local_id.clone(),
                target: target.to_string(),
                operation: op as i32,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
            }),
        );
    }

    /// Emits one bandwidth sample per direction every second while at
    /// least one tunnel is open.
    fn spawn_bandwidth_sampler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if self.stats.open_tunnels.load(Ordering::Relaxed) == 0 {
                            continue;
                        }
                        let (tot, bw) = self.stats.download.sample();
                        self.pubsub.publish(
                            TOPIC_BANDWIDTH,
                            Event::Bandwidth(BandwidthMessage { tot, bandwidth: bw, download: true }),
                        );
                        let (tot, bw) = self.stats.upload.sample();
                        self.pubsub.publish(
                            TOPIC_BANDWIDTH,
                            Event::Bandwidth(BandwidthMessage { tot, bandwidth: bw, download: false }),
                        );
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// Performs the server side of the SOCKS5 negotiation and returns the
/// requested target as a canonical `host:port`.
async fn negotiate<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // method selection
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await.context("socks5: greeting")?;
    if head[0] != SOCKS_VERSION {
        return Err(anyhow!("socks5: bad version: {}", head[0]));
    }
    let nmethods = head[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await.context("socks5: methods")?;

    if !methods.contains(&METHOD_NOAUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NOACCEPTABLE])
            .await?;
        return Err(anyhow!("socks5: client offers no acceptable method"));
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NOAUTH]).await?;

    // request
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await.context("socks5: request")?;
    if req[0] != SOCKS_VERSION {
        return Err(anyhow!("socks5: bad request version: {}", req[0]));
    }
    if req[1] != CMD_CONNECT {
        write_reply(stream, RESP_CMD_NOT_SUPPORTED, None).await?;
        return Err(anyhow!("socks5: unsupported command: {}", req[1]));
    }

    let host = match req[3] {
        ATYP_IP4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            std::net::Ipv4Addr::from(octets).to_string()
        }
        ATYP_FQDN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).context("socks5: domain not utf-8")?
        }
        ATYP_IP6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            format!("[{}]", std::net::Ipv6Addr::from(octets))
        }
        other => {
            write_reply(stream, RESP_ATYP_NOT_SUPPORTED, None).await?;
            return Err(anyhow!("socks5: unsupported address type: {}", other));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(format!("{}:{}", host, u16::from_be_bytes(port)))
}

/// Writes a SOCKS5 reply. The bound address mirrors the family of the
/// outbound socket; errors carry the zero IPv4 address.
async fn write_reply<S>(stream: &mut S, code: u8, bind: Option<SocketAddr>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut reply = vec![SOCKS_VERSION, code, 0x00];
    match bind {
        Some(SocketAddr::V4(v4)) => {
            reply.push(ATYP_IP4);
            reply.extend_from_slice(&v4.ip().octets());
            reply.extend_from_slice(&v4.port().to_be_bytes());
        }
        Some(SocketAddr::V6(v6)) => {
            reply.push(ATYP_IP6);
            reply.extend_from_slice(&v6.ip().octets());
            reply.extend_from_slice(&v6.port().to_be_bytes());
        }
        None => {
            reply.push(ATYP_IP4);
            reply.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    stream.write_all(&reply).await?;
    Ok(())
}
