// DNS transport layer
//
// Outbound: one fire-and-forget A query per name over UDP.
// Inbound: UDP and TCP listeners sharing one reassembly engine.
// Resolution: find the authoritative server's address through a bootstrap
// resolver when none is configured.

use super::{DnsError, DnsMessage, DnsQType, DnsRecord, Result};
use crate::engine::{ReassemblyEngine, Reply};
use crate::planner::QueryTransport;
use crate::FerryError;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

/// TTL on every answer the listener sends
const ANSWER_TTL: u32 = 60;

/// Largest UDP datagram read from a client
const MAX_UDP_READ: usize = 4096;

fn local_bind_for(server: SocketAddr) -> SocketAddr {
    match (server.is_ipv4(), server.ip().is_loopback()) {
        (true, true) => "127.0.0.1:0",
        (true, false) => "0.0.0.0:0",
        (false, true) => "[::1]:0",
        (false, false) => "[::]:0",
    }
    .parse()
    .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
}

/// UDP sender for chunk queries
pub struct UdpQuerySender {
    server: SocketAddr,
    timeout: Duration,
}

impl UdpQuerySender {
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        Self { server, timeout }
    }

    async fn send_once(&self, qname: &str) -> Result<()> {
        let socket = UdpSocket::bind(local_bind_for(self.server)).await?;
        let packet = DnsMessage::new_query(qname, DnsQType::A, rand::random::<u16>()).to_bytes();

        timeout(self.timeout, socket.send_to(&packet, self.server))
            .await
            .map_err(|_| DnsError::Timeout(self.timeout))??;

        Ok(())
    }
}

#[async_trait]
impl QueryTransport for UdpQuerySender {
    async fn send_query(&self, qname: &str) -> crate::Result<()> {
        debug!("Sending to {} → {}", self.server, qname);

        self.send_once(qname)
            .await
            .map_err(|e| FerryError::Transport {
                name: qname.to_string(),
                server: self.server.to_string(),
                reason: e.to_string(),
            })
    }

    fn server(&self) -> String {
        self.server.to_string()
    }
}

/// Send one query and wait for the matching response
pub async fn exchange(
    qname: &str,
    qtype: DnsQType,
    server: SocketAddr,
    wait: Duration,
) -> Result<DnsMessage> {
    let socket = UdpSocket::bind(local_bind_for(server)).await?;
    socket.connect(server).await?;

    let id = rand::random::<u16>();
    socket
        .send(&DnsMessage::new_query(qname, qtype, id).to_bytes())
        .await?;

    let mut buf = vec![0u8; MAX_UDP_READ];
    let deadline = tokio::time::Instant::now() + wait;

    loop {
        let n = tokio::time::timeout_at(deadline, socket.recv(&mut buf))
            .await
            .map_err(|_| DnsError::Timeout(wait))??;

        match DnsMessage::parse(&buf[..n]) {
            Ok(msg) if msg.header.id == id && msg.header.is_response() => return Ok(msg),
            Ok(_) => debug!("Discarding unrelated response from {}", server),
            Err(e) => debug!("Discarding malformed response from {}: {}", server, e),
        }
    }
}

/// Resolve the address to send queries to.
///
/// Tries `domain`'s A record through `bootstrap`; failing that, its NS record
/// and then the nameserver's A record.
pub async fn resolve_server(domain: &str, bootstrap: SocketAddr, wait: Duration) -> Result<IpAddr> {
    debug!("Resolving {} via {}", domain, bootstrap);

    match exchange(domain, DnsQType::A, bootstrap, wait).await {
        Ok(msg) => {
            if let Some(addr) = msg.first_a() {
                info!("Resolved A {} → {}", domain, addr);
                return Ok(IpAddr::V4(addr));
            }
        }
        Err(e) => warn!("DNS A lookup failed for {}: {}", domain, e),
    }

    match exchange(domain, DnsQType::NS, bootstrap, wait).await {
        Ok(msg) => {
            if let Some(ns) = msg.first_ns() {
                let ns = ns.to_string();
                match exchange(&ns, DnsQType::A, bootstrap, wait).await {
                    Ok(glue) => {
                        if let Some(addr) = glue.first_a() {
                            info!("Resolved {} via NS {} → {}", domain, ns, addr);
                            return Ok(IpAddr::V4(addr));
                        }
                    }
                    Err(e) => warn!("DNS A lookup failed for {}: {}", ns, e),
                }
            }
        }
        Err(e) => warn!("DNS NS lookup failed for {}: {}", domain, e),
    }

    Err(DnsError::NoAddress(domain.to_string()))
}

/// Build the wire answer for one received packet.
///
/// Returns `None` for packets that are not parseable queries; those get no
/// reply at all.
pub fn answer(engine: &ReassemblyEngine, packet: &[u8], source: SocketAddr) -> Option<Vec<u8>> {
    let query = match DnsMessage::parse(packet) {
        Ok(msg) if !msg.header.is_response() => msg,
        Ok(_) => {
            debug!("Ignoring response packet from {}", source);
            return None;
        }
        Err(e) => {
            debug!("Unparseable packet from {}: {}", source, e);
            return None;
        }
    };

    let qname = query.question_domain().ok()?.to_string();
    let handled = engine.handle(&qname, source);

    let answers = match handled.reply {
        Reply::Address(addr) => vec![DnsRecord::new_a(&qname, addr, ANSWER_TTL)],
        Reply::Empty => Vec::new(),
    };

    Some(DnsMessage::response_to(&query, answers).to_bytes())
}

/// UDP + TCP listener feeding one engine
pub struct Listener {
    engine: Arc<ReassemblyEngine>,
    udp: UdpSocket,
    tcp: TcpListener,
}

impl Listener {
    /// Bind UDP and TCP on `addr`.
    ///
    /// With port 0 the TCP listener takes the port the UDP socket was given.
    pub async fn bind(addr: SocketAddr, engine: Arc<ReassemblyEngine>) -> Result<Self> {
        let udp = UdpSocket::bind(addr).await?;
        let tcp = TcpListener::bind(udp.local_addr()?).await?;

        Ok(Self { engine, udp, tcp })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    pub fn engine(&self) -> &Arc<ReassemblyEngine> {
        &self.engine
    }

    /// Serve until either sub-listener fails
    pub async fn serve(self) -> Result<()> {
        let addr = self.local_addr()?;
        info!(
            "Listening on {} (udp+tcp) for {} [session key: {}]",
            addr,
            self.engine.base_domain(),
            self.engine.policy_name()
        );

        let udp = serve_udp(self.udp, Arc::clone(&self.engine));
        let tcp = serve_tcp(self.tcp, Arc::clone(&self.engine));

        tokio::try_join!(udp, tcp)?;
        Ok(())
    }
}

async fn serve_udp(socket: UdpSocket, engine: Arc<ReassemblyEngine>) -> Result<()> {
    let mut buf = vec![0u8; MAX_UDP_READ];

    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP port unreachable from an earlier reply surfaces here on some platforms
                warn!("UDP receive error: {}", e);
                continue;
            }
        };

        if let Some(reply) = answer(&engine, &buf[..n], src) {
            if let Err(e) = socket.send_to(&reply, src).await {
                warn!("UDP reply to {} failed: {}", src, e);
            }
        }
    }
}

async fn serve_tcp(listener: TcpListener, engine: Arc<ReassemblyEngine>) -> Result<()> {
    loop {
        let (stream, src) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("TCP accept error: {}", e);
                continue;
            }
        };

        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(e) = handle_tcp(stream, src, engine).await {
                debug!("TCP connection from {} closed: {}", src, e);
            }
        });
    }
}

/// Serve length-prefixed queries on one TCP connection until it closes
async fn handle_tcp(
    mut stream: TcpStream,
    src: SocketAddr,
    engine: Arc<ReassemblyEngine>,
) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let msg_len = u16::from_be_bytes(len_buf) as usize;
        let mut msg_buf = vec![0u8; msg_len];
        stream.read_exact(&mut msg_buf).await?;

        if let Some(reply) = answer(&engine, &msg_buf, src) {
            let mut framed = Vec::with_capacity(2 + reply.len());
            framed.extend_from_slice(&(reply.len() as u16).to_be_bytes());
            framed.extend_from_slice(&reply);
            stream.write_all(&framed).await?;
        }
    }
}
