//! LAN discovery: broadcast a request, collect responses for a bounded window, answer others' requests.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use lanchat_core::discovery::{peer_from_response, DEFAULT_DISCOVERY_PORT, RECV_BUFFER_SIZE};
use lanchat_core::{Datagram, PeerDirectory, PeerId, PeerRecord};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of `serve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeStatus {
    /// Responder bound and running.
    Started(SocketAddr),
    /// A responder is already running; nothing was opened.
    AlreadyRunning,
    /// The discovery port could not be bound. Discovery-initiation still works.
    Unavailable,
}

struct Responder {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

pub struct DiscoveryService {
    self_id: PeerId,
    self_name: String,
    port: u16,
    broadcast: IpAddr,
    directory: Arc<Mutex<PeerDirectory>>,
    responder: std::sync::Mutex<Option<Responder>>,
}

impl DiscoveryService {
    pub fn new(
        self_id: PeerId,
        self_name: impl Into<String>,
        directory: Arc<Mutex<PeerDirectory>>,
    ) -> Self {
        Self {
            self_id,
            self_name: self_name.into(),
            port: DEFAULT_DISCOVERY_PORT,
            broadcast: IpAddr::V4(Ipv4Addr::BROADCAST),
            directory,
            responder: std::sync::Mutex::new(None),
        }
    }

    /// Discovery port: where requests are sent and where the responder binds.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Destination of discovery requests (subnet broadcast by default).
    pub fn with_broadcast(mut self, addr: IpAddr) -> Self {
        self.broadcast = addr;
        self
    }

    /// Broadcast one request and collect responses until `timeout` elapses.
    /// Replies from ourselves and malformed datagrams are dropped; duplicates keep the last reply.
    pub async fn discover(&self, timeout: Duration) -> std::io::Result<Vec<PeerRecord>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;
        let request = Datagram::request(self.self_id.clone(), &self.self_name).encode();
        let dest = SocketAddr::new(self.broadcast, self.port);
        socket.send_to(&request, dest).await?;
        debug!(%dest, "discovery request sent");

        let deadline = tokio::time::Instant::now() + timeout;
        let mut found = PeerDirectory::new();
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            let (n, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Ok(r)) => r,
                // ICMP unreachable from an earlier send surfaces here; keep listening.
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => continue,
                Ok(Err(e)) => {
                    warn!("discovery receive failed: {}", e);
                    break;
                }
            };
            match peer_from_response(&buf[..n], from.ip(), &self.self_id) {
                Some(record) => {
                    debug!(peer = %record.id, %from, "discovery response");
                    found.upsert(record);
                }
                None => debug!(%from, "ignoring discovery datagram"),
            }
        }

        let records = found.records();
        let mut dir = self.directory.lock().await;
        for r in &records {
            dir.upsert(r.clone());
        }
        info!("discovery found {} peer(s)", records.len());
        Ok(records)
    }

    /// Start the responder on the discovery port. Idempotent; a bind failure is logged, not fatal.
    pub fn serve(&self) -> ServeStatus {
        let mut slot = match self.responder.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(r) = slot.as_ref() {
            if !r.task.is_finished() {
                return ServeStatus::AlreadyRunning;
            }
        }
        let socket = match bind_responder(self.port) {
            Ok(s) => s,
            Err(e) => {
                warn!(port = self.port, "discovery responder not started: {}", e);
                return ServeStatus::Unavailable;
            }
        };
        let local_addr = match socket.local_addr() {
            Ok(a) => a,
            Err(e) => {
                warn!("discovery responder not started: {}", e);
                return ServeStatus::Unavailable;
            }
        };
        let response = Datagram::response(self.self_id.clone(), &self.self_name).encode();
        let task = tokio::spawn(respond_loop(socket, response, self.self_id.clone()));
        info!(%local_addr, "discovery responder listening");
        *slot = Some(Responder { local_addr, task });
        ServeStatus::Started(local_addr)
    }

    /// Stop the responder and release its socket. Safe when not running.
    pub fn stop(&self) {
        let taken = match self.responder.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(r) = taken {
            r.task.abort();
            info!(local_addr = %r.local_addr, "discovery responder stopped");
        }
    }

    pub fn is_serving(&self) -> bool {
        match self.responder.lock() {
            Ok(g) => g.as_ref().is_some_and(|r| !r.task.is_finished()),
            Err(_) => false,
        }
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_responder(port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn respond_loop(socket: UdpSocket, response: Vec<u8>, self_id: PeerId) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => continue,
            Err(e) => {
                warn!("discovery responder stopped: {}", e);
                return;
            }
        };
        match Datagram::parse(&buf[..n]) {
            Ok(Datagram::Request { peer_id, name }) if peer_id != self_id => {
                debug!(%peer_id, %from, "answering discovery request from {}", name);
                if let Err(e) = socket.send_to(&response, from).await {
                    debug!(%from, "discovery response failed: {}", e);
                }
            }
            _ => {}
        }
    }
}
