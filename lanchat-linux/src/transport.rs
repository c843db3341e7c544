//! Session engine: one TCP connection at a time, invite handshake, framed reads, serialized writes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lanchat_core::wire::{decode_frame, encode_frame, FrameDecodeError};
use lanchat_core::{ConnectionState, EndReason, Inbound, PeerId, SessionMachine, WireMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex, Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const READ_CHUNK: usize = 16 * 1024;
const MESSAGE_BACKLOG: usize = 256;
/// Delivered frames the event consumer may fall behind before the read loop stops reading.
/// The stalled socket then pushes back on the sender through TCP flow control.
const EVENT_BACKLOG: usize = 256;
/// How long `close` waits to get `EndSession` out before dropping the socket anyway.
const END_SESSION_GRACE: Duration = Duration::from_secs(1);

/// Called with the inviter's ID and name when an invite arrives on an accepted connection.
pub type InviteCallback = Arc<dyn Fn(&PeerId, &str) + Send + Sync>;

/// Ordered engine output for the state controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    State(ConnectionState),
    Message(WireMessage),
}

/// The ordered event stream. Receiving a `Message` hands its backlog credit back to the
/// read loop, so at most `EVENT_BACKLOG` delivered frames are ever queued.
pub struct EngineEvents {
    rx: mpsc::UnboundedReceiver<EngineEvent>,
    credits: Arc<Semaphore>,
}

impl EngineEvents {
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        let event = self.rx.recv().await?;
        if matches!(event, EngineEvent::Message(_)) {
            self.credits.add_permits(1);
        }
        Some(event)
    }
}

impl Drop for EngineEvents {
    fn drop(&mut self) {
        // Nobody is left to return credits; stop metering.
        self.credits.close();
    }
}

/// Reads whole frames from a byte stream.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    scratch: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            scratch: vec![0; READ_CHUNK],
        }
    }

    /// Next frame, or `None` on a clean EOF between frames.
    pub async fn next_frame(&mut self) -> Result<Option<WireMessage>> {
        loop {
            match decode_frame(&self.buf) {
                Ok((msg, used)) => {
                    self.buf.drain(..used);
                    return Ok(Some(msg));
                }
                Err(FrameDecodeError::NeedMore) => {}
                Err(e) => return Err(e.into()),
            }
            let n = self.inner.read(&mut self.scratch).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                )
                .into());
            }
            self.buf.extend_from_slice(&self.scratch[..n]);
        }
    }
}

struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    machine: Mutex<SessionMachine>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Flipped once on teardown; unblocks the read loop and any in-flight write.
    shutdown: watch::Sender<bool>,
}

struct Inner {
    self_id: PeerId,
    self_name: String,
    handshake_timeout: Duration,
    current: Mutex<Option<Arc<Connection>>>,
    next_id: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    messages_tx: broadcast::Sender<WireMessage>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    /// Set once the event stream is taken; an untaken stream is never metered.
    metered: AtomicBool,
    credits: Arc<Semaphore>,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut g) = self.listener.lock() {
            if let Some(task) = g.take() {
                task.abort();
            }
        }
    }
}

/// Session protocol engine. Cheap to clone; clones share the same connection slot.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<Inner>,
}

impl SessionEngine {
    pub fn new(self_id: PeerId, self_name: impl Into<String>, handshake_timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (messages_tx, _) = broadcast::channel(MESSAGE_BACKLOG);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                self_id,
                self_name: self_name.into(),
                handshake_timeout,
                current: Mutex::new(None),
                next_id: AtomicU64::new(1),
                state_tx,
                messages_tx,
                events_tx,
                events_rx: std::sync::Mutex::new(Some(events_rx)),
                metered: AtomicBool::new(false),
                credits: Arc::new(Semaphore::new(EVENT_BACKLOG)),
                listener: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.inner.self_id
    }

    /// State of the current (or last) connection.
    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Frames delivered after the handshake. Lossy: a slow subscriber lags instead of blocking reads.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<WireMessage> {
        self.inner.messages_tx.subscribe()
    }

    /// The reliable, ordered event stream. Only the first caller gets it.
    pub fn take_events(&self) -> Option<EngineEvents> {
        let rx = self.inner.events_rx.lock().ok()?.take()?;
        self.inner.metered.store(true, Ordering::Release);
        Some(EngineEvents {
            rx,
            credits: self.inner.credits.clone(),
        })
    }

    /// Bind the session port and accept connections in the background. Returns the bound address.
    /// Calling again replaces the previous listener.
    pub async fn listen(&self, addr: SocketAddr, on_invite: InviteCallback) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::downgrade(&self.inner),
            on_invite,
        ));
        if let Ok(mut g) = self.inner.listener.lock() {
            if let Some(old) = g.replace(task) {
                old.abort();
            }
        }
        info!(%local, "session listener ready");
        Ok(local)
    }

    /// Connect to `addr` and send our invite. No retry; on failure the slot is released.
    pub async fn connect_addr(&self, addr: SocketAddr, expected_peer: Option<PeerId>) -> Result<()> {
        let mut machine = SessionMachine::inviter();
        if let Some(peer) = expected_peer {
            machine.set_expected_peer(peer);
        }
        let conn = self.install(addr, machine, None).await.ok_or(Error::Busy)?;
        info!(%addr, "connecting");
        let stream = match tokio::time::timeout(self.inner.handshake_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                self.finish(&conn, EndReason::Io(e.to_string())).await;
                return Err(e.into());
            }
            Err(_) => {
                self.finish(&conn, EndReason::Io("connect timed out".into())).await;
                return Err(Error::TimedOut);
            }
        };
        let (read, write) = stream.into_split();
        let invite = match self.prepare_invite(&conn, write).await {
            Ok(m) => m,
            Err(e) => {
                self.finish(&conn, EndReason::Io(e.to_string())).await;
                return Err(e);
            }
        };
        self.write_frame(&conn, &invite).await?;
        let engine = self.clone();
        tokio::spawn(async move { engine.read_loop(conn, FrameReader::new(read)).await });
        Ok(())
    }

    async fn prepare_invite(&self, conn: &Connection, write: OwnedWriteHalf) -> Result<WireMessage> {
        let mut machine = conn.machine.lock().await;
        if machine.is_closed() {
            return Err(Error::NotConnected);
        }
        *conn.writer.lock().await = Some(write);
        let invite = machine.invite(self.inner.self_id.clone(), self.inner.self_name.clone())?;
        self.emit_state(machine.state().clone());
        Ok(invite)
    }

    /// Answer the pending invite. Rejecting closes the connection after the answer is written.
    pub async fn respond_to_invite(&self, accept: bool) -> Result<()> {
        let conn = self.live().await?;
        let response = {
            let mut machine = conn.machine.lock().await;
            let response = machine.respond_to_invite(accept)?;
            if accept {
                self.emit_state(machine.state().clone());
            }
            response
        };
        self.write_frame(&conn, &response).await?;
        if !accept {
            self.finish(&conn, EndReason::Rejected).await;
        }
        Ok(())
    }

    /// Write one frame. Chat and transfer frames need an active session. A write failure ends it.
    pub async fn send(&self, msg: &WireMessage) -> Result<()> {
        let conn = self.live().await?;
        conn.machine.lock().await.check_outbound(msg)?;
        self.write_frame(&conn, msg).await
    }

    /// Best-effort `EndSession`, then release the socket. Idempotent.
    pub async fn close(&self) {
        let Some(conn) = self.inner.current.lock().await.clone() else {
            return;
        };
        let open = !conn.machine.lock().await.is_closed();
        if open {
            if let Ok(frame) = encode_frame(&WireMessage::EndSession) {
                let _ = tokio::time::timeout(END_SESSION_GRACE, write_raw(&conn, &frame)).await;
            }
        }
        self.finish(&conn, EndReason::LocalClose).await;
    }

    async fn live(&self) -> Result<Arc<Connection>> {
        self.inner
            .current
            .lock()
            .await
            .clone()
            .ok_or(Error::NotConnected)
    }

    /// Claim the connection slot. `None` if another connection holds it.
    async fn install(
        &self,
        peer_addr: SocketAddr,
        machine: SessionMachine,
        writer: Option<OwnedWriteHalf>,
    ) -> Option<Arc<Connection>> {
        let mut slot = self.inner.current.lock().await;
        if slot.is_some() {
            return None;
        }
        let (shutdown, _) = watch::channel(false);
        let state = machine.state().clone();
        let conn = Arc::new(Connection {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            machine: Mutex::new(machine),
            writer: Mutex::new(writer),
            shutdown,
        });
        *slot = Some(conn.clone());
        self.emit_state(state);
        Some(conn)
    }

    async fn write_frame(&self, conn: &Arc<Connection>, msg: &WireMessage) -> Result<()> {
        let frame = encode_frame(msg)?;
        if let Err(e) = write_raw(conn, &frame).await {
            self.finish(conn, EndReason::Io(e.to_string())).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn handle_inbound(self, stream: TcpStream, from: SocketAddr, on_invite: InviteCallback) {
        if self.inner.current.lock().await.is_some() {
            info!(%from, "session busy, refusing connection");
            return;
        }
        let (read, write) = stream.into_split();
        let mut reader = FrameReader::new(read);
        let first = match tokio::time::timeout(self.inner.handshake_timeout, reader.next_frame()).await {
            Ok(Ok(Some(msg))) => msg,
            Ok(Ok(None)) => {
                debug!(%from, "closed before invite");
                return;
            }
            Ok(Err(e)) => {
                info!(%from, "dropping connection: {}", e);
                return;
            }
            Err(_) => {
                info!(%from, "dropping connection: no invite within handshake timeout");
                return;
            }
        };
        let mut machine = SessionMachine::invitee();
        let (peer_id, peer_name) = match machine.on_frame(first) {
            Ok(Inbound::Invite { peer_id, peer_name }) => (peer_id, peer_name),
            Ok(other) => {
                info!(%from, "dropping connection: expected invite, got {:?}", other);
                return;
            }
            Err(e) => {
                info!(%from, "dropping connection: {}", e);
                return;
            }
        };
        let Some(conn) = self.install(from, machine, Some(write)).await else {
            info!(%from, peer = %peer_id, "session busy, refusing invite");
            return;
        };
        info!(%from, peer = %peer_id, "invitation from {}", peer_name);
        on_invite(&peer_id, &peer_name);
        self.read_loop(conn, reader).await;
    }

    async fn read_loop(self, conn: Arc<Connection>, mut reader: FrameReader<OwnedReadHalf>) {
        let mut shutdown = conn.shutdown.subscribe();
        let reason = loop {
            let next = tokio::select! {
                _ = closed(&mut shutdown) => return,
                next = reader.next_frame() => next,
            };
            let msg = match next {
                Ok(Some(msg)) => msg,
                Ok(None) => break EndReason::PeerDisconnected,
                Err(Error::Decode(e)) => break EndReason::ProtocolViolation(e.to_string()),
                Err(e) => break EndReason::Io(e.to_string()),
            };
            let credit = if self.inner.metered.load(Ordering::Acquire) {
                tokio::select! {
                    _ = closed(&mut shutdown) => return,
                    credit = self.inner.credits.acquire() => credit.ok(),
                }
            } else {
                None
            };
            if let Some(reason) = self.on_frame(&conn, msg, credit).await {
                break reason;
            }
        };
        self.finish(&conn, reason).await;
    }

    /// Apply one inbound frame. Returns the end reason if the connection must close.
    /// A delivered frame keeps `credit` until the event consumer receives it.
    async fn on_frame(
        &self,
        conn: &Connection,
        msg: WireMessage,
        credit: Option<SemaphorePermit<'_>>,
    ) -> Option<EndReason> {
        let mut machine = conn.machine.lock().await;
        match machine.on_frame(msg) {
            Ok(Inbound::Deliver(msg)) => {
                if let Some(credit) = credit {
                    credit.forget();
                }
                let _ = self.inner.events_tx.send(EngineEvent::Message(msg.clone()));
                let _ = self.inner.messages_tx.send(msg);
                None
            }
            Ok(Inbound::Accepted) => {
                self.emit_state(machine.state().clone());
                None
            }
            Ok(Inbound::Rejected) => Some(EndReason::Rejected),
            Ok(Inbound::Ended) => Some(EndReason::RemoteEnded),
            Ok(Inbound::Invite { .. }) => {
                Some(EndReason::ProtocolViolation("unexpected invite".into()))
            }
            Err(e) => Some(EndReason::ProtocolViolation(e.to_string())),
        }
    }

    /// Tear down `conn` once: publish `Closed`, stop its loops, release the socket and the slot.
    async fn finish(&self, conn: &Arc<Connection>, reason: EndReason) {
        {
            let mut machine = conn.machine.lock().await;
            if !machine.close(reason.clone()) {
                return;
            }
            self.emit_state(ConnectionState::Closed(reason.clone()));
        }
        conn.shutdown.send_replace(true);
        if let Some(mut w) = conn.writer.lock().await.take() {
            let _ = w.shutdown().await;
        }
        let mut slot = self.inner.current.lock().await;
        if slot.as_ref().is_some_and(|c| c.id == conn.id) {
            *slot = None;
        }
        info!(peer = %conn.peer_addr, "session ended: {}", reason);
    }

    fn emit_state(&self, state: ConnectionState) {
        debug!(?state, "connection state");
        self.inner.state_tx.send_replace(state.clone());
        let _ = self.inner.events_tx.send(EngineEvent::State(state));
    }
}

/// Write and flush one encoded frame. Holding the writer lock keeps frames from interleaving.
async fn write_raw(conn: &Connection, frame: &[u8]) -> std::io::Result<()> {
    let mut shutdown = conn.shutdown.subscribe();
    let mut writer = conn.writer.lock().await;
    let Some(w) = writer.as_mut() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "connection is closed",
        ));
    };
    tokio::select! {
        r = async {
            w.write_all(frame).await?;
            w.flush().await
        } => r,
        _ = closed(&mut shutdown) => Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "connection closed during write",
        )),
    }
}

async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

async fn accept_loop(listener: TcpListener, engine: Weak<Inner>, on_invite: InviteCallback) {
    loop {
        let (stream, from) = match listener.accept().await {
            Ok(a) => a,
            Err(e) => {
                warn!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let Some(inner) = engine.upgrade() else {
            return;
        };
        let engine = SessionEngine { inner };
        let on_invite = on_invite.clone();
        tokio::spawn(engine.handle_inbound(stream, from, on_invite));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanchat_core::SessionError;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncWriteExt;

    const WAIT: Duration = Duration::from_secs(5);

    fn engine(id: &str) -> SessionEngine {
        SessionEngine::new(PeerId::new(id), id.to_uppercase(), Duration::from_secs(2))
    }

    async fn listening(
        id: &str,
    ) -> (SessionEngine, SocketAddr, mpsc::UnboundedReceiver<(PeerId, String)>) {
        let e = engine(id);
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = e
            .listen(
                SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
                Arc::new(move |id: &PeerId, name: &str| {
                    let _ = tx.send((id.clone(), name.to_string()));
                }),
            )
            .await
            .unwrap();
        (e, addr, rx)
    }

    async fn wait_state(
        engine: &SessionEngine,
        pred: impl FnMut(&ConnectionState) -> bool,
    ) -> ConnectionState {
        let mut rx = engine.subscribe_state();
        let state = tokio::time::timeout(WAIT, rx.wait_for(pred))
            .await
            .expect("timed out waiting for state")
            .expect("engine dropped");
        state.clone()
    }

    /// Connected pair with the handshake done: (inviter, invitee).
    async fn active_pair() -> (SessionEngine, SessionEngine) {
        let (b, addr, mut invites) = listening("bob").await;
        let a = engine("alice");
        a.connect_addr(addr, Some(PeerId::new("bob"))).await.unwrap();
        tokio::time::timeout(WAIT, invites.recv()).await.unwrap().unwrap();
        b.respond_to_invite(true).await.unwrap();
        wait_state(&a, |s| s.is_active()).await;
        (a, b)
    }

    /// Raw socket that has sent an invite to `addr`.
    async fn raw_inviter(addr: SocketAddr) -> TcpStream {
        let mut s = TcpStream::connect(addr).await.unwrap();
        let invite = encode_frame(&WireMessage::InviteRequest {
            peer_id: PeerId::new("raw"),
            peer_name: "Raw".into(),
        })
        .unwrap();
        s.write_all(&invite).await.unwrap();
        s
    }

    async fn read_to_eof(s: &mut TcpStream) -> Vec<u8> {
        let mut out = Vec::new();
        tokio::time::timeout(WAIT, s.read_to_end(&mut out))
            .await
            .expect("socket was not closed")
            .unwrap_or_default();
        out
    }

    #[tokio::test]
    async fn invite_accept_then_chat() {
        let (b, addr, mut invites) = listening("bob").await;
        let a = engine("alice");
        a.connect_addr(addr, Some(PeerId::new("bob"))).await.unwrap();
        let (id, name) = tokio::time::timeout(WAIT, invites.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, PeerId::new("alice"));
        assert_eq!(name, "ALICE");
        assert!(matches!(
            b.state(),
            ConnectionState::HandshakeReceived { .. }
        ));

        let mut b_msgs = b.subscribe_messages();
        b.respond_to_invite(true).await.unwrap();
        assert_eq!(
            wait_state(&a, |s| s.is_active()).await,
            ConnectionState::Active {
                peer_id: Some(PeerId::new("bob"))
            }
        );
        assert_eq!(
            b.state(),
            ConnectionState::Active {
                peer_id: Some(PeerId::new("alice"))
            }
        );

        a.send(&WireMessage::Chat("hello".into())).await.unwrap();
        let got = tokio::time::timeout(WAIT, b_msgs.recv()).await.unwrap().unwrap();
        assert_eq!(got, WireMessage::Chat("hello".into()));
    }

    #[tokio::test]
    async fn rejected_invite_closes_both_sides() {
        let (b, addr, mut invites) = listening("bob").await;
        let a = engine("alice");
        a.connect_addr(addr, None).await.unwrap();
        tokio::time::timeout(WAIT, invites.recv()).await.unwrap().unwrap();
        b.respond_to_invite(false).await.unwrap();
        assert_eq!(
            wait_state(&a, |s| s.is_closed()).await,
            ConnectionState::Closed(EndReason::Rejected)
        );
        assert_eq!(b.state(), ConnectionState::Closed(EndReason::Rejected));
        assert!(a.send(&WireMessage::Chat("x".into())).await.is_err());
    }

    #[tokio::test]
    async fn chat_before_handshake_is_refused_locally() {
        let (_b, addr, _invites) = listening("bob").await;
        let a = engine("alice");
        a.connect_addr(addr, None).await.unwrap();
        assert!(matches!(
            a.send(&WireMessage::Chat("too early".into())).await,
            Err(Error::Session(SessionError::NotActive))
        ));
    }

    #[tokio::test]
    async fn connect_failure_releases_slot() {
        let probe = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let dead = probe.local_addr().unwrap();
        drop(probe);
        let a = engine("alice");
        assert!(a.connect_addr(dead, None).await.is_err());
        assert!(matches!(a.state(), ConnectionState::Closed(EndReason::Io(_))));
        let (_b, addr, mut invites) = listening("bob").await;
        a.connect_addr(addr, None).await.unwrap();
        tokio::time::timeout(WAIT, invites.recv()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn non_invite_first_frame_is_dropped() {
        let (b, addr, mut invites) = listening("bob").await;
        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(&encode_frame(&WireMessage::Chat("hi".into())).unwrap())
            .await
            .unwrap();
        assert!(read_to_eof(&mut raw).await.is_empty());
        assert_eq!(b.state(), ConnectionState::Idle);

        // The accept loop keeps going.
        let a = engine("alice");
        a.connect_addr(addr, None).await.unwrap();
        tokio::time::timeout(WAIT, invites.recv()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn silent_connection_times_out() {
        let b = SessionEngine::new(PeerId::new("bob"), "Bob", Duration::from_millis(200));
        let addr = b
            .listen(
                SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
                Arc::new(|_: &PeerId, _: &str| {}),
            )
            .await
            .unwrap();
        let mut raw = TcpStream::connect(addr).await.unwrap();
        assert!(read_to_eof(&mut raw).await.is_empty());
        assert_eq!(b.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn close_sends_end_session() {
        let (a, b) = active_pair().await;
        a.close().await;
        assert_eq!(a.state(), ConnectionState::Closed(EndReason::LocalClose));
        assert_eq!(
            wait_state(&b, |s| s.is_closed()).await,
            ConnectionState::Closed(EndReason::RemoteEnded)
        );
        a.close().await;
        assert_eq!(a.state(), ConnectionState::Closed(EndReason::LocalClose));
    }

    #[tokio::test]
    async fn abrupt_disconnect_is_reported() {
        let (b, addr, mut invites) = listening("bob").await;
        let mut raw = raw_inviter(addr).await;
        tokio::time::timeout(WAIT, invites.recv()).await.unwrap().unwrap();
        b.respond_to_invite(true).await.unwrap();
        let mut reader = FrameReader::new(&mut raw);
        assert_eq!(
            reader.next_frame().await.unwrap(),
            Some(WireMessage::InviteResponse { accepted: true })
        );
        drop(reader);
        drop(raw);
        assert_eq!(
            wait_state(&b, |s| s.is_closed()).await,
            ConnectionState::Closed(EndReason::PeerDisconnected)
        );
    }

    #[tokio::test]
    async fn unknown_opcode_is_a_protocol_violation() {
        let (b, addr, mut invites) = listening("bob").await;
        let mut raw = raw_inviter(addr).await;
        tokio::time::timeout(WAIT, invites.recv()).await.unwrap().unwrap();
        b.respond_to_invite(true).await.unwrap();
        raw.write_all(&[0xEE]).await.unwrap();
        assert!(matches!(
            wait_state(&b, |s| s.is_closed()).await,
            ConnectionState::Closed(EndReason::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn second_connection_is_refused_while_busy() {
        let (b, addr, _invites) = listening("bob").await;
        let a = engine("alice");
        a.connect_addr(addr, None).await.unwrap();
        wait_state(&b, |s| matches!(s, ConnectionState::HandshakeReceived { .. })).await;
        let mut raw = raw_inviter(addr).await;
        assert!(read_to_eof(&mut raw).await.is_empty());
        assert!(matches!(
            b.state(),
            ConnectionState::HandshakeReceived { .. }
        ));
        assert!(matches!(a.connect_addr(addr, None).await, Err(Error::Busy)));
    }

    #[tokio::test]
    async fn events_are_ordered() {
        let (b, addr, mut invites) = listening("bob").await;
        let mut events = b.take_events().unwrap();
        assert!(b.take_events().is_none());
        let a = engine("alice");
        a.connect_addr(addr, None).await.unwrap();
        tokio::time::timeout(WAIT, invites.recv()).await.unwrap().unwrap();
        b.respond_to_invite(true).await.unwrap();
        wait_state(&a, |s| s.is_active()).await;
        a.send(&WireMessage::Chat("one".into())).await.unwrap();
        a.send(&WireMessage::Chat("two".into())).await.unwrap();

        let mut seen = Vec::new();
        while seen.len() < 4 {
            seen.push(tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap());
        }
        assert!(matches!(
            seen[0],
            EngineEvent::State(ConnectionState::HandshakeReceived { .. })
        ));
        assert!(matches!(seen[1], EngineEvent::State(ConnectionState::Active { .. })));
        assert_eq!(seen[2], EngineEvent::Message(WireMessage::Chat("one".into())));
        assert_eq!(seen[3], EngineEvent::Message(WireMessage::Chat("two".into())));
    }

    #[tokio::test]
    async fn slow_consumer_stalls_reads() {
        let (b, addr, mut invites) = listening("bob").await;
        let mut events = b.take_events().unwrap();
        let mut frames = b.subscribe_messages();
        let a = engine("alice");
        a.connect_addr(addr, None).await.unwrap();
        tokio::time::timeout(WAIT, invites.recv()).await.unwrap().unwrap();
        b.respond_to_invite(true).await.unwrap();
        wait_state(&a, |s| s.is_active()).await;

        let total = EVENT_BACKLOG + 8;
        for i in 0..total {
            a.send(&WireMessage::Chat(i.to_string())).await.unwrap();
        }
        // The read loop delivers exactly the backlog, then waits for the consumer.
        for _ in 0..EVENT_BACKLOG {
            tokio::time::timeout(WAIT, frames.recv()).await.unwrap().unwrap();
        }
        assert!(tokio::time::timeout(Duration::from_millis(200), frames.recv())
            .await
            .is_err());

        let mut chats = 0;
        while chats < total {
            if let EngineEvent::Message(_) = tokio::time::timeout(WAIT, events.recv())
                .await
                .unwrap()
                .unwrap()
            {
                chats += 1;
            }
        }
        assert!(b.state().is_active());
    }

    #[tokio::test]
    async fn frame_reader_handles_split_frames() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut bytes = encode_frame(&WireMessage::Chat("split me".into())).unwrap();
        bytes.extend(encode_frame(&WireMessage::TransferChunk(vec![7; 100])).unwrap());
        tokio::spawn(async move {
            for piece in bytes.chunks(3) {
                tx.write_all(piece).await.unwrap();
            }
        });
        let mut reader = FrameReader::new(rx);
        assert_eq!(
            reader.next_frame().await.unwrap(),
            Some(WireMessage::Chat("split me".into()))
        );
        assert_eq!(
            reader.next_frame().await.unwrap(),
            Some(WireMessage::TransferChunk(vec![7; 100]))
        );
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn frame_reader_rejects_truncated_frame() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let bytes = encode_frame(&WireMessage::Chat("cut".into())).unwrap();
        tx.write_all(&bytes[..4]).await.unwrap();
        drop(tx);
        let mut reader = FrameReader::new(rx);
        assert!(matches!(reader.next_frame().await, Err(Error::Io(_))));
    }
}
