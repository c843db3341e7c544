//! ChatService: the collaborator-facing API. Owns discovery, the session engine, the peer
//! directory and the transfer machine, and publishes chat, invite and transfer state.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lanchat_core::{
    Action, ChatCore, ChatState, ConnectionState, Direction, InviteState, PeerDirectory, PeerId,
    PeerRecord, TransferError, TransferState, WireMessage,
};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::blob::{BlobSink, BlobSource};
use crate::config::Config;
use crate::discovery::{DiscoveryService, ServeStatus};
use crate::error::{Error, Result};
use crate::transport::{EngineEvent, EngineEvents, InviteCallback, SessionEngine};

/// How long a sender waits for `TransferAck` after its stream ended.
const ACK_TIMEOUT: Duration = Duration::from_secs(30);
const INCOMING_BACKLOG: usize = 256;
const COMPLETION_BACKLOG: usize = 16;

/// A transfer that reached `Completed`. Published once per attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub name: String,
    pub size: u64,
    pub direction: Direction,
    /// Temporary blob on the receiving side, to be moved by the application.
    pub location: Option<PathBuf>,
    pub sha256: [u8; 32],
}

/// Internal notifications from streamer and timer tasks to the pump.
enum Control {
    StreamDone {
        attempt: u64,
        result: std::result::Result<(), String>,
    },
    AckTimeout {
        attempt: u64,
    },
}

enum Input {
    Engine(EngineEvent),
    Control(Control),
}

struct Controller {
    core: ChatCore,
    outgoing: Option<BlobSource>,
    sink: Option<BlobSink>,
}

struct Shared {
    self_id: PeerId,
    session_port: u16,
    chunk_size: usize,
    discovery_timeout: Duration,
    temp_dir: PathBuf,
    directory: Arc<Mutex<PeerDirectory>>,
    discovery: DiscoveryService,
    engine: SessionEngine,
    state: Mutex<Controller>,
    chat_tx: watch::Sender<ChatState>,
    invite_tx: watch::Sender<InviteState>,
    transfer_tx: watch::Sender<TransferState>,
    incoming_tx: broadcast::Sender<String>,
    completed_tx: broadcast::Sender<Completion>,
    control_tx: mpsc::UnboundedSender<Control>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Ok(mut g) = self.pump.lock() {
            if let Some(task) = g.take() {
                task.abort();
            }
        }
    }
}

/// Explicitly owned chat service. Cheap to clone. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct ChatService {
    inner: Arc<Shared>,
}

impl ChatService {
    pub fn new(self_id: PeerId, config: &Config) -> Self {
        let directory = Arc::new(Mutex::new(PeerDirectory::new()));
        let discovery =
            DiscoveryService::new(self_id.clone(), config.display_name.clone(), directory.clone())
                .with_port(config.discovery_port)
                .with_broadcast(config.broadcast_address);
        let engine = SessionEngine::new(
            self_id.clone(),
            config.display_name.clone(),
            config.handshake_timeout(),
        );
        let events = engine.take_events();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (incoming_tx, _) = broadcast::channel(INCOMING_BACKLOG);
        let (completed_tx, _) = broadcast::channel(COMPLETION_BACKLOG);
        let inner = Arc::new(Shared {
            self_id,
            session_port: config.session_port,
            chunk_size: config.chunk_size,
            discovery_timeout: config.discovery_timeout(),
            temp_dir: config.temp_dir.clone(),
            directory,
            discovery,
            engine,
            state: Mutex::new(Controller {
                core: ChatCore::new(),
                outgoing: None,
                sink: None,
            }),
            chat_tx: watch::Sender::new(ChatState::Inactive),
            invite_tx: watch::Sender::new(InviteState::None),
            transfer_tx: watch::Sender::new(TransferState::Idle),
            incoming_tx,
            completed_tx,
            control_tx,
            pump: std::sync::Mutex::new(None),
        });
        if let Some(events) = events {
            let task = tokio::spawn(pump(Arc::downgrade(&inner), events, control_rx));
            if let Ok(mut g) = inner.pump.lock() {
                *g = Some(task);
            }
        }
        Self { inner }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.inner.self_id
    }

    // ---- discovery ----

    /// One discovery round over the configured window. Found peers also land in the directory.
    pub async fn discover(&self) -> Result<Vec<PeerRecord>> {
        Ok(self.inner.discovery.discover(self.inner.discovery_timeout).await?)
    }

    pub fn serve(&self) -> ServeStatus {
        self.inner.discovery.serve()
    }

    pub fn stop_serving(&self) {
        self.inner.discovery.stop();
    }

    /// Last-known peers.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.inner.directory.lock().await.records()
    }

    // ---- session ----

    /// Accept invitations on the session port. Returns the bound address.
    pub async fn listen(&self, on_invite: InviteCallback) -> Result<SocketAddr> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.inner.session_port);
        self.inner.engine.listen(addr, on_invite).await
    }

    /// Invite a discovered peer.
    pub async fn connect(&self, peer_id: &PeerId) -> Result<()> {
        let ip = self
            .inner
            .directory
            .lock()
            .await
            .ip_of(peer_id)
            .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))?;
        let addr = SocketAddr::new(ip, self.inner.session_port);
        self.connect_addr(addr, Some(peer_id.clone())).await
    }

    /// Invite whoever listens on `ip` at the session port.
    pub async fn connect_ip(&self, ip: IpAddr) -> Result<()> {
        self.connect_addr(SocketAddr::new(ip, self.inner.session_port), None)
            .await
    }

    pub async fn connect_addr(&self, addr: SocketAddr, peer_id: Option<PeerId>) -> Result<()> {
        if !matches!(
            self.inner.engine.state(),
            ConnectionState::Idle | ConnectionState::Closed(_)
        ) {
            return Err(Error::Busy);
        }
        {
            let mut ctl = self.inner.state.lock().await;
            ctl.core.on_invite_sent(peer_id.clone(), addr);
            self.publish(&ctl);
        }
        if let Err(e) = self.inner.engine.connect_addr(addr, peer_id).await {
            let mut ctl = self.inner.state.lock().await;
            ctl.core.on_invite_failed(e.to_string());
            self.publish(&ctl);
            return Err(e);
        }
        Ok(())
    }

    pub async fn respond_to_invite(&self, accept: bool) -> Result<()> {
        self.inner.engine.respond_to_invite(accept).await?;
        let mut ctl = self.inner.state.lock().await;
        ctl.core.on_invite_answered();
        self.publish(&ctl);
        Ok(())
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.inner.engine.send(&WireMessage::Chat(text.into())).await
    }

    pub async fn end_session(&self) {
        self.inner.engine.close().await;
    }

    /// Logout: end the session, stop answering discovery, forget peers and any transfer.
    pub async fn reset(&self) {
        self.inner.engine.close().await;
        self.inner.discovery.stop();
        self.inner.directory.lock().await.clear();
        let mut ctl = self.inner.state.lock().await;
        ctl.outgoing = None;
        let actions = ctl.core.reset();
        self.execute(&mut ctl, actions).await;
        info!("reset");
    }

    // ---- transfer ----

    /// Pick a file to offer. Needs an active session; waits for `confirm_transfer`.
    pub async fn select_file(&self, path: impl AsRef<Path>) -> Result<(String, u64)> {
        let source = BlobSource::open(path).await?;
        let mut ctl = self.inner.state.lock().await;
        if !matches!(ctl.core.chat_state(), ChatState::Active { .. }) {
            return Err(Error::NotConnected);
        }
        ctl.core
            .transfer_mut()
            .select(source.name(), source.size())?;
        let picked = (source.name().to_string(), source.size());
        ctl.outgoing = Some(source);
        self.publish(&ctl);
        Ok(picked)
    }

    pub async fn confirm_transfer(&self) -> Result<()> {
        let mut ctl = self.inner.state.lock().await;
        let actions = ctl.core.transfer_mut().confirm()?;
        self.execute(&mut ctl, actions).await;
        Ok(())
    }

    /// Select and confirm in one step.
    pub async fn request_transfer(&self, path: impl AsRef<Path>) -> Result<()> {
        self.select_file(path).await?;
        self.confirm_transfer().await
    }

    /// Cancel before streaming starts, or decline a pending offer.
    pub async fn cancel_transfer(&self) -> Result<()> {
        let mut ctl = self.inner.state.lock().await;
        let actions = ctl.core.transfer_mut().cancel()?;
        ctl.outgoing = None;
        self.execute(&mut ctl, actions).await;
        Ok(())
    }

    /// Answer a pending offer. Accepting opens the temporary sink before saying yes.
    pub async fn respond_to_transfer(&self, accept: bool) -> Result<()> {
        let mut ctl = self.inner.state.lock().await;
        if !accept {
            let actions = ctl.core.transfer_mut().reject()?;
            self.execute(&mut ctl, actions).await;
            return Ok(());
        }
        if !matches!(ctl.core.transfer_state(), TransferState::ReceivingRequest { .. }) {
            return Err(TransferError::NoPendingRequest.into());
        }
        match BlobSink::create(&self.inner.temp_dir).await {
            Ok(sink) => {
                let actions = ctl.core.transfer_mut().accept(sink.path().to_path_buf())?;
                ctl.sink = Some(sink);
                self.execute(&mut ctl, actions).await;
                Ok(())
            }
            Err(e) => {
                let actions = ctl
                    .core
                    .transfer_mut()
                    .abort_request(format!("cannot open receive file: {}", e))?;
                self.execute(&mut ctl, actions).await;
                Err(e.into())
            }
        }
    }

    // ---- observable state ----

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.engine.state()
    }

    pub fn chat_state(&self) -> ChatState {
        self.inner.chat_tx.borrow().clone()
    }

    pub fn invite_state(&self) -> InviteState {
        self.inner.invite_tx.borrow().clone()
    }

    pub fn transfer_state(&self) -> TransferState {
        self.inner.transfer_tx.borrow().clone()
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.engine.subscribe_state()
    }

    pub fn subscribe_chat_state(&self) -> watch::Receiver<ChatState> {
        self.inner.chat_tx.subscribe()
    }

    pub fn subscribe_invite_state(&self) -> watch::Receiver<InviteState> {
        self.inner.invite_tx.subscribe()
    }

    pub fn subscribe_transfer_state(&self) -> watch::Receiver<TransferState> {
        self.inner.transfer_tx.subscribe()
    }

    /// Incoming chat text.
    pub fn subscribe_incoming(&self) -> broadcast::Receiver<String> {
        self.inner.incoming_tx.subscribe()
    }

    /// Finished transfers. Unlike the transfer state, a completion is never overwritten by
    /// the next offer, so receivers should persist blobs from here.
    pub fn subscribe_completions(&self) -> broadcast::Receiver<Completion> {
        self.inner.completed_tx.subscribe()
    }

    /// Every frame delivered after the handshake, chat and transfer alike.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<WireMessage> {
        self.inner.engine.subscribe_messages()
    }

    // ---- internals ----

    async fn handle(&self, input: Input) {
        let mut ctl = self.inner.state.lock().await;
        let actions = match input {
            Input::Engine(EngineEvent::State(state)) => ctl.core.on_connection_state(&state),
            Input::Engine(EngineEvent::Message(msg)) => ctl.core.on_message(msg),
            Input::Control(Control::StreamDone { attempt, result }) => match result {
                Ok(()) => match ctl.core.transfer_mut().finish_stream(attempt) {
                    Ok(actions) => {
                        self.arm_ack_timeout(attempt);
                        actions
                    }
                    Err(TransferError::NotSending) => Vec::new(),
                    Err(e) => ctl.core.transfer_mut().fail_attempt(attempt, e.to_string()),
                },
                Err(message) => ctl.core.transfer_mut().fail_attempt(attempt, message),
            },
            Input::Control(Control::AckTimeout { attempt }) => {
                let waiting = attempt == ctl.core.transfer().attempt()
                    && matches!(ctl.core.transfer_state(), TransferState::Sending { .. });
                if waiting {
                    ctl.core
                        .transfer_mut()
                        .fail_attempt(attempt, "peer did not acknowledge the transfer")
                } else {
                    Vec::new()
                }
            }
        };
        self.execute(&mut ctl, actions).await;
    }

    /// Run actions in order; failures feed follow-up actions back into the queue.
    async fn execute(&self, ctl: &mut Controller, actions: Vec<Action>) {
        let mut queue: std::collections::VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Send(msg) => {
                    if let Err(e) = self.inner.engine.send(&msg).await {
                        warn!("sending {} failed: {}", msg.kind(), e);
                    }
                }
                Action::StartStreaming {
                    attempt,
                    name,
                    size,
                } => match ctl.outgoing.clone() {
                    Some(source) if source.name() == name && source.size() == size => {
                        info!(%name, size, "streaming");
                        let svc = self.clone();
                        tokio::spawn(async move { svc.stream_blob(attempt, source).await });
                    }
                    _ => queue.extend(
                        ctl.core
                            .transfer_mut()
                            .fail_attempt(attempt, "selected file is no longer available"),
                    ),
                },
                Action::WriteChunk(data) => {
                    let written = match ctl.sink.as_mut() {
                        Some(sink) => sink.write(&data).await,
                        None => Err(std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "receive file is not open",
                        )),
                    };
                    if let Err(e) = written {
                        queue.extend(
                            ctl.core
                                .transfer_mut()
                                .fail(format!("writing received data failed: {}", e)),
                        );
                    }
                }
                Action::FinalizeSink => {
                    let Some(sink) = ctl.sink.take() else {
                        continue;
                    };
                    let path = sink.path().to_path_buf();
                    if let Err(e) = sink.finalize().await {
                        let _ = tokio::fs::remove_file(&path).await;
                        // No ack for a blob we failed to keep.
                        queue.retain(|a| {
                            !matches!(a, Action::Send(WireMessage::TransferAck { .. }))
                        });
                        queue.extend(
                            ctl.core
                                .transfer_mut()
                                .fail(format!("saving received file failed: {}", e)),
                        );
                    }
                }
                Action::DiscardSink => {
                    if let Some(sink) = ctl.sink.take() {
                        if let Err(e) = sink.discard().await {
                            warn!("removing partial file failed: {}", e);
                        }
                    }
                }
                Action::DeliverChat(text) => {
                    let _ = self.inner.incoming_tx.send(text);
                }
            }
        }
        self.publish(ctl);
    }

    async fn stream_blob(self, attempt: u64, source: BlobSource) {
        let result = self.stream_chunks(attempt, &source).await;
        if let Err(e) = &result {
            debug!(attempt, "stream stopped: {}", e);
        }
        let _ = self.inner.control_tx.send(Control::StreamDone {
            attempt,
            result: result.map_err(|e| e.to_string()),
        });
    }

    async fn stream_chunks(&self, attempt: u64, source: &BlobSource) -> Result<()> {
        let mut reader = source.reader(self.inner.chunk_size).await?;
        while let Some(chunk) = reader.next_chunk().await? {
            let msg = WireMessage::TransferChunk(chunk);
            self.inner.engine.send(&msg).await?;
            let mut ctl = self.inner.state.lock().await;
            ctl.core
                .transfer_mut()
                .on_chunk_sent(attempt, msg.chunk_data().unwrap_or_default())?;
            self.publish(&ctl);
        }
        Ok(())
    }

    fn arm_ack_timeout(&self, attempt: u64) {
        let tx = self.inner.control_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ACK_TIMEOUT).await;
            let _ = tx.send(Control::AckTimeout { attempt });
        });
    }

    fn publish(&self, ctl: &Controller) {
        let core = &ctl.core;
        self.inner
            .chat_tx
            .send_if_modified(|v| replace_if_changed(v, core.chat_state()));
        self.inner
            .invite_tx
            .send_if_modified(|v| replace_if_changed(v, core.invite_state()));
        let changed = self
            .inner
            .transfer_tx
            .send_if_modified(|v| replace_if_changed(v, core.transfer_state()));
        if changed {
            match core.transfer_state() {
                TransferState::Completed {
                    name,
                    size,
                    direction,
                    location,
                    sha256,
                } => {
                    info!(%name, size, "transfer completed");
                    let _ = self.inner.completed_tx.send(Completion {
                        name: name.clone(),
                        size: *size,
                        direction: *direction,
                        location: location.clone(),
                        sha256: *sha256,
                    });
                }
                TransferState::Error { message } => warn!("transfer failed: {}", message),
                _ => {}
            }
        }
    }
}

fn replace_if_changed<T: PartialEq + Clone>(slot: &mut T, new: &T) -> bool {
    if slot == new {
        return false;
    }
    *slot = new.clone();
    true
}

async fn pump(
    shared: Weak<Shared>,
    mut events: EngineEvents,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    loop {
        let input = tokio::select! {
            Some(e) = events.recv() => Input::Engine(e),
            Some(c) = control.recv() => Input::Control(c),
            else => return,
        };
        let Some(inner) = shared.upgrade() else {
            return;
        };
        ChatService { inner }.handle(input).await;
    }
}
