//! File transfer sub-protocol: size negotiation, chunked streaming, progress, completion ack.
//!
//! Sender: `Idle -> AwaitingLocalConfirmation -> WaitingForRemoteAcceptance -> Sending -> Completed`.
//! Receiver: `Idle -> ReceivingRequest -> Receiving -> Completed`.
//! Any attempt may end in `Error`. At most one attempt exists at a time.
//!
//! Mid-stream abort has no opcode. A sender that fails while streaming ends the stream early
//! with the zero-length terminator, which the receiver reports as a size mismatch.

use std::path::PathBuf;

use crate::chunk;
use crate::core::Action;
use crate::integrity::BlobDigest;
use crate::protocol::WireMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Observable transfer state. `progress` is bytes transferred / declared size, in [0, 1].
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TransferState {
    #[default]
    Idle,
    AwaitingLocalConfirmation {
        name: String,
        size: u64,
    },
    WaitingForRemoteAcceptance {
        name: String,
        size: u64,
    },
    Sending {
        name: String,
        size: u64,
        sent: u64,
        progress: f32,
    },
    ReceivingRequest {
        name: String,
        size: u64,
    },
    Receiving {
        name: String,
        size: u64,
        received: u64,
        progress: f32,
    },
    Completed {
        name: String,
        size: u64,
        direction: Direction,
        /// Temporary blob location on the receiving side; the application moves it.
        location: Option<PathBuf>,
        sha256: [u8; 32],
    },
    Error {
        message: String,
    },
}

impl TransferState {
    pub fn progress(&self) -> f32 {
        match self {
            TransferState::Sending { progress, .. } | TransferState::Receiving { progress, .. } => {
                *progress
            }
            TransferState::Completed { .. } => 1.0,
            _ => 0.0,
        }
    }

    /// Anything but `Idle`, `Completed` and `Error` blocks a new attempt.
    pub fn is_in_progress(&self) -> bool {
        !matches!(
            self,
            TransferState::Idle | TransferState::Completed { .. } | TransferState::Error { .. }
        )
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            TransferState::AwaitingLocalConfirmation { name, .. }
            | TransferState::WaitingForRemoteAcceptance { name, .. }
            | TransferState::Sending { name, .. }
            | TransferState::ReceivingRequest { name, .. }
            | TransferState::Receiving { name, .. }
            | TransferState::Completed { name, .. } => Some(name),
            TransferState::Idle | TransferState::Error { .. } => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("another transfer is in progress")]
    Busy,
    #[error("no transfer is awaiting confirmation")]
    NothingToConfirm,
    #[error("no incoming transfer request is pending")]
    NoPendingRequest,
    #[error("transfer can no longer be cancelled")]
    NotCancellable,
    #[error("no outgoing stream for this attempt")]
    NotSending,
    #[error("size mismatch: declared {expected} bytes, streamed {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

pub struct TransferMachine {
    state: TransferState,
    /// Bumped per attempt so stale streamers can be told apart.
    attempt: u64,
    digest: BlobDigest,
    stream_ended: bool,
    sink: Option<PathBuf>,
    /// Offer cancelled locally after `TransferRequest` went out.
    withdrawn: Option<(String, u64)>,
}

impl Default for TransferMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferMachine {
    pub fn new() -> Self {
        Self {
            state: TransferState::Idle,
            attempt: 0,
            digest: BlobDigest::new(),
            stream_ended: false,
            sink: None,
            withdrawn: None,
        }
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    fn begin(&mut self, state: TransferState) {
        self.attempt += 1;
        self.digest = BlobDigest::new();
        self.stream_ended = false;
        self.sink = None;
        self.state = state;
    }

    // ---- sender ----

    /// A blob was picked locally; wait for the user to confirm sending it.
    /// Refused while a withdrawn offer still awaits the peer's answer.
    pub fn select(&mut self, name: impl Into<String>, size: u64) -> Result<(), TransferError> {
        if self.state.is_in_progress() || self.withdrawn.is_some() {
            return Err(TransferError::Busy);
        }
        self.begin(TransferState::AwaitingLocalConfirmation {
            name: name.into(),
            size,
        });
        Ok(())
    }

    /// Local confirmation: offer the blob to the peer.
    pub fn confirm(&mut self) -> Result<Vec<Action>, TransferError> {
        let TransferState::AwaitingLocalConfirmation { name, size } = &self.state else {
            return Err(TransferError::NothingToConfirm);
        };
        let (name, size) = (name.clone(), *size);
        self.state = TransferState::WaitingForRemoteAcceptance {
            name: name.clone(),
            size,
        };
        Ok(vec![Action::Send(WireMessage::TransferRequest { name, size })])
    }

    /// Local cancel before streaming starts. On the receiving side this declines the offer.
    pub fn cancel(&mut self) -> Result<Vec<Action>, TransferError> {
        match &self.state {
            TransferState::AwaitingLocalConfirmation { .. } => {
                self.state = TransferState::Idle;
                Ok(Vec::new())
            }
            TransferState::WaitingForRemoteAcceptance { name, size } => {
                self.withdrawn = Some((name.clone(), *size));
                self.state = TransferState::Idle;
                Ok(Vec::new())
            }
            TransferState::ReceivingRequest { .. } => self.reject(),
            _ => Err(TransferError::NotCancellable),
        }
    }

    fn on_response(&mut self, accepted: bool) -> Vec<Action> {
        if let TransferState::WaitingForRemoteAcceptance { name, size } = &self.state {
            let (name, size) = (name.clone(), *size);
            if !accepted {
                self.state = TransferState::Idle;
                return Vec::new();
            }
            self.state = TransferState::Sending {
                name: name.clone(),
                size,
                sent: 0,
                progress: 0.0,
            };
            return vec![Action::StartStreaming {
                attempt: self.attempt,
                name,
                size,
            }];
        }
        match self.withdrawn.take() {
            // The receiver opened a sink for an offer we withdrew: end its stream at once.
            Some((name, size)) if accepted => {
                let mut actions = vec![Action::Send(WireMessage::end_of_stream())];
                if size == 0 {
                    // An empty offer has nothing left to withdraw.
                    actions.push(Action::Send(WireMessage::TransferComplete { name }));
                }
                actions
            }
            _ => Vec::new(),
        }
    }

    /// Account for one chunk written to the socket. Returns the new progress.
    pub fn on_chunk_sent(&mut self, attempt: u64, data: &[u8]) -> Result<f32, TransferError> {
        if attempt != self.attempt || self.stream_ended {
            return Err(TransferError::NotSending);
        }
        let TransferState::Sending {
            size,
            sent,
            progress,
            ..
        } = &mut self.state
        else {
            return Err(TransferError::NotSending);
        };
        let total = *sent + data.len() as u64;
        if total > *size {
            return Err(TransferError::SizeMismatch {
                expected: *size,
                actual: total,
            });
        }
        *sent = total;
        *progress = chunk::progress(total, *size);
        self.digest.update(data);
        Ok(*progress)
    }

    /// All chunks are out: send the terminator and `TransferComplete`, then wait for the ack.
    pub fn finish_stream(&mut self, attempt: u64) -> Result<Vec<Action>, TransferError> {
        if attempt != self.attempt || self.stream_ended {
            return Err(TransferError::NotSending);
        }
        let TransferState::Sending {
            name,
            size,
            sent,
            progress,
        } = &mut self.state
        else {
            return Err(TransferError::NotSending);
        };
        if *sent != *size {
            return Err(TransferError::SizeMismatch {
                expected: *size,
                actual: *sent,
            });
        }
        *progress = 1.0;
        let name = name.clone();
        self.stream_ended = true;
        Ok(vec![
            Action::Send(WireMessage::end_of_stream()),
            Action::Send(WireMessage::TransferComplete { name }),
        ])
    }

    fn on_ack(&mut self, acked: String) {
        let TransferState::Sending { name, size, .. } = &self.state else {
            return;
        };
        if !self.stream_ended || *name != acked {
            return;
        }
        let size = *size;
        let sha256 = std::mem::take(&mut self.digest).finalize();
        self.state = TransferState::Completed {
            name: acked,
            size,
            direction: Direction::Outgoing,
            location: None,
            sha256,
        };
    }

    // ---- receiver ----

    fn on_request(&mut self, name: String, size: u64) -> Vec<Action> {
        if self.state.is_in_progress() {
            return vec![Action::Send(WireMessage::TransferResponse { accepted: false })];
        }
        self.begin(TransferState::ReceivingRequest { name, size });
        Vec::new()
    }

    /// Accept the pending offer. The host must already have opened the sink at `sink`, since
    /// the positive response doubles as the "ready to receive" signal.
    pub fn accept(&mut self, sink: PathBuf) -> Result<Vec<Action>, TransferError> {
        let TransferState::ReceivingRequest { name, size } = &self.state else {
            return Err(TransferError::NoPendingRequest);
        };
        let (name, size) = (name.clone(), *size);
        self.sink = Some(sink);
        self.state = TransferState::Receiving {
            name,
            size,
            received: 0,
            progress: 0.0,
        };
        Ok(vec![Action::Send(WireMessage::TransferResponse {
            accepted: true,
        })])
    }

    /// Decline the pending offer.
    pub fn reject(&mut self) -> Result<Vec<Action>, TransferError> {
        if !matches!(self.state, TransferState::ReceivingRequest { .. }) {
            return Err(TransferError::NoPendingRequest);
        }
        self.state = TransferState::Idle;
        Ok(vec![Action::Send(WireMessage::TransferResponse {
            accepted: false,
        })])
    }

    /// Decline the pending offer because the sink could not be prepared.
    pub fn abort_request(&mut self, message: impl Into<String>) -> Result<Vec<Action>, TransferError> {
        let actions = self.reject()?;
        self.state = TransferState::Error {
            message: message.into(),
        };
        Ok(actions)
    }

    fn on_chunk(&mut self, data: Vec<u8>) -> Vec<Action> {
        let (size, received) = match &self.state {
            TransferState::Receiving { size, received, .. } => (*size, *received),
            // Late frames of a failed or withdrawn attempt.
            _ => return Vec::new(),
        };
        if self.stream_ended {
            return self.fail("received data after end of stream");
        }
        if data.is_empty() {
            if received != size {
                return self.fail(format!(
                    "size mismatch: declared {} bytes, received {}",
                    size, received
                ));
            }
            self.stream_ended = true;
            if let TransferState::Receiving { progress, .. } = &mut self.state {
                *progress = 1.0;
            }
            return Vec::new();
        }
        let total = received + data.len() as u64;
        if total > size {
            return self.fail(format!(
                "size mismatch: declared {} bytes, received at least {}",
                size, total
            ));
        }
        self.digest.update(&data);
        if let TransferState::Receiving {
            received, progress, ..
        } = &mut self.state
        {
            *received = total;
            *progress = chunk::progress(total, size);
        }
        vec![Action::WriteChunk(data)]
    }

    fn on_complete(&mut self, completed: String) -> Vec<Action> {
        let (expected, size, received) = match &self.state {
            TransferState::Receiving {
                name,
                size,
                received,
                ..
            } => (name.clone(), *size, *received),
            _ => return Vec::new(),
        };
        if !self.stream_ended {
            return self.fail(format!(
                "{} completed before end of stream ({} of {} bytes)",
                completed, received, size
            ));
        }
        if completed != expected {
            return self.fail(format!(
                "completion for {:?} while receiving {:?}",
                completed, expected
            ));
        }
        let sha256 = std::mem::take(&mut self.digest).finalize();
        self.state = TransferState::Completed {
            name: completed.clone(),
            size,
            direction: Direction::Incoming,
            location: self.sink.take(),
            sha256,
        };
        vec![
            Action::FinalizeSink,
            Action::Send(WireMessage::TransferAck { name: completed }),
        ]
    }

    // ---- shared ----

    /// Route a transfer frame. Non-transfer frames are ignored.
    pub fn on_message(&mut self, msg: WireMessage) -> Vec<Action> {
        match msg {
            WireMessage::TransferRequest { name, size } => self.on_request(name, size),
            WireMessage::TransferResponse { accepted } => self.on_response(accepted),
            WireMessage::TransferChunk(data) => self.on_chunk(data),
            WireMessage::TransferComplete { name } => self.on_complete(name),
            WireMessage::TransferAck { name } => {
                self.on_ack(name);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Fail the current attempt. A sender mid-stream ends the stream early; a receiver drops its sink.
    pub fn fail(&mut self, message: impl Into<String>) -> Vec<Action> {
        let actions = match &self.state {
            TransferState::Idle | TransferState::Error { .. } => return Vec::new(),
            TransferState::Sending { .. } if !self.stream_ended => {
                vec![Action::Send(WireMessage::end_of_stream())]
            }
            TransferState::Receiving { .. }
            | TransferState::Completed {
                direction: Direction::Incoming,
                ..
            } => vec![Action::DiscardSink],
            _ => Vec::new(),
        };
        self.sink = None;
        self.state = TransferState::Error {
            message: message.into(),
        };
        actions
    }

    /// Like `fail`, but a no-op if `attempt` is no longer current.
    pub fn fail_attempt(&mut self, attempt: u64, message: impl Into<String>) -> Vec<Action> {
        if attempt != self.attempt {
            return Vec::new();
        }
        self.fail(message)
    }

    /// The session is gone. Pre-stream states fall back to `Idle`; active ones become `Error`.
    pub fn on_session_ended(&mut self) -> Vec<Action> {
        self.withdrawn = None;
        match &self.state {
            TransferState::AwaitingLocalConfirmation { .. }
            | TransferState::ReceivingRequest { .. } => {
                self.state = TransferState::Idle;
                Vec::new()
            }
            TransferState::WaitingForRemoteAcceptance { .. } | TransferState::Sending { .. } => {
                self.state = TransferState::Error {
                    message: "session ended".into(),
                };
                Vec::new()
            }
            TransferState::Receiving { .. } => {
                self.sink = None;
                self.state = TransferState::Error {
                    message: "session ended".into(),
                };
                vec![Action::DiscardSink]
            }
            _ => Vec::new(),
        }
    }

    pub fn reset(&mut self) -> Vec<Action> {
        let actions = match self.state {
            TransferState::Receiving { .. } => vec![Action::DiscardSink],
            _ => Vec::new(),
        };
        self.withdrawn = None;
        self.begin(TransferState::Idle);
        actions
    }
}
