//! The session manager: a single task that owns the session, the link, the
//! multiplexer, the active transfer and the chat log. Everything that can
//! change any of them (API commands, link callbacks, worker results, the
//! negotiation deadline) is funnelled through its select loop, so nothing
//! else ever mutates session state.

use std::{path::PathBuf, pin::Pin, sync::Arc};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
    time::Sleep,
};
use uuid::Uuid;

use crate::{
    config::SessionConfig,
    descriptor::{self, SessionDescriptor},
    error::{Result, TelekinesisError},
    events::{Event, EventLog},
    models::{ChatDirection, ChatMessage, Direction, FileMetadata, Role, SessionState, Transfer},
    mux::{ChannelKind, ControlMessage, Demultiplexer, Frame, Multiplexer},
    session::{Session, SessionEvent},
    transfer::{self, OutgoingFile, ProgressThrottle, TransferUpdate, TransferUpdates},
    transport::{Connector, Link, LinkEvent},
};

const COMMAND_QUEUE: usize = 64;

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    CreateOffer(Reply<()>),
    CreateAnswer { offer: String, reply: Reply<()> },
    SetAnswer { answer: String, reply: Reply<()> },
    Disconnect(Reply<()>),
    Reset(Reply<()>),
    SendMessage { text: String, reply: Reply<()> },
    SendFile { file: OutgoingFile, reply: Reply<Uuid> },
    Status(oneshot::Sender<SessionStatus>),
    ChatLog(oneshot::Sender<Vec<ChatMessage>>),
}

type Negotiated = Result<(Arc<dyn Link>, Vec<u8>)>;

/// Results of work the manager pushed off its own task. `generation` ties
/// each result to the session it was started for.
enum Internal {
    Offer { generation: u64, result: Negotiated },
    Answer { generation: u64, result: Negotiated },
}

/// The transfer in flight, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferStatus {
    pub id: Uuid,
    pub direction: Direction,
    pub filename: String,
    /// Byte counts. An outbound file only gets them once it has been measured.
    pub details: Option<Transfer>,
    /// Every byte is out and the peer has yet to confirm the file.
    pub awaiting_confirmation: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: Uuid,
    pub state: SessionState,
    pub is_connected: bool,
    pub role: Option<Role>,
    pub peer_descriptor_received: bool,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub transfer: Option<TransferStatus>,
    pub chat_messages: usize,
}

/// Cheap, cloneable way in to the session manager. Once every handle is
/// dropped the manager tears the session down and exits.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
    stop: mpsc::Sender<oneshot::Sender<()>>,
}

impl SessionHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| TelekinesisError::ServiceStopped)?;
        rx.await.map_err(|_| TelekinesisError::ServiceStopped)
    }

    /// Starts offer generation. The offer itself arrives as an
    /// `offer_created` event.
    pub async fn create_offer(&self) -> Result<()> {
        self.request(Command::CreateOffer).await?
    }

    /// Accepts a remote offer. The answer arrives as an `answer_created`
    /// event.
    pub async fn create_answer(&self, offer: impl Into<String>) -> Result<()> {
        let offer = offer.into();
        self.request(|reply| Command::CreateAnswer { offer, reply })
            .await?
    }

    pub async fn set_answer(&self, answer: impl Into<String>) -> Result<()> {
        let answer = answer.into();
        self.request(|reply| Command::SetAnswer { answer, reply })
            .await?
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await?
    }

    pub async fn reset(&self) -> Result<()> {
        self.request(Command::Reset).await?
    }

    pub async fn send_message(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| Command::SendMessage { text, reply })
            .await?
    }

    /// Starts sending `file` and returns the transfer id.
    pub async fn send_file(&self, file: OutgoingFile) -> Result<Uuid> {
        self.request(|reply| Command::SendFile { file, reply })
            .await?
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        self.request(Command::Status).await
    }

    pub async fn chat_log(&self) -> Result<Vec<ChatMessage>> {
        self.request(Command::ChatLog).await
    }

    /// Tears the session down and stops the manager. Calling it on a stopped
    /// manager is fine.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.stop.send(done).await.is_err() || rx.await.is_err() {
            debug!("session manager already stopped");
        }
    }
}

struct ActiveTransfer {
    id: Uuid,
    direction: Direction,
    filename: String,
    /// Outbound transfers only get a record once the file has been measured.
    record: Option<Transfer>,
    chunks: Option<mpsc::Sender<Bytes>>,
    /// Outbound only: sent in full, held until the peer reports it saved.
    awaiting_confirmation: bool,
    throttle: ProgressThrottle,
    task: JoinHandle<()>,
}

impl ActiveTransfer {
    fn status(&self) -> TransferStatus {
        TransferStatus {
            id: self.id,
            direction: self.direction,
            filename: self.filename.clone(),
            details: self.record.clone(),
            awaiting_confirmation: self.awaiting_confirmation,
        }
    }
}

impl Drop for ActiveTransfer {
    fn drop(&mut self) {
        // the worker owns the file handles, aborting it releases them
        self.task.abort();
    }
}

pub struct SessionManager {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    download_dir: PathBuf,
    events: Arc<EventLog>,

    session: Session,
    generation: u64,
    negotiation: Option<JoinHandle<()>>,
    link: Option<Arc<dyn Link>>,
    link_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    deadline: Option<Pin<Box<Sleep>>>,
    mux: Option<Multiplexer>,
    demux: Demultiplexer,
    transfer: Option<ActiveTransfer>,
    chat: Vec<ChatMessage>,

    internal: mpsc::UnboundedSender<Internal>,
    updates: TransferUpdates,
}

async fn next_link_event(rx: &mut Option<mpsc::UnboundedReceiver<LinkEvent>>) -> Option<LinkEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

fn invalid_state(state: SessionState, action: &'static str) -> TelekinesisError {
    TelekinesisError::InvalidState { state, action }
}

impl SessionManager {
    pub fn spawn(
        connector: Arc<dyn Connector>,
        config: SessionConfig,
        download_dir: PathBuf,
        events: Arc<EventLog>,
    ) -> SessionHandle {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (stop, stop_rx) = mpsc::channel(1);
        let (internal, internal_rx) = mpsc::unbounded_channel();
        let (updates, updates_rx) = mpsc::unbounded_channel();

        let manager = SessionManager {
            connector,
            config,
            download_dir,
            events,
            session: Session::new(),
            generation: 0,
            negotiation: None,
            link: None,
            link_rx: None,
            deadline: None,
            mux: None,
            demux: Demultiplexer::new(),
            transfer: None,
            chat: Vec::new(),
            internal,
            updates,
        };
        tokio::spawn(manager.run(commands, stop_rx, internal_rx, updates_rx));

        SessionHandle { tx, stop }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut stop: mpsc::Receiver<oneshot::Sender<()>>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut updates: mpsc::UnboundedReceiver<(Uuid, TransferUpdate)>,
    ) {
        info!("session {} ready", self.session.id());
        let mut stopped = None;
        loop {
            tokio::select! {
                Some(done) = stop.recv() => {
                    stopped = Some(done);
                    break;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("all session handles dropped");
                        break;
                    }
                },
                Some(msg) = internal.recv() => self.handle_internal(msg).await,
                Some((id, update)) = updates.recv() => self.handle_update(id, update).await,
                event = next_link_event(&mut self.link_rx) => self.handle_link_event(event).await,
                _ = wait_deadline(&mut self.deadline) => self.handle_deadline().await,
            }
        }

        self.teardown().await;
        info!("session manager stopped");
        if let Some(done) = stopped {
            let _ = done.send(());
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::CreateOffer(reply) => {
                let _ = reply.send(self.create_offer().await);
            }
            Command::CreateAnswer { offer, reply } => {
                let _ = reply.send(self.create_answer(&offer).await);
            }
            Command::SetAnswer { answer, reply } => {
                let _ = reply.send(self.set_answer(&answer).await);
            }
            Command::Disconnect(reply) => {
                let _ = reply.send(self.disconnect().await);
            }
            Command::Reset(reply) => {
                let _ = reply.send(self.reset().await);
            }
            Command::SendMessage { text, reply } => {
                let _ = reply.send(self.send_message(text));
            }
            Command::SendFile { file, reply } => {
                let _ = reply.send(self.send_file(file));
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::ChatLog(reply) => {
                let _ = reply.send(self.chat.clone());
            }
        }
    }

    fn publish(&self, event: Event) {
        self.events.publish(event);
    }

    fn publish_state(&self) {
        self.publish(Event::ConnectionStateChanged {
            state: self.session.state(),
        });
    }

    fn publish_error(&self, message: impl Into<String>) {
        self.publish(Event::Error {
            message: message.into(),
        });
    }

    /// Releases everything tied to the current link: pending negotiation,
    /// worker tasks, the multiplexer and the link itself. Results that are
    /// still in flight for it will be recognised as stale. Returns the name of
    /// the file whose transfer was cut short, if any.
    async fn teardown(&mut self) -> Option<String> {
        self.generation += 1;
        self.deadline = None;
        if let Some(task) = self.negotiation.take() {
            task.abort();
        }
        let interrupted = self.transfer.take().map(|active| {
            info!("discarding transfer of {}", active.filename);
            active.filename.clone()
        });
        if let Some(mux) = self.mux.take() {
            mux.shutdown();
        }
        self.link_rx = None;
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.demux = Demultiplexer::new();
        interrupted
    }

    fn publish_interrupted(&self, filename: Option<String>, why: &str) {
        if let Some(filename) = filename {
            self.publish_error(format!("transfer of {filename} interrupted: {why}"));
        }
    }

    /// Back to a fresh idle session, emitting the state change if there was
    /// one.
    async fn reset_session(&mut self) {
        let interrupted = self.teardown().await;
        self.chat.clear();
        self.publish_interrupted(interrupted, "session reset");
        if self.session.apply(SessionEvent::Reset).is_ok() {
            info!("session reset, new session {}", self.session.id());
            self.publish_state();
        }
    }

    fn arm_deadline(&mut self) {
        self.deadline = Some(Box::pin(tokio::time::sleep(
            self.config.negotiation_timeout(),
        )));
    }

    async fn fail(&mut self, event: SessionEvent, message: String) {
        self.teardown().await;
        match self.session.apply(event) {
            Ok(_) => {
                error!("connection failed: {message}");
                self.publish_state();
                self.publish_error(message);
            }
            Err(e) => warn!("{message} ({e})"),
        }
    }

    async fn create_offer(&mut self) -> Result<()> {
        if self.session.state().is_terminal() {
            self.reset_session().await;
        }
        self.session.apply(SessionEvent::Initiate)?;
        self.publish_state();

        let (tx, rx) = mpsc::unbounded_channel();
        self.link_rx = Some(rx);
        let connector = self.connector.clone();
        let internal = self.internal.clone();
        let generation = self.generation;
        self.negotiation = Some(tokio::spawn(async move {
            let result = connector.offer(tx).await;
            let _ = internal.send(Internal::Offer { generation, result });
        }));
        Ok(())
    }

    async fn create_answer(&mut self, offer: &str) -> Result<()> {
        if self.session.state().is_terminal() {
            self.reset_session().await;
        }
        self.session.check(&SessionEvent::Accept)?;
        let offer =
            descriptor::decode_expecting(offer, Role::Offerer, self.config.max_descriptor_bytes)?;
        self.session.apply(SessionEvent::Accept)?;
        self.publish_state();

        let (tx, rx) = mpsc::unbounded_channel();
        self.link_rx = Some(rx);
        let connector = self.connector.clone();
        let internal = self.internal.clone();
        let generation = self.generation;
        self.negotiation = Some(tokio::spawn(async move {
            let result = connector.answer(&offer.payload, tx).await;
            let _ = internal.send(Internal::Answer { generation, result });
        }));
        Ok(())
    }

    async fn set_answer(&mut self, answer: &str) -> Result<()> {
        let state = self.session.state();
        self.session.check(&SessionEvent::RemoteAnswer)?;
        let link = self
            .link
            .clone()
            .ok_or_else(|| invalid_state(state, "apply an answer before the offer is ready"))?;
        let answer =
            descriptor::decode_expecting(answer, Role::Answerer, self.config.max_descriptor_bytes)
                .map_err(|e| TelekinesisError::Protocol(e.to_string()))?;

        self.session.apply(SessionEvent::RemoteAnswer)?;
        self.publish_state();
        self.arm_deadline();

        if let Err(e) = link.apply_answer(&answer.payload).await {
            let message = format!("could not apply answer: {e}");
            self.fail(SessionEvent::TransportFailed(message.clone()), message)
                .await;
            return Err(e);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        match self.session.state() {
            SessionState::Connected => {
                let interrupted = self.teardown().await;
                self.chat.clear();
                self.publish_interrupted(interrupted, "disconnected");
                self.session.apply(SessionEvent::LocalDisconnect)?;
                info!("disconnected, new session {}", self.session.id());
                self.publish_state();
                Ok(())
            }
            SessionState::Idle => Err(invalid_state(SessionState::Idle, "disconnect")),
            _ => {
                self.reset_session().await;
                Ok(())
            }
        }
    }

    async fn reset(&mut self) -> Result<()> {
        self.reset_session().await;
        Ok(())
    }

    fn send_message(&mut self, text: String) -> Result<()> {
        let state = self.session.state();
        let mux = match (&self.mux, state) {
            (Some(mux), SessionState::Connected) => mux,
            _ => return Err(invalid_state(state, "send a message")),
        };
        mux.send_control(&ControlMessage::TextMessage {
            content: text.clone(),
        })?;
        self.chat.push(ChatMessage::new(text, ChatDirection::Sent));
        Ok(())
    }

    fn send_file(&mut self, file: OutgoingFile) -> Result<Uuid> {
        let state = self.session.state();
        let mux = match (&self.mux, state) {
            (Some(mux), SessionState::Connected) => mux.sender(),
            _ => return Err(invalid_state(state, "send a file")),
        };
        if self.transfer.is_some() {
            return Err(TelekinesisError::AlreadyTransferring);
        }

        let id = Uuid::new_v4();
        let filename = file.filename.clone();
        info!("starting transfer {id} of {filename}");
        let task = tokio::spawn(transfer::send_file(
            id,
            file,
            self.config.chunk_size,
            mux,
            self.updates.clone(),
        ));
        self.transfer = Some(ActiveTransfer {
            id,
            direction: Direction::Outbound,
            filename,
            record: None,
            chunks: None,
            awaiting_confirmation: false,
            throttle: ProgressThrottle::new(self.config.progress_interval()),
            task,
        });
        Ok(id)
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.session.id(),
            state: self.session.state(),
            is_connected: self.session.state() == SessionState::Connected,
            role: self.session.role(),
            peer_descriptor_received: self.session.peer_descriptor_received(),
            created_at: self.session.created_at(),
            last_error: self.session.last_error().map(str::to_string),
            transfer: self.transfer.as_ref().map(ActiveTransfer::status),
            chat_messages: self.chat.len(),
        }
    }

    async fn handle_internal(&mut self, msg: Internal) {
        let (generation, result, role) = match msg {
            Internal::Offer { generation, result } => (generation, result, Role::Offerer),
            Internal::Answer { generation, result } => (generation, result, Role::Answerer),
        };

        if generation != self.generation {
            debug!("dropping {role:?} descriptor from an earlier session");
            if let Ok((link, _)) = result {
                link.close().await;
            }
            return;
        }
        self.negotiation = None;

        let encoded = result.and_then(|(link, payload)| {
            self.link = Some(link);
            descriptor::encode(&SessionDescriptor::new(role, payload))
        });

        match (role, encoded) {
            (Role::Offerer, Ok(offer)) => {
                info!("offer ready ({} chars)", offer.len());
                self.publish(Event::OfferCreated { offer });
            }
            (Role::Answerer, Ok(answer)) => {
                info!("answer ready ({} chars)", answer.len());
                self.publish(Event::AnswerCreated { answer });
                if self.session.apply(SessionEvent::AnswerExported).is_ok() {
                    self.publish_state();
                    self.arm_deadline();
                }
            }
            (role, Err(e)) => {
                error!("could not generate {role:?} descriptor: {e}");
                self.publish_error(format!("could not create connection descriptor: {e}"));
                self.reset_session().await;
            }
        }
    }

    async fn handle_deadline(&mut self) {
        self.deadline = None;
        if self.session.state() == SessionState::Connecting {
            let message = format!(
                "connection was not established within {:?}",
                self.config.negotiation_timeout()
            );
            self.fail(SessionEvent::Timeout, message).await;
        }
    }

    async fn handle_link_event(&mut self, event: Option<LinkEvent>) {
        match event {
            Some(LinkEvent::Open) => self.link_open(),
            Some(LinkEvent::Message(data)) => self.handle_frame(data).await,
            Some(LinkEvent::Closed) => self.link_lost(None).await,
            Some(LinkEvent::Failed(reason)) => self.link_lost(Some(reason)).await,
            None => {
                self.link_rx = None;
                self.link_lost(None).await;
            }
        }
    }

    fn link_open(&mut self) {
        if self.session.state() != SessionState::Connecting {
            debug!("ignoring link open while {}", self.session.state());
            return;
        }
        let Some(link) = self.link.clone() else {
            warn!("link opened but no link is held");
            return;
        };
        if self.session.apply(SessionEvent::TransportOpen).is_ok() {
            self.deadline = None;
            self.mux = Some(Multiplexer::spawn(link));
            self.demux = Demultiplexer::new();
            info!("connected");
            self.publish_state();
        }
    }

    async fn link_lost(&mut self, reason: Option<String>) {
        match self.session.state() {
            SessionState::Connecting => {
                let message = reason.unwrap_or_else(|| "transport closed during negotiation".into());
                self.fail(SessionEvent::TransportFailed(message.clone()), message)
                    .await;
            }
            SessionState::Connected => {
                let interrupted = self.teardown().await;
                if let Some(reason) = &reason {
                    self.session.note_error(reason.clone());
                }
                if self.session.apply(SessionEvent::TransportClosed).is_ok() {
                    warn!("peer closed the connection");
                    self.publish_interrupted(interrupted, "connection closed");
                    if let Some(reason) = reason {
                        self.publish_error(reason);
                    }
                    self.publish_state();
                }
            }
            state => debug!("ignoring link loss while {state}"),
        }
    }

    async fn handle_frame(&mut self, data: Bytes) {
        if self.session.state() != SessionState::Connected {
            debug!("dropping frame received while {}", self.session.state());
            return;
        }
        let frame = match self.demux.accept(&data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("skipping frame: {e}");
                return;
            }
        };

        match frame.kind {
            ChannelKind::Control => self.handle_control(frame),
            ChannelKind::FileMeta => self.handle_metadata(frame),
            ChannelKind::FileChunk => self.handle_chunk(frame),
        }
    }

    fn handle_control(&mut self, frame: Frame) {
        let msg: ControlMessage = match serde_json::from_slice(&frame.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("skipping unreadable control frame {}: {e}", frame.seq);
                return;
            }
        };

        match msg {
            ControlMessage::TextMessage { content } => {
                debug!("message received ({} chars)", content.len());
                self.chat
                    .push(ChatMessage::new(content.clone(), ChatDirection::Received));
                self.publish(Event::MessageReceived { text: content });
            }
            ControlMessage::FileAbort { id, reason } => {
                match self.transfer.take_if(|t| t.id == id) {
                    Some(active) => {
                        warn!("peer aborted transfer of {}: {reason}", active.filename);
                        self.publish_error(format!(
                            "peer aborted transfer of {}: {reason}",
                            active.filename
                        ));
                    }
                    None => debug!("peer aborted unknown transfer {id}"),
                }
            }
            ControlMessage::FileComplete { id } => {
                match self
                    .transfer
                    .take_if(|t| t.id == id && t.direction == Direction::Outbound)
                {
                    Some(mut active) => {
                        // may overtake the sender's own last update
                        if let Some(record) = active.record.as_mut() {
                            record.complete();
                        }
                        self.report_progress(&mut active);
                        info!("peer saved {}", active.filename);
                    }
                    None => debug!("completion for unknown transfer {id}"),
                }
            }
        }
    }

    fn handle_metadata(&mut self, frame: Frame) {
        let meta: FileMetadata = match serde_json::from_slice(&frame.payload) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("skipping unreadable file metadata: {e}");
                return;
            }
        };

        if self.transfer.is_some() {
            warn!("refusing {}: a transfer is already in progress", meta.file_name);
            self.abort_remote(meta.id, &TelekinesisError::AlreadyTransferring.to_string());
            return;
        }

        info!("receiving {} ({} bytes)", meta.file_name, meta.size);
        let (chunks, chunks_rx) = mpsc::channel(self.config.inbound_chunk_buffer.max(1));
        let id = meta.id;
        let filename = transfer::sanitize_filename(&meta.file_name);
        let record = Transfer::new(id, Direction::Inbound, filename.clone(), meta.size);
        let task = tokio::spawn(transfer::receive_file(
            meta,
            self.download_dir.clone(),
            chunks_rx,
            self.updates.clone(),
        ));

        let mut active = ActiveTransfer {
            id,
            direction: Direction::Inbound,
            filename,
            record: Some(record),
            chunks: Some(chunks),
            awaiting_confirmation: false,
            throttle: ProgressThrottle::new(self.config.progress_interval()),
            task,
        };
        self.report_progress(&mut active);
        self.transfer = Some(active);
    }

    fn handle_chunk(&mut self, frame: Frame) {
        let Some(chunks) = self
            .transfer
            .as_ref()
            .filter(|t| t.direction == Direction::Inbound)
            .and_then(|t| t.chunks.as_ref())
        else {
            debug!("dropping chunk {} with no inbound transfer", frame.seq);
            return;
        };

        match chunks.try_send(frame.payload) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => debug!("writer already finished, dropping chunk"),
            Err(TrySendError::Full(_)) => {
                if let Some(active) = self.transfer.take() {
                    let message = format!("storage fell behind while receiving {}", active.filename);
                    error!("{message}");
                    self.abort_remote(active.id, &message);
                    self.publish_error(message);
                }
            }
        }
    }

    /// Tells the peer to drop its side of transfer `id`.
    fn abort_remote(&self, id: Uuid, reason: &str) {
        let Some(mux) = &self.mux else { return };
        let msg = ControlMessage::FileAbort {
            id,
            reason: reason.to_string(),
        };
        if let Err(e) = mux.send_control(&msg) {
            warn!("could not abort transfer {id} on the peer: {e}");
        }
    }

    /// Tells the peer its file `id` is safely on disk, which frees it to send
    /// the next one.
    fn confirm_remote(&self, id: Uuid) {
        let Some(mux) = &self.mux else { return };
        if let Err(e) = mux.send_control(&ControlMessage::FileComplete { id }) {
            warn!("could not confirm transfer {id} to the peer: {e}");
        }
    }

    fn report_progress(&self, active: &mut ActiveTransfer) {
        let Some(record) = &active.record else { return };
        if let Some(progress) = active.throttle.observe(record.bytes_moved, record.total_bytes) {
            self.publish(Event::Progress {
                progress,
                is_sending: record.is_sending(),
            });
        }
    }

    async fn handle_update(&mut self, id: Uuid, update: TransferUpdate) {
        let Some(mut active) = self.transfer.take_if(|t| t.id == id) else {
            debug!("dropping update for stale transfer {id}");
            return;
        };

        match update {
            TransferUpdate::Started {
                filename,
                total_bytes,
            } => {
                active.record = Some(Transfer::new(id, active.direction, filename, total_bytes));
                self.report_progress(&mut active);
            }
            TransferUpdate::Progress(moved) => {
                if let Some(record) = active.record.as_mut() {
                    record.advance_to(moved);
                }
                self.report_progress(&mut active);
            }
            TransferUpdate::Finished(Ok(saved)) => {
                if let Some(record) = active.record.as_mut() {
                    record.complete();
                }
                self.report_progress(&mut active);
                match saved {
                    Some(path) => {
                        let filename = path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| active.filename.clone());
                        self.publish(Event::FileReceived {
                            filename,
                            path: path.to_string_lossy().into_owned(),
                        });
                        self.confirm_remote(id);
                        return;
                    }
                    None => {
                        info!("sent {}, waiting for the peer to save it", active.filename);
                        active.awaiting_confirmation = true;
                    }
                }
            }
            TransferUpdate::Finished(Err(e)) => {
                let message = format!("transfer of {} failed: {e}", active.filename);
                error!("{message}");
                self.abort_remote(id, &e.to_string());
                self.publish_error(message);
                return;
            }
        }

        self.transfer = Some(active);
    }
}
