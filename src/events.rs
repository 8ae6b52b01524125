//! One internal event log with two ways out: a push feed (live broadcast
//! with replay by id) and a poll snapshot of everything since the last poll.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::SessionState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    OfferCreated { offer: String },
    AnswerCreated { answer: String },
    ConnectionStateChanged { state: SessionState },
    Progress { progress: f64, is_sending: bool },
    FileReceived { filename: String, path: String },
    MessageReceived { text: String },
    Error { message: String },
    /// Push feed only, never stored.
    Heartbeat,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OfferCreated { .. } => "offer_created",
            Event::AnswerCreated { .. } => "answer_created",
            Event::ConnectionStateChanged { .. } => "connection_state_changed",
            Event::Progress { .. } => "progress",
            Event::FileReceived { .. } => "file_received",
            Event::MessageReceived { .. } => "message_received",
            Event::Error { .. } => "error",
            Event::Heartbeat => "heartbeat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub progress: f64,
    pub is_sending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedFile {
    pub filename: String,
    pub path: String,
}

/// What changed since the previous poll. Single-valued fields hold the
/// latest value; the lists keep every file receipt, message and state change
/// so none of them can be overwritten between two polls. Each list holds at
/// most as many entries as the event backlog; once full the oldest entry
/// goes (terminal state changes last) and `dropped` counts it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollSnapshot {
    pub connection_state: SessionState,
    pub is_connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_received: Option<ReceivedFile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_received: Vec<ReceivedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state_changes: Vec<SessionState>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub dropped: u64,
    pub last_event_id: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// Appends `item`, first evicting the oldest entry that `keep` does not
/// protect (or the oldest of all) when `list` is at `cap`.
fn push_capped<T>(
    list: &mut Vec<T>,
    item: T,
    cap: usize,
    dropped: &mut u64,
    keep: impl Fn(&T) -> bool,
) {
    if list.len() >= cap {
        let at = list.iter().position(|t| !keep(t)).unwrap_or(0);
        list.remove(at);
        *dropped += 1;
    }
    list.push(item);
}

impl PollSnapshot {
    fn fold(&mut self, event: &Event, cap: usize) {
        match event {
            Event::OfferCreated { offer } => self.offer = Some(offer.clone()),
            Event::AnswerCreated { answer } => self.answer = Some(answer.clone()),
            Event::ConnectionStateChanged { state } => push_capped(
                &mut self.state_changes,
                *state,
                cap,
                &mut self.dropped,
                SessionState::is_terminal,
            ),
            Event::Progress {
                progress,
                is_sending,
            } => {
                self.progress = Some(ProgressReport {
                    progress: *progress,
                    is_sending: *is_sending,
                })
            }
            Event::FileReceived { filename, path } => {
                let file = ReceivedFile {
                    filename: filename.clone(),
                    path: path.clone(),
                };
                self.file_received = Some(file.clone());
                push_capped(&mut self.files_received, file, cap, &mut self.dropped, |_| false);
            }
            Event::MessageReceived { text } => {
                self.message = Some(text.clone());
                push_capped(&mut self.messages, text.clone(), cap, &mut self.dropped, |_| false);
            }
            Event::Error { message } => self.error = Some(message.clone()),
            Event::Heartbeat => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        self.offer.is_none()
            && self.answer.is_none()
            && self.progress.is_none()
            && self.files_received.is_empty()
            && self.messages.is_empty()
            && self.error.is_none()
            && self.state_changes.is_empty()
    }
}

/// A push-feed consumer's starting point: the backlog it missed, then the
/// live feed. Nothing published between the two is lost or repeated.
pub struct Subscription {
    pub replay: Vec<Envelope>,
    pub live: broadcast::Receiver<Envelope>,
    /// The requested id is older than the backlog reaches back, so the
    /// consumer has to resynchronise from a poll snapshot.
    pub gap: bool,
}

struct Inner {
    next_id: u64,
    capacity: usize,
    backlog: VecDeque<Envelope>,
    pending: PollSnapshot,
    state: SessionState,
}

pub struct EventLog {
    inner: Mutex<Inner>,
    tx: broadcast::Sender<Envelope>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                capacity,
                backlog: VecDeque::with_capacity(capacity),
                pending: PollSnapshot::default(),
                state: SessionState::Idle,
            }),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // every critical section leaves Inner consistent, so a poisoned lock
        // is still usable
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records `event` and hands it to live subscribers. Returns its id.
    pub fn publish(&self, event: Event) -> u64 {
        if event == Event::Heartbeat {
            trace!("not logging heartbeat");
            return 0;
        }

        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        if let Event::ConnectionStateChanged { state } = &event {
            inner.state = *state;
        }
        let cap = inner.capacity;
        inner.pending.fold(&event, cap);

        let envelope = Envelope {
            id,
            at: Utc::now(),
            event,
        };
        debug!("event {id}: {}", envelope.event.name());

        if inner.backlog.len() == inner.capacity {
            inner.backlog.pop_front();
        }
        inner.backlog.push_back(envelope.clone());

        // sent under the lock so subscribe() sees a clean cut
        let _ = self.tx.send(envelope);
        id
    }

    /// Everything since the previous poll, plus the current connection state.
    pub fn poll(&self) -> PollSnapshot {
        let mut inner = self.lock();
        let mut snapshot = std::mem::take(&mut inner.pending);
        snapshot.connection_state = inner.state;
        snapshot.is_connected = inner.state == SessionState::Connected;
        snapshot.last_event_id = inner.next_id - 1;
        snapshot
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn last_id(&self) -> u64 {
        self.lock().next_id - 1
    }

    pub fn subscribe(&self, last_event_id: Option<u64>) -> Subscription {
        let inner = self.lock();
        let live = self.tx.subscribe();

        let Some(last) = last_event_id else {
            return Subscription {
                replay: vec![],
                live,
                gap: false,
            };
        };

        let newest = inner.next_id - 1;
        let oldest_kept = inner.backlog.front().map_or(inner.next_id, |e| e.id);
        let gap = last > newest || last + 1 < oldest_kept;
        let replay = inner
            .backlog
            .iter()
            .filter(|e| e.id > last)
            .cloned()
            .collect();

        Subscription { replay, live, gap }
    }
}
