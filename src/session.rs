//! The connection lifecycle as a pure state machine. No IO happens here; the
//! session manager feeds it events and acts on the resulting state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::{Result, TelekinesisError},
    models::{Role, SessionState},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Initiate,
    Accept,
    RemoteAnswer,
    AnswerExported,
    TransportOpen,
    TransportFailed(String),
    Timeout,
    TransportClosed,
    LocalDisconnect,
    Reset,
}

impl SessionEvent {
    pub fn action(&self) -> &'static str {
        match self {
            SessionEvent::Initiate => "create an offer",
            SessionEvent::Accept => "accept an offer",
            SessionEvent::RemoteAnswer => "apply an answer",
            SessionEvent::AnswerExported => "export an answer",
            SessionEvent::TransportOpen => "open the transport",
            SessionEvent::TransportFailed(_) => "fail the transport",
            SessionEvent::Timeout => "time out negotiation",
            SessionEvent::TransportClosed => "close the transport",
            SessionEvent::LocalDisconnect => "disconnect",
            SessionEvent::Reset => "reset",
        }
    }
}

/// Returns the state `event` leads to from `from`, or `None` when the event is
/// not legal there.
pub fn transition(from: SessionState, event: &SessionEvent) -> Option<SessionState> {
    use SessionEvent as E;
    use SessionState as S;

    match (from, event) {
        (S::Idle, E::Initiate) => Some(S::OfferPending),
        (S::Idle, E::Accept) => Some(S::AnswerPending),
        (S::OfferPending, E::RemoteAnswer) => Some(S::Connecting),
        (S::AnswerPending, E::AnswerExported) => Some(S::Connecting),
        (S::Connecting, E::TransportOpen) => Some(S::Connected),
        (S::Connecting, E::Timeout | E::TransportFailed(_)) => Some(S::Failed),
        (S::Connected, E::TransportClosed) => Some(S::Closed),
        (S::Connected, E::LocalDisconnect) => Some(S::Idle),
        (S::Idle, E::Reset) => None,
        (_, E::Reset) => Some(S::Idle),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    id: Uuid,
    state: SessionState,
    role: Option<Role>,
    peer_descriptor_received: bool,
    created_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            role: None,
            peer_descriptor_received: false,
            created_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn peer_descriptor_received(&self) -> bool {
        self.peer_descriptor_received
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Fails with `InvalidState` if `event` is not legal right now.
    pub fn check(&self, event: &SessionEvent) -> Result<SessionState> {
        transition(self.state, event).ok_or(TelekinesisError::InvalidState {
            state: self.state,
            action: event.action(),
        })
    }

    /// Applies `event`. On error the session is left untouched.
    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionState> {
        let next = self.check(&event)?;

        match event {
            SessionEvent::Initiate => self.role = Some(Role::Offerer),
            SessionEvent::Accept => {
                self.role = Some(Role::Answerer);
                self.peer_descriptor_received = true;
            }
            SessionEvent::RemoteAnswer => self.peer_descriptor_received = true,
            SessionEvent::TransportFailed(reason) => self.last_error = Some(reason),
            SessionEvent::Timeout => {
                self.last_error = Some("connection negotiation timed out".into())
            }
            SessionEvent::LocalDisconnect | SessionEvent::Reset => *self = Session::new(),
            SessionEvent::AnswerExported
            | SessionEvent::TransportOpen
            | SessionEvent::TransportClosed => {}
        }

        self.state = next;
        Ok(next)
    }

    /// Records an error without changing state, e.g. a peer that vanished
    /// while connected.
    pub fn note_error(&mut self, reason: impl Into<String>) {
        self.last_error = Some(reason.into());
    }
}
