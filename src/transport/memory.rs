//! In-process link pairing. Two sessions sharing one [`MemoryConnector`] can
//! negotiate and exchange frames without touching the network, which is what
//! the integration tests and embedders without WebRTC use.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use uuid::Uuid;

use super::{Connector, Link, LinkEvent, LinkEvents};
use crate::error::{Result, TelekinesisError};

struct Pairing {
    offerer: LinkEvents,
    answerer: Option<LinkEvents>,
}

type Hub = Arc<Mutex<HashMap<Uuid, Pairing>>>;

#[derive(Clone, Default)]
pub struct MemoryConnector {
    hub: Hub,
    frame_delay: Option<Duration>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every frame by `delay`, which makes transfers slow enough to
    /// interrupt.
    pub fn with_frame_delay(delay: Duration) -> Self {
        Self {
            hub: Hub::default(),
            frame_delay: Some(delay),
        }
    }

    fn link(&self, id: Uuid, events: LinkEvents, peer: Option<LinkEvents>) -> Arc<dyn Link> {
        Arc::new(MemoryLink {
            id,
            hub: self.hub.clone(),
            events,
            peer: Mutex::new(peer),
            closed: AtomicBool::new(false),
            frame_delay: self.frame_delay,
        })
    }
}

fn parse_token(payload: &[u8], kind: &str) -> Result<Uuid> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| TelekinesisError::Transport("memory descriptor is not utf-8".into()))?;
    text.strip_prefix(kind)
        .and_then(|id| Uuid::parse_str(id).ok())
        .ok_or_else(|| TelekinesisError::Transport(format!("not a memory {kind} descriptor")))
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn offer(&self, events: LinkEvents) -> Result<(Arc<dyn Link>, Vec<u8>)> {
        let id = Uuid::new_v4();
        self.hub
            .lock()
            .map_err(|_| TelekinesisError::Transport("memory hub poisoned".into()))?
            .insert(
                id,
                Pairing {
                    offerer: events.clone(),
                    answerer: None,
                },
            );
        debug!("memory offer {id} registered");
        Ok((self.link(id, events, None), format!("offer:{id}").into_bytes()))
    }

    async fn answer(&self, offer: &[u8], events: LinkEvents) -> Result<(Arc<dyn Link>, Vec<u8>)> {
        let id = parse_token(offer, "offer:")?;
        let offerer = {
            let mut hub = self
                .hub
                .lock()
                .map_err(|_| TelekinesisError::Transport("memory hub poisoned".into()))?;
            let pairing = hub
                .get_mut(&id)
                .ok_or_else(|| TelekinesisError::Transport(format!("no pending offer {id}")))?;
            if pairing.answerer.is_some() {
                return Err(TelekinesisError::Transport(format!(
                    "offer {id} was already answered"
                )));
            }
            pairing.answerer = Some(events.clone());
            pairing.offerer.clone()
        };
        Ok((
            self.link(id, events, Some(offerer)),
            format!("answer:{id}").into_bytes(),
        ))
    }
}

struct MemoryLink {
    id: Uuid,
    hub: Hub,
    events: LinkEvents,
    peer: Mutex<Option<LinkEvents>>,
    closed: AtomicBool,
    frame_delay: Option<Duration>,
}

impl MemoryLink {
    fn peer(&self) -> Option<LinkEvents> {
        self.peer.lock().ok().and_then(|p| p.clone())
    }
}

#[async_trait]
impl Link for MemoryLink {
    async fn apply_answer(&self, answer: &[u8]) -> Result<()> {
        let id = parse_token(answer, "answer:")?;
        if id != self.id {
            return Err(TelekinesisError::Transport(
                "answer belongs to a different offer".into(),
            ));
        }
        let pairing = self
            .hub
            .lock()
            .map_err(|_| TelekinesisError::Transport("memory hub poisoned".into()))?
            .remove(&id)
            .ok_or_else(|| TelekinesisError::Transport(format!("offer {id} is gone")))?;
        let answerer = pairing
            .answerer
            .ok_or_else(|| TelekinesisError::Transport(format!("offer {id} has no answer")))?;

        if let Ok(mut peer) = self.peer.lock() {
            *peer = Some(answerer.clone());
        }
        let _ = answerer.send(LinkEvent::Open);
        let _ = self.events.send(LinkEvent::Open);
        Ok(())
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TelekinesisError::Transport("link is closed".into()));
        }
        if let Some(delay) = self.frame_delay {
            tokio::time::sleep(delay).await;
        }
        let peer = self
            .peer()
            .ok_or_else(|| TelekinesisError::Transport("link is not open".into()))?;
        peer.send(LinkEvent::Message(frame))
            .map_err(|_| TelekinesisError::Transport("peer went away".into()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let peer = self.peer.lock().ok().and_then(|mut p| p.take());
        if let Some(peer) = peer {
            let _ = peer.send(LinkEvent::Closed);
        }
        if let Ok(mut hub) = self.hub.lock() {
            hub.remove(&self.id);
        }
    }
}
