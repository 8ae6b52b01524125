//! The seam between the session and whatever carries bytes between peers.
//!
//! A [`Connector`] produces the local half of a link together with the
//! opaque payload the remote peer needs to join it. The payload ends up in a
//! [`crate::descriptor::SessionDescriptor`]. Lifecycle changes and inbound
//! messages arrive on the [`LinkEvents`] channel handed to the connector.

pub mod memory;
pub mod webrtc;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The ordered reliable channel is ready for traffic.
    Open,
    Message(Bytes),
    /// The remote side went away.
    Closed,
    Failed(String),
}

pub type LinkEvents = mpsc::UnboundedSender<LinkEvent>;

#[async_trait]
pub trait Link: Send + Sync {
    /// Completes negotiation on the offering side.
    async fn apply_answer(&self, answer: &[u8]) -> Result<()>;

    /// Queues one message on the ordered reliable channel.
    async fn send(&self, frame: Bytes) -> Result<()>;

    async fn close(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn offer(&self, events: LinkEvents) -> Result<(Arc<dyn Link>, Vec<u8>)>;

    async fn answer(&self, offer: &[u8], events: LinkEvents) -> Result<(Arc<dyn Link>, Vec<u8>)>;
}
