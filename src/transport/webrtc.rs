//! WebRTC backend: one ordered, reliable data channel per session.
//!
//! Descriptors carry the JSON form of the local `RTCSessionDescription`
//! after ICE gathering, so no trickle signaling is needed and the whole
//! exchange fits in one copy/paste each way.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::{sync::RwLock, time::timeout};
use webrtc::{
    api::{interceptor_registry::register_default_interceptors, media_engine::MediaEngine, APIBuilder},
    data_channel::{
        data_channel_init::RTCDataChannelInit, data_channel_message::DataChannelMessage,
        data_channel_state::RTCDataChannelState, RTCDataChannel,
    },
    ice_transport::ice_server::RTCIceServer,
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

use super::{Connector, Link, LinkEvent, LinkEvents};
use crate::error::{Result, TelekinesisError};

const CHANNEL_LABEL: &str = "telekinesis";
const BUFFERED_AMOUNT_HIGH: usize = 1024 * 1024;
const BACKPRESSURE_POLL: Duration = Duration::from_millis(10);
const BACKPRESSURE_MAX_WAIT: Duration = Duration::from_secs(10);

pub struct WebRtcConnector {
    ice_servers: Vec<String>,
    gather_timeout: Duration,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<String>, gather_timeout: Duration) -> Self {
        Self {
            ice_servers,
            gather_timeout,
        }
    }

    async fn peer_connection(&self, events: &LinkEvents) -> Result<Arc<RTCPeerConnection>> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.ice_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?,
        );

        let events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => info!("peer connection established"),
                    RTCPeerConnectionState::Failed => {
                        error!("peer connection failed");
                        let _ = events.send(LinkEvent::Failed("ICE connection failed".into()));
                    }
                    // transient, ICE may still recover
                    RTCPeerConnectionState::Disconnected => warn!("peer connection interrupted"),
                    RTCPeerConnectionState::Closed => debug!("peer connection closed"),
                    _ => {}
                }
            })
        }));

        Ok(pc)
    }

    /// Sets `description` locally and waits (bounded) for ICE gathering so the
    /// returned payload already lists every candidate.
    async fn gather(
        &self,
        pc: &Arc<RTCPeerConnection>,
        description: RTCSessionDescription,
    ) -> Result<Vec<u8>> {
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(description).await?;

        if timeout(self.gather_timeout, gathered.recv()).await.is_err() {
            warn!(
                "ICE gathering did not finish within {:?}, using the candidates found so far",
                self.gather_timeout
            );
        }

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| TelekinesisError::Transport("no local description after gathering".into()))?;
        Ok(serde_json::to_vec(&local)?)
    }
}

fn attach_channel(dc: &Arc<RTCDataChannel>, events: LinkEvents) {
    let tx = events.clone();
    dc.on_open(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            debug!("data channel open");
            let _ = tx.send(LinkEvent::Open);
        })
    }));

    let tx = events.clone();
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            warn!("data channel closed by transport");
            let _ = tx.send(LinkEvent::Closed);
        })
    }));

    dc.on_error(Box::new(move |err| {
        Box::pin(async move {
            error!("data channel error: {err}");
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = events.clone();
        Box::pin(async move {
            let _ = tx.send(LinkEvent::Message(msg.data));
        })
    }));
}

fn parse_description(payload: &[u8]) -> Result<RTCSessionDescription> {
    serde_json::from_slice(payload)
        .map_err(|e| TelekinesisError::Protocol(format!("invalid session description: {e}")))
}

#[async_trait]
impl Connector for WebRtcConnector {
    async fn offer(&self, events: LinkEvents) -> Result<(Arc<dyn Link>, Vec<u8>)> {
        let pc = self.peer_connection(&events).await?;

        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = pc.create_data_channel(CHANNEL_LABEL, Some(init)).await?;
        attach_channel(&dc, events);

        let offer = pc.create_offer(None).await?;
        let payload = self.gather(&pc, offer).await?;

        let link = WebRtcLink {
            pc,
            channel: Arc::new(RwLock::new(Some(dc))),
        };
        Ok((Arc::new(link), payload))
    }

    async fn answer(&self, offer: &[u8], events: LinkEvents) -> Result<(Arc<dyn Link>, Vec<u8>)> {
        let remote = parse_description(offer)?;
        let pc = self.peer_connection(&events).await?;

        let channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>> = Arc::new(RwLock::new(None));
        let slot = channel.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let slot = slot.clone();
            let events = events.clone();
            Box::pin(async move {
                if dc.label() != CHANNEL_LABEL {
                    warn!("ignoring unexpected data channel '{}'", dc.label());
                    return;
                }
                *slot.write().await = Some(dc.clone());
                attach_channel(&dc, events);
            })
        }));

        pc.set_remote_description(remote).await?;
        let answer = pc.create_answer(None).await?;
        let payload = self.gather(&pc, answer).await?;

        Ok((Arc::new(WebRtcLink { pc, channel }), payload))
    }
}

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
}

/// Waits until the SCTP send buffer can take `next` more bytes.
async fn wait_for_buffer_space(dc: &Arc<RTCDataChannel>, next: usize) -> Result<()> {
    let deadline = tokio::time::Instant::now() + BACKPRESSURE_MAX_WAIT;
    loop {
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(TelekinesisError::Transport(format!(
                "data channel is {}",
                dc.ready_state()
            )));
        }
        if dc.buffered_amount().await + next <= BUFFERED_AMOUNT_HIGH {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("send buffer did not drain in time, sending anyway");
            return Ok(());
        }
        tokio::time::sleep(BACKPRESSURE_POLL).await;
    }
}

#[async_trait]
impl Link for WebRtcLink {
    async fn apply_answer(&self, answer: &[u8]) -> Result<()> {
        let remote = parse_description(answer)?;
        self.pc.set_remote_description(remote).await?;
        Ok(())
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        let dc = self
            .channel
            .read()
            .await
            .clone()
            .ok_or_else(|| TelekinesisError::Transport("data channel not ready".into()))?;
        wait_for_buffer_space(&dc, frame.len()).await?;
        dc.send(&frame).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("error closing peer connection: {e}");
        }
    }
}
