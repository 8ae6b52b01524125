pub mod client;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod http_server;
pub mod manager;
pub mod models;
pub mod mux;
pub mod session;
pub mod transfer;
pub mod transport;

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    net::TcpListener,
    sync::watch,
    task::JoinHandle,
};

use crate::{
    config::Config,
    error::Result,
    events::EventLog,
    manager::{SessionHandle, SessionManager},
    transport::{webrtc::WebRtcConnector, Connector},
};

pub const DEFAULT_PORT: u16 = 5000;

/// One peer: the session manager, its event log and the control API that
/// exposes them.
#[derive(Clone)]
pub struct PeerService {
    pub config: Config,
    pub session: SessionHandle,
    pub events: Arc<EventLog>,
    stop: Arc<watch::Sender<bool>>,
}

impl PeerService {
    /// A service that connects to peers over WebRTC.
    pub fn new(config: Config) -> Self {
        let connector = WebRtcConnector::new(
            config.ice_servers.clone(),
            config.session.ice_gather_timeout(),
        );
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Self {
        let events = Arc::new(EventLog::new(config.events.backlog));
        let session = SessionManager::spawn(
            connector,
            config.session.clone(),
            config.download_dir.clone(),
            events.clone(),
        );
        Self {
            config,
            session,
            events,
            stop: Arc::new(watch::Sender::new(false)),
        }
    }

    /// Starts the control API on `addr` and returns the address actually
    /// bound, which matters when the port is 0.
    pub async fn bind(&self, addr: SocketAddr) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        let service = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = service.serve(listener).await {
                log::error!("control API stopped with an error: {e}");
            }
        });
        log::info!("control API listening on http://{local}");
        Ok((local, handle))
    }

    /// Starts the control API on the configured address.
    pub async fn start(&self) -> Result<(SocketAddr, JoinHandle<()>)> {
        self.bind(self.config.listen_addr).await
    }

    /// Stops the control API, ends open event streams and tears the session
    /// down.
    pub async fn stop(&self) {
        self.stop.send_replace(true);
        self.session.shutdown().await;
    }

    pub(crate) fn stopped(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }
}
