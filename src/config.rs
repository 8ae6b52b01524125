use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, TelekinesisError},
    DEFAULT_PORT,
};

pub const CONFIG_FILE: &str = "telekinesis.toml";
pub const ENV_PREFIX: &str = "TELEKINESIS_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub download_dir: PathBuf,
    pub data_dir: PathBuf,
    pub ice_servers: Vec<String>,
    pub max_upload_bytes: usize,
    pub session: SessionConfig,
    pub events: EventConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub chunk_size: u32,
    pub negotiation_timeout_secs: u64,
    pub ice_gather_timeout_secs: u64,
    pub progress_interval_ms: u64,
    pub max_descriptor_bytes: usize,
    /// Inbound chunks queued ahead of the storage writer before a transfer
    /// is given up as too slow.
    pub inbound_chunk_buffer: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    pub heartbeat_interval_secs: u64,
    pub backlog: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            download_dir: PathBuf::from("telekinesis-downloads"),
            data_dir: std::env::temp_dir().join("telekinesis"),
            ice_servers: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun.cloudflare.com:3478".into(),
            ],
            max_upload_bytes: 1024 * 1024 * 1024,
            session: SessionConfig::default(),
            events: EventConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            negotiation_timeout_secs: 30,
            ice_gather_timeout_secs: 10,
            progress_interval_ms: 250,
            max_descriptor_bytes: crate::descriptor::MAX_DESCRIPTOR_BYTES,
            inbound_chunk_buffer: 1024,
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            backlog: 1024,
        }
    }
}

impl SessionConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn ice_gather_timeout(&self) -> Duration {
        Duration::from_secs(self.ice_gather_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

impl EventConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

impl Config {
    /// Loads `telekinesis.toml` from the user's config directory, writing the
    /// defaults there on first run.
    pub fn new() -> Result<Self> {
        let dirs = directories::BaseDirs::new().ok_or(TelekinesisError::NoHomeDir)?;

        let config_file = dirs.config_dir().join(CONFIG_FILE);
        let defaults = Self {
            download_dir: dirs.home_dir().join("telekinesis-downloads"),
            data_dir: dirs.data_local_dir().join("telekinesis"),
            ..Default::default()
        };

        if !config_file.exists() {
            log::info!("creating config file at {config_file:?}");
            if let Some(parent) = config_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&config_file, toml::to_string(&defaults)?)?;
        }

        let config = Self::figment(defaults, &config_file)
            .extract()
            .map_err(Box::new)?; // boxed because the error size from figment is large

        log::info!("using config: {config:?}");
        Ok(config)
    }

    /// Like [`Config::new`] but reads an explicit file, which does not have to
    /// exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::info!("reading config from {path:?}");
        let defaults = match directories::BaseDirs::new() {
            Some(dirs) => Self {
                download_dir: dirs.home_dir().join("telekinesis-downloads"),
                data_dir: dirs.data_local_dir().join("telekinesis"),
                ..Default::default()
            },
            None => Self::default(),
        };
        Ok(Self::figment(defaults, path)
            .extract()
            .map_err(Box::new)?)
    }

    fn figment(defaults: Self, file: &Path) -> Figment {
        Figment::from(Serialized::defaults(defaults))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }
}
