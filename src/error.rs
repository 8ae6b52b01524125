use crate::models::SessionState;

#[derive(Debug, thiserror::Error)]
pub enum TelekinesisError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Request error: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Async join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Malformed descriptor: {0}")]
    Decode(String),

    #[error("Cannot {action} while the session is {state}")]
    InvalidState {
        state: SessionState,
        action: &'static str,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("A transfer is already in progress")]
    AlreadyTransferring,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Session service stopped")]
    ServiceStopped,

    #[error("Control API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Error: could not get $HOME value")]
    NoHomeDir,

    #[error("Could not serialize config")]
    ConfigSerializationFail(#[from] toml::ser::Error),

    #[error("Could not parse config file")]
    ConfigParseError(#[from] Box<figment::Error>),
}

impl TelekinesisError {
    /// Stable tag used in logs and for mapping onto control API status codes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode_error",
            Self::InvalidState { .. } => "invalid_state",
            Self::Protocol(_) => "protocol_error",
            Self::AlreadyTransferring => "already_transferring",
            Self::Transport(_) | Self::WebRtc(_) => "transport_error",
            Self::Storage(_) | Self::IOError(_) => "storage_error",
            Self::BadRequest(_) => "bad_request",
            Self::ServiceStopped => "service_stopped",
            Self::Api { .. } => "api_error",
            _ => "internal_error",
        }
    }

    pub(crate) fn storage(context: &str, e: impl std::fmt::Display) -> Self {
        Self::Storage(format!("{context}: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, TelekinesisError>;
