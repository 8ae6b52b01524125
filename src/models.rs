use std::{fmt, path::Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TelekinesisError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    OfferPending,
    AnswerPending,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl SessionState {
    pub const ALL: [SessionState; 7] = [
        SessionState::Idle,
        SessionState::OfferPending,
        SessionState::AnswerPending,
        SessionState::Connecting,
        SessionState::Connected,
        SessionState::Failed,
        SessionState::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::OfferPending => "offer_pending",
            SessionState::AnswerPending => "answer_pending",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatDirection {
    Sent,
    Received,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    pub direction: ChatDirection,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(text: impl Into<String>, direction: ChatDirection) -> Self {
        Self {
            text: text.into(),
            direction,
            timestamp: Utc::now(),
        }
    }
}

/// One file moving through the session, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: Uuid,
    pub direction: Direction,
    pub filename: String,
    pub total_bytes: u64,
    pub bytes_moved: u64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transfer {
    pub fn new(id: Uuid, direction: Direction, filename: String, total_bytes: u64) -> Self {
        Self {
            id,
            direction,
            filename,
            total_bytes,
            bytes_moved: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Moves the byte counter forward to `moved`. Never goes backwards and
    /// never passes `total_bytes`.
    pub fn advance_to(&mut self, moved: u64) -> u64 {
        self.bytes_moved = self.bytes_moved.max(moved.min(self.total_bytes));
        self.bytes_moved
    }

    pub fn progress(&self) -> f64 {
        percent(self.bytes_moved, self.total_bytes)
    }

    pub fn is_sending(&self) -> bool {
        self.direction == Direction::Outbound
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_moved == self.total_bytes
    }

    pub fn complete(&mut self) {
        self.bytes_moved = self.total_bytes;
        self.completed_at = Some(Utc::now());
    }
}

/// Percentage of `total` covered by `moved`, clamped to `[0, 100]`.
/// An empty payload is complete by definition.
pub fn percent(moved: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (moved as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// Announces an inbound file; travels on the file-metadata channel ahead of
/// the first chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: Uuid,
    pub file_name: String,
    pub size: u64,
    pub file_type: String, // mime type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

impl FileMetadata {
    /// Reads size and digest of `path`. Hashing reads the whole file, so call
    /// this off the async executor.
    pub fn from_path(id: Uuid, path: &Path, file_name: &str, chunk_size: u32) -> Result<Self> {
        let metadata = path.metadata()?;
        if !metadata.is_file() {
            return Err(TelekinesisError::BadRequest(format!(
                "{} is not a file",
                path.display()
            )));
        }
        let size = metadata.len();

        let file_type = mime_guess::from_path(file_name)
            .first()
            .map(|mime| mime.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let sha256 = Some(sha256::try_digest(path)?);

        Ok(FileMetadata {
            id,
            file_name: file_name.to_string(),
            size,
            file_type,
            sha256,
            chunk_size,
            total_chunks: total_chunks(size, chunk_size),
        })
    }
}

pub fn total_chunks(size: u64, chunk_size: u32) -> u32 {
    let chunk_size = u64::from(chunk_size.max(1));
    size.div_ceil(chunk_size) as u32
}
