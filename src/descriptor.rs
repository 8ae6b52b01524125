//! Text form of the signaling descriptors that users copy between machines.
//!
//! A descriptor is rendered as `tk1.` followed by unpadded URL-safe base64 of
//! its JSON form, so it survives clipboards, chat windows and downloaded
//! files without control characters or line breaks.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, TelekinesisError},
    models::Role,
};

pub const DESCRIPTOR_PREFIX: &str = "tk1.";
pub const MAX_DESCRIPTOR_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub role: Role,
    #[serde(with = "payload_b64")]
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl SessionDescriptor {
    pub fn new(role: Role, payload: Vec<u8>) -> Self {
        Self {
            role,
            payload,
            created_at: Utc::now(),
        }
    }
}

pub fn encode(descriptor: &SessionDescriptor) -> Result<String> {
    let json = serde_json::to_vec(descriptor)?;
    Ok(format!("{DESCRIPTOR_PREFIX}{}", URL_SAFE_NO_PAD.encode(json)))
}

pub fn decode(text: &str) -> Result<SessionDescriptor> {
    decode_with_limit(text, MAX_DESCRIPTOR_BYTES)
}

pub fn decode_with_limit(text: &str, max_len: usize) -> Result<SessionDescriptor> {
    let text = text.trim();
    if text.is_empty() {
        return Err(TelekinesisError::Decode("descriptor is empty".into()));
    }
    if text.len() > max_len {
        return Err(TelekinesisError::Decode(format!(
            "descriptor is {} bytes, limit is {max_len}",
            text.len()
        )));
    }
    let Some(body) = text.strip_prefix(DESCRIPTOR_PREFIX) else {
        return Err(TelekinesisError::Decode(
            "not a telekinesis descriptor".into(),
        ));
    };
    let json = URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|e| TelekinesisError::Decode(format!("invalid encoding: {e}")))?;
    serde_json::from_slice(&json)
        .map_err(|e| TelekinesisError::Decode(format!("invalid contents: {e}")))
}

/// Decodes `text` and insists it was produced by a peer playing `role`.
pub fn decode_expecting(text: &str, role: Role, max_len: usize) -> Result<SessionDescriptor> {
    let descriptor = decode_with_limit(text, max_len)?;
    if descriptor.role != role {
        return Err(TelekinesisError::Decode(format!(
            "expected a descriptor from the {role:?}, got one from the {:?}",
            descriptor.role
        )));
    }
    Ok(descriptor)
}

mod payload_b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
