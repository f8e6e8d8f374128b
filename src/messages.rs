use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

use crate::registry::Identity;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "announce")]
    Announce {
        username: String,
        color: String,
        #[serde(default, alias = "profilePic")]
        avatar: Option<String>,
    },
    #[serde(rename = "typing")]
    Typing {
        #[serde(alias = "isTyping")]
        is_typing: bool,
    },
    #[serde(rename = "send_message", alias = "sendMessage")]
    SendMessage {
        #[serde(default)]
        text: String,
        #[serde(default)]
        file: Option<FilePayload>,
        /// Author identity attached by the browser client.
        #[serde(default)]
        user: Option<Identity>,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "roster_updated")]
    RosterUpdated { usernames: Vec<String> },
    #[serde(rename = "typing_updated")]
    TypingUpdated { username: String, is_typing: bool },
    #[serde(rename = "message_broadcast")]
    MessageBroadcast { message: Arc<ChatMessage> },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub id: Uuid,
    /// Snapshot of the sender's identity at send time.
    pub author: Identity,
    pub text: String,
    pub file: Option<FilePayload>,
    pub mentions: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FilePayloadError {
    #[error("Not a data URL")]
    NotDataUrl,
    #[error("Only base64 data URLs are supported")]
    NotBase64,
    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(String),
}

/// An attached file. On the wire the bytes travel base64 encoded, either as
/// `{"media_type", "data"}` or as a `data:` URL.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(try_from = "FilePayloadWire")]
pub struct FilePayload {
    pub media_type: String,
    #[serde(rename = "data", serialize_with = "serialize_base64")]
    pub bytes: Vec<u8>,
}

impl FilePayload {
    pub fn new(media_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        FilePayload {
            media_type: media_type.into(),
            bytes,
        }
    }

    pub fn from_data_url(url: &str) -> Result<Self, FilePayloadError> {
        let rest = url.strip_prefix("data:").ok_or(FilePayloadError::NotDataUrl)?;
        let (header, payload) = rest.split_once(',').ok_or(FilePayloadError::NotDataUrl)?;
        let header = header
            .strip_suffix(";base64")
            .ok_or(FilePayloadError::NotBase64)?;

        let media_type = if header.is_empty() {
            "text/plain".to_string()
        } else {
            header.to_string()
        };
        let bytes = BASE64
            .decode(payload)
            .map_err(|e| FilePayloadError::InvalidBase64(e.to_string()))?;

        Ok(FilePayload { media_type, bytes })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FilePayloadWire {
    DataUrl(String),
    Inline {
        #[serde(alias = "mediaType")]
        media_type: String,
        #[serde(deserialize_with = "deserialize_base64")]
        data: Vec<u8>,
    },
}

impl TryFrom<FilePayloadWire> for FilePayload {
    type Error = FilePayloadError;

    fn try_from(wire: FilePayloadWire) -> Result<Self, Self::Error> {
        match wire {
            FilePayloadWire::DataUrl(url) => FilePayload::from_data_url(&url),
            FilePayloadWire::Inline { media_type, data } => Ok(FilePayload {
                media_type,
                bytes: data,
            }),
        }
    }
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(bytes))
}

fn deserialize_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    BASE64.decode(encoded).map_err(serde::de::Error::custom)
}
