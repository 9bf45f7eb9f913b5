//! Wire formats for the streaming endpoints
//!
//! Text frames on `/api/subscribe` carry JSON envelopes. The byte oriented
//! endpoints prefix every frame with a one byte tag: binary frames for exec,
//! text frames for logs and pull.

use std::borrow::Cow;

use axum::extract::ws::{CloseFrame, Message};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::value::RawValue;

/// Client-chosen subscription identifier. Unique per connection by convention only.
pub type Token = u64;

pub const TAG_INPUT: u8 = b'1';
pub const TAG_RESIZE: u8 = b'r';
pub const TAG_STDOUT: u8 = b'1';
pub const TAG_STDERR: u8 = b'2';
pub const TAG_PROGRESS: u8 = b'0';
pub const TAG_SUCCESS: u8 = b's';
pub const TAG_ERROR: u8 = b'e';

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_INTERNAL: u16 = 1011;
pub const CLOSE_PULL_FAILED: u16 = 4000;
pub const CLOSE_AUTH_FAILED: u16 = 4001;
pub const CLOSE_CREATE_FAILED: u16 = 4002;

/// Control frames cap their payload at 125 bytes, two of which hold the code.
pub const MAX_CLOSE_REASON: usize = 123;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid request: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing request data")]
    MissingPayload,

    #[error("malformed data")]
    UnknownTag(u8),

    #[error("malformed data")]
    BadResizeLength(usize),
}

#[derive(Debug, Deserialize)]
pub struct RequestEnvelope {
    pub index: Token,
    pub action: String,
    #[serde(default)]
    pub data: Option<Box<RawValue>>,
}

impl RequestEnvelope {
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decodes the action specific payload, which must be present.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        match &self.data {
            Some(raw) => Ok(serde_json::from_str(raw.get())?),
            None => Err(CodecError::MissingPayload),
        }
    }

    /// Like [`payload`](Self::payload) but absent or `null` data yields `None`.
    pub fn optional_payload<T: DeserializeOwned>(&self) -> Result<Option<T>, CodecError> {
        match &self.data {
            Some(raw) => Ok(serde_json::from_str(raw.get())?),
            None => Ok(None),
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub index: Token,
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
    pub data: Value,
}

impl ResponseEnvelope {
    pub fn data(index: Token, data: Value) -> Self {
        Self {
            index,
            error: false,
            data,
        }
    }

    /// Terminal failure of the subscription identified by `index`.
    pub fn error(index: Token, message: impl ToString) -> Self {
        Self {
            index,
            error: true,
            data: Value::String(message.to_string()),
        }
    }

    /// Terminal success of a subscription that has nothing more to say.
    pub fn done(index: Token) -> Self {
        Self::data(index, Value::Null)
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Binary frames a client may send to an interactive exec session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Input(Vec<u8>),
    Resize { width: u16, height: u16 },
}

impl ClientFrame {
    /// Empty frames carry nothing and decode to `None`.
    pub fn decode(frame: &[u8]) -> Result<Option<Self>, CodecError> {
        let Some((&tag, body)) = frame.split_first() else {
            return Ok(None);
        };

        match tag {
            TAG_INPUT => Ok(Some(ClientFrame::Input(body.to_vec()))),
            TAG_RESIZE => {
                if frame.len() != 5 {
                    return Err(CodecError::BadResizeLength(frame.len()));
                }
                Ok(Some(ClientFrame::Resize {
                    width: u16::from_be_bytes([body[0], body[1]]),
                    height: u16::from_be_bytes([body[2], body[3]]),
                }))
            }
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

pub fn tagged(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(tag);
    frame.extend_from_slice(payload);
    frame
}

/// Cuts `reason` to at most [`MAX_CLOSE_REASON`] bytes on a char boundary.
pub fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

pub fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Owned(truncate_reason(reason).to_string()),
    }))
}
