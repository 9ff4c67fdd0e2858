//! Chat message and its wire encoding.
//!
//! On the wire a message is a JSON object with two string fields,
//! `username` and `message`.

use serde::{Deserialize, Serialize};

use super::error::CodecError;

/// The unit of data exchanged between clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "username")]
    sender: String,
    #[serde(rename = "message")]
    body: String,
}

impl Message {
    pub fn new(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
        }
    }

    /// Identity of the client that sent the message
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Text body
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Encode to the JSON wire form
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(CodecError::Encode)
    }

    /// Decode from the JSON wire form
    ///
    /// Unknown fields are ignored; both `username` and `message` must be
    /// present and be strings.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        serde_json::from_str(text).map_err(CodecError::Decode)
    }
}
