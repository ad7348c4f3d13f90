//! Wire types exchanged with the `FileSystem.Logs` streaming handler.
//!
//! These are serialized as JSON frames (see [`super::codec`]). The bridge
//! encodes one [`LogsRequest`] and then decodes a sequence of
//! [`StreamResult`]s until end-of-stream or an error.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CodedError;

/// Which task log to stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Stdout,
    Stderr,
}

impl LogType {
    pub fn as_str(self) -> &'static str {
        match self {
            LogType::Stdout => "stdout",
            LogType::Stderr => "stderr",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(LogType::Stdout),
            "stderr" => Ok(LogType::Stderr),
            _ => Err(()),
        }
    }
}

/// Reference point an offset is applied from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    #[default]
    Start,
    End,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Start => "start",
            Origin::End => "end",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Origin::Start),
            "end" => Ok(Origin::End),
            _ => Err(()),
        }
    }
}

/// Request to stream a task's log.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsRequest {
    pub alloc_id: String,
    pub task: String,
    pub log_type: LogType,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub plain_text: bool,
    #[serde(default)]
    pub follow: bool,
    #[serde(default)]
    pub auth_token: String,
}

impl LogsRequest {
    pub fn new(alloc_id: impl Into<String>, task: impl Into<String>, log_type: LogType) -> Self {
        Self {
            alloc_id: alloc_id.into(),
            task: task.into(),
            log_type,
            offset: 0,
            origin: Origin::Start,
            plain_text: false,
            follow: false,
            auth_token: String::new(),
        }
    }
}

impl fmt::Debug for LogsRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = if self.auth_token.is_empty() {
            ""
        } else {
            "[REDACTED]"
        };
        f.debug_struct("LogsRequest")
            .field("alloc_id", &self.alloc_id)
            .field("task", &self.task)
            .field("log_type", &self.log_type)
            .field("offset", &self.offset)
            .field("origin", &self.origin)
            .field("plain_text", &self.plain_text)
            .field("follow", &self.follow)
            .field("auth_token", &token)
            .finish()
    }
}

/// Failure reported by the streaming handler itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamError {
    #[serde(default)]
    pub code: Option<i64>,
    pub message: String,
}

impl StreamError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    /// The terminal coded error for this failure. An uncoded failure is a 500.
    pub fn to_coded(&self) -> CodedError {
        match self.code {
            Some(code) => CodedError::from_wire(code, self.message.clone()),
            None => CodedError::new(500, self.message.clone()),
        }
    }
}

impl From<&CodedError> for StreamError {
    fn from(err: &CodedError) -> Self {
        Self::new(i64::from(err.code()), err.message())
    }
}

/// One result on a log stream: payload bytes, or a terminating error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamResult {
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StreamError>,
}

impl StreamResult {
    pub fn payload(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            error: None,
        }
    }

    pub fn failure(code: i64, message: impl Into<String>) -> Self {
        Self {
            payload: Vec::new(),
            error: Some(StreamError::new(code, message)),
        }
    }
}

/// Serde adapter encoding byte payloads as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(bytes: &T, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
