//! Relay wire protocol: one JSON frame per line.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::messaging::Envelope;

/// Client to relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Publish {
        req: u64,
        topic: String,
        envelope: Envelope,
    },
    /// `consumer` names a durable cursor; resubscribing under the same name
    /// replays everything after the last acknowledged sequence.
    Subscribe {
        req: u64,
        sub: u64,
        topic: String,
        consumer: String,
    },
    Unsubscribe {
        req: u64,
        sub: u64,
    },
    Ack {
        sub: u64,
        seq: u64,
    },
}

/// Relay to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    Ok {
        req: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        #[serde(default)]
        deliveries: usize,
    },
    Error {
        req: u64,
        message: String,
    },
    Deliver {
        sub: u64,
        seq: u64,
        envelope: Envelope,
    },
}

impl ServerFrame {
    /// Request this frame answers; `None` for deliveries.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::Ok { req, .. } | Self::Error { req, .. } => Some(*req),
            Self::Deliver { .. } => None,
        }
    }
}

pub fn encode<T: Serialize>(frame: &T) -> Result<String> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

pub fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line.trim_end())?)
}
