use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{collections::BTreeMap, fmt};

#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy)]
#[repr(u8)]
pub enum MessageType {
    Session = 1,
    Fetch = 2,
    Report = 3,
}

#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy)]
#[repr(u8)]
pub enum MessageStatus {
    Request = 1,
    Ok = 2,
    Fail = 3,
}

/// Name and configuration of a tuning session, only present on session messages
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SessionSignature {
    pub name: String,
    #[serde(default)]
    pub cfg: BTreeMap<String, String>,
}

/// One typed coordinate of a candidate point
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Real(f64),
    Str(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Real(value) => write!(f, "{value}"),
            Self::Str(value) => f.write_str(value),
        }
    }
}

/// Payload exchanged with the search server.
///
/// The framing layer treats the encoded form as opaque bytes, only the dispatcher looks at
/// `session` (init messages) and `point` (fetch requests).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionSignature>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub point: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub performance: Vec<f64>,
}

impl Message {
    #[cfg(test)]
    pub fn session(signature: SessionSignature) -> Self {
        Self {
            kind: MessageType::Session,
            status: MessageStatus::Request,
            session: Some(signature),
            point: Vec::new(),
            performance: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn fetch(point: Vec<Value>) -> Self {
        Self {
            kind: MessageType::Fetch,
            status: MessageStatus::Request,
            session: None,
            point,
            performance: Vec::new(),
        }
    }

    /// the same message, marked as successfully handled
    pub fn acknowledged(mut self) -> Self {
        self.status = MessageStatus::Ok;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_yaml::Error> {
        serde_yaml::to_string(self).map(String::into_bytes)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_slice(payload)
    }
}
