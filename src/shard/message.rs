//! Shard RPC surface
//!
//! The semantic contract between the gateway and a shard backend. Any
//! non-`Succeed` status in a response surfaces as a shard-level error
//! to the fan-out.

use crate::schema::{Matcher, Series};
use serde::{Deserialize, Serialize};

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Succeed,
    Failed,
}

impl Default for StatusCode {
    fn default() -> Self {
        StatusCode::Succeed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectRequest {
    pub mint: i64,
    pub maxt: i64,
    /// Query resolution step in milliseconds
    pub interval: i64,
    pub matchers: Vec<Matcher>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectResponse {
    pub status: StatusCode,
    pub series: Vec<Series>,
    #[serde(default)]
    pub error_msg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelValuesRequest {
    pub name: String,
    pub matchers: Vec<Matcher>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelValuesResponse {
    pub status: StatusCode,
    pub values: Vec<String>,
    #[serde(default)]
    pub error_msg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddRequest {
    pub series: Vec<Series>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralResponse {
    pub status: StatusCode,
    #[serde(default)]
    pub message: String,
}

impl GeneralResponse {
    pub fn succeed() -> Self {
        Self {
            status: StatusCode::Succeed,
            message: String::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::Failed,
            message: message.into(),
        }
    }
}

/// Replication control command. An empty `master_addr` means
/// "slave of no one": the receiver promotes itself to master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveOfCommand {
    #[serde(default)]
    pub master_addr: String,
}

impl SlaveOfCommand {
    pub fn no_one() -> Self {
        Self {
            master_addr: String::new(),
        }
    }
}

/// Typed request envelope written to a shard connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Select(SelectRequest),
    LabelValues(LabelValuesRequest),
    Add(AddRequest),
    SlaveOf(SlaveOfCommand),
}

/// Typed response envelope read back from a shard connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Select(SelectResponse),
    LabelValues(LabelValuesResponse),
    General(GeneralResponse),
}
