/// Messages exchanged with the remote engine.
///
/// Commands and replies only ever cross the engine boundary as encoded
/// frames: newline-free JSON documents carried in `Bytes`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::broker::CorrelationId;
use crate::error::{Result, TetherError};
use crate::types::{DbKey, Row};

/// What a delete command removes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteTarget {
    Key(DbKey),
    /// Every row of the table.
    Clear,
}

/// Commands accepted by the remote engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "do", rename_all = "snake_case")]
pub enum EngineCommand {
    Setup {
        id: CorrelationId,
        /// Table name to primary-key field name
        primary_keys: BTreeMap<String, String>,
        instance_id: String,
    },
    Write {
        id: CorrelationId,
        table: String,
        row: Row,
    },
    Read {
        id: CorrelationId,
        table: String,
        key: DbKey,
    },
    Delete {
        id: CorrelationId,
        table: String,
        target: DeleteTarget,
    },
    /// Every row whose key lies in `from..=to`, ascending.
    ReadRange {
        id: CorrelationId,
        table: String,
        from: DbKey,
        to: DbKey,
    },
}

impl EngineCommand {
    pub fn id(&self) -> CorrelationId {
        match self {
            EngineCommand::Setup { id, .. }
            | EngineCommand::Write { id, .. }
            | EngineCommand::Read { id, .. }
            | EngineCommand::Delete { id, .. }
            | EngineCommand::ReadRange { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineCommand::Setup { .. } => "setup",
            EngineCommand::Write { .. } => "write",
            EngineCommand::Read { .. } => "read",
            EngineCommand::Delete { .. } => "delete",
            EngineCommand::ReadRange { .. } => "read_range",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyPayload {
    /// Setup finished; existing keys per table.
    Ready { keys: BTreeMap<String, Vec<DbKey>> },
    Ack,
    /// `None` when the key is absent.
    Row { row: Option<Row> },
    Rows { rows: Vec<Row> },
    Failed { reason: String },
}

impl ReplyPayload {
    /// Turn an engine-reported failure into an error for the requester.
    pub fn into_result(self, id: CorrelationId) -> Result<ReplyPayload> {
        match self {
            ReplyPayload::Failed { reason } => Err(TetherError::RemoteEngine {
                id: id.to_string(),
                reason,
            }),
            other => Ok(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineReply {
    pub id: CorrelationId,
    pub payload: ReplyPayload,
}

impl EngineReply {
    pub fn new(id: CorrelationId, payload: ReplyPayload) -> Self {
        Self { id, payload }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode_command(frame: &[u8]) -> Result<EngineCommand> {
    Ok(serde_json::from_slice(frame)?)
}

pub fn decode_reply(frame: &[u8]) -> Result<EngineReply> {
    Ok(serde_json::from_slice(frame)?)
}
