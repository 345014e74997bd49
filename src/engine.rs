/// Remote engine: the isolated component that actually persists rows.
///
/// The adapter only talks to it through `RemoteEngine::post`; replies come
/// back as encoded frames on the reply channel handed over at launch.
/// Two hosts are provided:
/// 1. ThreadedEngine: dedicated OS thread, frames over a channel
/// 2. InlineEngine: same engine in-process, for hosts without threads
///
/// Both run an `EngineCore`, an in-memory ordered row store.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::EngineMode;
use crate::error::{Result, TetherError};
use crate::protocol::{self, DeleteTarget, EngineCommand, EngineReply, ReplyPayload};
use crate::types::{DbKey, Row};

/// Channel the engine emits encoded replies on.
pub type ReplySender = mpsc::UnboundedSender<Bytes>;
pub type ReplyReceiver = mpsc::UnboundedReceiver<Bytes>;

#[async_trait]
pub trait RemoteEngine: Send + Sync {
    /// Hand a command to the engine. Returns once it has been queued;
    /// never waits for the reply.
    async fn post(&self, command: EngineCommand) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Start the engine host selected by `mode`.
pub fn launch(mode: EngineMode, core: EngineCore, replies: ReplySender) -> Result<Arc<dyn RemoteEngine>> {
    let engine: Arc<dyn RemoteEngine> = match mode {
        EngineMode::Threaded => Arc::new(ThreadedEngine::spawn(core, replies)?),
        EngineMode::Inline => Arc::new(InlineEngine::new(core, replies)),
    };
    info!("Launched {} remote engine", engine.name());
    Ok(engine)
}

/// In-memory row store executing engine commands.
#[derive(Debug, Default)]
pub struct EngineCore {
    instance_id: Option<String>,
    primary_keys: BTreeMap<String, String>,
    tables: HashMap<String, BTreeMap<DbKey, Row>>,
}

impl EngineCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload rows, as if left over from an earlier session.
    pub fn seed(&mut self, table: &str, primary_key: &str, rows: Vec<Row>) -> Result<()> {
        self.primary_keys.insert(table.to_string(), primary_key.to_string());
        let store = self.tables.entry(table.to_string()).or_default();
        for row in rows {
            let key = row
                .get(primary_key)
                .and_then(DbKey::from_value)
                .ok_or_else(|| TetherError::MissingPrimaryKey { table: table.to_string() })?;
            store.insert(key, row);
        }
        Ok(())
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, BTreeMap::len)
    }

    pub fn handle(&mut self, command: EngineCommand) -> EngineReply {
        let id = command.id();
        debug!("Engine: {} {}", command.kind(), id);
        let payload = match self.execute(command) {
            Ok(payload) => payload,
            Err(reason) => ReplyPayload::Failed { reason },
        };
        EngineReply::new(id, payload)
    }

    /// Decode a command frame, execute it and encode the reply.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Result<Bytes> {
        let command = protocol::decode_command(frame)?;
        protocol::encode(&self.handle(command))
    }

    fn execute(&mut self, command: EngineCommand) -> std::result::Result<ReplyPayload, String> {
        match command {
            EngineCommand::Setup { primary_keys, instance_id, .. } => {
                info!("Engine: setup for instance {} ({} tables)", instance_id, primary_keys.len());
                self.instance_id = Some(instance_id);
                let mut keys = BTreeMap::new();
                for (table, field) in primary_keys {
                    let store = self.tables.entry(table.clone()).or_default();
                    keys.insert(table.clone(), store.keys().cloned().collect());
                    self.primary_keys.insert(table, field);
                }
                Ok(ReplyPayload::Ready { keys })
            }
            EngineCommand::Write { table, row, .. } => {
                let field = self.primary_key(&table)?.to_string();
                let key = row
                    .get(&field)
                    .and_then(DbKey::from_value)
                    .ok_or_else(|| format!("row for '{}' has no usable '{}' field", table, field))?;
                self.table_mut(&table)?.insert(key, row);
                Ok(ReplyPayload::Ack)
            }
            EngineCommand::Read { table, key, .. } => {
                let row = self.table(&table)?.get(&key).cloned();
                Ok(ReplyPayload::Row { row })
            }
            EngineCommand::Delete { table, target, .. } => {
                let store = self.table_mut(&table)?;
                match target {
                    DeleteTarget::Key(key) => {
                        store.remove(&key);
                    }
                    DeleteTarget::Clear => store.clear(),
                }
                Ok(ReplyPayload::Ack)
            }
            EngineCommand::ReadRange { table, from, to, .. } => {
                let store = self.table(&table)?;
                // BTreeMap::range panics on an inverted range.
                let rows = if from > to {
                    Vec::new()
                } else {
                    store.range(from..=to).map(|(_, row)| row.clone()).collect()
                };
                Ok(ReplyPayload::Rows { rows })
            }
        }
    }

    fn primary_key(&self, table: &str) -> std::result::Result<&str, String> {
        self.primary_keys
            .get(table)
            .map(String::as_str)
            .ok_or_else(|| format!("table '{}' was never set up", table))
    }

    fn table(&self, table: &str) -> std::result::Result<&BTreeMap<DbKey, Row>, String> {
        self.tables
            .get(table)
            .ok_or_else(|| format!("table '{}' was never set up", table))
    }

    fn table_mut(&mut self, table: &str) -> std::result::Result<&mut BTreeMap<DbKey, Row>, String> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| format!("table '{}' was never set up", table))
    }
}

/// Engine running on its own OS thread. Nothing is shared with the
/// adapter; commands and replies cross as encoded frames.
pub struct ThreadedEngine {
    commands: mpsc::UnboundedSender<Bytes>,
}

impl ThreadedEngine {
    pub fn spawn(mut core: EngineCore, replies: ReplySender) -> Result<Self> {
        let (commands, mut inbox) = mpsc::unbounded_channel::<Bytes>();

        thread::Builder::new()
            .name("tether-engine".to_string())
            .spawn(move || {
                debug!("Engine thread started");
                while let Some(frame) = inbox.blocking_recv() {
                    match core.handle_frame(&frame) {
                        Ok(reply) => {
                            if replies.send(reply).is_err() {
                                debug!("Engine thread: reply channel closed");
                                break;
                            }
                        }
                        Err(e) => warn!("Engine thread: dropping malformed command frame: {}", e),
                    }
                }
                debug!("Engine thread stopped");
            })?;

        Ok(Self { commands })
    }
}

#[async_trait]
impl RemoteEngine for ThreadedEngine {
    async fn post(&self, command: EngineCommand) -> Result<()> {
        let frame = protocol::encode(&command)?;
        self.commands
            .send(frame)
            .map_err(|_| TetherError::EngineDisconnected)
    }

    fn name(&self) -> &'static str {
        "threaded"
    }
}

/// Engine running in-process behind the same interface.
///
/// Commands still go through the frame codec and replies still come back
/// on the reply channel, so callers see the same asynchronous behaviour.
pub struct InlineEngine {
    core: Mutex<EngineCore>,
    replies: ReplySender,
}

impl InlineEngine {
    pub fn new(core: EngineCore, replies: ReplySender) -> Self {
        Self {
            core: Mutex::new(core),
            replies,
        }
    }
}

#[async_trait]
impl RemoteEngine for InlineEngine {
    async fn post(&self, command: EngineCommand) -> Result<()> {
        let frame = protocol::encode(&command)?;
        let reply = self.core.lock().handle_frame(&frame)?;
        self.replies
            .send(reply)
            .map_err(|_| TetherError::EngineDisconnected)
    }

    fn name(&self) -> &'static str {
        "inline"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::CorrelationId;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn setup(core: &mut EngineCore, table: &str) -> EngineReply {
        let mut primary_keys = BTreeMap::new();
        primary_keys.insert(table.to_string(), "id".to_string());
        core.handle(EngineCommand::Setup {
            id: CorrelationId::new(),
            primary_keys,
            instance_id: "test".into(),
        })
    }

    #[test]
    fn test_setup_reports_seeded_keys() {
        let mut core = EngineCore::new();
        core.seed("t", "id", vec![row(json!({"id": 3})), row(json!({"id": 1}))])
            .unwrap();
        let reply = setup(&mut core, "t");
        match reply.payload {
            ReplyPayload::Ready { keys } => {
                assert_eq!(keys["t"], vec![DbKey::Int(1), DbKey::Int(3)]);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
        assert_eq!(core.instance_id(), Some("test"));
    }

    #[test]
    fn test_write_read_range_and_clear() {
        let mut core = EngineCore::new();
        setup(&mut core, "t");
        for i in 1..=5 {
            let reply = core.handle(EngineCommand::Write {
                id: CorrelationId::new(),
                table: "t".into(),
                row: row(json!({"id": i, "n": i * 10})),
            });
            assert_eq!(reply.payload, ReplyPayload::Ack);
        }

        let reply = core.handle(EngineCommand::ReadRange {
            id: CorrelationId::new(),
            table: "t".into(),
            from: DbKey::Int(2),
            to: DbKey::Int(4),
        });
        match reply.payload {
            ReplyPayload::Rows { rows } => {
                let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
                assert_eq!(ids, vec![json!(2), json!(3), json!(4)]);
            }
            other => panic!("unexpected payload: {:?}", other),
        }

        core.handle(EngineCommand::Delete {
            id: CorrelationId::new(),
            table: "t".into(),
            target: DeleteTarget::Clear,
        });
        assert_eq!(core.row_count("t"), 0);
    }

    #[test]
    fn test_fractional_keys_are_rejected() {
        let mut core = EngineCore::new();
        let err = core
            .seed("t", "id", vec![row(json!({"id": 2.5}))])
            .unwrap_err();
        assert!(matches!(err, TetherError::MissingPrimaryKey { .. }));

        setup(&mut core, "t");
        let reply = core.handle(EngineCommand::Write {
            id: CorrelationId::new(),
            table: "t".into(),
            row: row(json!({"id": 2.5})),
        });
        assert!(matches!(reply.payload, ReplyPayload::Failed { .. }));
        assert_eq!(core.row_count("t"), 0);
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let mut core = EngineCore::new();
        setup(&mut core, "t");
        let reply = core.handle(EngineCommand::ReadRange {
            id: CorrelationId::new(),
            table: "t".into(),
            from: DbKey::Int(9),
            to: DbKey::Int(1),
        });
        assert_eq!(reply.payload, ReplyPayload::Rows { rows: Vec::new() });
    }

    #[test]
    fn test_unknown_table_and_keyless_row_fail() {
        let mut core = EngineCore::new();
        let reply = core.handle(EngineCommand::Read {
            id: CorrelationId::new(),
            table: "missing".into(),
            key: DbKey::Int(1),
        });
        assert!(matches!(reply.payload, ReplyPayload::Failed { .. }));

        setup(&mut core, "t");
        let reply = core.handle(EngineCommand::Write {
            id: CorrelationId::new(),
            table: "t".into(),
            row: row(json!({"name": "no key"})),
        });
        assert!(matches!(reply.payload, ReplyPayload::Failed { .. }));
    }

    #[tokio::test]
    async fn test_threaded_engine_replies_over_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = launch(EngineMode::Threaded, EngineCore::new(), tx).unwrap();
        let id = CorrelationId::new();
        engine
            .post(EngineCommand::Setup {
                id,
                primary_keys: BTreeMap::new(),
                instance_id: "threaded".into(),
            })
            .await
            .unwrap();

        let frame = rx.recv().await.unwrap();
        let reply = protocol::decode_reply(&frame).unwrap();
        assert_eq!(reply.id, id);
        assert!(matches!(reply.payload, ReplyPayload::Ready { .. }));
    }

    #[tokio::test]
    async fn test_inline_engine_replies_over_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = launch(EngineMode::Inline, EngineCore::new(), tx).unwrap();
        let id = CorrelationId::new();
        engine
            .post(EngineCommand::Read {
                id,
                table: "nope".into(),
                key: DbKey::Int(1),
            })
            .await
            .unwrap();

        let reply = protocol::decode_reply(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply.id, id);
        assert!(matches!(reply.payload, ReplyPayload::Failed { .. }));
    }
}
