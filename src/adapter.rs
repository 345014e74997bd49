/// StorageAdapter: uniform row CRUD and range scans over a remote engine
///
/// This is the top-level layer the database engine talks to. Every
/// operation consults the local key index first, then makes one or more
/// correlated round trips to the remote engine:
/// 1. KeyIndex: authoritative key existence and ordering per table
/// 2. CorrelationBroker: matches replies to waiting requests
/// 3. RemoteEngine: executes commands in its own context
/// 4. RangeCursor: paced delivery of range read batches

use dashmap::DashMap;
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::broker::{CorrelationBroker, CorrelationId};
use crate::config::AdapterConfig;
use crate::engine::{self, EngineCore, RemoteEngine, ReplyReceiver};
use crate::error::{Result, TetherError};
use crate::key_index::KeyIndex;
use crate::pagination::{RangeCursor, ScanBounds};
use crate::protocol::{self, DeleteTarget, EngineCommand, EngineReply, ReplyPayload};
use crate::types::{DbKey, Row, TableDefinition};

struct TableState {
    definition: TableDefinition,
    index: KeyIndex,
}

/// Answer to `get_index_snapshot`.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexSnapshot {
    Keys(Vec<DbKey>),
    Length(usize),
}

pub struct StorageAdapter {
    config: AdapterConfig,

    /// Declared tables and their key indexes
    tables: DashMap<String, TableState>,

    /// Requests waiting on a reply
    broker: Arc<CorrelationBroker>,

    engine: Arc<dyn RemoteEngine>,
}

impl StorageAdapter {
    /// Wrap an already running engine.
    ///
    /// `replies` is the channel the engine emits reply frames on. It is
    /// drained by a single dispatcher task, so this must be called inside a
    /// tokio runtime.
    pub fn new(config: AdapterConfig, engine: Arc<dyn RemoteEngine>, replies: ReplyReceiver) -> Result<Self> {
        config.validate()?;
        let broker = Arc::new(CorrelationBroker::new());
        spawn_dispatcher(Arc::clone(&broker), replies);

        Ok(Self {
            config,
            tables: DashMap::new(),
            broker,
            engine,
        })
    }

    /// Launch the configured engine around `core`, declare `definitions`
    /// and wait until the adapter is ready.
    pub async fn open(config: AdapterConfig, core: EngineCore, definitions: Vec<TableDefinition>) -> Result<Self> {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let engine = engine::launch(config.engine_mode, core, reply_tx)?;
        let adapter = Self::new(config, engine, reply_rx)?;
        adapter.initialize(definitions).await?;
        Ok(adapter)
    }

    /// Declare every table, then run the setup handshake.
    pub async fn initialize(&self, definitions: Vec<TableDefinition>) -> Result<()> {
        for definition in definitions {
            self.create_table(definition);
        }
        self.connect().await
    }

    pub fn create_table(&self, definition: TableDefinition) {
        let index = KeyIndex::new(definition.uses_auto_increment());
        let name = definition.name.clone();
        debug!(
            "Declaring table '{}' (key '{}', auto-increment: {})",
            name,
            definition.primary_key,
            index.auto_increment()
        );
        if self.tables.insert(name.clone(), TableState { definition, index }).is_some() {
            warn!("Table '{}' redeclared; its key index was reset", name);
        }
    }

    /// Setup handshake: send every table's key field, then hydrate the key
    /// indexes from the keys the engine already holds.
    pub async fn connect(&self) -> Result<()> {
        info!(
            "Connecting instance {} to {} engine",
            self.config.instance_id,
            self.engine.name()
        );

        let primary_keys: BTreeMap<String, String> = self
            .tables
            .iter()
            .map(|entry| (entry.key().clone(), entry.definition.primary_key.clone()))
            .collect();
        let instance_id = self.config.instance_id.clone();

        let reply = self
            .round_trip(|id| EngineCommand::Setup {
                id,
                primary_keys,
                instance_id,
            })
            .await?;
        let ReplyPayload::Ready { keys } = reply.payload else {
            return Err(unexpected(reply.id, "ready"));
        };

        let mut hydrated = 0;
        for (table, keys) in keys {
            match self.tables.get_mut(&table) {
                Some(mut state) => {
                    hydrated += keys.len();
                    state.index.replace_all(keys);
                }
                None => warn!("Engine reported keys for undeclared table '{}'", table),
            }
        }

        info!("Adapter ready: {} tables, {} keys hydrated", self.tables.len(), hydrated);
        Ok(())
    }

    /// Write a row, generating its key when `key` is `None`.
    ///
    /// Unless `skip_pre_read_merge` is set, the stored row is read first
    /// and the new fields are merged over it. Returns the row as written,
    /// key field included.
    pub async fn write(&self, table: &str, key: Option<DbKey>, row: Row, skip_pre_read_merge: bool) -> Result<Row> {
        // 1. Resolve the key and register it in the index
        let (key, key_field) = self.with_table(table, |state| -> Result<(DbKey, String)> {
            let key = match key {
                Some(key) => key,
                None => state.index.generate_key(&state.definition.key_type).map_err(|e| {
                    warn!("Write to '{}' without a key: {}", table, e);
                    TetherError::MissingPrimaryKey { table: table.to_string() }
                })?,
            };
            state.index.add(key.clone());
            Ok((key, state.definition.primary_key.clone()))
        })??;

        // 2. Merge over whatever is stored
        let mut merged = if skip_pre_read_merge {
            Row::new()
        } else {
            self.read(table, &key).await?.unwrap_or_default()
        };
        merged.extend(row);
        merged.insert(key_field, key.to_value());

        // 3. Ship the full row
        let command_row = merged.clone();
        let reply = self
            .round_trip(|id| EngineCommand::Write {
                id,
                table: table.to_string(),
                row: command_row,
            })
            .await?;
        expect_ack(reply)?;

        debug!("WRITE: {}/{}", table, key);
        Ok(merged)
    }

    /// Read one row. Keys missing from the index resolve to `None`
    /// without contacting the engine.
    pub async fn read(&self, table: &str, key: &DbKey) -> Result<Option<Row>> {
        if !self.with_table(table, |state| state.index.contains(key))? {
            debug!("READ: {}/{} not indexed", table, key);
            return Ok(None);
        }

        let reply = self
            .round_trip(|id| EngineCommand::Read {
                id,
                table: table.to_string(),
                key: key.clone(),
            })
            .await?;
        match reply.payload {
            ReplyPayload::Row { row } => Ok(row),
            _ => Err(unexpected(reply.id, "row")),
        }
    }

    /// Delete one row.
    ///
    /// The key leaves the index before the engine confirms and is not put
    /// back if the engine then fails.
    pub async fn delete(&self, table: &str, key: &DbKey) -> Result<()> {
        self.with_table(table, |state| state.index.remove(key))?;

        let reply = self
            .round_trip(|id| EngineCommand::Delete {
                id,
                table: table.to_string(),
                target: DeleteTarget::Key(key.clone()),
            })
            .await?;
        expect_ack(reply)?;

        debug!("DELETE: {}/{}", table, key);
        Ok(())
    }

    /// Start a range read. The batch request goes out immediately; rows
    /// are pulled from the returned cursor in ascending key order.
    pub async fn range_read(&self, table: &str, bounds: ScanBounds) -> Result<RangeCursor> {
        let resolved = self.with_table(table, |state| bounds.resolve(&state.index))?;
        let mut cursor = RangeCursor::new(self.config.yield_every);

        match resolved {
            None => {
                debug!("RANGE: {} {:?} is empty", table, bounds);
                cursor.finish();
            }
            Some(range) => {
                let (from, to) = (range.from_key.clone(), range.to_key.clone());
                let (id, reply) = self
                    .send(|id| EngineCommand::ReadRange {
                        id,
                        table: table.to_string(),
                        from,
                        to,
                    })
                    .await?;
                debug!("RANGE: {} positions {}..={} as {}", table, range.lower, range.upper, id);
                cursor.await_batch(id, reply, &range);
            }
        }
        Ok(cursor)
    }

    /// Range read driven to completion. `on_row` receives each row with
    /// its index position; returns the number of rows delivered.
    pub async fn range_read_each<F>(&self, table: &str, bounds: ScanBounds, on_row: F) -> Result<usize>
    where
        F: FnMut(Row, usize),
    {
        self.range_read(table, bounds).await?.for_each(on_row).await
    }

    /// Clear a table: fresh key index (same auto-increment setting) and a
    /// clear command to the engine.
    pub async fn drop_table(&self, table: &str) -> Result<()> {
        self.with_table(table, |state| {
            state.index = KeyIndex::new(state.index.auto_increment());
        })?;

        let reply = self
            .round_trip(|id| EngineCommand::Delete {
                id,
                table: table.to_string(),
                target: DeleteTarget::Clear,
            })
            .await?;
        expect_ack(reply)?;

        info!("DROP: {}", table);
        Ok(())
    }

    pub fn get_index_snapshot(&self, table: &str, length_only: bool) -> Result<IndexSnapshot> {
        self.with_table(table, |state| {
            if length_only {
                IndexSnapshot::Length(state.index.len())
            } else {
                IndexSnapshot::Keys(state.index.keys().to_vec())
            }
        })
    }

    /// Drop every declared table. The drops run concurrently.
    pub async fn destroy_all(&self) -> Result<()> {
        let tables = self.table_names();
        try_join_all(tables.iter().map(|table| self.drop_table(table))).await?;
        info!("DESTROY: dropped {} tables", tables.len());
        Ok(())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Requests still waiting on a reply.
    pub fn pending_requests(&self) -> usize {
        self.broker.len()
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    fn with_table<R>(&self, table: &str, f: impl FnOnce(&mut TableState) -> R) -> Result<R> {
        let mut state = self
            .tables
            .get_mut(table)
            .ok_or_else(|| TetherError::UnknownTable { table: table.to_string() })?;
        Ok(f(state.value_mut()))
    }

    /// Register a completion under a fresh id, then post the command.
    async fn send(
        &self,
        build: impl FnOnce(CorrelationId) -> EngineCommand + Send,
    ) -> Result<(CorrelationId, oneshot::Receiver<ReplyPayload>)> {
        let id = CorrelationId::new();
        let (completion, reply) = oneshot::channel();
        // Registered before posting: the reply may arrive before post returns.
        self.broker.register(id, completion)?;

        if let Err(e) = self.engine.post(build(id)).await {
            self.broker.forget(&id);
            return Err(e);
        }
        Ok((id, reply))
    }

    async fn round_trip(&self, build: impl FnOnce(CorrelationId) -> EngineCommand + Send) -> Result<EngineReply> {
        let (id, reply) = self.send(build).await?;
        let payload = reply.await.map_err(|_| TetherError::EngineDisconnected)?;
        Ok(EngineReply::new(id, payload.into_result(id)?))
    }
}

/// The single delivery point for replies. Runs until the engine drops its
/// end of the channel, then fails whatever is still pending.
fn spawn_dispatcher(broker: Arc<CorrelationBroker>, mut replies: ReplyReceiver) {
    tokio::spawn(async move {
        while let Some(frame) = replies.recv().await {
            match protocol::decode_reply(&frame) {
                Ok(reply) => {
                    broker.dispatch(reply.id, reply.payload);
                }
                Err(e) => warn!("Dropping malformed reply frame: {}", e),
            }
        }
        let abandoned = broker.close();
        info!("Reply stream closed ({} requests abandoned)", abandoned);
    });
}

fn expect_ack(reply: EngineReply) -> Result<()> {
    match reply.payload {
        ReplyPayload::Ack => Ok(()),
        _ => Err(unexpected(reply.id, "ack")),
    }
}

fn unexpected(id: CorrelationId, expected: &'static str) -> TetherError {
    TetherError::UnexpectedReply {
        id: id.to_string(),
        expected,
    }
}
