/// Tether - storage adapter over an isolated remote engine
///
/// Exposes row CRUD and range scans to a database engine while the rows
/// live in a remote engine reachable only by asynchronous messages.
///
/// Architecture:
/// 1. KeyIndex: per-table ordered primary keys and auto-increment counter
/// 2. CorrelationBroker: request ids to single-shot completions
/// 3. RemoteEngine: threaded or inline host for the engine core
/// 4. RangeCursor: paced row-by-row delivery of range batches
/// 5. StorageAdapter: the operations, composed from the layers above

pub mod error;
pub mod types;
pub mod key_index;
pub mod broker;
pub mod protocol;
pub mod engine;
pub mod pagination;
pub mod config;
pub mod adapter;

pub use adapter::{IndexSnapshot, StorageAdapter};
pub use broker::{CorrelationBroker, CorrelationId};
pub use config::{AdapterConfig, EngineMode};
pub use engine::{EngineCore, InlineEngine, RemoteEngine, ThreadedEngine};
pub use error::{Result, TetherError};
pub use key_index::KeyIndex;
pub use pagination::{PaginationState, RangeCursor, ScanBounds};
pub use protocol::{EngineCommand, EngineReply, ReplyPayload};
pub use types::{DbKey, KeyType, Row, TableDefinition};
