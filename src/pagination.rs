/// Range Pagination Engine
///
/// A range read asks the engine for the whole batch in one command and then
/// hands rows to the caller one at a time. Delivery is an iterative loop
/// that yields to the scheduler every `yield_every` rows, so long scans
/// never monopolise a worker or grow the stack.
///
/// States: Idle -> AwaitingBatch -> Delivering -> Complete

use tokio::sync::oneshot;
use tracing::debug;

use crate::broker::CorrelationId;
use crate::error::{Result, TetherError};
use crate::key_index::KeyIndex;
use crate::protocol::ReplyPayload;
use crate::types::{DbKey, Row};

/// Which part of a table's index a range read covers.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanBounds {
    /// Every key.
    Full,
    /// Inclusive positions in the key index.
    Positions { from: usize, to: usize },
    /// Inclusive key values.
    Keys { from: DbKey, to: DbKey },
}

/// Bounds resolved against the index: an inclusive positional span plus the
/// key values at its ends.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRange {
    pub lower: usize,
    pub upper: usize,
    pub from_key: DbKey,
    pub to_key: DbKey,
}

impl ScanBounds {
    /// Returns `None` when the span holds no keys.
    pub fn resolve(&self, index: &KeyIndex) -> Option<ResolvedRange> {
        let keys = index.keys();
        if keys.is_empty() {
            return None;
        }

        let (lower, upper) = match self {
            ScanBounds::Full => (0, keys.len() - 1),
            ScanBounds::Positions { from, to } => {
                if from > to || *from >= keys.len() {
                    return None;
                }
                (*from, (*to).min(keys.len() - 1))
            }
            ScanBounds::Keys { from, to } => {
                let lower = index.lower_bound(from);
                let end = index.upper_bound(to);
                if lower >= end {
                    return None;
                }
                (lower, end - 1)
            }
        };

        Some(ResolvedRange {
            lower,
            upper,
            from_key: keys[lower].clone(),
            to_key: keys[upper].clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationState {
    Idle,
    AwaitingBatch,
    Delivering,
    Complete,
}

/// Pull-based delivery of one range read.
///
/// Each call to `next` is the caller asking for the next row. Once it
/// returns `Ok(None)` the read is complete and no more rows follow.
pub struct RangeCursor {
    state: PaginationState,
    id: Option<CorrelationId>,
    reply: Option<oneshot::Receiver<ReplyPayload>>,
    rows: std::vec::IntoIter<Row>,
    position: usize,
    upper: usize,
    yield_every: usize,
    delivered: usize,
    yields: usize,
}

impl RangeCursor {
    pub fn new(yield_every: usize) -> Self {
        Self {
            state: PaginationState::Idle,
            id: None,
            reply: None,
            rows: Vec::new().into_iter(),
            position: 0,
            upper: 0,
            yield_every: yield_every.max(1),
            delivered: 0,
            yields: 0,
        }
    }

    /// The batch request for `range` has been sent under `id`.
    pub fn await_batch(
        &mut self,
        id: CorrelationId,
        reply: oneshot::Receiver<ReplyPayload>,
        range: &ResolvedRange,
    ) {
        self.id = Some(id);
        self.reply = Some(reply);
        self.position = range.lower;
        self.upper = range.upper;
        self.state = PaginationState::AwaitingBatch;
    }

    /// Complete without delivering anything further.
    pub fn finish(&mut self) {
        if self.state != PaginationState::Complete {
            debug!("Range read complete: {} rows delivered", self.delivered);
        }
        self.state = PaginationState::Complete;
        self.reply = None;
        self.rows = Vec::new().into_iter();
    }

    pub fn state(&self) -> PaginationState {
        self.state
    }

    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// How many times delivery handed control back to the scheduler.
    pub fn yields(&self) -> usize {
        self.yields
    }

    /// Next row and its position in the key index.
    pub async fn next(&mut self) -> Result<Option<(usize, Row)>> {
        if self.state == PaginationState::AwaitingBatch {
            if let Err(e) = self.receive_batch().await {
                self.finish();
                return Err(e);
            }
        }
        if self.state != PaginationState::Delivering {
            return Ok(None);
        }

        if self.position > self.upper {
            self.finish();
            return Ok(None);
        }
        let Some(row) = self.rows.next() else {
            self.finish();
            return Ok(None);
        };

        if self.delivered > 0 && self.delivered % self.yield_every == 0 {
            tokio::task::yield_now().await;
            self.yields += 1;
        }

        let position = self.position;
        self.position += 1;
        self.delivered += 1;
        Ok(Some((position, row)))
    }

    /// Drive the cursor to completion, handing every row to `on_row`.
    /// Returns the number of rows delivered.
    pub async fn for_each<F>(mut self, mut on_row: F) -> Result<usize>
    where
        F: FnMut(Row, usize),
    {
        while let Some((position, row)) = self.next().await? {
            on_row(row, position);
        }
        Ok(self.delivered)
    }

    async fn receive_batch(&mut self) -> Result<()> {
        let id = self.id.unwrap_or_default();
        // Leave the receiver in place while waiting so a dropped `next`
        // future does not lose the batch.
        let payload = match self.reply.as_mut() {
            Some(reply) => reply.await.map_err(|_| TetherError::EngineDisconnected)?,
            None => return Err(TetherError::EngineDisconnected),
        };
        self.reply = None;

        match payload.into_result(id)? {
            ReplyPayload::Rows { rows } => {
                debug!("Range read {}: received batch of {} rows", id, rows.len());
                self.rows = rows.into_iter();
                self.state = PaginationState::Delivering;
                Ok(())
            }
            _ => Err(TetherError::UnexpectedReply {
                id: id.to_string(),
                expected: "rows",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn index_of(n: i64) -> KeyIndex {
        let mut index = KeyIndex::new(false);
        index.replace_all((0..n).map(DbKey::Int).collect());
        index
    }

    fn rows(range: std::ops::Range<i64>) -> Vec<Row> {
        range
            .map(|i| json!({ "id": i }).as_object().cloned().unwrap())
            .collect()
    }

    fn started(range: &ResolvedRange, batch: Vec<Row>, yield_every: usize) -> RangeCursor {
        let (tx, rx) = oneshot::channel();
        let mut cursor = RangeCursor::new(yield_every);
        cursor.await_batch(CorrelationId::new(), rx, range);
        tx.send(ReplyPayload::Rows { rows: batch }).unwrap();
        cursor
    }

    #[test]
    fn test_resolve_bounds() {
        let index = index_of(10);
        let full = ScanBounds::Full.resolve(&index).unwrap();
        assert_eq!((full.lower, full.upper), (0, 9));

        let clamped = ScanBounds::Positions { from: 8, to: 50 }.resolve(&index).unwrap();
        assert_eq!((clamped.lower, clamped.upper), (8, 9));
        assert_eq!(clamped.to_key, DbKey::Int(9));

        let keys = ScanBounds::Keys { from: DbKey::Int(3), to: DbKey::Int(5) }
            .resolve(&index)
            .unwrap();
        assert_eq!((keys.lower, keys.upper), (3, 5));

        assert!(ScanBounds::Positions { from: 5, to: 2 }.resolve(&index).is_none());
        assert!(ScanBounds::Keys { from: DbKey::Int(20), to: DbKey::Int(30) }
            .resolve(&index)
            .is_none());
        assert!(ScanBounds::Full.resolve(&KeyIndex::new(false)).is_none());
    }

    #[tokio::test]
    async fn test_delivery_yields_every_batch() {
        let index = index_of(500);
        let range = ScanBounds::Full.resolve(&index).unwrap();
        let mut cursor = started(&range, rows(0..500), 200);

        let mut seen = Vec::new();
        while let Some((position, row)) = cursor.next().await.unwrap() {
            assert_eq!(row["id"], json!(position));
            seen.push(position);
        }

        assert_eq!(seen.len(), 500);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(cursor.yields(), 2);
        assert_eq!(cursor.state(), PaginationState::Complete);
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_positions_start_at_lower_bound() {
        let index = index_of(10);
        let range = ScanBounds::Positions { from: 4, to: 6 }.resolve(&index).unwrap();
        // Extra rows beyond the span are not delivered.
        let cursor = started(&range, rows(4..9), 200);

        let mut positions = Vec::new();
        let delivered = cursor.for_each(|_, position| positions.push(position)).await.unwrap();
        assert_eq!(delivered, 3);
        assert_eq!(positions, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn test_short_batch_completes_early() {
        let index = index_of(10);
        let range = ScanBounds::Full.resolve(&index).unwrap();
        let cursor = started(&range, rows(0..3), 200);
        assert_eq!(cursor.for_each(|_, _| {}).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_batch_surfaces_error() {
        let index = index_of(3);
        let range = ScanBounds::Full.resolve(&index).unwrap();
        let (tx, rx) = oneshot::channel();
        let mut cursor = RangeCursor::new(200);
        cursor.await_batch(CorrelationId::new(), rx, &range);
        tx.send(ReplyPayload::Failed { reason: "boom".into() }).unwrap();

        assert!(matches!(cursor.next().await, Err(TetherError::RemoteEngine { .. })));
        assert_eq!(cursor.state(), PaginationState::Complete);
    }

    #[tokio::test]
    async fn test_dropped_reply_is_disconnect() {
        let index = index_of(3);
        let range = ScanBounds::Full.resolve(&index).unwrap();
        let (tx, rx) = oneshot::channel::<ReplyPayload>();
        let mut cursor = RangeCursor::new(200);
        cursor.await_batch(CorrelationId::new(), rx, &range);
        drop(tx);
        assert!(matches!(cursor.next().await, Err(TetherError::EngineDisconnected)));
    }
}
