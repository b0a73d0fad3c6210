//! Command correlation table: rotating id pool plus bounded result cache.
//!
//! The worker loop inserts, callers remove; both sides go through one mutex
//! with short critical sections. Waiters are woken precisely on `record`
//! through a `Notify` rather than polled on a fixed interval.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{Notify, watch};

use crate::bridge::value::Value;
use crate::command::CommandId;
use crate::supervisor::EngineState;

/// Size of the rotating correlation-id pool.
pub const DEFAULT_ID_POOL: usize = 20;

/// Results retained past this count evict the oldest entry.
pub const DEFAULT_CAPACITY: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for result of command {0}")]
    Timeout(CommandId),
    #[error("worker stopped before the result of command {0} arrived")]
    Stopped(CommandId),
}

struct Inner {
    next_id: CommandId,
    results: VecDeque<(CommandId, Value)>,
}

pub struct ResultTable {
    inner: Mutex<Inner>,
    notify: Notify,
    id_pool: usize,
    capacity: usize,
}

impl ResultTable {
    pub fn new(id_pool: usize, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                results: VecDeque::with_capacity(capacity),
            }),
            notify: Notify::new(),
            id_pool,
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Neither side panics while holding the lock.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Next id in the rotating pool. A recorded-but-uncollected result left
    /// over from the id's previous life is purged so it cannot be mistaken
    /// for the new command's result.
    pub fn allocate(&self) -> CommandId {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id = (inner.next_id + 1) % self.id_pool as CommandId;
        inner.results.retain(|(stored, _)| *stored != id);
        id
    }

    /// Record a completed result, evicting the oldest entry past capacity.
    pub fn record(&self, id: CommandId, value: Value) {
        let mut inner = self.lock();
        inner.results.push_back((id, value));
        while inner.results.len() > self.capacity {
            let evicted = inner.results.pop_front();
            if let Some((lost, _)) = evicted {
                tracing::debug!(id = lost, "evicting uncollected result");
            }
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Remove and return the result for `id`, if present.
    pub fn collect(&self, id: CommandId) -> Option<Value> {
        let mut inner = self.lock();
        let pos = inner.results.iter().position(|(stored, _)| *stored == id)?;
        inner.results.remove(pos).map(|(_, value)| value)
    }

    /// Block the caller until the result for `id` arrives, the worker is
    /// observed stopped, or the timeout elapses. A timeout leaves the
    /// underlying command untouched; a later wait on the same id can still
    /// succeed within the retention window.
    pub async fn wait(
        &self,
        id: CommandId,
        timeout: Duration,
        mut state: watch::Receiver<EngineState>,
    ) -> Result<Value, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Arm before checking so an insert between the check and the
            // await cannot be missed.
            notified.as_mut().enable();

            if let Some(value) = self.collect(id) {
                return Ok(value);
            }
            if !state.borrow_and_update().is_live() {
                return Err(WaitError::Stopped(id));
            }

            tokio::select! {
                _ = notified => {}
                changed = state.changed() => {
                    if changed.is_err() {
                        // State sender gone: one last sweep, then give up.
                        return self.collect(id).ok_or(WaitError::Stopped(id));
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return Err(WaitError::Timeout(id)),
            }
        }
    }
}

impl Default for ResultTable {
    fn default() -> Self {
        Self::new(DEFAULT_ID_POOL, DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_state() -> (watch::Sender<EngineState>, watch::Receiver<EngineState>) {
        watch::channel(EngineState::Running)
    }

    #[test]
    fn ids_rotate_through_the_pool() {
        let table = ResultTable::new(3, 20);
        let ids: Vec<_> = (0..7).map(|_| table.allocate()).collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn reallocation_purges_stale_result() {
        let table = ResultTable::new(3, 20);
        let first = table.allocate();
        table.record(first, Value::Int(1));
        table.allocate();
        table.allocate();
        // The pool wraps: `first` is reused, its stale result must be gone.
        let reused = table.allocate();
        assert_eq!(reused, first);
        assert_eq!(table.collect(first), None);
    }

    #[test]
    fn retention_is_bounded() {
        let table = ResultTable::new(100, DEFAULT_CAPACITY);
        for id in 0..25u32 {
            table.record(id, Value::Int(id as i64));
        }
        for id in 0..5u32 {
            assert_eq!(table.collect(id), None, "id {id} should have been evicted");
        }
        for id in 5..25u32 {
            assert_eq!(table.collect(id), Some(Value::Int(id as i64)));
        }
    }

    #[test]
    fn collect_removes() {
        let table = ResultTable::default();
        table.record(3, Value::Str("once".to_string()));
        assert!(table.collect(3).is_some());
        assert!(table.collect(3).is_none());
    }

    #[tokio::test]
    async fn wait_wakes_on_record() {
        let table = std::sync::Arc::new(ResultTable::default());
        let (_tx, rx) = live_state();

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.wait(7, Duration::from_secs(5), rx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        table.record(7, Value::Int(42));

        assert_eq!(waiter.await.unwrap(), Ok(Value::Int(42)));
    }

    #[tokio::test]
    async fn wait_times_out_without_consuming() {
        let table = ResultTable::default();
        let (_tx, rx) = live_state();

        let err = table.wait(1, Duration::from_millis(30), rx.clone()).await;
        assert_eq!(err, Err(WaitError::Timeout(1)));

        // A later wait on the same id still succeeds once the result lands.
        table.record(1, Value::Int(9));
        let ok = table.wait(1, Duration::from_millis(30), rx).await;
        assert_eq!(ok, Ok(Value::Int(9)));
    }

    #[tokio::test]
    async fn wait_fails_when_worker_stops() {
        let table = std::sync::Arc::new(ResultTable::default());
        let (tx, rx) = live_state();

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.wait(2, Duration::from_secs(5), rx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send_replace(EngineState::Stopped);

        assert_eq!(waiter.await.unwrap(), Err(WaitError::Stopped(2)));
    }
}
