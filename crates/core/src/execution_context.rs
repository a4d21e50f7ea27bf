//! Per-query execution state.
//!
//! One [`ExecutionContext`] is created per top-level request and threaded
//! through pre-calls, fan-out and kernels. It carries the cancellation
//! signal, the optional deadline, the memory and write budgets, and the
//! per-shard view cache (a shard touched twice in one query sees the same
//! snapshot; views are dropped together when the query finishes).

use crate::db::{ShardView, Store};
use crate::error::{ExecError, Result};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct ExecutionContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    max_memory: Option<u64>,
    mem_used: AtomicU64,
    views: Mutex<FxHashMap<(String, u64), Arc<ShardView>>>,
}

impl ExecutionContext {
    pub fn new(deadline: Option<Instant>, max_memory: Option<u64>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline,
            max_memory,
            mem_used: AtomicU64::new(0),
            views: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Signals every in-flight kernel and RPC to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Checked at every suspension point and once per shard kernel.
    pub fn check_live(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.cancel.cancel();
                return Err(ExecError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Accounts `bytes` against the per-query buffer budget.
    pub fn reserve_memory(&self, bytes: u64) -> Result<()> {
        let Some(limit) = self.max_memory else {
            return Ok(());
        };
        let used = self.mem_used.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if used > limit {
            return Err(ExecError::MemoryExhausted { limit });
        }
        Ok(())
    }

    /// The shard snapshot for (index, shard), opened on first touch.
    pub fn view(&self, store: &Store, index: &str, shard: u64) -> Result<Arc<ShardView>> {
        let key = (index.to_owned(), shard);
        if let Some(view) = self.views.lock().get(&key) {
            return Ok(view.clone());
        }
        let view = store.open_view(index, shard)?;
        // Two kernels may race to open the same shard; first one in wins so
        // both observe the same snapshot.
        let mut views = self.views.lock();
        Ok(views.entry(key).or_insert(view).clone())
    }

    /// Drops every cached shard view. Called on all query exit paths.
    pub fn release_views(&self) {
        self.views.lock().clear();
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.release_views();
    }
}
