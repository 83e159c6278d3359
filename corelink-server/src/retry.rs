//! Retry store for unacknowledged pushes.
//!
//! A handler that expects an acknowledgement parks a pending entry here.
//! If the entry is not deleted before the timer fires, the stored header
//! snapshot is re-applied to the stored context and the value is re-sent
//! once on the original operator channel; the entry is then removed, so
//! a push is retried at most once.

use crate::context::Context;
use corelink_protocol::HeaderMap;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// One pending push awaiting acknowledgement.
pub struct RetryItem {
    /// Operator pattern to re-send on.
    pub channel: String,
    /// Request headers re-applied before the resend.
    pub header: HeaderMap,
    /// Body value to re-send.
    pub value: Value,
    /// Context cloned from the originating request.
    pub ctx: Context,
}

/// Pending pushes indexed by correlation key, resent once on timeout.
pub struct RetryStore {
    items: Arc<DashMap<String, RetryItem>>,
    timeout: Duration,
}

static GLOBAL: OnceLock<RetryStore> = OnceLock::new();

impl RetryStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            items: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Returns the process-wide store, initializing it with `timeout` on
    /// the first call. Later calls keep the first timeout.
    pub fn global(timeout: Duration) -> &'static RetryStore {
        GLOBAL.get_or_init(|| RetryStore::new(timeout))
    }

    /// Stores an entry and arms its one-shot resend timer.
    pub fn put(&self, key: &str, item: RetryItem) {
        self.items.insert(key.to_string(), item);

        let items = self.items.clone();
        let key = key.to_string();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Still present means never acknowledged: re-send once.
            if let Some((_, mut item)) = items.remove(&key) {
                let header = item.header.clone();
                for (k, v) in header.iter() {
                    item.ctx.set_request_property(k, v);
                }
                if let Err(e) = item.ctx.write(&item.channel, item.value.clone()) {
                    tracing::warn!("retry resend on {} failed: {}", item.channel, e);
                }
            }
        });
    }

    /// Removes an entry before its timer fires; the timer becomes a no-op.
    pub fn delete(&self, key: &str) {
        self.items.remove(key);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
