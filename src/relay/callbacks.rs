//! Persistent per-message-id handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::protocol::Frame;
use crate::sync::lock;

/// Handler invoked with every vehicle message of one id.
pub type MessageCallback = Arc<dyn Fn(Frame) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`MessageCallback`].
pub fn callback<F, Fut>(f: F) -> MessageCallback
where
    F: Fn(Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |frame| f(frame).boxed())
}

/// Handle returned by `add_callback`, needed to remove the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

#[derive(Default)]
pub struct CallbackRegistry {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<u32, Vec<(CallbackId, MessageCallback)>>>,
}

impl CallbackRegistry {
    pub fn add(&self, msg_id: u32, handler: MessageCallback) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.handlers)
            .entry(msg_id)
            .or_default()
            .push((id, handler));
        id
    }

    pub fn remove(&self, msg_id: u32, id: CallbackId) -> bool {
        let mut handlers = lock(&self.handlers);
        let Some(list) = handlers.get_mut(&msg_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&msg_id);
        }
        removed
    }

    /// Snapshot of the handlers for one id, so dispatch runs unlocked.
    pub fn handlers_for(&self, msg_id: u32) -> Vec<MessageCallback> {
        lock(&self.handlers)
            .get(&msg_id)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        lock(&self.handlers).values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.handlers).clear();
    }
}
