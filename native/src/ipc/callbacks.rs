//! Callback registry: handlers that the peer can only reach through an id.
//!
//! A closure cannot cross the process boundary, so each handler is parked here and the peer
//! receives a [`CallbackId`] placeholder instead. Handlers are freed when invoked (one-shot), when
//! the request that registered them resolves, or when the connection goes away.

use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::protocol::{CallbackId, ProtocolError, RemoteError};

pub type CallbackFuture = Pin<Box<dyn Future<Output = Result<Value, RemoteError>> + Send>>;
pub type CallbackFn = Arc<dyn Fn(Value) -> CallbackFuture + Send + Sync>;

/// A local handler plus its lifetime policy.
///
/// The handler itself is called on the dispatch loop in frame order. Whatever it does before
/// returning its future is therefore ordered with the frames around it; the future is awaited
/// on a separate task.
#[derive(Clone)]
pub struct Callback {
    handler: CallbackFn,
    once: bool,
}

impl Callback {
    /// Handler that stays registered until its owner releases it.
    pub fn persistent<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |args| Box::pin(handler(args))),
            once: false,
        }
    }

    /// Handler that is removed the moment it is invoked.
    pub fn once<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        Self {
            once: true,
            ..Self::persistent(handler)
        }
    }

    pub fn is_once(&self) -> bool {
        self.once
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback").field("once", &self.once).finish()
    }
}

struct Registration {
    owner: Option<u64>,
    callback: Callback,
}

#[derive(Default)]
pub struct CallbackRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<CallbackId, Registration>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<CallbackId, Registration>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Park a handler and hand back the id to send in its place.
    pub fn register(&self, owner: Option<u64>, callback: Callback) -> CallbackId {
        let id = CallbackId::new((self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string());
        self.entries()
            .insert(id.clone(), Registration { owner, callback });
        id
    }

    /// Resolve an inbound invocation. One-shot handlers leave the registry here, under the
    /// same lock as the lookup, so a second invocation can never find them.
    pub fn take_for_invoke(&self, id: &CallbackId) -> Result<CallbackFn, ProtocolError> {
        let mut entries = self.entries();
        let once = match entries.get(id) {
            Some(registration) => registration.callback.once,
            None => return Err(ProtocolError::UnknownCallback(id.clone())),
        };

        if once {
            entries
                .remove(id)
                .map(|registration| registration.callback.handler)
                .ok_or_else(|| ProtocolError::UnknownCallback(id.clone()))
        } else {
            entries
                .get(id)
                .map(|registration| Arc::clone(&registration.callback.handler))
                .ok_or_else(|| ProtocolError::UnknownCallback(id.clone()))
        }
    }

    pub fn release(&self, id: &CallbackId) -> bool {
        self.entries().remove(id).is_some()
    }

    /// Free every handler registered on behalf of `owner`.
    pub fn release_owner(&self, owner: u64) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, registration| registration.owner != Some(owner));
        let released = before - entries.len();
        if released > 0 {
            debug!("[IPC] Released {} callbacks of request {}", released, owner);
        }
        released
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &CallbackId) -> bool {
        self.entries().contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> Callback {
        Callback::persistent(|args| async move { Ok(args) })
    }

    #[tokio::test]
    async fn persistent_callbacks_survive_invocation() {
        let registry = CallbackRegistry::new();
        let id = registry.register(Some(1), echo());

        let handler = registry.take_for_invoke(&id).unwrap();
        assert_eq!(handler(json!(5)).await, Ok(json!(5)));
        assert!(registry.take_for_invoke(&id).is_ok());
    }

    #[test]
    fn once_callbacks_are_invoked_at_most_once() {
        let registry = CallbackRegistry::new();
        let id = registry.register(None, Callback::once(|_| async { Ok(Value::Null) }));

        assert!(registry.take_for_invoke(&id).is_ok());
        assert_eq!(
            registry.take_for_invoke(&id).err(),
            Some(ProtocolError::UnknownCallback(id.clone()))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn ids_are_unique() {
        let registry = CallbackRegistry::new();
        let a = registry.register(None, echo());
        let b = registry.register(None, echo());
        assert_ne!(a, b);
    }

    #[test]
    fn releasing_an_owner_leaves_other_owners_alone() {
        let registry = CallbackRegistry::new();
        let first = registry.register(Some(1), echo());
        registry.register(Some(1), echo());
        let other = registry.register(Some(2), echo());

        assert_eq!(registry.release_owner(1), 2);
        assert!(!registry.contains(&first));
        assert!(registry.contains(&other));
        assert_eq!(registry.clear(), 1);
    }
}
