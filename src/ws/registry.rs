//! Listener registry keyed by inbound message type.
//!
//! Listeners for a key run synchronously, in registration order, on the
//! connection's read task. A listener that panics is caught and logged; the
//! remaining listeners still run and the read loop carries on. Listeners
//! should hand long work off (e.g. to a channel or `tokio::spawn`) rather than
//! block the read path.
//!
//! # Example
//!
//! ```
//! use kalshi_stream::ws::registry::DispatchRegistry;
//! use serde_json::json;
//!
//! let registry = DispatchRegistry::new();
//! let handle = registry.register("trade", |payload| {
//!     println!("trade: {payload}");
//! });
//!
//! assert_eq!(registry.dispatch("trade", &json!({"ticker": "FOO"})), 1);
//! handle.release();
//! assert_eq!(registry.dispatch("trade", &json!({"ticker": "FOO"})), 0);
//! ```

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde_json::Value;

/// Callback invoked with the payload of each matching inbound message.
pub type Listener = dyn Fn(&Value) + Send + Sync + 'static;

struct Registration {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Arc<Listener>,
}

#[derive(Default)]
struct RegistryInner {
    listeners: RwLock<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl RegistryInner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<Registration>>> {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<Registration>>> {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Maps a message type to its ordered listeners.
///
/// Cloning is cheap and yields a handle to the same registry.
#[derive(Clone, Default)]
pub struct DispatchRegistry {
    inner: Arc<RegistryInner>,
}

impl DispatchRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `callback` for `type_key`. The returned handle removes exactly this
    /// registration when released.
    pub fn register<F>(&self, type_key: impl Into<String>, callback: F) -> ListenerHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let type_key = type_key.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));

        self.inner
            .write()
            .entry(type_key.clone())
            .or_default()
            .push(Registration {
                id,
                active: Arc::clone(&active),
                callback: Arc::new(callback),
            });

        tracing::debug!(type_key = %type_key, id, "Listener registered");

        ListenerHandle {
            registry: Arc::downgrade(&self.inner),
            type_key,
            id,
            active,
        }
    }

    /// Deliver `payload` to every listener of `type_key`, in registration
    /// order. Returns how many listeners completed without panicking.
    ///
    /// Having no listeners is not an error.
    pub fn dispatch(&self, type_key: &str, payload: &Value) -> usize {
        // Snapshot so listeners may register or release without deadlocking.
        let snapshot: Vec<(Arc<AtomicBool>, Arc<Listener>)> = match self.inner.read().get(type_key) {
            Some(regs) => regs
                .iter()
                .map(|r| (Arc::clone(&r.active), Arc::clone(&r.callback)))
                .collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for (active, callback) in snapshot {
            if !active.load(Ordering::Acquire) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| callback(payload))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    tracing::warn!(
                        type_key = %type_key,
                        panic = %panic_message(panic.as_ref()),
                        "Listener panicked"
                    );
                }
            }
        }
        delivered
    }

    /// Remove every listener for `type_key`. Other keys are untouched.
    /// Returns how many were removed.
    pub fn clear(&self, type_key: &str) -> usize {
        let removed = self.inner.write().remove(type_key).unwrap_or_default();
        for reg in &removed {
            reg.active.store(false, Ordering::Release);
        }
        if !removed.is_empty() {
            tracing::debug!(type_key = %type_key, count = removed.len(), "Listeners cleared");
        }
        removed.len()
    }

    /// Number of live listeners for `type_key`.
    pub fn listener_count(&self, type_key: &str) -> usize {
        self.inner.read().get(type_key).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for DispatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.inner.read();
        let mut keys: Vec<_> = listeners.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        keys.sort_unstable();
        f.debug_struct("DispatchRegistry").field("listeners", &keys).finish()
    }
}

/// Token for one listener registration.
///
/// The registering consumer owns it and releases it explicitly; dropping the
/// handle does **not** unregister the listener.
#[derive(Debug)]
pub struct ListenerHandle {
    registry: Weak<RegistryInner>,
    type_key: String,
    id: u64,
    active: Arc<AtomicBool>,
}

impl ListenerHandle {
    /// Unregister the listener. Returns `false` if it was already released
    /// (or cleared); calling it again is harmless.
    pub fn release(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(inner) = self.registry.upgrade() {
            let mut listeners = inner.write();
            if let Some(regs) = listeners.get_mut(&self.type_key) {
                regs.retain(|r| r.id != self.id);
                if regs.is_empty() {
                    listeners.remove(&self.type_key);
                }
            }
        }
        tracing::debug!(type_key = %self.type_key, id = self.id, "Listener released");
        true
    }

    /// Whether the listener is still registered.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// The message type this listener was registered for.
    pub fn type_key(&self) -> &str {
        &self.type_key
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}
