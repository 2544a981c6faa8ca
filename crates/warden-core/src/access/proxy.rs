//! Caller-side stand-in for a context that lives in a worker process.

use super::handle::{AccessHandle, HostValue, RemoteObject};
use super::ContextAccess;
use crate::functions::Function;
use crate::ipc::SubprocessManager;
use crate::registry::HandleRegistry;
use crate::value::{ContextId, HandleId, Kwargs, WireValue};
use crate::{Result, WardenError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Forwards calls for one context id to the manager's worker.
///
/// Every handle in a result is mapped to a local [`AccessHandle`]. The same
/// worker-side object always maps to the same handle, so identity survives
/// the round trip. Dropping the proxy queues its context for discarding; the
/// discard is sent with the manager's next call. Deleting the context through
/// the manager while the proxy is alive makes every handle adopted so far
/// stale.
pub struct ContextProxy {
    inner: Arc<ProxyInner>,
}

pub(crate) struct ProxyInner {
    id: ContextId,
    manager: Arc<SubprocessManager>,
    handles: Mutex<HandleRegistry<RemoteObject>>,
    /// Manager discard count the registry was filled under.
    generation: AtomicU64,
    used: AtomicBool,
}

impl std::fmt::Debug for ProxyInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyInner")
            .field("id", &self.id)
            .field("used", &self.used.load(Ordering::Relaxed))
            .finish()
    }
}

impl ContextProxy {
    /// Bind a fresh context id on `manager`.
    pub fn new(manager: Arc<SubprocessManager>) -> Self {
        let id = manager.allocate_context_id();
        Self::with_id(manager, id)
    }

    /// Bind a caller-chosen context id.
    pub fn with_id(manager: Arc<SubprocessManager>, id: ContextId) -> Self {
        let generation = manager.discard_count(id);
        Self {
            inner: Arc::new(ProxyInner {
                id,
                manager,
                handles: Mutex::new(HandleRegistry::new()),
                generation: AtomicU64::new(generation),
                used: AtomicBool::new(false),
            }),
        }
    }

    pub fn manager(&self) -> &Arc<SubprocessManager> {
        &self.inner.manager
    }

    /// Number of distinct worker objects this proxy has seen.
    pub fn handle_count(&self) -> usize {
        self.inner.registry().len()
    }
}

#[async_trait]
impl ContextAccess for ContextProxy {
    fn context_id(&self) -> ContextId {
        self.inner.id
    }

    async fn call(
        &self,
        function: Function,
        args: Vec<HostValue>,
        kwargs: Kwargs<AccessHandle>,
    ) -> Result<HostValue> {
        self.inner.refresh();
        let args = args
            .into_iter()
            .map(|arg| self.inner.export(arg))
            .collect::<Result<Vec<_>>>()?;
        let kwargs = kwargs
            .into_iter()
            .map(|(k, v)| Ok((k, self.inner.export(v)?)))
            .collect::<Result<Kwargs<HandleId>>>()?;

        let reply = self.inner.call_wire(function, args, kwargs).await?;
        Ok(self.inner.adopt(reply))
    }
}

impl ProxyInner {
    fn registry(&self) -> std::sync::MutexGuard<'_, HandleRegistry<RemoteObject>> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Forget every adopted handle if the context was deleted since they were
    /// adopted. Returns the current generation.
    pub(super) fn refresh(&self) -> u64 {
        let current = self.manager.discard_count(self.id);
        if self.generation.swap(current, Ordering::SeqCst) != current {
            debug!("context {} was discarded, dropping adopted handles", self.id);
            *self.registry() = HandleRegistry::new();
        }
        current
    }

    /// Send one call for this context to the worker.
    pub(super) async fn call_wire(
        &self,
        function: Function,
        args: Vec<WireValue>,
        kwargs: Kwargs<HandleId>,
    ) -> Result<WireValue> {
        self.used.store(true, Ordering::SeqCst);
        self.manager
            .call(Some(self.id), function, args, kwargs)
            .await
    }

    /// Map worker ids in `value` to handles owned by this proxy.
    pub(super) fn adopt(self: &Arc<Self>, value: WireValue) -> HostValue {
        let mut registry = self.registry();
        value.map_handles(&mut |id| {
            AccessHandle::Remote(registry.get_or_adopt(id, |id| {
                RemoteObject::new(id, self.id, self.generation(), Arc::downgrade(self))
            }))
        })
    }

    /// Map handles in `value` back to worker ids.
    ///
    /// Only handles adopted by this proxy since the last discard of its
    /// context are accepted.
    pub(super) fn export(&self, value: HostValue) -> Result<WireValue> {
        let generation = self.generation();
        value.try_map_handles(&mut |handle| match handle {
            AccessHandle::Remote(remote) if remote.belongs_to(self) => {
                if remote.generation() == generation {
                    Ok(remote.id())
                } else {
                    Err(remote.stale())
                }
            }
            AccessHandle::Remote(remote) => Err(WardenError::Validation {
                field: "args".to_string(),
                message: format!(
                    "handle {} belongs to context {}, not {}",
                    remote.id(),
                    remote.context_id(),
                    self.id
                ),
            }),
            AccessHandle::Local(_) => Err(WardenError::Validation {
                field: "args".to_string(),
                message: "in-process handles cannot be sent to a worker".to_string(),
            }),
        })
    }
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        if !self.used.load(Ordering::SeqCst) {
            return;
        }
        if self.manager.is_crashed() {
            return;
        }
        debug!("queueing context {} for discard", self.id);
        self.manager.queue_discard(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubprocessConfig;
    use crate::value::Value;

    fn manager() -> Arc<SubprocessManager> {
        Arc::new(SubprocessManager::new(SubprocessConfig::new(
            "/definitely/not/a/real/warden-worker",
        )))
    }

    #[test]
    fn test_adopt_deduplicates_by_id() {
        let proxy = ContextProxy::new(manager());
        let value = proxy.inner.adopt(Value::List(vec![
            Value::Handle(HandleId(5)),
            Value::Handle(HandleId(5)),
            Value::Handle(HandleId(6)),
        ]));
        let items = value.as_list().unwrap();
        assert_eq!(items[0], items[1]);
        assert_ne!(items[0], items[2]);
        assert_eq!(proxy.handle_count(), 2);

        let again = proxy.inner.adopt(Value::Handle(HandleId(5)));
        assert_eq!(again, items[0]);
    }

    #[test]
    fn test_export_rejects_foreign_handles() {
        let shared = manager();
        let a = ContextProxy::new(Arc::clone(&shared));
        let b = ContextProxy::new(shared);
        assert_ne!(a.context_id(), b.context_id());

        let handle = a.inner.adopt(Value::Handle(HandleId(1)));
        assert_eq!(a.inner.export(handle.clone()).unwrap(), Value::Handle(HandleId(1)));
        assert!(matches!(
            b.inner.export(handle),
            Err(WardenError::Validation { .. })
        ));
    }

    #[test]
    fn test_unused_proxy_is_not_queued() {
        let shared = manager();
        drop(ContextProxy::new(Arc::clone(&shared)));
        assert!(shared.pending_deletions().is_empty());
    }

    #[test]
    fn test_used_proxy_is_queued_on_drop() {
        let shared = manager();
        let proxy = ContextProxy::with_id(Arc::clone(&shared), 7);
        proxy.inner.used.store(true, Ordering::SeqCst);
        drop(proxy);
        assert_eq!(shared.pending_deletions(), vec![7]);
    }

    #[test]
    fn test_delete_context_makes_adopted_handles_stale() {
        let shared = manager();
        let proxy = ContextProxy::with_id(Arc::clone(&shared), 4);
        let old = proxy.inner.adopt(Value::Handle(HandleId(1)));

        shared.delete_context(4);
        assert_eq!(proxy.inner.refresh(), 1);
        assert_eq!(proxy.handle_count(), 0);

        let fresh = proxy.inner.adopt(Value::Handle(HandleId(1)));
        assert_ne!(fresh, old);
        assert_eq!(proxy.inner.export(fresh).unwrap(), Value::Handle(HandleId(1)));
        assert!(matches!(
            proxy.inner.export(old),
            Err(WardenError::StaleHandle { .. })
        ));
    }

    #[test]
    fn test_cached_reply_is_not_served_after_delete_context() {
        let shared = manager();
        let proxy = ContextProxy::with_id(Arc::clone(&shared), 4);
        let handle = proxy.inner.adopt(Value::Handle(HandleId(1)));
        let remote = match handle.as_handle() {
            Some(AccessHandle::Remote(remote)) => Arc::clone(remote),
            other => panic!("Expected remote handle, got: {:?}", other),
        };
        remote.remember("len", &[], Value::Int(3));

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let cached = rt.block_on(handle.as_handle().unwrap().call_method("len", vec![]));
        assert_eq!(cached.unwrap(), Value::Int(3));

        // The worker is never contacted: a missing executable would fail to spawn.
        shared.delete_context(4);
        let result = rt.block_on(handle.as_handle().unwrap().call_method("len", vec![]));
        assert!(matches!(result, Err(WardenError::StaleHandle { .. })));
        assert!(!shared.is_crashed());
    }

    #[test]
    fn test_handle_outliving_proxy_is_stale() {
        let proxy = ContextProxy::new(manager());
        let handle = proxy.inner.adopt(Value::Handle(HandleId(2)));
        drop(proxy);

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let result = rt.block_on(handle.as_handle().unwrap().call_method("len", vec![]));
        assert!(matches!(result, Err(WardenError::StaleHandle { .. })));
    }
}
