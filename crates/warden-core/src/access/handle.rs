//! Caller-side handles to live objects.

use super::proxy::ProxyInner;
use crate::functions::object::{DirectObject, LocalValue, ObjectRef};
use crate::functions::Function;
use crate::ipc::protocol::encode;
use crate::value::{ContextId, HandleId, Kwargs, Value, WireValue};
use crate::{Result, WardenError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Payload as seen by the caller.
pub type HostValue = Value<AccessHandle>;

/// A reference to a live object in some execution context.
///
/// Two handles are equal when they name the same object. Clones are cheap
/// and compare equal to the original.
#[derive(Debug, Clone)]
pub enum AccessHandle {
    /// Object living in this process.
    Local(ObjectRef),
    /// Object living in a worker process.
    Remote(Arc<RemoteObject>),
}

impl AccessHandle {
    pub fn same_object(&self, other: &AccessHandle) -> bool {
        match (self, other) {
            (AccessHandle::Local(a), AccessHandle::Local(b)) => Arc::ptr_eq(a, b),
            (AccessHandle::Remote(a), AccessHandle::Remote(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Worker-side id of a remote handle.
    pub fn remote_id(&self) -> Option<HandleId> {
        match self {
            AccessHandle::Remote(remote) => Some(remote.id),
            AccessHandle::Local(_) => None,
        }
    }

    /// Call a method on the object.
    ///
    /// Remote replies are cached per method name and arguments, so asking the
    /// same question twice costs one round trip.
    pub async fn call_method(&self, method: &str, args: Vec<HostValue>) -> Result<HostValue> {
        match self {
            AccessHandle::Local(object) => {
                let args = args
                    .into_iter()
                    .map(into_local)
                    .collect::<Result<Vec<_>>>()?;
                DirectObject::call_method(object, method, &args)
                    .map(from_local)
                    .map_err(|err| WardenError::from_remote(err, None))
            }
            AccessHandle::Remote(remote) => remote.call_method(method, args).await,
        }
    }
}

impl PartialEq for AccessHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_object(other)
    }
}

/// Mirror of an object that lives in a worker process.
#[derive(Debug)]
pub struct RemoteObject {
    id: HandleId,
    context_id: ContextId,
    generation: u64,
    proxy: Weak<ProxyInner>,
    cache: Mutex<HashMap<(String, Vec<u8>), WireValue>>,
}

impl RemoteObject {
    pub(super) fn new(
        id: HandleId,
        context_id: ContextId,
        generation: u64,
        proxy: Weak<ProxyInner>,
    ) -> Self {
        Self {
            id,
            context_id,
            generation,
            proxy,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Whether this object was adopted by `proxy`.
    pub(super) fn belongs_to(&self, proxy: &ProxyInner) -> bool {
        std::ptr::eq(self.proxy.as_ptr(), proxy)
    }

    pub(super) fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub(super) fn remember(&self, method: &str, args: &[WireValue], reply: WireValue) {
        let key = cache_key(method, args).unwrap();
        self.cache.lock().unwrap().insert(key, reply);
    }

    pub(super) fn stale(&self) -> WardenError {
        WardenError::StaleHandle {
            handle_id: self.id,
            context_id: Some(self.context_id),
        }
    }

    async fn call_method(&self, method: &str, args: Vec<HostValue>) -> Result<HostValue> {
        let proxy = self.proxy.upgrade().ok_or_else(|| self.stale())?;
        if proxy.refresh() != self.generation {
            return Err(self.stale());
        }

        let wire_args = args
            .into_iter()
            .map(|arg| proxy.export(arg))
            .collect::<Result<Vec<_>>>()?;
        let key = cache_key(method, &wire_args)?;

        let cached = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
            .cloned();
        let reply = match cached {
            Some(reply) => reply,
            None => {
                let reply = proxy
                    .call_wire(
                        Function::GetCompiledMethodReturn,
                        vec![
                            Value::Handle(self.id),
                            Value::Str(method.to_string()),
                            Value::List(wire_args),
                        ],
                        Kwargs::new(),
                    )
                    .await?;
                self.cache
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(key, reply.clone());
                reply
            }
        };
        Ok(proxy.adopt(reply))
    }
}

fn cache_key(method: &str, args: &[WireValue]) -> Result<(String, Vec<u8>)> {
    Ok((method.to_string(), encode(&args)?))
}

fn into_local(value: HostValue) -> Result<LocalValue> {
    value.try_map_handles(&mut |handle| match handle {
        AccessHandle::Local(object) => Ok(object),
        AccessHandle::Remote(remote) => Err(WardenError::Validation {
            field: "args".to_string(),
            message: format!(
                "remote handle {} cannot be used in this process",
                remote.id
            ),
        }),
    })
}

pub(super) fn from_local(value: LocalValue) -> HostValue {
    value.map_handles(&mut AccessHandle::Local)
}

pub(super) fn local_args(
    args: Vec<HostValue>,
    kwargs: Kwargs<AccessHandle>,
) -> Result<(Vec<LocalValue>, Kwargs<ObjectRef>)> {
    let args = args.into_iter().map(into_local).collect::<Result<_>>()?;
    let kwargs = kwargs
        .into_iter()
        .map(|(k, v)| Ok((k, into_local(v)?)))
        .collect::<Result<_>>()?;
    Ok((args, kwargs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_handle_identity_and_methods() {
        let object = DirectObject::from_value(Value::List(vec![Value::Int(1), Value::Int(2)]));
        let a = AccessHandle::Local(Arc::clone(&object));
        let b = a.clone();
        let other = AccessHandle::Local(DirectObject::from_value(Value::List(vec![
            Value::Int(1),
            Value::Int(2),
        ])));

        assert_eq!(a, b);
        assert_ne!(a, other);
        assert!(a.remote_id().is_none());

        let len = a.call_method("len", vec![]).await.unwrap();
        assert_eq!(len, Value::Int(2));

        let first = a.call_method("get_item", vec![Value::Int(0)]).await.unwrap();
        let again = a.call_method("get_item", vec![Value::Int(0)]).await.unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_remote_handle_without_proxy_is_stale() {
        let remote = Arc::new(RemoteObject::new(HandleId(3), 9, 0, Weak::new()));
        let handle = AccessHandle::Remote(remote);
        assert_eq!(handle.remote_id(), Some(HandleId(3)));

        match handle.call_method("len", vec![]).await {
            Err(WardenError::StaleHandle {
                handle_id,
                context_id,
            }) => {
                assert_eq!(handle_id, HandleId(3));
                assert_eq!(context_id, Some(9));
            }
            other => panic!("Expected StaleHandle, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_handle_rejected_by_local_object() {
        let local = AccessHandle::Local(DirectObject::from_value(Value::Int(1)));
        let remote = AccessHandle::Remote(Arc::new(RemoteObject::new(HandleId(1), 1, 0, Weak::new())));
        let err = local
            .call_method("get_item", vec![Value::Handle(remote)])
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::Validation { .. }));
    }
}
