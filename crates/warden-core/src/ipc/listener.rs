//! Worker side of the pipe: reads requests, runs functions, writes responses.
//!
//! The listener owns every execution context in the process. Contexts are
//! created on first use of their id and removed only by a discard request.
//! A failing or panicking function produces an error response; it never ends
//! the loop.

use super::protocol::{read_message, write_message, Request, RequestKind, Response};
use crate::context::{ExecutionContext, Scope, WorkerInfo};
use crate::functions::object::{LocalValue, ObjectRef};
use crate::functions::{catch_panic, Function};
use crate::value::{ContextId, HandleId, Kwargs, RemoteError, Value, WireValue};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// Request dispatcher for one worker process.
pub struct Listener {
    info: Arc<WorkerInfo>,
    contexts: HashMap<ContextId, ExecutionContext>,
}

impl Listener {
    pub fn new(info: WorkerInfo) -> Self {
        Self {
            info: Arc::new(info),
            contexts: HashMap::new(),
        }
    }

    /// Serve requests until the reader reaches a clean EOF.
    ///
    /// Returns an error only when the stream itself breaks (truncated frame,
    /// undecodable request, failed write).
    pub async fn listen<R, W>(&mut self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("worker listening (pid {})", std::process::id());
        while let Some(request) = read_message::<Request, _>(&mut reader).await? {
            let response = self.handle(request);
            write_message(&mut writer, &response).await?;
        }
        info!(
            "host closed the pipe, exiting with {} live contexts",
            self.contexts.len()
        );
        Ok(())
    }

    /// Handle one request.
    pub fn handle(&mut self, request: Request) -> Response {
        let kind = request.kind();
        let Request {
            context_id,
            function,
            args,
            kwargs,
        } = request;

        let result = match kind {
            RequestKind::Administrative(function) => self.run_administrative(function, args, kwargs),
            RequestKind::Call(id, function) => self.run_in_context(id, function, args, kwargs),
            RequestKind::Discard(id) => {
                if self.contexts.remove(&id).is_some() {
                    debug!("discarded context {}", id);
                } else {
                    debug!("discard of unknown context {} ignored", id);
                }
                Ok(Value::Nil)
            }
            RequestKind::Invalid => Err(RemoteError::type_error(
                "request names neither a context nor a function",
            )),
        };

        match result {
            Ok(payload) => Response::success(payload),
            Err(err) => {
                let err = if err.trace.is_some() {
                    err
                } else {
                    let trace = trace_text(context_id, function, &err.to_string());
                    err.with_trace(trace)
                };
                Response::error(err)
            }
        }
    }

    /// Number of live contexts.
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    fn run_administrative(
        &self,
        function: Function,
        args: Vec<WireValue>,
        kwargs: Kwargs<HandleId>,
    ) -> std::result::Result<WireValue, RemoteError> {
        let args = args
            .into_iter()
            .map(|arg| arg.try_map_handles(&mut reject_handle))
            .collect::<std::result::Result<Vec<LocalValue>, _>>()?;
        let kwargs = kwargs
            .into_iter()
            .map(|(k, v)| Ok((k, v.try_map_handles(&mut reject_handle)?)))
            .collect::<std::result::Result<Kwargs<_>, RemoteError>>()?;

        let info: &WorkerInfo = &self.info;
        let result = catch_panic(|| function.invoke(Scope::Global(info), args, kwargs))?;
        result.try_map_handles(&mut |_| {
            Err(RemoteError::type_error(format!(
                "{}() returned an object without a context to own it",
                function
            )))
        })
    }

    fn run_in_context(
        &mut self,
        id: ContextId,
        function: Function,
        args: Vec<WireValue>,
        kwargs: Kwargs<HandleId>,
    ) -> std::result::Result<WireValue, RemoteError> {
        let info = Arc::clone(&self.info);
        let context = self.contexts.entry(id).or_insert_with(|| {
            debug!("created context {}", id);
            ExecutionContext::new(id, info)
        });

        let args = args
            .into_iter()
            .map(|arg| context.resolve(arg))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let kwargs = kwargs
            .into_iter()
            .map(|(k, v)| Ok((k, context.resolve(v)?)))
            .collect::<std::result::Result<Kwargs<_>, RemoteError>>()?;

        let result = catch_panic(|| function.invoke(Scope::Context(&mut *context), args, kwargs))?;
        Ok(context.export(result))
    }
}

fn reject_handle(id: HandleId) -> std::result::Result<ObjectRef, RemoteError> {
    Err(RemoteError::type_error(format!(
        "handle {} passed without a context",
        id
    )))
}

fn trace_text(context_id: Option<ContextId>, function: Option<Function>, error: &str) -> String {
    let scope = match context_id {
        Some(id) => format!("context {}", id),
        None => "no context".to_string(),
    };
    let function = function.map(|f| f.as_str()).unwrap_or("<discard>");
    format!(
        "Traceback (worker pid {}):\n  in {}() [{}]\n{}",
        std::process::id(),
        function,
        scope,
        error
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::read_frame;
    use crate::value::ErrorKind;
    use tokio::io::AsyncWriteExt;

    fn call(listener: &mut Listener, id: ContextId, function: Function, args: Vec<WireValue>) -> Response {
        listener.handle(Request::call(id, function, args, Kwargs::new()))
    }

    #[test]
    fn test_echo_scenario() {
        let mut listener = Listener::new(WorkerInfo::default());
        let response = call(&mut listener, 7, Function::Echo, vec![Value::Str("hello".into())]);
        assert_eq!(response.into_result().unwrap(), Value::Str("hello".into()));
        assert_eq!(listener.context_count(), 1);
    }

    #[test]
    fn test_raise_carries_trace_and_worker_survives() {
        let mut listener = Listener::new(WorkerInfo::default());
        let response = call(
            &mut listener,
            7,
            Function::TestRaiseError,
            vec![Value::Str("value".into()), Value::Str("bad input".into())],
        );
        assert!(response.is_error);
        let err = response.into_result().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Value);
        assert!(err.trace.unwrap().contains("test_raise_error"));

        let response = call(&mut listener, 7, Function::Echo, vec![Value::Int(1)]);
        assert_eq!(response.into_result().unwrap(), Value::Int(1));
    }

    #[test]
    fn test_discard_then_reuse_gives_fresh_context() {
        let mut listener = Listener::new(WorkerInfo::default());
        call(
            &mut listener,
            7,
            Function::StoreValue,
            vec![Value::Str("k".into()), Value::Int(1)],
        );
        let handle = call(&mut listener, 7, Function::CreateSimpleObject, vec![Value::Int(5)])
            .into_result()
            .unwrap();

        assert!(!listener.handle(Request::discard(7)).is_error);
        assert_eq!(listener.context_count(), 0);

        let err = call(&mut listener, 7, Function::FetchValue, vec![Value::Str("k".into())])
            .into_result()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Key);

        let err = call(
            &mut listener,
            7,
            Function::GetCompiledMethodReturn,
            vec![handle, Value::Str("value".into())],
        )
        .into_result()
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::StaleHandle);
    }

    #[test]
    fn test_discard_is_idempotent() {
        let mut listener = Listener::new(WorkerInfo::default());
        assert!(!listener.handle(Request::discard(3)).is_error);
        assert!(!listener.handle(Request::discard(3)).is_error);
    }

    #[test]
    fn test_contexts_are_isolated() {
        let mut listener = Listener::new(WorkerInfo::default());
        call(
            &mut listener,
            1,
            Function::StoreValue,
            vec![Value::Str("k".into()), Value::Str("one".into())],
        );
        let err = call(&mut listener, 2, Function::FetchValue, vec![Value::Str("k".into())])
            .into_result()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Key);

        let handle = call(&mut listener, 1, Function::CreateSimpleObject, vec![Value::Int(5)])
            .into_result()
            .unwrap();
        let err = call(
            &mut listener,
            2,
            Function::GetCompiledMethodReturn,
            vec![handle, Value::Str("value".into())],
        )
        .into_result()
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::StaleHandle);
    }

    #[test]
    fn test_same_object_gets_same_handle() {
        let mut listener = Listener::new(WorkerInfo::default());
        let list = call(
            &mut listener,
            1,
            Function::CreateSimpleObject,
            vec![Value::List(vec![Value::Int(1), Value::Int(2)])],
        )
        .into_result()
        .unwrap();
        let get = |listener: &mut Listener| {
            call(
                listener,
                1,
                Function::GetCompiledMethodReturn,
                vec![
                    list.clone(),
                    Value::Str("get_item".into()),
                    Value::List(vec![Value::Int(0)]),
                ],
            )
            .into_result()
            .unwrap()
        };
        let first = get(&mut listener);
        let second = get(&mut listener);
        assert_eq!(first, second);
        assert!(matches!(first, Value::Handle(HandleId(_))));
    }

    #[test]
    fn test_panic_becomes_internal_error() {
        let mut listener = Listener::new(WorkerInfo::default());
        let err = call(
            &mut listener,
            1,
            Function::TestPanic,
            vec![Value::Str("boom".into())],
        )
        .into_result()
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(err.message.contains("boom"));

        let response = call(&mut listener, 1, Function::Echo, vec![Value::Int(2)]);
        assert_eq!(response.into_result().unwrap(), Value::Int(2));
    }

    #[test]
    fn test_administrative_rejects_handles() {
        let mut listener = Listener::new(WorkerInfo::default());
        let ok = listener.handle(Request::administrative(
            Function::GetSysPath,
            vec![],
            Kwargs::new(),
        ));
        assert!(!ok.is_error);

        let err = listener
            .handle(Request::administrative(
                Function::GetSysPath,
                vec![Value::Handle(HandleId(1))],
                Kwargs::new(),
            ))
            .into_result()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);

        let err = listener
            .handle(Request::administrative(Function::Echo, vec![], Kwargs::new()))
            .into_result()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
        assert_eq!(listener.context_count(), 0);
    }

    #[tokio::test]
    async fn test_listen_serves_until_eof() {
        let (host, worker) = tokio::io::duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker);
        let server = tokio::spawn(async move {
            let mut listener = Listener::new(WorkerInfo::default());
            listener.listen(worker_read, worker_write).await
        });

        let (mut host_read, mut host_write) = tokio::io::split(host);
        write_message(
            &mut host_write,
            &Request::call(
                7,
                Function::Echo,
                vec![Value::Str("hello".into())],
                Kwargs::new(),
            ),
        )
        .await
        .unwrap();
        let response: Response = read_message(&mut host_read).await.unwrap().unwrap();
        assert_eq!(response.into_result().unwrap(), Value::Str("hello".into()));

        host_write.shutdown().await.unwrap();
        drop(host_write);
        server.await.unwrap().unwrap();
        assert!(read_frame(&mut host_read).await.unwrap().is_none());
    }
}
