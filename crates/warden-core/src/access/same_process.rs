//! Execution context running directly in the host process.

use super::handle::{from_local, local_args, AccessHandle, HostValue};
use super::ContextAccess;
use crate::context::{ExecutionContext, Scope, WorkerInfo};
use crate::functions::{catch_panic, Function};
use crate::value::{ContextId, Kwargs, RemoteError};
use crate::{Result, WardenError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Same call surface as [`ContextProxy`](super::ContextProxy), without a
/// worker: no serialization, no handle ids, and nothing to crash.
///
/// Functions may block (file reads, `test_sleep`), so the async surface runs
/// them on tokio's blocking pool.
pub struct InProcessContext {
    id: ContextId,
    context: Arc<Mutex<ExecutionContext>>,
}

impl InProcessContext {
    pub fn new(id: ContextId, info: Arc<WorkerInfo>) -> Self {
        Self {
            id,
            context: Arc::new(Mutex::new(ExecutionContext::new(id, info))),
        }
    }

    /// Run `function` on the calling thread. Blocks until it returns.
    pub fn call_blocking(
        &self,
        function: Function,
        args: Vec<HostValue>,
        kwargs: Kwargs<AccessHandle>,
    ) -> Result<HostValue> {
        run(&self.context, self.id, function, args, kwargs)
    }
}

fn run(
    context: &Mutex<ExecutionContext>,
    id: ContextId,
    function: Function,
    args: Vec<HostValue>,
    kwargs: Kwargs<AccessHandle>,
) -> Result<HostValue> {
    let (args, kwargs) = local_args(args, kwargs)?;
    let mut context = context
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    catch_panic(|| function.invoke(Scope::Context(&mut *context), args, kwargs))
        .map(from_local)
        .map_err(|err| WardenError::from_remote(err, Some(id)))
}

#[async_trait]
impl ContextAccess for InProcessContext {
    fn context_id(&self) -> ContextId {
        self.id
    }

    async fn call(
        &self,
        function: Function,
        args: Vec<HostValue>,
        kwargs: Kwargs<AccessHandle>,
    ) -> Result<HostValue> {
        let context = Arc::clone(&self.context);
        let id = self.id;
        match tokio::task::spawn_blocking(move || run(&context, id, function, args, kwargs)).await
        {
            Ok(result) => result,
            Err(e) => Err(WardenError::Remote(RemoteError::internal(format!(
                "{}() did not finish: {}",
                function, e
            )))),
        }
    }
}
