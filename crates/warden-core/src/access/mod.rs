//! Caller-side access to execution contexts.
//!
//! [`ContextAccess`] is the one call surface consumers see. It is implemented
//! by [`ContextProxy`] (forwarding to a worker process) and by
//! [`InProcessContext`] (running functions directly in the host).

mod handle;
mod proxy;
mod same_process;

pub use handle::{AccessHandle, HostValue, RemoteObject};
pub use proxy::ContextProxy;
pub use same_process::InProcessContext;

use crate::functions::Function;
use crate::value::{ContextId, Kwargs, Value};
use crate::Result;
use async_trait::async_trait;
use std::path::Path;

/// Run functions inside one execution context.
#[async_trait]
pub trait ContextAccess: Send + Sync {
    /// Id of the context this accessor is bound to.
    fn context_id(&self) -> ContextId;

    /// Run `function` with the given arguments and return its result.
    async fn call(
        &self,
        function: Function,
        args: Vec<HostValue>,
        kwargs: Kwargs<AccessHandle>,
    ) -> Result<HostValue>;

    async fn echo(&self, value: HostValue) -> Result<HostValue> {
        self.call(Function::Echo, vec![value], Kwargs::new()).await
    }

    /// Wrap `value` into a live object and return its handle.
    async fn create_simple_object(&self, value: HostValue) -> Result<AccessHandle> {
        let result = self
            .call(Function::CreateSimpleObject, vec![value], Kwargs::new())
            .await?;
        expect_handle(Function::CreateSimpleObject, result)
    }

    async fn load_module(&self, path: &Path) -> Result<AccessHandle> {
        let mut kwargs = Kwargs::new();
        kwargs.insert(
            "path".to_string(),
            Value::Str(path.to_string_lossy().into_owned()),
        );
        let result = self.call(Function::LoadModule, vec![], kwargs).await?;
        expect_handle(Function::LoadModule, result)
    }

    async fn iter_module_names(&self, paths: &[&Path]) -> Result<Vec<String>> {
        let paths: Vec<HostValue> = paths
            .iter()
            .map(|p| Value::Str(p.to_string_lossy().into_owned()))
            .collect();
        let result = self
            .call(Function::IterModuleNames, vec![Value::List(paths)], Kwargs::new())
            .await?;
        match result {
            Value::List(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Str(name) => Ok(name),
                    other => Err(unexpected(Function::IterModuleNames, &other)),
                })
                .collect(),
            other => Err(unexpected(Function::IterModuleNames, &other)),
        }
    }

    async fn safe_literal_eval(&self, source: &str) -> Result<HostValue> {
        self.call(
            Function::SafeLiteralEval,
            vec![Value::Str(source.to_string())],
            Kwargs::new(),
        )
        .await
    }

    /// Store `value` under `name`, returning the previous value or nil.
    async fn store_value(&self, name: &str, value: HostValue) -> Result<HostValue> {
        self.call(
            Function::StoreValue,
            vec![Value::Str(name.to_string()), value],
            Kwargs::new(),
        )
        .await
    }

    async fn fetch_value(&self, name: &str) -> Result<HostValue> {
        self.call(
            Function::FetchValue,
            vec![Value::Str(name.to_string())],
            Kwargs::new(),
        )
        .await
    }
}

fn expect_handle(function: Function, value: HostValue) -> Result<AccessHandle> {
    match value {
        Value::Handle(handle) => Ok(handle),
        other => Err(unexpected(function, &other)),
    }
}

fn unexpected(function: Function, value: &HostValue) -> crate::WardenError {
    crate::WardenError::Codec {
        message: format!("{}() returned an unexpected {}", function, value.type_name()),
    }
}
