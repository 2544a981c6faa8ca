//! The closed set of functions a worker will run.
//!
//! Requests name a [`Function`] by its stable string tag; nothing else on the
//! wire can cause code to run in the worker.

pub mod object;

use crate::context::{ExecutionContext, Scope};
use crate::value::{ErrorKind, Kwargs, RemoteError, Value};
use object::{DirectObject, LocalValue, ModuleObject, ObjectRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A callable operation, identified on the wire by its snake_case tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Function {
    // Administrative (no context)
    GetSysPath,
    GetEnvironmentInfo,

    // Context functions
    Echo,
    CreateSimpleObject,
    GetCompiledMethodReturn,
    LoadModule,
    IterModuleNames,
    SafeLiteralEval,
    StoreValue,
    FetchValue,

    // Diagnostics
    TestRaiseError,
    TestPrint,
    TestPanic,
    TestSleep,
    TestExit,
}

impl Function {
    pub fn as_str(&self) -> &'static str {
        match self {
            Function::GetSysPath => "get_sys_path",
            Function::GetEnvironmentInfo => "get_environment_info",
            Function::Echo => "echo",
            Function::CreateSimpleObject => "create_simple_object",
            Function::GetCompiledMethodReturn => "get_compiled_method_return",
            Function::LoadModule => "load_module",
            Function::IterModuleNames => "iter_module_names",
            Function::SafeLiteralEval => "safe_literal_eval",
            Function::StoreValue => "store_value",
            Function::FetchValue => "fetch_value",
            Function::TestRaiseError => "test_raise_error",
            Function::TestPrint => "test_print",
            Function::TestPanic => "test_panic",
            Function::TestSleep => "test_sleep",
            Function::TestExit => "test_exit",
        }
    }

    /// Whether the function must run inside an execution context.
    pub fn requires_context(&self) -> bool {
        !matches!(self, Function::GetSysPath | Function::GetEnvironmentInfo)
    }

    /// Run the function.
    ///
    /// Administrative functions need [`Scope::Global`] and every other
    /// function needs [`Scope::Context`]; the wrong pairing is a `type` error.
    pub fn invoke(
        self,
        scope: Scope<'_>,
        args: Vec<LocalValue>,
        kwargs: Kwargs<ObjectRef>,
    ) -> Result<LocalValue, RemoteError> {
        debug!("invoking {} with {} args", self.as_str(), args.len());
        let mut call = CallArgs {
            function: self,
            args,
            kwargs,
        };

        let context = match scope {
            Scope::Global(info) => {
                return match self {
                    Function::GetSysPath => Ok(info.sys_path_value()),
                    Function::GetEnvironmentInfo => Ok(info.describe()),
                    _ => Err(RemoteError::type_error(format!(
                        "{}() must run inside an execution context",
                        self.as_str()
                    ))),
                };
            }
            Scope::Context(context) => context,
        };

        match self {
            Function::GetSysPath | Function::GetEnvironmentInfo => {
                Err(RemoteError::type_error(format!(
                    "{}() is administrative and takes no context",
                    self.as_str()
                )))
            }
            Function::Echo => Ok(echo(call)),
            Function::CreateSimpleObject => {
                let value = call.required(0, "value")?;
                Ok(Value::Handle(DirectObject::from_value(value)))
            }
            Function::GetCompiledMethodReturn => {
                let object = call.object(0, "handle")?;
                let method = call.string(1, "method")?;
                let method_args = match call.take(2, "args") {
                    None | Some(Value::Nil) => vec![],
                    Some(Value::List(items)) => items,
                    Some(other) => vec![other],
                };
                DirectObject::call_method(&object, &method, &method_args)
            }
            Function::LoadModule => {
                let path = PathBuf::from(call.string(0, "path")?);
                load_module(context, &path)
            }
            Function::IterModuleNames => {
                let paths = match call.required(0, "paths")? {
                    Value::List(items) => items,
                    single => vec![single],
                };
                let dirs = paths
                    .iter()
                    .map(|p| {
                        p.as_str().map(PathBuf::from).ok_or_else(|| {
                            RemoteError::type_error(format!(
                                "iter_module_names() paths must be strings, got {}",
                                p.type_name()
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::List(
                    iter_module_names(&dirs)
                        .into_iter()
                        .map(Value::Str)
                        .collect(),
                ))
            }
            Function::SafeLiteralEval => {
                let source = call.string(0, "source")?;
                safe_literal_eval(&source)
            }
            Function::StoreValue => {
                let name = call.string(0, "name")?;
                let value = call.required(1, "value")?;
                Ok(context.variables.insert(name, value).unwrap_or_default())
            }
            Function::FetchValue => {
                let name = call.string(0, "name")?;
                context.variables.get(&name).cloned().ok_or_else(|| {
                    RemoteError::key(format!("no value stored under '{}'", name))
                        .with_field("key", Value::Str(name))
                })
            }
            Function::TestRaiseError => {
                let kind = call
                    .optional_string(0, "kind")?
                    .map(ErrorKind::from)
                    .unwrap_or(ErrorKind::Value);
                let message = call
                    .optional_string(1, "message")?
                    .unwrap_or_else(|| "test error".to_string());
                Err(RemoteError::new(kind, message))
            }
            Function::TestPrint => {
                // stdout is the protocol channel; only stderr text is emitted.
                if let Some(text) = call.optional_string(usize::MAX, "stderr")? {
                    let mut stderr = std::io::stderr().lock();
                    let _ = writeln!(stderr, "{}", text);
                    let _ = stderr.flush();
                }
                Ok(Value::Nil)
            }
            Function::TestPanic => {
                let message = call
                    .optional_string(0, "message")?
                    .unwrap_or_else(|| "test panic".to_string());
                panic!("{}", message);
            }
            Function::TestSleep => {
                let ms = call.int(0, "ms")?;
                std::thread::sleep(Duration::from_millis(ms.max(0) as u64));
                Ok(Value::Nil)
            }
            Function::TestExit => {
                if context.worker().same_process {
                    return Err(RemoteError::internal(
                        "test_exit() cannot terminate the host process",
                    ));
                }
                let code = call.optional_int(0, "code")?.unwrap_or(1);
                if let Some(text) = call.optional_string(usize::MAX, "stderr")? {
                    let mut stderr = std::io::stderr().lock();
                    let _ = writeln!(stderr, "{}", text);
                    let _ = stderr.flush();
                }
                std::process::exit(code as i32);
            }
        }
    }
}

/// Run `f`, turning a panic into an `internal` error.
pub(crate) fn catch_panic(
    f: impl FnOnce() -> std::result::Result<LocalValue, RemoteError>,
) -> std::result::Result<LocalValue, RemoteError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "function panicked".to_string());
            warn!("function panicked: {}", message);
            Err(RemoteError::internal(format!("panic: {}", message)))
        }
    }
}

impl std::fmt::Display for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of one call, taken by position or by keyword.
struct CallArgs {
    function: Function,
    args: Vec<LocalValue>,
    kwargs: Kwargs<ObjectRef>,
}

impl CallArgs {
    fn take(&mut self, index: usize, name: &str) -> Option<LocalValue> {
        if let Some(value) = self.kwargs.remove(name) {
            return Some(value);
        }
        self.args.get_mut(index).map(std::mem::take)
    }

    fn required(&mut self, index: usize, name: &str) -> Result<LocalValue, RemoteError> {
        self.take(index, name).ok_or_else(|| {
            RemoteError::type_error(format!(
                "{}() missing required argument '{}'",
                self.function, name
            ))
        })
    }

    fn wrong_type(&self, name: &str, expected: &str, got: &LocalValue) -> RemoteError {
        RemoteError::type_error(format!(
            "{}() argument '{}' must be {}, not {}",
            self.function,
            name,
            expected,
            got.type_name()
        ))
    }

    fn string(&mut self, index: usize, name: &str) -> Result<String, RemoteError> {
        match self.required(index, name)? {
            Value::Str(s) => Ok(s),
            other => Err(self.wrong_type(name, "str", &other)),
        }
    }

    fn optional_string(&mut self, index: usize, name: &str) -> Result<Option<String>, RemoteError> {
        match self.take(index, name) {
            None | Some(Value::Nil) => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s)),
            Some(other) => Err(self.wrong_type(name, "str", &other)),
        }
    }

    fn int(&mut self, index: usize, name: &str) -> Result<i64, RemoteError> {
        match self.required(index, name)? {
            Value::Int(i) => Ok(i),
            other => Err(self.wrong_type(name, "int", &other)),
        }
    }

    fn optional_int(&mut self, index: usize, name: &str) -> Result<Option<i64>, RemoteError> {
        match self.take(index, name) {
            None | Some(Value::Nil) => Ok(None),
            Some(Value::Int(i)) => Ok(Some(i)),
            Some(other) => Err(self.wrong_type(name, "int", &other)),
        }
    }

    fn object(&mut self, index: usize, name: &str) -> Result<ObjectRef, RemoteError> {
        match self.required(index, name)? {
            Value::Handle(object) => Ok(object),
            other => Err(self.wrong_type(name, "a handle", &other)),
        }
    }
}

fn echo(mut call: CallArgs) -> LocalValue {
    if let Some(value) = call.kwargs.remove("value") {
        return value;
    }
    if call.args.len() == 1 {
        return call.args.pop().unwrap_or_default();
    }
    Value::List(call.args)
}

fn load_module(context: &mut ExecutionContext, path: &Path) -> Result<LocalValue, RemoteError> {
    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if let Some(module) = context.modules.get(&key) {
        return Ok(Value::Handle(Arc::clone(module)));
    }
    let module = ModuleObject::load(path)
        .map_err(|e| RemoteError::io(&e, format!("cannot load module {}", path.display())))?;
    debug!("context {} loaded module {}", context.id(), module.name);
    let object = Arc::new(DirectObject::Module(module));
    context.modules.insert(key, Arc::clone(&object));
    Ok(Value::Handle(object))
}

/// Module names found directly inside `dirs`.
///
/// A name is either a subdirectory that is a valid identifier or the stem of
/// a file. Unreadable directories are skipped. The result is sorted and free
/// of duplicates.
pub fn iter_module_names(dirs: &[PathBuf]) -> Vec<String> {
    let mut names = BTreeSet::new();
    for dir in dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("skipping module directory {}: {}", dir.display(), e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let name = if is_dir {
                path.file_name()
            } else {
                path.file_stem()
            };
            let Some(name) = name.and_then(|n| n.to_str()) else {
                continue;
            };
            if is_identifier(name) {
                names.insert(name.to_string());
            }
        }
    }
    names.into_iter().collect()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// Parse a literal without running anything.
///
/// Accepts JSON syntax; anything else is a `value` error.
pub fn safe_literal_eval<H>(source: &str) -> Result<Value<H>, RemoteError> {
    let parsed: serde_json::Value = serde_json::from_str(source).map_err(|e| {
        RemoteError::value(format!("malformed literal: {}", e))
            .with_field("source", Value::Str(source.to_string()))
    })?;
    Ok(from_json(parsed))
}

fn from_json<H>(json: serde_json::Value) -> Value<H> {
    match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::Str(s),
        serde_json::Value::Array(items) => Value::List(items.into_iter().map(from_json).collect()),
        serde_json::Value::Object(entries) => Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k, from_json(v)))
                .collect(),
        ),
    }
}
