//! Execution contexts and worker-wide information.
//!
//! An [`ExecutionContext`] owns every object handed out under its id: the
//! handle registry, named scratch values, and loaded modules all die with it.

use crate::functions::object::{DirectObject, LocalValue, ObjectRef};
use crate::registry::HandleRegistry;
use crate::value::{ContextId, RemoteError, Value, WireValue};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

/// Facts about the process functions run in.
#[derive(Debug, Clone, Default)]
pub struct WorkerInfo {
    /// Peer library location passed by the host at spawn.
    pub peer_library: Option<PathBuf>,
    /// Host version triple passed at spawn.
    pub host_version: Option<String>,
    /// Directories searched before `PATH`.
    pub search_paths: Vec<PathBuf>,
    /// Functions run inside the host process itself.
    pub same_process: bool,
}

impl WorkerInfo {
    /// Info for functions run directly in the current (host) process.
    pub fn same_process() -> Self {
        Self {
            same_process: true,
            ..Self::default()
        }
    }

    /// Effective search path: explicit entries first, then `PATH`.
    pub fn sys_path(&self) -> Vec<PathBuf> {
        let mut paths = self.search_paths.clone();
        if let Some(path_var) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&path_var));
        }
        paths
    }

    pub fn sys_path_value<H>(&self) -> Value<H> {
        Value::List(
            self.sys_path()
                .into_iter()
                .map(|p| Value::Str(p.to_string_lossy().into_owned()))
                .collect(),
        )
    }

    /// Summary of the process, as returned by `get_environment_info`.
    pub fn describe<H>(&self) -> Value<H> {
        let optional = |s: Option<String>| s.map(Value::Str).unwrap_or(Value::Nil);

        let mut info = BTreeMap::new();
        info.insert(
            "version".to_string(),
            Value::Str(env!("CARGO_PKG_VERSION").to_string()),
        );
        info.insert("pid".to_string(), Value::Int(i64::from(std::process::id())));
        info.insert(
            "executable".to_string(),
            optional(
                std::env::current_exe()
                    .ok()
                    .map(|p| p.to_string_lossy().into_owned()),
            ),
        );
        info.insert(
            "peer_library".to_string(),
            optional(
                self.peer_library
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
            ),
        );
        info.insert(
            "host_version".to_string(),
            optional(self.host_version.clone()),
        );
        info.insert("same_process".to_string(), Value::Bool(self.same_process));
        Value::Map(info)
    }
}

/// Worker-side state of one context id.
#[derive(Debug)]
pub struct ExecutionContext {
    id: ContextId,
    handles: HandleRegistry<DirectObject>,
    pub(crate) variables: HashMap<String, LocalValue>,
    pub(crate) modules: HashMap<PathBuf, ObjectRef>,
    worker: Arc<WorkerInfo>,
}

impl ExecutionContext {
    pub fn new(id: ContextId, worker: Arc<WorkerInfo>) -> Self {
        Self {
            id,
            handles: HandleRegistry::new(),
            variables: HashMap::new(),
            modules: HashMap::new(),
            worker,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn worker(&self) -> &WorkerInfo {
        &self.worker
    }

    /// Number of objects that have crossed the boundary from this context.
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Replace handle ids in an incoming payload by the objects they name.
    pub fn resolve(&self, value: WireValue) -> Result<LocalValue, RemoteError> {
        value.try_map_handles(&mut |id| {
            self.handles
                .lookup(id)
                .map_err(|missing| RemoteError::stale_handle(missing.0))
        })
    }

    /// Replace objects in an outgoing payload by their handle ids.
    pub fn export(&mut self, value: LocalValue) -> WireValue {
        value.map_handles(&mut |object| self.handles.get_or_create(&object))
    }
}

/// Where a function runs.
pub enum Scope<'a> {
    /// No context: administrative functions only.
    Global(&'a WorkerInfo),
    Context(&'a mut ExecutionContext),
}

impl Scope<'_> {
    pub fn worker(&self) -> &WorkerInfo {
        match self {
            Scope::Global(info) => *info,
            Scope::Context(context) => context.worker(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ErrorKind, HandleId};

    #[test]
    fn test_export_then_resolve_returns_same_object() {
        let mut context = ExecutionContext::new(1, Arc::new(WorkerInfo::default()));
        let object = DirectObject::from_value(Value::Str("payload".into()));

        let wire = context.export(Value::List(vec![
            Value::Handle(Arc::clone(&object)),
            Value::Handle(Arc::clone(&object)),
        ]));
        let ids = wire.as_list().unwrap();
        assert_eq!(ids[0], ids[1]);
        assert_eq!(context.handle_count(), 1);

        let resolved = context.resolve(ids[0].clone()).unwrap();
        assert!(Arc::ptr_eq(resolved.as_handle().unwrap(), &object));
    }

    #[test]
    fn test_resolve_unknown_handle_is_stale() {
        let context = ExecutionContext::new(1, Arc::new(WorkerInfo::default()));
        let err = context.resolve(Value::Handle(HandleId(9))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StaleHandle);
        assert_eq!(err.handle_id(), Some(HandleId(9)));
    }

    #[test]
    fn test_sys_path_puts_search_paths_first() {
        let info = WorkerInfo {
            search_paths: vec![PathBuf::from("/opt/first")],
            ..WorkerInfo::default()
        };
        assert_eq!(info.sys_path()[0], PathBuf::from("/opt/first"));
    }

    #[test]
    fn test_describe_reports_host_version() {
        let info = WorkerInfo {
            host_version: Some("1.4.0".into()),
            ..WorkerInfo::default()
        };
        let described: WireValue = info.describe();
        let map = described.as_map().unwrap();
        assert_eq!(map["host_version"], Value::Str("1.4.0".into()));
        assert_eq!(map["peer_library"], Value::Nil);
        assert_eq!(map["pid"], Value::Int(i64::from(std::process::id())));
    }
}
