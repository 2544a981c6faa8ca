//! Entry point for running functions in a chosen environment.

use crate::access::{ContextAccess, ContextProxy, InProcessContext};
use crate::config::SubprocessConfig;
use crate::context::WorkerInfo;
use crate::ipc::SubprocessManager;
use crate::value::WireValue;
use crate::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Where execution contexts live.
pub enum Environment {
    /// In a sandboxed worker process.
    Subprocess(Arc<SubprocessManager>),
    /// In the host process itself.
    SameProcess {
        info: Arc<WorkerInfo>,
        next_context_id: AtomicU64,
    },
}

impl Environment {
    /// A sandboxed environment. The worker starts on first use.
    pub fn subprocess(config: SubprocessConfig) -> Self {
        Self::from_manager(Arc::new(SubprocessManager::new(config)))
    }

    pub fn from_manager(manager: Arc<SubprocessManager>) -> Self {
        Environment::Subprocess(manager)
    }

    /// An environment that runs functions directly in this process.
    pub fn same_process() -> Self {
        Environment::SameProcess {
            info: Arc::new(WorkerInfo::same_process()),
            next_context_id: AtomicU64::new(1),
        }
    }

    pub fn is_sandboxed(&self) -> bool {
        matches!(self, Environment::Subprocess(_))
    }

    /// Whether the worker has died. Always false in-process.
    pub fn is_crashed(&self) -> bool {
        match self {
            Environment::Subprocess(manager) => manager.is_crashed(),
            Environment::SameProcess { .. } => false,
        }
    }

    pub fn manager(&self) -> Option<&Arc<SubprocessManager>> {
        match self {
            Environment::Subprocess(manager) => Some(manager),
            Environment::SameProcess { .. } => None,
        }
    }

    /// Open a fresh execution context.
    pub fn new_context(&self) -> Arc<dyn ContextAccess> {
        match self {
            Environment::Subprocess(manager) => Arc::new(ContextProxy::new(Arc::clone(manager))),
            Environment::SameProcess {
                info,
                next_context_id,
            } => Arc::new(InProcessContext::new(
                next_context_id.fetch_add(1, Ordering::Relaxed),
                Arc::clone(info),
            )),
        }
    }

    /// Search path of the process functions run in.
    pub async fn get_sys_path(&self) -> Result<Vec<PathBuf>> {
        match self {
            Environment::Subprocess(manager) => manager.get_sys_path().await,
            Environment::SameProcess { info, .. } => Ok(info.sys_path()),
        }
    }

    /// Version and spawn details of the process functions run in.
    pub async fn get_environment_info(&self) -> Result<WireValue> {
        match self {
            Environment::Subprocess(manager) => manager.get_environment_info().await,
            Environment::SameProcess { info, .. } => Ok(info.describe()),
        }
    }
}
