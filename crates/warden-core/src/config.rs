//! Centralized configuration for warden.
//!
//! Protocol and process limits live in [`WorkerConfig`]; how a particular
//! worker gets spawned is described by a [`SubprocessConfig`].

use crate::error::{Result, WardenError};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Worker protocol and lifecycle limits.
pub struct WorkerConfig;

impl WorkerConfig {
    pub const WORKER_BIN_NAME: &'static str = "warden-worker";
    pub const EXECUTABLE_ENV_VAR: &'static str = "WARDEN_WORKER_EXE";
    pub const SEARCH_PATH_FLAG: &'static str = "--search-path";

    // Wire limits
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024; // 64MB

    // Diagnostic stream
    pub const STDERR_QUEUE_CAPACITY: usize = 1024;

    // Teardown
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
    pub const CRASH_STDERR_WAIT: Duration = Duration::from_millis(500);
}

/// How to spawn a worker process.
///
/// The worker is started as
/// `<executable> <peer_library> <host_version> [extra_args...]`.
#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    /// Path to the worker executable.
    pub executable: PathBuf,
    /// Location of the host's peer library, passed as the first argument.
    pub peer_library: PathBuf,
    /// Semantic version triple of the host, passed as the second argument.
    pub host_version: String,
    /// Additional arguments appended after the contract arguments.
    pub extra_args: Vec<String>,
    /// Environment variables to set for the worker.
    pub env_vars: HashMap<String, String>,
}

impl SubprocessConfig {
    /// Create a config for `executable` with the current host's defaults.
    pub fn new(executable: impl AsRef<Path>) -> Self {
        let peer_library = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            executable: executable.as_ref().to_path_buf(),
            peer_library,
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            extra_args: vec![],
            env_vars: HashMap::new(),
        }
    }

    /// Locate the worker executable.
    ///
    /// Uses `WARDEN_WORKER_EXE` when set, otherwise looks for `warden-worker`
    /// next to the current executable.
    pub fn from_env() -> Result<Self> {
        if let Some(path) = std::env::var_os(WorkerConfig::EXECUTABLE_ENV_VAR) {
            return Ok(Self::new(PathBuf::from(path)));
        }

        let exe = std::env::current_exe()?;
        let dir = exe.parent().ok_or_else(|| WardenError::Config {
            message: format!("{} has no parent directory", exe.display()),
        })?;
        let candidate = dir.join(format!(
            "{}{}",
            WorkerConfig::WORKER_BIN_NAME,
            std::env::consts::EXE_SUFFIX
        ));
        if !candidate.exists() {
            return Err(WardenError::Config {
                message: format!(
                    "worker executable not found at {} (set {})",
                    candidate.display(),
                    WorkerConfig::EXECUTABLE_ENV_VAR
                ),
            });
        }
        Ok(Self::new(candidate))
    }

    /// Set the peer library location.
    pub fn with_peer_library(mut self, path: impl AsRef<Path>) -> Self {
        self.peer_library = path.as_ref().to_path_buf();
        self
    }

    /// Set the host version triple.
    pub fn with_host_version(mut self, version: impl Into<String>) -> Self {
        self.host_version = version.into();
        self
    }

    /// Add an extra argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Prepend a directory to the worker's search path.
    pub fn with_search_path(mut self, path: impl AsRef<Path>) -> Self {
        self.extra_args
            .push(WorkerConfig::SEARCH_PATH_FLAG.to_string());
        self.extra_args
            .push(path.as_ref().to_string_lossy().into_owned());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Check the config before spawning.
    pub fn validate(&self) -> Result<()> {
        if self.executable.as_os_str().is_empty() {
            return Err(WardenError::Validation {
                field: "executable".to_string(),
                message: "worker executable path is empty".to_string(),
            });
        }
        semver::Version::parse(&self.host_version).map_err(|e| WardenError::Validation {
            field: "host_version".to_string(),
            message: format!("'{}' is not a version triple: {}", self.host_version, e),
        })?;
        Ok(())
    }

    /// Full argument list passed to the worker.
    pub fn command_args(&self) -> Vec<OsString> {
        let mut args = vec![
            self.peer_library.clone().into_os_string(),
            OsString::from(&self.host_version),
        ];
        args.extend(self.extra_args.iter().map(OsString::from));
        args
    }
}
