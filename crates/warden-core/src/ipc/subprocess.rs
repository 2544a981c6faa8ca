//! Host side of the pipe: owns the worker process and the request cycle.
//!
//! One request is in flight at a time; [`SubprocessManager::call`] holds the
//! process lock for the whole send/receive cycle. Any transport failure marks
//! the manager as crashed, and a crashed manager never respawns its worker.
//!
//! # Thread Safety
//!
//! The process and its pipes sit behind a tokio `Mutex`. The context deletion
//! queue is a plain `std::sync::Mutex` so it can be fed from `Drop`.

use super::protocol::{read_message, write_message, Request, Response};
use crate::config::{SubprocessConfig, WorkerConfig};
use crate::functions::Function;
use crate::value::{ContextId, HandleId, Kwargs, Value, WireValue};
use crate::{Result, WardenError};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Background reader of the worker's stderr.
///
/// Lines go into a bounded queue; when the queue is full new lines are
/// dropped and counted so the worker never blocks on a full stderr pipe.
struct StderrDrain {
    lines: mpsc::Receiver<String>,
    dropped: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl StderrDrain {
    fn start(stderr: ChildStderr) -> Self {
        let (tx, rx) = mpsc::channel(WorkerConfig::STDERR_QUEUE_CAPACITY);
        let dropped = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dropped);

        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf)
                            .trim_end_matches(['\r', '\n'])
                            .to_string();
                        if tx.try_send(line).is_err() {
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        });

        Self {
            lines: rx,
            dropped,
            task,
        }
    }

    /// Lines queued so far, without waiting.
    fn take_queued(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.lines.try_recv() {
            lines.push(line);
        }
        lines
    }

    /// Lines until the stream closes or `wait` runs out.
    async fn take_remaining(&mut self, wait: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut lines = Vec::new();
        while let Ok(Some(line)) = tokio::time::timeout_at(deadline, self.lines.recv()).await {
            lines.push(line);
        }
        lines
    }

    fn take_dropped(&self) -> usize {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

impl Drop for StderrDrain {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A running worker and its pipe endpoints.
struct WorkerProcess {
    child: Child,
    pid: u32,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    stderr: StderrDrain,
}

/// Owner of one worker process.
pub struct SubprocessManager {
    config: SubprocessConfig,
    process: Mutex<Option<WorkerProcess>>,
    crashed: AtomicBool,
    shut_down: AtomicBool,
    pid: AtomicU32,
    deletion_queue: std::sync::Mutex<VecDeque<ContextId>>,
    discard_counts: std::sync::Mutex<HashMap<ContextId, u64>>,
    next_context_id: AtomicU64,
}

impl std::fmt::Debug for SubprocessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprocessManager")
            .field("executable", &self.config.executable)
            .field("pid", &self.pid())
            .field("crashed", &self.is_crashed())
            .finish()
    }
}

impl SubprocessManager {
    /// Create a manager. The worker is spawned on first use.
    pub fn new(config: SubprocessConfig) -> Self {
        Self {
            config,
            process: Mutex::new(None),
            crashed: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            pid: AtomicU32::new(0),
            deletion_queue: std::sync::Mutex::new(VecDeque::new()),
            discard_counts: std::sync::Mutex::new(HashMap::new()),
            next_context_id: AtomicU64::new(1),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.config.executable
    }

    /// Whether the worker has died or failed to start. Never resets.
    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// PID of the running worker, if one was started and is still owned.
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// A context id not yet used with this manager's worker.
    pub fn allocate_context_id(&self) -> ContextId {
        self.next_context_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Spawn the worker if it is not running yet.
    pub async fn ensure_started(&self) -> Result<()> {
        let mut slot = self.process.lock().await;
        self.start_locked(&mut slot)
    }

    /// Run `function` in the worker.
    ///
    /// `context_id = None` runs an administrative function. Pending context
    /// deletions are sent first, each as its own discard request.
    pub async fn call(
        &self,
        context_id: Option<ContextId>,
        function: Function,
        args: Vec<WireValue>,
        kwargs: Kwargs<HandleId>,
    ) -> Result<WireValue> {
        let mut slot = self.process.lock().await;
        self.start_locked(&mut slot)?;

        // From the first write until the last reply is read, dropping this
        // future would leave the pipe out of step with the worker.
        let mut cycle = Exchange {
            manager: self,
            slot,
            armed: true,
        };

        for id in self.take_pending_deletions() {
            debug!("discarding context {} in worker", id);
            let response = self.exchange(&mut cycle.slot, &Request::discard(id)).await?;
            if let Err(err) = response.into_result() {
                warn!("worker refused to discard context {}: {}", id, err);
            }
        }

        debug!("calling {} in context {:?}", function, context_id);
        let request = Request {
            context_id,
            function: Some(function),
            args,
            kwargs,
        };
        let response = self.exchange(&mut cycle.slot, &request).await?;
        cycle.armed = false;

        if let Some(process) = cycle.slot.as_mut() {
            forward_stderr(&mut process.stderr);
        }

        response
            .into_result()
            .map_err(|err| WardenError::from_remote(err, context_id))
    }

    /// The worker's effective search path.
    pub async fn get_sys_path(&self) -> Result<Vec<PathBuf>> {
        let payload = self
            .call(None, Function::GetSysPath, vec![], Kwargs::new())
            .await?;
        let items = match payload {
            Value::List(items) => items,
            other => {
                return Err(WardenError::Codec {
                    message: format!("get_sys_path returned a {}", other.type_name()),
                })
            }
        };
        items
            .into_iter()
            .map(|item| match item {
                Value::Str(path) => Ok(PathBuf::from(path)),
                other => Err(WardenError::Codec {
                    message: format!("get_sys_path entry is a {}", other.type_name()),
                }),
            })
            .collect()
    }

    /// Version, pid and spawn arguments as seen by the worker.
    pub async fn get_environment_info(&self) -> Result<WireValue> {
        self.call(None, Function::GetEnvironmentInfo, vec![], Kwargs::new())
            .await
    }

    /// Queue `context_id` for discarding. Sent before the next call.
    ///
    /// Handles minted under the context before this point turn stale, even
    /// if the id is used again afterwards.
    pub fn delete_context(&self, context_id: ContextId) {
        *self
            .discard_counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(context_id)
            .or_insert(0) += 1;
        self.queue_discard(context_id);
    }

    /// How many times `context_id` has been deleted through
    /// [`SubprocessManager::delete_context`].
    pub fn discard_count(&self, context_id: ContextId) -> u64 {
        self.discard_counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&context_id)
            .copied()
            .unwrap_or(0)
    }

    /// Queue a discard for a context nobody will use again.
    pub(crate) fn queue_discard(&self, context_id: ContextId) {
        if self.is_crashed() {
            return;
        }
        self.queue().push_back(context_id);
    }

    /// Context ids queued for discarding.
    pub fn pending_deletions(&self) -> Vec<ContextId> {
        self.queue().iter().copied().collect()
    }

    /// Stop the worker.
    ///
    /// Closes the worker's stdin so it exits on EOF, then kills it if it is
    /// still alive after [`WorkerConfig::SHUTDOWN_GRACE`]. Later calls fail
    /// as unavailable.
    pub async fn shutdown(&self) {
        let mut slot = self.process.lock().await;
        self.shut_down.store(true, Ordering::SeqCst);
        let Some(mut process) = slot.take() else {
            return;
        };
        self.pid.store(0, Ordering::SeqCst);
        info!("Shutting down worker {}", process.pid);

        drop(process.stdin.take());
        let waited = tokio::time::timeout(WorkerConfig::SHUTDOWN_GRACE, process.child.wait()).await;
        match waited {
            Ok(Ok(status)) => info!("Worker {} exited with {}", process.pid, status),
            Ok(Err(e)) => warn!("Failed to wait for worker {}: {}", process.pid, e),
            Err(_) => {
                warn!(
                    "Worker {} still running after {:?}, killing",
                    process.pid,
                    WorkerConfig::SHUTDOWN_GRACE
                );
                if let Err(e) = process.child.kill().await {
                    warn!("Failed to kill worker {}: {}", process.pid, e);
                }
            }
        }

        for line in process
            .stderr
            .take_remaining(WorkerConfig::CRASH_STDERR_WAIT)
            .await
        {
            warn!("worker stderr: {}", line);
        }
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<ContextId>> {
        self.deletion_queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_pending_deletions(&self) -> Vec<ContextId> {
        self.queue().drain(..).collect()
    }

    fn unavailable(&self) -> WardenError {
        let reason = if self.is_crashed() {
            "the worker crashed earlier"
        } else {
            "the manager was shut down"
        };
        WardenError::SubprocessUnavailable {
            executable: self.config.executable.clone(),
            reason: reason.to_string(),
        }
    }

    fn start_locked(&self, slot: &mut Option<WorkerProcess>) -> Result<()> {
        if self.is_crashed() || self.shut_down.load(Ordering::SeqCst) {
            return Err(self.unavailable());
        }
        if slot.is_some() {
            return Ok(());
        }
        match self.spawn() {
            Ok(process) => {
                self.pid.store(process.pid, Ordering::SeqCst);
                *slot = Some(process);
                Ok(())
            }
            Err(e) => {
                self.crashed.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn spawn(&self) -> Result<WorkerProcess> {
        self.config.validate()?;

        let mut cmd = Command::new(&self.config.executable);
        cmd.args(self.config.command_args());
        for (key, value) in &self.config.env_vars {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        {
            // Keep the worker from opening a console window
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        info!("Launching worker {}", self.config.executable.display());

        let mut child = cmd.spawn().map_err(|source| {
            error!("Failed to spawn worker: {}", source);
            WardenError::Spawn {
                executable: self.config.executable.clone(),
                source,
            }
        })?;

        let missing_pipe = |name: &str| WardenError::Io {
            message: format!("worker {} was not piped", name),
            source: None,
        };
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;
        let pid = child.id().unwrap_or(0);

        info!("Launched worker with PID {}", pid);

        Ok(WorkerProcess {
            child,
            pid,
            stdin: Some(stdin),
            stdout,
            stderr: StderrDrain::start(stderr),
        })
    }

    /// Send one request and read its response.
    async fn exchange(
        &self,
        slot: &mut Option<WorkerProcess>,
        request: &Request,
    ) -> Result<Response> {
        let Some(process) = slot.as_mut() else {
            return Err(self.unavailable());
        };

        let sent = match process.stdin.as_mut() {
            Some(stdin) => write_message(stdin, request).await,
            None => Err(WardenError::Io {
                message: "worker stdin is closed".to_string(),
                source: None,
            }),
        };
        if let Err(e) = sent {
            return Err(self.crash(slot, format!("failed to send request: {}", e)).await);
        }

        let received = read_message::<Response, _>(&mut process.stdout).await;
        match received {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(self.crash(slot, "worker closed its output".to_string()).await),
            Err(e) => Err(self
                .crash(slot, format!("failed to read response: {}", e))
                .await),
        }
    }

    /// Mark the manager crashed, tear the worker down, and build the error.
    ///
    /// Whatever the worker wrote to stderr is included in the message.
    async fn crash(&self, slot: &mut Option<WorkerProcess>, reason: String) -> WardenError {
        self.crashed.store(true, Ordering::SeqCst);
        self.pid.store(0, Ordering::SeqCst);
        self.queue().clear();

        let mut message = reason;
        if let Some(mut process) = slot.take() {
            let _ = process.child.start_kill();
            if let Ok(status) = process.child.wait().await {
                message.push_str(&format!("; worker {}", status));
            }
            let lines = process
                .stderr
                .take_remaining(WorkerConfig::CRASH_STDERR_WAIT)
                .await;
            if !lines.is_empty() {
                message.push_str("\nstderr:\n");
                message.push_str(&lines.join("\n"));
            }
            error!("Worker {} crashed: {}", process.pid, message);
        }

        WardenError::SubprocessCrashed {
            executable: self.config.executable.clone(),
            message,
        }
    }
}

/// One request cycle holding the process lock.
///
/// Dropped while armed means the caller gave up between a write and its
/// reply. The worker is then abandoned the same way as after a crash.
struct Exchange<'a> {
    manager: &'a SubprocessManager,
    slot: MutexGuard<'a, Option<WorkerProcess>>,
    armed: bool,
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(mut process) = self.slot.take() else {
            return;
        };
        let manager = self.manager;
        manager.crashed.store(true, Ordering::SeqCst);
        manager.pid.store(0, Ordering::SeqCst);
        manager.queue().clear();
        if let Err(e) = process.child.start_kill() {
            warn!("Failed to kill worker {}: {}", process.pid, e);
        }
        error!(
            "Call to worker {} was cancelled mid-exchange, worker abandoned",
            process.pid
        );
    }
}

/// Relay queued worker stderr into the log.
fn forward_stderr(drain: &mut StderrDrain) {
    for line in drain.take_queued() {
        warn!("worker stderr: {}", line);
    }
    let dropped = drain.take_dropped();
    if dropped > 0 {
        warn!("dropped {} worker stderr lines (queue full)", dropped);
    }
}
