//! One isolated environment and the launcher process serving it.
//!
//! ```text
//! Created -> Launching -> Ready <-> Executing
//!               |           |          |
//!               v           v          v
//!             Failed      Exited    Exited / Failed
//! ```
//!
//! The process and its channel are owned by the [`Environment`]. A background
//! task owns the channel's read half and completes pending requests; the write
//! half is shared behind a lock. Requests are serialized by `call_gate`, so at
//! most one IMPORT or CALL is in flight at a time.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use capsule_env::{Activation, DependencySpec, Provisioner};
use capsule_protocol::{
    channel, from_value, CallPayload, ChannelReader, ChannelWriter, Completion, Envelope,
    ErrorPayload, Kwargs, LogPayload, LogStream, MessageType, ModuleInfo, PendingCalls,
    ProtocolError, ReadyPayload, Value, PROTOCOL_VERSION,
};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::ManagerConfig;
use crate::error::{Error, RemoteException, Result};
use crate::launcher::{CODE_ATTRIBUTE, CODE_MODULE};
use crate::proxy::ModuleProxy;

/// Launcher stderr lines kept for launch-failure diagnostics.
pub const STDERR_TAIL_LINES: usize = 50;

/// How long a killed process gets to be reaped before `exit` gives up.
const KILL_GRACE: Duration = Duration::from_secs(5);

const LOG_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    Created,
    Launching,
    Ready,
    Executing,
    Failed,
    Exited,
}

impl EnvironmentState {
    /// Whether the environment can serve requests.
    pub fn is_live(self) -> bool {
        matches!(self, EnvironmentState::Ready | EnvironmentState::Executing)
    }
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvironmentState::Created => "created",
            EnvironmentState::Launching => "launching",
            EnvironmentState::Ready => "ready",
            EnvironmentState::Executing => "executing",
            EnvironmentState::Failed => "failed",
            EnvironmentState::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// Per-call settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Overrides the manager's `call_timeout`.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// A call's return value together with the output it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutput {
    pub value: Value,
    /// LOG lines in arrival order.
    pub logs: Vec<LogPayload>,
}

impl CallOutput {
    pub fn decode<T: DeserializeOwned>(self) -> Result<T> {
        Ok(from_value(self.value)?)
    }
}

/// A LOG line from the environment, as seen by log subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLog {
    pub call_id: u64,
    pub stream: LogStream,
    pub text: String,
}

/// How `exit` ended the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// The process ended on its own within the grace period. `None` when it
    /// was ended by a signal.
    Graceful(Option<i32>),
    /// The process group was killed after the grace period.
    Forced,
    /// There was no process left to stop.
    AlreadyExited,
}

type CallOutcome = Result<Value>;

struct Inner {
    state: EnvironmentState,
    path: PathBuf,
    pid: Option<u32>,
    #[cfg(unix)]
    process_group_id: Option<i32>,
    /// Why the environment failed, once it has.
    failure: Option<String>,
    imported: HashSet<String>,
    reader_task: Option<JoinHandle<()>>,
}

pub struct Environment {
    name: String,
    spec: DependencySpec,
    config: Arc<ManagerConfig>,
    provisioner: Arc<dyn Provisioner>,
    inner: Mutex<Inner>,
    call_gate: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<Option<ChannelWriter<ChildStdin>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    pending: Arc<PendingCalls<CallOutcome>>,
    logs: broadcast::Sender<RemoteLog>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    me: Weak<Environment>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Environment {
    pub fn new(
        name: impl Into<String>,
        spec: DependencySpec,
        config: Arc<ManagerConfig>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Arc<Self> {
        let name = name.into();
        let path = config.envs_dir().join(&name);
        let (logs, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Arc::new_cyclic(|me| Self {
            name,
            spec,
            config,
            provisioner,
            inner: Mutex::new(Inner {
                state: EnvironmentState::Created,
                path,
                pid: None,
                #[cfg(unix)]
                process_group_id: None,
                failure: None,
                imported: HashSet::new(),
                reader_task: None,
            }),
            call_gate: tokio::sync::Mutex::new(()),
            writer: tokio::sync::Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
            pending: Arc::new(PendingCalls::new()),
            logs,
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES))),
            me: me.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &DependencySpec {
        &self.spec
    }

    /// The environment's directory: its provisioned prefix, or a plain
    /// working directory when the spec is empty.
    pub fn path(&self) -> PathBuf {
        lock(&self.inner).path.clone()
    }

    pub fn state(&self) -> EnvironmentState {
        lock(&self.inner).state
    }

    /// Process id of the running launcher.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.inner).pid
    }

    /// Whether a launcher is up and serving requests.
    pub fn launched(&self) -> bool {
        self.state().is_live()
    }

    /// The last lines the launcher wrote to stderr.
    pub fn stderr_tail(&self) -> Vec<String> {
        lock(&self.stderr_tail).iter().cloned().collect()
    }

    /// Every LOG line the environment emits from now on.
    pub fn subscribe_logs(&self) -> broadcast::Receiver<RemoteLog> {
        self.logs.subscribe()
    }

    /// The error for a request made while the environment is not live.
    fn not_live_error(&self) -> Error {
        let inner = lock(&self.inner);
        match (inner.state, &inner.failure) {
            (EnvironmentState::Failed, Some(reason)) => Error::EnvironmentCrashed {
                name: self.name.clone(),
                reason: reason.clone(),
            },
            _ => Error::EnvironmentClosed(self.name.clone()),
        }
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.state().is_live() {
            Ok(())
        } else {
            Err(self.not_live_error())
        }
    }

    /// Provision the dependencies, start the launcher and wait for READY.
    ///
    /// `timeout` bounds spawning the process and receiving READY.
    /// Provisioning is bounded separately by the manager's
    /// `provision_timeout`. Launching a live environment is a no-op.
    pub async fn launch(&self, timeout: Duration) -> Result<()> {
        {
            let mut inner = lock(&self.inner);
            match inner.state {
                EnvironmentState::Created => inner.state = EnvironmentState::Launching,
                EnvironmentState::Ready | EnvironmentState::Executing => return Ok(()),
                EnvironmentState::Launching => {
                    return Err(Error::LaunchFailed {
                        name: self.name.clone(),
                        reason: "a launch is already in progress".to_string(),
                    })
                }
                EnvironmentState::Failed | EnvironmentState::Exited => {
                    return Err(Error::EnvironmentClosed(self.name.clone()))
                }
            }
        }
        info!("[environment] Launching {}", self.name);

        match self.start(timeout).await {
            Ok(()) => {
                {
                    let mut inner = lock(&self.inner);
                    if inner.state == EnvironmentState::Launching {
                        inner.state = EnvironmentState::Ready;
                        info!(
                            "[environment] {} ready (pid {})",
                            self.name,
                            inner.pid.unwrap_or_default()
                        );
                        return Ok(());
                    }
                }
                // `exit` ran while we were starting.
                info!("[environment] {} was shut down while launching", self.name);
                self.teardown().await;
                Err(self.not_live_error())
            }
            Err(e) => {
                error!("[environment] Launch of {} failed: {}", self.name, e);
                {
                    let mut inner = lock(&self.inner);
                    if inner.state == EnvironmentState::Launching {
                        inner.state = EnvironmentState::Failed;
                    }
                }
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Kill whatever a launch left behind: the process group, the child,
    /// the writer and the reader task.
    async fn teardown(&self) {
        self.kill_process_group();
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
        }
        self.writer.lock().await.take();
        let task = {
            let mut inner = lock(&self.inner);
            inner.pid = None;
            inner.reader_task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
    }

    async fn provision(&self) -> Result<Option<Activation>> {
        if self.spec.is_empty() {
            let path = self.path();
            tokio::fs::create_dir_all(&path).await?;
            debug!("[environment] {} has no dependencies, using the host runtime", self.name);
            return Ok(None);
        }

        let limit = self.config.provision_timeout;
        let created = tokio::time::timeout(limit, self.provisioner.create_env(&self.name, &self.spec))
            .await
            .map_err(|_| Error::LaunchTimeout {
                name: self.name.clone(),
                timeout: limit,
            })?;
        let prefix = created.map_err(|e| Error::LaunchFailed {
            name: self.name.clone(),
            reason: format!("provisioning failed: {:#}", e),
        })?;
        let activation = Activation::for_prefix(&prefix);
        lock(&self.inner).path = prefix;
        Ok(Some(activation))
    }

    fn command(&self, activation: Option<&Activation>) -> Command {
        let launcher = &self.config.launcher;
        let mut cmd = Command::new(&launcher.program);
        cmd.arg("--env-name")
            .arg(&self.name)
            .arg("--log-level")
            .arg(&launcher.log_level)
            .args(&launcher.args)
            .current_dir(self.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(activation) = activation {
            cmd.envs(activation.env_vars());
        }

        #[cfg(unix)]
        cmd.process_group(0);

        cmd.kill_on_drop(true);
        cmd
    }

    async fn start(&self, timeout: Duration) -> Result<()> {
        let activation = self.provision().await?;
        if self.state() != EnvironmentState::Launching {
            return Err(self.not_live_error());
        }
        let program = self.config.launcher.program.clone();

        let mut child = self.command(activation.as_ref()).spawn().map_err(|e| Error::LaunchFailed {
            name: self.name.clone(),
            reason: format!("cannot start {}: {}", program.display(), e),
        })?;

        let pid = child.id();
        {
            let mut inner = lock(&self.inner);
            inner.pid = pid;
            #[cfg(unix)]
            {
                inner.process_group_id = pid.map(|pid| pid as i32);
            }
        }

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(Error::LaunchFailed {
                name: self.name.clone(),
                reason: "launcher stdio was not captured".to_string(),
            });
        };
        let stderr_task = forward_stderr(self.name.clone(), stderr, self.stderr_tail.clone());
        *self.child.lock().await = Some(child);

        let (mut reader, writer) = channel(stdout, stdin);
        let ready = match tokio::time::timeout(timeout, reader.recv()).await {
            Err(_) => {
                return Err(Error::LaunchTimeout {
                    name: self.name.clone(),
                    timeout,
                })
            }
            Ok(Ok(Some(envelope))) => envelope,
            Ok(Ok(None)) => return Err(self.exited_before_ready("channel closed", stderr_task).await),
            Ok(Err(e)) => return Err(self.exited_before_ready(&e.to_string(), stderr_task).await),
        };

        if ready.kind != MessageType::Ready {
            return Err(Error::LaunchFailed {
                name: self.name.clone(),
                reason: format!("expected READY, got {}", ready.kind),
            });
        }
        let payload: ReadyPayload = ready.payload_as()?;
        if payload.protocol_version != PROTOCOL_VERSION {
            return Err(Error::LaunchFailed {
                name: self.name.clone(),
                reason: format!(
                    "launcher speaks protocol version {}, expected {}",
                    payload.protocol_version, PROTOCOL_VERSION
                ),
            });
        }

        *self.writer.lock().await = Some(writer);
        let task = tokio::spawn(read_loop(
            self.me.clone(),
            self.name.clone(),
            reader,
            self.pending.clone(),
            self.logs.clone(),
        ));
        lock(&self.inner).reader_task = Some(task);
        Ok(())
    }

    /// Build the LaunchFailed error for a launcher that went away before
    /// READY, with its exit status and last stderr lines.
    async fn exited_before_ready(&self, cause: &str, stderr_task: JoinHandle<()>) -> Error {
        let status = match self.child.lock().await.as_mut() {
            Some(child) => tokio::time::timeout(KILL_GRACE, child.wait())
                .await
                .ok()
                .and_then(|status| status.ok()),
            None => None,
        };
        let _ = tokio::time::timeout(Duration::from_secs(1), stderr_task).await;

        let mut reason = match status {
            Some(status) => format!("launcher exited before READY ({})", status),
            None => format!("launcher went away before READY ({})", cause),
        };
        let tail = self.stderr_tail();
        if !tail.is_empty() {
            reason.push_str("\nlauncher stderr:\n");
            reason.push_str(&tail.join("\n"));
        }
        Error::LaunchFailed {
            name: self.name.clone(),
            reason,
        }
    }

    /// Called by the read loop once the channel is gone.
    fn channel_lost(&self, cause: String) {
        let exited = {
            let mut inner = lock(&self.inner);
            match inner.state {
                EnvironmentState::Exited => true,
                _ => {
                    inner.state = EnvironmentState::Failed;
                    inner.failure.get_or_insert_with(|| cause.clone());
                    false
                }
            }
        };

        if exited {
            let failed = self
                .pending
                .fail_all(|_, _| Err(Error::EnvironmentClosed(self.name.clone())));
            debug!("[environment] {} closed, {} pending request(s) failed", self.name, failed);
            return;
        }

        warn!("[environment] {} crashed: {}", self.name, cause);
        let failed = self.pending.fail_all(|_, target| {
            Err(Error::EnvironmentCrashed {
                name: self.name.clone(),
                reason: format!("{} while serving {}", cause, target),
            })
        });
        if failed > 0 {
            warn!("[environment] {} pending request(s) on {} failed", failed, self.name);
        }
    }

    /// Send one request and wait for its completion, holding the call gate
    /// for the whole round trip.
    async fn request(
        &self,
        target: String,
        envelope: impl FnOnce(u64) -> Result<Envelope>,
        timeout: Option<Duration>,
    ) -> Result<Completion<CallOutcome>> {
        self.ensure_live()?;
        let _gate = self.call_gate.lock().await;

        {
            let mut inner = lock(&self.inner);
            if !inner.state.is_live() {
                drop(inner);
                return Err(self.not_live_error());
            }
            inner.state = EnvironmentState::Executing;
        }
        let mut guard = InFlight { env: self, id: None };

        let (id, rx) = self.pending.register(target.clone());
        guard.id = Some(id);
        let envelope = envelope(id)?;
        debug!("[environment] {} -> {} {} (id {})", self.name, envelope.kind, target, id);

        {
            let mut writer = self.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return Err(self.not_live_error());
            };
            if let Err(e) = writer.send(&envelope).await {
                return Err(match e {
                    ProtocolError::Io(io) => Error::EnvironmentCrashed {
                        name: self.name.clone(),
                        reason: format!("cannot send {}: {}", target, io),
                    },
                    other => other.into(),
                });
            }
        }

        let completion = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(completion) => completion,
                Err(_) => {
                    warn!("[environment] {} timed out after {:?} on {}", target, limit, self.name);
                    return Err(Error::CallTimeout {
                        target,
                        timeout: limit,
                    });
                }
            },
            None => rx.await,
        };
        guard.id = None;
        completion.map_err(|_| self.not_live_error())
    }

    /// Call `module.attribute` and return its value.
    pub async fn invoke(
        &self,
        module: &str,
        attribute: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        options: CallOptions,
    ) -> Result<Value> {
        Ok(self
            .invoke_with_logs(module, attribute, args, kwargs, options)
            .await?
            .value)
    }

    /// Like [`invoke`](Self::invoke), also returning the call's LOG lines.
    pub async fn invoke_with_logs(
        &self,
        module: &str,
        attribute: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        options: CallOptions,
    ) -> Result<CallOutput> {
        for value in args.iter().chain(kwargs.values()) {
            value.check_encodable()?;
        }
        let payload = CallPayload::new(module, attribute, args, kwargs);
        let timeout = options.timeout.or(self.config.call_timeout);
        let completion = self
            .request(
                payload.target(),
                |id| Ok(Envelope::call(id, &payload)?),
                timeout,
            )
            .await?;
        Ok(CallOutput {
            value: completion.outcome?,
            logs: completion.logs,
        })
    }

    /// Import `module` inside the environment.
    pub async fn import_module(&self, module: &str) -> Result<ModuleProxy> {
        let completion = self
            .request(
                format!("import {}", module),
                |id| Ok(Envelope::import(id, module)),
                self.config.call_timeout,
            )
            .await?;
        let info: ModuleInfo = from_value(completion.outcome?)?;
        lock(&self.inner).imported.insert(info.module.clone());
        info!(
            "[environment] {} imported {} ({} attributes)",
            self.name,
            info.module,
            info.attributes.len()
        );
        Ok(ModuleProxy::new(info.module, info.attributes, self.me.clone()))
    }

    /// Call `module.function`, importing the module first if this environment
    /// has not imported it yet.
    pub async fn execute(&self, module: &str, function: &str, args: Vec<Value>) -> Result<Value> {
        let imported = lock(&self.inner).imported.contains(module);
        if !imported {
            self.import_module(module).await?;
        }
        self.invoke(module, function, args, Kwargs::new(), CallOptions::default())
            .await
    }

    /// Run raw source text through the launcher's code runner. Returns
    /// `{exitCode, stdout}`.
    pub async fn execute_code(&self, source: &str) -> Result<Value> {
        self.invoke(
            CODE_MODULE,
            CODE_ATTRIBUTE,
            vec![Value::from(source)],
            Kwargs::new(),
            CallOptions::default(),
        )
        .await
    }

    /// Stop the launcher. SHUTDOWN first, then a kill once `timeout` passes.
    ///
    /// The state is `Exited` afterwards whatever the outcome, except that a
    /// failed environment stays `Failed`: its leftover process is killed and
    /// [`ShutdownKind::AlreadyExited`] is returned. Repeated calls return
    /// `AlreadyExited` without signalling the process again.
    pub async fn exit(&self, timeout: Duration) -> Result<ShutdownKind> {
        let previous = {
            let mut inner = lock(&self.inner);
            let previous = inner.state;
            match previous {
                EnvironmentState::Exited => return Ok(ShutdownKind::AlreadyExited),
                EnvironmentState::Failed => {}
                _ => inner.state = EnvironmentState::Exited,
            }
            previous
        };

        if previous == EnvironmentState::Failed {
            debug!("[environment] Cleaning up failed environment {}", self.name);
            self.teardown().await;
            self.pending.fail_all(|_, _| Err(self.not_live_error()));
            return Ok(ShutdownKind::AlreadyExited);
        }
        info!("[environment] Shutting down {} (was {})", self.name, previous);

        let writer = match tokio::time::timeout(timeout, self.writer.lock()).await {
            Ok(mut writer) => writer.take(),
            Err(_) => None,
        };
        if let Some(mut writer) = writer {
            if let Err(e) = writer.send(&Envelope::shutdown(0)).await {
                debug!("[environment] SHUTDOWN to {} not delivered: {}", self.name, e);
            }
            let _ = writer.close().await;
        }

        let child = self.child.lock().await.take();
        let outcome = match child {
            None => Ok(ShutdownKind::AlreadyExited),
            Some(mut child) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("[environment] {} exited ({})", self.name, status);
                    Ok(ShutdownKind::Graceful(status.code()))
                }
                Ok(Err(e)) => Err(Error::Io(e)),
                Err(_) => {
                    warn!(
                        "[environment] {} did not exit within {:?}, killing it",
                        self.name, timeout
                    );
                    self.kill_process_group();
                    let _ = child.start_kill();
                    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                        Ok(_) => Ok(ShutdownKind::Forced),
                        Err(_) => Err(Error::ShutdownTimeout {
                            name: self.name.clone(),
                            timeout,
                        }),
                    }
                }
            },
        };

        let task = {
            let mut inner = lock(&self.inner);
            inner.pid = None;
            #[cfg(unix)]
            {
                inner.process_group_id = None;
            }
            inner.reader_task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        self.pending
            .fail_all(|_, _| Err(Error::EnvironmentClosed(self.name.clone())));
        outcome
    }

    fn kill_process_group(&self) {
        #[cfg(unix)]
        {
            let pgid = lock(&self.inner).process_group_id.take();
            if let Some(pgid) = pgid {
                kill_group(pgid);
            }
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: i32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        if e != nix::errno::Errno::ESRCH {
            error!("[environment] Failed to kill process group {}: {}", pgid, e);
        }
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = inner.reader_task.take() {
            task.abort();
        }

        #[cfg(unix)]
        if let Some(pgid) = inner.process_group_id.take() {
            kill_group(pgid);
        }

        if inner.pid.is_some() {
            debug!("[environment] {} dropped while running, process killed", self.name);
        }
    }
}

/// Marks a request finished however the future ends: a dropped or timed-out
/// request leaves its id abandoned so a late response is discarded.
struct InFlight<'a> {
    env: &'a Environment,
    id: Option<u64>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.env.pending.abandon(id);
        }
        let mut inner = lock(&self.env.inner);
        if inner.state == EnvironmentState::Executing {
            inner.state = EnvironmentState::Ready;
        }
    }
}

fn forward_stderr(
    name: String,
    stderr: ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!("[env:{}] {}", name, line);
            let mut buffer = lock(&tail);
            if buffer.len() == STDERR_TAIL_LINES {
                buffer.pop_front();
            }
            buffer.push_back(line);
        }
    })
}

async fn read_loop(
    env: Weak<Environment>,
    name: String,
    mut reader: ChannelReader<ChildStdout>,
    pending: Arc<PendingCalls<CallOutcome>>,
    logs: broadcast::Sender<RemoteLog>,
) {
    let cause = loop {
        let envelope = match reader.recv().await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break "channel closed".to_string(),
            Err(e) => break format!("channel error: {}", e),
        };
        if let Err(e) = dispatch(&name, envelope, &pending, &logs) {
            // Responses can no longer be trusted to line up with requests.
            error!("[environment] Protocol violation on {}: {}", name, e);
            let message = e.to_string();
            pending.fail_all(|_, _| {
                Err(Error::ProtocolError(match &e {
                    ProtocolError::UnmatchedId(id) => ProtocolError::UnmatchedId(*id),
                    ProtocolError::UnexpectedMessage { id, kind } => {
                        ProtocolError::UnexpectedMessage { id: *id, kind: *kind }
                    }
                    _ => ProtocolError::Malformed(message.clone()),
                }))
            });
        }
    };

    match env.upgrade() {
        Some(env) => env.channel_lost(cause),
        None => {
            pending.fail_all(|_, _| Err(Error::EnvironmentClosed(name.clone())));
        }
    }
}

fn dispatch(
    name: &str,
    envelope: Envelope,
    pending: &PendingCalls<CallOutcome>,
    logs: &broadcast::Sender<RemoteLog>,
) -> std::result::Result<(), ProtocolError> {
    let id = envelope.id;
    match envelope.kind {
        MessageType::Log => {
            let line: LogPayload = match envelope.payload_as() {
                Ok(line) => line,
                Err(e) => {
                    warn!("[environment] Dropping bad LOG from {}: {}", name, e);
                    return Ok(());
                }
            };
            info!("[env:{}] {}: {}", name, line.stream, line.text);
            let _ = logs.send(RemoteLog {
                call_id: id,
                stream: line.stream,
                text: line.text.clone(),
            });
            pending.append_log(id, line)
        }
        MessageType::Result => {
            let outcome = envelope.payload_as::<Value>().map_err(Error::from);
            pending.resolve(id, outcome)
        }
        MessageType::Error => {
            let outcome = envelope
                .payload_as::<ErrorPayload>()
                .map_err(Error::from)
                .and_then(|payload| Err(RemoteException::from(payload).into()));
            pending.resolve(id, outcome)
        }
        // Requests and READY only ever travel the other way.
        kind => Err(ProtocolError::UnexpectedMessage { id, kind }),
    }
}
