//! Worker supervisor - child process lifecycle and the command servicing loop.
//!
//! Flow:
//! 1. Spawn the interpreter worker with an augmented search path and a
//!    neutral working directory
//! 2. Run the dedicated loop: pop one queued command, send its frames, drain
//!    reply frames until the result lands
//! 3. While the child is parked on an input request, keep servicing other
//!    already-queued commands by re-entering the dispatch step
//! 4. On crash: fail the in-flight command, stop the engine

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::{mpsc, watch};

use crate::bridge::channel::{ChannelError, ChannelStream, ReplyOpcode, SendOpcode};
use crate::bridge::codec;
use crate::bridge::value::Value;
use crate::command::{Command, Queued};
use crate::console::Console;
use crate::results::ResultTable;

/// Lifecycle of one engine run.
///
/// `Stopped -> Starting -> Running -> {Stopping, Crashed} -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl EngineState {
    /// Whether a result can still arrive for an outstanding command.
    pub fn is_live(self) -> bool {
        matches!(self, EngineState::Running | EngineState::Stopping)
    }
}

/// What the spawner needs to know to launch a worker.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Interpreter executable.
    pub interpreter: PathBuf,
    /// Bootstrap script handed to the interpreter as its sole argument.
    pub bootstrap: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Liveness and termination handle for a spawned worker.
pub trait ProcessHandle: Send {
    fn is_alive(&mut self) -> bool;
    fn start_kill(&mut self) -> io::Result<()>;
}

/// A spawned worker: its stdio pipes plus a process handle.
///
/// `stderr` carries the process's real standard error (interpreter
/// tracebacks), distinct from the protocol-level stderr frames that arrive
/// over `stdout`.
pub struct SpawnedWorker {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub handle: Box<dyn ProcessHandle>,
}

/// Extension point for different worker spawn strategies.
///
/// The default is [`PythonSpawner`]; tests and embedders inject in-process
/// fakes to drive the engine without a real subprocess.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &SpawnConfig) -> Result<SpawnedWorker, SpawnError>;
}

/// Spawns `<interpreter> <bootstrap>` with stdio piped.
///
/// The interpreter's own directory is prepended to `PATH` and the bootstrap
/// directory to `PYTHONPATH` so the child can locate companion libraries; the
/// working directory is switched to a neutral location so shared-library
/// lookups never collide with the host application's own directory.
pub struct PythonSpawner;

impl WorkerSpawner for PythonSpawner {
    fn spawn(&self, config: &SpawnConfig) -> Result<SpawnedWorker, SpawnError> {
        let mut command = ProcessCommand::new(&config.interpreter);
        command
            .arg(&config.bootstrap)
            .current_dir(std::env::temp_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = config.interpreter.parent() {
            command.env("PATH", prepend_search_path("PATH", dir.into()));
        }
        if let Some(dir) = config.bootstrap.parent() {
            command.env("PYTHONPATH", prepend_search_path("PYTHONPATH", dir.into()));
        }

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .map(|pipe| Box::new(pipe) as Box<dyn AsyncRead + Send + Unpin>);

        tracing::info!(
            interpreter = %config.interpreter.display(),
            bootstrap = %config.bootstrap.display(),
            "spawned worker process"
        );

        Ok(SpawnedWorker {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr,
            handle: Box::new(ChildHandle { child }),
        })
    }
}

fn prepend_search_path(var: &str, dir: PathBuf) -> std::ffi::OsString {
    let mut entries = vec![dir];
    if let Some(existing) = std::env::var_os(var) {
        entries.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(entries).unwrap_or_else(|_| {
        // A path with embedded separators cannot be joined; fall back to
        // the existing value untouched.
        std::env::var_os(var).unwrap_or_default()
    })
}

struct ChildHandle {
    child: Child,
}

impl ProcessHandle for ChildHandle {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

/// How a dispatch step ended.
enum Flow {
    /// Command serviced; pull the next one.
    Continue,
    /// Graceful stop requested.
    Shutdown,
    /// Child observed dead while a reply was pending.
    Crashed,
}

type PipeReader = Box<dyn AsyncRead + Send + Unpin>;
type PipeWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The dedicated servicing loop, one per engine run.
pub(crate) struct WorkerLoop {
    pub chan: ChannelStream<PipeReader, PipeWriter>,
    pub handle: Box<dyn ProcessHandle>,
    pub queue: mpsc::Receiver<Queued>,
    pub input: mpsc::Receiver<Vec<u8>>,
    pub table: Arc<ResultTable>,
    pub console: Arc<Console>,
    pub state: Arc<watch::Sender<EngineState>>,
    pub shutdown_grace: Duration,
}

impl WorkerLoop {
    pub async fn run(mut self) {
        let flow = loop {
            match self.queue.recv().await {
                Some(queued) => match self.dispatch(queued).await {
                    Flow::Continue => continue,
                    other => break other,
                },
                // Engine dropped without an explicit stop.
                None => break Flow::Shutdown,
            }
        };

        match flow {
            Flow::Shutdown => self.shutdown_child().await,
            Flow::Crashed => {
                self.state.send_replace(EngineState::Crashed);
                let _ = self.handle.start_kill();
            }
            Flow::Continue => unreachable!("loop only breaks on terminal flow"),
        }

        self.state.send_replace(EngineState::Stopped);
        tracing::info!("worker loop exiting");
    }

    /// Send one command and drain its replies. Boxed because the input-wait
    /// path re-enters dispatch for already-queued commands.
    fn dispatch<'a>(&'a mut self, queued: Queued) -> Pin<Box<dyn Future<Output = Flow> + Send + 'a>> {
        Box::pin(async move {
            if matches!(queued.command, Command::Stop) {
                return Flow::Shutdown;
            }
            tracing::debug!(id = queued.id, kind = queued.command.kind(), "sending command");

            if let Err(error) = self.send_command(&queued.command).await {
                return self.on_channel_failure(queued.id, error).await;
            }
            self.drain_replies(queued.id).await
        })
    }

    async fn send_command(&mut self, command: &Command) -> Result<(), ChannelError> {
        let opcode = command.opcode();
        match command {
            Command::Exec(code) | Command::Eval(code) => {
                let payload = codec::encode_value(&Value::Str(code.clone()));
                self.chan.write_frame(opcode, &payload).await
            }
            Command::SendObject { name, value } => {
                let name_payload = codec::encode_value(&Value::Str(name.clone()));
                self.chan.write_frame(opcode, &name_payload).await?;
                let value_payload = codec::encode_value(value);
                self.chan.write_payload(&value_payload).await
            }
            Command::RetrieveObject { name } => {
                let payload = codec::encode_value(&Value::Str(name.clone()));
                self.chan.write_frame(opcode, &payload).await
            }
            Command::Stop => unreachable!("stop is handled before sending"),
        }
    }

    /// Sub-loop: consume reply frames until the in-flight command completes.
    async fn drain_replies(&mut self, id: u32) -> Flow {
        loop {
            let byte = match self.chan.read_opcode().await {
                Ok(byte) => byte,
                Err(error) => return self.on_channel_failure(id, error).await,
            };
            match ReplyOpcode::from_byte(byte) {
                Some(op @ (ReplyOpcode::Stdout | ReplyOpcode::Stderr)) => {
                    let payload = match self.chan.read_frame().await {
                        Ok(payload) => payload,
                        Err(error) => return self.on_channel_failure(id, error).await,
                    };
                    match codec::decode(&payload, 0) {
                        (Value::Str(text), consumed) if consumed >= 0 => {
                            if op == ReplyOpcode::Stdout {
                                self.console.push_stdout(&text);
                            } else {
                                self.console.push_stderr(&text);
                            }
                        }
                        _ => {
                            self.abort_desynced(id, "malformed console frame").await;
                            return Flow::Continue;
                        }
                    }
                }
                Some(ReplyOpcode::InputRequest) => match self.service_input_wait().await {
                    Ok(Flow::Continue) => {}
                    Ok(flow) => {
                        self.table.record(
                            id,
                            Value::Error("engine stopped before command completed".to_string()),
                        );
                        return flow;
                    }
                    Err(error) => return self.on_channel_failure(id, error).await,
                },
                Some(op) if op.is_result() => {
                    let payload = match self.chan.read_frame().await {
                        Ok(payload) => payload,
                        Err(error) => return self.on_channel_failure(id, error).await,
                    };
                    let (value, consumed) = codec::decode(&payload, 0);
                    if consumed < 0 {
                        self.abort_desynced(id, "malformed result frame").await;
                    } else {
                        tracing::debug!(id, kind = value.type_name(), "command completed");
                        self.table.record(id, value);
                    }
                    return Flow::Continue;
                }
                _ => {
                    tracing::warn!(opcode = byte, "unexpected opcode from worker");
                    self.abort_desynced(id, "unexpected opcode").await;
                    return Flow::Continue;
                }
            }
        }
    }

    /// Park for child-requested input while still servicing other queued
    /// commands. Returns `Flow::Continue` once the input has been forwarded.
    async fn service_input_wait(&mut self) -> Result<Flow, ChannelError> {
        tracing::debug!("worker requested input");
        loop {
            tokio::select! {
                biased;

                data = self.input.recv() => match data {
                    Some(bytes) => {
                        self.chan.write_frame(SendOpcode::Input, &bytes).await?;
                        return Ok(Flow::Continue);
                    }
                    None => return Ok(Flow::Shutdown),
                },

                queued = self.queue.recv() => match queued {
                    Some(queued) => match self.dispatch(queued).await {
                        Flow::Continue => {}
                        flow => return Ok(flow),
                    },
                    None => return Ok(Flow::Shutdown),
                },
            }
        }
    }

    /// A channel failure with a live child aborts only the current command;
    /// with a dead child it is a crash.
    async fn on_channel_failure(&mut self, id: u32, error: ChannelError) -> Flow {
        if !self.handle.is_alive() {
            tracing::error!(id, %error, "worker process crashed");
            self.table
                .record(id, Value::Error("worker process crashed".to_string()));
            return Flow::Crashed;
        }
        tracing::warn!(id, %error, "channel failure, aborting command");
        self.chan.drain().await;
        self.table
            .record(id, Value::Error(format!("channel failure: {error}")));
        Flow::Continue
    }

    async fn abort_desynced(&mut self, id: u32, reason: &str) {
        tracing::warn!(id, reason, "stream desynchronized, flushing");
        self.chan.drain().await;
        self.table
            .record(id, Value::Error(format!("channel desynchronized: {reason}")));
    }

    async fn shutdown_child(&mut self) {
        self.state.send_replace(EngineState::Stopping);
        if let Err(error) = self.chan.write_opcode(SendOpcode::Quit).await {
            tracing::debug!(%error, "failed to send quit, worker may already be gone");
        }
        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        while self.handle.is_alive() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        if self.handle.is_alive() {
            tracing::warn!("worker did not exit gracefully, terminating");
            let _ = self.handle.start_kill();
        }
    }
}
