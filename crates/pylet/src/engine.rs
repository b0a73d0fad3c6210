//! Facade API: start/stop the worker and submit commands.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

use crate::bridge::channel::ChannelStream;
use crate::bridge::value::Value;
use crate::command::{Command, CommandId, Queued};
use crate::console::Console;
use crate::results::{DEFAULT_CAPACITY, DEFAULT_ID_POOL, ResultTable, WaitError};
use crate::supervisor::{
    EngineState, PythonSpawner, SpawnConfig, SpawnedWorker, WorkerLoop, WorkerSpawner,
};

/// Depth of the command queue; submitters briefly apply backpressure past it.
const QUEUE_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("worker failed to start: {0}")]
    Startup(String),
    #[error("engine is not running")]
    NotRunning,
    #[error("engine is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Wait(#[from] WaitError),
}

/// Engine configuration, builder style.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    interpreter: PathBuf,
    bootstrap: PathBuf,
    startup_grace: Duration,
    shutdown_grace: Duration,
    default_wait: Duration,
    id_pool: usize,
    result_capacity: usize,
}

impl EngineConfig {
    pub fn new(interpreter: impl Into<PathBuf>, bootstrap: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            bootstrap: bootstrap.into(),
            startup_grace: Duration::from_millis(250),
            shutdown_grace: Duration::from_secs(2),
            default_wait: Duration::from_secs(30),
            id_pool: DEFAULT_ID_POOL,
            result_capacity: DEFAULT_CAPACITY,
        }
    }

    /// How long the freshly spawned process must stay alive before the
    /// engine reports Running.
    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// How long a stopping worker gets to exit before being terminated.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Wait deadline used by `eval_code`.
    pub fn with_default_wait(mut self, wait: Duration) -> Self {
        self.default_wait = wait;
        self
    }

    /// Size of the rotating correlation-id pool.
    pub fn with_id_pool(mut self, size: usize) -> Self {
        self.id_pool = size.max(1);
        self
    }

    /// Result-cache bound. The default of 20 keeps compatibility with the
    /// historic retention window; raising it trades memory for a longer
    /// collection deadline.
    pub fn with_result_capacity(mut self, capacity: usize) -> Self {
        self.result_capacity = capacity.max(1);
        self
    }
}

struct Handles {
    queue_tx: mpsc::Sender<Queued>,
    input_tx: mpsc::Sender<Vec<u8>>,
}

/// One engine instance: one worker process, one servicing task.
///
/// Submission calls (`exec_code`, `send_object`, `retrieve_object`) are
/// non-blocking enqueues returning a correlation id; `wait` and `eval_code`
/// are the only blocking primitives, and they suspend the calling task only -
/// never the servicing loop.
pub struct Engine {
    config: EngineConfig,
    spawner: Arc<dyn WorkerSpawner>,
    table: Arc<ResultTable>,
    console: Arc<Console>,
    state_tx: Arc<watch::Sender<EngineState>>,
    state_rx: watch::Receiver<EngineState>,
    runtime: StdMutex<Option<Handles>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_spawner(config, Arc::new(PythonSpawner))
    }

    /// Build an engine with a custom spawn strategy (tests, embedders).
    pub fn with_spawner(config: EngineConfig, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Stopped);
        let table = Arc::new(ResultTable::new(config.id_pool, config.result_capacity));
        Self {
            config,
            spawner,
            table,
            console: Arc::new(Console::default()),
            state_tx: Arc::new(state_tx),
            state_rx,
            runtime: StdMutex::new(None),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Observe lifecycle transitions; the receiver sees `Stopped` once per
    /// run when the worker finishes.
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Resolve once the engine reaches `Stopped`.
    pub async fn wait_finished(&self) {
        let mut rx = self.state_rx.clone();
        loop {
            if *rx.borrow_and_update() == EngineState::Stopped {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Spawn the worker and the servicing loop.
    pub async fn start(&self) -> Result<(), EngineError> {
        // Claim the Starting slot atomically; concurrent starts must not
        // both spawn a child.
        let claimed = self.state_tx.send_if_modified(|state| {
            if *state == EngineState::Stopped {
                *state = EngineState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(EngineError::AlreadyRunning);
        }

        let spawn_config = SpawnConfig {
            interpreter: self.config.interpreter.clone(),
            bootstrap: self.config.bootstrap.clone(),
        };
        let spawned = match self.spawner.spawn(&spawn_config) {
            Ok(spawned) => spawned,
            Err(error) => {
                self.state_tx.send_replace(EngineState::Stopped);
                return Err(EngineError::Startup(error.to_string()));
            }
        };
        let SpawnedWorker {
            stdin,
            stdout,
            stderr,
            mut handle,
        } = spawned;

        // The process's real stderr (tracebacks) joins the pollable stderr
        // buffer alongside protocol-level stderr frames.
        if let Some(stderr) = stderr {
            let console = Arc::clone(&self.console);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    console.push_stderr(&format!("{line}\n"));
                }
            });
        }

        // The child reports "running" by simply surviving the grace period;
        // an interpreter that cannot find its libraries exits immediately.
        let deadline = tokio::time::Instant::now() + self.config.startup_grace;
        while tokio::time::Instant::now() < deadline {
            if !handle.is_alive() {
                self.state_tx.send_replace(EngineState::Stopped);
                return Err(EngineError::Startup(
                    "worker exited during startup".to_string(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_DEPTH);
        let (input_tx, input_rx) = mpsc::channel(16);

        let worker_loop = WorkerLoop {
            chan: ChannelStream::new(stdout, stdin),
            handle,
            queue: queue_rx,
            input: input_rx,
            table: Arc::clone(&self.table),
            console: Arc::clone(&self.console),
            state: Arc::clone(&self.state_tx),
            shutdown_grace: self.config.shutdown_grace,
        };
        tokio::spawn(worker_loop.run());

        *lock_runtime(&self.runtime) = Some(Handles { queue_tx, input_tx });
        self.state_tx.send_replace(EngineState::Running);
        tracing::info!("engine running");
        Ok(())
    }

    /// Request a graceful stop. With `wait` the call resolves only once the
    /// worker has fully stopped.
    pub async fn stop(&self, wait: bool) {
        let queue_tx = lock_runtime(&self.runtime)
            .as_ref()
            .map(|handles| handles.queue_tx.clone());
        if let Some(queue_tx) = queue_tx {
            let _ = queue_tx
                .send(Queued {
                    id: 0,
                    command: Command::Stop,
                })
                .await;
        }
        if wait {
            self.wait_finished().await;
        }
    }

    /// Enqueue code for execution; returns immediately with the command id.
    pub async fn exec_code(&self, code: impl Into<String>) -> Result<CommandId, EngineError> {
        self.submit(Command::Exec(code.into())).await
    }

    /// Evaluate an expression and wait for its value. Worker-side failures
    /// come back as `Value::Error`, inspectable via [`Value::is_error`].
    pub async fn eval_code(&self, code: impl Into<String>) -> Result<Value, EngineError> {
        let id = self.submit(Command::Eval(code.into())).await?;
        self.wait(id, self.config.default_wait).await
    }

    /// Transfer a value into the worker under `name`.
    pub async fn send_object(
        &self,
        name: impl Into<String>,
        value: Value,
    ) -> Result<CommandId, EngineError> {
        self.submit(Command::SendObject {
            name: name.into(),
            value,
        })
        .await
    }

    /// Request the value bound to `name` in the worker.
    pub async fn retrieve_object(&self, name: impl Into<String>) -> Result<CommandId, EngineError> {
        self.submit(Command::RetrieveObject { name: name.into() }).await
    }

    /// Block until the result for `id` arrives, the worker stops, or the
    /// timeout elapses. Timing out leaves the command running; a later wait
    /// on the same id can still collect the result within the retention
    /// window.
    pub async fn wait(&self, id: CommandId, timeout: Duration) -> Result<Value, EngineError> {
        Ok(self.table.wait(id, timeout, self.state_rx.clone()).await?)
    }

    /// Supply data for a pending child input request.
    pub async fn write(&self, input: impl Into<Vec<u8>>) -> Result<(), EngineError> {
        let input_tx = lock_runtime(&self.runtime)
            .as_ref()
            .map(|handles| handles.input_tx.clone())
            .ok_or(EngineError::NotRunning)?;
        input_tx
            .send(input.into())
            .await
            .map_err(|_| EngineError::NotRunning)
    }

    /// Drain everything the worker has printed to stdout so far.
    pub fn read_all_stdout(&self) -> String {
        self.console.take_stdout()
    }

    /// Drain everything the worker has printed to stderr so far.
    pub fn read_all_stderr(&self) -> String {
        self.console.take_stderr()
    }

    async fn submit(&self, command: Command) -> Result<CommandId, EngineError> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        let queue_tx = lock_runtime(&self.runtime)
            .as_ref()
            .map(|handles| handles.queue_tx.clone())
            .ok_or(EngineError::NotRunning)?;
        let id = self.table.allocate();
        queue_tx
            .send(Queued { id, command })
            .await
            .map_err(|_| EngineError::NotRunning)?;
        Ok(id)
    }
}

fn lock_runtime(runtime: &StdMutex<Option<Handles>>) -> std::sync::MutexGuard<'_, Option<Handles>> {
    runtime.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
