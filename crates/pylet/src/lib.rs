//! pylet: out-of-process command engine for a long-lived interpreter worker.
//!
//! A single-writer framed protocol over the child's stdio pipes, a tagged
//! binary serialization of a dynamic value graph, and a correlation layer
//! that lets many concurrent callers submit work and wait for their specific
//! reply while one dedicated loop services the worker.

pub mod bridge;
mod command;
mod console;
pub mod engine;
pub mod results;
pub mod supervisor;

pub use bridge::value::{
    Complex64, ComplexPointVector, Dtype, Image, IntervalSampleVector, NdArray, PointVector, Value,
};
pub use command::{Command, CommandId};
pub use engine::{Engine, EngineConfig, EngineError};
pub use results::{ResultTable, WaitError};
pub use supervisor::{
    EngineState, ProcessHandle, PythonSpawner, SpawnConfig, SpawnError, SpawnedWorker,
    WorkerSpawner,
};
