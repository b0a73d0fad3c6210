//! Command kinds submitted to the worker.

use crate::bridge::channel::SendOpcode;
use crate::bridge::value::Value;

/// Correlation id drawn from the engine's rotating pool.
pub type CommandId = u32;

/// One unit of work for the worker. `Stop` is internal: it is enqueued by
/// `Engine::stop` and never reaches the wire as a payload-carrying frame.
#[derive(Debug, Clone)]
pub enum Command {
    Exec(String),
    Eval(String),
    SendObject { name: String, value: Value },
    RetrieveObject { name: String },
    Stop,
}

impl Command {
    pub fn opcode(&self) -> SendOpcode {
        match self {
            Command::Exec(_) => SendOpcode::Exec,
            Command::Eval(_) => SendOpcode::Eval,
            Command::SendObject { .. } => SendOpcode::SendObject,
            Command::RetrieveObject { .. } => SendOpcode::RetrieveObject,
            Command::Stop => SendOpcode::Quit,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Command::Exec(_) => "exec",
            Command::Eval(_) => "eval",
            Command::SendObject { .. } => "send_object",
            Command::RetrieveObject { .. } => "retrieve_object",
            Command::Stop => "stop",
        }
    }
}

/// A command with its correlation id, as carried by the queue.
#[derive(Debug)]
pub(crate) struct Queued {
    pub id: CommandId,
    pub command: Command,
}
