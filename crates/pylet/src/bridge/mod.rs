//! Wire-level building blocks: the value model, the tagged binary codec,
//! and the framed channel over the worker's stdio pipes.

pub mod channel;
pub mod codec;
pub mod value;
