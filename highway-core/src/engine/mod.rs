//! Pipeline engine
//!
//! Bounded channels, worker stages and the linear pipeline that connects
//! them.

pub mod channel;
pub mod pipeline;
pub mod shutdown;
pub mod stage;

pub use channel::{Channel, PopError, PushError};
pub use pipeline::Pipeline;
pub use shutdown::StopToken;
pub use stage::{Stage, StageConfig, StageState, StageWorker, WorkerContext, WorkerExit};
