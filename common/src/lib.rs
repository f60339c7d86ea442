//! Tipos y piezas compartidas por servidor, worker y cliente.

pub mod api;
pub mod client;
pub mod config;
pub mod context;
pub mod events;
pub mod ids;
pub mod logging;
pub mod node;
pub mod page;
pub mod reducer;
pub mod ring;
pub mod state;
pub mod task;
pub mod validate;
pub mod writer;

pub use context::Context;
pub use events::{Event, EventType, Level, Payload};
pub use node::{Node, NodeId, NodeState};
pub use task::{
    Executor, ExecutorLog, FileType, Input, Output, OutputFileLog, Ports, Resources, State, Task,
    TaskId, TaskLog, View,
};
