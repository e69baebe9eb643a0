//! pvAccess client: context, connections, channels and operations.
//!
//! All connection, channel and operation state lives on a single core task
//! per [`Context`]; everything else talks to it by posting closures (see
//! [`context::Context`]). User callbacks are invoked from that task.

mod context;
mod core;
mod monitor;
mod operation;

pub use context::{
    Config, Context, GetBuilder, MonitorBuilder, OpResult, Operation, PutBuilder,
};
pub use monitor::Subscription;
