//! At-least-once background jobs

mod handlers;
mod runtime;

pub use handlers::{ChatMaintainHandler, ChatPathIndexHandler, ChatRebuildHandler, ChatRespondHandler};
pub use runtime::{JobDisposition, JobHandler, JobRun, JobRuntime};
