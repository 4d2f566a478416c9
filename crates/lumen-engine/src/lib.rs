//! Turn execution and background maintenance for Lumen chat threads.
//!
//! [`ChatService`] accepts user messages and queues a `chat_respond` job per
//! turn. The [`JobRuntime`] leases those jobs and hands them to the
//! [`Responder`], which plans context, streams the model reply through the
//! [`Notifier`] and finally queues a `chat_maintain` pass. The [`Maintainer`]
//! then catches the thread's derived structures up with its message log.

pub mod builder;
pub mod cancel;
pub mod chat;
pub mod citations;
pub mod error;
pub mod jobs;
pub mod maintainer;
pub mod notify;
pub mod path_indexer;
pub mod prompts;
pub mod responder;
pub mod router;
pub mod streaming;
pub mod tools;
pub mod types;

pub use builder::{Engine, EngineBuilder};
pub use cancel::{CancelHandle, CancelToken};
pub use chat::{ChatService, PostedTurn};
pub use error::{EngineError, ErrorKind, Result};
pub use jobs::{
    ChatMaintainHandler, ChatPathIndexHandler, ChatRebuildHandler, ChatRespondHandler, JobDisposition,
    JobHandler, JobRun, JobRuntime,
};
pub use maintainer::{GraphMirror, GraphSnapshot, MaintainReport, Maintainer, NoopGraphMirror, PhaseReport};
pub use notify::{spawn_bus_relay, Notifier, SseHub, Subscription, TurnRef};
pub use path_indexer::{PathIndexReport, PathIndexer};
pub use responder::{RespondOutcome, Responder};
pub use router::{DefaultTurnRouter, ToolCall, TurnRoute, TurnRouter};
pub use tools::{ChatToolExecutor, ToolContext, ToolExecutor, ToolOutcome};
pub use types::{EngineConfig, JobConfig, MaintainerConfig, NotifierConfig, ResponderConfig};
