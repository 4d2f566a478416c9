//! Prelude module for convenient imports
//!
//! Import everything you need with:
//! ```rust
//! use lumen::prelude::*;
//! ```

pub use crate::{
    CancelToken, ChatMessage, ChatService, ContextConfig, Engine, EngineBuilder, EngineConfig, EngineError,
    LlmClient, MessageStatus, Notifier, OpenAIClient, PostedTurn, SseEvent, SseMessage, Stores, Subscription,
    Thread, Turn,
};
