pub mod chat;
pub mod derived;
pub mod events;
pub mod evidence;
pub mod ids;
pub mod jobs;
pub mod path;
pub mod projection;

pub use chat::{
    ChatMessage, Cursor, MessageRole, MessageStatus, NewMessage, Thread, ThreadState,
    ThreadStatus, Turn, TurnStatus,
};
pub use derived::{ChatClaim, ChatEdge, ChatEntity, ChatMemoryItem, MemoryKind, SummaryNode};
pub use events::{user_channel, MessageDeltaData, SseEvent, SseMessage};
pub use evidence::{AssistantMetadata, EvidenceCitation, EvidenceKind, EvidenceSource};
pub use jobs::{
    ChatMaintainPayload, ChatPathIndexPayload, ChatRebuildPayload, ChatRespondPayload, Job,
    JobStatus, NewJob,
};
pub use path::{
    Concept, ConceptEdge, ConceptEvidence, DocBlock, LearningPath, MaterialChunk, MaterialFile,
    MaterialSet, NodeDoc, PathNode, SessionContext, UserConceptState, UserSessionState,
};
pub use projection::{ChatDoc, DocType, Scope};
