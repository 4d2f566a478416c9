use std::sync::Arc;

use async_trait::async_trait;
use lumen_persist::Stores;
use lumen_types::{ChatClaim, ChatEdge, ChatEntity, Scope, Thread};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

/// The thread-scoped chat graph as handed to an external graph store
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphSnapshot {
    pub user_id: Uuid,
    pub thread_id: Uuid,
    pub entities: Vec<ChatEntity>,
    pub edges: Vec<ChatEdge>,
    pub claims: Vec<ChatClaim>,
}

impl GraphSnapshot {
    pub async fn load(stores: &Stores, thread: &Thread) -> Result<Self> {
        let scope_id = Some(thread.id);
        Ok(Self {
            user_id: thread.user_id,
            thread_id: thread.id,
            entities: stores.graph.list_entities(thread.user_id, Scope::Thread, scope_id).await?,
            edges: stores.graph.list_edges(thread.user_id, Scope::Thread, scope_id).await?,
            claims: stores.graph.list_claims(thread.user_id, Scope::Thread, scope_id).await?,
        })
    }
}

/// Copies the derived chat graph into a store built for cross-thread queries
#[async_trait]
pub trait GraphMirror: Send + Sync {
    fn enabled(&self) -> bool {
        true
    }

    async fn mirror(&self, snapshot: GraphSnapshot) -> anyhow::Result<()>;
}

pub struct NoopGraphMirror;

#[async_trait]
impl GraphMirror for NoopGraphMirror {
    fn enabled(&self) -> bool {
        false
    }

    async fn mirror(&self, _snapshot: GraphSnapshot) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Run the mirror on its own task; failures are logged and never reach the caller
pub fn spawn_mirror(mirror: Arc<dyn GraphMirror>, snapshot: GraphSnapshot) -> JoinHandle<()> {
    tokio::spawn(async move {
        let thread_id = snapshot.thread_id;
        let entities = snapshot.entities.len();
        match mirror.mirror(snapshot).await {
            Ok(()) => debug!(%thread_id, entities, "chat graph mirrored"),
            Err(e) => warn!(%thread_id, error = %e, "chat graph mirror failed"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Failing(AtomicUsize);

    #[async_trait]
    impl GraphMirror for Failing {
        async fn mirror(&self, _snapshot: GraphSnapshot) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("graph store offline")
        }
    }

    #[tokio::test]
    async fn test_failures_stay_inside_the_task() {
        let mirror = Arc::new(Failing(AtomicUsize::new(0)));
        let handle = spawn_mirror(mirror.clone(), GraphSnapshot::default());
        assert!(handle.await.is_ok());
        assert_eq!(mirror.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_noop_is_disabled() {
        assert!(!NoopGraphMirror.enabled());
    }
}
