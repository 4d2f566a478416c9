use mongodb::bson::{doc, Document};
use mongodb::error::{ErrorKind, WriteError, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};

use crate::dbs::mongo::models::{MongoJob, MongoMessage, MongoRow, MongoThread, MongoThreadState, MongoTurn};
use crate::error::Result;

pub(crate) const CHAT_DOCS: &str = "chat_docs";
pub(crate) const SUMMARY_NODES: &str = "chat_summary_nodes";
pub(crate) const ENTITIES: &str = "chat_entities";
pub(crate) const EDGES: &str = "chat_edges";
pub(crate) const CLAIMS: &str = "chat_claims";
pub(crate) const MEMORY_ITEMS: &str = "chat_memory_items";
pub(crate) const PATHS: &str = "learning_paths";
pub(crate) const PATH_NODES: &str = "path_nodes";
pub(crate) const NODE_DOCS: &str = "node_docs";
pub(crate) const CONCEPTS: &str = "concepts";
pub(crate) const CONCEPT_EDGES: &str = "concept_edges";
pub(crate) const MATERIAL_FILES: &str = "material_files";
pub(crate) const MATERIAL_CHUNKS: &str = "material_chunks";
pub(crate) const CONCEPT_EVIDENCE: &str = "concept_evidence";
pub(crate) const SESSION_STATES: &str = "user_session_states";
pub(crate) const CONCEPT_STATES: &str = "user_concept_states";

/// MongoDB-backed implementation of the store contracts
#[derive(Clone)]
pub struct MongoStore {
    db: Database,
    pub(crate) threads: Collection<MongoThread>,
    pub(crate) messages: Collection<MongoMessage>,
    pub(crate) turns: Collection<MongoTurn>,
    pub(crate) states: Collection<MongoThreadState>,
    pub(crate) jobs: Collection<MongoJob>,
}

impl MongoStore {
    /// Connect to MongoDB and create the store
    pub async fn connect(mongodb_uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(mongodb_uri).await?;
        Ok(Self::new(&client, database))
    }

    pub fn new(client: &Client, database: &str) -> Self {
        let db = client.database(database);
        Self {
            threads: db.collection("chat_threads"),
            messages: db.collection("chat_messages"),
            turns: db.collection("chat_turns"),
            states: db.collection("chat_thread_states"),
            jobs: db.collection("job_runs"),
            db,
        }
    }

    pub(crate) fn rows(&self, name: &str) -> Collection<MongoRow> {
        self.db.collection(name)
    }

    /// Create the indexes the repositories rely on. Safe to call on every start.
    pub async fn ensure_indexes(&self) -> Result<()> {
        self.messages
            .create_index(unique(doc! { "thread_id": 1, "seq": 1 }))
            .await?;
        self.messages
            .create_index(plain(doc! { "thread_id": 1, "kind": 1, "seq": -1 }))
            .await?;
        self.threads
            .create_index(plain(doc! { "user_id": 1, "updated_at": -1 }))
            .await?;
        self.jobs
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "dedupe_key": 1 })
                    .options(IndexOptions::builder().unique(true).sparse(true).build())
                    .build(),
            )
            .await?;
        self.jobs
            .create_index(plain(doc! { "job_type": 1, "status": 1, "run_after": 1 }))
            .await?;

        for name in [
            CHAT_DOCS,
            SUMMARY_NODES,
            ENTITIES,
            EDGES,
            CLAIMS,
            MEMORY_ITEMS,
        ] {
            self.rows(name)
                .create_index(plain(doc! { "keys.user_id": 1, "keys.scope": 1, "keys.scope_id": 1 }))
                .await?;
        }
        self.rows(SUMMARY_NODES)
            .create_index(plain(doc! { "keys.thread_id": 1, "keys.level": 1 }))
            .await?;
        self.rows(MATERIAL_CHUNKS)
            .create_index(plain(doc! { "keys.material_set_id": 1 }))
            .await?;
        Ok(())
    }
}

/// Duplicate key (E11000) on insert
pub(crate) fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(WriteError { code: 11000, .. }))
    )
}

fn plain(keys: Document) -> IndexModel {
    IndexModel::builder().keys(keys).build()
}

fn unique(keys: Document) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(IndexOptions::builder().unique(true).build())
        .build()
}
