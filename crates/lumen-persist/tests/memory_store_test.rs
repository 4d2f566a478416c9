use std::sync::Arc;

use lumen_persist::{
    ChatDocRepository, JobRepository, MemoryStore, MessageRepository, Stores, ThreadRepository,
    ThreadStateRepository,
};
use lumen_types::jobs::{CHAT_MAINTAIN, ENTITY_THREAD};
use lumen_types::{ChatDoc, Cursor, DocType, NewJob, NewMessage, Scope, Thread};
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn test_concurrent_appends_are_gapless() {
    let store = Arc::new(MemoryStore::new());
    let thread = store
        .create_thread(Thread::new(Uuid::new_v4(), "race", None))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..32 {
        let store = store.clone();
        let (tid, uid) = (thread.id, thread.user_id);
        handles.push(tokio::spawn(async move {
            store
                .append_message(NewMessage::user(tid, uid, format!("msg {}", i)))
                .await
                .unwrap()
                .seq
        }));
    }

    let mut seqs = Vec::new();
    for handle in handles {
        seqs.push(handle.await.unwrap());
    }
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=32).collect::<Vec<i64>>());
    assert_eq!(store.get_thread(thread.id).await.unwrap().unwrap().next_seq, 33);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pairs_stay_adjacent() {
    let store = Arc::new(MemoryStore::new());
    let thread = store
        .create_thread(Thread::new(Uuid::new_v4(), "pairs", None))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..64 {
        let store = store.clone();
        let (tid, uid) = (thread.id, thread.user_id);
        handles.push(tokio::spawn(async move {
            // single appends race the pairs for the same counter
            if i % 4 == 0 {
                store.append_message(NewMessage::user(tid, uid, "note")).await.unwrap();
            }
            store
                .append_pair(
                    NewMessage::user(tid, uid, format!("q {}", i)),
                    NewMessage::assistant_placeholder(tid, uid),
                )
                .await
                .unwrap()
        }));
    }

    for handle in handles {
        let (user, assistant) = handle.await.unwrap();
        assert_eq!(assistant.seq, user.seq + 1);
    }
    assert_eq!(store.get_thread(thread.id).await.unwrap().unwrap().next_seq, 64 * 2 + 16 + 1);
}

#[tokio::test]
async fn test_pair_across_threads_is_rejected() {
    let store = MemoryStore::new();
    let a = store.create_thread(Thread::new(Uuid::new_v4(), "a", None)).await.unwrap();
    let b = store.create_thread(Thread::new(a.user_id, "b", None)).await.unwrap();

    let result = store
        .append_pair(
            NewMessage::user(a.id, a.user_id, "hi"),
            NewMessage::assistant_placeholder(b.id, b.user_id),
        )
        .await;
    assert!(result.is_err());
    assert_eq!(store.get_thread(a.id).await.unwrap().unwrap().next_seq, 1);
}

#[tokio::test]
async fn test_concurrent_enqueue_unique_creates_one_job() {
    let store = Arc::new(MemoryStore::new());
    let owner = Uuid::new_v4();
    let thread_id = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .enqueue_unique(NewJob::new(
                    owner,
                    CHAT_MAINTAIN,
                    ENTITY_THREAD,
                    Some(thread_id),
                    json!({ "thread_id": thread_id }),
                ))
                .await
                .unwrap()
                .is_new()
        }));
    }

    let mut created = 0;
    for handle in handles {
        if handle.await.unwrap() {
            created += 1;
        }
    }
    assert_eq!(created, 1);
    assert_eq!(store.list_jobs().await.len(), 1);
}

#[tokio::test]
async fn test_concurrent_cursor_advances_keep_maximum() {
    let store = Arc::new(MemoryStore::new());
    let thread_id = Uuid::new_v4();

    let mut handles = Vec::new();
    for proposed in [4_i64, 9, 2, 7, 9, 1] {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .advance_cursor(thread_id, Cursor::Graph, proposed)
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    let state = store.ensure_state(thread_id).await.unwrap();
    assert_eq!(state.last_graph_seq, 9);
    assert_eq!(state.last_indexed_seq, 0);
}

#[tokio::test]
async fn test_docs_scoped_by_user_and_type() {
    let stores = Stores::in_memory();
    let user = Uuid::new_v4();
    let thread_id = Uuid::new_v4();
    let source = Uuid::new_v4();

    let chunk = ChatDoc::projected(
        user,
        DocType::MessageChunk,
        Scope::Thread,
        Some(thread_id),
        source,
        0,
        1,
        "hello world",
    )
    .in_thread(thread_id);
    let summary = ChatDoc::projected(
        user,
        DocType::Summary,
        Scope::Thread,
        Some(thread_id),
        source,
        0,
        1,
        "summary",
    )
    .in_thread(thread_id);
    stores.docs.upsert_docs(vec![chunk.clone(), summary]).await.unwrap();
    // replaying the same projection keeps one row per id
    stores.docs.upsert_docs(vec![chunk.clone()]).await.unwrap();

    let chunks = stores
        .docs
        .list_docs(user, Scope::Thread, Some(thread_id), &[DocType::MessageChunk])
        .await
        .unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].id, chunk.id);

    let others = stores.docs.get_docs(Uuid::new_v4(), &[chunk.id]).await.unwrap();
    assert!(others.is_empty());

    let removed = stores
        .docs
        .delete_thread_docs(thread_id, &[DocType::MessageChunk, DocType::Summary])
        .await
        .unwrap();
    assert_eq!(removed.len(), 2);
}
