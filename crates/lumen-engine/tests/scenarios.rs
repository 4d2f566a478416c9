mod common;

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use common::{drain, test_config, Harness, Reply};
use lumen_engine::tools::{tool_reply, ToolStatus};
use lumen_engine::{CancelToken, JobDisposition, PostedTurn, RespondOutcome};
use lumen_llm::LlmError;
use lumen_types::jobs::{CHAT_MAINTAIN, CHAT_REBUILD, CHAT_RESPOND};
use lumen_types::{
    AssistantMetadata, ChatRespondPayload, Cursor, DocType, JobStatus, MessageStatus, SseEvent, TurnStatus,
};
use uuid::Uuid;

fn payload(posted: &PostedTurn) -> ChatRespondPayload {
    ChatRespondPayload {
        turn_id: posted.turn.id,
        thread_id: posted.turn.thread_id,
        user_id: posted.turn.user_id,
        user_message_id: posted.user_message.id,
        assistant_message_id: posted.assistant_message.id,
        job_id: Some(posted.job_id),
        attempt: 0,
    }
}

async fn respond(h: &Harness, posted: &PostedTurn) -> RespondOutcome {
    h.engine
        .responder
        .respond(&payload(posted), CancelToken::never())
        .await
        .unwrap()
}

async fn metadata(h: &Harness, message_id: Uuid) -> AssistantMetadata {
    serde_json::from_value(h.message(message_id).await.metadata).unwrap()
}

#[tokio::test]
async fn test_smalltalk_answers_without_retrieval() {
    let h = Harness::new();
    let thread = h.thread(None).await;

    let posted = h.engine.chat.post_message(h.user_id, thread.id, "hey, how are you?").await.unwrap();
    let run = h.engine.runtime.run_once(CancelToken::never()).await.unwrap().unwrap();
    assert_eq!(run.job_type, CHAT_RESPOND);
    assert_eq!(run.disposition, JobDisposition::Succeeded);

    let reply = h.message(posted.assistant_message.id).await;
    assert_eq!(reply.status, MessageStatus::Done);
    assert_eq!(reply.content, "Doing well, thanks! What are we studying today?");
    assert_eq!(metadata(&h, reply.id).await.route.as_deref(), Some("smalltalk"));

    assert_eq!(h.llm.count("text"), 1);
    assert_eq!(h.llm.count("stream"), 0);
    assert_eq!(h.llm.count("conversation"), 0);
    assert_eq!(h.llm.count("embed"), 0);

    let turn = h.stores.turns.get_turn(posted.turn.id).await.unwrap().unwrap();
    assert_eq!(turn.status, TurnStatus::Done);
    assert!(turn.retrieval_trace.is_null());

    let maintain: Vec<_> = h
        .memory
        .list_jobs()
        .await
        .into_iter()
        .filter(|j| j.job_type == CHAT_MAINTAIN)
        .collect();
    assert_eq!(maintain.len(), 1);
    assert_eq!(maintain[0].status, JobStatus::Queued);
    assert_eq!(maintain[0].entity_id, Some(thread.id));
}

#[tokio::test]
async fn test_path_question_cites_the_overview() {
    let h = Harness::new();
    let path = h.path(None).await;
    h.engine.path_indexer.index_path(path.id).await.unwrap();
    let overview = h
        .memory
        .all_docs()
        .await
        .into_iter()
        .find(|d| d.doc_type == DocType::PathOverview)
        .unwrap();
    let source_id = format!("doc:{}", overview.id);

    h.llm.script_reply(Reply::Text(vec![
        "The units are \"Ownership Basics\" and ".to_string(),
        format!("\"Borrowing Rules\" [[source:{}]].", source_id),
    ]));
    let thread = h.thread(Some(path.id)).await;
    let posted = h
        .engine
        .chat
        .post_message(h.user_id, thread.id, "what were the unit titles?")
        .await
        .unwrap();
    let outcome = respond(&h, &posted).await;

    assert_eq!(outcome.route, "product");
    assert!(outcome.metadata.quote_verified);
    assert!(outcome.metadata.evidence_ids.contains(&source_id));
    assert_eq!(outcome.metadata.citations.len(), 1);
    assert_eq!(outcome.metadata.citations[0].source_id, source_id);
    assert!(!outcome.content.contains("[[source:"));
    assert!(outcome.content.contains("\"Borrowing Rules\""));

    let request = &h.llm.stream_requests()[0];
    let prompt = format!("{}\n{}", request.system, request.user);
    assert!(prompt.contains("Ownership Basics"));
    assert!(prompt.contains("Borrowing Rules"));

    let turn = h.stores.turns.get_turn(posted.turn.id).await.unwrap().unwrap();
    assert!(!turn.retrieval_trace.is_null());
}

#[tokio::test]
async fn test_verbatim_quote_cites_the_material_page() {
    let h = Harness::new();
    let set_id = Uuid::new_v4();
    let path = h.path(Some(set_id)).await;
    let chunk = h
        .material(
            set_id,
            "rust-book.pdf",
            "Ownership is a set of rules that govern how a Rust program manages memory. Each value in Rust has an owner.",
            4,
        )
        .await;
    let source_id = format!("chunk:{}", chunk.id);

    h.llm.script_reply(Reply::Text(vec![format!(
        "The book puts it plainly: \"Each value in Rust has an owner\" [[source:{}]].",
        source_id
    )]));
    let thread = h.thread(Some(path.id)).await;
    let posted = h
        .engine
        .chat
        .post_message(h.user_id, thread.id, "quote the file where it defines ownership")
        .await
        .unwrap();
    let outcome = respond(&h, &posted).await;

    assert!(outcome.metadata.quote_verified);
    let citation = outcome
        .metadata
        .citations
        .iter()
        .find(|c| c.source_id == source_id)
        .unwrap();
    assert_eq!(citation.file_name.as_deref(), Some("rust-book.pdf"));
    assert_eq!(citation.page, Some(4));
    assert!(outcome.content.contains("[rust-book.pdf, p. 4]"));
}

#[tokio::test]
async fn test_stream_failure_is_retried_from_scratch() {
    let h = Harness::new();
    let thread = h.thread(None).await;
    h.llm.script_reply(Reply::FailAfter(
        vec!["Ownership means ".to_string()],
        LlmError::Http {
            status: 503,
            body: "upstream overloaded".into(),
        },
    ));
    h.llm.script_reply(Reply::text(&["Ownership means ", "one owner per value."]));

    let mut sub = h.engine.notifier.subscribe(h.user_id);
    let posted = h
        .engine
        .chat
        .post_message(h.user_id, thread.id, "explain ownership to me")
        .await
        .unwrap();

    let first = h.engine.runtime.run_once(CancelToken::never()).await.unwrap().unwrap();
    assert_eq!(first.disposition, JobDisposition::Retrying);
    let failed = h.message(posted.assistant_message.id).await;
    assert_eq!(failed.status, MessageStatus::Error);
    assert_eq!(failed.content, "Ownership means ");

    tokio::time::sleep(Duration::from_millis(30)).await;
    let second = h.engine.runtime.run_once(CancelToken::never()).await.unwrap().unwrap();
    assert_eq!(second.job_type, CHAT_RESPOND);
    assert_eq!(second.disposition, JobDisposition::Succeeded);

    let reply = h.message(posted.assistant_message.id).await;
    assert_eq!(reply.status, MessageStatus::Done);
    assert_eq!(reply.content, "Ownership means one owner per value.");
    let turn = h.stores.turns.get_turn(posted.turn.id).await.unwrap().unwrap();
    assert_eq!(turn.attempt, 1);

    let events = drain(&mut sub);
    assert!(events
        .iter()
        .any(|e| e.event == SseEvent::MessageError && e.data["attempt"] == 0));
    assert!(events.iter().any(|e| e.event == SseEvent::MessageCreated
        && e.data["attempt"] == 1
        && e.data["message"]["content"] == ""));
    let last = events.last().unwrap();
    assert_eq!(last.event, SseEvent::MessageDone);
    assert_eq!(last.data["content"], "Ownership means one owner per value.");
    assert_eq!(last.data["attempt"], 1);
}

#[tokio::test]
async fn test_rebuild_tool_enqueues_once() {
    let h = Harness::new();
    let thread = h.thread(None).await;
    let text = "rebuild the chat index for this thread";

    let first = h.engine.chat.post_message(h.user_id, thread.id, text).await.unwrap();
    let outcome = respond(&h, &first).await;
    assert_eq!(outcome.route, "tool");
    assert_eq!(outcome.content, tool_reply(CHAT_REBUILD, ToolStatus::Enqueued));
    assert_eq!(h.llm.count("stream"), 0);

    let second = h.engine.chat.post_message(h.user_id, thread.id, text).await.unwrap();
    let outcome = respond(&h, &second).await;
    assert_eq!(outcome.content, tool_reply(CHAT_REBUILD, ToolStatus::AlreadyRunning));
    assert_eq!(outcome.metadata.tool.as_ref().unwrap()["status"], "already_running");

    let rebuilds = h
        .memory
        .list_jobs()
        .await
        .into_iter()
        .filter(|j| j.job_type == CHAT_REBUILD)
        .count();
    assert_eq!(rebuilds, 1);
}

#[tokio::test]
async fn test_raptor_forest_converges() {
    let h = Harness::new();
    let thread = h.thread(None).await;
    h.seed_exchanges(&thread, 30).await;

    let first = h.engine.maintainer.maintain(thread.id, CancelToken::never()).await.unwrap();
    assert!(first.phase("summarize").map(|p| p.written).unwrap_or(0) > 0);
    let before: BTreeMap<Uuid, String> = h
        .stores
        .summaries
        .list_nodes(thread.id)
        .await
        .unwrap()
        .into_iter()
        .map(|n| (n.id, n.summary_md))
        .collect();

    h.engine.maintainer.maintain(thread.id, CancelToken::never()).await.unwrap();
    let nodes = h.stores.summaries.list_nodes(thread.id).await.unwrap();
    let after: BTreeMap<Uuid, String> = nodes.iter().map(|n| (n.id, n.summary_md.clone())).collect();
    assert_eq!(before, after);

    let leaves: Vec<_> = nodes.iter().filter(|n| n.level == 0).collect();
    assert_eq!(leaves.len(), 3);
    let roots: Vec<_> = nodes.iter().filter(|n| n.parent_id.is_none()).collect();
    assert_eq!(roots.len(), 1);
    assert_eq!((roots[0].start_seq, roots[0].end_seq), (1, 60));

    let state = h.stores.thread_state.ensure_state(thread.id).await.unwrap();
    assert_eq!(state.cursor(Cursor::Summarized), 60);
    assert_eq!(state.cursor(Cursor::Indexed), 60);
}

#[tokio::test]
async fn test_embeddings_go_out_in_bounded_batches() {
    let mut config = test_config();
    config.maintainer.embed_batch = 4;
    config.maintainer.contextualize = false;
    let h = Harness::with_config(config);
    let thread = h.thread(None).await;
    h.seed_exchanges(&thread, 6).await;
    // the question at seq 5 sinks the batch holding seqs 5..=8
    h.llm.poison_embeds("Question 2 ");

    h.engine.maintainer.maintain(thread.id, CancelToken::never()).await.unwrap();
    assert!(h.llm.embed_sizes().iter().all(|n| *n <= 4));

    let chunks: Vec<_> = h
        .memory
        .all_docs()
        .await
        .into_iter()
        .filter(|d| d.doc_type == DocType::MessageChunk)
        .collect();
    assert_eq!(chunks.len(), 12);
    let mut bare: Vec<i64> = chunks
        .iter()
        .filter(|d| d.embedding.is_empty())
        .filter_map(|d| d.source_seq)
        .collect();
    bare.sort_unstable();
    assert_eq!(bare, vec![5, 6, 7, 8]);
}

#[tokio::test]
async fn test_worker_pool_answers_and_maintains() {
    let h = Harness::new();
    let thread = h.thread(None).await;
    let posted = h
        .engine
        .chat
        .post_message(h.user_id, thread.id, "what is a borrow checker?")
        .await
        .unwrap();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let workers = h.engine.start_workers(rx);
    for _ in 0..200 {
        let done = h
            .memory
            .list_jobs()
            .await
            .iter()
            .all(|j| j.status == JobStatus::Succeeded);
        if done && h.memory.list_jobs().await.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    for worker in workers {
        tokio::time::timeout(Duration::from_secs(2), worker).await.unwrap().unwrap();
    }

    let types: HashSet<String> = h.memory.list_jobs().await.into_iter().map(|j| j.job_type).collect();
    assert_eq!(types, HashSet::from([CHAT_RESPOND.to_string(), CHAT_MAINTAIN.to_string()]));
    assert_eq!(h.message(posted.assistant_message.id).await.status, MessageStatus::Done);
    let state = h.stores.thread_state.ensure_state(thread.id).await.unwrap();
    assert_eq!(state.cursor(Cursor::Indexed), 2);
}
