//! End-to-end coverage of the core data flow: subscribe-before-create,
//! commit, and fan-out, without going through an actual WebSocket
//! transport. Exercises the same component seams the dispatcher wires
//! together.

use collab_core::document::{CreateSpec, DocumentAdapter, InMemoryDocumentAdapter, Operation};
use collab_core::events::{EventConverter, EventKind};
use collab_core::json0::OpBuilder;
use collab_core::middleware::SubmitChain;
use collab_core::pubsub::memory::InMemoryPubSub;
use collab_core::pubsub::PubSub;
use serde_json::json;

#[tokio::test]
async fn subscribe_before_create_then_commit_produces_a_live_snapshot() {
    let store = InMemoryDocumentAdapter::new();

    let before = store.get_snapshot("rec_tbl_T1", "rec_R1").await.unwrap();
    assert!(before.is_none());

    let create = Operation::create(
        "rec_tbl_T1",
        "rec_R1",
        1,
        CreateSpec { content_type: "json0".into(), data: json!({"data": {"name": "Ada"}}) },
    );
    store.record_committed_op(create.clone());

    let after = store.get_snapshot("rec_tbl_T1", "rec_R1").await.unwrap().unwrap();
    assert_eq!(after.version, 1);

    let event = EventConverter::convert(&create).unwrap();
    assert_eq!(event.kind, EventKind::RecordCreated);
}

#[tokio::test]
async fn submitted_edit_fans_out_to_both_collection_and_document_channels() {
    let pubsub = InMemoryPubSub::new(16);
    let chain = SubmitChain::default_chain();

    let mut collection_sub = pubsub.subscribe("rec_tbl_T1").await.unwrap();
    let mut doc_sub = pubsub.subscribe("rec_tbl_T1.rec_R1").await.unwrap();

    let op = Operation::edit("rec_tbl_T1", "rec_R1", 2, vec![OpBuilder::set_field("name", json!("Grace"), Some(json!("Ada")))]);
    chain.run(&op).await.unwrap();

    for channel in op.channels() {
        pubsub.publish(&channel, json!({"v": op.version})).await.unwrap();
    }

    assert!(collection_sub.rx.recv().await.is_some());
    assert!(doc_sub.rx.recv().await.is_some());
}

#[tokio::test]
async fn submit_chain_rejects_ops_against_non_record_collections() {
    let chain = SubmitChain::default_chain();
    let op = Operation::edit("view_tbl_T1", "view_V1", 1, vec![OpBuilder::set_meta("view", "name", json!("Board"), None)]);
    let err = chain.run(&op).await.unwrap_err();
    assert!(err.to_string().contains("policy"));
}

#[tokio::test]
async fn deleting_a_record_is_reported_as_deleted() {
    let op = Operation::delete("rec_tbl_T1", "rec_R1", 3);
    let event = EventConverter::convert(&op).unwrap();
    assert_eq!(event.kind, EventKind::RecordDeleted);
}
