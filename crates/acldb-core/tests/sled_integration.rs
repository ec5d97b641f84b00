//! Integration tests for the engine over the sled backend.

use std::sync::Arc;

use futures::TryStreamExt;

use acldb_core::proto::{FilterNode, NewObject, Request, SortSpec, Update, Value};
use acldb_core::{ClassDef, Engine, PrimitiveType, Schema, SledBackend, SledConfig, TransactionMode};

fn schema() -> Schema {
    Schema::new([ClassDef::new("Task")
        .with_field("title", PrimitiveType::String)
        .with_field("done", PrimitiveType::Boolean)])
    .unwrap()
}

fn open(dir: &tempfile::TempDir) -> (Engine, Arc<SledBackend>) {
    let backend = Arc::new(SledBackend::open(&SledConfig::new(dir.path())).unwrap());
    let engine = Engine::builder(schema()).with_backend(backend.clone()).build();
    (engine, backend)
}

// ============== Tests ==============

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (engine, backend) = open(&dir);
        for title in ["write", "test", "ship"] {
            engine
                .execute(Request::insert("Task", NewObject::new().with("title", title).with("done", false)))
                .await
                .unwrap();
        }
        engine
            .execute(Request::update_one(
                "Task",
                FilterNode::eq("title", "write"),
                Update::new().set("done", true),
            ))
            .await
            .unwrap();
        backend.flush().unwrap();
    }

    let (engine, _backend) = open(&dir);
    let tasks = engine
        .execute(Request::find("Task").with_sort(SortSpec::asc("title")))
        .await
        .unwrap()
        .into_objects();
    let titles: Vec<_> = tasks.iter().map(|t| t.attributes["title"].clone()).collect();
    assert_eq!(titles, vec![Value::from("ship"), Value::from("test"), Value::from("write")]);
    assert_eq!(tasks[2].attributes["done"], Value::Bool(true));
    assert_eq!(tasks[2].version, 2);
}

#[tokio::test]
async fn test_transaction_commits_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _backend) = open(&dir);

    engine
        .transaction(TransactionMode::Repeatable, |tx| async move {
            tx.execute(Request::insert("Task", NewObject::new().with("title", "a")))
                .await?;
            tx.execute(Request::insert("Task", NewObject::new().with("title", "b")))
                .await?;
            Ok(())
        })
        .await
        .unwrap();

    let count = engine.execute(Request::count("Task")).await.unwrap().count();
    assert_eq!(count, Some(2));

    let batches: Vec<Vec<_>> = engine
        .each_batch(Request::find("Task"), 1)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(batches.len(), 2);
}
