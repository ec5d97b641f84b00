//! Integration tests for the request pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures::TryStreamExt;
use rust_decimal::Decimal;

use acldb_core::query::{CompiledFilter, CompiledQuery};
use acldb_core::catalog::{ClassOperation, ROLE_CLASS, ROLE_NAME_FIELD, ROLE_ROLES_FIELD, ROLE_USERS_FIELD, USER_CLASS};
use acldb_core::proto::{
    AccumulatorSpec, FileRef, FilterNode, MatchSpec, NewObject, ObjectRecord, ObjectRef, Operation, Request,
    Response, Update, Value,
};
use acldb_core::{
    trigger_fn, ClassDef, ConflictError, DefaultMatch, Engine, EngineConfig, Error, FieldType, PrimitiveType, RoleResolver,
    MemoryBackend, Schema, StorageBackend, TransactionMode, Trigger, TriggerContext, TriggerEvent,
};

const MASTER: &str = "master-secret";

struct TestContext {
    engine: Engine,
}

impl TestContext {
    fn new(classes: Vec<ClassDef>) -> Self {
        Self::with_config(classes, EngineConfig::new())
    }

    fn with_config(classes: Vec<ClassDef>, config: EngineConfig) -> Self {
        let schema = Schema::new(classes).unwrap();
        let engine = Engine::builder(schema)
            .with_config(config.with_master_key(MASTER))
            .build();
        Self { engine }
    }

    async fn insert(&self, class_name: &str, object: NewObject) -> ObjectRecord {
        self.engine
            .execute(Request::insert(class_name, object).as_master(MASTER))
            .await
            .unwrap()
            .into_object()
            .unwrap()
    }

    async fn find_as(&self, user_id: &str, request: Request) -> Vec<ObjectRecord> {
        self.engine
            .execute(request.as_user(user_id))
            .await
            .unwrap()
            .into_objects()
    }

    /// Create a role whose direct members are `users` and whose child roles are `roles`.
    async fn role(&self, name: &str, users: &[&str], roles: &[&str]) -> ObjectRecord {
        let users = users.iter().map(|id| pointer(USER_CLASS, id)).collect();
        let roles = roles.iter().map(|id| pointer(ROLE_CLASS, id)).collect();
        self.insert(
            ROLE_CLASS,
            NewObject::new()
                .with(ROLE_NAME_FIELD, name)
                .with(ROLE_USERS_FIELD, Value::Array(users))
                .with(ROLE_ROLES_FIELD, Value::Array(roles)),
        )
        .await
    }

    async fn aggregate(&self, request: Request) -> BTreeMap<String, Value> {
        match self.engine.execute(request.as_master(MASTER)).await.unwrap() {
            Response::Aggregate(Value::Object(map)) => map,
            other => panic!("unexpected response: {other:?}"),
        }
    }
}

fn pointer(class_name: &str, id: &str) -> Value {
    Value::Pointer(ObjectRef::new(class_name, id))
}

fn ids(records: &[ObjectRecord]) -> BTreeSet<String> {
    records.iter().map(|record| record.id.clone()).collect()
}

/// Ids of the objects an include expanded into an array attribute.
fn included_ids(record: &ObjectRecord, field: &str) -> BTreeSet<String> {
    match record.attributes.get(field) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get_path("id"))
            .filter_map(|id| id.as_str().map(str::to_string))
            .collect(),
        _ => BTreeSet::new(),
    }
}

fn decimal(s: &str) -> Value {
    Value::Decimal(Decimal::from_str(s).unwrap())
}

// ============== Tests ==============

#[tokio::test]
async fn test_role_closure_terminates_and_is_idempotent() {
    let ctx = TestContext::new(vec![]);
    let member = ctx.role("member", &["u1"], &[]).await;
    let editor = ctx.role("editor", &[], &[&member.id]).await;
    let admin = ctx.role("admin", &[], &[&editor.id]).await;
    // Close the cycle and add a self-reference.
    ctx.engine
        .execute(
            Request::update_one(
                ROLE_CLASS,
                FilterNode::eq("id", member.id.as_str()),
                Update::new().set(
                    ROLE_ROLES_FIELD,
                    Value::Array(vec![pointer(ROLE_CLASS, &admin.id), pointer(ROLE_CLASS, &member.id)]),
                ),
            )
            .as_master(MASTER),
        )
        .await
        .unwrap();

    let backend = ctx.engine.backend();
    let resolver = RoleResolver::new(backend.as_ref());
    let first = resolver.resolve("u1").await.unwrap();
    let second = resolver.resolve("u1").await.unwrap();
    assert_eq!(first, second);
    let names: Vec<&str> = first.roles().iter().map(String::as_str).collect();
    assert_eq!(names, vec!["admin", "editor", "member"]);

    let seed = BTreeMap::from([
        (member.id.clone(), "member".to_string()),
        (editor.id.clone(), "editor".to_string()),
        (admin.id.clone(), "admin".to_string()),
    ]);
    let closure = resolver.expand(seed.clone()).await.unwrap();
    assert_eq!(resolver.expand(closure.clone()).await.unwrap(), closure);
    assert_eq!(closure, seed);

    let outsider = resolver.resolve("u2").await.unwrap();
    assert!(outsider.roles().is_empty());
}

async fn check_chain_visibility(depth: usize) {
    let name = |i: usize| format!("L{i}");
    let classes = (0..=depth)
        .map(|i| {
            if i == depth {
                ClassDef::new(name(i)).with_field("label", PrimitiveType::String)
            } else {
                ClassDef::new(name(i)).with_field("next", FieldType::pointer(name(i + 1)))
            }
        })
        .collect();
    let ctx = TestContext::new(classes);
    ctx.role("viewer", &["u1"], &[]).await;

    let mut roots = BTreeMap::new();
    for (label, acl) in [("open", None), ("secret", Some(vec!["role:viewer"]))] {
        let mut leaf = NewObject::new().with("label", label);
        if let Some(acl) = acl {
            leaf = leaf.with_read_acl(acl);
        }
        let mut current = ctx.insert(&name(depth), leaf).await;
        for i in (0..depth).rev() {
            current = ctx
                .insert(&name(i), NewObject::new().with("next", current.pointer()))
                .await;
        }
        roots.insert(label, current.id);
    }

    let chain = vec!["next"; depth].join(".");
    let request = Request::find(name(0)).with_include(chain.clone());

    let authorized = ctx.find_as("u1", request.clone()).await;
    assert_eq!(authorized.len(), 2, "depth {depth}");
    for record in &authorized {
        assert!(record.value_at(&format!("{chain}.label")).is_some(), "depth {depth}");
    }

    let outsider = ctx.find_as("u2", request).await;
    assert_eq!(outsider.len(), 2, "depth {depth}");
    for record in &outsider {
        let leaf = record.value_at(&format!("{chain}.label")).map(|v| v.into_owned());
        if record.id == roots["secret"] {
            assert_eq!(leaf, None, "depth {depth}");
            if depth > 1 {
                let parent = vec!["next"; depth - 1].join(".");
                assert!(record.value_at(&parent).is_some(), "depth {depth}");
            }
        } else {
            assert_eq!(leaf, Some(Value::from("open")), "depth {depth}");
        }
    }

    let through_chain = Request::find(name(0)).with_filter(FilterNode::exists(format!("{chain}.label")));
    assert_eq!(ids(&ctx.find_as("u1", through_chain.clone()).await).len(), 2);
    let visible = ctx.find_as("u2", through_chain).await;
    assert_eq!(ids(&visible), BTreeSet::from([roots["open"].clone()]));
}

#[tokio::test]
async fn test_visibility_is_transitive_and_silent() {
    for depth in [2, 4, 7] {
        check_chain_visibility(depth).await;
    }
}

#[tokio::test]
async fn test_explicit_and_implicit_relations_agree() {
    let ctx = TestContext::new(vec![
        ClassDef::new("Author")
            .with_field("name", PrimitiveType::String)
            .with_field("books", FieldType::relation("Book"))
            .with_field("written", FieldType::implicit_relation("Book", "author")),
        ClassDef::new("Book")
            .with_field("title", PrimitiveType::String)
            .with_field("author", FieldType::pointer("Author")),
    ]);

    let ada = ctx.insert("Author", NewObject::new().with("name", "Ada")).await;
    let bob = ctx.insert("Author", NewObject::new().with("name", "Bob")).await;
    let cy = ctx.insert("Author", NewObject::new().with("name", "Cy")).await;

    let mut edges: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for (title, author) in [("T1", &ada), ("T2", &ada), ("T3", &bob)] {
        let book = ctx
            .insert(
                "Book",
                NewObject::new().with("title", title).with("author", author.pointer()),
            )
            .await;
        edges.entry(author.id.clone()).or_default().push(book.pointer());
    }
    ctx.insert("Book", NewObject::new().with("title", "orphan")).await;
    for (author, books) in edges {
        ctx.engine
            .execute(
                Request::update_one(
                    "Author",
                    FilterNode::eq("id", author.as_str()),
                    Update::new().set("books", Value::Array(books)),
                )
                .as_master(MASTER),
            )
            .await
            .unwrap();
    }

    let expanded = ctx
        .find_as(
            "u1",
            Request::find("Author").with_include("books").with_include("written"),
        )
        .await;
    assert_eq!(expanded.len(), 3);
    for record in &expanded {
        assert_eq!(included_ids(record, "books"), included_ids(record, "written"));
    }
    let ada_row = expanded.iter().find(|r| r.id == ada.id).unwrap();
    assert_eq!(included_ids(ada_row, "books").len(), 2);
    let cy_row = expanded.iter().find(|r| r.id == cy.id).unwrap();
    assert!(included_ids(cy_row, "written").is_empty());

    for title in ["T1", "T3", "missing"] {
        let explicit = ctx
            .find_as("u1", Request::find("Author").with_filter(FilterNode::eq("books.title", title)))
            .await;
        let implicit = ctx
            .find_as("u1", Request::find("Author").with_filter(FilterNode::eq("written.title", title)))
            .await;
        assert_eq!(ids(&explicit), ids(&implicit), "title {title}");
    }

    let counted = |field: &str| {
        Request::find("Author")
            .with_filter(FilterNode::count_matches(field, MatchSpec::new()).and(FilterNode::eq(field, 2)))
    };
    let explicit = ctx.find_as("u1", counted("books")).await;
    let implicit = ctx.find_as("u1", counted("written")).await;
    assert_eq!(ids(&explicit), BTreeSet::from([ada.id.clone()]));
    assert_eq!(ids(&explicit), ids(&implicit));
}

#[tokio::test]
async fn test_default_match_narrows_every_expansion() {
    let approved = DefaultMatch {
        filter: Some(FilterNode::eq("text", "ok")),
        ..DefaultMatch::default()
    };
    let ctx = TestContext::new(vec![
        ClassDef::new("Post")
            .with_field("title", PrimitiveType::String)
            .with_field("comments", FieldType::relation("Comment").with_default_match(approved)),
        ClassDef::new("Comment").with_field("text", PrimitiveType::String),
    ]);

    let ok = ctx.insert("Comment", NewObject::new().with("text", "ok")).await;
    let bad = ctx.insert("Comment", NewObject::new().with("text", "bad")).await;
    let mut posts = BTreeMap::new();
    for (title, comments) in [("p1", vec![&bad]), ("p2", vec![&ok, &bad]), ("p3", vec![&ok])] {
        let comments = Value::Array(comments.iter().map(|c| c.pointer()).collect());
        let post = ctx
            .insert("Post", NewObject::new().with("title", title).with("comments", comments))
            .await;
        posts.insert(title, post.id);
    }
    let titles = |records: Vec<ObjectRecord>| -> BTreeSet<String> {
        records
            .iter()
            .filter_map(|r| r.attributes.get("title").and_then(|v| v.as_str()).map(str::to_string))
            .collect()
    };
    let expect = |names: &[&str]| -> BTreeSet<String> { names.iter().map(|n| n.to_string()).collect() };
    let find = |filter: FilterNode| Request::find("Post").with_filter(filter);

    let included = ctx.find_as("u1", Request::find("Post").with_include("comments")).await;
    for record in &included {
        let expected = if record.id == posts["p1"] {
            BTreeSet::new()
        } else {
            BTreeSet::from([ok.id.clone()])
        };
        assert_eq!(included_ids(record, "comments"), expected);
    }

    let some_bad = ctx.find_as("u1", find(FilterNode::some("comments", FilterNode::eq("$.text", "bad")))).await;
    assert!(some_bad.is_empty());
    let dotted_bad = ctx.find_as("u1", find(FilterNode::eq("comments.text", "bad"))).await;
    assert!(dotted_bad.is_empty());
    let dotted_ok = ctx.find_as("u1", find(FilterNode::eq("comments.text", "ok"))).await;
    assert_eq!(titles(dotted_ok), expect(&["p2", "p3"]));

    // members outside the default match are not violators
    let every_ok = ctx.find_as("u1", find(FilterNode::every("comments", FilterNode::eq("$.text", "ok")))).await;
    assert_eq!(titles(every_ok), expect(&["p1", "p2", "p3"]));
    let every_none = ctx
        .find_as("u1", find(FilterNode::every("comments", FilterNode::eq("$.text", "nope"))))
        .await;
    assert_eq!(titles(every_none), expect(&["p1"]));

    let counted = ctx
        .find_as(
            "u1",
            find(FilterNode::count_matches("comments", MatchSpec::new()).and(FilterNode::eq("comments", 1))),
        )
        .await;
    assert_eq!(titles(counted), expect(&["p2", "p3"]));
}

#[tokio::test]
async fn test_implicit_relation_across_several_hops() {
    let ctx = TestContext::new(vec![
        ClassDef::new("Post")
            .with_field("title", PrimitiveType::String)
            .with_field("voters", FieldType::implicit_relation("Vote", "comment.post")),
        ClassDef::new("Comment")
            .with_field("text", PrimitiveType::String)
            .with_field("post", FieldType::pointer("Post")),
        ClassDef::new("Vote")
            .with_field("stars", PrimitiveType::Number)
            .with_field("comment", FieldType::pointer("Comment")),
    ]);

    let p1 = ctx.insert("Post", NewObject::new().with("title", "p1")).await;
    let p2 = ctx.insert("Post", NewObject::new().with("title", "p2")).await;
    let c1 = ctx.insert("Comment", NewObject::new().with("post", p1.pointer())).await;
    let c2 = ctx
        .insert(
            "Comment",
            NewObject::new().with("post", p1.pointer()).with_read_acl(["role:admin"]),
        )
        .await;
    let c3 = ctx.insert("Comment", NewObject::new().with("post", p2.pointer())).await;
    let v1 = ctx.insert("Vote", NewObject::new().with("stars", 5).with("comment", c1.pointer())).await;
    ctx.insert("Vote", NewObject::new().with("stars", 1).with("comment", c2.pointer())).await;
    let v3 = ctx.insert("Vote", NewObject::new().with("stars", 3).with("comment", c3.pointer())).await;

    let expanded = ctx.find_as("u1", Request::find("Post").with_include("voters")).await;
    let by_post: BTreeMap<String, BTreeSet<String>> = expanded
        .iter()
        .map(|r| (r.id.clone(), included_ids(r, "voters")))
        .collect();
    // the second vote hangs off a comment u1 cannot read
    assert_eq!(by_post[&p1.id], BTreeSet::from([v1.id.clone()]));
    assert_eq!(by_post[&p2.id], BTreeSet::from([v3.id.clone()]));

    let stars = |n: i64| Request::find("Post").with_filter(FilterNode::eq("voters.stars", n));
    assert!(ctx.find_as("u1", stars(1)).await.is_empty());
    assert_eq!(ids(&ctx.find_as("u1", stars(3)).await), BTreeSet::from([p2.id.clone()]));

    let as_master = ctx
        .engine
        .execute(stars(1).as_master(MASTER))
        .await
        .unwrap()
        .into_objects();
    assert_eq!(ids(&as_master), BTreeSet::from([p1.id.clone()]));
}

#[tokio::test]
async fn test_aggregation_null_propagation() {
    let ctx = TestContext::new(vec![ClassDef::new("Metric").with_field("value", PrimitiveType::Number)]);

    let empty = ctx
        .aggregate(
            Request::group_find("Metric")
                .with_accumulator("count", AccumulatorSpec::Count)
                .with_accumulator("sum", AccumulatorSpec::sum("value"))
                .with_accumulator("avg", AccumulatorSpec::avg("value"))
                .with_accumulator("min", AccumulatorSpec::min("value"))
                .with_accumulator("max", AccumulatorSpec::max("value")),
        )
        .await;
    assert_eq!(empty["count"], Value::from(0));
    for name in ["sum", "avg", "min", "max"] {
        assert_eq!(empty[name], Value::Null, "{name}");
    }

    ctx.insert("Metric", NewObject::new().with("value", 3)).await;
    ctx.insert("Metric", NewObject::new()).await;
    let single = ctx
        .aggregate(
            Request::group_find("Metric")
                .with_accumulator("count", AccumulatorSpec::Count)
                .with_accumulator("sum", AccumulatorSpec::sum("value"))
                .with_accumulator("spread", AccumulatorSpec::StdDevSamp("value".into())),
        )
        .await;
    assert_eq!(single["count"], Value::from(2));
    assert_eq!(single["sum"], Value::from(3));
    assert!(matches!(single["spread"], Value::Null) || single["spread"] == Value::from(0));
}

#[tokio::test]
async fn test_decimal_sum_is_exact() {
    let ctx = TestContext::new(vec![ClassDef::new("Payment").with_field("amount", PrimitiveType::Decimal)]);
    for amount in ["10.5", "20.25", "30.75"] {
        ctx.insert("Payment", NewObject::new().with("amount", decimal(amount))).await;
    }
    let totals = ctx
        .aggregate(Request::group_find("Payment").with_accumulator("total", AccumulatorSpec::sum("amount")))
        .await;
    assert_eq!(totals["total"], decimal("61.5"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeatable_transactions_converge() {
    let ctx = TestContext::with_config(
        vec![ClassDef::new("Counter").with_field("n", PrimitiveType::Number)],
        EngineConfig::new()
            .with_max_transaction_attempts(50)
            .with_retry_backoff(Duration::from_millis(2)),
    );
    ctx.insert("Counter", NewObject::new().with("n", 0)).await;

    let increment = || Request::update_one("Counter", FilterNode::exists("n"), Update::new().inc("n", 1));
    let runs = (0..5).map(|_| {
        let engine = ctx.engine.clone();
        async move {
            engine
                .transaction(TransactionMode::Repeatable, |tx| async move {
                    tx.execute(increment()).await?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let record = tx.execute(increment()).await?.into_object();
                    Ok(record.and_then(|r| r.attributes.get("n").cloned()))
                })
                .await
        }
    });

    let mut finals: Vec<i64> = join_all(runs)
        .await
        .into_iter()
        .map(|result| match result.unwrap() {
            Some(Value::Number(n)) => n as i64,
            other => panic!("unexpected counter value: {other:?}"),
        })
        .collect();
    finals.sort();
    assert_eq!(finals, vec![2, 4, 6, 8, 10]);
}

#[tokio::test]
async fn test_hidden_field_write_denied_read_redacted() {
    let hr = vec!["role:hr".to_string()];
    let ctx = TestContext::new(vec![ClassDef::new("Employee")
        .with_field("name", PrimitiveType::String)
        .with_field("salary", PrimitiveType::Number)
        .with_flp("salary", hr.clone(), hr)]);
    ctx.role("hr", &["boss"], &[]).await;
    ctx.insert("Employee", NewObject::new().with("name", "Ann").with("salary", 100))
        .await;

    let write = ctx
        .engine
        .execute(
            Request::update_one("Employee", FilterNode::eq("name", "Ann"), Update::new().set("salary", 1))
                .as_user("u1"),
        )
        .await;
    assert!(matches!(write, Err(Error::Permission)));

    let insert = ctx
        .engine
        .execute(Request::insert("Employee", NewObject::new().with("salary", 5)).as_user("u1"))
        .await;
    assert!(matches!(insert, Err(Error::Permission)));

    let rows = ctx
        .find_as("u1", Request::find("Employee").with_keys(["name", "salary"]))
        .await;
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].attributes.contains_key("salary"));
    assert_eq!(rows[0].attributes["name"], Value::from("Ann"));

    let probed = ctx
        .find_as("u1", Request::find("Employee").with_filter(FilterNode::gt("salary", 0)))
        .await;
    assert!(probed.is_empty());

    let boss = ctx.find_as("boss", Request::find("Employee")).await;
    assert_eq!(boss[0].attributes["salary"], Value::from(100));
}

#[tokio::test]
async fn test_each_batch_is_complete() {
    let ctx = TestContext::new(vec![ClassDef::new("Item").with_field("group", PrimitiveType::String)]);
    for group in ["b", "a", "b", "a", "b"] {
        ctx.insert("Item", NewObject::new().with("group", group)).await;
    }

    for request in [
        Request::find("Item"),
        Request::find("Item").with_sort(acldb_core::proto::SortSpec::asc("group")),
        Request::find("Item").with_sort(acldb_core::proto::SortSpec::desc("group")),
    ] {
        let batches: Vec<Vec<ObjectRecord>> = ctx
            .engine
            .each_batch(request.as_user("u1"), 2)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(batches.len(), 3);
        let all: Vec<ObjectRecord> = batches.into_iter().flatten().collect();
        assert_eq!(all.len(), 5);
        assert_eq!(ids(&all).len(), 5);
    }
}

#[tokio::test]
async fn test_row_acl_hides_rows_silently() {
    let ctx = TestContext::new(vec![ClassDef::new("Doc").with_field("title", PrimitiveType::String)]);
    ctx.insert("Doc", NewObject::new().with("title", "public")).await;
    ctx.insert("Doc", NewObject::new().with("title", "mine").with_read_acl(["u1"]).with_write_acl(["u1"]))
        .await;

    assert_eq!(ctx.find_as("u1", Request::find("Doc")).await.len(), 2);
    assert_eq!(ctx.find_as("u2", Request::find("Doc")).await.len(), 1);

    let deleted = ctx
        .engine
        .execute(Request::new(Operation::FindAndDelete, "Doc").as_user("u2"))
        .await
        .unwrap();
    assert_eq!(deleted, Response::Affected(1));
    assert_eq!(ctx.find_as("u1", Request::find("Doc")).await.len(), 1);
}

#[tokio::test]
async fn test_class_permissions_gate_operations() {
    let ctx = TestContext::new(vec![ClassDef::new("Audit")
        .with_field("entry", PrimitiveType::String)
        .with_clp(ClassOperation::Create, ["role:auditor"])
        .with_clp(ClassOperation::Delete, Vec::<String>::new())]);
    ctx.role("auditor", &["u1"], &[]).await;

    let denied = ctx
        .engine
        .execute(Request::insert("Audit", NewObject::new().with("entry", "x")).as_user("u2"))
        .await;
    assert!(matches!(denied, Err(Error::Permission)));
    ctx.engine
        .execute(Request::insert("Audit", NewObject::new().with("entry", "x")).as_user("u1"))
        .await
        .unwrap();

    let delete = ctx
        .engine
        .execute(Request::new(Operation::FindOneAndDelete, "Audit").as_user("u1"))
        .await;
    assert!(matches!(delete, Err(Error::Permission)));
}

#[tokio::test]
async fn test_triggers_share_context_and_skip_noops() {
    let after_saves = Arc::new(AtomicUsize::new(0));
    let counter = after_saves.clone();
    let schema = Schema::new([ClassDef::new("Post")
        .with_field("title", PrimitiveType::String)
        .with_field("slug", PrimitiveType::String)])
    .unwrap();
    let engine = Engine::builder(schema)
        .with_trigger(
            "Post",
            TriggerEvent::BeforeSave,
            trigger_fn(|ctx| {
                let Some(object) = ctx.object.as_mut() else {
                    return Ok(());
                };
                let title = object.attributes.get("title").and_then(|v| v.as_str()).unwrap_or("");
                if title == "forbidden" {
                    return Err(Error::Trigger("title rejected".into()));
                }
                let slug = title.to_lowercase().replace(' ', "-");
                object.attributes.insert("slug".into(), Value::from(slug));
                ctx.context.insert("slugged".into(), Value::Bool(true));
                Ok(())
            }),
        )
        .with_trigger(
            "Post",
            TriggerEvent::AfterSave,
            trigger_fn(move |ctx| {
                assert_eq!(ctx.context.get("slugged"), Some(&Value::Bool(true)));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .build();

    let created = engine
        .execute(Request::insert("Post", NewObject::new().with("title", "Hello World")))
        .await
        .unwrap()
        .into_object()
        .unwrap();
    assert_eq!(created.attributes["slug"], Value::from("hello-world"));
    assert_eq!(after_saves.load(Ordering::SeqCst), 1);

    let missed = engine
        .execute(Request::update_one(
            "Post",
            FilterNode::eq("title", "nope"),
            Update::new().set("title", "x"),
        ))
        .await
        .unwrap();
    assert_eq!(missed, Response::Object(None));
    assert_eq!(after_saves.load(Ordering::SeqCst), 1);

    let updated = engine
        .execute(Request::update_one(
            "Post",
            FilterNode::eq("id", created.id.as_str()),
            Update::new().set("title", "Second Draft"),
        ))
        .await
        .unwrap()
        .into_object()
        .unwrap();
    assert_eq!(updated.attributes["slug"], Value::from("second-draft"));
    assert_eq!(updated.version, created.version + 1);
    assert_eq!(after_saves.load(Ordering::SeqCst), 2);

    let rejected = engine
        .execute(Request::insert("Post", NewObject::new().with("title", "forbidden")))
        .await;
    assert!(matches!(rejected, Err(Error::Trigger(_))));
    assert_eq!(
        engine.execute(Request::count("Post")).await.unwrap().count(),
        Some(1)
    );
}

#[tokio::test]
async fn test_optimistic_version_updates() {
    let ctx = TestContext::new(vec![ClassDef::new("Stock").with_field("qty", PrimitiveType::Number)]);
    let row = ctx.insert("Stock", NewObject::new().with("qty", 0)).await;

    let stale = ctx
        .engine
        .execute(
            Request::update_one("Stock", FilterNode::eq("id", row.id.as_str()), Update::new().inc("qty", 1))
                .with_expected_version(row.version + 7),
        )
        .await;
    assert!(matches!(
        stale,
        Err(Error::Conflict(ConflictError::VersionMismatch { .. }))
    ));

    let writers = (0..4).map(|_| {
        let engine = ctx.engine.clone();
        let id = row.id.clone();
        async move {
            loop {
                let current = engine
                    .execute(Request::find("Stock").with_filter(FilterNode::eq("id", id.as_str())))
                    .await
                    .unwrap()
                    .into_objects()
                    .remove(0);
                tokio::task::yield_now().await;
                let attempt = engine
                    .execute(
                        Request::update_one("Stock", FilterNode::eq("id", id.as_str()), Update::new().inc("qty", 1))
                            .with_expected_version(current.version),
                    )
                    .await;
                match attempt {
                    Ok(Response::Object(Some(_))) => break,
                    Ok(_) | Err(Error::Conflict(_)) => continue,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }
    });
    join_all(writers).await;

    let rows = ctx.find_as("u1", Request::find("Stock")).await;
    assert_eq!(rows[0].attributes["qty"], Value::from(4));
}

/// Bumps the row being updated straight through the backend, once.
struct InterleavedWriter {
    backend: Arc<MemoryBackend>,
    fired: AtomicBool,
}

#[async_trait]
impl Trigger for InterleavedWriter {
    async fn call(&self, ctx: &mut TriggerContext) -> acldb_core::Result<()> {
        let Some(original) = ctx.original.as_ref() else {
            return Ok(());
        };
        if self.fired.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let query = CompiledQuery::new(&ctx.class_name)
            .with_filter(CompiledFilter::IdIn(BTreeSet::from([original.id.clone()])));
        self.backend
            .find_one_and_update(&query, &Update::new().inc("qty", 100))
            .await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_version_moving_after_check_is_a_conflict() {
    let backend = Arc::new(MemoryBackend::new());
    let schema = Schema::new([ClassDef::new("Stock").with_field("qty", PrimitiveType::Number)]).unwrap();
    let engine = Engine::builder(schema)
        .with_backend(backend.clone())
        .with_trigger(
            "Stock",
            TriggerEvent::BeforeSave,
            Arc::new(InterleavedWriter {
                backend: backend.clone(),
                fired: AtomicBool::new(false),
            }),
        )
        .build();
    let row = engine
        .execute(Request::insert("Stock", NewObject::new().with("qty", 0)))
        .await
        .unwrap()
        .into_object()
        .unwrap();

    let update = |version: u64| {
        Request::update_one("Stock", FilterNode::eq("id", row.id.as_str()), Update::new().inc("qty", 1))
            .with_expected_version(version)
    };
    let moved = engine.execute(update(row.version)).await;
    match moved {
        Err(Error::Conflict(ConflictError::VersionMismatch { expected, actual, .. })) => {
            assert_eq!(expected, row.version);
            assert_eq!(actual, row.version + 1);
        }
        other => panic!("expected a version conflict, got {other:?}"),
    }
    assert!(engine.execute(update(row.version)).await.unwrap_err().is_retryable());

    let retried = engine
        .execute(update(row.version + 1))
        .await
        .unwrap()
        .into_object()
        .unwrap();
    assert_eq!(retried.attributes["qty"], Value::from(101));
    assert_eq!(retried.version, row.version + 2);
}

#[tokio::test]
async fn test_upserts() {
    let ctx = TestContext::new(vec![ClassDef::new("Tally")
        .with_field("key", PrimitiveType::String)
        .with_field("hits", PrimitiveType::Number)]);
    let upsert = || {
        Request::new(Operation::UpsertOne, "Tally")
            .with_filter(FilterNode::eq("key", "home"))
            .with_set_on_insert(BTreeMap::from([("key".to_string(), Value::from("home"))]))
            .with_update(Update::new().inc("hits", 1))
    };

    let first = ctx.engine.execute(upsert()).await.unwrap().into_object().unwrap();
    assert_eq!(first.attributes["hits"], Value::from(1));
    let second = ctx.engine.execute(upsert()).await.unwrap().into_object().unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.attributes["hits"], Value::from(2));

    let many = ctx
        .engine
        .execute(
            Request::new(Operation::UpsertMany, "Tally")
                .with_filter(FilterNode::eq("key", "about"))
                .with_set_on_insert(BTreeMap::from([("key".to_string(), Value::from("about"))]))
                .with_update(Update::new().set("hits", 10)),
        )
        .await
        .unwrap();
    assert_eq!(many, Response::Affected(1));
    assert_eq!(ctx.engine.execute(Request::count("Tally")).await.unwrap().count(), Some(2));
}

#[tokio::test]
async fn test_large_files_are_offloaded() {
    let ctx = TestContext::with_config(
        vec![ClassDef::new("Upload").with_field("file", PrimitiveType::File)],
        EngineConfig::new().with_inline_file_threshold(4),
    );
    let stored = ctx
        .insert(
            "Upload",
            NewObject::new().with("file", Value::File(FileRef::inline("report.txt", b"quarterly".to_vec()))),
        )
        .await;
    let Some(Value::File(file)) = stored.attributes.get("file") else {
        panic!("file attribute missing");
    };
    assert!(file.data.is_none());
    let token = file.token.clone().unwrap();
    assert_eq!(ctx.engine.file_store().file_data(&token).await.unwrap(), b"quarterly".to_vec());

    let small = ctx
        .insert(
            "Upload",
            NewObject::new().with("file", Value::File(FileRef::inline("a.txt", b"ok".to_vec()))),
        )
        .await;
    let Some(Value::File(file)) = small.attributes.get("file") else {
        panic!("file attribute missing");
    };
    assert_eq!(file.data.as_deref(), Some(&b"ok"[..]));
}

#[tokio::test]
async fn test_random_explain_and_nonrefs() {
    let ctx = TestContext::new(vec![
        ClassDef::new("Owner").with_field("name", PrimitiveType::String),
        ClassDef::new("Pet")
            .with_field("name", PrimitiveType::String)
            .with_field("owner", FieldType::pointer("Owner")),
    ]);
    let owner = ctx.insert("Owner", NewObject::new().with("name", "Sam")).await;
    let mut pets = Vec::new();
    for name in ["Rex", "Tom", "Kit"] {
        pets.push(
            ctx.insert("Pet", NewObject::new().with("name", name).with("owner", owner.pointer()))
                .await,
        );
    }
    let stray = ctx
        .insert("Pet", NewObject::new().with("name", "Lost").with("owner", pointer("Owner", "gone")))
        .await;

    let picked = ctx
        .find_as("u1", Request::new(Operation::Random, "Pet").with_limit(2))
        .await;
    assert_eq!(ids(&picked).len(), 2);

    let explained = ctx
        .engine
        .execute(Request::new(Operation::Explain, "Pet").with_filter(FilterNode::eq("owner.name", "Sam")))
        .await
        .unwrap();
    let Response::Explain(plan) = explained else {
        panic!("expected an explain response");
    };
    assert_eq!(plan["query"]["className"], serde_json::json!("Pet"));

    let through_pointer = ctx
        .find_as("u1", Request::find("Pet").with_filter(FilterNode::eq("owner.name", "Sam")))
        .await;
    assert_eq!(ids(&through_pointer), ids(&pets));

    let nonrefs = ctx
        .engine
        .execute(Request::new(Operation::Nonrefs, "Pet").as_master(MASTER))
        .await
        .unwrap();
    assert_eq!(
        nonrefs,
        Response::Nonrefs(BTreeMap::from([("owner".to_string(), vec![stray.id.clone()])]))
    );
}

#[tokio::test]
async fn test_includes_and_keys() {
    let ctx = TestContext::new(vec![
        ClassDef::new("Team").with_field("name", PrimitiveType::String),
        ClassDef::new("Player")
            .with_field("name", PrimitiveType::String)
            .with_field("number", PrimitiveType::Number)
            .with_field("team", FieldType::pointer("Team")),
    ]);
    let team = ctx.insert("Team", NewObject::new().with("name", "Reds")).await;
    ctx.insert(
        "Player",
        NewObject::new()
            .with("name", "Lee")
            .with("number", 9)
            .with("team", team.pointer()),
    )
    .await;

    let rows = ctx
        .find_as(
            "u1",
            Request::find("Player").with_keys(["name"]).with_include("team"),
        )
        .await;
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].attributes.contains_key("number"));
    assert_eq!(rows[0].value_at("team.name").map(|v| v.into_owned()), Some(Value::from("Reds")));
}
