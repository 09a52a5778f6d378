//! Session integration tests over the in-memory transport

use jcrdav_core::memory::DEFAULT_WORKSPACE;
use jcrdav_core::{
    Capabilities, Credentials, ErrorKind, InMemoryTransport, ItemState, PropertySnapshot, PropertyType, Session,
    SessionOptions, SessionRegistry, Value, WriteOp,
};
use serde_json::json;

async fn login(transport: &InMemoryTransport, registry: &SessionRegistry) -> Session {
    Session::login(
        Box::new(transport.clone()),
        &Credentials::new("admin", "admin"),
        DEFAULT_WORKSPACE,
        SessionOptions::default(),
        registry,
    )
    .await
    .unwrap()
}

async fn setup() -> (InMemoryTransport, Session) {
    let transport = InMemoryTransport::new();
    let registry = SessionRegistry::new();
    let session = login(&transport, &registry).await;
    (transport, session)
}

#[tokio::test]
async fn test_get_node_reads_primary_type() {
    let (transport, mut session) = setup().await;
    transport
        .seed_default("/a/b", json!({"jcr:primaryType": "nt:unstructured"}))
        .await
        .unwrap();

    let node = session.node("/a/b").await.unwrap();
    assert_eq!(node.primary_type(), "nt:unstructured");
    assert!(node.child_names().is_empty());
    assert_eq!(node.state(), ItemState::Clean);
}

#[tokio::test]
async fn test_repeated_lookups_return_same_instance() {
    let (transport, mut session) = setup().await;
    transport.seed_default("/a", json!({"title": "A"})).await.unwrap();

    let first = session.node("/a").await.unwrap().instance_id();
    let reads = transport.stats().await.reads;
    let second = session.node("/a/./").await.unwrap().instance_id();
    assert_eq!(first, second);
    assert_eq!(transport.stats().await.reads, reads);

    let missing = session.node("/nope").await.unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_set_property_and_save_sends_one_diff_entry() {
    let (transport, mut session) = setup().await;
    transport.seed_default("/a", json!({})).await.unwrap();

    session.set_property("/a", "x", "hello").await.unwrap();
    assert!(session.has_pending_changes().unwrap());
    session.save().await.unwrap();

    assert_eq!(
        transport.last_batch().await,
        vec![WriteOp::SetProperty {
            path: "/a/x".to_string(),
            property: PropertySnapshot::single("x", Value::String("hello".to_string())),
        }]
    );
    let prop = session.property("/a/x").await.unwrap();
    assert_eq!(prop.state(), ItemState::Clean);
    assert_eq!(session.node("/a").await.unwrap().state(), ItemState::Clean);
    assert!(!session.has_pending_changes().unwrap());
}

#[tokio::test]
async fn test_readback_before_save_needs_no_request() {
    let (transport, mut session) = setup().await;
    transport.seed_default("/a", json!({})).await.unwrap();

    session.set_property("/a", "x", "hello").await.unwrap();
    let requests = transport.stats().await.requests;

    let prop = session.property("/a/x").await.unwrap();
    assert_eq!(prop.string().unwrap(), "hello");
    assert_eq!(prop.state(), ItemState::New);
    assert_eq!(session.node("/a").await.unwrap().state(), ItemState::Modified);
    assert_eq!(transport.stats().await.requests, requests);
}

#[tokio::test]
async fn test_new_nodes_become_clean_after_save() {
    let (transport, mut session) = setup().await;
    transport.seed_default("/a", json!({})).await.unwrap();

    let node = session.add_node("/a", "c", None).await.unwrap();
    assert!(node.is_new());
    session.add_node("/a/c", "d", Some("nt:folder")).await.unwrap();
    session.set_property("/a/c", "title", "C").await.unwrap();
    session.save().await.unwrap();

    let batch = transport.last_batch().await;
    assert_eq!(batch.len(), 2);
    assert!(matches!(&batch[0], WriteOp::AddNode { path, properties } if path == "/a/c" && properties.len() == 2));
    assert!(matches!(&batch[1], WriteOp::AddNode { path, .. } if path == "/a/c/d"));

    let reads = transport.stats().await.reads;
    let node = session.node("/a/c").await.unwrap();
    assert_eq!(node.state(), ItemState::Clean);
    assert_eq!(node.property("title").unwrap().string().unwrap(), "C");
    assert_eq!(session.node("/a/c/d").await.unwrap().primary_type(), "nt:folder");
    assert_eq!(transport.stats().await.reads, reads);
    assert_eq!(transport.stored_children("/a").await.unwrap(), vec!["c"]);
}

#[tokio::test]
async fn test_empty_save_issues_no_request() {
    let (transport, mut session) = setup().await;
    let requests = transport.stats().await.requests;
    session.save().await.unwrap();
    assert_eq!(transport.stats().await.requests, requests);
    assert_eq!(transport.stats().await.saves, 0);
}

#[tokio::test]
async fn test_add_existing_child_fails() {
    let (transport, mut session) = setup().await;
    transport.seed_default("/a", json!({"b": {}, "p": "v"})).await.unwrap();

    let err = session.add_node("/a", "b", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Exists);
    let err = session.add_node("/a", "p", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Exists);
}

#[tokio::test]
async fn test_protected_and_multi_value_rules() {
    let (transport, mut session) = setup().await;
    transport
        .seed_default("/a", json!({"tags": ["x", "y"], "n": 1}))
        .await
        .unwrap();

    let err = session.set_property("/a", "jcr:primaryType", "nt:folder").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    let err = session.set_property("/a", "tags", "single").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);

    let prop = session
        .set_property_values("/a", "tags", vec![Value::from("z")], None)
        .await
        .unwrap();
    assert_eq!(prop.strings().unwrap(), vec!["z"]);
    assert!(prop.is_modified());

    let prop = session
        .set_property_typed("/a", "n", Value::from("42"), PropertyType::Long)
        .await
        .unwrap();
    assert_eq!(prop.long().unwrap(), 42);
}

#[tokio::test]
async fn test_unchanged_value_does_not_dirty() {
    let (transport, mut session) = setup().await;
    transport.seed_default("/a", json!({"title": "same"})).await.unwrap();

    session.set_property("/a", "title", "same").await.unwrap();
    assert!(!session.has_pending_changes().unwrap());
}

#[tokio::test]
async fn test_failed_save_can_be_retried() {
    let (transport, mut session) = setup().await;
    transport.seed_default("/a", json!({})).await.unwrap();
    transport.fail_next_save("boom").await;

    session.add_node("/a", "n", None).await.unwrap();
    session.set_property("/a", "x", "1").await.unwrap();
    let err = session.save().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);

    assert!(session.has_pending_changes().unwrap());
    assert!(session.node("/a/n").await.unwrap().is_new());
    assert!(transport.stored_property("/a/x").await.is_none());

    session.save().await.unwrap();
    assert_eq!(transport.last_batch().await.len(), 2);
    assert_eq!(
        transport.stored_property("/a/x").await.unwrap().values,
        vec![Value::from("1")]
    );
    assert!(transport.stored_node_exists(DEFAULT_WORKSPACE, "/a/n").await);
}

#[tokio::test]
async fn test_remove_items() {
    let (transport, mut session) = setup().await;
    transport
        .seed_default("/a", json!({"title": "T", "b": {"c": {}}, "d": {}}))
        .await
        .unwrap();

    session.remove_item("/a/title").await.unwrap();
    session.remove_item("/a/b").await.unwrap();
    assert!(!session.item_exists("/a/title").await.unwrap());
    assert!(!session.node_exists("/a/b/c").await.unwrap());
    assert_eq!(session.node("/a").await.unwrap().child_names(), ["d"]);

    let err = session.remove_item("/").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    let err = session.remove_item("/a/jcr:primaryType").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    session.save().await.unwrap();
    assert_eq!(
        transport.last_batch().await,
        vec![
            WriteOp::RemoveNode { path: "/a/b".into() },
            WriteOp::RemoveProperty { path: "/a/title".into() },
        ]
    );
    assert!(!transport.stored_node_exists(DEFAULT_WORKSPACE, "/a/b").await);
}

#[tokio::test]
async fn test_move_and_reorder() {
    let (transport, mut session) = setup().await;
    transport
        .seed_default("/p", json!({"x": {}, "y": {}, "z": {}}))
        .await
        .unwrap();
    transport.seed_default("/q", json!({})).await.unwrap();

    session.order_before("/p", "z", Some("x")).await.unwrap();
    assert_eq!(session.node("/p").await.unwrap().child_names(), ["z", "x", "y"]);

    session.move_item("/p/y", "/q/y").await.unwrap();
    assert!(session.node("/q/y").await.is_ok());
    let err = session.node("/p/y").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = session.move_item("/p/x", "/q/y").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Exists);

    session.save().await.unwrap();
    let batch = transport.last_batch().await;
    assert_eq!(
        batch[0],
        WriteOp::Move {
            src: "/p/y".into(),
            dst: "/q/y".into()
        }
    );
    assert_eq!(
        batch[1],
        WriteOp::Reorder {
            parent: "/p".into(),
            child: "z".into(),
            before: Some("x".into())
        }
    );
    assert_eq!(transport.stored_children("/p").await.unwrap(), vec!["z", "x"]);
    assert_eq!(transport.stored_children("/q").await.unwrap(), vec!["y"]);
}

#[tokio::test]
async fn test_removed_child_hidden_from_later_fetched_parent() {
    let (transport, mut session) = setup().await;
    transport
        .seed_default("/a", json!({"x": {"old": "1"}, "z": {}}))
        .await
        .unwrap();

    session.remove_item("/a/x").await.unwrap();
    let reads = transport.stats().await.reads;
    assert_eq!(session.node("/a").await.unwrap().child_names(), ["z"]);
    assert_eq!(transport.stats().await.reads, reads + 1);
    assert!(!session.node_exists("/a/x").await.unwrap());

    let node = session.add_node("/a", "x", None).await.unwrap();
    assert!(node.is_new());
    assert!(!session.property_exists("/a/x/old").await.unwrap());
    assert_eq!(session.node("/a").await.unwrap().child_names(), ["z", "x"]);

    session.save().await.unwrap();
    let batch = transport.last_batch().await;
    assert_eq!(batch[0], WriteOp::RemoveNode { path: "/a/x".into() });
    assert!(matches!(&batch[1], WriteOp::AddNode { path, .. } if path == "/a/x"));
    assert!(transport.stored_property("/a/x/old").await.is_none());
}

#[tokio::test]
async fn test_moved_child_hidden_from_later_fetched_parent() {
    let (transport, mut session) = setup().await;
    transport.seed_default("/p", json!({"y": {"v": "1"}})).await.unwrap();
    transport.seed_default("/q", json!({})).await.unwrap();

    session.move_item("/p/y", "/q/y").await.unwrap();
    assert!(session.node("/p").await.unwrap().child_names().is_empty());
    session.add_node("/p", "y", None).await.unwrap();
    assert!(!session.property_exists("/p/y/v").await.unwrap());

    session.save().await.unwrap();
    let batch = transport.last_batch().await;
    assert_eq!(
        batch[0],
        WriteOp::Move {
            src: "/p/y".into(),
            dst: "/q/y".into()
        }
    );
    assert!(matches!(&batch[1], WriteOp::AddNode { path, .. } if path == "/p/y"));
    assert!(transport.stored_property("/q/y/v").await.is_some());
    assert!(transport.stored_property("/p/y/v").await.is_none());
}

#[tokio::test]
async fn test_move_into_removed_path_saves_in_order() {
    let (transport, mut session) = setup().await;
    transport.seed_default("/x", json!({"old": "1"})).await.unwrap();
    transport.seed_default("/y", json!({"title": "Y"})).await.unwrap();

    session.remove_item("/x").await.unwrap();
    session.move_item("/y", "/x").await.unwrap();
    assert_eq!(session.property("/x/title").await.unwrap().string().unwrap(), "Y");
    assert!(!session.property_exists("/x/old").await.unwrap());
    assert!(!session.node_exists("/y").await.unwrap());

    session.save().await.unwrap();
    assert_eq!(
        transport.last_batch().await,
        vec![
            WriteOp::RemoveNode { path: "/x".into() },
            WriteOp::Move {
                src: "/y".into(),
                dst: "/x".into()
            },
        ]
    );
    assert!(!transport.stored_node_exists(DEFAULT_WORKSPACE, "/y").await);
    assert!(transport.stored_property("/x/title").await.is_some());
    assert!(transport.stored_property("/x/old").await.is_none());
    assert!(!session.has_pending_changes().unwrap());
}

#[tokio::test]
async fn test_remove_of_moved_node_saves_in_order() {
    let (transport, mut session) = setup().await;
    transport.seed_default("/a", json!({})).await.unwrap();
    transport.seed_default("/b", json!({})).await.unwrap();

    session.move_item("/a", "/c").await.unwrap();
    session.remove_item("/c").await.unwrap();
    session.move_item("/b", "/a").await.unwrap();

    session.save().await.unwrap();
    assert_eq!(
        transport.last_batch().await,
        vec![
            WriteOp::Move {
                src: "/a".into(),
                dst: "/c".into()
            },
            WriteOp::RemoveNode { path: "/c".into() },
            WriteOp::Move {
                src: "/b".into(),
                dst: "/a".into()
            },
        ]
    );
    assert!(transport.stored_node_exists(DEFAULT_WORKSPACE, "/a").await);
    assert!(!transport.stored_node_exists(DEFAULT_WORKSPACE, "/b").await);
    assert!(!transport.stored_node_exists(DEFAULT_WORKSPACE, "/c").await);
}

#[tokio::test]
async fn test_new_referenceable_node_gets_uuid() {
    let (transport, mut session) = setup().await;
    transport.seed_default("/a", json!({})).await.unwrap();

    session.add_node("/a", "r", None).await.unwrap();
    session.add_mixin("/a/r", "mix:referenceable").await.unwrap();
    let uuid = session.node("/a/r").await.unwrap().identifier().unwrap().to_string();

    let node = session.node_by_identifier(&uuid).await.unwrap();
    assert_eq!(node.path(), "/a/r");
    assert!(node.has_mixin("mix:referenceable"));

    session.save().await.unwrap();
    let stored = transport.stored_property("/a/r/jcr:uuid").await.unwrap();
    assert_eq!(stored.values, vec![Value::String(uuid)]);
}

#[tokio::test]
async fn test_nodes_batches_uncached_paths() {
    let (transport, mut session) = setup().await;
    for name in ["a", "b", "c"] {
        transport.seed_default(&format!("/{}", name), json!({})).await.unwrap();
    }
    session.node("/a").await.unwrap();

    let paths: Vec<String> = ["/a", "/b", "/c", "/missing"].iter().map(|p| p.to_string()).collect();
    let nodes = session.nodes(&paths).await.unwrap();
    let found: Vec<&str> = nodes.iter().map(|n| n.path()).collect();
    assert_eq!(found, vec!["/a", "/b", "/c"]);
    assert_eq!(transport.stats().await.batch_reads, 1);

    let requests = transport.stats().await.requests;
    session.nodes(&paths[..3]).await.unwrap();
    assert_eq!(transport.stats().await.requests, requests);
}

#[tokio::test]
async fn test_rejected_batch_falls_back_to_single_reads() {
    let (transport, mut session) = setup().await;
    transport.seed_default("/a", json!({})).await.unwrap();
    transport.seed_default("/b", json!({})).await.unwrap();
    transport.reject_batch_reads(true).await;

    let paths = vec!["/a".to_string(), "/b".to_string(), "/gone".to_string()];
    let nodes = session.nodes(&paths).await.unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(transport.stats().await.batch_reads, 0);
    assert_eq!(transport.stats().await.reads, 3);
}

#[tokio::test]
async fn test_refresh_discards_or_keeps_changes() {
    let (transport, mut session) = setup().await;
    transport.seed_default("/a", json!({"title": "one"})).await.unwrap();
    let instance = session.node("/a").await.unwrap().instance_id();

    session.set_property("/a", "title", "local").await.unwrap();
    session.add_node("/a", "fresh", None).await.unwrap();
    transport.seed_default("/a", json!({"title": "two"})).await.unwrap();

    session.refresh(false).await.unwrap();
    let node = session.node("/a").await.unwrap();
    assert_eq!(node.instance_id(), instance);
    assert_eq!(node.property("title").unwrap().string().unwrap(), "two");
    assert!(!node.has_node("fresh"));
    assert!(!session.has_pending_changes().unwrap());

    session.set_property("/a", "x", "mine").await.unwrap();
    transport.seed_default("/a", json!({"title": "three"})).await.unwrap();
    session.refresh(true).await.unwrap();
    let node = session.node("/a").await.unwrap();
    assert_eq!(node.property("title").unwrap().string().unwrap(), "three");
    assert_eq!(node.property("x").unwrap().string().unwrap(), "mine");
    assert!(session.has_pending_changes().unwrap());
}

#[tokio::test]
async fn test_refresh_evicts_nodes_gone_from_server() {
    let transport = InMemoryTransport::new();
    let registry = SessionRegistry::new();
    let mut session = login(&transport, &registry).await;
    let mut other = login(&transport, &registry).await;
    transport.seed_default("/a", json!({"b": {}})).await.unwrap();

    session.node("/a/b").await.unwrap();
    other.remove_item("/a/b").await.unwrap();
    other.save().await.unwrap();

    session.refresh(false).await.unwrap();
    assert!(!session.node_exists("/a/b").await.unwrap());
}

#[tokio::test]
async fn test_locking() {
    let (transport, mut session) = setup().await;
    transport.seed_default("/a", json!({})).await.unwrap();

    let lock = session.lock("/a", false, true, None, None).await.unwrap();
    assert!(lock.token.is_some());
    assert_eq!(lock.owner.as_deref(), Some("admin"));
    assert!(lock.is_live());
    assert!(session.is_locked("/a").await.unwrap());
    assert_eq!(session.lock_tokens().unwrap().len(), 1);
    assert!(session.get_lock("/a").unwrap().owned_by_session);

    session.unlock("/a").await.unwrap();
    assert!(!transport.server_locked("/a").await);
    assert!(!session.get_lock("/a").unwrap().is_live());
    assert!(session.lock_tokens().unwrap().is_empty());
    let err = session.unlock("/a").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Access);

    let err = session.lock("/a", false, false, None, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
}

#[tokio::test]
async fn test_lock_with_huge_timeout_never_expires() {
    let (transport, mut session) = setup().await;
    transport.seed_default("/a", json!({})).await.unwrap();

    let lock = session.lock("/a", false, true, Some(u64::MAX), None).await.unwrap();
    assert!(lock.is_live());
    assert_eq!(lock.seconds_remaining(), None);
    assert!(session.is_locked("/a").await.unwrap());

    session.unlock("/a").await.unwrap();
    assert!(!transport.server_locked("/a").await);
}

#[tokio::test]
async fn test_lock_rules() {
    let (transport, mut session) = setup().await;
    transport
        .seed_default("/a", json!({"jcr:mixinTypes": ["mix:lockable"], "b": {}}))
        .await
        .unwrap();

    session.set_property("/a", "x", "dirty").await.unwrap();
    let err = session.lock("/a", true, true, Some(60), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    session.refresh(false).await.unwrap();

    let lock = session.lock("/a", true, true, Some(60), Some("me")).await.unwrap();
    assert!(lock.seconds_remaining().unwrap() > 0);
    assert!(session.is_locked("/a/b").await.unwrap());

    session.refresh(false).await.unwrap();
    assert!(session.holds_lock("/a").await.unwrap());
    assert!(!session.holds_lock("/a/b").await.unwrap());

    let err = session.lock("/a/b", false, true, None, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Access);
}

#[tokio::test]
async fn test_namespace_registration() {
    let (transport, mut session) = setup().await;

    session.register_namespace("ex", "http://example.com/ns").await.unwrap();
    let requests = transport.stats().await.requests;
    session.register_namespace("ex", "http://example.com/ns").await.unwrap();
    assert_eq!(transport.stats().await.requests, requests);

    let err = session.register_namespace("ex", "http://other.com").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);

    assert_eq!(session.namespace_uri("ex").await.unwrap(), "http://example.com/ns");
    assert_eq!(session.namespace_prefix("http://example.com/ns").await.unwrap(), "ex");
    assert!(session.namespace_prefixes().await.unwrap().contains(&"jcr".to_string()));

    let err = session.unregister_namespace("ex").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    let err = session.register_namespace("xmlfoo", "http://x").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
}

#[tokio::test]
async fn test_node_types() {
    let (transport, mut session) = setup().await;
    transport
        .seed_default("/f", json!({"jcr:primaryType": "nt:folder", "jcr:mixinTypes": ["mix:versionable"]}))
        .await
        .unwrap();

    assert!(session.is_node_type("/f", "nt:folder").await.unwrap());
    assert!(session.is_node_type("/f", "nt:hierarchyNode").await.unwrap());
    assert!(session.is_node_type("/f", "mix:referenceable").await.unwrap());
    assert!(session.is_node_type("/f", "nt:base").await.unwrap());
    assert!(!session.is_node_type("/f", "nt:file").await.unwrap());

    session
        .register_node_types_cnd("[ex:doc] > nt:unstructured orderable", false)
        .await
        .unwrap();
    let info = session.node_type("ex:doc").await.unwrap();
    assert!(info.orderable_child_nodes);
    assert!(session.has_node_type("ex:doc").await.unwrap());
    assert!(!session.has_node_type("ex:missing").await.unwrap());
}

#[tokio::test]
async fn test_permissions() {
    let (transport, mut session) = setup().await;
    transport.set_permissions("/secret", &["read"]).await;

    assert!(session.has_permission("/secret/x", "read").await.unwrap());
    assert!(!session.has_permission("/secret/x", "read, set_property").await.unwrap());
    assert!(session.has_permission("/public", "add_node,remove").await.unwrap());

    let err = session.check_permission("/secret", "remove").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Access);
    assert!(session.has_permission("/", "fly").await.is_err());
}

#[tokio::test]
async fn test_versioning() {
    let (transport, mut session) = setup().await;
    transport
        .seed_default("/v", json!({"jcr:mixinTypes": ["mix:versionable"], "title": "v1"}))
        .await
        .unwrap();

    let version = session.checkin("/v").await.unwrap();
    assert_eq!(version, "/jcr:system/jcr:versionStorage/v/1.0");
    assert!(!session.is_checked_out("/v").await.unwrap());

    session.checkout("/v").await.unwrap();
    assert!(session.is_checked_out("/v").await.unwrap());
    session.set_property("/v", "title", "v2").await.unwrap();
    let err = session.checkin("/v").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    session.save().await.unwrap();

    session.restore(false, &version, "/v").await.unwrap();
    let node = session.node("/v").await.unwrap();
    assert_eq!(node.property("title").unwrap().string().unwrap(), "v1");

    session
        .remove_version("/jcr:system/jcr:versionStorage/v", "1.0")
        .await
        .unwrap();
    let err = session
        .remove_version("/jcr:system/jcr:versionStorage/v", "1.0")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_workspace_operations() {
    let (transport, mut session) = setup().await;
    transport.seed_default("/a", json!({"title": "A", "b": {}})).await.unwrap();
    transport.add_workspace("other").await;
    transport.seed("other", "/x", json!({"title": "X"})).await.unwrap();

    let names = session.accessible_workspace_names().await.unwrap();
    assert_eq!(names, vec!["default", "other"]);

    session.node("/").await.unwrap();
    session.copy("/a", "/a2", None).await.unwrap();
    assert!(session.root_node().await.unwrap().has_node("a2"));
    assert!(session.node_exists("/a2/b").await.unwrap());

    session.copy("/x", "/y", Some("other")).await.unwrap();
    assert_eq!(session.property("/y/title").await.unwrap().string().unwrap(), "X");
    let err = session.copy("/a", "/y", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Exists);

    session.move_immediately("/a2", "/a3").await.unwrap();
    assert!(!session.node_exists("/a2").await.unwrap());
    assert!(session.node_exists("/a3/b").await.unwrap());

    session.create_workspace("third", None).await.unwrap();
    let err = session.create_workspace("fourth", Some("default")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    let err = session.delete_workspace("third").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    let err = session.clone_from("other", "/x", "/z", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
}

#[tokio::test]
async fn test_read_only_transport_rejects_writes() {
    let transport = InMemoryTransport::new().with_capabilities(Capabilities::read_only());
    let registry = SessionRegistry::new();
    let mut session = login(&transport, &registry).await;
    transport.seed_default("/a", json!({})).await.unwrap();

    assert!(session.node("/a").await.is_ok());
    let err = session.add_node("/a", "b", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
    let err = session.lock("/a", false, true, None, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
}

#[tokio::test]
async fn test_logout_is_final_and_idempotent() {
    let transport = InMemoryTransport::new();
    let registry = SessionRegistry::new();
    let mut session = login(&transport, &registry).await;
    transport.seed_default("/a", json!({})).await.unwrap();
    assert_eq!(registry.len(), 1);

    session.lock("/a", false, true, None, None).await.unwrap();
    session.logout().await;
    assert!(!session.is_live());
    assert!(registry.is_empty());
    assert!(!transport.server_locked("/a").await);

    let err = session.node("/a").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    session.logout().await;
}

#[tokio::test]
async fn test_dropping_session_unregisters() {
    let transport = InMemoryTransport::new();
    let registry = SessionRegistry::new();
    let session = login(&transport, &registry).await;
    assert!(registry.contains(session.key()));
    drop(session);
    assert!(registry.is_empty());
}
