use jcrdav_core::memory::DEFAULT_WORKSPACE;
use jcrdav_core::query::qom::{Constraint, DynamicOperand, Operator, Source, StaticOperand};
use jcrdav_core::transport::RawColumn;
use jcrdav_core::{
    Credentials, ErrorKind, InMemoryTransport, Query, QueryLanguage, QueryObjectModel, Session, SessionOptions,
    SessionRegistry, Value,
};
use serde_json::json;

async fn setup() -> (InMemoryTransport, Session) {
    let transport = InMemoryTransport::new();
    let registry = SessionRegistry::new();
    let session = Session::login(
        Box::new(transport.clone()),
        &Credentials::new("admin", "admin"),
        DEFAULT_WORKSPACE,
        SessionOptions::default(),
        &registry,
    )
    .await
    .unwrap();
    (transport, session)
}

fn row(path: &str, title: &str) -> Vec<RawColumn> {
    vec![
        RawColumn::new("s.jcr:primaryType", None, Some("nt:unstructured")),
        RawColumn::new("s.title", None, Some(title)),
        RawColumn::new("s.jcr:path", None, Some(path)),
        RawColumn::new("s.jcr:score", None, Some("0.5")),
    ]
}

#[tokio::test]
async fn test_execute_returns_rows() {
    let (transport, mut session) = setup().await;
    transport.seed_default("/docs/a", json!({"title": "Alpha"})).await.unwrap();
    transport
        .set_query_rows(vec![row("/docs/a", "Alpha"), row("/docs/b", "Beta")])
        .await;

    let query = Query::new("SELECT * FROM [nt:unstructured] AS s", QueryLanguage::JcrSql2);
    let result = session.execute(&query).await.unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result.selector_names(), vec!["s"]);
    assert_eq!(result.column_names(), vec!["s.jcr:primaryType", "s.title"]);
    assert_eq!(result.node_paths(None), vec!["/docs/a", "/docs/b"]);

    let mut rows = result.rows();
    let first = rows.next().unwrap();
    assert_eq!(first.value("title").unwrap().as_deref(), Some("Alpha"));
    assert_eq!(first.score(Some("s")).unwrap(), 0.5);

    let node = first.node(&mut session, None).await.unwrap();
    assert_eq!(node.property("title").unwrap().string().unwrap(), "Alpha");

    let second = rows.next().unwrap();
    let err = second.node(&mut session, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_bound_variables_reach_the_server() {
    let (transport, mut session) = setup().await;

    let mut query = Query::new(
        "SELECT * FROM [nt:base] WHERE [title] = $title AND [n] > $n",
        QueryLanguage::JcrSql2,
    );
    assert_eq!(query.bind_variable_names(), vec!["title", "n"]);
    query.bind_value("title", Value::from("it's")).unwrap();
    assert!(session.execute(&query).await.is_err());

    query.bind_value("n", Value::Long(3)).unwrap();
    assert!(query.bind_value("other", Value::Long(1)).is_err());
    session.execute(&query).await.unwrap();

    let sent = transport.last_query().await.unwrap();
    assert_eq!(
        sent.statement(),
        "SELECT * FROM [nt:base] WHERE [title] = 'it''s' AND [n] > 3"
    );
}

#[tokio::test]
async fn test_limit_and_offset() {
    let (transport, mut session) = setup().await;
    let rows = (0..5).map(|i| row(&format!("/n{}", i), "t")).collect();
    transport.set_query_rows(rows).await;

    let mut query = Query::new("//element(*, nt:base)", QueryLanguage::XPath);
    query.set_offset(1);
    query.set_limit(2);
    let result = session.execute(&query).await.unwrap();
    assert_eq!(result.node_paths(Some("s")), vec!["/n1", "/n2"]);

    let sent = transport.last_query().await.unwrap();
    assert_eq!(sent.language(), QueryLanguage::XPath);
    assert_eq!(sent.limit(), Some(2));
    assert_eq!(sent.offset(), Some(1));

    let mut xpath = Query::new("//*[@title = $t]", QueryLanguage::XPath);
    let err = xpath.bind_value("t", Value::from("x")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
}

#[tokio::test]
async fn test_execute_object_model() {
    let (transport, mut session) = setup().await;

    let qom = QueryObjectModel::new(Source::selector("nt:file", Some("f"))).with_constraint(
        Constraint::compare(
            DynamicOperand::NodeName(Some("f".to_string())),
            Operator::Like,
            StaticOperand::Literal(Value::from("%.txt")),
        ),
    );
    let result = session.execute_qom(&qom).await.unwrap();
    assert!(result.is_empty());
    assert!(result.column_names().is_empty());

    let sent = transport.last_query().await.unwrap();
    assert_eq!(sent.language(), QueryLanguage::JcrSql2);
    assert_eq!(sent.statement(), qom.statement());
    assert!(sent.statement().starts_with("SELECT * FROM [nt:file] AS [f] WHERE NAME([f]) LIKE"));
}
