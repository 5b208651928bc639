//! End-to-end tests of factory-built registry stacks sharing one in-memory
//! coordination store: a server process registers, a client process
//! subscribes, and routing commands, outages and session loss are driven
//! through the store.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use registry_coord::paths::{self, NodeType};
use registry_coord::{CoordinationClient, MemoryConnector, NodeMode, RegistryFactory};
use registry_core::url::params;
use registry_core::{LocalSwitcherService, NotifyListener, Registry, Url};

const WEIGHTED: &str =
    r#"{"clientCommandList":[{"index":1,"pattern":"/v1/*","mergeGroups":["g1:70","g2:30"]}]}"#;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

fn factory(connector: &Arc<MemoryConnector>) -> RegistryFactory {
    RegistryFactory::new(Arc::new(LocalSwitcherService::new()))
        .with_connector("memory", connector.clone())
}

fn server(host: &str, group: &str) -> Url {
    Url::new("rpc", host, 8000, "/v1/orders").with_group(group)
}

fn channel_listener() -> (Arc<dyn NotifyListener>, mpsc::UnboundedReceiver<Vec<Url>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener: Arc<dyn NotifyListener> = Arc::new(move |_: &Url, urls: Vec<Url>| {
        let _ = tx.send(urls);
    });
    (listener, rx)
}

/// Next notification satisfying `accept`, skipping intermediate ones
async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<Vec<Url>>,
    accept: impl Fn(&[Url]) -> bool,
) -> anyhow::Result<Vec<Url>> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let urls = tokio::time::timeout_at(deadline, rx.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("listener channel closed"))?;
        if accept(&urls) {
            return Ok(urls);
        }
    }
}

async fn wait_until(check: impl Fn() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

fn hosts(urls: &[Url]) -> Vec<&str> {
    urls.iter().map(|u| u.host()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscriber_follows_availability() -> anyhow::Result<()> {
    init_tracing();
    let connector = Arc::new(MemoryConnector::new());
    let registry_url = Url::parse("memory://registry:2181")?;
    let (server_factory, client_factory) = (factory(&connector), factory(&connector));
    let server_side = server_factory.get_registry(&registry_url).await?;
    let client_side = client_factory.get_registry(&registry_url).await?;

    let (listener, mut rx) = channel_listener();
    let subscription = server("10.0.0.99", "g1").with_host_port("10.0.0.99", 0);
    client_side.subscribe(&subscription, listener.clone()).await?;

    let endpoint = server("10.0.0.1", "g1");
    server_side.register(&endpoint).await?;
    server_side.available(Some(&endpoint)).await?;
    let urls = wait_for(&mut rx, |urls| !urls.is_empty()).await?;
    assert_eq!(urls, vec![endpoint.clone()]);
    assert_eq!(client_side.discover(&subscription).await?, vec![endpoint.clone()]);

    server_side.unavailable(Some(&endpoint)).await?;
    wait_for(&mut rx, |urls| urls.is_empty()).await?;

    client_side.unsubscribe(&subscription, &listener).await?;
    let store = connector.store(&registry_url);
    assert!(!store.contains(&paths::node_path(&subscription, NodeType::Client)));

    server_factory.shutdown().await;
    client_factory.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_weighted_command_merges_groups() -> anyhow::Result<()> {
    init_tracing();
    let connector = Arc::new(MemoryConnector::new());
    let registry_url = Url::parse("memory://registry:2181")?;
    let (server_factory, client_factory) = (factory(&connector), factory(&connector));
    let server_side = server_factory.get_registry(&registry_url).await?;
    let client_side = client_factory.get_registry(&registry_url).await?;

    for endpoint in [server("10.1.0.1", "g1"), server("10.2.0.1", "g2")] {
        server_side.register(&endpoint).await?;
        server_side.available(Some(&endpoint)).await?;
    }

    let (listener, mut rx) = channel_listener();
    let subscription = server("10.0.0.99", "g1").with_host_port("10.0.0.99", 0);
    client_side.subscribe(&subscription, listener).await?;
    let urls = wait_for(&mut rx, |urls| !urls.is_empty()).await?;
    assert_eq!(hosts(&urls), vec!["10.1.0.1"]);

    let operator = connector.store(&registry_url).connect();
    let command_path = paths::command_path(&subscription);
    operator.create(&command_path, WEIGHTED, NodeMode::Persistent).await?;

    let urls = wait_for(&mut rx, |urls| urls.first().is_some_and(|u| u.protocol() == "rule")).await?;
    assert_eq!(urls[0].parameter(params::WEIGHTS), Some("g1:70,g2:30"));
    assert_eq!(hosts(&urls[1..]), vec!["10.1.0.1", "10.2.0.1"]);

    // a new g2 endpoint reaches the merged view
    let late = server("10.2.0.2", "g2");
    server_side.register(&late).await?;
    server_side.available(Some(&late)).await?;
    let urls = wait_for(&mut rx, |urls| urls.len() == 4).await?;
    assert_eq!(hosts(&urls[1..]), vec!["10.1.0.1", "10.2.0.1", "10.2.0.2"]);

    operator.delete(&command_path).await?;
    let urls = wait_for(&mut rx, |urls| urls.len() == 1).await?;
    assert_eq!(hosts(&urls), vec!["10.1.0.1"]);

    server_factory.shutdown().await;
    client_factory.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_register_is_retried() -> anyhow::Result<()> {
    init_tracing();
    let connector = Arc::new(MemoryConnector::new());
    let registry_url = Url::parse("memory://retry:2181?registryRetryPeriod=50&check=false")?;
    let factory = factory(&connector);
    let registry = factory.get_registry(&registry_url).await?;

    let session = connector
        .sessions(&registry_url)
        .pop()
        .ok_or_else(|| anyhow::anyhow!("no session opened"))?;
    session.set_available(false);

    let endpoint = server("10.0.0.1", "g1");
    registry.register(&endpoint).await?;
    let store = connector.store(&registry_url);
    let node = paths::node_path(&endpoint, NodeType::Unavailable);
    assert!(!store.contains(&node));

    session.set_available(true);
    wait_until(|| store.contains(&node) && registry.registered_service_urls() == vec![endpoint.clone()])
        .await?;

    factory.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_expiry_restores_nodes() -> anyhow::Result<()> {
    init_tracing();
    let connector = Arc::new(MemoryConnector::new());
    let registry_url = Url::parse("memory://registry:2181")?;
    let factory = factory(&connector);
    let registry = factory.get_registry(&registry_url).await?;

    let up = server("10.0.0.1", "g1");
    let down = server("10.0.0.2", "g1");
    for endpoint in [&up, &down] {
        registry.register(endpoint).await?;
    }
    registry.available(Some(&up)).await?;

    let session = connector
        .sessions(&registry_url)
        .pop()
        .ok_or_else(|| anyhow::anyhow!("no session opened"))?;
    session.expire();

    let store = connector.store(&registry_url);
    wait_until(|| {
        store.contains(&paths::node_path(&up, NodeType::Available))
            && store.contains(&paths::node_path(&down, NodeType::Unavailable))
    })
    .await?;
    assert!(!store.contains(&paths::node_path(&up, NodeType::Unavailable)));

    factory.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unregister_removes_endpoint_and_is_idempotent() -> anyhow::Result<()> {
    init_tracing();
    let connector = Arc::new(MemoryConnector::new());
    let registry_url = Url::parse("memory://registry:2181")?;
    let (server_factory, client_factory) = (factory(&connector), factory(&connector));
    let server_side = server_factory.get_registry(&registry_url).await?;
    let client_side = client_factory.get_registry(&registry_url).await?;

    let endpoint = server("10.0.0.1", "g1");
    server_side.register(&endpoint).await?;
    server_side.available(Some(&endpoint)).await?;

    let (listener, mut rx) = channel_listener();
    let subscription = server("10.0.0.99", "g1").with_host_port("10.0.0.99", 0);
    client_side.subscribe(&subscription, listener).await?;
    wait_for(&mut rx, |urls| urls.contains(&endpoint)).await?;

    server_side.unregister(&endpoint).await?;
    wait_for(&mut rx, |urls| !urls.contains(&endpoint)).await?;
    assert!(!client_side.discover(&subscription).await?.contains(&endpoint));
    assert!(server_side.registered_service_urls().is_empty());

    server_side.unregister(&endpoint).await?;
    let store = connector.store(&registry_url);
    assert!(!store.contains(&paths::node_path(&endpoint, NodeType::Available)));
    assert!(!store.contains(&paths::node_path(&endpoint, NodeType::Unavailable)));

    server_factory.shutdown().await;
    client_factory.shutdown().await;
    Ok(())
}
