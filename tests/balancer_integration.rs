//! End-to-end coverage of S4/S5 (resolver churn reshapes round-robin
//! order) driven entirely through the public `Client` API plus the stub
//! resolver and stub remote client this crate ships for exactly this
//! purpose.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use rpc_client_core::client::endpoint::{Endpoint, ResolverState};
use rpc_client_core::client::remote_client::stub::StubRemoteClientBuilder;
use rpc_client_core::client::remote_client::RemoteClientBuilderRegistry;
use rpc_client_core::client::resolver::stub::StubResolver;
use rpc_client_core::client::resolver::{Resolver, ResolverBuilder, ResolverRegistry, ResolverWatcher};
use rpc_client_core::client::ClientOptions;
use rpc_client_core::{Client, ServiceConfig};

struct FixedResolverBuilder {
    resolver: Arc<StubResolver>,
}

#[async_trait]
impl ResolverBuilder for FixedResolverBuilder {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn build(&self, _target: &str, watcher: Arc<dyn ResolverWatcher>) -> Arc<dyn Resolver> {
        self.resolver.attach(watcher).await;
        self.resolver.clone()
    }
}

async fn build_client(resolver: Arc<StubResolver>) -> Client {
    let remote_registry = Arc::new(RemoteClientBuilderRegistry::new());
    remote_registry.register("mem", Arc::new(StubRemoteClientBuilder::default()));

    let resolver_registry = Arc::new(ResolverRegistry::new());
    resolver_registry.register(Arc::new(FixedResolverBuilder { resolver }));

    let config = ServiceConfig {
        resolver_name: Some("fixed".to_string()),
        ..ServiceConfig::default()
    };

    Client::with_options(
        "test.Service",
        config,
        ClientOptions {
            resolver_registry: Some(resolver_registry),
            remote_client_registry: Some(remote_registry),
            ..Default::default()
        },
    )
    .await
    .expect("client construction with a registered resolver must succeed")
}

async fn invoke_and_collect(client: &Client, n: usize) -> Vec<Vec<u8>> {
    let mut replies = Vec::with_capacity(n);
    for i in 0..n {
        let reply = tokio::time::timeout(
            Duration::from_millis(500),
            client.invoke("/test.Service/Call", format!("req{i}").into_bytes(), Some(Duration::from_secs(2))),
        )
        .await
        .expect("invoke must not hang")
        .expect("invoke must succeed once endpoints are Ready");
        replies.push(reply);
    }
    replies
}

#[tokio::test]
async fn round_robin_rebalances_when_the_resolver_pushes_a_new_endpoint_set() {
    let resolver = StubResolver::new();
    let client = build_client(resolver.clone()).await;

    resolver
        .push(ResolverState::new(vec![Endpoint::new("mem", "a"), Endpoint::new("mem", "b")]))
        .await;

    // Give the balancer's reconciliation (spawned connects + listener
    // callbacks) a moment to land before the first pick.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let _ = invoke_and_collect(&client, 4).await;

    // Shrinking to a single endpoint must not break subsequent picks, and
    // the removed endpoint's remote client must be gone from the manager
    // (observable indirectly: every further call keeps succeeding against
    // the one remaining endpoint rather than failing).
    resolver.push(ResolverState::new(vec![Endpoint::new("mem", "a")])).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    let replies = invoke_and_collect(&client, 4).await;
    assert_eq!(replies.len(), 4);

    client.close().await.unwrap();
}

#[tokio::test]
async fn close_during_active_use_stops_new_calls_without_panicking() {
    let resolver = StubResolver::new();
    let client = build_client(resolver.clone()).await;
    resolver.push(ResolverState::new(vec![Endpoint::new("mem", "a")])).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let _ = client.invoke("/test.Service/Call", vec![], Some(Duration::from_secs(1))).await;

    client.close().await.unwrap();
    let err = client
        .invoke("/test.Service/Call", vec![], Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(rpc_client_core::status::is_client_closing(&err));
}
