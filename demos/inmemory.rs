//! Drives a [`rpc_client_core::Client`] end to end against the in-memory
//! stub remote client, with no resolver, no real transport, and a static
//! two-endpoint configuration: `Client::new`, a couple of `invoke` calls
//! round-robining across both endpoints, then `close`.

use std::sync::Arc;

use rpc_client_core::client::endpoint::Endpoint;
use rpc_client_core::client::remote_client::stub::StubRemoteClientBuilder;
use rpc_client_core::client::remote_client::RemoteClientBuilderRegistry;
use rpc_client_core::client::ClientOptions;
use rpc_client_core::{Client, ServiceConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let registry = Arc::new(RemoteClientBuilderRegistry::new());
    registry.register("mem", Arc::new(StubRemoteClientBuilder::default()));

    let config = ServiceConfig {
        static_endpoints: vec![Endpoint::new("mem", "a"), Endpoint::new("mem", "b")],
        ..ServiceConfig::default()
    };

    let client = Client::with_options(
        "demo.Greeter",
        config,
        ClientOptions {
            remote_client_registry: Some(registry),
            ..Default::default()
        },
    )
    .await
    .expect("client construction should never fail with a static endpoint list");

    for i in 0..4 {
        let reply = client
            .invoke("/demo.Greeter/SayHello", format!("hello #{i}").into_bytes(), None)
            .await
            .expect("invoke should succeed against the in-memory stub");
        println!("reply {i}: {} bytes", reply.len());
    }

    client.close().await.expect("first close should succeed");
}
