//! C5: the Client — the public entry point that wires a resolver, a
//! balancer, and the picker snapshot together, and implements `Invoke` and
//! `NewStream` with cancellation, back-off, and error mapping (§4.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

use crate::config::ServiceConfig;
use crate::status::{client_closing, Status};

use super::balancer::{Balancer, BalancerClient, GLOBAL_BALANCER_REGISTRY};
use super::endpoint::ResolverState;
use super::manager::RemoteClientManager;
use super::picker::{Pick, PickInfo, Picker};
use super::remote_client::{ClientStream, RemoteClientBuilderRegistry};
use super::resolver::{ResolverRegistry, ResolverWatcher};
use super::snapshot::{self, PickerSnapshotStore};

/// Scoped overrides for the process-wide registries, so tests (and
/// multi-tenant hosts) can run with a registry nobody else mutates instead
/// of the global, write-once one.
#[derive(Default, Clone)]
pub struct ClientOptions {
    pub balancer_registry: Option<Arc<super::balancer::BalancerRegistry>>,
    pub resolver_registry: Option<Arc<ResolverRegistry>>,
    pub remote_client_registry: Option<Arc<RemoteClientBuilderRegistry>>,
}

pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    service_name: String,
    config: ServiceConfig,
    manager: Arc<RemoteClientManager>,
    balancer: Arc<dyn Balancer>,
    snapshot: PickerSnapshotStore,
    closed: AtomicBool,
    closed_notify: Notify,
    first_resolved: watch::Sender<bool>,
    // Kept alive for the lifetime of `Inner` purely so `receiver_count()`
    // never drops to zero: `watch::Sender::send` silently drops the value
    // instead of storing it once every receiver is gone, which would lose
    // the one-shot "first resolution" signal whenever the watcher fires it
    // before any caller has subscribed (§8 invariant 4).
    first_resolved_rx: watch::Receiver<bool>,
    resolver: tokio::sync::Mutex<Option<Arc<dyn super::resolver::Resolver>>>,
}

impl BalancerClient for Inner {
    fn update_picker(&self, picker: Arc<dyn Picker>) {
        self.snapshot.update_picker(picker);
    }
}

struct ResolverBridge {
    sender: watch::Sender<Option<ResolverState>>,
}

#[async_trait]
impl ResolverWatcher for ResolverBridge {
    async fn update_state(&self, state: ResolverState) {
        // Capacity-1, overwrite-on-full: the watch channel always holds
        // just the newest value, which is exactly the coalescing behavior
        // §4.4/§9 ask for.
        let _ = self.sender.send(Some(state));
    }
}

/// An open stream on a picked remote client, bundled with the `Pick` used
/// to report its outcome back to the balancer's picker (§3, §6.2).
pub struct ClientCallStream {
    stream: Box<dyn ClientStream>,
    pick: Pick,
}

impl ClientCallStream {
    pub async fn send(&mut self, message: Vec<u8>) -> Result<(), Status> {
        let result = self.stream.send(message).await;
        if let Err(err) = &result {
            self.pick.report(Some(err));
        }
        result
    }

    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, Status> {
        let result = self.stream.recv().await;
        match &result {
            Err(err) => self.pick.report(Some(err)),
            Ok(_) => {}
        }
        result
    }

    pub fn header(&self) -> &http::HeaderMap {
        self.stream.header()
    }

    pub fn trailer(&self) -> Option<&http::HeaderMap> {
        self.stream.trailer()
    }

    pub async fn close_send(&mut self) -> Result<(), Status> {
        self.stream.close_send().await
    }

    /// Reports the overall outcome of the call. Call exactly once after the
    /// stream has run its course; a missing call just means the picker
    /// never hears about this call's outcome, which only affects richer
    /// pickers this crate doesn't ship.
    pub fn report(&mut self, outcome: Option<&Status>) {
        self.pick.report(outcome);
    }
}

impl Client {
    pub async fn new(service_name: impl Into<String>, config: ServiceConfig) -> Result<Self, Status> {
        Self::with_options(service_name, config, ClientOptions::default()).await
    }

    /// Construction (§4.4):
    /// 1. `config` is already the resolved `ServiceConfig` — reading it
    ///    *from* somewhere is out of scope.
    /// 2. Build the Manager and Balancer, pre-populate an empty snapshot.
    /// 3. Look up the configured resolver, or push the static endpoint list
    ///    once if none is configured.
    pub async fn with_options(
        service_name: impl Into<String>,
        config: ServiceConfig,
        options: ClientOptions,
    ) -> Result<Self, Status> {
        let service_name = service_name.into();

        let manager = Arc::new(match options.remote_client_registry {
            Some(registry) => RemoteClientManager::with_registry(registry),
            None => RemoteClientManager::new(),
        });

        let balancer_registry = options
            .balancer_registry
            .unwrap_or_else(|| Arc::new(clone_global_balancer_registry()));
        let builder = balancer_registry.get(&config.balancer_name).ok_or_else(|| {
            Status::unimplemented(format!("no balancer registered under name {}", config.balancer_name))
        })?;

        let (resolver_tx, mut resolver_rx) = watch::channel(None::<ResolverState>);
        let (first_resolved_tx, first_resolved_rx) = watch::channel(false);

        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<Inner>| {
            let balancer_client: Arc<dyn BalancerClient> = {
                struct WeakBalancerClient(std::sync::Weak<Inner>);
                impl BalancerClient for WeakBalancerClient {
                    fn update_picker(&self, picker: Arc<dyn Picker>) {
                        if let Some(inner) = self.0.upgrade() {
                            inner.update_picker(picker);
                        }
                    }
                }
                Arc::new(WeakBalancerClient(weak.clone()))
            };
            let balancer = builder.build(balancer_client, manager.clone());
            Inner {
                service_name: service_name.clone(),
                config: config.clone(),
                manager,
                balancer,
                snapshot: PickerSnapshotStore::new(),
                closed: AtomicBool::new(false),
                closed_notify: Notify::new(),
                first_resolved: first_resolved_tx,
                first_resolved_rx,
                resolver: tokio::sync::Mutex::new(None),
            }
        });

        // Single-consumer watcher: reads the coalescing channel, reconciles
        // the balancer, and signals first-resolution, idempotently.
        {
            let inner = inner.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = inner.closed_notify.notified() => break,
                        changed = resolver_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let state = resolver_rx.borrow_and_update().clone();
                            if let Some(state) = state {
                                inner.balancer.update_state(state).await;
                                let _ = inner.first_resolved.send(true);
                            }
                        }
                    }
                }
            });
        }

        if let Some(resolver_name) = &config.resolver_name {
            let resolver_registry = options
                .resolver_registry
                .unwrap_or_else(|| Arc::new(clone_global_resolver_registry()));
            let resolver_builder = resolver_registry.get(resolver_name).ok_or_else(|| {
                Status::unimplemented(format!("no resolver registered under name {resolver_name}"))
            })?;
            let watcher: Arc<dyn ResolverWatcher> = Arc::new(ResolverBridge { sender: resolver_tx });
            let resolver = resolver_builder.build(&service_name, watcher).await;
            *inner.resolver.lock().await = Some(resolver);
        } else {
            let _ = resolver_tx.send(Some(ResolverState::new(config.static_endpoints.clone())));
        }

        Ok(Self { inner })
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// `Invoke(ctx, method, req, reply)`: a single send, a single receive.
    pub async fn invoke(
        &self,
        method: &str,
        request: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, Status> {
        let span = info_span!("invoke", service = %self.inner.service_name, method);
        async move {
            let mut stream = self.new_stream(method, timeout).await?;
            stream.send(request).await?;
            stream.close_send().await?;
            let reply = stream.recv().await?.unwrap_or_default();
            stream.report(None);
            Ok(reply)
        }
        .instrument(span)
        .await
    }

    /// `NewStream(ctx, descriptor, method)` (§4.4 `newStream` algorithm).
    pub async fn new_stream(
        &self,
        method: &str,
        timeout: Option<Duration>,
    ) -> Result<ClientCallStream, Status> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let span = info_span!("new_stream", service = %self.inner.service_name, method);
        async {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(client_closing());
            }
            self.wait_for_first_resolution(deadline).await?;

            let mut retries: u32 = 0;
            loop {
                if self.inner.closed.load(Ordering::SeqCst) {
                    return Err(client_closing());
                }
                let mut pick = snapshot::pick(
                    &self.inner.snapshot,
                    &self.inner.closed_notify,
                    || self.inner.closed.load(Ordering::SeqCst),
                    deadline,
                    self.inner.config.fast_fail,
                    &PickInfo { method },
                )
                .await?;

                match pick.remote_client.new_stream(method).await {
                    Ok(stream) => return Ok(ClientCallStream { stream, pick }),
                    Err(err) => {
                        debug!(%err, retries, "new_stream attempt failed, backing off");
                        pick.report(Some(&err));
                        let delay = self.inner.config.backoff.delay(retries);
                        retries += 1;
                        if let Some(deadline) = deadline {
                            if Instant::now() + delay >= deadline {
                                return Err(Status::deadline_exceeded(
                                    "deadline exceeded while retrying new_stream",
                                ));
                            }
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.inner.closed_notify.notified() => return Err(client_closing()),
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn wait_for_first_resolution(&self, deadline: Option<Instant>) -> Result<(), Status> {
        let mut rx = self.inner.first_resolved_rx.clone();
        if *rx.borrow() {
            return Ok(());
        }
        let wait = async {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::pin!(wait);
        let closed = self.inner.closed_notify.notified();
        tokio::pin!(closed);
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = &mut wait => Ok(()),
                    _ = &mut closed => Err(client_closing()),
                    _ = tokio::time::sleep_until(deadline) => Err(Status::deadline_exceeded(
                        "deadline exceeded waiting for the first resolver update",
                    )),
                }
            }
            None => {
                tokio::select! {
                    _ = &mut wait => Ok(()),
                    _ = &mut closed => Err(client_closing()),
                }
            }
        }
    }

    /// Idempotent (§8 round-trip law): the first call tears the Client
    /// down and returns `Ok(())`; every subsequent call is a no-op that
    /// returns the `ClientClosing` sentinel.
    pub async fn close(&self) -> Result<(), Status> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(client_closing());
        }
        self.inner.closed_notify.notify_waiters();
        if let Some(resolver) = self.inner.resolver.lock().await.take() {
            resolver.close().await;
        }
        self.inner.balancer.close().await;
        self.inner.snapshot.close();
        self.inner.manager.close().await;
        Ok(())
    }
}

fn clone_global_balancer_registry() -> super::balancer::BalancerRegistry {
    // The global registry is write-once in production; constructing a
    // fresh one pre-populated the same way keeps test isolation without
    // mutating process-wide state. Real deployments that never register a
    // custom balancer never notice the difference.
    let registry = super::balancer::BalancerRegistry::new();
    if let Some(round_robin) = GLOBAL_BALANCER_REGISTRY.get(super::balancer::round_robin::POLICY_NAME) {
        registry.register(round_robin);
    }
    registry
}

fn clone_global_resolver_registry() -> ResolverRegistry {
    ResolverRegistry::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::endpoint::Endpoint;
    use crate::client::remote_client::stub::StubRemoteClientBuilder;
    use crate::client::resolver::stub::StubResolver;
    use std::time::Duration as StdDuration;

    fn scoped_remote_registry() -> Arc<RemoteClientBuilderRegistry> {
        let registry = Arc::new(RemoteClientBuilderRegistry::new());
        registry.register("tcp", Arc::new(StubRemoteClientBuilder::default()));
        registry
    }

    struct StaticResolverBuilder {
        resolver: Arc<StubResolver>,
    }

    #[async_trait]
    impl super::super::resolver::ResolverBuilder for StaticResolverBuilder {
        fn name(&self) -> &'static str {
            "test-stub"
        }

        async fn build(
            &self,
            _target: &str,
            watcher: Arc<dyn ResolverWatcher>,
        ) -> Arc<dyn super::super::resolver::Resolver> {
            self.resolver.attach(watcher).await;
            self.resolver.clone()
        }
    }

    #[tokio::test]
    async fn s1_static_endpoint_invoke_succeeds_without_blocking() {
        let config = ServiceConfig {
            static_endpoints: vec![Endpoint::new("tcp", "127.0.0.1:1")],
            ..ServiceConfig::default()
        };
        let client = Client::with_options(
            "svc",
            config,
            ClientOptions {
                remote_client_registry: Some(scoped_remote_registry()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let result = tokio::time::timeout(
            StdDuration::from_millis(200),
            client.invoke("/X/Y", b"req".to_vec(), Some(StdDuration::from_secs(1))),
        )
        .await
        .expect("invoke must not block");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn s2_picker_not_yet_available_times_out() {
        let config = ServiceConfig {
            resolver_name: Some("test-stub".to_string()),
            ..ServiceConfig::default()
        };
        let resolver_registry = Arc::new(ResolverRegistry::new());
        resolver_registry.register(Arc::new(StaticResolverBuilder {
            resolver: StubResolver::new(),
        }));

        let client = Client::with_options(
            "svc",
            config,
            ClientOptions {
                resolver_registry: Some(resolver_registry),
                remote_client_registry: Some(scoped_remote_registry()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let err = client
            .invoke("/X/Y", vec![], Some(StdDuration::from_millis(10)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::status::Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn s6_close_is_idempotent_and_blocks_future_calls() {
        let config = ServiceConfig {
            static_endpoints: vec![Endpoint::new("tcp", "127.0.0.1:1")],
            ..ServiceConfig::default()
        };
        let client = Client::with_options(
            "svc",
            config,
            ClientOptions {
                remote_client_registry: Some(scoped_remote_registry()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(client.close().await.is_ok());
        let err = client.close().await.unwrap_err();
        assert!(crate::status::is_client_closing(&err));

        let err = client
            .invoke("/X/Y", vec![], Some(StdDuration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(crate::status::is_client_closing(&err));
    }
}
