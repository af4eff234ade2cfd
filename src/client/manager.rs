//! C2: the Remote-Client Manager. The per-service cache enforcing
//! at-most-one live [`RemoteClient`] per endpoint name (§4.1, invariant 1 in
//! §8).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::status::Status;

use super::endpoint::Endpoint;
use super::remote_client::{
    ClientStream, ConnectivityState, RemoteClient, RemoteClientBuilderRegistry, StateListener,
    GLOBAL_REMOTE_CLIENT_REGISTRY,
};

pub struct RemoteClientManager {
    inner: Arc<Inner>,
}

struct Inner {
    registry: ManagerRegistry,
    clients: RwLock<HashMap<String, Arc<dyn RemoteClient>>>,
    closed: AtomicBool,
}

enum ManagerRegistry {
    Global,
    Scoped(Arc<RemoteClientBuilderRegistry>),
}

impl ManagerRegistry {
    fn get(&self, protocol: &str) -> Option<Arc<dyn crate::client::remote_client::RemoteClientBuilder>> {
        match self {
            ManagerRegistry::Global => GLOBAL_REMOTE_CLIENT_REGISTRY.get(protocol),
            ManagerRegistry::Scoped(registry) => registry.get(protocol),
        }
    }
}

impl RemoteClientManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: ManagerRegistry::Global,
                clients: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_registry(registry: Arc<RemoteClientBuilderRegistry>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: ManagerRegistry::Scoped(registry),
                clients: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns a cached client for `endpoint.name()`, or builds one via the
    /// registered protocol builder. The returned handle is a *view*: calling
    /// [`RemoteClient::close`] on it routes through [`Self::remove`] rather
    /// than closing the underlying client directly, so the balancer can
    /// never bypass the manager's bookkeeping (§4.1).
    pub async fn get_or_create(
        &self,
        endpoint: &Endpoint,
        listener: StateListener,
    ) -> Result<Arc<dyn RemoteClient>, Status> {
        let name = endpoint.name();

        // Fast path: shared read, common case of an already-cached client.
        {
            let clients = self.inner.clients.read().await;
            if let Some(client) = clients.get(&name) {
                return Ok(self.view(name, client.clone()));
            }
        }

        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(manager_closed());
        }

        // Slow path: exclusive lock, double-checked insertion. The builder
        // call happens under the write lock so two concurrent callers for
        // the same endpoint can never create duplicate clients.
        let mut clients = self.inner.clients.write().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(manager_closed());
        }
        if let Some(client) = clients.get(&name) {
            return Ok(self.view(name, client.clone()));
        }

        let builder = self
            .inner
            .registry
            .get(endpoint.protocol())
            .ok_or_else(|| no_builder(endpoint.protocol()))?;
        let client = builder.build(endpoint, listener).await?;
        clients.insert(name.clone(), client.clone());
        debug!(endpoint = %name, "remote client created");
        Ok(self.view(name, client))
    }

    /// Removes the mapping for `name`, then closes the client outside the
    /// lock. A no-op if `name` is absent, which makes it safe to call twice
    /// (once from a view's `close()`, once from the balancer's own
    /// reconciliation) without ceremony.
    pub async fn remove(&self, name: &str) {
        let removed = {
            let mut clients = self.inner.clients.write().await;
            clients.remove(name)
        };
        if let Some(client) = removed {
            debug!(endpoint = name, "remote client removed");
            client.close().await;
        }
    }

    /// Idempotent. Marks the manager closed, drains the map, and closes
    /// every remaining client concurrently, outside the manager's lock.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let clients: Vec<_> = {
            let mut clients = self.inner.clients.write().await;
            clients.drain().collect()
        };
        let closes = clients.into_iter().map(|(name, client)| async move {
            client.close().await;
            debug!(endpoint = name, "remote client closed during manager shutdown");
        });
        futures_join_all(closes).await;
    }

    fn view(&self, name: String, client: Arc<dyn RemoteClient>) -> Arc<dyn RemoteClient> {
        Arc::new(RemoteClientView {
            name,
            manager: Arc::downgrade(&self.inner),
            inner: client,
        })
    }
}

impl Default for RemoteClientManager {
    fn default() -> Self {
        Self::new()
    }
}

fn manager_closed() -> Status {
    Status::failed_precondition("remote-client manager is closed")
}

fn no_builder(protocol: &str) -> Status {
    warn!(protocol, "no remote-client builder registered for protocol");
    Status::unimplemented(format!("no remote-client builder registered for protocol {protocol}"))
}

/// A handle to a [`RemoteClient`] owned by a [`RemoteClientManager`]. Every
/// method but `close` delegates straight through; `close` instead asks the
/// owning manager to remove the mapping, so the manager's bookkeeping (and
/// its "at most one client per name" invariant) can never be bypassed by a
/// holder of this view.
struct RemoteClientView {
    name: String,
    manager: Weak<Inner>,
    inner: Arc<dyn RemoteClient>,
}

#[async_trait]
impl RemoteClient for RemoteClientView {
    fn endpoint(&self) -> &Endpoint {
        self.inner.endpoint()
    }

    fn state(&self) -> ConnectivityState {
        self.inner.state()
    }

    async fn connect(&self) {
        self.inner.connect().await;
    }

    async fn new_stream(&self, method: &str) -> Result<Box<dyn ClientStream>, Status> {
        self.inner.new_stream(method).await
    }

    async fn close(&self) {
        if let Some(inner) = self.manager.upgrade() {
            let manager = RemoteClientManager { inner };
            manager.remove(&self.name).await;
        } else {
            // The owning manager is already gone (e.g. dropped mid-shutdown);
            // closing directly still upholds "no new streams succeed".
            self.inner.close().await;
        }
    }
}

async fn futures_join_all<I>(iter: I)
where
    I: IntoIterator,
    I::Item: std::future::Future<Output = ()> + Send + 'static,
{
    let handles: Vec<_> = iter.into_iter().map(tokio::spawn).collect();
    for handle in handles {
        let _ = handle.await;
    }
}
