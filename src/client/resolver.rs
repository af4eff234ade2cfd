//! The Resolver watch contract (§6.1): a collaborator that discovers and
//! pushes the current set of endpoints for a service name. This crate ships
//! the registry, the watcher trait, and one realization — a static resolver
//! that pushes its configured endpoint list exactly once — plus a stub used
//! by tests to push arbitrary sequences of states on demand.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use once_cell::sync::Lazy;

use super::endpoint::ResolverState;

/// Notified by the resolver every time it has a new (possibly identical)
/// view of the endpoint set. May be called once or many times over the
/// resolver's lifetime; the Client coalesces bursts into a capacity-1
/// channel (§4.4).
#[async_trait]
pub trait ResolverWatcher: Send + Sync {
    async fn update_state(&self, state: ResolverState);
}

#[async_trait]
pub trait Resolver: Send + Sync {
    /// Stops the resolver. No further `update_state` calls may follow.
    async fn close(&self);
}

#[async_trait]
pub trait ResolverBuilder: Send + Sync {
    fn name(&self) -> &'static str;
    async fn build(&self, target: &str, watcher: Arc<dyn ResolverWatcher>) -> Arc<dyn Resolver>;
}

#[derive(Default)]
pub struct ResolverRegistry {
    builders: RwLock<HashMap<String, Arc<dyn ResolverBuilder>>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, builder: Arc<dyn ResolverBuilder>) {
        self.builders.write().unwrap().insert(builder.name().to_string(), builder);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.builders.read().unwrap().get(name).cloned()
    }
}

pub static GLOBAL_RESOLVER_REGISTRY: Lazy<ResolverRegistry> = Lazy::new(ResolverRegistry::new);

pub mod stub {
    //! A resolver a test can drive directly by calling [`StubResolver::push`]
    //! whenever it wants, rather than relying on registry lookup by name.

    use tokio::sync::Mutex;

    use super::*;

    pub struct StubResolver {
        watcher: Mutex<Option<Arc<dyn ResolverWatcher>>>,
    }

    impl StubResolver {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                watcher: Mutex::new(None),
            })
        }

        pub async fn attach(&self, watcher: Arc<dyn ResolverWatcher>) {
            *self.watcher.lock().await = Some(watcher);
        }

        pub async fn push(&self, state: ResolverState) {
            if let Some(watcher) = self.watcher.lock().await.clone() {
                watcher.update_state(state).await;
            }
        }
    }

    #[async_trait]
    impl Resolver for StubResolver {
        async fn close(&self) {
            *self.watcher.lock().await = None;
        }
    }
}
