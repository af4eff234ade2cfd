//! The Balancer contract (§4.2) and its builder registry. The only
//! realization this crate ships is [`round_robin`], registered under the
//! name `"round_robin"` and used as the default (§6.3).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use once_cell::sync::Lazy;

use super::endpoint::ResolverState;
use super::manager::RemoteClientManager;
use super::picker::Picker;

pub mod round_robin;

/// The subset of the Client the balancer is allowed to drive: publishing a
/// freshly-built picker. Expressed as a trait (rather than handing the
/// balancer the whole Client) so the dependency between the two only runs
/// in one direction.
pub trait BalancerClient: Send + Sync {
    fn update_picker(&self, picker: Arc<dyn Picker>);
}

#[async_trait]
pub trait Balancer: Send + Sync {
    /// Reconciles the live remote-client set against `state`, publishes a
    /// fresh picker, then closes whatever fell out of the new state. A
    /// closed balancer ignores this silently.
    async fn update_state(&self, state: ResolverState);

    /// Idempotent. Publishes an empty picker and closes every remaining
    /// remote client.
    async fn close(&self);
}

pub trait BalancerBuilder: Send + Sync {
    fn name(&self) -> &'static str;
    fn build(&self, client: Arc<dyn BalancerClient>, manager: Arc<RemoteClientManager>) -> Arc<dyn Balancer>;
}

#[derive(Default)]
pub struct BalancerRegistry {
    builders: RwLock<HashMap<String, Arc<dyn BalancerBuilder>>>,
}

impl BalancerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, builder: Arc<dyn BalancerBuilder>) {
        self.builders.write().unwrap().insert(builder.name().to_string(), builder);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BalancerBuilder>> {
        self.builders.read().unwrap().get(name).cloned()
    }
}

/// The registry consulted when a Client is not given its own scoped
/// registry. Pre-populated with `"round_robin"`.
pub static GLOBAL_BALANCER_REGISTRY: Lazy<BalancerRegistry> = Lazy::new(|| {
    let registry = BalancerRegistry::new();
    registry.register(Arc::new(round_robin::RoundRobinBuilder));
    registry
});
