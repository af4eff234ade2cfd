//! The round-robin realization of the Balancer contract (§4.2): no
//! weighting, no randomization, `Next` returns
//! `clients[fetch_and_add(counter) % N]`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tracing::warn;

use crate::status::Status;

use super::super::endpoint::ResolverState;
use super::super::manager::RemoteClientManager;
use super::super::picker::{Pick, PickInfo, Picker};
use super::super::remote_client::{ConnectivityState, RemoteClient, StateListener};
use super::super::serializer::CallbackSerializer;
use super::{Balancer, BalancerBuilder, BalancerClient};

pub const POLICY_NAME: &str = "round_robin";

pub struct RoundRobinBuilder;

impl BalancerBuilder for RoundRobinBuilder {
    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn build(&self, client: Arc<dyn BalancerClient>, manager: Arc<RemoteClientManager>) -> Arc<dyn Balancer> {
        RoundRobinBalancer::new(client, manager)
    }
}

struct ClientEntry {
    name: String,
    client: Arc<dyn RemoteClient>,
    // Kept alive for as long as the entry exists so the worker task backing
    // it keeps draining; dropped (and so, eventually, stopped) once the
    // entry is reconciled away.
    _serializer: Arc<CallbackSerializer>,
}

pub struct RoundRobinBalancer {
    weak_self: Mutex<Weak<RoundRobinBalancer>>,
    client: Arc<dyn BalancerClient>,
    manager: Arc<RemoteClientManager>,
    entries: Mutex<Vec<ClientEntry>>,
    closed: AtomicBool,
}

impl RoundRobinBalancer {
    pub fn new(client: Arc<dyn BalancerClient>, manager: Arc<RemoteClientManager>) -> Arc<dyn Balancer> {
        let balancer = Arc::new(Self {
            weak_self: Mutex::new(Weak::new()),
            client,
            manager,
            entries: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        *balancer.weak_self.lock().unwrap() = Arc::downgrade(&balancer);
        balancer
    }

    fn on_remote_client_state_change(&self, name: &str, _state: ConnectivityState) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // The live state lives on the RemoteClient itself; a state change
        // just means "go rebuild and republish the picker from current
        // states" (§4.2: any Ready-boundary crossing triggers a rebuild).
        let exists = self.entries.lock().unwrap().iter().any(|e| e.name == name);
        if exists {
            self.publish_picker();
        }
    }

    fn publish_picker(&self) {
        let ready: Vec<Arc<dyn RemoteClient>> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.client.state() == ConnectivityState::Ready)
            .map(|e| e.client.clone())
            .collect();
        self.client.update_picker(Arc::new(RoundRobinPicker::new(ready)));
    }
}

#[async_trait]
impl Balancer for RoundRobinBalancer {
    async fn update_state(&self, state: ResolverState) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let old_entries = std::mem::take(&mut *self.entries.lock().unwrap());
        let mut old_by_name: HashMap<String, ClientEntry> =
            old_entries.into_iter().map(|e| (e.name.clone(), e)).collect();

        let mut new_entries = Vec::with_capacity(state.endpoints.len());
        for endpoint in &state.endpoints {
            let name = endpoint.name();
            if let Some(entry) = old_by_name.remove(&name) {
                new_entries.push(entry);
                continue;
            }

            let serializer = Arc::new(CallbackSerializer::new());
            let listener = make_listener(
                self.weak_self.lock().unwrap().clone(),
                name.clone(),
                serializer.clone(),
            );
            match self.manager.get_or_create(endpoint, listener).await {
                Ok(client) => {
                    let to_connect = client.clone();
                    tokio::spawn(async move { to_connect.connect().await });
                    new_entries.push(ClientEntry {
                        name,
                        client,
                        _serializer: serializer,
                    });
                }
                Err(err) => {
                    warn!(endpoint = %name, %err, "failed to create remote client for endpoint");
                }
            }
        }

        // Anything left in old_by_name fell out of the new resolver state.
        let removed: Vec<String> = old_by_name.into_keys().collect();

        *self.entries.lock().unwrap() = new_entries;

        self.publish_picker();

        for name in removed {
            self.manager.remove(&name).await;
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries = std::mem::take(&mut *self.entries.lock().unwrap());
        self.client.update_picker(Arc::new(super::super::picker::EmptyPicker));
        for entry in entries {
            self.manager.remove(&entry.name).await;
        }
    }
}

fn make_listener(
    balancer: Weak<RoundRobinBalancer>,
    name: String,
    serializer: Arc<CallbackSerializer>,
) -> StateListener {
    Arc::new(move |state: ConnectivityState| {
        let balancer = balancer.clone();
        let name = name.clone();
        serializer.schedule(move || {
            if let Some(balancer) = balancer.upgrade() {
                balancer.on_remote_client_state_change(&name, state);
            }
        });
    })
}

pub struct RoundRobinPicker {
    clients: Vec<Arc<dyn RemoteClient>>,
    counter: AtomicUsize,
}

impl RoundRobinPicker {
    pub fn new(clients: Vec<Arc<dyn RemoteClient>>) -> Self {
        Self {
            clients,
            counter: AtomicUsize::new(0),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _info: &PickInfo<'_>) -> Result<Pick, Status> {
        if self.clients.is_empty() {
            return Err(crate::status::no_available_instance());
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        let client = self.clients[index].clone();
        Ok(Pick::new(client, |outcome| {
            if let Some(status) = outcome {
                tracing::debug!(%status, "call reported a non-nil outcome to the picker");
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::endpoint::Endpoint;
    use crate::client::remote_client::{RemoteClientBuilderRegistry};
    use crate::client::remote_client::stub::StubRemoteClientBuilder;
    use std::sync::Mutex as StdMutex;

    struct RecordingClient {
        pickers: StdMutex<Vec<Arc<dyn Picker>>>,
    }

    impl BalancerClient for RecordingClient {
        fn update_picker(&self, picker: Arc<dyn Picker>) {
            self.pickers.lock().unwrap().push(picker);
        }
    }

    fn manager_with_stub() -> Arc<RemoteClientManager> {
        let registry = Arc::new(RemoteClientBuilderRegistry::new());
        registry.register("tcp", Arc::new(StubRemoteClientBuilder::default()));
        Arc::new(RemoteClientManager::with_registry(registry))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn zero_ready_clients_yields_unavailable() {
        let picker = RoundRobinPicker::new(vec![]);
        let err = picker.pick(&PickInfo { method: "/X/Y" }).unwrap_err();
        assert!(crate::status::is_no_available_instance(&err));
    }

    #[tokio::test]
    async fn round_robin_cycles_through_ready_clients_in_order() {
        let manager = manager_with_stub();
        let recorder = Arc::new(RecordingClient { pickers: StdMutex::new(vec![]) });
        let balancer = RoundRobinBalancer::new(recorder.clone(), manager);

        balancer
            .update_state(ResolverState::new(vec![
                Endpoint::new("tcp", "a"),
                Endpoint::new("tcp", "b"),
                Endpoint::new("tcp", "c"),
            ]))
            .await;

        wait_until(|| {
            recorder
                .pickers
                .lock()
                .unwrap()
                .last()
                .map(|p| p.pick(&PickInfo { method: "/x" }).is_ok())
                .unwrap_or(false)
        })
        .await;

        let picker = recorder.pickers.lock().unwrap().last().unwrap().clone();
        let mut order = Vec::new();
        for _ in 0..6 {
            let pick = picker.pick(&PickInfo { method: "/x" }).unwrap();
            order.push(pick.remote_client.endpoint().name());
        }
        assert_eq!(
            order,
            vec!["tcp/a", "tcp/b", "tcp/c", "tcp/a", "tcp/b", "tcp/c"]
        );
    }

    #[tokio::test]
    async fn removed_endpoint_is_closed_and_never_picked_again() {
        let manager = manager_with_stub();
        let recorder = Arc::new(RecordingClient { pickers: StdMutex::new(vec![]) });
        let balancer = RoundRobinBalancer::new(recorder.clone(), manager.clone());

        balancer
            .update_state(ResolverState::new(vec![
                Endpoint::new("tcp", "a"),
                Endpoint::new("tcp", "b"),
            ]))
            .await;
        wait_until(|| {
            recorder
                .pickers
                .lock()
                .unwrap()
                .last()
                .map(|p| p.pick(&PickInfo { method: "/x" }).is_ok())
                .unwrap_or(false)
        })
        .await;

        balancer
            .update_state(ResolverState::new(vec![Endpoint::new("tcp", "a")]))
            .await;

        let picker = recorder.pickers.lock().unwrap().last().unwrap().clone();
        for _ in 0..4 {
            let pick = picker.pick(&PickInfo { method: "/x" }).unwrap();
            assert_eq!(pick.remote_client.endpoint().name(), "tcp/a");
        }
    }

    #[tokio::test]
    async fn close_publishes_empty_picker_and_closes_all_clients() {
        let manager = manager_with_stub();
        let recorder = Arc::new(RecordingClient { pickers: StdMutex::new(vec![]) });
        let balancer = RoundRobinBalancer::new(recorder.clone(), manager);

        balancer
            .update_state(ResolverState::new(vec![Endpoint::new("tcp", "a")]))
            .await;
        balancer.close().await;

        let picker = recorder.pickers.lock().unwrap().last().unwrap().clone();
        let err = picker.pick(&PickInfo { method: "/x" }).unwrap_err();
        assert!(crate::status::is_no_available_instance(&err));

        // A second close must not panic.
        balancer.close().await;
    }
}
