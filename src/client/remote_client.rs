//! §4.5: the connection state machine every Remote Client implements,
//! regardless of protocol, plus the builder registry keyed by
//! `endpoint.protocol()` that the Manager (§4.1) dispatches to.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use once_cell::sync::Lazy;

use crate::status::Status;

use super::endpoint::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

/// Invoked by the transport on every state transition. Must be forwarded
/// serially per client — see [`super::serializer::CallbackSerializer`] — but
/// may run concurrently with the listener of a different remote client.
pub type StateListener = Arc<dyn Fn(ConnectivityState) + Send + Sync>;

/// One open bidirectional exchange with a remote client, as handed back by
/// [`RemoteClient::new_stream`]. Mirrors the shape `Client::NewStream`
/// exposes to the application (§6.2) one layer down, at the single-connection
/// level.
#[async_trait]
pub trait ClientStream: Send + Sync {
    async fn send(&mut self, message: Vec<u8>) -> Result<(), Status>;
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, Status>;
    fn header(&self) -> &http::HeaderMap;
    fn trailer(&self) -> Option<&http::HeaderMap>;
    async fn close_send(&mut self) -> Result<(), Status>;
}

/// A protocol-specific handle to one endpoint. The core depends only on this
/// trait; a real implementation (HTTP/2, in-memory, ...) is a collaborator
/// registered in the [`RemoteClientBuilderRegistry`] under its protocol name.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    fn state(&self) -> ConnectivityState;

    /// Idle -> Connecting -> {Ready, Idle (after reconnect back-off)}.
    /// No-op once Shutdown.
    async fn connect(&self);

    async fn new_stream(&self, method: &str) -> Result<Box<dyn ClientStream>, Status>;

    /// Any non-Shutdown -> Shutdown. Absorbing: idempotent, and after it
    /// returns no further state change is observable and no new stream can
    /// succeed.
    async fn close(&self);
}

impl fmt::Debug for dyn RemoteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClient")
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
pub trait RemoteClientBuilder: Send + Sync {
    async fn build(
        &self,
        endpoint: &Endpoint,
        listener: StateListener,
    ) -> Result<Arc<dyn RemoteClient>, Status>;
}

#[derive(Default)]
pub struct RemoteClientBuilderRegistry {
    builders: RwLock<HashMap<String, Arc<dyn RemoteClientBuilder>>>,
}

impl RemoteClientBuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, protocol: impl Into<String>, builder: Arc<dyn RemoteClientBuilder>) {
        self.builders.write().unwrap().insert(protocol.into(), builder);
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn RemoteClientBuilder>> {
        self.builders.read().unwrap().get(protocol).cloned()
    }
}

/// The registry consulted when a [`super::manager::RemoteClientManager`] is
/// not constructed with its own scoped registry. Process-wide and
/// write-once in production; tests that need isolation should build a
/// scoped `RemoteClientBuilderRegistry` instead of mutating this one.
pub static GLOBAL_REMOTE_CLIENT_REGISTRY: Lazy<RemoteClientBuilderRegistry> =
    Lazy::new(RemoteClientBuilderRegistry::new);

pub mod stub {
    //! A deterministic, in-memory [`RemoteClient`] realization used by this
    //! crate's own tests and by [`crate::demos`]. Exercises C2-C5 without a
    //! real transport: `connect()` transitions straight to `Ready` (or, when
    //! configured to fail, cycles `Connecting -> Idle` using the connect-side
    //! back-off) and `new_stream` returns a canned response or a canned
    //! error.

    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    use tokio::sync::Mutex as AsyncMutex;

    use crate::backoff::BackoffConfig;

    use super::*;

    pub struct StubRemoteClient {
        endpoint: Endpoint,
        listener: StateListener,
        state: Mutex<ConnectivityState>,
        closed: AtomicBool,
        connect_calls: AtomicU32,
        fail_until_attempt: u32,
        backoff: BackoffConfig,
        response: Vec<u8>,
    }

    impl StubRemoteClient {
        pub fn new(endpoint: Endpoint, listener: StateListener) -> Arc<Self> {
            Self::with_script(endpoint, listener, 0, Vec::new())
        }

        /// `fail_until_attempt` lets a test make the first N `connect()`
        /// calls land in `TransientFailure`/`Idle` before the client
        /// finally reaches `Ready`, exercising the reconnect back-off.
        pub fn with_script(
            endpoint: Endpoint,
            listener: StateListener,
            fail_until_attempt: u32,
            response: Vec<u8>,
        ) -> Arc<Self> {
            Arc::new(Self {
                endpoint,
                listener,
                state: Mutex::new(ConnectivityState::Idle),
                closed: AtomicBool::new(false),
                connect_calls: AtomicU32::new(0),
                fail_until_attempt,
                backoff: BackoffConfig::connect_default(),
                response,
            })
        }

        fn set_state(&self, state: ConnectivityState) {
            *self.state.lock().unwrap() = state;
            (self.listener)(state);
        }

        pub fn connect_attempts(&self) -> u32 {
            self.connect_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteClient for StubRemoteClient {
        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }

        fn state(&self) -> ConnectivityState {
            *self.state.lock().unwrap()
        }

        async fn connect(&self) {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let attempt = self.connect_calls.fetch_add(1, Ordering::SeqCst);
            self.set_state(ConnectivityState::Connecting);
            if attempt < self.fail_until_attempt {
                let delay = self.backoff.delay(attempt);
                tokio::time::sleep(delay).await;
                if !self.closed.load(Ordering::SeqCst) {
                    self.set_state(ConnectivityState::Idle);
                }
                return;
            }
            if !self.closed.load(Ordering::SeqCst) {
                self.set_state(ConnectivityState::Ready);
            }
        }

        async fn new_stream(&self, _method: &str) -> Result<Box<dyn ClientStream>, Status> {
            if self.state() != ConnectivityState::Ready {
                return Err(Status::unavailable("remote client is not ready"));
            }
            Ok(Box::new(StubClientStream {
                outgoing: AsyncMutex::new(Vec::new()),
                incoming: AsyncMutex::new(vec![self.response.clone()]),
                header: http::HeaderMap::new(),
            }))
        }

        async fn close(&self) {
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            self.set_state(ConnectivityState::Shutdown);
        }
    }

    struct StubClientStream {
        outgoing: AsyncMutex<Vec<Vec<u8>>>,
        incoming: AsyncMutex<Vec<Vec<u8>>>,
        header: http::HeaderMap,
    }

    #[async_trait]
    impl ClientStream for StubClientStream {
        async fn send(&mut self, message: Vec<u8>) -> Result<(), Status> {
            self.outgoing.lock().await.push(message);
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<Vec<u8>>, Status> {
            Ok(self.incoming.lock().await.pop())
        }

        fn header(&self) -> &http::HeaderMap {
            &self.header
        }

        fn trailer(&self) -> Option<&http::HeaderMap> {
            None
        }

        async fn close_send(&mut self) -> Result<(), Status> {
            Ok(())
        }
    }

    pub struct StubRemoteClientBuilder {
        pub fail_until_attempt: u32,
        pub response: Vec<u8>,
    }

    impl Default for StubRemoteClientBuilder {
        fn default() -> Self {
            Self {
                fail_until_attempt: 0,
                response: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl RemoteClientBuilder for StubRemoteClientBuilder {
        async fn build(
            &self,
            endpoint: &Endpoint,
            listener: StateListener,
        ) -> Result<Arc<dyn RemoteClient>, Status> {
            Ok(StubRemoteClient::with_script(
                endpoint.clone(),
                listener,
                self.fail_until_attempt,
                self.response.clone(),
            ))
        }
    }
}
