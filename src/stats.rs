//! The Stats Handler contract consumed by [`crate::client::Client`] and the
//! Remote-Client builder (§6.1): four chainable callbacks. Collecting and
//! exporting stats is an application concern (§1 Non-goals); this crate
//! only defines the interface and a [`ChainedStatsHandler`] combinator.

use std::sync::Arc;

/// Per-RPC context attached at `TagRPC` time and threaded through the rest
/// of the call's lifetime. Opaque to the core; a handler may stash whatever
/// it needs here via its own out-of-band bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcTag(pub u64);

/// Per-channel context attached at `TagChannel` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTag(pub u64);

/// An event reported through `HandleRPC`.
#[derive(Debug, Clone)]
pub enum RpcStatsEvent {
    Began { method: String },
    OutPayload { bytes: usize },
    InPayload { bytes: usize },
    End { error: Option<String> },
}

/// An event reported through `HandleChannel`.
#[derive(Debug, Clone)]
pub enum ChannelStatsEvent {
    Connected,
    Disconnected,
}

pub trait StatsHandler: Send + Sync {
    fn tag_rpc(&self, method: &str) -> RpcTag;
    fn handle_rpc(&self, tag: RpcTag, event: &RpcStatsEvent);
    fn tag_channel(&self, service_name: &str) -> ChannelTag;
    fn handle_channel(&self, tag: ChannelTag, event: &ChannelStatsEvent);
}

/// Fans every callback out to each handler in order, in the style of a
/// Balancer or Interceptor chain — lets a Client be configured with several
/// independent stats handlers (e.g. one for metrics, one for tracing)
/// without either knowing about the other.
pub struct ChainedStatsHandler {
    handlers: Vec<Arc<dyn StatsHandler>>,
}

impl ChainedStatsHandler {
    pub fn new(handlers: Vec<Arc<dyn StatsHandler>>) -> Self {
        Self { handlers }
    }
}

impl StatsHandler for ChainedStatsHandler {
    fn tag_rpc(&self, method: &str) -> RpcTag {
        // Only the first handler's tag is meaningful as an identifier; the
        // rest still see every `handle_rpc` call regardless.
        self.handlers
            .first()
            .map(|h| h.tag_rpc(method))
            .unwrap_or(RpcTag(0))
    }

    fn handle_rpc(&self, tag: RpcTag, event: &RpcStatsEvent) {
        for handler in &self.handlers {
            handler.handle_rpc(tag, event);
        }
    }

    fn tag_channel(&self, service_name: &str) -> ChannelTag {
        self.handlers
            .first()
            .map(|h| h.tag_channel(service_name))
            .unwrap_or(ChannelTag(0))
    }

    fn handle_channel(&self, tag: ChannelTag, event: &ChannelStatsEvent) {
        for handler in &self.handlers {
            handler.handle_channel(tag, event);
        }
    }
}
