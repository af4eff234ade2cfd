//! The ambient configuration surface (§6.3). The core only *parses* an
//! already-fetched [`serde_json::Value`] into a typed [`ServiceConfig`];
//! discovering, loading or hot-reloading that JSON from disk, the
//! environment, or a control plane is the application's concern.

use crate::attributes::Attributes;
use crate::backoff::BackoffConfig;
use crate::client::endpoint::Endpoint;

pub const DEFAULT_BALANCER_NAME: &str = "round_robin";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub fast_fail: bool,
    pub balancer_name: String,
    pub resolver_name: Option<String>,
    pub static_endpoints: Vec<Endpoint>,
    pub remote_attributes: Attributes,
    pub backoff: BackoffConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            fast_fail: false,
            balancer_name: DEFAULT_BALANCER_NAME.to_string(),
            resolver_name: None,
            static_endpoints: Vec::new(),
            remote_attributes: Attributes::new(),
            backoff: BackoffConfig::client_default(),
        }
    }
}

impl ServiceConfig {
    /// Parses the recognized keys documented in §6.3 out of `value`,
    /// filling in documented defaults for anything absent. Unrecognized
    /// keys are ignored rather than rejected, so a config namespace shared
    /// with other subsystems doesn't break this parser.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let mut config = Self::default();

        if let Some(fast_fail) = value.get("fastFail").and_then(|v| v.as_bool()) {
            config.fast_fail = fast_fail;
        }
        if let Some(balancer) = value.get("balancer").and_then(|v| v.as_str()) {
            if !balancer.is_empty() {
                config.balancer_name = balancer.to_string();
            }
        }
        if let Some(resolver) = value.get("resolver").and_then(|v| v.as_str()) {
            if !resolver.is_empty() {
                config.resolver_name = Some(resolver.to_string());
            }
        }
        if let Some(endpoints) = value.get("remote.endpoints").and_then(|v| v.as_array()) {
            config.static_endpoints = endpoints
                .iter()
                .filter_map(Self::parse_endpoint)
                .collect();
        }
        if let Some(attributes) = value.get("remote.attributes").and_then(|v| v.as_object()) {
            config.remote_attributes = Self::parse_attributes(attributes);
        }
        if let Some(backoff) = value.get("backoff") {
            config.backoff = Self::parse_backoff(backoff, config.backoff);
        }

        config
    }

    fn parse_endpoint(value: &serde_json::Value) -> Option<Endpoint> {
        let address = value.get("address")?.as_str()?;
        let protocol = value.get("protocol").and_then(|v| v.as_str()).unwrap_or("tcp");
        let mut endpoint = Endpoint::new(protocol, address);
        if let Some(attributes) = value.get("attributes").and_then(|v| v.as_object()) {
            endpoint = endpoint.with_attributes(Self::parse_attributes(attributes));
        }
        Some(endpoint)
    }

    /// Stores each raw JSON value under its own key, untyped. Callers that
    /// know a given key's shape read it back out with
    /// `attributes.get::<serde_json::Value>(key)`.
    fn parse_attributes(object: &serde_json::Map<String, serde_json::Value>) -> Attributes {
        let mut attributes = Attributes::new();
        for (key, value) in object {
            attributes.insert(key.clone(), value.clone());
        }
        attributes
    }

    fn parse_backoff(value: &serde_json::Value, defaults: BackoffConfig) -> BackoffConfig {
        let secs = |key: &str, default: std::time::Duration| {
            value
                .get(key)
                .and_then(|v| v.as_f64())
                .map(std::time::Duration::from_secs_f64)
                .unwrap_or(default)
        };
        BackoffConfig {
            base_delay: secs("BaseDelay", defaults.base_delay),
            multiplier: value
                .get("Multiplier")
                .and_then(|v| v.as_f64())
                .unwrap_or(defaults.multiplier),
            jitter: value
                .get("Jitter")
                .and_then(|v| v.as_f64())
                .unwrap_or(defaults.jitter),
            max_delay: secs("MaxDelay", defaults.max_delay),
        }
    }
}
