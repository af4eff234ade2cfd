//! Opaque, string-keyed side-channel data carried alongside endpoints and
//! resolver states. Values are type-erased so resolvers, balancers and
//! transports can pass data between themselves without the core needing to
//! know its shape.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Attributes {
    values: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attributes")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_typed_value() {
        let mut attrs = Attributes::new();
        attrs.insert("weight", 7u32);
        assert_eq!(attrs.get::<u32>("weight"), Some(&7));
        assert_eq!(attrs.get::<String>("weight"), None);
        assert!(attrs.contains("weight"));
        assert!(!attrs.contains("missing"));
    }
}
