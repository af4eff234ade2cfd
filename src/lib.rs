//! Client-side RPC runtime core: a Resolver pushes endpoint sets, a
//! Balancer turns them into Remote Clients and a Picker, and a [`Client`]
//! exposes `invoke`/`new_stream`/`close` over whichever client the Picker's
//! round-robin chooses.
//!
//! [`Client`]: client::Client

pub mod attributes;
pub mod backoff;
pub mod client;
pub mod config;
pub mod interceptor;
pub mod stats;
pub mod status;

pub use client::{Client, ClientCallStream, ClientOptions};
pub use config::ServiceConfig;
pub use status::{Code, Status};
