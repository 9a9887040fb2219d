//! Lazy backend lifecycle management for reverse-proxy host frameworks.
//!
//! A [`handler::Handler`] sits in a host's request pipeline. On the first
//! request that reaches it, it spawns a configured backend subprocess,
//! waits for the backend to become reachable, and forwards the request
//! through the host's own [`handler::ReverseProxy`] implementation. Idle
//! backends are terminated automatically; this crate never keeps a process
//! running with nothing using it.

pub mod config;
pub mod discovery;
pub mod error;
pub mod handler;
pub mod instance;
pub mod lifecycle;
pub mod process;
pub mod readiness;
pub mod registry;
pub mod upstream;

pub use config::{EnvPolicy, HandlerConfig, ReadinessProbe};
pub use error::LifecycleError;
pub use handler::{Handler, HandlerOutcome, PlaceholderExpander, RequestContext, ReverseProxy, StaticPlaceholderExpander};
pub use instance::{BackendInstance, BackendState};
pub use lifecycle::LifecycleManager;
pub use registry::{fingerprint, Registry};
pub use upstream::DialTarget;
