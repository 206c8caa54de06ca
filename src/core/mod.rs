//! Core engine: data model, provider contract/adapters, resilience layer
//! (circuit breaker, cache), SSE codec, request lifecycle, and the external
//! classification client.

pub mod cache;
pub mod circuit_breaker;
pub mod classification;
pub mod lifecycle;
pub mod providers;
pub mod registry;
pub mod sse;
pub mod types;
