//! Provider abstraction layer.
//!
//! Each provider implements the common adapter contract (url, headers,
//! request conversion, dispatch, response/stream parsing); the registry maps
//! channel types to factories. OpenAI-dialect providers share the default
//! adapter and differ only in their base URL.

pub mod adapter;
pub mod ali;
pub mod auth_cache;
pub mod baidu;
pub mod claude;
pub mod client;
pub mod cloudflare;
pub mod cohere;
pub mod error;
pub mod gemini;
pub mod info;
pub mod midjourney;
pub mod openai;
pub mod registry;
pub mod suno;
pub mod zhipu;

pub use adapter::{
    read_failure, read_json_body, Adapter, AdapterOutput, ConvertedRequest, RelayStream,
    SseUpstream,
};
pub use auth_cache::UpstreamTokenCache;
pub use client::client_for_proxy;
pub use error::{classify_upstream_failure, RelayError, RelayErrorKind, RelayResult};
pub use info::{RelayInfo, RelayMode, RelayRequest};
pub use registry::{default_base_url, AdapterRegistry};

// Implementors of `Adapter` outside this crate need the client types.
pub use wreq;
