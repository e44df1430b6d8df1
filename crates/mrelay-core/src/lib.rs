//! Relay core: channel selection, the per-request pipeline, streaming copy,
//! backpressure and bootstrap wiring.

pub mod ability;
pub mod auth;
pub mod bootstrap;
pub mod claude_edge;
pub mod files;
pub mod limit;
pub mod relay;
pub mod state;

pub use ability::{AbilityCache, SelectError};
pub use auth::{authenticate, resolve_group, AuthedRequest};
pub use bootstrap::{bootstrap, bootstrap_from_env, notify_channel_mutation, Bootstrap, CliArgs};
pub use limit::RateGuard;
pub use relay::{relay, ClientDialect, RelayResponse};
pub use state::AppState;
