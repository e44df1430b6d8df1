//! Canonical wire shapes for the relay.
//!
//! The gateway's dialect-neutral request/response types are isomorphic to
//! OpenAI's; the Anthropic, Midjourney and Suno dialects are transformed at
//! the edge. This crate intentionally does not depend on any HTTP stack.

pub mod claude;
pub mod error;
pub mod midjourney;
pub mod openai;
pub mod sse;
pub mod suno;

pub use error::{ApiError, ErrorEnvelope};
pub use openai::Usage;
