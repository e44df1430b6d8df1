//! The client-facing HTTP surface: OpenAI-dialect completion routes, the
//! Anthropic messages route, Midjourney/Suno task routes and the file API,
//! all funnelled into the relay pipeline.

mod respond;
mod routes;

pub use routes::relay_router;
