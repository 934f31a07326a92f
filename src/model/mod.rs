//! Model clients for AI providers.
//!
//! ## Structure
//!
//! - `types`: chat messages, replies and errors
//! - `traits`: the `ModelClient` trait the agent loop drives
//! - `shared`: system prompt and answer cleanup
//! - `providers/`: provider-specific implementations

pub mod shared;
pub mod traits;
pub mod types;

pub mod providers;

pub use providers::OpenAiCompatClient;
pub use traits::{DeltaSink, ModelClient};
pub use types::{ChatMessage, ModelError, ModelReply, Role, StreamDelta};
