//! Provider-specific implementations.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatClient;
