//! Shared types used across the runtime.

pub mod tool;
