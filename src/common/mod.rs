//! Shared types, errors and channel helpers

pub mod channels;
pub mod errors;
pub mod types;
