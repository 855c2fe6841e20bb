#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared models and wire types for the fog node agent and its client.

pub mod api;
pub mod model;
pub mod validation;

mod time;

pub use time::{new_ulid, now_ms, EpochMs};
