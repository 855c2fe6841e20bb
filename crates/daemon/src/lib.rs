#![forbid(unsafe_code)]

//! Per-node fog agent: applies timed container and network changes and keeps
//! a stage-by-stage record of the resulting node state.

pub mod api;
pub mod config;
pub mod controller;
pub mod docker;
pub mod reports;
pub mod scheduler;
pub mod status;
pub mod tc;
