//! CLI command implementations.

pub mod afe;
pub mod bus;
pub mod config;
pub mod doa;
pub mod pipeline;
