//! Meshtun Core Types
//!
//! This crate defines the data structures shared by the tunnel dispatch
//! engine, the fake-address subsystem and the binaries.

mod config;
mod types;

pub use config::*;
pub use types::*;
