//! Core types, config, errors, and client wire protocol for the tutor relay.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;
