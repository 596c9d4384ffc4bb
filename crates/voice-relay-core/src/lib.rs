//! Core types, config, errors, wire protocol, and turn storage for Voice Relay.

pub mod config;
pub mod error;
pub mod protocol;
pub mod turn;
pub mod turn_store;
