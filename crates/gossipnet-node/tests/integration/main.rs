//! Integration test entry point for gossipnet-node.
//!
//! Run with: cargo test --test integration

mod harness;
mod handshake;
mod discovery;
mod commands;
