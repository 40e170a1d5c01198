//! Integration tests for Shoal
//!
//! These tests run real TCP conns between in-process nodes: handshakes over
//! the loopback interface, throttled transport, and schedulers that dial,
//! admit and blacklist each other.

#[path = "integration/handshake_flow.rs"]
mod handshake_flow;

#[path = "integration/scheduler_flow.rs"]
mod scheduler_flow;

#[path = "integration/transport_flow.rs"]
mod transport_flow;
