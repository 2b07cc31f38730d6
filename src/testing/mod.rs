//! Testing utilities and mock implementations
//!
//! Mocks for the protocol client seam so the pool, the connection and the
//! endpoints can be exercised without an MQTT broker.

pub mod mocks;

pub use mocks::*;
