//! Testing utilities and fixtures
//!
//! Lets dispatch, consumer and shutdown behaviour be tested without an MQTT
//! broker or a Redis server.

pub mod mocks;

pub use mocks::*;
