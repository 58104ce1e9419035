//! Common test utilities for integration tests using Testcontainers.

#![allow(dead_code)]

pub mod transport;
