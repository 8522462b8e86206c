//! Test utilities for the load generator.
//!
//! This crate provides utilities to facilitate integration testing of `kvload`. See the modules for
//! all available utilities.

pub mod server;
pub mod tracing;
