//! The `kvload` command line tool.
//!
//! This builds on top of [`kvload_service`] and connects it to real targets over HTTP, loads
//! configuration, sets up logging and metrics reporting, and handles shutdown signals. It also
//! provides the `fetch` command to materialize remote collections locally.

pub mod cli;
pub mod config;
pub mod fetch;
pub mod http;
pub mod observability;
pub mod report;
pub mod run;
