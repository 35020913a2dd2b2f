//! REST API module for probes, metrics and read-only Stack queries
//!
//! Also serves the CRD conversion endpoint so the API server can translate
//! between `v1alpha3` and `v1beta2`.

mod dto;
mod handlers;
mod server;

pub use server::{router, run_server};
