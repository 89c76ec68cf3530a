//! Operational HTTP interface.

pub mod api;

pub use api::{ApiState, router, serve};
