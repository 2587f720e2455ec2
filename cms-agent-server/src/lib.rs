//! # CMS Agent Server
//!
//! HTTP surface for the CMS data agent: health probes, status and metrics
//! projections, and a small control API for triggering runs and adjusting
//! the schedule. The binary in `main.rs` also exposes the same operations as
//! one-shot CLI commands.

pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;
pub use routes::create_app;
