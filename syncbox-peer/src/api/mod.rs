//! HTTP control surface
//!
//! REST endpoints mirroring the node's control operations, plus an SSE
//! stream of node events.

pub mod handlers;
pub mod server;
pub mod sse;

pub use server::{create_router, serve, AppContext};
