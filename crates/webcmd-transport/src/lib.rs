//! Transport layer for the webcmd broker.
//!
//! Provides:
//! - WebSocket upgrade endpoint for agents (`/events`)
//! - HTTP request surface for operators

pub mod http;
pub mod websocket;

pub use http::{router, serve};
pub use websocket::events_handler;
