//! WebSocket support for the primary realtime transport
//!
//! A client either passes `?token=` on the upgrade request or sends an
//! `authenticate` message first. Everything after that is the realtime
//! protocol handled by [`forkcast_realtime::Session`].

pub mod handler;

pub use handler::ws_handler;
