//! Signal dispatch and real-time websocket notification engine.
//!
//! Server-side code triggers named signals at logical destinations (the
//! server itself, a browser window, a user's windows, everyone); the dispatch
//! engine fans each trigger out to registered handlers through a worker
//! backend and to subscribed websockets through a pub/sub layer. The binary
//! wires the engine to a websocket gateway and to redis-backed queue workers.

pub mod backend;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod pubsub;
pub mod registry;
pub mod store;
pub mod topics;
pub mod worker;
