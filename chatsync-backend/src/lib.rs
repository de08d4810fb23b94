//! `ChatSync` reference backend library.
//!
//! An in-memory WebSocket backend speaking the `ChatSync` protocol: token
//! authentication, per-conversation subscriptions, history, message
//! posting with server ids, and presence. Used for local development and
//! as the server side of integration tests.

pub mod config;
pub mod server;
pub mod store;
