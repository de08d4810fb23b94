//! `ChatSync` -- real-time conversation synchronization for chat clients.
//!
//! Keeps a client's view of conversations consistent with the backend:
//! one live subscription for the active conversation, optimistic sends
//! reconciled against server echoes, automatic reconnection, and an
//! advisory presence view.

pub mod config;
pub mod connection;
pub mod session;
pub mod sync;
pub mod transport;
