//! JSON-lines RPC transport for the terminal manager.
//!
//! One request or server message per line. Every connection owns the
//! subscriptions it creates; closing it drops them and never kills a session.

mod connection;
pub mod protocol;
mod server;

pub use connection::{serve_connection, Connection};
pub use protocol::{Request, RequestFrame, ServerMessage};
pub use server::serve;
