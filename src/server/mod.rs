//! WebSocket server module
//!
//! Accepts connections from chat front-ends and dispatches their messages
//! to the session core.

mod handler;
#[allow(dead_code)]
mod protocol;
mod websocket;

pub use handler::*;
#[allow(unused_imports)]
pub use protocol::*;
pub use websocket::*;
