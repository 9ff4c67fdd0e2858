//! WebSocket Transport
//!
//! Adapts axum WebSockets to the hub: the upgrade handler accepts clients,
//! the write half becomes a [`WebSocketHandle`] and the read half feeds the
//! hub's ingress loop.
//!
//! ## Example
//!
//! ```javascript
//! // Browser
//! const ws = new WebSocket('ws://localhost:3030/v1/ws');
//!
//! ws.onopen = () => {
//!   ws.send(JSON.stringify({username: 'alice', message: 'hi'}));
//! };
//!
//! ws.onmessage = (event) => {
//!   const msg = JSON.parse(event.data);
//!   console.log(`${msg.username}: ${msg.message}`);
//! };
//! ```

mod connection;
mod handler;

pub use connection::WebSocketHandle;
pub use handler::{origin_allowed, require_allowed_origin, websocket_handler};
