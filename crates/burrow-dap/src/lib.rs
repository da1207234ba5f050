//! burrow-dap — Debug Adapter Protocol client engine for burrow.
//!
//! This crate implements the protocol side of talking to a debug adapter:
//! Content-Length framing, message typing, request/response correlation,
//! event subscription, and the session-initialization handshake. The
//! terminal UI consumes it through [`DapClient`]: issue a call, await its
//! result, subscribe to named events.

pub mod capabilities;
pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod transport;

// Re-export key types for convenience.
pub use capabilities::DapCapabilities;
pub use client::{DapClient, EventWaiter, PendingCall};
pub use connection::{Connection, RequestHandler};
pub use dispatcher::{Dispatcher, EventCallback, ListenerId};
pub use error::DapError;
pub use protocol::{Capabilities, Event, InitializeRequestArguments, Message, Request, Response};
