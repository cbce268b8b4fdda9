//! JSON-RPC client for the firmware bridge.
//!
//! A single background task keeps one WebSocket connection alive,
//! reconnecting with exponential backoff. Each JSON-RPC message is one text
//! message on that socket. Callers issue blocking requests
//! correlated by id; unsolicited notifications go to registered handlers or
//! an event queue. G-code files travel out of band over HTTP upload.

mod pending;

pub mod backoff;
pub mod client;
pub mod error;
pub mod events;
pub mod message;
pub mod upload;

pub use backoff::{Backoff, BackoffConfig};
pub use client::{
    BridgeClient, ClientConfig, ConnectionState, DEFAULT_EVENT_CAPACITY, DEFAULT_MAX_MESSAGE,
};
pub use error::{Result, TransportError, UploadError};
pub use events::BridgeEvent;
pub use message::{Incoming, Notification, Request, RpcError};
pub use upload::{spawn_upload, UploadHandle};
