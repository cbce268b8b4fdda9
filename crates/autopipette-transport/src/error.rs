use std::time::Duration;

use crate::message::RpcError;

/// Errors raised to callers of the bridge client.
///
/// Background failures (connect errors, unreadable messages) are reported on
/// the event queue instead; only the request that is affected sees an error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No connection to the bridge is currently established.
    #[error("not connected to the bridge")]
    NotConnected,

    /// The reply did not arrive within the caller's timeout.
    #[error("request '{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    /// The connection dropped while the request was outstanding.
    #[error("connection to the bridge was lost")]
    Disconnected,

    /// The client has been stopped.
    #[error("client is shut down")]
    Shutdown,

    /// The bridge answered with an error payload.
    #[error("bridge error: {0}")]
    Remote(RpcError),

    /// A reply could not be interpreted.
    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configured bridge address is not a usable WebSocket URL.
    #[error("invalid bridge address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The background runtime could not be started.
    #[error("failed to start client runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// A file upload failed.
    #[error(transparent)]
    Upload(#[from] UploadError),
}

/// Errors from the out-of-band file upload.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The file name cannot be used on the bridge.
    #[error("invalid upload name '{0}'")]
    InvalidName(String),

    /// The HTTP exchange failed.
    #[error("upload request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The bridge rejected the upload.
    #[error("upload rejected with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The bridge accepted the upload but the reply lacks `item.path`.
    #[error("unexpected upload response: {0}")]
    MalformedResponse(String),

    /// No result within the caller's timeout. The upload may still finish.
    #[error("upload did not finish within {0:?}")]
    Timeout(Duration),

    /// The upload worker exited without reporting a result.
    #[error("upload worker exited unexpectedly")]
    WorkerGone,
}

pub type Result<T> = std::result::Result<T, TransportError>;
