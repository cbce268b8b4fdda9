use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TransportError};

fn is_null(value: &&Value) -> bool {
    value.is_null()
}

/// JSON-RPC 2.0 request sent to the bridge.
#[derive(Debug, Clone, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "is_null")]
    pub params: &'a Value,
    pub id: u64,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: &'a Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
            id,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no reply).
#[derive(Debug, Clone, Serialize)]
pub struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "is_null")]
    pub params: &'a Value,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: &'a Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Error object carried by a failed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// A message received from the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Answer to one of our requests.
    Reply {
        id: u64,
        outcome: std::result::Result<Value, RpcError>,
    },
    /// Spontaneous message from the bridge, routed by method name.
    ///
    /// Server-initiated calls carrying an `id` land here too; the id is
    /// dropped since the client never answers them.
    Notification { method: String, params: Value },
}

impl Incoming {
    /// Classify a raw payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)?;
        let Value::Object(mut obj) = value else {
            return Err(TransportError::MalformedReply(
                "message is not a JSON object".to_string(),
            ));
        };

        match obj.remove("method") {
            Some(Value::String(method)) => {
                return Ok(Self::Notification {
                    method,
                    params: obj.remove("params").unwrap_or(Value::Null),
                })
            }
            Some(other) => {
                return Err(TransportError::MalformedReply(format!(
                    "method {other} is not a string"
                )))
            }
            None => {}
        }

        let id = match obj.remove("id") {
            Some(Value::Null) | None => {
                return Err(TransportError::MalformedReply(
                    "message has no id and no method".to_string(),
                ))
            }
            Some(id) => id.as_u64().ok_or_else(|| {
                TransportError::MalformedReply(format!("reply id {id} is not an unsigned integer"))
            })?,
        };
        if let Some(error) = obj.remove("error") {
            let error: RpcError = serde_json::from_value(error)?;
            return Ok(Self::Reply {
                id,
                outcome: Err(error),
            });
        }
        match obj.remove("result") {
            Some(result) => Ok(Self::Reply {
                id,
                outcome: Ok(result),
            }),
            None => Err(TransportError::MalformedReply(format!(
                "reply {id} has neither result nor error"
            ))),
        }
    }
}
