use std::time::Duration;

use autopipette_transport::{BridgeClient, BridgeEvent, TransportError, UploadError};
use serde_json::Value;

/// What the dispatcher needs from the firmware bridge.
///
/// [`BridgeClient`] is the production implementation; tests substitute an
/// in-memory recorder.
pub trait Bridge {
    fn is_connected(&self) -> bool;

    fn request(&self, method: &str, params: Value, timeout: Duration)
        -> Result<Value, TransportError>;

    fn notify(&self, method: &str, params: Value) -> Result<(), TransportError>;

    /// Upload `bytes` as `name` and return the server-side path.
    fn upload(&self, name: &str, bytes: Vec<u8>, timeout: Duration) -> Result<String, UploadError>;

    fn drain_events(&self) -> Vec<BridgeEvent>;
}

impl Bridge for BridgeClient {
    fn is_connected(&self) -> bool {
        BridgeClient::is_connected(self)
    }

    fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        self.send_request(method, params, timeout)
    }

    fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        self.send_notification(method, params)
    }

    fn upload(&self, name: &str, bytes: Vec<u8>, timeout: Duration) -> Result<String, UploadError> {
        self.upload_file(name, bytes).wait(timeout)
    }

    fn drain_events(&self) -> Vec<BridgeEvent> {
        BridgeClient::drain_events(self)
    }
}

impl<B: Bridge + ?Sized> Bridge for &B {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        (**self).request(method, params, timeout)
    }

    fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        (**self).notify(method, params)
    }

    fn upload(&self, name: &str, bytes: Vec<u8>, timeout: Duration) -> Result<String, UploadError> {
        (**self).upload(name, bytes, timeout)
    }

    fn drain_events(&self) -> Vec<BridgeEvent> {
        (**self).drain_events()
    }
}
