use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Duration;

use reqwest::blocking::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::UploadError;

#[derive(Deserialize)]
struct UploadReply {
    item: UploadItem,
}

#[derive(Deserialize)]
struct UploadItem {
    path: String,
}

/// Result of an upload running on its own worker thread.
pub struct UploadHandle {
    name: String,
    rx: Receiver<Result<String, UploadError>>,
}

impl UploadHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block up to `timeout` for the server-side path.
    pub fn wait(self, timeout: Duration) -> Result<String, UploadError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(UploadError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(UploadError::WorkerGone),
        }
    }

    /// The outcome if the upload already finished.
    pub fn try_result(&self) -> Option<Result<String, UploadError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(UploadError::WorkerGone)),
        }
    }
}

/// Start a multipart upload of `bytes` as `name` to `url` without blocking.
pub fn spawn_upload(url: &str, name: &str, bytes: Vec<u8>, timeout: Duration) -> UploadHandle {
    let (tx, rx) = mpsc::sync_channel(1);
    let handle = UploadHandle {
        name: name.to_string(),
        rx,
    };

    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        let _ = tx.send(Err(UploadError::InvalidName(name.to_string())));
        return handle;
    }

    let url = url.to_string();
    let name = name.to_string();
    let spawned = thread::Builder::new()
        .name("autopipette-upload".to_string())
        .spawn(move || {
            let result = upload(&url, &name, bytes, timeout);
            match &result {
                Ok(path) => info!(name = %name, path = %path, "upload complete"),
                Err(err) => warn!(name = %name, error = %err, "upload failed"),
            }
            let _ = tx.send(result);
        });
    if let Err(err) = spawned {
        warn!(error = %err, "could not start upload worker");
    }
    handle
}

fn upload(url: &str, name: &str, bytes: Vec<u8>, timeout: Duration) -> Result<String, UploadError> {
    debug!(url, name, size = bytes.len(), "uploading");
    let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
    let part = Part::bytes(bytes)
        .file_name(name.to_string())
        .mime_str("application/octet-stream")?;
    let form = Form::new().part("file", part);

    let response = client.post(url).multipart(form).send()?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(UploadError::Status {
            status: status.as_u16(),
            body,
        });
    }
    let body = response.text()?;
    let reply: UploadReply = serde_json::from_str(&body)
        .map_err(|err| UploadError::MalformedResponse(format!("{err}: {body}")))?;
    Ok(reply.item.path)
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;

    use super::*;

    /// One-shot HTTP server returning `status` and `body`; yields the request.
    fn http_once(status: &'static str, body: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind should succeed");
        let url = format!(
            "http://{}/server/files/upload",
            listener.local_addr().expect("local addr")
        );
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept should succeed");
            let mut reader = BufReader::new(stream);
            let mut head = String::new();
            let mut length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("header line");
                if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    length = v.trim().parse().expect("numeric length");
                }
                head.push_str(&line);
                if line == "\r\n" {
                    break;
                }
            }
            let mut payload = vec![0u8; length];
            if length > 0 {
                reader.read_exact(&mut payload).expect("request body");
            } else {
                // Chunked body: read what arrives until the client goes quiet.
                reader
                    .get_ref()
                    .set_read_timeout(Some(Duration::from_millis(300)))
                    .expect("read timeout");
                let _ = reader.read_to_end(&mut payload);
            }
            let mut stream = reader.into_inner();
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .expect("response write");
            head + &String::from_utf8_lossy(&payload)
        });
        (url, handle)
    }

    #[test]
    fn returns_item_path() {
        let (url, server) = http_once(
            "201 Created",
            r#"{"item":{"path":"job.gcode","root":"gcodes"},"action":"create_file"}"#,
        );
        let handle = spawn_upload(&url, "job.gcode", b"G28 Z\n".to_vec(), Duration::from_secs(5));
        assert_eq!(handle.name(), "job.gcode");
        let path = handle.wait(Duration::from_secs(10)).expect("upload should succeed");
        assert_eq!(path, "job.gcode");

        let request = server.join().expect("server thread");
        assert!(request.starts_with("POST /server/files/upload"));
        assert!(request.contains("name=\"file\""));
        assert!(request.contains("filename=\"job.gcode\""));
        assert!(request.contains("G28 Z"));
    }

    #[test]
    fn surfaces_http_status() {
        let (url, server) = http_once("500 Internal Server Error", r#"{"error":"disk full"}"#);
        let err = spawn_upload(&url, "job.gcode", Vec::new(), Duration::from_secs(5))
            .wait(Duration::from_secs(10))
            .expect_err("500 is a failure");
        assert!(matches!(err, UploadError::Status { status: 500, .. }));
        server.join().expect("server thread");
    }

    #[test]
    fn rejects_missing_path() {
        let (url, server) = http_once("201 Created", r#"{"result":"ok"}"#);
        let err = spawn_upload(&url, "job.gcode", Vec::new(), Duration::from_secs(5))
            .wait(Duration::from_secs(10))
            .expect_err("reply lacks item.path");
        assert!(matches!(err, UploadError::MalformedResponse(_)));
        server.join().expect("server thread");
    }

    #[test]
    fn rejects_path_like_names() {
        let handle = spawn_upload("http://127.0.0.1:9/", "../etc/passwd", Vec::new(), Duration::from_secs(1));
        assert!(matches!(
            handle.try_result(),
            Some(Err(UploadError::InvalidName(_)))
        ));
    }
}
