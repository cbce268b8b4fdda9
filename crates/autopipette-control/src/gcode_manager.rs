//! Hands compiled G-code to the bridge.
//!
//! Every job is written to `<job_dir>/<name>.gcode` before it is uploaded,
//! so a failed hand-off never loses the instructions: the job stays pending
//! until `retry` succeeds or a newer job replaces it. In collect mode jobs
//! accumulate in memory instead and are shipped once by the caller.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use autopipette_compiler::to_gcode;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::error::{DispatchError, Result};

/// JSON-RPC method that starts printing an uploaded file.
pub const PRINT_START: &str = "printer.print.start";

/// A named batch of G-code lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    pub lines: Vec<String>,
}

impl Job {
    pub fn new(name: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            name: name.into(),
            lines,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.gcode", self.name)
    }

    pub fn text(&self) -> String {
        to_gcode(&self.lines)
    }
}

/// Outcome of handing instructions to the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Submission {
    /// Buffered in collect mode; nothing was sent.
    Collected { lines: usize },
    /// Uploaded and started on the machine.
    Started {
        job: String,
        server_path: String,
        lines: usize,
    },
}

#[derive(Debug)]
pub struct GcodeManager {
    job_dir: PathBuf,
    request_timeout: Duration,
    upload_timeout: Duration,
    collecting: Option<Vec<String>>,
    pending: Option<Job>,
    sequence: u64,
}

impl GcodeManager {
    pub fn new(
        job_dir: impl Into<PathBuf>,
        request_timeout: Duration,
        upload_timeout: Duration,
    ) -> Self {
        Self {
            job_dir: job_dir.into(),
            request_timeout,
            upload_timeout,
            collecting: None,
            pending: None,
            sequence: 0,
        }
    }

    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    /// The job kept after a failed hand-off.
    pub fn pending(&self) -> Option<&Job> {
        self.pending.as_ref()
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting.is_some()
    }

    /// Start buffering submissions. Returns false if already collecting, in
    /// which case the existing buffer keeps growing.
    pub fn begin_collect(&mut self) -> bool {
        if self.collecting.is_some() {
            return false;
        }
        self.collecting = Some(Vec::new());
        debug!("collect mode on");
        true
    }

    /// Stop buffering and return what was collected.
    pub fn end_collect(&mut self) -> Vec<String> {
        let lines = self.collecting.take().unwrap_or_default();
        debug!(lines = lines.len(), "collect mode off");
        lines
    }

    /// A fresh job name: `job-<unix seconds>-<sequence>`.
    pub fn next_name(&mut self) -> String {
        self.sequence += 1;
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("job-{secs}-{:04}", self.sequence)
    }

    /// Collect `lines`, or ship them as a new job.
    pub fn submit(
        &mut self,
        bridge: Option<&dyn Bridge>,
        lines: Vec<String>,
    ) -> Result<Submission> {
        if let Some(buffer) = self.collecting.as_mut() {
            let count = lines.len();
            buffer.extend(lines);
            return Ok(Submission::Collected { lines: count });
        }
        let job = Job::new(self.next_name(), lines);
        self.send(bridge, job)
    }

    /// Write, upload and start `job`. On failure the job becomes pending.
    pub fn send(&mut self, bridge: Option<&dyn Bridge>, job: Job) -> Result<Submission> {
        let path = self.write(&job)?;
        match self.hand_off(bridge, &job) {
            Ok(server_path) => {
                info!(job = %job.name, %server_path, lines = job.lines.len(), "job started");
                if self.pending.as_ref().is_some_and(|p| p.name == job.name) {
                    self.pending = None;
                }
                Ok(Submission::Started {
                    job: job.name,
                    server_path,
                    lines: job.lines.len(),
                })
            }
            Err(reason) => {
                warn!(job = %job.name, path = %path.display(), reason = %reason, "job hand-off failed");
                let name = job.name.clone();
                self.pending = Some(job);
                Err(DispatchError::Handoff { job: name, reason })
            }
        }
    }

    /// Re-submit the pending job.
    pub fn retry(&mut self, bridge: Option<&dyn Bridge>) -> Result<Submission> {
        let job = self.pending.take().ok_or(DispatchError::NothingToRetry)?;
        info!(job = %job.name, "retrying job");
        self.send(bridge, job)
    }

    /// Write the job file and return its path.
    pub fn write(&self, job: &Job) -> Result<PathBuf> {
        let path = self.job_dir.join(job.file_name());
        std::fs::create_dir_all(&self.job_dir).map_err(|source| DispatchError::File {
            action: "failed to create job directory",
            path: self.job_dir.clone(),
            source,
        })?;
        std::fs::write(&path, job.text()).map_err(|source| DispatchError::File {
            action: "failed to write job",
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "job written");
        Ok(path)
    }

    fn hand_off(
        &self,
        bridge: Option<&dyn Bridge>,
        job: &Job,
    ) -> std::result::Result<String, String> {
        let bridge = bridge.ok_or_else(|| "no bridge connection".to_string())?;
        if !bridge.is_connected() {
            return Err("bridge is not connected".to_string());
        }
        let server_path = bridge
            .upload(&job.file_name(), job.text().into_bytes(), self.upload_timeout)
            .map_err(|err| err.to_string())?;
        bridge
            .request(PRINT_START, json!({ "filename": server_path }), self.request_timeout)
            .map_err(|err| err.to_string())?;
        Ok(server_path)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use autopipette_transport::{BridgeEvent, TransportError, UploadError};
    use serde_json::Value;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        offline: Cell<bool>,
        uploads: RefCell<Vec<(String, String)>>,
        requests: RefCell<Vec<(String, Value)>>,
    }

    impl Bridge for Recorder {
        fn is_connected(&self) -> bool {
            !self.offline.get()
        }

        fn request(
            &self,
            method: &str,
            params: Value,
            _: Duration,
        ) -> std::result::Result<Value, TransportError> {
            self.requests.borrow_mut().push((method.to_string(), params));
            Ok(Value::from("ok"))
        }

        fn notify(&self, _: &str, _: Value) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        fn upload(
            &self,
            name: &str,
            bytes: Vec<u8>,
            _: Duration,
        ) -> std::result::Result<String, UploadError> {
            let text = String::from_utf8(bytes).expect("utf8 gcode");
            self.uploads.borrow_mut().push((name.to_string(), text));
            Ok(format!("gcodes/{name}"))
        }

        fn drain_events(&self) -> Vec<BridgeEvent> {
            Vec::new()
        }
    }

    fn manager(dir: &Path) -> GcodeManager {
        GcodeManager::new(dir, Duration::from_secs(1), Duration::from_secs(1))
    }

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn send_writes_uploads_and_starts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bridge = Recorder::default();
        let mut jobs = manager(dir.path());

        let job = Job::new("transfer", lines(&["G28 Z", "G1 X1 Y2 F100"]));
        let outcome = jobs.send(Some(&bridge), job).expect("send");
        assert_eq!(
            outcome,
            Submission::Started {
                job: "transfer".to_string(),
                server_path: "gcodes/transfer.gcode".to_string(),
                lines: 2
            }
        );

        let written =
            std::fs::read_to_string(dir.path().join("transfer.gcode")).expect("job file");
        assert_eq!(written, "G28 Z\nG1 X1 Y2 F100\n");
        assert_eq!(bridge.uploads.borrow()[0].1, written);
        assert_eq!(
            bridge.requests.borrow()[0],
            (PRINT_START.to_string(), json!({"filename": "gcodes/transfer.gcode"}))
        );
    }

    #[test]
    fn failed_hand_off_keeps_job_for_retry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bridge = Recorder::default();
        bridge.offline.set(true);
        let mut jobs = manager(dir.path());

        let err = jobs
            .submit(Some(&bridge), lines(&["G28 Z"]))
            .expect_err("offline bridge");
        assert!(matches!(err, DispatchError::Handoff { .. }));
        let pending = jobs.pending().expect("job kept").clone();
        assert!(dir.path().join(pending.file_name()).exists());
        assert!(bridge.uploads.borrow().is_empty());

        bridge.offline.set(false);
        let outcome = jobs.retry(Some(&bridge)).expect("retry");
        assert!(matches!(outcome, Submission::Started { ref job, .. } if *job == pending.name));
        assert!(jobs.pending().is_none());
        assert!(matches!(jobs.retry(Some(&bridge)), Err(DispatchError::NothingToRetry)));
    }

    #[test]
    fn missing_bridge_is_a_failed_hand_off() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut jobs = manager(dir.path());
        let err = jobs.submit(None, lines(&["G28 Z"])).expect_err("no bridge");
        assert!(
            matches!(err, DispatchError::Handoff { ref reason, .. } if reason.contains("no bridge"))
        );
        assert!(jobs.pending().is_some());
    }

    #[test]
    fn collect_mode_buffers_instead_of_sending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bridge = Recorder::default();
        let mut jobs = manager(dir.path());

        assert!(jobs.begin_collect());
        assert!(!jobs.begin_collect());
        let outcome = jobs.submit(Some(&bridge), lines(&["A", "B"])).expect("collect");
        assert_eq!(outcome, Submission::Collected { lines: 2 });
        jobs.submit(Some(&bridge), lines(&["C"])).expect("collect");

        assert_eq!(jobs.end_collect(), lines(&["A", "B", "C"]));
        assert!(!jobs.is_collecting());
        assert!(bridge.uploads.borrow().is_empty());
    }

    #[test]
    fn job_names_are_unique() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut jobs = manager(dir.path());
        let a = jobs.next_name();
        let b = jobs.next_name();
        assert_ne!(a, b);
        assert!(a.starts_with("job-"));
    }
}
