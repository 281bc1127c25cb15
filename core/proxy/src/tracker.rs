//! Per-target build progress, reconstructed from daemon traffic.
//!
//! The daemon announces a target with `BUILD_TARGET_STARTED`, reports every
//! finished task with the concatenated GUIDs of the targets it belonged to,
//! and closes the target with `BUILD_TARGET_ENDED` carrying the task id it
//! was started with. Terminal states are written to the status sink as
//! `<Status>:<target_id>:end_tail` lines, at most once per target.

use buildservice_proxy_protocol::{Message, MessageCode, Payload};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::relay::Direction;
use crate::signature::SignatureIndex;

/// How long a cancelled operation may go without `BUILD_OPERATION_ENDED`
/// before it stops blocking pipe hand-off.
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);

pub type StatusSink = Box<dyn Write + Send>;

/// Creates (truncating) the status file. Failures are logged and disable
/// reporting rather than the build.
pub fn open_status_sink(path: &Path) -> Option<StatusSink> {
    match fs_err::File::create(path) {
        Ok(file) => Some(Box::new(file)),
        Err(err) => {
            warn!(error = %err, "Status file unavailable, not reporting targets");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    Success,
    Fail,
    Cancelled,
}

impl TargetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetStatus::Success => "Success",
            TargetStatus::Fail => "Fail",
            TargetStatus::Cancelled => "Cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTargetSession {
    pub target_id: String,
    pub task_id: u64,
    pub build_started: bool,
    pub build_ended: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TargetStarted {
    guid: String,
    id: u64,
    info: TargetInfo,
}

#[derive(Debug, Deserialize)]
struct TargetInfo {
    name: String,
    #[serde(rename = "projectInfo")]
    project_info: ProjectInfo,
}

#[derive(Debug, Deserialize)]
struct ProjectInfo {
    path: String,
}

#[derive(Debug, Deserialize)]
struct TaskEnded {
    #[serde(default)]
    signature: Vec<u64>,
    #[serde(default)]
    status: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracker
// ─────────────────────────────────────────────────────────────────────────────

pub struct BuildProgressTracker {
    sessions: HashMap<String, BuildTargetSession>,
    task_to_guid: HashMap<u64, String>,
    index: SignatureIndex<(String, String)>,
    reported: HashSet<String>,
    cancelled: bool,
    sink: Option<StatusSink>,
}

impl BuildProgressTracker {
    pub fn new(sink: Option<StatusSink>) -> Self {
        Self {
            sessions: HashMap::new(),
            task_to_guid: HashMap::new(),
            index: SignatureIndex::new(),
            reported: HashSet::new(),
            cancelled: false,
            sink,
        }
    }

    #[cfg(test)]
    pub fn session(&self, guid: &str) -> Option<&BuildTargetSession> {
        self.sessions.get(guid)
    }

    pub fn is_reported(&self, target_id: &str) -> bool {
        self.reported.contains(target_id)
    }

    pub fn observe(&mut self, direction: Direction, message: &Message) {
        match (direction, &message.code) {
            (Direction::ServerToClient, MessageCode::BuildTargetStarted) => {
                if let Some(value) = message.json() {
                    if let Err(err) = self.on_target_started(value) {
                        debug!(error = %err, "Unexpected BUILD_TARGET_STARTED payload");
                    }
                }
            }
            (Direction::ServerToClient, MessageCode::BuildTaskEnded) => {
                if let Some(value) = message.json() {
                    if let Err(err) = self.on_task_ended(value) {
                        debug!(error = %err, "Unexpected BUILD_TASK_ENDED payload");
                    }
                }
            }
            (Direction::ServerToClient, MessageCode::BuildTargetEnded) => {
                if let Payload::TaskId(task_id) = message.payload {
                    self.on_target_ended(task_id);
                }
            }
            (Direction::ClientToServer, MessageCode::BuildCancel) => {
                debug!("Build cancelled by client");
                self.cancelled = true;
            }
            (Direction::ClientToServer, MessageCode::BuildStart) => {
                self.cancelled = false;
            }
            _ => {}
        }
    }

    fn on_target_started(&mut self, value: &Value) -> Result<(), serde_json::Error> {
        let started = TargetStarted::deserialize(value)?;
        let target_id = format!("{}::{}", started.info.project_info.path, started.info.name);
        debug!(target_id = %target_id, task_id = started.id, "Target started");

        self.index
            .insert(started.guid.as_bytes(), (target_id.clone(), started.guid.clone()));
        self.task_to_guid.insert(started.id, started.guid.clone());
        self.sessions.insert(
            started.guid,
            BuildTargetSession {
                target_id,
                task_id: started.id,
                build_started: true,
                build_ended: false,
            },
        );
        Ok(())
    }

    fn on_task_ended(&mut self, value: &Value) -> Result<(), serde_json::Error> {
        let ended = TaskEnded::deserialize(value)?;
        if ended.status == 0 || ended.signature.is_empty() {
            return Ok(());
        }

        // Values outside a byte can never be part of an ASCII GUID.
        let haystack: Vec<u8> = ended
            .signature
            .iter()
            .map(|code| u8::try_from(*code).unwrap_or(0))
            .collect();

        let failed: Vec<String> = (0..haystack.len())
            .filter_map(|offset| self.index.search_any(&haystack, offset))
            .map(|(target_id, _)| target_id.clone())
            .collect();
        for target_id in failed {
            self.emit(&target_id, TargetStatus::Fail);
        }
        Ok(())
    }

    fn on_target_ended(&mut self, task_id: u64) {
        let Some(guid) = self.task_to_guid.get(&task_id) else {
            debug!(task_id, "BUILD_TARGET_ENDED for unknown task");
            return;
        };
        let Some(session) = self.sessions.get_mut(guid) else {
            return;
        };
        if session.build_ended {
            return;
        }
        session.build_ended = true;
        let target_id = session.target_id.clone();
        debug!(
            target_id = %target_id,
            task_id = session.task_id,
            started = session.build_started,
            "Target ended"
        );
        self.index.remove(guid.as_bytes());
        if self.index.is_empty() {
            debug!("No targets running");
        } else {
            debug!(running = self.index.len(), "Targets still running");
        }

        let status = if self.cancelled {
            TargetStatus::Cancelled
        } else {
            TargetStatus::Success
        };
        self.emit(&target_id, status);
    }

    fn emit(&mut self, target_id: &str, status: TargetStatus) {
        if self.is_reported(target_id) {
            debug!(target_id = %target_id, "Target already reported");
            return;
        }
        self.reported.insert(target_id.to_string());
        info!(target_id = %target_id, status = status.as_str(), "Target finished");

        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let record = format!("{}:{}:end_tail\n", status.as_str(), target_id);
        if let Err(err) = sink.write_all(record.as_bytes()).and_then(|_| sink.flush()) {
            warn!(error = %err, target_id = %target_id, "Failed to write target status");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Build operation
// ─────────────────────────────────────────────────────────────────────────────

/// Whether a build operation is in flight, which decides if the server may
/// hand the daemon to another client.
#[derive(Debug, Default)]
pub struct BuildOperationStatus {
    building: bool,
    cancelled_at: Option<Instant>,
}

impl BuildOperationStatus {
    pub fn observe(&mut self, direction: Direction, code: &MessageCode, now: Instant) {
        match (direction, code) {
            (Direction::ClientToServer, MessageCode::BuildStart) => {
                self.building = true;
                self.cancelled_at = None;
            }
            (Direction::ClientToServer, MessageCode::BuildCancel) => {
                if self.building && self.cancelled_at.is_none() {
                    self.cancelled_at = Some(now);
                }
            }
            (Direction::ServerToClient, MessageCode::BuildOperationEnded) => {
                self.building = false;
                self.cancelled_at = None;
            }
            _ => {}
        }
    }

    pub fn is_building(&self, now: Instant) -> bool {
        match self.cancelled_at {
            Some(at) => self.building && now.saturating_duration_since(at) < CANCEL_GRACE,
            None => self.building,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use buildservice_proxy_protocol::decode_message;
    use buildservice_proxy_protocol::frame::encode_frame;
    use buildservice_proxy_protocol::message::{encode_code, json_body, task_id_body};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8(self.0.lock().expect("lock").clone()).expect("utf8")
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn message(body: Vec<u8>) -> Message {
        decode_message(&encode_frame(1, &body)).expect("decode")
    }

    fn target_started(guid: &str, id: u64, path: &str, name: &str) -> Message {
        message(json_body(
            "BUILD_TARGET_STARTED",
            &json!({
                "guid": guid,
                "id": id,
                "info": {"name": name, "projectInfo": {"path": path, "isPackage": false}}
            }),
        ))
    }

    fn task_ended(id: u64, signature: &[u8], status: i64) -> Message {
        message(json_body(
            "BUILD_TASK_ENDED",
            &json!({"id": id, "signature": signature, "signalled": false, "status": status}),
        ))
    }

    fn target_ended(task_id: u64) -> Message {
        message(task_id_body("BUILD_TARGET_ENDED", task_id))
    }

    fn bare(code: &str) -> Message {
        message(encode_code(code))
    }

    fn tracker() -> (BuildProgressTracker, SharedBuffer) {
        let buffer = SharedBuffer::default();
        (BuildProgressTracker::new(Some(Box::new(buffer.clone()))), buffer)
    }

    use Direction::{ClientToServer as Client, ServerToClient as Server};

    #[test]
    fn failed_task_reports_target_once() {
        let (mut tracker, out) = tracker();
        tracker.observe(Server, &target_started("GUID-1", 0, "App", "Foo"));

        let mut signature = b"\x00P2:target-".to_vec();
        signature.extend_from_slice(b"GUID-1");
        signature.extend_from_slice(b"-SDKROOT:iphonesimulator");
        tracker.observe(Server, &task_ended(14, &signature, 7));
        tracker.observe(Server, &task_ended(15, &signature, 7));
        tracker.observe(Server, &target_ended(0));

        assert_eq!(out.contents(), "Fail:App::Foo:end_tail\n");
        assert!(tracker.is_reported("App::Foo"));
        assert!(tracker.session("GUID-1").expect("session").build_ended);
    }

    #[test]
    fn successful_task_reports_nothing_until_target_ends() {
        let (mut tracker, out) = tracker();
        tracker.observe(Server, &target_started("GUID-1", 3, "/p/App.xcodeproj", "App"));
        tracker.observe(Server, &task_ended(14, b"GUID-1", 0));
        assert_eq!(out.contents(), "");

        tracker.observe(Server, &target_ended(3));
        assert_eq!(out.contents(), "Success:/p/App.xcodeproj::App:end_tail\n");
    }

    #[test]
    fn cancel_turns_success_into_cancelled() {
        let (mut tracker, out) = tracker();
        tracker.observe(Server, &target_started("G", 2, "App", "Foo"));
        tracker.observe(Client, &bare("BUILD_CANCEL"));
        tracker.observe(Server, &target_ended(2));
        assert_eq!(out.contents(), "Cancelled:App::Foo:end_tail\n");
    }

    #[test]
    fn build_start_clears_cancellation() {
        let (mut tracker, out) = tracker();
        tracker.observe(Client, &bare("BUILD_CANCEL"));
        tracker.observe(Client, &bare("BUILD_START"));
        tracker.observe(Server, &target_started("G", 2, "App", "Foo"));
        tracker.observe(Server, &target_ended(2));
        assert_eq!(out.contents(), "Success:App::Foo:end_tail\n");
    }

    #[test]
    fn duplicate_target_ended_is_idempotent() {
        let (mut tracker, out) = tracker();
        tracker.observe(Server, &target_started("GA", 1, "P", "A"));
        tracker.observe(Server, &target_started("GB", 2, "P", "B"));
        for _ in 0..3 {
            tracker.observe(Server, &target_ended(1));
            tracker.observe(Server, &target_ended(2));
        }
        tracker.observe(Server, &target_ended(99));
        assert_eq!(out.contents(), "Success:P::A:end_tail\nSuccess:P::B:end_tail\n");
    }

    #[test]
    fn ended_target_is_no_longer_matched() {
        let (mut tracker, out) = tracker();
        tracker.observe(Server, &target_started("GA", 1, "P", "A"));
        tracker.observe(Server, &target_ended(1));
        tracker.observe(Server, &target_started("GB", 2, "P", "B"));
        tracker.observe(Server, &task_ended(5, b"GAGB", 1));
        assert_eq!(out.contents(), "Success:P::A:end_tail\nFail:P::B:end_tail\n");
    }

    #[test]
    fn direction_matters() {
        let (mut tracker, out) = tracker();
        tracker.observe(Client, &target_started("G", 1, "P", "A"));
        tracker.observe(Server, &target_ended(1));
        assert_eq!(out.contents(), "");

        tracker.observe(Server, &target_started("G", 1, "P", "A"));
        tracker.observe(Server, &bare("BUILD_CANCEL"));
        tracker.observe(Server, &target_ended(1));
        assert_eq!(out.contents(), "Success:P::A:end_tail\n");
    }

    #[test]
    fn malformed_payload_is_skipped() {
        let (mut tracker, out) = tracker();
        tracker.observe(Server, &message(json_body("BUILD_TARGET_STARTED", &json!({"guid": 5}))));
        tracker.observe(Server, &message(json_body("BUILD_TASK_ENDED", &json!({"signature": "x", "status": 1}))));
        assert_eq!(out.contents(), "");
    }

    #[test]
    fn works_without_sink() {
        let mut tracker = BuildProgressTracker::new(None);
        tracker.observe(Server, &target_started("G", 1, "P", "A"));
        tracker.observe(Server, &target_ended(1));
        assert!(tracker.is_reported("P::A"));
    }

    #[test]
    fn operation_status_follows_start_and_end() {
        let now = Instant::now();
        let mut status = BuildOperationStatus::default();
        assert!(!status.is_building(now));

        status.observe(Client, &MessageCode::BuildStart, now);
        assert!(status.is_building(now));
        status.observe(Server, &MessageCode::BuildOperationEnded, now);
        assert!(!status.is_building(now));
    }

    #[test]
    fn cancelled_operation_clears_after_grace() {
        let start = Instant::now();
        let mut status = BuildOperationStatus::default();
        status.observe(Client, &MessageCode::BuildStart, start);
        status.observe(Client, &MessageCode::BuildCancel, start);

        assert!(status.is_building(start + Duration::from_secs(1)));
        assert!(!status.is_building(start + CANCEL_GRACE));

        status.observe(Client, &MessageCode::BuildStart, start + CANCEL_GRACE);
        assert!(status.is_building(start + CANCEL_GRACE * 3));
    }
}
