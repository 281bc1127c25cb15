//! Tracking state shared by both relay directions.

use buildservice_proxy_protocol::Message;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::relay::Direction;
use crate::tracker::{BuildOperationStatus, BuildProgressTracker, StatusSink};

struct Inner {
    tracker: BuildProgressTracker,
    operation: BuildOperationStatus,
}

/// Frames from the two directions interleave in real time; every frame is
/// observed under one lock so tracker transitions never overlap.
pub struct SharedState {
    inner: Mutex<Inner>,
}

impl SharedState {
    pub fn new(sink: Option<StatusSink>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tracker: BuildProgressTracker::new(sink),
                operation: BuildOperationStatus::default(),
            }),
        }
    }

    pub fn observe(&self, direction: Direction, message: &Message) {
        let mut inner = self.lock();
        inner
            .operation
            .observe(direction, &message.code, Instant::now());
        inner.tracker.observe(direction, message);
    }

    pub fn is_building(&self) -> bool {
        self.lock().operation.is_building(Instant::now())
    }

    /// Starts target tracking afresh for a newly attached client.
    pub fn begin_build(&self, sink: Option<StatusSink>) {
        self.lock().tracker = BuildProgressTracker::new(sink);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::tests::SharedBuffer;
    use buildservice_proxy_protocol::decode_message;
    use buildservice_proxy_protocol::frame::encode_frame;
    use buildservice_proxy_protocol::message::{encode_code, json_body, task_id_body};
    use serde_json::json;

    fn message(body: Vec<u8>) -> Message {
        decode_message(&encode_frame(0, &body)).expect("decode")
    }

    #[test]
    fn tracks_building_across_directions() {
        let state = SharedState::new(None);
        assert!(!state.is_building());
        state.observe(Direction::ClientToServer, &message(encode_code("BUILD_START")));
        assert!(state.is_building());
        state.observe(
            Direction::ServerToClient,
            &message(encode_code("BUILD_OPERATION_ENDED")),
        );
        assert!(!state.is_building());
    }

    #[test]
    fn begin_build_switches_status_sink() {
        let first = SharedBuffer::default();
        let second = SharedBuffer::default();
        let state = SharedState::new(Some(Box::new(first.clone())));

        let started = message(json_body(
            "BUILD_TARGET_STARTED",
            &json!({"guid": "G", "id": 1, "info": {"name": "A", "projectInfo": {"path": "P"}}}),
        ));
        let ended = message(task_id_body("BUILD_TARGET_ENDED", 1));

        state.observe(Direction::ServerToClient, &started);
        state.observe(Direction::ServerToClient, &ended);

        state.begin_build(Some(Box::new(second.clone())));
        state.observe(Direction::ServerToClient, &started);
        state.observe(Direction::ServerToClient, &ended);

        assert_eq!(first.contents(), "Success:P::A:end_tail\n");
        assert_eq!(second.contents(), "Success:P::A:end_tail\n");
    }
}
