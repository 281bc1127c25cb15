//! Incremental decoder for the daemon's length-prefixed frames.
//!
//! ```text
//! [8 bytes: message id][4 bytes LE: body length][body]
//! ```
//!
//! The codec is resumable at any byte boundary. `bytes_needed()` reports how
//! many bytes take it to the next state boundary so callers can size their
//! reads to the frame instead of guessing.

use thiserror::Error;

pub const FRAME_ID_LEN: usize = 8;
pub const FRAME_LEN_FIELD_LEN: usize = 4;
pub const FRAME_HEADER_LEN: usize = FRAME_ID_LEN + FRAME_LEN_FIELD_LEN;
pub const MAX_BODY_LEN: usize = 256 * 1024 * 1024; // 256MB

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    ReadingId,
    ReadingLen,
    ReadingBody,
    Complete,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame body length {len} exceeds the {max} byte limit")]
    BodyTooLarge { len: usize, max: usize },

    #[error("stream ended with {missing} bytes missing from the current frame")]
    Truncated { missing: usize },
}

#[derive(Debug)]
pub struct FrameCodec {
    state: FrameState,
    buffer: Vec<u8>,
    // Bytes left before the next state boundary.
    remaining: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            state: FrameState::ReadingId,
            buffer: Vec::with_capacity(FRAME_HEADER_LEN),
            remaining: FRAME_ID_LEN,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == FrameState::Complete
    }

    /// True when no byte of the next frame has been consumed yet.
    pub fn is_at_boundary(&self) -> bool {
        self.state == FrameState::ReadingId && self.buffer.is_empty()
    }

    /// Exact number of bytes that bring the codec to its next state boundary.
    /// Zero once a frame is complete.
    pub fn bytes_needed(&self) -> usize {
        self.remaining
    }

    /// Consumes bytes up to the end of the current frame.
    ///
    /// Returns how many bytes of `bytes` were consumed; anything past the end
    /// of the frame is left for the caller to feed after `reset()`.
    pub fn feed(&mut self, mut bytes: &[u8]) -> Result<usize, FramingError> {
        let mut consumed = 0;

        while !bytes.is_empty() && self.state != FrameState::Complete {
            let take = self.remaining.min(bytes.len());
            self.buffer.extend_from_slice(&bytes[..take]);
            self.remaining -= take;
            consumed += take;
            bytes = &bytes[take..];

            if self.remaining == 0 {
                self.advance()?;
            }
        }

        Ok(consumed)
    }

    fn advance(&mut self) -> Result<(), FramingError> {
        match self.state {
            FrameState::ReadingId => {
                self.state = FrameState::ReadingLen;
                self.remaining = FRAME_LEN_FIELD_LEN;
            }
            FrameState::ReadingLen => {
                let len = self.length_field();
                if len > MAX_BODY_LEN {
                    return Err(FramingError::BodyTooLarge {
                        len,
                        max: MAX_BODY_LEN,
                    });
                }
                self.buffer.reserve(len);
                if len == 0 {
                    self.state = FrameState::Complete;
                } else {
                    self.state = FrameState::ReadingBody;
                    self.remaining = len;
                }
            }
            FrameState::ReadingBody => {
                self.state = FrameState::Complete;
            }
            FrameState::Complete => {}
        }
        Ok(())
    }

    fn length_field(&self) -> usize {
        let mut field = [0u8; FRAME_LEN_FIELD_LEN];
        field.copy_from_slice(&self.buffer[FRAME_ID_LEN..FRAME_HEADER_LEN]);
        u32::from_le_bytes(field) as usize
    }

    /// Raw bytes of the frame read so far (header included).
    pub fn frame(&self) -> &[u8] {
        &self.buffer
    }

    pub fn body(&self) -> &[u8] {
        self.buffer.get(FRAME_HEADER_LEN..).unwrap_or(&[])
    }

    /// Returns to `ReadingId`. Only valid on a complete frame.
    pub fn reset(&mut self) {
        assert_eq!(
            self.state,
            FrameState::Complete,
            "reset called on an incomplete frame"
        );
        assert_eq!(self.remaining, 0, "frame byte budget out of balance");
        self.buffer.clear();
        self.state = FrameState::ReadingId;
        self.remaining = FRAME_ID_LEN;
    }

    /// Checks the codec at end of stream: a partially read frame is an error.
    pub fn finish(&self) -> Result<(), FramingError> {
        if self.is_at_boundary() || self.is_complete() {
            return Ok(());
        }
        let missing = match self.state {
            FrameState::ReadingId => self.remaining + FRAME_LEN_FIELD_LEN,
            _ => self.remaining,
        };
        Err(FramingError::Truncated { missing })
    }

    /// Replaces `frame[start..end]` with `replacement` and rewrites the
    /// length field so it matches the new body. The header is never touched.
    pub fn modify_body(
        &mut self,
        replacement: &[u8],
        start: usize,
        end: usize,
    ) -> Result<(), FramingError> {
        assert!(self.is_complete(), "modify_body on an incomplete frame");
        assert!(start >= FRAME_HEADER_LEN, "modify_body would touch the header");
        assert!(
            start <= end && end <= self.buffer.len(),
            "modify_body range {}..{} outside frame of {} bytes",
            start,
            end,
            self.buffer.len()
        );

        let new_len = self.buffer.len() - (end - start) + replacement.len() - FRAME_HEADER_LEN;
        if new_len > MAX_BODY_LEN {
            return Err(FramingError::BodyTooLarge {
                len: new_len,
                max: MAX_BODY_LEN,
            });
        }

        self.buffer.splice(start..end, replacement.iter().copied());
        self.buffer[FRAME_ID_LEN..FRAME_HEADER_LEN].copy_from_slice(&(new_len as u32).to_le_bytes());
        Ok(())
    }
}

/// Builds a frame from an id and a body.
pub fn encode_frame(id: u64, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&id.to_le_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(body);
    frame
}
