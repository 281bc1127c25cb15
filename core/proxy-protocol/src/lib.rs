//! Wire protocol pieces shared by every role of the build service proxy.
//!
//! This crate knows how the daemon frames its IPC stream, how to pull a
//! message code and its payload out of a frame, and what the on-disk
//! handshake between short-lived clients and the persistent server looks
//! like. It deliberately decodes only the handful of message codes needed
//! for build status tracking and request rewriting; framing never depends
//! on recognizing a message.

pub mod frame;
pub mod handshake;
pub mod message;

pub use frame::{FrameCodec, FrameState, FramingError, FRAME_HEADER_LEN, MAX_BODY_LEN};
pub use handshake::{HandshakeCommand, HandshakeError, HandshakeMessage, SessionStatus};
pub use message::{decode_message, BlobSpan, DecodeError, Message, MessageCode, Payload};
