//! One-shot rewrite of the build request sent to the daemon.
//!
//! The first `CREATE_BUILD` request is patched so the daemon keeps building
//! after errors, optionally narrowed to a single file. The daemon validates
//! both the request JSON and its base64 `jsonRepresentation` copy, so every
//! change is applied to both documents.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use buildservice_proxy_protocol::message::encode_json_blob;
use buildservice_proxy_protocol::{FrameCodec, Message, MessageCode};
use serde_json::ser::{Formatter, PrettyFormatter};
use serde_json::{json, Map, Value};
use std::io;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RequestFlags;

const CONTINUE_KEY: &str = "continueBuildingAfterErrors";
const JSON_REPRESENTATION_KEY: &str = "jsonRepresentation";
const BUILD_COMMAND_KEY: &str = "buildCommand";

#[derive(Debug, Error)]
enum RewriteError {
    #[error("jsonRepresentation is not a string")]
    NotAString,

    #[error("jsonRepresentation is not base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct RequestModifier {
    flags: RequestFlags,
    latched: bool,
}

impl RequestModifier {
    pub fn new(flags: RequestFlags) -> Self {
        Self {
            flags,
            latched: false,
        }
    }

    /// True once no further request will be touched.
    pub fn is_latched(&self) -> bool {
        self.latched
    }

    /// Rewrites `codec`'s complete frame in place when it is the build
    /// request this modifier is waiting for. Returns whether the frame changed.
    pub fn apply(&mut self, codec: &mut FrameCodec, message: &Message) -> bool {
        if self.latched || message.code != MessageCode::CreateBuild {
            return false;
        }
        if !self.flags.continue_building_after_errors {
            debug!("No request rewrite requested");
            self.latched = true;
            return false;
        }
        let (Some(value), Some(span)) = (message.json(), message.blob_span()) else {
            return false;
        };

        let json = match rewrite_request(value, &self.flags) {
            Ok(Some(json)) => json,
            Ok(None) => {
                debug!("Build request has no {} field, left unchanged", CONTINUE_KEY);
                return false;
            }
            Err(err) => {
                warn!(error = %err, "Build request rewrite failed, forwarding unchanged");
                return false;
            }
        };

        let blob = encode_json_blob(&json, span.tag);
        match codec.modify_body(&blob, span.start, span.end) {
            Ok(()) => {
                self.latched = true;
                info!(
                    frame_len = codec.frame().len(),
                    single_file = self.flags.single_file_path.is_some(),
                    "Rewrote build request"
                );
                true
            }
            Err(err) => {
                warn!(error = %err, "Rewritten build request does not fit a frame");
                false
            }
        }
    }
}

/// Returns the rewritten request JSON, or `None` when the request does not
/// carry the continue flag at all.
fn rewrite_request(original: &Value, flags: &RequestFlags) -> Result<Option<Vec<u8>>, RewriteError> {
    let mut document = original.clone();
    let Some(request) = document.get_mut("request").and_then(Value::as_object_mut) else {
        return Ok(None);
    };
    if !request.contains_key(CONTINUE_KEY) {
        return Ok(None);
    }

    let build_command = flags
        .single_file_path
        .as_ref()
        .map(|path| json!({"command": "singleFileBuild", "files": [path]}));

    patch(request, build_command.as_ref());

    if let Some(encoded) = request.get(JSON_REPRESENTATION_KEY) {
        let encoded = encoded.as_str().ok_or(RewriteError::NotAString)?;
        let mut inner: Value = serde_json::from_slice(&STANDARD.decode(encoded)?)?;
        if let Some(inner) = inner.as_object_mut() {
            patch(inner, build_command.as_ref());
        }
        let reencoded = STANDARD.encode(to_daemon_pretty(&inner)?);
        request.insert(JSON_REPRESENTATION_KEY.to_string(), Value::String(reencoded));
    }

    Ok(Some(serde_json::to_vec(&document)?))
}

fn patch(object: &mut Map<String, Value>, build_command: Option<&Value>) {
    object.insert(CONTINUE_KEY.to_string(), Value::Bool(true));
    if let Some(command) = build_command {
        object.insert(BUILD_COMMAND_KEY.to_string(), command.clone());
    }
}

/// Two-space indented JSON with `" : "` between keys and values, the layout
/// the IDE itself uses for `jsonRepresentation`.
fn to_daemon_pretty(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, SpacedColonFormatter::new());
    serde::Serialize::serialize(value, &mut serializer)?;
    Ok(out)
}

struct SpacedColonFormatter<'a> {
    inner: PrettyFormatter<'a>,
}

impl SpacedColonFormatter<'_> {
    fn new() -> Self {
        Self {
            inner: PrettyFormatter::with_indent(b"  "),
        }
    }
}

impl Formatter for SpacedColonFormatter<'_> {
    fn begin_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_array(writer)
    }

    fn end_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_array(writer)
    }

    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        self.inner.begin_array_value(writer, first)
    }

    fn end_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_array_value(writer)
    }

    fn begin_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_object(writer)
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_object(writer)
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        self.inner.begin_object_key(writer, first)
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b" : ")
    }

    fn end_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_object_value(writer)
    }
}
