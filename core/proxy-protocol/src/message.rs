//! Message decoding for complete frames.
//!
//! A body starts with a short string holding the message code
//! (`0xA0 + len` prefix, or `0xD9 len` for longer codes). What follows is
//! decoded only as far as status tracking and request rewriting need:
//!
//! ```text
//! \xb4BUILD_TARGET_STARTED \xc5 <u16 BE len> {json...}
//! \xb2BUILD_TARGET_ENDED   \x91 \xd3 <u64 BE task id>
//! ```
//!
//! A tag byte `0xC4`/`0xC5`/`0xC6` introduces a JSON blob with a 1/2/4 byte
//! big-endian length. Unknown codes decode to `MessageCode::Unrecognized`
//! with no payload; they are never an error.

use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::frame::FRAME_HEADER_LEN;

pub const TAG_BLOB8: u8 = 0xC4;
pub const TAG_BLOB16: u8 = 0xC5;
pub const TAG_BLOB32: u8 = 0xC6;

const FIXSTR_PREFIX: u8 = 0xA0;
const FIXSTR_LAST: u8 = 0xBF;
const FIXSTR_MAX_LEN: usize = 31;
const STR8_PREFIX: u8 = 0xD9;
const FIXARRAY_FIRST: u8 = 0x90;
const FIXARRAY_LAST: u8 = 0x9F;
const INT64_PREFIX: u8 = 0xD3;
const UINT64_PREFIX: u8 = 0xCF;
const TASK_ID_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageCode {
    CreateBuild,
    CreateSession,
    BuildStart,
    BuildCancel,
    BuildTargetStarted,
    BuildTaskEnded,
    BuildTargetEnded,
    BuildOperationEnded,
    Unrecognized(String),
}

impl MessageCode {
    pub fn from_wire(name: &str) -> Self {
        match name {
            "CREATE_BUILD" => MessageCode::CreateBuild,
            "CREATE_SESSION" => MessageCode::CreateSession,
            "BUILD_START" => MessageCode::BuildStart,
            "BUILD_CANCEL" => MessageCode::BuildCancel,
            "BUILD_TARGET_STARTED" => MessageCode::BuildTargetStarted,
            "BUILD_TASK_ENDED" => MessageCode::BuildTaskEnded,
            "BUILD_TARGET_ENDED" => MessageCode::BuildTargetEnded,
            "BUILD_OPERATION_ENDED" => MessageCode::BuildOperationEnded,
            other => MessageCode::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageCode::CreateBuild => "CREATE_BUILD",
            MessageCode::CreateSession => "CREATE_SESSION",
            MessageCode::BuildStart => "BUILD_START",
            MessageCode::BuildCancel => "BUILD_CANCEL",
            MessageCode::BuildTargetStarted => "BUILD_TARGET_STARTED",
            MessageCode::BuildTaskEnded => "BUILD_TASK_ENDED",
            MessageCode::BuildTargetEnded => "BUILD_TARGET_ENDED",
            MessageCode::BuildOperationEnded => "BUILD_OPERATION_ENDED",
            MessageCode::Unrecognized(name) => name,
        }
    }
}

impl fmt::Display for MessageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location of a tagged JSON blob inside its frame, tag byte included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobSpan {
    pub tag: u8,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    None,
    Json { value: Value, span: BlobSpan },
    TaskId(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub code: MessageCode,
    pub payload: Payload,
}

impl Message {
    pub fn json(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Json { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn blob_span(&self) -> Option<BlobSpan> {
        match &self.payload {
            Payload::Json { span, .. } => Some(*span),
            _ => None,
        }
    }

    pub fn task_id(&self) -> Option<u64> {
        match self.payload {
            Payload::TaskId(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is shorter than its length field claims")]
    Incomplete,

    #[error("frame body is empty")]
    EmptyBody,

    #[error("message code prefix 0x{0:02x} is not a short string")]
    BadCodePrefix(u8),

    #[error("message code runs past the end of the body")]
    CodeOverrun,

    #[error("message code is not valid UTF-8")]
    CodeNotUtf8,

    #[error("{code} payload of {len} bytes runs past the end of the body")]
    PayloadOverrun { code: String, len: usize },

    #[error("{code} payload is not valid JSON: {source}")]
    Json {
        code: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{code} carries no task id")]
    MissingTaskId { code: String },
}

/// Decodes the message carried by a complete frame (header included).
pub fn decode_message(frame: &[u8]) -> Result<Message, DecodeError> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(DecodeError::Incomplete);
    }
    let declared = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]) as usize;
    let body = &frame[FRAME_HEADER_LEN..];
    if body.len() != declared {
        return Err(DecodeError::Incomplete);
    }

    let (code, code_end) = read_code(body)?;
    if let MessageCode::Unrecognized(_) = code {
        return Ok(Message {
            code,
            payload: Payload::None,
        });
    }

    // Envelope bytes seen before the payload: array headers and short strings.
    let mut cursor = code_end;
    while cursor < body.len() {
        match body[cursor] {
            FIXARRAY_FIRST..=FIXARRAY_LAST => cursor += 1,
            prefix @ FIXSTR_PREFIX..=FIXSTR_LAST => {
                cursor += 1 + (prefix - FIXSTR_PREFIX) as usize;
            }
            TAG_BLOB8 | TAG_BLOB16 | TAG_BLOB32 => {
                let (value, span) = read_json_blob(&code, body, cursor)?;
                return Ok(Message {
                    code,
                    payload: Payload::Json { value, span },
                });
            }
            INT64_PREFIX | UINT64_PREFIX if code == MessageCode::BuildTargetEnded => {
                let start = cursor + 1;
                let field = body
                    .get(start..start + TASK_ID_LEN)
                    .ok_or_else(|| DecodeError::MissingTaskId {
                        code: code.to_string(),
                    })?;
                return Ok(Message {
                    code,
                    payload: Payload::TaskId(read_u64_be(field)),
                });
            }
            _ => break,
        }
    }

    if code == MessageCode::BuildTargetEnded {
        // Fall back to the trailing eight bytes.
        if body.len() < code_end + TASK_ID_LEN {
            return Err(DecodeError::MissingTaskId {
                code: code.to_string(),
            });
        }
        let task_id = read_u64_be(&body[body.len() - TASK_ID_LEN..]);
        return Ok(Message {
            code,
            payload: Payload::TaskId(task_id),
        });
    }

    Ok(Message {
        code,
        payload: Payload::None,
    })
}

fn read_code(body: &[u8]) -> Result<(MessageCode, usize), DecodeError> {
    let prefix = *body.first().ok_or(DecodeError::EmptyBody)?;
    let (len, start) = match prefix {
        p @ FIXSTR_PREFIX..=FIXSTR_LAST => ((p - FIXSTR_PREFIX) as usize, 1),
        STR8_PREFIX => (*body.get(1).ok_or(DecodeError::CodeOverrun)? as usize, 2),
        other => return Err(DecodeError::BadCodePrefix(other)),
    };
    let raw = body.get(start..start + len).ok_or(DecodeError::CodeOverrun)?;
    let name = std::str::from_utf8(raw).map_err(|_| DecodeError::CodeNotUtf8)?;
    Ok((MessageCode::from_wire(name), start + len))
}

fn read_json_blob(
    code: &MessageCode,
    body: &[u8],
    tag_index: usize,
) -> Result<(Value, BlobSpan), DecodeError> {
    let tag = body[tag_index];
    let width = tag_width(tag);
    let len_start = tag_index + 1;
    let overrun = |len| DecodeError::PayloadOverrun {
        code: code.to_string(),
        len,
    };

    let len_bytes = body.get(len_start..len_start + width).ok_or(overrun(0))?;
    let len = len_bytes
        .iter()
        .fold(0usize, |acc, byte| (acc << 8) | *byte as usize);
    let json_start = len_start + width;
    let raw = body.get(json_start..json_start + len).ok_or(overrun(len))?;

    let value = serde_json::from_slice(raw).map_err(|source| DecodeError::Json {
        code: code.to_string(),
        source,
    })?;
    let span = BlobSpan {
        tag,
        start: FRAME_HEADER_LEN + tag_index,
        end: FRAME_HEADER_LEN + json_start + len,
    };
    Ok((value, span))
}

fn tag_width(tag: u8) -> usize {
    match tag {
        TAG_BLOB8 => 1,
        TAG_BLOB16 => 2,
        _ => 4,
    }
}

fn read_u64_be(bytes: &[u8]) -> u64 {
    let mut field = [0u8; TASK_ID_LEN];
    field.copy_from_slice(&bytes[..TASK_ID_LEN]);
    u64::from_be_bytes(field)
}

/// Encodes a message code as a short string.
pub fn encode_code(code: &str) -> Vec<u8> {
    let bytes = code.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() + 2);
    if bytes.len() <= FIXSTR_MAX_LEN {
        out.push(FIXSTR_PREFIX + bytes.len() as u8);
    } else {
        out.push(STR8_PREFIX);
        out.push(bytes.len().min(u8::MAX as usize) as u8);
    }
    out.extend_from_slice(&bytes[..bytes.len().min(u8::MAX as usize)]);
    out
}

/// Wraps raw JSON in a tagged blob. The narrowest tag that is at least as
/// wide as `min_tag` and can hold the length is used, so a rewritten blob
/// keeps its original tag whenever it still fits.
pub fn encode_json_blob(json: &[u8], min_tag: u8) -> Vec<u8> {
    let len = json.len();
    let tag = if min_tag <= TAG_BLOB8 && len <= u8::MAX as usize {
        TAG_BLOB8
    } else if min_tag <= TAG_BLOB16 && len <= u16::MAX as usize {
        TAG_BLOB16
    } else {
        TAG_BLOB32
    };

    let width = tag_width(tag);
    let mut out = Vec::with_capacity(1 + width + len);
    out.push(tag);
    out.extend_from_slice(&(len as u32).to_be_bytes()[4 - width..]);
    out.extend_from_slice(json);
    out
}

/// Body for a code followed by a JSON blob, as the daemon sends them.
pub fn json_body(code: &str, value: &Value) -> Vec<u8> {
    let json = value.to_string();
    let mut body = encode_code(code);
    body.extend(encode_json_blob(json.as_bytes(), TAG_BLOB16));
    body
}

/// Body for a code followed by a one-element array holding a 64-bit id.
pub fn task_id_body(code: &str, task_id: u64) -> Vec<u8> {
    let mut body = encode_code(code);
    body.push(FIXARRAY_FIRST + 1);
    body.push(INT64_PREFIX);
    body.extend_from_slice(&task_id.to_be_bytes());
    body
}
