//! Portable traceback records. Consumers render traces without access to
//! the container's source tree, so frames travel with a line cache of the
//! source text they reference.

use serde::{Deserialize, Serialize};

use crate::payload::{self, PayloadError};

/// One captured stack frame. Unknown fields are ignored on decode so the
/// record can grow without breaking older consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracebackFrame {
    pub file: String,
    pub lineno: u32,
    pub function: String,
    #[serde(default)]
    pub locals_summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedLine {
    pub file: String,
    pub lineno: u32,
    pub line: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracebackPayload {
    #[serde(default)]
    pub frames: Vec<TracebackFrame>,
}

impl TracebackPayload {
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        payload::to_bytes(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        payload::from_bytes(bytes)
    }
}

pub fn encode_line_cache(
    lines: &[CachedLine],
) -> Result<Vec<u8>, PayloadError> {
    payload::to_bytes(&lines)
}

pub fn decode_line_cache(
    bytes: &[u8],
) -> Result<Vec<CachedLine>, PayloadError> {
    payload::from_bytes(bytes)
}
