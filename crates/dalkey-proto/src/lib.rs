#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Protocol types for the file-resolver bridge.
//!
//! The sandbox can ask a parent frame for files it does not hold in its
//! virtual FS. The surface is two methods, `isFile` and `readFile`,
//! carried as JSON messages with a correlation id so responses on the
//! duplex channel can be matched back to their requests.
//!
//! ## Wire format
//! Messages use length-prefixed JSON:
//! - 4-byte little-endian u32 length prefix
//! - JSON payload bytes

use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Protocol schema version. Bump when changing message format.
pub const PROTO_SCHEMA_VERSION: u32 = 1;

/// Bridge method selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsMethod {
    #[serde(rename = "isFile")]
    IsFile,
    #[serde(rename = "readFile")]
    ReadFile,
}

/// A request to the parent frame: `{ "i": 7, "m": "isFile", "p": "/x" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsRequest {
    /// Correlation id, unique per in-flight request.
    pub i: u64,
    /// Method.
    pub m: FsMethod,
    /// Path argument.
    pub p: String,
}

impl FsRequest {
    #[must_use]
    pub fn is_file(i: u64, path: impl Into<String>) -> Self {
        Self {
            i,
            m: FsMethod::IsFile,
            p: path.into(),
        }
    }

    #[must_use]
    pub fn read_file(i: u64, path: impl Into<String>) -> Self {
        Self {
            i,
            m: FsMethod::ReadFile,
            p: path.into(),
        }
    }
}

/// A response from the parent frame. The payload is a plain boolean for
/// `isFile`, a plain string for `readFile`, or absent when the file does
/// not exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsResponse {
    /// Correlation id of the request being answered.
    pub i: u64,
    /// `isFile` result.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub found: Option<bool>,
    /// `readFile` result.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<String>,
    /// Error message when the host failed outright.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl FsResponse {
    #[must_use]
    pub fn found(i: u64, found: bool) -> Self {
        Self {
            i,
            found: Some(found),
            content: None,
            error: None,
        }
    }

    #[must_use]
    pub fn content(i: u64, content: impl Into<String>) -> Self {
        Self {
            i,
            found: None,
            content: Some(content.into()),
            error: None,
        }
    }

    #[must_use]
    pub fn missing(i: u64) -> Self {
        Self {
            i,
            found: None,
            content: None,
            error: None,
        }
    }

    #[must_use]
    pub fn error(i: u64, message: impl Into<String>) -> Self {
        Self {
            i,
            found: None,
            content: None,
            error: Some(message.into()),
        }
    }
}

/// Maximum frame size for sanity checking (16 MiB).
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode a frame to bytes with length prefix.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn encode_frame<T: Serialize>(frame: &T) -> io::Result<Vec<u8>> {
    let json =
        serde_json::to_vec(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let len = u32::try_from(json.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;

    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&json);

    Ok(buf)
}

/// Decode a frame from bytes (without length prefix).
///
/// # Errors
/// Returns an error if deserialization fails.
pub fn decode_frame<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> io::Result<T> {
    serde_json::from_slice(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write a length-prefixed frame to a writer.
///
/// # Errors
/// Returns an error if encoding or writing fails.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, frame: &T) -> io::Result<()> {
    let encoded = encode_frame(frame)?;
    writer.write_all(&encoded)?;
    writer.flush()
}

/// Read a length-prefixed frame from a reader.
///
/// # Errors
/// Returns an error if reading or decoding fails.
pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> io::Result<T> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes"),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;

    decode_frame(&buf)
}
