//! Framing layer of the CQL binary protocol, versions 1 to 3.
//!
//! A frame is a fixed header (8 bytes in v1/v2, 9 bytes in v3 - the stream
//! id widens from `i8` to `i16`) followed by `length` bytes of body. The
//! session core never looks inside bodies; it only needs the stream id to
//! route responses back to waiting callers.

pub mod request;
pub mod response;
pub mod types;

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use request::SerializableRequest;
use response::ResponseOpcode;
use types::ParseError;

/// Stream id of a single multiplexed request on a connection.
///
/// Non-negative ids identify client requests; negative ids are reserved
/// for server-initiated frames (events).
pub type StreamId = i16;

/// Version of the CQL binary protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    V1,
    V2,
    #[default]
    V3,
}

impl ProtocolVersion {
    pub(crate) fn request_byte(self) -> u8 {
        match self {
            ProtocolVersion::V1 => 0x01,
            ProtocolVersion::V2 => 0x02,
            ProtocolVersion::V3 => 0x03,
        }
    }

    /// Size of the stream id space; ids range over `0..max_streams`.
    pub fn max_streams(self) -> usize {
        match self {
            ProtocolVersion::V1 | ProtocolVersion::V2 => 128,
            ProtocolVersion::V3 => 32768,
        }
    }

    fn wide_stream(self) -> bool {
        matches!(self, ProtocolVersion::V3)
    }

    fn header_size(self) -> usize {
        if self.wide_stream() {
            9
        } else {
            8
        }
    }
}

/// Parts of the frame header which are not determined by the request type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: ProtocolVersion,
    pub flags: u8,
    pub stream: StreamId,
}

/// An error at the framing layer: I/O, malformed header, or a body that
/// fails to decode.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received frame of protocol version {0:#04x}, expected {1:#04x}")]
    VersionMismatch(u8, u8),
    #[error("Unknown response opcode: {0:#04x}")]
    UnknownResponseOpcode(u8),
    #[error("Unknown RESULT kind: {0:#06x}")]
    UnknownResultKind(i32),
    #[error("Stream id {0} does not fit protocol version {1:?}")]
    StreamIdOutOfRange(StreamId, ProtocolVersion),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A request frame serialized in full (header and body), ready to be
/// handed to the connection's writer task.
pub(crate) struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    pub(crate) fn make<R: SerializableRequest>(
        request: &R,
        version: ProtocolVersion,
        stream: StreamId,
    ) -> Result<SerializedRequest, FrameError> {
        if !version.wide_stream() && i8::try_from(stream).is_err() {
            return Err(FrameError::StreamIdOutOfRange(stream, version));
        }

        let header_size = version.header_size();
        let mut data = Vec::with_capacity(header_size + 32);
        data.put_u8(version.request_byte());
        data.put_u8(0x00); // flags: no compression, no tracing
        if version.wide_stream() {
            data.put_i16(stream);
        } else {
            data.put_i8(stream as i8);
        }
        data.put_u8(R::OPCODE as u8);
        data.put_u32(0); // body length, patched below

        request.serialize(version, &mut data)?;

        let body_len = (data.len() - header_size) as u32;
        data[header_size - 4..header_size].copy_from_slice(&body_len.to_be_bytes());

        Ok(SerializedRequest { data })
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Reads one response frame: header, then `length` bytes of body.
pub(crate) async fn read_response(
    reader: &mut (impl AsyncRead + Unpin),
    version: ProtocolVersion,
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let header_size = version.header_size();
    let mut raw_header = [0u8; 9];
    reader.read_exact(&mut raw_header[..header_size]).await?;

    let mut buf = &raw_header[..header_size];

    let version_byte = buf.get_u8();
    if version_byte & 0x80 != 0x80 {
        return Err(FrameError::FrameFromClient);
    }
    if version_byte & 0x7F != version.request_byte() {
        return Err(FrameError::VersionMismatch(
            version_byte & 0x7F,
            version.request_byte(),
        ));
    }

    let flags = buf.get_u8();
    let stream = if version.wide_stream() {
        buf.get_i16()
    } else {
        buf.get_i8() as i16
    };
    let opcode = ResponseOpcode::try_from(buf.get_u8())?;
    let length = buf.get_u32();

    let mut body = vec![0u8; length as usize];
    reader.read_exact(&mut body).await?;

    let params = FrameParams {
        version,
        flags,
        stream,
    };
    Ok((params, opcode, body.into()))
}
