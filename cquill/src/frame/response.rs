//! Response frames received from the server.
//!
//! Bodies are decoded only as deep as the session core needs: errors down
//! to their code and message, RESULT down to its kind. Row data stays raw;
//! value deserialization belongs to a layer above this crate.

use bytes::Bytes;

use super::types::{self, ParseError};
use super::{FrameError, ProtocolVersion};
use crate::errors::DbError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
    AuthChallenge = 0x0E,
    AuthSuccess = 0x10,
}

impl TryFrom<u8> for ResponseOpcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0x00 => Ok(ResponseOpcode::Error),
            0x02 => Ok(ResponseOpcode::Ready),
            0x03 => Ok(ResponseOpcode::Authenticate),
            0x06 => Ok(ResponseOpcode::Supported),
            0x08 => Ok(ResponseOpcode::Result),
            0x0C => Ok(ResponseOpcode::Event),
            0x0E => Ok(ResponseOpcode::AuthChallenge),
            0x10 => Ok(ResponseOpcode::AuthSuccess),
            _ => Err(FrameError::UnknownResponseOpcode(value)),
        }
    }
}

/// An ERROR response, decoded to its code and message.
#[derive(Debug, Clone)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

impl Error {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let code = types::read_int(buf)?;
        let reason = types::read_string(buf)?.to_owned();
        // Code-specific parameters may follow; nothing in this crate
        // consumes them.
        Ok(Error {
            error: DbError::from_code(code),
            reason,
        })
    }
}

/// An AUTHENTICATE response: the server demands credentials.
#[derive(Debug, Clone)]
pub struct Authenticate {
    pub authenticator_name: String,
}

impl Authenticate {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let authenticator_name = types::read_string(buf)?.to_owned();
        Ok(Authenticate { authenticator_name })
    }
}

/// The payload of a RESULT response.
#[derive(Debug, Clone)]
pub enum CqlResult {
    Void,
    /// Raw rows payload (metadata and row content, undecoded).
    Rows(Bytes),
    SetKeyspace(String),
    Prepared(Prepared),
    SchemaChange,
}

#[derive(Debug, Clone)]
pub struct Prepared {
    pub id: Bytes,
}

impl CqlResult {
    fn deserialize(body: &Bytes) -> Result<Self, FrameError> {
        let mut buf = &body[..];
        let kind = types::read_int(&mut buf)?;
        let result = match kind {
            0x0001 => CqlResult::Void,
            0x0002 => CqlResult::Rows(body.slice(body.len() - buf.len()..)),
            0x0003 => CqlResult::SetKeyspace(types::read_string(&mut buf)?.to_owned()),
            0x0004 => {
                let id = Bytes::copy_from_slice(types::read_short_bytes(&mut buf)?);
                // Prepared metadata follows; undecoded for the same reason
                // as row content.
                CqlResult::Prepared(Prepared { id })
            }
            0x0005 => CqlResult::SchemaChange,
            other => return Err(FrameError::UnknownResultKind(other)),
        };
        Ok(result)
    }
}

#[derive(Debug, Clone)]
pub enum Response {
    Ready,
    Error(Error),
    Authenticate(Authenticate),
    Supported,
    Result(CqlResult),
    Event,
    AuthChallenge,
    AuthSuccess,
}

impl Response {
    pub(crate) fn deserialize(
        _version: ProtocolVersion,
        opcode: ResponseOpcode,
        body: &Bytes,
    ) -> Result<Response, FrameError> {
        let mut buf = &body[..];
        let response = match opcode {
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Error => Response::Error(Error::deserialize(&mut buf)?),
            ResponseOpcode::Authenticate => {
                Response::Authenticate(Authenticate::deserialize(&mut buf)?)
            }
            ResponseOpcode::Supported => Response::Supported,
            ResponseOpcode::Result => Response::Result(CqlResult::deserialize(body)?),
            ResponseOpcode::Event => Response::Event,
            ResponseOpcode::AuthChallenge => Response::AuthChallenge,
            ResponseOpcode::AuthSuccess => Response::AuthSuccess,
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn error_response_maps_code_and_reason() {
        let mut body = Vec::new();
        types::write_int(0x2000, &mut body);
        types::write_string("syntax error", &mut body).unwrap();

        let response = Response::deserialize(
            ProtocolVersion::V3,
            ResponseOpcode::Error,
            &Bytes::from(body),
        )
        .unwrap();

        match response {
            Response::Error(err) => {
                assert!(matches!(err.error, DbError::SyntaxError));
                assert_eq!(err.reason, "syntax error");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn void_result() {
        let mut body = Vec::new();
        types::write_int(0x0001, &mut body);

        let response = Response::deserialize(
            ProtocolVersion::V3,
            ResponseOpcode::Result,
            &Bytes::from(body),
        )
        .unwrap();
        assert!(matches!(response, Response::Result(CqlResult::Void)));
    }

    #[test]
    fn prepared_result_extracts_id() {
        let mut body = Vec::new();
        types::write_int(0x0004, &mut body);
        types::write_short_bytes(&[1, 2, 3, 4], &mut body).unwrap();
        body.put_slice(&[0xFF; 8]); // trailing metadata, ignored

        let response = Response::deserialize(
            ProtocolVersion::V3,
            ResponseOpcode::Result,
            &Bytes::from(body),
        )
        .unwrap();
        match response {
            Response::Result(CqlResult::Prepared(prepared)) => {
                assert_eq!(&prepared.id[..], &[1, 2, 3, 4]);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn rows_result_keeps_raw_payload() {
        let mut body = Vec::new();
        types::write_int(0x0002, &mut body);
        body.put_slice(b"raw-rows-go-here");

        let response = Response::deserialize(
            ProtocolVersion::V3,
            ResponseOpcode::Result,
            &Bytes::from(body),
        )
        .unwrap();
        match response {
            Response::Result(CqlResult::Rows(raw)) => assert_eq!(&raw[..], b"raw-rows-go-here"),
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
