//! Request frames sent by the driver.
//!
//! Only the bodies needed by the session core are implemented: the
//! handshake requests and the three statement-dispatching requests.
//! Bound-value marshaling is not performed here; EXECUTE carries the
//! prepared id and parameters only.

use std::collections::HashMap;

use bytes::BufMut;

use super::types::{self, Consistency, ParseError};
use super::ProtocolVersion;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Credentials = 0x04,
    Options = 0x05,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    AuthResponse = 0x0F,
}

pub(crate) trait SerializableRequest {
    const OPCODE: RequestOpcode;

    fn serialize(&self, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), ParseError>;
}

/// STARTUP, the first frame on every connection.
pub(crate) struct Startup {
    pub options: HashMap<String, String>,
}

impl Startup {
    pub(crate) fn for_handshake(cql_version: Option<&str>) -> Self {
        let mut options = HashMap::new();
        options.insert(
            "CQL_VERSION".to_owned(),
            cql_version.unwrap_or("3.0.0").to_owned(),
        );
        Startup { options }
    }
}

impl SerializableRequest for Startup {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(&self, _version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_string_map(&self.options, buf)
    }
}

/// CREDENTIALS, the v1 answer to AUTHENTICATE.
pub(crate) struct Credentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

impl SerializableRequest for Credentials<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Credentials;

    fn serialize(&self, _version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        let mut map = HashMap::with_capacity(2);
        map.insert("username", self.username);
        map.insert("password", self.password);
        types::write_string_map(&map, buf)
    }
}

/// AUTH_RESPONSE, the v2/v3 answer to AUTHENTICATE. The token is the
/// SASL PLAIN encoding of the credentials.
pub(crate) struct AuthResponse<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

impl SerializableRequest for AuthResponse<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::AuthResponse;

    fn serialize(&self, _version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        let mut token = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        token.put_u8(0);
        token.put_slice(self.username.as_bytes());
        token.put_u8(0);
        token.put_slice(self.password.as_bytes());
        types::write_bytes_opt(Some(&token), buf)
    }
}

/// QUERY: an unprepared statement string plus parameters.
pub(crate) struct Query<'a> {
    pub contents: &'a str,
    pub consistency: Consistency,
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(&self, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_long_string(self.contents, buf)?;
        types::write_consistency(self.consistency, buf);
        if !matches!(version, ProtocolVersion::V1) {
            // v2+ query parameter flags: no values, no paging, no serial
            // consistency, no timestamp.
            buf.put_u8(0x00);
        }
        Ok(())
    }
}

/// PREPARE: just the statement string, identical in v1-v3.
pub(crate) struct Prepare<'a> {
    pub contents: &'a str,
}

impl SerializableRequest for Prepare<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(&self, _version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_long_string(self.contents, buf)
    }
}

/// EXECUTE: dispatches a previously prepared statement by id.
pub(crate) struct Execute<'a> {
    pub id: &'a [u8],
    pub consistency: Consistency,
}

impl SerializableRequest for Execute<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(&self, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_short_bytes(self.id, buf)?;
        match version {
            ProtocolVersion::V1 => {
                // v1 layout: <id><n><value_1>...<value_n><consistency>
                types::write_short(0, buf);
                types::write_consistency(self.consistency, buf);
            }
            ProtocolVersion::V2 | ProtocolVersion::V3 => {
                types::write_consistency(self.consistency, buf);
                buf.put_u8(0x00);
            }
        }
        Ok(())
    }
}
