//! PostgreSQL frontend messages: framing and decoding.
//!
//! After the first message every frame is a 1-byte type code, a 4-byte
//! length that counts itself, and the payload. The first message (startup)
//! has no type code; it is decoded as code `0`.
//!
//! The byte order of the length is guessed: whichever reading gives the
//! smaller value wins, on the assumption that client messages are small.
//! This is a heuristic. Every length below 64 KiB is detected correctly,
//! but some larger ones are not: the big-endian 65536 (`00 01 00 00`) reads
//! as 256 little-endian.

use bytes::Buf;
use tracing::warn;

pub const STARTUP: u8 = 0;
pub const PARAMETER_STATUS: u8 = b'S';
pub const QUERY: u8 = b'Q';
pub const TERMINATE: u8 = b'X';

/// Major version carried by SSLRequest, GSSENCRequest and CancelRequest.
pub const NEGOTIATION_MAJOR: u16 = 1234;

const LENGTH_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// Pick the byte order under which `header` reads as the smaller
    /// length. Ties go to little-endian.
    pub fn detect(header: [u8; 4]) -> Self {
        if u32::from_le_bytes(header) <= u32::from_be_bytes(header) {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }

    pub fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Endianness::Little => u32::from_le_bytes(bytes),
            Endianness::Big => u32::from_be_bytes(bytes),
        }
    }

    fn get_u16(self, buf: &mut &[u8]) -> u16 {
        match self {
            Endianness::Little => buf.get_u16_le(),
            Endianness::Big => buf.get_u16(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    pub version: ProtocolVersion,
    pub parameters: Vec<Parameter>,
}

impl StartupMessage {
    /// SSLRequest, GSSENCRequest and CancelRequest share the startup
    /// framing but are not the real startup message.
    pub fn is_negotiation(&self) -> bool {
        self.version.major == NEGOTIATION_MAJOR
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Startup(StartupMessage),
    ParameterStatus(Vec<Parameter>),
    Query(String),
    Terminate,
}

/// Result of looking for one frame at the start of a byte slice.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// More bytes are needed.
    Incomplete,
    /// The length field is smaller than itself; the stream cannot be
    /// delimited any further.
    Malformed { code: u8, length: u32 },
    Complete {
        code: u8,
        payload: &'a [u8],
        endianness: Endianness,
        /// Bytes the whole frame occupies, type code included.
        len: usize,
    },
}

/// Find the frame at the start of `buf`. `tagged` is false only for
/// frames of the startup phase, which carry no type code.
pub fn next_frame(buf: &[u8], tagged: bool) -> Frame<'_> {
    let (code, header_at) = if tagged {
        match buf.first() {
            Some(&code) => (code, 1),
            None => return Frame::Incomplete,
        }
    } else {
        (STARTUP, 0)
    };

    let Some(header) = buf.get(header_at..header_at + LENGTH_SIZE) else {
        return Frame::Incomplete;
    };
    let Ok(header) = <[u8; 4]>::try_from(header) else {
        return Frame::Incomplete;
    };

    let endianness = Endianness::detect(header);
    let length = endianness.read_u32(header);
    if (length as usize) < LENGTH_SIZE {
        return Frame::Malformed { code, length };
    }

    let end = header_at + length as usize;
    match buf.get(header_at + LENGTH_SIZE..end) {
        Some(payload) => Frame::Complete {
            code,
            payload,
            endianness,
            len: end,
        },
        None => Frame::Incomplete,
    }
}

/// Decode a complete frame. Unknown codes, and payloads too short for
/// their fixed fields, produce nothing.
pub fn decode(code: u8, payload: &[u8], endianness: Endianness) -> Option<Message> {
    match code {
        STARTUP => decode_startup(payload, endianness).map(Message::Startup),
        PARAMETER_STATUS => Some(Message::ParameterStatus(parse_pairs(payload))),
        QUERY => {
            let text = payload.split(|&b| b == 0).next().unwrap_or_default();
            Some(Message::Query(String::from_utf8_lossy(text).into_owned()))
        }
        TERMINATE => Some(Message::Terminate),
        _ => None,
    }
}

fn decode_startup(payload: &[u8], endianness: Endianness) -> Option<StartupMessage> {
    if payload.len() < LENGTH_SIZE {
        warn!(len = payload.len(), "startup message bad length");
        return None;
    }
    let mut cursor = payload;
    let major = endianness.get_u16(&mut cursor);
    let minor = endianness.get_u16(&mut cursor);
    Some(StartupMessage {
        version: ProtocolVersion { major, minor },
        parameters: parse_pairs(cursor),
    })
}

/// NUL-terminated name/value pairs, up to an empty name.
fn parse_pairs(bytes: &[u8]) -> Vec<Parameter> {
    let mut fields = bytes.split(|&b| b == 0);
    let mut parameters = Vec::new();
    while let Some(name) = fields.next() {
        if name.is_empty() {
            break;
        }
        let Some(value) = fields.next() else {
            break;
        };
        parameters.push(Parameter {
            name: String::from_utf8_lossy(name).into_owned(),
            value: String::from_utf8_lossy(value).into_owned(),
        });
    }
    parameters
}

/// Encode a startup message the way a client sends it (big-endian).
#[cfg(test)]
pub(crate) fn encode_startup(major: u16, minor: u16, parameters: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&major.to_be_bytes());
    body.extend_from_slice(&minor.to_be_bytes());
    for (name, value) in parameters {
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);

    let mut frame = ((body.len() + LENGTH_SIZE) as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(&body);
    frame
}

/// Encode a tagged frame (big-endian length).
#[cfg(test)]
pub(crate) fn encode_tagged(code: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = vec![code];
    frame.extend_from_slice(&((body.len() + LENGTH_SIZE) as u32).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}
