//! Edge wire protocol constants.
//!
//! Only the parts of the framing the dial layer depends on live here: the
//! header length, the content type taxonomy, header identifiers and the
//! reflected-header rule used to correlate replies with requests. The frame
//! codec itself belongs to the transport.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Magic prefix of every frame.
pub const VERSION: [u8; 4] = [0x03, 0x06, 0x09, 0x0c];

/// Fixed frame header length in bytes.
pub const HEADER_LENGTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ContentType {
    Hello = 0,
    Ping = 1,
    Result = 2,
    Latency = 3,

    Connect = 60783,
    StateConnected = 60784,
    StateClosed = 60785,
    Data = 60786,
    Dial = 60787,
    DialSuccess = 60788,
    DialFailed = 60789,
    Bind = 60790,
    Unbind = 60791,
}

impl ContentType {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Edge data-plane types occupy the high range; control types are 0..=3.
    pub fn is_edge(self) -> bool {
        self.code() >= ContentType::Connect.code()
    }
}

impl TryFrom<i32> for ContentType {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self> {
        let ct = match code {
            0 => ContentType::Hello,
            1 => ContentType::Ping,
            2 => ContentType::Result,
            3 => ContentType::Latency,
            60783 => ContentType::Connect,
            60784 => ContentType::StateConnected,
            60785 => ContentType::StateClosed,
            60786 => ContentType::Data,
            60787 => ContentType::Dial,
            60788 => ContentType::DialSuccess,
            60789 => ContentType::DialFailed,
            60790 => ContentType::Bind,
            60791 => ContentType::Unbind,
            other => return Err(Error::Protocol(format!("unknown content type {}", other))),
        };
        Ok(ct)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Header field identifiers.
pub mod header {
    pub const CONNECTION_ID: i32 = 0;
    pub const REPLY_FOR: i32 = 1;
    pub const RESULT_SUCCESS: i32 = 2;
    pub const HELLO_LISTENER: i32 = 3;

    /// Headers in 128..=255 are copied verbatim onto replies.
    pub const REFLECTED_HEADER_BIT_MASK: i32 = 1 << 7;
    pub const MAX_REFLECTED_HEADER: i32 = (1 << 8) - 1;

    pub const CONN_ID: i32 = 1000;
    pub const SEQ: i32 = 1001;
    pub const SESSION_TOKEN: i32 = 1002;

    pub fn is_reflected(id: i32) -> bool {
        (REFLECTED_HEADER_BIT_MASK..=MAX_REFLECTED_HEADER).contains(&id)
    }
}

/// A decoded frame as seen by the dial layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub content_type: ContentType,
    pub sequence: i32,
    pub headers: BTreeMap<i32, Vec<u8>>,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(content_type: ContentType, sequence: i32) -> Self {
        Self {
            content_type,
            sequence,
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn put_header(&mut self, id: i32, value: impl Into<Vec<u8>>) {
        self.headers.insert(id, value.into());
    }

    pub fn put_i32(&mut self, id: i32, value: i32) {
        self.headers.insert(id, value.to_le_bytes().to_vec());
    }

    pub fn put_bool(&mut self, id: i32, value: bool) {
        self.headers.insert(id, vec![value as u8]);
    }

    pub fn header(&self, id: i32) -> Option<&[u8]> {
        self.headers.get(&id).map(Vec::as_slice)
    }

    pub fn header_i32(&self, id: i32) -> Option<i32> {
        let raw: [u8; 4] = self.header(id)?.try_into().ok()?;
        Some(i32::from_le_bytes(raw))
    }

    pub fn header_bool(&self, id: i32) -> Option<bool> {
        match self.header(id)? {
            [b] => Some(*b != 0),
            _ => None,
        }
    }

    /// Builds the reply skeleton for this request: `ReplyFor` points at our
    /// sequence and every reflected header is echoed unchanged.
    pub fn reply(&self, content_type: ContentType, sequence: i32) -> Message {
        let mut reply = Message::new(content_type, sequence);
        reply.put_i32(header::REPLY_FOR, self.sequence);
        for (id, value) in &self.headers {
            if header::is_reflected(*id) {
                reply.headers.insert(*id, value.clone());
            }
        }
        reply
    }

    /// Checks that `reply` answers this request and honours reflection.
    pub fn check_reply(&self, reply: &Message) -> Result<()> {
        match reply.header_i32(header::REPLY_FOR) {
            Some(seq) if seq == self.sequence => {}
            Some(seq) => {
                return Err(Error::Protocol(format!(
                    "reply for sequence {} does not match request {}",
                    seq, self.sequence
                )))
            }
            None => return Err(Error::Protocol("reply is missing ReplyFor header".into())),
        }

        for (id, value) in &self.headers {
            if header::is_reflected(*id) && reply.headers.get(id) != Some(value) {
                return Err(Error::Protocol(format!("reflected header {} not echoed", id)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_ranges() {
        assert!(!ContentType::Latency.is_edge());
        assert!(ContentType::Connect.is_edge());
        assert_eq!(ContentType::try_from(60787).unwrap(), ContentType::Dial);
        assert!(ContentType::try_from(4).is_err());
    }

    #[test]
    fn reflected_range_is_128_to_255() {
        assert!(!header::is_reflected(127));
        assert!(header::is_reflected(128));
        assert!(header::is_reflected(255));
        assert!(!header::is_reflected(256));
        assert!(!header::is_reflected(header::CONN_ID));
    }

    #[test]
    fn reply_echoes_reflected_headers_only() {
        let mut req = Message::new(ContentType::Dial, 7);
        req.put_header(130, b"trace".to_vec());
        req.put_i32(header::CONN_ID, 42);

        let reply = req.reply(ContentType::DialSuccess, 1);
        assert_eq!(reply.header_i32(header::REPLY_FOR), Some(7));
        assert_eq!(reply.header(130), Some(&b"trace"[..]));
        assert!(reply.header(header::CONN_ID).is_none());
        assert!(req.check_reply(&reply).is_ok());
    }

    #[test]
    fn check_reply_rejects_dropped_reflection() {
        let mut req = Message::new(ContentType::Dial, 3);
        req.put_header(200, vec![1, 2, 3]);

        let mut reply = Message::new(ContentType::DialSuccess, 9);
        reply.put_i32(header::REPLY_FOR, 3);
        assert!(matches!(req.check_reply(&reply), Err(Error::Protocol(_))));

        let mut wrong = req.reply(ContentType::DialSuccess, 9);
        wrong.put_i32(header::REPLY_FOR, 4);
        assert!(req.check_reply(&wrong).is_err());
    }
}
