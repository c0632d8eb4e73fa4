//! Payload codecs.
//!
//! Both payloads start with a one byte version tag. All integers are
//! big-endian.
//!
//! Member payload, version 1:
//!
//! ```text
//! +------+------------+-------------+--------------+---------------+
//! | 0x01 | id_len u16 | id (utf-8)  | addr_len u32 | addr (utf-8)  |
//! +------+------------+-------------+--------------+---------------+
//! ```
//!
//! Trailing bytes are rejected.
//!
//! Global value, version 1: `0x01` followed by the `serde_json` encoding of the
//! value.

use bytes::{Buf, BufMut};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{CoordinationError, CoordinationResult};

/// Current version of both payload layouts.
pub const CODEC_VERSION: u8 = 1;

/// The (application node id, address) pair a directory member publishes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberAddress {
    pub node_id: String,
    pub address: String,
}

impl MemberAddress {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
        }
    }

    pub fn encode(&self) -> CoordinationResult<Vec<u8>> {
        let id_len = u16::try_from(self.node_id.len()).map_err(|_| {
            CoordinationError::Codec(format!(
                "node id is {} bytes, max {}",
                self.node_id.len(),
                u16::MAX
            ))
        })?;
        let addr_len = u32::try_from(self.address.len()).map_err(|_| {
            CoordinationError::Codec(format!("address is {} bytes", self.address.len()))
        })?;

        let mut buf = Vec::with_capacity(1 + 2 + 4 + self.node_id.len() + self.address.len());
        buf.put_u8(CODEC_VERSION);
        buf.put_u16(id_len);
        buf.put_slice(self.node_id.as_bytes());
        buf.put_u32(addr_len);
        buf.put_slice(self.address.as_bytes());
        Ok(buf)
    }

    pub fn decode(mut bytes: &[u8]) -> CoordinationResult<Self> {
        check_version(&mut bytes)?;
        if bytes.remaining() < 2 {
            return Err(truncated("node id length"));
        }
        let id_len = bytes.get_u16() as usize;
        let node_id = take_str(&mut bytes, id_len, "node id")?;
        if bytes.remaining() < 4 {
            return Err(truncated("address length"));
        }
        let addr_len = bytes.get_u32() as usize;
        let address = take_str(&mut bytes, addr_len, "address")?;
        if bytes.has_remaining() {
            return Err(CoordinationError::Codec(format!(
                "{} trailing bytes after member payload",
                bytes.remaining()
            )));
        }
        Ok(Self { node_id, address })
    }
}

/// Encode an arbitrary global value.
pub fn encode_value<T: Serialize + ?Sized>(value: &T) -> CoordinationResult<Vec<u8>> {
    let mut buf = vec![CODEC_VERSION];
    serde_json::to_writer(&mut buf, value)
        .map_err(|e| CoordinationError::Codec(format!("failed to encode value: {e}")))?;
    Ok(buf)
}

/// Decode a global value written by [`encode_value`].
pub fn decode_value<T: DeserializeOwned>(mut bytes: &[u8]) -> CoordinationResult<T> {
    check_version(&mut bytes)?;
    serde_json::from_slice(bytes)
        .map_err(|e| CoordinationError::Codec(format!("failed to decode value: {e}")))
}

fn check_version(bytes: &mut &[u8]) -> CoordinationResult<()> {
    if !bytes.has_remaining() {
        return Err(truncated("version"));
    }
    match bytes.get_u8() {
        CODEC_VERSION => Ok(()),
        other => Err(CoordinationError::Codec(format!(
            "unsupported payload version {other}"
        ))),
    }
}

fn take_str<'a>(bytes: &mut &'a [u8], len: usize, what: &str) -> CoordinationResult<String> {
    let rest: &'a [u8] = *bytes;
    if rest.len() < len {
        return Err(truncated(what));
    }
    let (head, tail) = rest.split_at(len);
    let s = std::str::from_utf8(head)
        .map_err(|e| CoordinationError::Codec(format!("{what} is not utf-8: {e}")))?
        .to_owned();
    *bytes = tail;
    Ok(s)
}

fn truncated(what: &str) -> CoordinationError {
    CoordinationError::Codec(format!("payload truncated reading {what}"))
}
