//! Binary wire encoding for connection-service messages.
//!
//! Encoding follows RFC 4251 data types: `byte`, `boolean`, `uint32` in
//! network order, and `string` as a uint32 length prefix followed by the
//! bytes. An outbound packet is the message number followed by its payload;
//! the packet layer below frames, encrypts and MACs it. Inbound payloads
//! arrive with the message number already stripped.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{
    SSH_MSG_CHANNEL_DATA, SSH_MSG_CHANNEL_EXTENDED_DATA, SSH_MSG_CHANNEL_OPEN,
    SSH_MSG_CHANNEL_OPEN_CONFIRMATION, SSH_MSG_CHANNEL_OPEN_FAILURE, SSH_MSG_CHANNEL_REQUEST,
    SSH_MSG_CHANNEL_WINDOW_ADJUST, SSH_MSG_GLOBAL_REQUEST,
};
use crate::error::{Error, Result};

// =============================================================================
// Packet Writer
// =============================================================================

/// Builder for one outbound packet: message number plus payload fields.
#[derive(Debug)]
pub struct PacketBuf {
    buf: BytesMut,
}

impl PacketBuf {
    /// Start a packet for the given message number.
    pub fn new(cmd: u8) -> Self {
        Self::with_capacity(cmd, 64)
    }

    /// Start a packet with a payload size hint.
    pub fn with_capacity(cmd: u8, hint: usize) -> Self {
        let mut buf = BytesMut::with_capacity(1 + hint);
        buf.put_u8(cmd);
        Self { buf }
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.buf.put_u8(u8::from(v));
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    /// Length-prefixed string.
    pub fn put_string(&mut self, v: &str) -> &mut Self {
        self.put_string_bytes(v.as_bytes())
    }

    /// Length-prefixed byte string.
    pub fn put_string_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_u32(v.len() as u32);
        self.buf.put_slice(v);
        self
    }

    /// Raw bytes with no length prefix (type-specific trailing payload).
    pub fn put_raw(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    /// Finish the packet.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Packet consisting of a message number and a single recipient id.
///
/// Covers CHANNEL_EOF, CHANNEL_CLOSE, CHANNEL_SUCCESS and CHANNEL_FAILURE.
pub fn recipient_packet(cmd: u8, recipient: u32) -> Bytes {
    let mut p = PacketBuf::with_capacity(cmd, 4);
    p.put_u32(recipient);
    p.freeze()
}

// =============================================================================
// Packet Reader
// =============================================================================

/// Reader over one inbound payload.
///
/// Every accessor fails with a codec error on short input; nothing is
/// consumed past the error point.
#[derive(Debug)]
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::codec(format!(
                "truncated packet: need {} bytes for {}, have {}",
                n,
                what,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.need(1, "byte")?;
        Ok(self.buf.get_u8())
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.need(4, "uint32")?;
        Ok(self.buf.get_u32())
    }

    /// Length-prefixed byte string.
    pub fn get_string_bytes(&mut self) -> Result<Bytes> {
        let len = self.get_u32()? as usize;
        self.need(len, "string body")?;
        Ok(self.buf.split_to(len))
    }

    /// Length-prefixed UTF-8 string.
    pub fn get_string(&mut self) -> Result<String> {
        let raw = self.get_string_bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::codec("string field is not valid UTF-8"))
    }

    /// Consume whatever trails the fixed fields (type-specific payload).
    pub fn take_rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.remaining())
    }
}

// =============================================================================
// Typed Message Payloads
// =============================================================================

/// SSH_MSG_CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOpen {
    pub channel_type: String,
    /// Channel id allocated by the initiating side.
    pub sender: u32,
    pub initial_window: u32,
    pub max_packet: u32,
    /// Type-specific trailing payload, kept opaque.
    pub type_data: Bytes,
}

impl ChannelOpen {
    pub fn decode(r: &mut WireReader) -> Result<Self> {
        Ok(Self {
            channel_type: r.get_string()?,
            sender: r.get_u32()?,
            initial_window: r.get_u32()?,
            max_packet: r.get_u32()?,
            type_data: r.take_rest(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut p =
            PacketBuf::with_capacity(SSH_MSG_CHANNEL_OPEN, 16 + self.channel_type.len() + self.type_data.len());
        p.put_string(&self.channel_type)
            .put_u32(self.sender)
            .put_u32(self.initial_window)
            .put_u32(self.max_packet)
            .put_raw(&self.type_data);
        p.freeze()
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOpenConfirmation {
    pub recipient: u32,
    /// Channel id allocated by the confirming side.
    pub sender: u32,
    pub window: u32,
    pub max_packet: u32,
    pub type_data: Bytes,
}

impl ChannelOpenConfirmation {
    pub fn decode(r: &mut WireReader) -> Result<Self> {
        Ok(Self {
            recipient: r.get_u32()?,
            sender: r.get_u32()?,
            window: r.get_u32()?,
            max_packet: r.get_u32()?,
            type_data: r.take_rest(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut p = PacketBuf::with_capacity(SSH_MSG_CHANNEL_OPEN_CONFIRMATION, 16);
        p.put_u32(self.recipient)
            .put_u32(self.sender)
            .put_u32(self.window)
            .put_u32(self.max_packet)
            .put_raw(&self.type_data);
        p.freeze()
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOpenFailure {
    pub recipient: u32,
    pub reason_code: u32,
    pub message: String,
    pub language: String,
}

impl ChannelOpenFailure {
    pub fn decode(r: &mut WireReader) -> Result<Self> {
        Ok(Self {
            recipient: r.get_u32()?,
            reason_code: r.get_u32()?,
            message: r.get_string()?,
            language: r.get_string()?,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut p =
            PacketBuf::with_capacity(SSH_MSG_CHANNEL_OPEN_FAILURE, 16 + self.message.len());
        p.put_u32(self.recipient)
            .put_u32(self.reason_code)
            .put_string(&self.message)
            .put_string(&self.language);
        p.freeze()
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    pub recipient: u32,
    pub bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    pub fn decode(r: &mut WireReader) -> Result<Self> {
        Ok(Self {
            recipient: r.get_u32()?,
            bytes_to_add: r.get_u32()?,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut p = PacketBuf::with_capacity(SSH_MSG_CHANNEL_WINDOW_ADJUST, 8);
        p.put_u32(self.recipient).put_u32(self.bytes_to_add);
        p.freeze()
    }
}

/// SSH_MSG_CHANNEL_DATA.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelData {
    pub recipient: u32,
    pub data: Bytes,
}

impl ChannelData {
    pub fn decode(r: &mut WireReader) -> Result<Self> {
        Ok(Self {
            recipient: r.get_u32()?,
            data: r.get_string_bytes()?,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut p = PacketBuf::with_capacity(SSH_MSG_CHANNEL_DATA, 8 + self.data.len());
        p.put_u32(self.recipient).put_string_bytes(&self.data);
        p.freeze()
    }
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelExtendedData {
    pub recipient: u32,
    pub data_type: u32,
    pub data: Bytes,
}

impl ChannelExtendedData {
    pub fn decode(r: &mut WireReader) -> Result<Self> {
        Ok(Self {
            recipient: r.get_u32()?,
            data_type: r.get_u32()?,
            data: r.get_string_bytes()?,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut p =
            PacketBuf::with_capacity(SSH_MSG_CHANNEL_EXTENDED_DATA, 12 + self.data.len());
        p.put_u32(self.recipient)
            .put_u32(self.data_type)
            .put_string_bytes(&self.data);
        p.freeze()
    }
}

/// SSH_MSG_CHANNEL_REQUEST.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRequest {
    pub recipient: u32,
    pub name: String,
    pub want_reply: bool,
    pub payload: Bytes,
}

impl ChannelRequest {
    pub fn decode(r: &mut WireReader) -> Result<Self> {
        Ok(Self {
            recipient: r.get_u32()?,
            name: r.get_string()?,
            want_reply: r.get_bool()?,
            payload: r.take_rest(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut p = PacketBuf::with_capacity(
            SSH_MSG_CHANNEL_REQUEST,
            9 + self.name.len() + self.payload.len(),
        );
        p.put_u32(self.recipient)
            .put_string(&self.name)
            .put_bool(self.want_reply)
            .put_raw(&self.payload);
        p.freeze()
    }
}

/// SSH_MSG_GLOBAL_REQUEST.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalRequest {
    pub name: String,
    pub want_reply: bool,
    pub payload: Bytes,
}

impl GlobalRequest {
    pub fn decode(r: &mut WireReader) -> Result<Self> {
        Ok(Self {
            name: r.get_string()?,
            want_reply: r.get_bool()?,
            payload: r.take_rest(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut p = PacketBuf::with_capacity(
            SSH_MSG_GLOBAL_REQUEST,
            5 + self.name.len() + self.payload.len(),
        );
        p.put_string(&self.name)
            .put_bool(self.want_reply)
            .put_raw(&self.payload);
        p.freeze()
    }
}

/// Split an encoded packet back into message number and payload.
///
/// The inverse of `PacketBuf::freeze`; this is what the packet layer does
/// before handing the payload to `process`.
pub fn split_packet(packet: Bytes) -> Result<(u8, Bytes)> {
    let mut r = WireReader::new(packet);
    let cmd = r.get_u8()?;
    Ok((cmd, r.take_rest()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SSH_MSG_CHANNEL_CLOSE;

    fn roundtrip<T, D, E>(value: &T, decode: D, encode: E) -> T
    where
        D: Fn(&mut WireReader) -> Result<T>,
        E: Fn(&T) -> Bytes,
    {
        let packet = encode(value);
        let (_, payload) = split_packet(packet).unwrap();
        let mut r = WireReader::new(payload);
        let out = decode(&mut r).unwrap();
        assert_eq!(r.remaining(), 0);
        out
    }

    #[test]
    fn channel_open_roundtrip() {
        let msg = ChannelOpen {
            channel_type: "session".into(),
            sender: 3,
            initial_window: 0x200000,
            max_packet: 0x8000,
            type_data: Bytes::new(),
        };
        let out = roundtrip(&msg, ChannelOpen::decode, ChannelOpen::encode);
        assert_eq!(out, msg);
    }

    #[test]
    fn channel_open_carries_message_number() {
        let msg = ChannelOpen {
            channel_type: "direct-tcpip".into(),
            sender: 0,
            initial_window: 1,
            max_packet: 1,
            type_data: Bytes::from_static(b"extra"),
        };
        let packet = msg.encode();
        assert_eq!(packet[0], SSH_MSG_CHANNEL_OPEN);
        let (cmd, payload) = split_packet(packet).unwrap();
        assert_eq!(cmd, SSH_MSG_CHANNEL_OPEN);
        let decoded = ChannelOpen::decode(&mut WireReader::new(payload)).unwrap();
        assert_eq!(decoded.type_data, Bytes::from_static(b"extra"));
    }

    #[test]
    fn open_failure_roundtrip() {
        let msg = ChannelOpenFailure {
            recipient: 7,
            reason_code: 3,
            message: "Unsupported channel type: bogus".into(),
            language: String::new(),
        };
        let out = roundtrip(&msg, ChannelOpenFailure::decode, ChannelOpenFailure::encode);
        assert_eq!(out, msg);
    }

    #[test]
    fn data_roundtrip() {
        let msg = ChannelData {
            recipient: 0,
            data: Bytes::from_static(b"hello"),
        };
        let out = roundtrip(&msg, ChannelData::decode, ChannelData::encode);
        assert_eq!(out, msg);
    }

    #[test]
    fn extended_data_roundtrip() {
        let msg = ChannelExtendedData {
            recipient: 9,
            data_type: 1,
            data: Bytes::from_static(b"oops"),
        };
        let out = roundtrip(
            &msg,
            ChannelExtendedData::decode,
            ChannelExtendedData::encode,
        );
        assert_eq!(out, msg);
    }

    #[test]
    fn channel_request_roundtrip() {
        let msg = ChannelRequest {
            recipient: 1,
            name: "exec".into(),
            want_reply: true,
            payload: Bytes::from_static(b"\x00\x00\x00\x02ls"),
        };
        let out = roundtrip(&msg, ChannelRequest::decode, ChannelRequest::encode);
        assert_eq!(out, msg);
    }

    #[test]
    fn global_request_roundtrip() {
        let msg = GlobalRequest {
            name: "tcpip-forward".into(),
            want_reply: false,
            payload: Bytes::new(),
        };
        let out = roundtrip(&msg, GlobalRequest::decode, GlobalRequest::encode);
        assert_eq!(out, msg);
    }

    #[test]
    fn recipient_packet_layout() {
        let packet = recipient_packet(SSH_MSG_CHANNEL_CLOSE, 0xDEAD);
        assert_eq!(packet.len(), 5);
        let (cmd, payload) = split_packet(packet).unwrap();
        assert_eq!(cmd, SSH_MSG_CHANNEL_CLOSE);
        assert_eq!(WireReader::new(payload).get_u32().unwrap(), 0xDEAD);
    }

    #[test]
    fn truncated_uint32_is_codec_error() {
        let mut r = WireReader::new(Bytes::from_static(&[0, 0, 1]));
        let err = r.get_u32().unwrap_err();
        assert!(matches!(err, Error::Codec { .. }));
    }

    #[test]
    fn truncated_string_body_is_codec_error() {
        // Declares 10 bytes, provides 2.
        let mut r = WireReader::new(Bytes::from_static(&[0, 0, 0, 10, b'h', b'i']));
        let err = r.get_string().unwrap_err();
        assert!(matches!(err, Error::Codec { .. }));
    }

    #[test]
    fn non_utf8_string_is_codec_error() {
        let mut r = WireReader::new(Bytes::from_static(&[0, 0, 0, 2, 0xFF, 0xFE]));
        assert!(r.get_string().is_err());
    }

    #[test]
    fn bool_encoding_is_nonzero() {
        let mut r = WireReader::new(Bytes::from_static(&[0, 1, 42]));
        assert!(!r.get_bool().unwrap());
        assert!(r.get_bool().unwrap());
        assert!(r.get_bool().unwrap());
    }
}
