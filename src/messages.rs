//! Frame layer and session-setup messages of the pvAccess TCP protocol.
//!
//! Every message starts with an 8-byte header: magic `0xCA`, protocol
//! version, flags, command, and a 4-byte body length in the byte order the
//! flags announce. Large payloads may be split into segments; the
//! [`PvaCodec`] reassembles them before a body is handed to anyone, so the
//! body parsers in [`crate::wire`] always see complete messages and can
//! fail hard instead of suspending mid-field.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::wire::{RxBuf, TxBuf};

pub const MAGIC: u8 = 0xca;
pub const PROTOCOL_VERSION: u8 = 2;

/// Header flag bits.
pub mod flags {
    /// Body (and length field) are big-endian.
    pub const BIG_ENDIAN: u8 = 0x80;
    /// More segments of this message follow.
    pub const SEGMENTED: u8 = 0x10;
    /// Segment sequence position, for cross-checking reassembly.
    pub const SEGMENT_POS: u8 = 0x0f;
}

/// Command bytes.
pub mod cmd {
    pub const CONNECTION_VALIDATION: u8 = 0x01;
    pub const SET_BYTE_ORDER: u8 = 0x02;
    pub const CREATE_CHANNEL: u8 = 0x06;
    pub const DESTROY_CHANNEL: u8 = 0x07;
    pub const CONNECTION_VALIDATED: u8 = 0x08;
    pub const ECHO: u8 = 0x09;
    pub const GET: u8 = 0x0a;
    pub const PUT: u8 = 0x0b;
    pub const PUT_GET: u8 = 0x0c;
    pub const MONITOR: u8 = 0x0d;
    pub const DESTROY_REQUEST: u8 = 0x10;
    pub const MESSAGE: u8 = 0x11;
    pub const GET_FIELD: u8 = 0x12;
}

/// Operation subcommand bits (the `u8` following `sid, ioid`).
pub mod subcmd {
    pub const EXEC: u8 = 0x00;
    pub const INIT: u8 = 0x08;
    /// Monitor event record carrying the server's finish flag.
    pub const FINISHED: u8 = 0x10;
    pub const DESTROY: u8 = 0x40;
    /// PUT with a preceding fetch of the present value.
    pub const GET_PUT: u8 = 0x44;
    /// Monitor pipeline credit (`u32 freeSlots` follows).
    pub const ACK: u8 = 0x80;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub flags: u8,
    pub command: u8,
    pub body_len: u32,
}

impl Header {
    pub fn is_be(&self) -> bool {
        self.flags & flags::BIG_ENDIAN != 0
    }

    pub fn is_segmented(&self) -> bool {
        self.flags & flags::SEGMENTED != 0
    }

    pub fn segment_pos(&self) -> u8 {
        self.flags & flags::SEGMENT_POS
    }
}

/// One complete (reassembled) protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: u8, be: bool, body: Bytes) -> Frame {
        Frame {
            header: Header {
                version: PROTOCOL_VERSION,
                flags: if be { flags::BIG_ENDIAN } else { 0 },
                command,
                body_len: body.len() as u32,
            },
            body,
        }
    }

    /// Reader over the body in the header's byte order.
    pub fn rx(&self) -> RxBuf<'_> {
        RxBuf::new(&self.body, self.header.is_be())
    }
}

/// Length-delimited framing with segment reassembly.
#[derive(Debug, Default)]
pub struct PvaCodec {
    assembling: Option<(Header, BytesMut, u8)>,
}

impl Decoder for PvaCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        loop {
            if src.len() < 8 {
                return Ok(None);
            }
            if src[0] != MAGIC {
                return Err(Error::Protocol("bad magic"));
            }
            let hdr = Header {
                version: src[1],
                flags: src[2],
                command: src[3],
                body_len: {
                    let raw = [src[4], src[5], src[6], src[7]];
                    if src[2] & flags::BIG_ENDIAN != 0 {
                        u32::from_be_bytes(raw)
                    } else {
                        u32::from_le_bytes(raw)
                    }
                },
            };
            let body_len = hdr.body_len as usize;
            if src.len() < 8 + body_len {
                src.reserve(8 + body_len - src.len());
                return Ok(None);
            }
            src.advance(8);
            let body = src.split_to(body_len);

            if hdr.is_segmented() {
                match &mut self.assembling {
                    None => {
                        if hdr.segment_pos() != 0 {
                            return Err(Error::Protocol("segmented message out of sequence"));
                        }
                        self.assembling = Some((hdr, body, 1));
                    }
                    Some((first, acc, next)) => {
                        if hdr.command != first.command || hdr.segment_pos() != *next {
                            return Err(Error::Protocol("segmented message out of sequence"));
                        }
                        acc.extend_from_slice(&body);
                        *next = next.wrapping_add(1) & flags::SEGMENT_POS;
                    }
                }
                continue;
            }

            // final (or only) segment
            if let Some((first, mut acc, _)) = self.assembling.take() {
                if hdr.command != first.command {
                    return Err(Error::Protocol("segmented message out of sequence"));
                }
                acc.extend_from_slice(&body);
                let mut hdr = first;
                hdr.flags &= !(flags::SEGMENTED | flags::SEGMENT_POS);
                hdr.body_len = acc.len() as u32;
                return Ok(Some(Frame {
                    header: hdr,
                    body: acc.freeze(),
                }));
            }
            return Ok(Some(Frame {
                header: hdr,
                body: body.freeze(),
            }));
        }
    }
}

impl Encoder<Frame> for PvaCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        dst.reserve(8 + item.body.len());
        dst.put_u8(MAGIC);
        dst.put_u8(item.header.version);
        dst.put_u8(item.header.flags);
        dst.put_u8(item.header.command);
        let len = item.body.len() as u32;
        if item.header.is_be() {
            dst.put_u32(len);
        } else {
            dst.put_u32_le(len);
        }
        dst.put_slice(&item.body);
        Ok(())
    }
}

/// Operation completion status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    Warning(String),
    Error(String),
    Fatal(String),
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Ok | Status::Warning(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Status::Ok => "",
            Status::Warning(m) | Status::Error(m) | Status::Fatal(m) => m,
        }
    }

    pub fn to_wire(&self, buf: &mut TxBuf) {
        let (kind, message) = match self {
            Status::Ok => (0xff, ""),
            Status::Warning(m) => (1, m.as_str()),
            Status::Error(m) => (2, m.as_str()),
            Status::Fatal(m) => (3, m.as_str()),
        };
        buf.put_u8(kind);
        if kind != 0xff {
            buf.put_string(message);
            buf.put_string("");
        }
    }

    pub fn from_wire(rx: &mut RxBuf) -> Result<Status, Error> {
        let kind = rx.get_u8()?;
        if kind == 0xff {
            return Ok(Status::Ok);
        }
        let message = rx.get_string()?;
        let _call_tree = rx.get_string()?;
        Ok(match kind {
            0 => Status::Ok,
            1 => Status::Warning(message),
            2 => Status::Error(message),
            3 => Status::Fatal(message),
            _ => return Err(Error::Protocol("unknown status kind")),
        })
    }
}

/// Server's opening CONNECTION_VALIDATION request.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRequest {
    pub server_buffer_size: u32,
    pub server_registry_size: u16,
    pub auth_methods: Vec<String>,
}

impl ValidationRequest {
    pub fn to_wire(&self, buf: &mut TxBuf) {
        buf.put_u32(self.server_buffer_size);
        buf.put_u16(self.server_registry_size);
        buf.put_size(self.auth_methods.len());
        for method in &self.auth_methods {
            buf.put_string(method);
        }
    }

    pub fn from_wire(rx: &mut RxBuf) -> Result<ValidationRequest, Error> {
        let server_buffer_size = rx.get_u32()?;
        let server_registry_size = rx.get_u16()?;
        let count = rx.get_size()?;
        let mut auth_methods = Vec::with_capacity(count.min(16));
        for _ in 0..count {
            auth_methods.push(rx.get_string()?);
        }
        Ok(ValidationRequest {
            server_buffer_size,
            server_registry_size,
            auth_methods,
        })
    }
}

/// Client's CONNECTION_VALIDATION response selecting an auth method.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResponse {
    pub client_buffer_size: u32,
    pub client_registry_size: u16,
    pub auth_method: String,
}

impl ValidationResponse {
    pub fn to_wire(&self, buf: &mut TxBuf) {
        buf.put_u32(self.client_buffer_size);
        buf.put_u16(self.client_registry_size);
        buf.put_string(&self.auth_method);
        // no auth payload
        buf.put_u8(0xff);
    }

    pub fn from_wire(rx: &mut RxBuf) -> Result<ValidationResponse, Error> {
        let client_buffer_size = rx.get_u32()?;
        let client_registry_size = rx.get_u16()?;
        let auth_method = rx.get_string()?;
        Ok(ValidationResponse {
            client_buffer_size,
            client_registry_size,
            auth_method,
        })
    }
}

/// CREATE_CHANNEL request (single channel per message).
#[derive(Debug, Clone, PartialEq)]
pub struct CreateChannelRequest {
    pub cid: u32,
    pub name: String,
}

impl CreateChannelRequest {
    pub fn to_wire(&self, buf: &mut TxBuf) {
        buf.put_u16(1);
        buf.put_u32(self.cid);
        buf.put_string(&self.name);
    }

    pub fn from_wire(rx: &mut RxBuf) -> Result<CreateChannelRequest, Error> {
        let count = rx.get_u16()?;
        if count != 1 {
            return Err(Error::Protocol("batched CREATE_CHANNEL unsupported"));
        }
        let cid = rx.get_u32()?;
        let name = rx.get_string()?;
        Ok(CreateChannelRequest { cid, name })
    }
}

/// CREATE_CHANNEL reply.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateChannelResponse {
    pub cid: u32,
    pub sid: u32,
    pub status: Status,
}

impl CreateChannelResponse {
    pub fn to_wire(&self, buf: &mut TxBuf) {
        buf.put_u32(self.cid);
        buf.put_u32(self.sid);
        self.status.to_wire(buf);
    }

    pub fn from_wire(rx: &mut RxBuf) -> Result<CreateChannelResponse, Error> {
        Ok(CreateChannelResponse {
            cid: rx.get_u32()?,
            sid: rx.get_u32()?,
            status: Status::from_wire(rx)?,
        })
    }
}

/// DESTROY_CHANNEL, sent by either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyChannel {
    pub sid: u32,
    pub cid: u32,
}

impl DestroyChannel {
    pub fn to_wire(&self, buf: &mut TxBuf) {
        buf.put_u32(self.sid);
        buf.put_u32(self.cid);
    }

    pub fn from_wire(rx: &mut RxBuf) -> Result<DestroyChannel, Error> {
        Ok(DestroyChannel {
            sid: rx.get_u32()?,
            cid: rx.get_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(be: bool, f: impl FnOnce(&mut TxBuf)) -> Bytes {
        let mut out = BytesMut::new();
        let mut buf = TxBuf::new(&mut out, be);
        f(&mut buf);
        out.freeze()
    }

    #[test]
    fn frame_roundtrip_both_endiannesses() {
        for be in [true, false] {
            let mut codec = PvaCodec::default();
            let frame = Frame::new(cmd::GET_FIELD, be, Bytes::from_static(b"\x01\x02\x03"));

            let mut wire = BytesMut::new();
            codec.encode(frame.clone(), &mut wire).unwrap();
            assert_eq!(wire[0], MAGIC);
            assert_eq!(wire.len(), 11);

            // partial delivery yields nothing and consumes nothing
            let mut partial = BytesMut::from(&wire[..5]);
            assert!(codec.decode(&mut partial).unwrap().is_none());
            assert_eq!(partial.len(), 5);

            let decoded = codec.decode(&mut wire).unwrap().unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn two_frames_in_one_read() {
        let mut codec = PvaCodec::default();
        let a = Frame::new(cmd::ECHO, true, Bytes::new());
        let b = Frame::new(cmd::MESSAGE, true, Bytes::from_static(b"xy"));

        let mut wire = BytesMut::new();
        codec.encode(a.clone(), &mut wire).unwrap();
        codec.encode(b.clone(), &mut wire).unwrap();

        assert_eq!(codec.decode(&mut wire).unwrap().unwrap(), a);
        assert_eq!(codec.decode(&mut wire).unwrap().unwrap(), b);
        assert!(codec.decode(&mut wire).unwrap().is_none());
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut codec = PvaCodec::default();
        let mut wire = BytesMut::from(&b"\x00\x02\x80\x09\x00\x00\x00\x00"[..]);
        assert!(matches!(codec.decode(&mut wire), Err(Error::Protocol(_))));
    }

    #[test]
    fn segmented_messages_reassemble() {
        let mut codec = PvaCodec::default();
        let mut wire = BytesMut::new();

        // two leading segments then the final unsegmented frame
        for (seg, payload) in [(Some(0u8), &b"abc"[..]), (Some(1), b"def"), (None, b"gh")] {
            let mut frame = Frame::new(cmd::MONITOR, true, Bytes::copy_from_slice(payload));
            if let Some(pos) = seg {
                frame.header.flags |= flags::SEGMENTED | pos;
            }
            codec.encode(frame, &mut wire).unwrap();
        }

        let out = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(out.header.command, cmd::MONITOR);
        assert!(!out.header.is_segmented());
        assert_eq!(&out.body[..], b"abcdefgh");
    }

    #[test]
    fn segment_position_is_checked() {
        let mut codec = PvaCodec::default();
        let mut wire = BytesMut::new();
        let mut frame = Frame::new(cmd::MONITOR, true, Bytes::from_static(b"abc"));
        frame.header.flags |= flags::SEGMENTED | 1; // starts at position 1
        codec.encode(frame, &mut wire).unwrap();
        assert!(matches!(codec.decode(&mut wire), Err(Error::Protocol(_))));
    }

    #[test]
    fn status_roundtrip() {
        for (status, ok) in [
            (Status::Ok, true),
            (Status::Warning("careful".into()), true),
            (Status::Error("nope".into()), false),
            (Status::Fatal("dead".into()), false),
        ] {
            let raw = body(true, |b| status.to_wire(b));
            let mut rx = RxBuf::new(&raw, true);
            let back = Status::from_wire(&mut rx).unwrap();
            assert_eq!(back, status);
            assert_eq!(back.is_success(), ok);
            assert!(rx.is_empty());
        }
        // the compact OK form is a single byte
        assert_eq!(body(true, |b| Status::Ok.to_wire(b))[..], [0xff][..]);
    }

    #[test]
    fn validation_messages_roundtrip() {
        let req = ValidationRequest {
            server_buffer_size: 0x4000,
            server_registry_size: 0x7fff,
            auth_methods: vec!["anonymous".into(), "ca".into()],
        };
        let raw = body(false, |b| req.to_wire(b));
        let mut rx = RxBuf::new(&raw, false);
        assert_eq!(ValidationRequest::from_wire(&mut rx).unwrap(), req);

        let resp = ValidationResponse {
            client_buffer_size: 0x4000,
            client_registry_size: 0x7fff,
            auth_method: "anonymous".into(),
        };
        let raw = body(true, |b| resp.to_wire(b));
        let mut rx = RxBuf::new(&raw, true);
        assert_eq!(ValidationResponse::from_wire(&mut rx).unwrap(), resp);
    }

    #[test]
    fn create_channel_roundtrip() {
        let req = CreateChannelRequest {
            cid: 7,
            name: "mailbox".into(),
        };
        let raw = body(true, |b| req.to_wire(b));
        let mut rx = RxBuf::new(&raw, true);
        assert_eq!(CreateChannelRequest::from_wire(&mut rx).unwrap(), req);

        let resp = CreateChannelResponse {
            cid: 7,
            sid: 1234,
            status: Status::Ok,
        };
        let raw = body(true, |b| resp.to_wire(b));
        let mut rx = RxBuf::new(&raw, true);
        assert_eq!(CreateChannelResponse::from_wire(&mut rx).unwrap(), resp);
    }
}
