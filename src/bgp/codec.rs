use std::io::{Error, ErrorKind, Result};

use byteorder::{ByteOrder, NetworkEndian};
use bytes::{Buf, BufMut, BytesMut};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

use super::message::{Message, Notification, Open, HEADER_LENGTH, MAX_MESSAGE_LENGTH};

pub type MessageProtocol = Framed<TcpStream, MessageCodec>;

/// Frames BGP messages: 16-octet all-ones marker, 2-octet length, 1-octet
/// type. Header violations are hard errors which tear the session down.
/// OPEN and NOTIFICATION bodies are decoded into typed records; UPDATE and
/// anything unrecognised pass through opaque so the state machine can
/// answer them.
#[derive(Debug, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < HEADER_LENGTH {
            return Ok(None);
        }

        if buf[..16].iter().any(|b| *b != 0xff) {
            return Err(Error::new(ErrorKind::InvalidData, "Bad marker in message header"));
        }

        let length = NetworkEndian::read_u16(&buf[16..18]) as usize;
        if !(HEADER_LENGTH..=MAX_MESSAGE_LENGTH).contains(&length) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Bad message length: {}", length),
            ));
        }

        if buf.len() < length {
            return Ok(None);
        }

        let mtype = buf[18];
        let body = &buf[HEADER_LENGTH..length];

        let message = match mtype {
            super::M_OPEN => Message::Open(Open::parse(body)?),
            super::M_NOTIFICATION => Message::Notification(Notification::parse(body)?),
            _ => Message::Other {
                mtype,
                body: body.to_vec(),
            },
        };

        buf.advance(length);
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<()> {
        let body = message.body();
        let length = HEADER_LENGTH + body.len();
        buf.reserve(length);
        buf.put_bytes(0xff, 16);
        buf.put_u16(length as u16);
        buf.put_u8(message.mtype());
        buf.put_slice(&body);
        Ok(())
    }
}
