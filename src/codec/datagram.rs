use anyhow::bail;
use bytes::{BufMut, BytesMut};

use crate::message::{Message, MessageId, MessageType};
use crate::util::buf_ext::{BufExt, BufMutExt};

const REPLY_NOK: u8 = 0x00;
const REPLY_OK: u8 = 0x01;


/// Serializes a message as `tag | id (u16, BE) | payload`. Text fields are written as-is with a
///  trailing null byte, validation is the caller's business.
pub fn ser(msg: &Message, buf: &mut impl BufMut) {
    buf.put_u8(msg.message_type().into());

    match msg {
        Message::Confirm { ref_id } => {
            buf.put_u16(*ref_id);
        }
        Message::Reply { id, ok, ref_id, content } => {
            buf.put_u16(*id);
            buf.put_u8(if *ok { REPLY_OK } else { REPLY_NOK });
            buf.put_u16(*ref_id);
            buf.put_cstring(content);
        }
        Message::Auth { id, username, display_name, secret } => {
            buf.put_u16(*id);
            buf.put_cstring(username);
            buf.put_cstring(display_name);
            buf.put_cstring(secret);
        }
        Message::Join { id, channel_id, display_name } => {
            buf.put_u16(*id);
            buf.put_cstring(channel_id);
            buf.put_cstring(display_name);
        }
        Message::Msg { id, display_name, content }
        | Message::Err { id, display_name, content } => {
            buf.put_u16(*id);
            buf.put_cstring(display_name);
            buf.put_cstring(content);
        }
        Message::Bye { id } => {
            buf.put_u16(*id);
        }
    }
}

pub fn encode(msg: &Message) -> BytesMut {
    let mut buf = BytesMut::new();
    ser(msg, &mut buf);
    buf
}

/// Parses a complete datagram. Truncated frames, unknown tags, result bytes other than 0/1,
///  unterminated strings, trailing bytes and fields violating their character class are all
///  rejected.
pub fn decode(buf: &[u8]) -> anyhow::Result<Message> {
    let mut buf = buf;

    let tag = buf.get_u8_checked()?;
    let message_type = match MessageType::try_from(tag) {
        Ok(t) => t,
        Err(_) => bail!("unknown message type 0x{:02x}", tag),
    };
    let id = buf.get_u16_checked()?;

    let msg = match message_type {
        MessageType::Confirm => Message::Confirm { ref_id: id },
        MessageType::Reply => {
            let ok = match buf.get_u8_checked()? {
                REPLY_OK => true,
                REPLY_NOK => false,
                n => bail!("invalid REPLY result byte 0x{:02x}", n),
            };
            let ref_id = buf.get_u16_checked()?;
            let content = buf.try_get_cstring()?;
            Message::Reply { id, ok, ref_id, content }
        }
        MessageType::Auth => {
            let username = buf.try_get_cstring()?;
            let display_name = buf.try_get_cstring()?;
            let secret = buf.try_get_cstring()?;
            Message::Auth { id, username, display_name, secret }
        }
        MessageType::Join => {
            let channel_id = buf.try_get_cstring()?;
            let display_name = buf.try_get_cstring()?;
            Message::Join { id, channel_id, display_name }
        }
        MessageType::Msg => {
            let display_name = buf.try_get_cstring()?;
            let content = buf.try_get_cstring()?;
            Message::Msg { id, display_name, content }
        }
        MessageType::Err => {
            let display_name = buf.try_get_cstring()?;
            let content = buf.try_get_cstring()?;
            Message::Err { id, display_name, content }
        }
        MessageType::Bye => Message::Bye { id },
    };

    if !buf.is_empty() {
        bail!("{} trailing bytes after {:?}", buf.len(), message_type);
    }
    msg.validate()?;
    Ok(msg)
}

/// Reads just the tag and id of a frame that may otherwise be malformed, so that it can still
///  be confirmed. Returns `None` for frames too short to carry an id and for CONFIRM frames.
pub fn peek_id(buf: &[u8]) -> Option<MessageId> {
    match buf {
        [tag, hi, lo, ..] if *tag != u8::from(MessageType::Confirm) => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}
