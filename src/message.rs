use std::fmt::{Debug, Formatter};

use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Sender-assigned identifier of a message. The client assigns them from a per-session counter,
///  starting at 0 and never reusing a value.
pub type MessageId = u16;

pub const MAX_NAME_LEN: usize = 20;
pub const MAX_SECRET_LEN: usize = 128;
pub const MAX_CONTENT_LEN: usize = 1400;

/// Tag byte of a datagram message
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum MessageType {
    Confirm = 0x00,
    Reply = 0x01,
    Auth = 0x02,
    Join = 0x03,
    Msg = 0x04,
    Err = 0xFE,
    Bye = 0xFF,
}

/// A protocol message, independent of the transport it travels on.
///
/// The text protocol has no identifiers: messages decoded from a stream carry id 0, and `Confirm`
///  exists on the datagram transport only.
#[derive(Clone, Eq, PartialEq)]
pub enum Message {
    Confirm {
        ref_id: MessageId,
    },
    Reply {
        id: MessageId,
        ok: bool,
        ref_id: MessageId,
        content: String,
    },
    Auth {
        id: MessageId,
        username: String,
        display_name: String,
        secret: String,
    },
    Join {
        id: MessageId,
        channel_id: String,
        display_name: String,
    },
    Msg {
        id: MessageId,
        display_name: String,
        content: String,
    },
    Err {
        id: MessageId,
        display_name: String,
        content: String,
    },
    Bye {
        id: MessageId,
    },
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Confirm { ref_id } => write!(f, "CONFIRM[{}]", ref_id),
            Message::Reply { id, ok, ref_id, content } => write!(f, "REPLY#{}[{} -> {}]({:?})", id, if *ok { "OK" } else { "NOK" }, ref_id, content),
            // the secret stays out of logs
            Message::Auth { id, username, display_name, .. } => write!(f, "AUTH#{}({:?} as {:?})", id, username, display_name),
            Message::Join { id, channel_id, display_name } => write!(f, "JOIN#{}({:?} as {:?})", id, channel_id, display_name),
            Message::Msg { id, display_name, content } => write!(f, "MSG#{}({:?}: {:?})", id, display_name, content),
            Message::Err { id, display_name, content } => write!(f, "ERR#{}({:?}: {:?})", id, display_name, content),
            Message::Bye { id } => write!(f, "BYE#{}", id),
        }
    }
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Confirm { .. } => MessageType::Confirm,
            Message::Reply { .. } => MessageType::Reply,
            Message::Auth { .. } => MessageType::Auth,
            Message::Join { .. } => MessageType::Join,
            Message::Msg { .. } => MessageType::Msg,
            Message::Err { .. } => MessageType::Err,
            Message::Bye { .. } => MessageType::Bye,
        }
    }

    /// The message's own identifier, `None` for `Confirm` which only references another message
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::Confirm { .. } => None,
            Message::Reply { id, .. }
            | Message::Auth { id, .. }
            | Message::Join { id, .. }
            | Message::Msg { id, .. }
            | Message::Err { id, .. }
            | Message::Bye { id } => Some(*id),
        }
    }

    /// Checks all text fields against their character classes and length limits
    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            Message::Confirm { .. } | Message::Bye { .. } => Ok(()),
            Message::Reply { content, .. } => validate_content(content),
            Message::Auth { username, display_name, secret, .. } => {
                validate_username(username)?;
                validate_display_name(display_name)?;
                validate_secret(secret)
            }
            Message::Join { channel_id, display_name, .. } => {
                validate_channel_id(channel_id)?;
                validate_display_name(display_name)
            }
            Message::Msg { display_name, content, .. }
            | Message::Err { display_name, content, .. } => {
                validate_display_name(display_name)?;
                validate_content(content)
            }
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

fn is_content_char(c: char) -> bool {
    ('\x20'..='\x7e').contains(&c)
}

fn validate_field(kind: &str, value: &str, max_len: usize, allowed: fn(char) -> bool) -> anyhow::Result<()> {
    if value.is_empty() {
        bail!("{} must not be empty", kind);
    }
    if value.len() > max_len {
        bail!("{} is longer than {} characters", kind, max_len);
    }
    if let Some(c) = value.chars().find(|&c| !allowed(c)) {
        bail!("{} contains invalid character {:?}", kind, c);
    }
    Ok(())
}

pub fn validate_username(value: &str) -> anyhow::Result<()> {
    validate_field("username", value, MAX_NAME_LEN, is_name_char)
}

pub fn validate_display_name(value: &str) -> anyhow::Result<()> {
    validate_field("display name", value, MAX_NAME_LEN, is_name_char)
}

pub fn validate_channel_id(value: &str) -> anyhow::Result<()> {
    validate_field("channel id", value, MAX_NAME_LEN, is_name_char)
}

pub fn validate_secret(value: &str) -> anyhow::Result<()> {
    validate_field("secret", value, MAX_SECRET_LEN, is_name_char)
}

pub fn validate_content(value: &str) -> anyhow::Result<()> {
    validate_field("content", value, MAX_CONTENT_LEN, is_content_char)
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::simple("bob", true)]
    #[case::dash_digits("user-42", true)]
    #[case::max_len("abcdefghijklmnopqrst", true)]
    #[case::too_long("abcdefghijklmnopqrstu", false)]
    #[case::empty("", false)]
    #[case::space("bo b", false)]
    #[case::underscore("bo_b", false)]
    #[case::non_ascii("böb", false)]
    fn test_validate_name(#[case] name: &str, #[case] expected: bool) {
        assert_eq!(validate_username(name).is_ok(), expected);
        assert_eq!(validate_display_name(name).is_ok(), expected);
        assert_eq!(validate_channel_id(name).is_ok(), expected);
    }

    #[rstest]
    #[case::short("pw", true)]
    #[case::max_len(&"a".repeat(128), true)]
    #[case::too_long(&"a".repeat(129), false)]
    #[case::punctuation("pw!", false)]
    fn test_validate_secret(#[case] secret: &str, #[case] expected: bool) {
        assert_eq!(validate_secret(secret).is_ok(), expected);
    }

    #[rstest]
    #[case::words("hello there, general kenobi!", true)]
    #[case::tilde("~", true)]
    #[case::max_len(&"x".repeat(1400), true)]
    #[case::too_long(&"x".repeat(1401), false)]
    #[case::newline("a\nb", false)]
    #[case::tab("a\tb", false)]
    #[case::del("a\x7fb", false)]
    #[case::empty("", false)]
    fn test_validate_content(#[case] content: &str, #[case] expected: bool) {
        assert_eq!(validate_content(content).is_ok(), expected);
    }

    #[test]
    fn test_message_type_tags() {
        assert_eq!(u8::from(MessageType::Confirm), 0x00);
        assert_eq!(u8::from(MessageType::Err), 0xFE);
        assert_eq!(MessageType::try_from(0xFFu8).unwrap(), MessageType::Bye);
        assert!(MessageType::try_from(0x05u8).is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let msg = Message::Auth {
            id: 1,
            username: "bob".to_string(),
            display_name: "Bob".to_string(),
            secret: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", msg).contains("hunter2"));
    }
}
