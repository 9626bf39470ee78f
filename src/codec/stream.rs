use anyhow::{anyhow, bail};

use crate::message::Message;

pub const LINE_TERMINATOR: &str = "\r\n";


/// Renders a message as one CRLF terminated line. Message ids are not part of the text protocol
///  and are ignored, and there is no text representation for CONFIRM.
pub fn encode(msg: &Message) -> anyhow::Result<String> {
    let line = match msg {
        Message::Confirm { .. } => bail!("CONFIRM has no representation in the text protocol"),
        Message::Reply { ok, content, .. } => format!("REPLY {} IS {}", if *ok { "OK" } else { "NOK" }, content),
        Message::Auth { username, display_name, secret, .. } => format!("AUTH {} AS {} USING {}", username, display_name, secret),
        Message::Join { channel_id, display_name, .. } => format!("JOIN {} AS {}", channel_id, display_name),
        Message::Msg { display_name, content, .. } => format!("MSG FROM {} IS {}", display_name, content),
        Message::Err { display_name, content, .. } => format!("ERR FROM {} IS {}", display_name, content),
        Message::Bye { .. } => "BYE".to_string(),
    };
    Ok(line + LINE_TERMINATOR)
}

/// Parses a single line without its terminator. Keywords are matched case-insensitively, every
///  field is validated, and messages decoded here carry id 0.
pub fn decode(line: &str) -> anyhow::Result<Message> {
    let (keyword, rest) = match line.split_once(' ') {
        Some((keyword, rest)) => (keyword, Some(rest)),
        None => (line, None),
    };

    let msg = if keyword.eq_ignore_ascii_case("BYE") {
        if rest.is_some() {
            bail!("unexpected arguments after BYE");
        }
        Message::Bye { id: 0 }
    }
    else {
        let rest = rest.ok_or_else(|| anyhow!("missing arguments for {:?}", keyword))?;

        if keyword.eq_ignore_ascii_case("REPLY") {
            let [result, is, content] = split_fields::<3>(rest)?;
            expect_keyword(is, "IS")?;
            let ok = if result.eq_ignore_ascii_case("OK") {
                true
            }
            else if result.eq_ignore_ascii_case("NOK") {
                false
            }
            else {
                bail!("invalid REPLY result {:?}", result);
            };
            Message::Reply { id: 0, ok, ref_id: 0, content: content.to_string() }
        }
        else if keyword.eq_ignore_ascii_case("MSG") || keyword.eq_ignore_ascii_case("ERR") {
            let [from, display_name, is, content] = split_fields::<4>(rest)?;
            expect_keyword(from, "FROM")?;
            expect_keyword(is, "IS")?;
            let display_name = display_name.to_string();
            let content = content.to_string();
            if keyword.eq_ignore_ascii_case("MSG") {
                Message::Msg { id: 0, display_name, content }
            }
            else {
                Message::Err { id: 0, display_name, content }
            }
        }
        else if keyword.eq_ignore_ascii_case("AUTH") {
            let [username, r#as, display_name, using, secret] = split_exact::<5>(rest)?;
            expect_keyword(r#as, "AS")?;
            expect_keyword(using, "USING")?;
            Message::Auth { id: 0, username: username.to_string(), display_name: display_name.to_string(), secret: secret.to_string() }
        }
        else if keyword.eq_ignore_ascii_case("JOIN") {
            let [channel_id, r#as, display_name] = split_exact::<3>(rest)?;
            expect_keyword(r#as, "AS")?;
            Message::Join { id: 0, channel_id: channel_id.to_string(), display_name: display_name.to_string() }
        }
        else {
            bail!("unknown message keyword {:?}", keyword);
        }
    };

    msg.validate()?;
    Ok(msg)
}

fn expect_keyword(actual: &str, expected: &str) -> anyhow::Result<()> {
    if !actual.eq_ignore_ascii_case(expected) {
        bail!("expected {:?}, found {:?}", expected, actual);
    }
    Ok(())
}

/// Splits into exactly N single-space separated fields, the last of which keeps any further
///  spaces (free text content)
fn split_fields<const N: usize>(s: &str) -> anyhow::Result<[&str; N]> {
    let parts = s.splitn(N, ' ').collect::<Vec<_>>();
    parts.try_into()
        .map_err(|parts: Vec<&str>| anyhow!("expected {} fields, found {}", N, parts.len()))
}

/// Splits into exactly N single-space separated fields, none of which may contain a space
fn split_exact<const N: usize>(s: &str) -> anyhow::Result<[&str; N]> {
    let parts = s.split(' ').collect::<Vec<_>>();
    parts.try_into()
        .map_err(|parts: Vec<&str>| anyhow!("expected {} fields, found {}", N, parts.len()))
}
