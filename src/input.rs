use thiserror::Error;

use crate::message::{validate_channel_id, validate_content, validate_display_name, validate_secret, validate_username};


/// One line of user input
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Command {
    Auth {
        username: String,
        display_name: String,
        secret: String,
    },
    Join {
        channel_id: String,
    },
    Rename {
        display_name: String,
    },
    Help,
    ChatMessage(String),
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum InputError {
    #[error("Unknown command {0}.")]
    UnknownCommand(String),
    #[error("Invalid command usage.")]
    Usage,
    #[error("Invalid username.")]
    Username,
    #[error("Invalid secret.")]
    Secret,
    #[error("Invalid display name.")]
    DisplayName,
    #[error("Invalid channel name.")]
    ChannelId,
    #[error("Invalid message.")]
    Message,
}

pub const HELP_TEXT: &str = "\
Commands:
  /auth {Username} {DisplayName} {Secret}   authenticate with the server
  /join {ChannelID}                         switch to another channel
  /rename {DisplayName}                     change the name shown to others
  /help                                     show this text
Any other line is sent as a chat message.";

/// Parses a line read from the terminal, `None` for a blank line. Arguments are validated here so
///  that invalid input never reaches the session.
pub fn parse_line(line: &str) -> Result<Option<Command>, InputError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }

    let Some(command_line) = line.strip_prefix('/') else {
        validate_content(line).map_err(|_| InputError::Message)?;
        return Ok(Some(Command::ChatMessage(line.to_string())));
    };

    let mut parts = command_line.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let args = parts.collect::<Vec<_>>();

    let command = match (name, args.as_slice()) {
        ("auth", &[username, display_name, secret]) => {
            validate_username(username).map_err(|_| InputError::Username)?;
            validate_display_name(display_name).map_err(|_| InputError::DisplayName)?;
            validate_secret(secret).map_err(|_| InputError::Secret)?;
            Command::Auth {
                username: username.to_string(),
                display_name: display_name.to_string(),
                secret: secret.to_string(),
            }
        }
        ("join", &[channel_id]) => {
            validate_channel_id(channel_id).map_err(|_| InputError::ChannelId)?;
            Command::Join { channel_id: channel_id.to_string() }
        }
        ("rename", &[display_name]) => {
            validate_display_name(display_name).map_err(|_| InputError::DisplayName)?;
            Command::Rename { display_name: display_name.to_string() }
        }
        ("help", &[]) => Command::Help,
        ("auth" | "join" | "rename" | "help", _) => return Err(InputError::Usage),
        (other, _) => return Err(InputError::UnknownCommand(format!("/{}", other))),
    };
    Ok(Some(command))
}
