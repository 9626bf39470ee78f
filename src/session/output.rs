/// Where a session reports what the user needs to see: chat messages from other participants,
///  replies to requests, and errors.
pub trait ChatOutput: Send + Sync + 'static {
    fn chat_message(&self, display_name: &str, content: &str);

    fn reply(&self, ok: bool, content: &str);

    /// an ERR received from the server
    fn peer_error(&self, display_name: &str, content: &str);

    /// a locally detected problem
    fn local_error(&self, text: &str);
}

/// Chat messages go to stdout, everything else to stderr
pub struct ConsoleOutput;

impl ChatOutput for ConsoleOutput {
    fn chat_message(&self, display_name: &str, content: &str) {
        println!("{}", format_chat_message(display_name, content));
    }

    fn reply(&self, ok: bool, content: &str) {
        eprintln!("{}", format_reply(ok, content));
    }

    fn peer_error(&self, display_name: &str, content: &str) {
        eprintln!("{}", format_peer_error(display_name, content));
    }

    fn local_error(&self, text: &str) {
        eprintln!("{}", format_local_error(text));
    }
}

pub fn format_chat_message(display_name: &str, content: &str) -> String {
    format!("{}: {}", display_name, content)
}

pub fn format_reply(ok: bool, content: &str) -> String {
    if ok {
        format!("Success: {}", content)
    }
    else {
        format!("Failure: {}", content)
    }
}

pub fn format_peer_error(display_name: &str, content: &str) -> String {
    format!("ERR FROM {}: {}", display_name, content)
}

pub fn format_local_error(text: &str) -> String {
    format!("ERR: {}", text)
}
