// STOMP 1.2 frames exchanged over the WebSocket
//
// One frame per WebSocket text message:
//   COMMAND\n
//   header:value\n
//   \n
//   body\0

use thiserror::Error;

/// Frame commands understood by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Result<Self, FrameError> {
        Ok(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "DISCONNECT" => Command::Disconnect,
            "CONNECTED" => Command::Connected,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }

    /// CONNECT and CONNECTED headers are not escaped
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("malformed header line {0:?}")]
    MalformedHeader(String),

    #[error("invalid escape sequence in header")]
    InvalidEscape,

    #[error("frame is missing its NUL terminator")]
    Unterminated,

    #[error("content-length {0} exceeds body")]
    ShortBody(usize),

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

/// A single STOMP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header; repeated headers keep the first occurrence
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Header lookup ignoring ASCII case, for clients that lowercase names
    pub fn get_ignore_case(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// CONNECTED reply for a successful connect
    pub fn connected(username: &str) -> Self {
        Frame::new(Command::Connected)
            .header("version", "1.2")
            .header("heart-beat", "0,0")
            .header("user-name", username)
    }

    /// ERROR frame; the server closes the connection after sending it
    pub fn error(message: &str, details: &str) -> Self {
        Frame::new(Command::Error)
            .header("message", message)
            .header("content-type", "text/plain")
            .with_body(details)
    }

    pub fn receipt(receipt_id: &str) -> Self {
        Frame::new(Command::Receipt).header("receipt-id", receipt_id)
    }

    /// Serialize to wire text
    pub fn to_text(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(self.body.len() + 64);

        out.push_str(self.command.as_str());
        out.push('\n');

        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }

        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }

        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one frame. `Ok(None)` is a heart-beat (EOLs only).
    pub fn parse(text: &str) -> Result<Option<Self>, FrameError> {
        let text = text.trim_start_matches(|c: char| c == '\r' || c == '\n');
        if text.is_empty() {
            return Ok(None);
        }

        let (head, rest) = split_head(text);

        let mut lines = head.lines();
        let command = Command::parse(lines.next().ok_or(FrameError::Empty)?.trim_end_matches('\r'))?;
        let unescape = command.escapes_headers();

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if unescape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let mut frame = Frame {
            command,
            headers,
            body: String::new(),
        };

        frame.body = match frame.get("content-length").and_then(|v| v.trim().parse::<usize>().ok()) {
            Some(len) => rest
                .get(..len)
                .ok_or(FrameError::ShortBody(len))?
                .to_string(),
            None if rest.is_empty() => String::new(),
            None => {
                let end = rest.find('\0').ok_or(FrameError::Unterminated)?;
                rest[..end].to_string()
            }
        };

        Ok(Some(frame))
    }
}

/// Split at the first blank line, whichever EOL style the headers use
fn split_head(text: &str) -> (&str, &str) {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let end = offset + line.len();
        if line == "\n" || line == "\r\n" {
            return (&text[..offset], &text[end..]);
        }
        offset = end;
    }
    (text.trim_end_matches('\0'), "")
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape),
        }
    }
    Ok(out)
}
