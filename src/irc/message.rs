/// IRC message parsing and serialization.
///
/// Implements the RFC 2812 message format plus the IRCv3 `message-tags`
/// extension:
///   [`@`tags SPACE] [`:`prefix SPACE] command [SPACE params] [SPACE `:` trailing]
///
/// The bridge stamps a `time` tag on replayed timeline posts so clients
/// that negotiated `message-tags` can show the original post time.
/// Messages are terminated by CR-LF (or bare LF) on the wire, but parsing
/// operates on the content without the terminator.
use std::fmt;

/// A parsed IRC message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 message tags (key → value). Empty for untagged messages.
    pub tags: Vec<(String, String)>,
    /// Optional prefix (server name or `nick!user@host`).
    pub prefix: Option<String>,
    /// The command (e.g. `PRIVMSG`, `001`, `NICK`).
    pub command: String,
    /// Parameters — the last may have been a trailing param (with spaces).
    pub params: Vec<String>,
}

/// Errors that can occur during message parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("prefix present but missing command")]
    MissingCommand,
}

impl Message {
    /// Build an untagged message.
    pub fn new(prefix: Option<String>, command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            tags: Vec::new(),
            prefix,
            command: command.into(),
            params,
        }
    }

    /// Attach a message tag (builder style).
    pub fn tagged(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    /// Parse a single IRC message from a line (without the trailing `\r\n`).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let input = input.trim_end_matches("\r\n");

        if input.is_empty() {
            return Err(ParseError::Empty);
        }

        // Tags run from `@` until the first space.
        let (tags, rest) = if let Some(tag_str) = input.strip_prefix('@') {
            match tag_str.find(' ') {
                Some(idx) => (parse_tags(&tag_str[..idx]), &tag_str[idx + 1..]),
                None => return Err(ParseError::MissingCommand),
            }
        } else {
            (Vec::new(), input)
        };

        let (prefix, rest) = if rest.starts_with(':') {
            // Prefix runs until the first space.
            match rest[1..].find(' ') {
                Some(idx) => (Some(rest[1..=idx].to_owned()), &rest[idx + 2..]),
                None => return Err(ParseError::MissingCommand),
            }
        } else {
            (None, rest)
        };

        // Split into command and parameter portion.
        let (command, param_str) = match rest.find(' ') {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };

        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();

        if let Some(mut remaining) = param_str {
            while !remaining.is_empty() {
                if remaining.starts_with(':') {
                    // Trailing parameter: everything after the colon, including spaces.
                    params.push(remaining[1..].to_owned());
                    break;
                }
                match remaining.find(' ') {
                    Some(idx) => {
                        params.push(remaining[..idx].to_owned());
                        remaining = &remaining[idx + 1..];
                    }
                    None => {
                        params.push(remaining.to_owned());
                        break;
                    }
                }
            }
        }

        Ok(Message {
            tags,
            prefix,
            command: command.to_owned(),
            params,
        })
    }

    /// Serialize to the IRC wire format (without trailing `\r\n`).
    pub fn to_wire(&self) -> String {
        let mut out = String::new();

        if !self.tags.is_empty() {
            out.push('@');
            let mut first = true;
            for (key, value) in &self.tags {
                if !first {
                    out.push(';');
                }
                first = false;
                out.push_str(key);
                if !value.is_empty() {
                    out.push('=');
                    out.push_str(&escape_tag_value(value));
                }
            }
            out.push(' ');
        }

        if let Some(ref prefix) = self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }

        out.push_str(&self.command);

        if !self.params.is_empty() {
            let last_idx = self.params.len() - 1;
            for (i, param) in self.params.iter().enumerate() {
                out.push(' ');
                if i == last_idx {
                    // Always prefix the last parameter with `:`.
                    // This is always valid per RFC 2812 and avoids edge cases
                    // where a trailing param could be misinterpreted.
                    out.push(':');
                }
                out.push_str(param);
            }
        }

        out
    }
}

/// Parse the `key=value;key2=value2` tag portion.
fn parse_tags(tag_str: &str) -> Vec<(String, String)> {
    tag_str
        .split(';')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_owned(), unescape_tag_value(value)),
            None => (pair.to_owned(), String::new()),
        })
        .collect()
}

/// Escape a tag value per the IRCv3 message-tags spec.
fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}
