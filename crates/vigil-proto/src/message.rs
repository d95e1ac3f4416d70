//! IRC message parsing and formatting.
//!
//! Implements the classic `[:prefix] COMMAND params [:trailing]` line format.
//! Parsing follows the tolerant reader pattern: malformed lines yield `None`
//! and are the caller's job to log and skip, never an error that tears down
//! the stream.

use std::fmt;

/// A single parsed IRC message.
///
/// The command is uppercased on parse so callers can match on `"PING"`,
/// `"PRIVMSG"`, `"001"` etc. without case juggling. A trailing parameter is
/// stored as a regular element of `params`; formatting re-adds the `:` marker
/// when needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    /// Build an outbound message with no prefix.
    pub fn new<C, P>(command: C, params: P) -> Self
    where
        C: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Self {
            prefix: None,
            command: command.into().to_ascii_uppercase(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse one line (already stripped of `\r\n`).
    ///
    /// Returns `None` for empty or command-less lines.
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim_start();
        if rest.is_empty() {
            return None;
        }

        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            let (prefix, tail) = stripped.split_once(' ')?;
            rest = tail.trim_start();
            Some(prefix.to_string())
        } else {
            None
        };

        let (command, tail) = match rest.split_once(' ') {
            Some((command, tail)) => (command, tail.trim_start()),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        let mut tail = tail;
        while !tail.is_empty() {
            if let Some(trailing) = tail.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match tail.split_once(' ') {
                Some((param, next)) => {
                    params.push(param.to_string());
                    tail = next.trim_start();
                }
                None => {
                    params.push(tail.to_string());
                    break;
                }
            }
        }

        Some(Self {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Nickname portion of the prefix (`nick!user@host` -> `nick`).
    pub fn source_nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split('!').next().unwrap_or(prefix))
    }

    /// Render the wire form including the trailing `\r\n`.
    pub fn to_line(&self) -> String {
        format!("{self}\r\n")
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }
        write!(f, "{}", self.command)?;
        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            // The final parameter of a multi-parameter message is sent as
            // trailing; a lone parameter only when the wire form demands it.
            let trailing = i == last
                && (self.params.len() > 1
                    || param.is_empty()
                    || param.contains(' ')
                    || param.starts_with(':'));
            if trailing {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_only() {
        let msg = Message::parse("PING").unwrap();
        assert_eq!(msg.command, "PING");
        assert!(msg.prefix.is_none());
        assert!(msg.params.is_empty());
    }

    #[test]
    fn parses_prefix_and_trailing() {
        let msg = Message::parse(":irc.example.net 001 vigil :Welcome to the network").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("irc.example.net"));
        assert_eq!(msg.command, "001");
        assert_eq!(msg.params, vec!["vigil", "Welcome to the network"]);
    }

    #[test]
    fn parses_privmsg() {
        let msg = Message::parse(":nick!user@host PRIVMSG #chan :hello there").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chan", "hello there"]);
        assert_eq!(msg.source_nick(), Some("nick"));
    }

    #[test]
    fn uppercases_command() {
        let msg = Message::parse("ping :12345").unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["12345"]);
    }

    #[test]
    fn rejects_empty_lines() {
        assert!(Message::parse("").is_none());
        assert!(Message::parse("   ").is_none());
        assert!(Message::parse(":prefix-without-command").is_none());
    }

    #[test]
    fn formats_trailing_param() {
        let msg = Message::new("PRIVMSG", ["#chan", "hello there"]);
        assert_eq!(msg.to_string(), "PRIVMSG #chan :hello there");
    }

    #[test]
    fn formats_single_word_params_bare() {
        let msg = Message::new("JOIN", ["#chan"]);
        assert_eq!(msg.to_string(), "JOIN #chan");
    }

    #[test]
    fn final_param_of_many_is_trailing() {
        let msg = Message::new("USER", ["sentry", "0", "*", "sentry"]);
        assert_eq!(msg.to_string(), "USER sentry 0 * :sentry");
    }

    #[test]
    fn roundtrips_wire_form() {
        let line = ":nick!u@h PRIVMSG #chan :multi word text";
        let msg = Message::parse(line).unwrap();
        assert_eq!(msg.to_string(), line);
    }

    #[test]
    fn to_line_appends_crlf() {
        let msg = Message::new("PONG", ["12345"]);
        assert_eq!(msg.to_line(), "PONG 12345\r\n");
    }
}
