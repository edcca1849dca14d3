// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Command line parser.
//!
//! Commands have the form `VERB [ACTION] [KEY=VALUE ...]`. Verbs and actions
//! match case-insensitively and are normalized to upper case; option keys are
//! case-sensitive. Values may be quoted to carry whitespace, with `\"` and
//! `\\` as the only escapes permitted inside quotes.

use crate::error::ProtocolError;

use hashbrown::HashMap;

use alloc::{
    string::{String, ToString},
    vec::Vec,
};
use core::str::FromStr;

/// Verbs that may be followed by an action token.
const ACTION_VERBS: [&str; 8] = [
    "HELLO", "SESSION", "STREAM", "DATAGRAM", "RAW", "DEST", "NAMING", "AUTH",
];

/// Verbs whose trailing text is free-form payload, never options.
const PAYLOAD_VERBS: [&str; 6] = ["PING", "PONG", "QUIT", "STOP", "EXIT", "HELP"];

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Verb, upper-cased.
    pub verb: String,

    /// Action, upper-cased, if present.
    pub action: Option<String>,

    /// `KEY=VALUE` options. Keys are case-sensitive, values may be empty.
    pub options: HashMap<String, String>,

    /// Free-form payload following a payload-style verb.
    pub payload: Option<String>,
}

impl Command {
    /// Parse a single command line, line terminator already stripped.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();

        if line.is_empty() {
            return Err(ProtocolError::EmptyCommand);
        }

        let (first, rest) = match line.find(|c: char| c.is_ascii_whitespace()) {
            Some(pos) => (&line[..pos], &line[pos + 1..]),
            None => (line, ""),
        };
        let verb = first.to_uppercase();

        // payload verbs carry their trailing text verbatim
        if PAYLOAD_VERBS.contains(&verb.as_str()) {
            return Ok(Self {
                verb,
                action: None,
                options: HashMap::new(),
                payload: (!rest.is_empty()).then(|| rest.to_string()),
            });
        }

        let tokens = tokenize(rest)?;

        let mut action = None;
        let mut options = HashMap::new();

        for (index, token) in tokens.into_iter().enumerate() {
            if index == 0 && !token.contains('=') && ACTION_VERBS.contains(&verb.as_str()) {
                action = Some(token.to_uppercase());
                continue;
            }

            let (key, value) = parse_option(&token)?;
            options.insert(key, value);
        }

        Ok(Self {
            verb,
            action,
            options,
            payload: None,
        })
    }

    /// Get the value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Get the value of `key`, or `default` if absent.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Whether `key` is present with the literal value `true`.
    pub fn get_true(&self, key: &str) -> bool {
        self.get(key).map(|value| value.parse::<bool>().unwrap_or(false)).unwrap_or(false)
    }

    /// Get the value of `key` parsed as `T`.
    ///
    /// Returns `Ok(None)` if the key is absent and `Err(())` if the value
    /// fails to parse.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, ()> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value.parse::<T>().map(Some).map_err(|_| ()),
        }
    }

    /// Routing key: `"VERB ACTION"` when an action is present, `"VERB"`
    /// otherwise.
    pub fn key(&self) -> String {
        match &self.action {
            Some(action) => alloc::format!("{} {}", self.verb, action),
            None => self.verb.clone(),
        }
    }
}

/// Split `input` into tokens on unquoted whitespace.
///
/// Double quotes make whitespace literal and are stripped; a backslash
/// escapes the next character. Inside quotes only `\"` and `\\` are valid
/// escapes.
pub(super) fn tokenize(input: &str) -> Result<Vec<String>, ProtocolError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut escaped = false;
    // tracks whether the current token saw a quote, so `KEY=""` yields a token
    let mut quoted = false;

    for character in input.chars() {
        if escaped {
            if in_quote && !matches!(character, '"' | '\\') {
                return Err(ProtocolError::InvalidEscape);
            }

            current.push(character);
            escaped = false;
            continue;
        }

        match character {
            '\\' => escaped = true,
            '"' => {
                in_quote = !in_quote;
                quoted = true;
            }
            c if c.is_ascii_whitespace() && !in_quote => {
                if !current.is_empty() || quoted {
                    tokens.push(core::mem::take(&mut current));
                    quoted = false;
                }
            }
            c => current.push(c),
        }
    }

    if in_quote {
        return Err(ProtocolError::UnclosedQuote);
    }
    if escaped {
        return Err(ProtocolError::TrailingBackslash);
    }
    if !current.is_empty() || quoted {
        tokens.push(current);
    }

    Ok(tokens)
}

/// Parse one `KEY=VALUE` token.
///
/// `KEY=` and bare `KEY` both yield an empty value.
fn parse_option(token: &str) -> Result<(String, String), ProtocolError> {
    let (key, value) = match token.split_once('=') {
        Some((key, value)) => (key, value),
        None => (token, ""),
    };

    if key.is_empty() {
        return Err(ProtocolError::InvalidOption);
    }

    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hello() {
        let command = Command::parse("HELLO VERSION MIN=3.1 MAX=3.3").unwrap();

        assert_eq!(command.verb, "HELLO");
        assert_eq!(command.action.as_deref(), Some("VERSION"));
        assert_eq!(command.get("MIN"), Some("3.1"));
        assert_eq!(command.get("MAX"), Some("3.3"));
    }

    #[test]
    fn verbs_and_actions_case_insensitive() {
        let command = Command::parse("session create STYLE=STREAM ID=x").unwrap();

        assert_eq!(command.verb, "SESSION");
        assert_eq!(command.action.as_deref(), Some("CREATE"));
        assert_eq!(command.key(), "SESSION CREATE");
    }

    #[test]
    fn option_keys_case_sensitive() {
        let command = Command::parse("SESSION CREATE id=x ID=y").unwrap();

        assert_eq!(command.get("id"), Some("x"));
        assert_eq!(command.get("ID"), Some("y"));
    }

    #[test]
    fn empty_values() {
        let command = Command::parse("SESSION CREATE A= B=\"\" C").unwrap();

        assert_eq!(command.get("A"), Some(""));
        assert_eq!(command.get("B"), Some(""));
        assert_eq!(command.get("C"), Some(""));
    }

    #[test]
    fn quoted_value_with_spaces() {
        let command = Command::parse("NAMING LOOKUP NAME=\"a b\"").unwrap();

        assert_eq!(command.get("NAME"), Some("a b"));
    }

    #[test]
    fn quoted_escapes() {
        let command = Command::parse(r#"AUTH ADD USER="a\"b" PASSWORD="c\\d""#).unwrap();

        assert_eq!(command.get("USER"), Some(r#"a"b"#));
        assert_eq!(command.get("PASSWORD"), Some(r"c\d"));
    }

    #[test]
    fn invalid_escape_inside_quotes() {
        assert_eq!(
            Command::parse(r#"AUTH ADD USER="a\tb""#).unwrap_err(),
            ProtocolError::InvalidEscape,
        );
    }

    #[test]
    fn unclosed_quote() {
        assert_eq!(
            Command::parse("NAMING LOOKUP NAME=\"a b").unwrap_err(),
            ProtocolError::UnclosedQuote,
        );
    }

    #[test]
    fn trailing_backslash() {
        assert_eq!(
            Command::parse("NAMING LOOKUP NAME=a\\").unwrap_err(),
            ProtocolError::TrailingBackslash,
        );
    }

    #[test]
    fn empty_line() {
        assert_eq!(Command::parse("").unwrap_err(), ProtocolError::EmptyCommand);
        assert_eq!(Command::parse("   ").unwrap_err(), ProtocolError::EmptyCommand);
    }

    #[test]
    fn ping_payload_kept_verbatim() {
        let command = Command::parse("PING keepalive  with  spaces").unwrap();

        assert_eq!(command.verb, "PING");
        assert_eq!(command.payload.as_deref(), Some("keepalive  with  spaces"));
        assert!(command.options.is_empty());
    }

    #[test]
    fn ping_without_payload() {
        let command = Command::parse("PING").unwrap();

        assert_eq!(command.payload, None);
    }

    #[test]
    fn quit_takes_no_action() {
        let command = Command::parse("QUIT NOW").unwrap();

        assert_eq!(command.verb, "QUIT");
        assert_eq!(command.action, None);
        assert_eq!(command.payload.as_deref(), Some("NOW"));
    }

    #[test]
    fn second_token_with_equals_is_option() {
        let command = Command::parse("NAMING LOOKUP NAME=ME").unwrap();
        assert_eq!(command.action.as_deref(), Some("LOOKUP"));

        let command = Command::parse("NAMING NAME=ME").unwrap();
        assert_eq!(command.action, None);
        assert_eq!(command.get("NAME"), Some("ME"));
    }

    #[test]
    fn dotted_option_keys() {
        let command =
            Command::parse("SESSION CREATE STYLE=STREAM ID=x i2cp.leaseSetEncType=4,0").unwrap();

        assert_eq!(command.get("i2cp.leaseSetEncType"), Some("4,0"));
    }
}
