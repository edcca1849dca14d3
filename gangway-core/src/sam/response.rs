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

//! Response formatting.
//!
//! A response is a verb, an optional action and an ordered list of
//! `KEY=VALUE` options, terminated by `\n`. Values are quoted exactly when
//! they contain whitespace, `"` or `\`.

use crate::error::ResultCode;

use alloc::{
    string::{String, ToString},
    vec::Vec,
};

use super::version::SamVersion;

/// A response line under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Verb.
    verb: String,

    /// Action.
    action: Option<String>,

    /// Options, emitted in insertion order.
    options: Vec<(String, String)>,
}

impl Response {
    /// Start a response for `verb`.
    pub fn new(verb: &str) -> Self {
        Self {
            verb: verb.to_string(),
            action: None,
            options: Vec::new(),
        }
    }

    /// Set the action.
    pub fn with_action(mut self, action: &str) -> Self {
        self.action = Some(action.to_string());
        self
    }

    /// Append `RESULT=<code>`.
    pub fn with_result(self, result: ResultCode) -> Self {
        self.with_option("RESULT", result.as_str())
    }

    /// Append `VERSION=<version>`.
    pub fn with_version(self, version: SamVersion) -> Self {
        self.with_option("VERSION", &alloc::format!("{version}"))
    }

    /// Append `MESSAGE=<message>`, quoted if needed.
    pub fn with_message(self, message: &str) -> Self {
        self.with_option("MESSAGE", message)
    }

    /// Append an option.
    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        self.options.push((key.to_string(), value.to_string()));
        self
    }

    /// Result code of the response, if one was set.
    pub fn result(&self) -> Option<&str> {
        self.options
            .iter()
            .find(|(key, _)| key == "RESULT")
            .map(|(_, value)| value.as_str())
    }

    /// Format the response as a single `\n`-terminated line.
    pub fn format(&self) -> String {
        let mut line = self.verb.clone();

        if let Some(action) = &self.action {
            line.push(' ');
            line.push_str(action);
        }

        for (key, value) in &self.options {
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(&quote_value(value));
        }

        line.push('\n');
        line
    }

    /// Format into the byte vector queued on a socket.
    pub fn into_bytes(self) -> Vec<u8> {
        self.format().into_bytes()
    }

    /// Parse a formatted response line.
    ///
    /// The inverse of [`Response::format()`], preserving option order. Used
    /// by the round-trip tests.
    #[cfg(test)]
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let tokens = super::parser::tokenize(line).ok()?;
        let mut tokens = tokens.into_iter().peekable();

        let verb = tokens.next()?;
        let action = match tokens.peek() {
            Some(token) if !token.contains('=') => tokens.next(),
            _ => None,
        };

        let options = tokens
            .map(|token| {
                let (key, value) = token.split_once('=')?;
                Some((key.to_string(), value.to_string()))
            })
            .collect::<Option<Vec<_>>>()?;

        Some(Self {
            verb,
            action,
            options,
        })
    }
}

/// Quote `value` if it contains whitespace, `"` or `\`.
fn quote_value(value: &str) -> String {
    let needs_quoting =
        value.chars().any(|c| c.is_ascii_whitespace() || matches!(c, '"' | '\\'));

    if !needs_quoting {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for character in value.chars() {
        if matches!(character, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(character);
    }
    quoted.push('"');

    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_reply() {
        let response = Response::new("HELLO")
            .with_action("REPLY")
            .with_result(ResultCode::Ok)
            .with_version(SamVersion::V33);

        assert_eq!(response.format(), "HELLO REPLY RESULT=OK VERSION=3.3\n");
    }

    #[test]
    fn options_in_insertion_order() {
        let response = Response::new("SESSION")
            .with_action("STATUS")
            .with_result(ResultCode::Ok)
            .with_option("DESTINATION", "abcd");

        assert_eq!(
            response.format(),
            "SESSION STATUS RESULT=OK DESTINATION=abcd\n",
        );
    }

    #[test]
    fn message_with_spaces_is_quoted() {
        let response = Response::new("NAMING")
            .with_action("REPLY")
            .with_result(ResultCode::InvalidKey)
            .with_option("NAME", "ME")
            .with_message("no session bound");

        assert_eq!(
            response.format(),
            "NAMING REPLY RESULT=INVALID_KEY NAME=ME MESSAGE=\"no session bound\"\n",
        );
    }

    #[test]
    fn quote_escaping() {
        assert_eq!(quote_value("plain"), "plain");
        assert_eq!(quote_value("a b"), "\"a b\"");
        assert_eq!(quote_value("a\"b"), "\"a\\\"b\"");
        assert_eq!(quote_value("a\\b"), "\"a\\\\b\"");
    }

    #[test]
    fn round_trip() {
        let responses = [
            Response::new("HELLO").with_action("REPLY").with_result(ResultCode::NoVersion),
            Response::new("STREAM").with_action("STATUS").with_result(ResultCode::Ok),
            Response::new("NAMING")
                .with_action("REPLY")
                .with_result(ResultCode::Ok)
                .with_option("NAME", "host.i2p")
                .with_option("VALUE", "value with spaces"),
            Response::new("PONG"),
        ];

        for response in responses {
            assert_eq!(Response::parse(&response.format()), Some(response));
        }
    }
}
