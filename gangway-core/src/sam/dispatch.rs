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

//! Command routing.
//!
//! Commands are routed by `"VERB ACTION"` first and `"VERB"` second, both
//! upper-cased. Anything unmatched goes to a fallback that embedders may
//! replace through the handler registrar hook.

use crate::error::ResultCode;

use hashbrown::HashMap;

use alloc::{
    boxed::Box,
    string::{String, ToString},
};

use super::{parser::Command, response::Response};

/// The operations the bridge knows how to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// `HELLO VERSION`.
    HelloVersion,

    /// `SESSION CREATE`.
    SessionCreate,

    /// `SESSION ADD`, primary sessions only.
    SessionAdd,

    /// `SESSION REMOVE`, primary sessions only.
    SessionRemove,

    /// `STREAM CONNECT`.
    StreamConnect,

    /// `STREAM ACCEPT`.
    StreamAccept,

    /// `STREAM FORWARD`.
    StreamForward,

    /// `DATAGRAM SEND` on the control socket.
    DatagramSend,

    /// `RAW SEND` on the control socket.
    RawSend,

    /// `DEST GENERATE`.
    DestGenerate,

    /// `NAMING LOOKUP`.
    NamingLookup,

    /// `PING`, echoed back as `PONG`.
    Ping,

    /// `PONG`, reply to a server-initiated `PING`.
    Pong,

    /// `QUIT`/`STOP`/`EXIT`.
    Quit,

    /// `HELP`.
    Help,

    /// `AUTH ENABLE`.
    AuthEnable,

    /// `AUTH DISABLE`.
    AuthDisable,

    /// `AUTH ADD`.
    AuthAdd,

    /// `AUTH REMOVE`.
    AuthRemove,
}

/// Fallback handler for unrouted commands.
pub type FallbackHandler = Box<dyn Fn(&Command) -> Response + Send + Sync>;

/// Command router.
///
/// Handlers are cheap dispatch targets and the table is read-only once the
/// server is running, so lookups take no lock.
pub struct CommandRouter {
    /// Routing table, keyed by `"VERB"` or `"VERB ACTION"`.
    handlers: HashMap<String, CommandKind>,

    /// Handler invoked when no key matches.
    fallback: Option<FallbackHandler>,
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRouter {
    /// Create a router with the default handler table.
    pub fn new() -> Self {
        let mut router = Self {
            handlers: HashMap::new(),
            fallback: None,
        };

        router.register("HELLO VERSION", CommandKind::HelloVersion);
        router.register("SESSION CREATE", CommandKind::SessionCreate);
        router.register("SESSION ADD", CommandKind::SessionAdd);
        router.register("SESSION REMOVE", CommandKind::SessionRemove);
        router.register("STREAM CONNECT", CommandKind::StreamConnect);
        router.register("STREAM ACCEPT", CommandKind::StreamAccept);
        router.register("STREAM FORWARD", CommandKind::StreamForward);
        router.register("DATAGRAM SEND", CommandKind::DatagramSend);
        router.register("RAW SEND", CommandKind::RawSend);
        router.register("DEST GENERATE", CommandKind::DestGenerate);
        router.register("NAMING LOOKUP", CommandKind::NamingLookup);
        router.register("PING", CommandKind::Ping);
        router.register("PONG", CommandKind::Pong);
        router.register("QUIT", CommandKind::Quit);
        router.register("STOP", CommandKind::Quit);
        router.register("EXIT", CommandKind::Quit);
        router.register("HELP", CommandKind::Help);
        router.register("AUTH ENABLE", CommandKind::AuthEnable);
        router.register("AUTH DISABLE", CommandKind::AuthDisable);
        router.register("AUTH ADD", CommandKind::AuthAdd);
        router.register("AUTH REMOVE", CommandKind::AuthRemove);

        router
    }

    /// Register `kind` for `key` (`"VERB"` or `"VERB ACTION"`).
    pub fn register(&mut self, key: &str, kind: CommandKind) {
        self.handlers.insert(key.to_uppercase(), kind);
    }

    /// Remove the handler for `key`.
    pub fn deregister(&mut self, key: &str) {
        self.handlers.remove(&key.to_uppercase());
    }

    /// Replace the unknown-command fallback.
    pub fn set_fallback(&mut self, fallback: FallbackHandler) {
        self.fallback = Some(fallback);
    }

    /// Route `command`: exact `"VERB ACTION"` match first, then `"VERB"`.
    pub fn route(&self, command: &Command) -> Option<CommandKind> {
        if let Some(action) = &command.action {
            let key = alloc::format!("{} {}", command.verb, action);

            if let Some(kind) = self.handlers.get(&key) {
                return Some(*kind);
            }
        }

        self.handlers.get(&command.verb).copied()
    }

    /// Build the `HELP` response: the registered command keys, sorted.
    pub fn help(&self) -> Response {
        let mut keys = self.handlers.keys().map(String::as_str).collect::<alloc::vec::Vec<_>>();
        keys.sort_unstable();

        Response::new("HELP")
            .with_result(ResultCode::Ok)
            .with_message(&keys.join(", "))
    }

    /// Build the response for a command no handler matched.
    pub fn unknown_command(&self, command: &Command) -> Response {
        match &self.fallback {
            Some(fallback) => fallback(command),
            None => {
                let verb = if command.verb.is_empty() {
                    "ERROR".to_string()
                } else {
                    command.verb.clone()
                };

                Response::new(&verb)
                    .with_action("STATUS")
                    .with_result(ResultCode::I2pError)
                    .with_message("unknown command")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_beats_verb_match() {
        let mut router = CommandRouter::new();
        router.register("STREAM", CommandKind::Help);

        let command = Command::parse("STREAM CONNECT ID=x DESTINATION=y").unwrap();
        assert_eq!(router.route(&command), Some(CommandKind::StreamConnect));
    }

    #[test]
    fn verb_only_fallback() {
        let router = CommandRouter::new();

        let command = Command::parse("PING hello").unwrap();
        assert_eq!(router.route(&command), Some(CommandKind::Ping));
    }

    #[test]
    fn quit_aliases() {
        let router = CommandRouter::new();

        for verb in ["QUIT", "STOP", "EXIT"] {
            let command = Command::parse(verb).unwrap();
            assert_eq!(router.route(&command), Some(CommandKind::Quit), "{verb}");
        }
    }

    #[test]
    fn unknown_action_falls_back_to_verb() {
        let router = CommandRouter::new();

        // `SESSION LIST` is not registered but `SESSION` has no verb-only
        // handler either
        let command = Command::parse("SESSION LIST").unwrap();
        assert_eq!(router.route(&command), None);
    }

    #[test]
    fn unknown_command_response() {
        let router = CommandRouter::new();
        let command = Command::parse("FROBNICATE NOW").unwrap();

        assert_eq!(router.route(&command), None);
        assert_eq!(
            router.unknown_command(&command).format(),
            "FROBNICATE STATUS RESULT=I2P_ERROR MESSAGE=\"unknown command\"\n",
        );
    }

    #[test]
    fn custom_fallback() {
        let mut router = CommandRouter::new();
        router.set_fallback(Box::new(|command| {
            Response::new(&command.verb).with_result(ResultCode::Ok)
        }));

        let command = Command::parse("FROBNICATE").unwrap();
        assert_eq!(router.unknown_command(&command).format(), "FROBNICATE RESULT=OK\n");
    }

    #[test]
    fn deregistered_command_unroutable() {
        let mut router = CommandRouter::new();
        router.deregister("DEST GENERATE");

        let command = Command::parse("DEST GENERATE").unwrap();
        assert_eq!(router.route(&command), None);
    }
}
