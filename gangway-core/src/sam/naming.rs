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

//! Name resolution and destination generation.
//!
//! `NAMING LOOKUP` answers `ME` and Base64-literal names locally and defers
//! `*.i2p`/`*.b32.i2p` to the router capability; `DEST GENERATE` issues new
//! destinations through the same capability.

use crate::{
    crypto::is_base64_char,
    error::{QueryError, ResultCode},
    primitives::{Destination, SignatureType},
    router::RouterClient,
    sam::{parser::Command, response::Response},
};

use hashbrown::HashMap;
use spin::Mutex;

use alloc::{
    collections::VecDeque,
    string::{String, ToString},
};

/// Logging target for the file.
const LOG_TARGET: &str = "gangway::sam::naming";

/// Minimum length of a Base64 destination literal.
pub const MIN_DESTINATION_B64_LEN: usize = 516;

/// Bound of the destination parse cache.
const CACHE_CAPACITY: usize = 1000;

/// Bounded cache of parsed public destinations.
///
/// Repeated connects and sends to the same peer skip re-decoding the Base64
/// blob. Eviction is insertion-order.
pub struct DestinationCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    /// Base64 form → parsed destination.
    entries: HashMap<String, Destination>,

    /// Insertion order, oldest first.
    order: VecDeque<String>,
}

impl Default for DestinationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DestinationCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Parse `input` as a public destination, consulting the cache first.
    pub fn parse(&self, input: &str) -> Result<Destination, crate::error::DestinationError> {
        if let Some(destination) = self.inner.lock().entries.get(input) {
            return Ok(destination.clone());
        }

        let destination = Destination::from_public_b64(input)?;

        let mut inner = self.inner.lock();
        if inner.entries.len() == CACHE_CAPACITY {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
        inner.order.push_back(input.to_string());
        inner.entries.insert(input.to_string(), destination.clone());

        Ok(destination)
    }

    /// Number of cached destinations.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

/// Whether `name` is syntactically a Base64 destination literal.
pub fn looks_like_destination(name: &str) -> bool {
    name.len() >= MIN_DESTINATION_B64_LEN && name.chars().all(is_base64_char)
}

/// Whether `name` should be resolved by the router.
fn is_router_name(name: &str) -> bool {
    let lower = name.to_lowercase();

    lower.ends_with(".i2p")
}

/// Outcome of routing a `NAMING LOOKUP`.
pub enum LookupOutcome {
    /// Answer immediately.
    Reply(Response),

    /// Start a router lookup for `name`; the reply is deferred until the
    /// lookup resolves.
    Deferred {
        /// Name to resolve.
        name: String,
    },
}

/// Route a `NAMING LOOKUP` command.
///
/// `bound` is the destination of the session bound to the connection, if
/// any; it answers `NAME=ME`.
pub fn lookup(command: &Command, bound: Option<&Destination>) -> LookupOutcome {
    let Some(name) = command.get("NAME") else {
        return LookupOutcome::Reply(
            Response::new("NAMING")
                .with_action("REPLY")
                .with_result(ResultCode::InvalidKey)
                .with_message("missing NAME"),
        );
    };

    // lease-set options require a provider the bridge does not carry
    if command.get_true("OPTIONS") {
        return LookupOutcome::Reply(
            Response::new("NAMING")
                .with_action("REPLY")
                .with_result(ResultCode::I2pError)
                .with_option("NAME", name)
                .with_message("lease set options not supported"),
        );
    }

    if name == "ME" {
        return LookupOutcome::Reply(match bound {
            Some(destination) => Response::new("NAMING")
                .with_action("REPLY")
                .with_result(ResultCode::Ok)
                .with_option("NAME", "ME")
                .with_option("VALUE", &destination.to_public_b64()),
            None => Response::new("NAMING")
                .with_action("REPLY")
                .with_result(ResultCode::InvalidKey)
                .with_option("NAME", "ME")
                .with_message("no session bound"),
        });
    }

    if looks_like_destination(name) {
        return LookupOutcome::Reply(match Destination::from_public_b64(name) {
            Ok(_) => Response::new("NAMING")
                .with_action("REPLY")
                .with_result(ResultCode::Ok)
                .with_option("NAME", name)
                .with_option("VALUE", name),
            Err(error) => {
                tracing::debug!(
                    target: LOG_TARGET,
                    ?error,
                    "base64-looking name failed validation",
                );

                Response::new("NAMING")
                    .with_action("REPLY")
                    .with_result(ResultCode::InvalidKey)
                    .with_option("NAME", name)
                    .with_message("malformed destination")
            }
        });
    }

    if is_router_name(name) {
        return LookupOutcome::Deferred {
            name: name.to_string(),
        };
    }

    LookupOutcome::Reply(
        Response::new("NAMING")
            .with_action("REPLY")
            .with_result(ResultCode::InvalidKey)
            .with_option("NAME", name)
            .with_message("unknown name format"),
    )
}

/// Build the reply for a finished router lookup.
pub fn lookup_reply(name: &str, result: &Result<String, QueryError>) -> Response {
    match result {
        Ok(value) => Response::new("NAMING")
            .with_action("REPLY")
            .with_result(ResultCode::Ok)
            .with_option("NAME", name)
            .with_option("VALUE", value),
        Err(QueryError::KeyNotFound) => Response::new("NAMING")
            .with_action("REPLY")
            .with_result(ResultCode::KeyNotFound)
            .with_option("NAME", name),
        Err(QueryError::Timeout) => Response::new("NAMING")
            .with_action("REPLY")
            .with_result(ResultCode::Timeout)
            .with_option("NAME", name),
        Err(error) => Response::new("NAMING")
            .with_action("REPLY")
            .with_result(ResultCode::InvalidKey)
            .with_option("NAME", name)
            .with_message(&alloc::format!("{error}")),
    }
}

/// Handle `DEST GENERATE`.
///
/// Only Ed25519 (signature type 7) is supported; unknown types answer
/// `INVALID_KEY`.
pub fn generate(router: &dyn RouterClient, command: &Command) -> Response {
    let signature_type = match command.get_parsed::<u16>("SIGNATURE_TYPE") {
        Ok(None) => SignatureType::ED25519,
        Ok(Some(value)) => SignatureType::new(value),
        Err(()) =>
            return Response::new("DEST")
                .with_action("REPLY")
                .with_result(ResultCode::InvalidKey)
                .with_message("malformed signature type"),
    };

    if signature_type != SignatureType::ED25519 {
        return Response::new("DEST")
            .with_action("REPLY")
            .with_result(ResultCode::InvalidKey)
            .with_message("unsupported signature type");
    }

    match router.generate_destination(signature_type) {
        Ok((public, private)) => Response::new("DEST")
            .with_action("REPLY")
            .with_option("PUB", &public)
            .with_option("PRIV", &private),
        Err(error) => {
            tracing::warn!(
                target: LOG_TARGET,
                ?error,
                "destination generation failed",
            );

            Response::new("DEST")
                .with_action("REPLY")
                .with_result(ResultCode::I2pError)
                .with_message(&alloc::format!("{error}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::base64_encode, primitives::tests::make_private_blob};

    fn bound_destination() -> Destination {
        Destination::from_private_b64(&base64_encode(make_private_blob(1))).unwrap()
    }

    fn reply_of(outcome: LookupOutcome) -> Response {
        match outcome {
            LookupOutcome::Reply(response) => response,
            LookupOutcome::Deferred { name } => panic!("unexpected deferred lookup for {name}"),
        }
    }

    #[test]
    fn lookup_me_with_session() {
        let destination = bound_destination();
        let command = Command::parse("NAMING LOOKUP NAME=ME").unwrap();

        let response = reply_of(lookup(&command, Some(&destination)));
        assert_eq!(
            response.format(),
            alloc::format!(
                "NAMING REPLY RESULT=OK NAME=ME VALUE={}\n",
                destination.to_public_b64(),
            ),
        );
    }

    #[test]
    fn lookup_me_without_session() {
        let command = Command::parse("NAMING LOOKUP NAME=ME").unwrap();

        let response = reply_of(lookup(&command, None));
        assert_eq!(
            response.format(),
            "NAMING REPLY RESULT=INVALID_KEY NAME=ME MESSAGE=\"no session bound\"\n",
        );
    }

    #[test]
    fn lookup_base64_literal() {
        let destination = bound_destination();
        let literal = destination.to_public_b64();
        assert!(looks_like_destination(&literal));

        let command =
            Command::parse(&alloc::format!("NAMING LOOKUP NAME={literal}")).unwrap();
        let response = reply_of(lookup(&command, None));

        assert_eq!(response.result(), Some("OK"));
        assert_eq!(
            response.format().contains(&alloc::format!("VALUE={literal}")),
            true,
        );
    }

    #[test]
    fn lookup_base64_looking_garbage() {
        // right alphabet and length, wrong structure
        let literal = "A".repeat(MIN_DESTINATION_B64_LEN);
        let command =
            Command::parse(&alloc::format!("NAMING LOOKUP NAME={literal}")).unwrap();

        let response = reply_of(lookup(&command, None));
        assert_eq!(response.result(), Some("INVALID_KEY"));
    }

    #[test]
    fn lookup_hostnames_deferred() {
        for name in ["host.i2p", "udhdrtrcetjm5sxzskjyr5ztpeszydbh4dpl3pl4utgqqw2v4jna.b32.i2p"] {
            let command = Command::parse(&alloc::format!("NAMING LOOKUP NAME={name}")).unwrap();

            match lookup(&command, None) {
                LookupOutcome::Deferred { name: deferred } => assert_eq!(deferred, name),
                LookupOutcome::Reply(response) =>
                    panic!("unexpected reply: {}", response.format()),
            }
        }
    }

    #[test]
    fn lookup_unknown_format() {
        let command = Command::parse("NAMING LOOKUP NAME=not-a-name").unwrap();

        let response = reply_of(lookup(&command, None));
        assert_eq!(response.result(), Some("INVALID_KEY"));
    }

    #[test]
    fn lookup_options_unsupported() {
        let command = Command::parse("NAMING LOOKUP NAME=host.i2p OPTIONS=true").unwrap();

        let response = reply_of(lookup(&command, None));
        assert_eq!(response.result(), Some("I2P_ERROR"));
    }

    #[test]
    fn lookup_reply_mapping() {
        assert_eq!(
            lookup_reply("host.i2p", &Ok("VALUE64".to_string())).format(),
            "NAMING REPLY RESULT=OK NAME=host.i2p VALUE=VALUE64\n",
        );
        assert_eq!(
            lookup_reply("host.i2p", &Err(QueryError::KeyNotFound)).format(),
            "NAMING REPLY RESULT=KEY_NOT_FOUND NAME=host.i2p\n",
        );
        assert_eq!(
            lookup_reply("host.i2p", &Err(QueryError::Timeout)).format(),
            "NAMING REPLY RESULT=TIMEOUT NAME=host.i2p\n",
        );
        assert_eq!(
            lookup_reply("host.i2p", &Err(QueryError::Router("db burning".to_string())))
                .result(),
            Some("INVALID_KEY"),
        );
    }

    #[test]
    fn cache_round_trip() {
        let cache = DestinationCache::new();
        let destination = bound_destination();
        let literal = destination.to_public_b64();

        let first = cache.parse(&literal).unwrap();
        let second = cache.parse(&literal).unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cache_rejects_malformed() {
        let cache = DestinationCache::new();

        assert!(cache.parse("AAAA").is_err());
        assert!(cache.is_empty());
    }
}
