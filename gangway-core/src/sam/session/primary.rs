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

//! Subsession routing for primary sessions.
//!
//! A primary session owns the destination and tunnels; subsessions attach to
//! it and receive the slice of inbound traffic selected by their
//! `(listen port, listen protocol)` registration.

use crate::{
    error::SessionError,
    router::PROTOCOL_STREAMING,
};

use hashbrown::HashMap;

use alloc::{sync::Arc, vec::Vec};

use super::SessionStyle;

/// A subsession registered under a primary session.
#[derive(Debug, Clone)]
pub struct Subsession {
    /// Nickname, globally unique like any session's.
    pub nickname: Arc<str>,

    /// Style; never [`SessionStyle::Primary`].
    pub style: SessionStyle,

    /// Listen port, `0` is the wildcard.
    pub listen_port: u16,

    /// Listen protocol, `0` is the wildcard.
    pub listen_protocol: u8,
}

/// Subsession table of a primary session.
///
/// Maps `(listen_port, listen_protocol)` to subsession nicknames with no
/// duplicate keys.
#[derive(Default)]
pub struct SubsessionTable {
    /// Nickname → subsession.
    subsessions: HashMap<Arc<str>, Subsession>,

    /// `(port, protocol)` → nickname.
    routes: HashMap<(u16, u8), Arc<str>>,
}

impl SubsessionTable {
    /// Create an empty [`SubsessionTable`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subsession.
    ///
    /// Rejects primary styles, streaming-protocol raw subsessions and
    /// duplicate `(port, protocol)` registrations. Nickname uniqueness is
    /// the global registry's concern and is checked before insertion.
    pub fn insert(&mut self, subsession: Subsession) -> Result<(), SessionError> {
        if core::matches!(subsession.style, SessionStyle::Primary) {
            return Err(SessionError::NestedPrimary);
        }

        if subsession.listen_protocol == PROTOCOL_STREAMING
            && core::matches!(subsession.style, SessionStyle::Raw)
        {
            return Err(SessionError::StreamingToRaw);
        }

        let route = (subsession.listen_port, subsession.listen_protocol);
        if self.routes.contains_key(&route) {
            return Err(SessionError::DuplicateRoute);
        }

        self.routes.insert(route, Arc::clone(&subsession.nickname));
        self.subsessions.insert(Arc::clone(&subsession.nickname), subsession);

        Ok(())
    }

    /// Remove a subsession by nickname.
    ///
    /// Removing the `(0, 0)` default leaves the default slot empty; no other
    /// subsession is promoted into it.
    pub fn remove(&mut self, nickname: &str) -> Option<Subsession> {
        let subsession = self.subsessions.remove(nickname)?;

        self.routes
            .remove(&(subsession.listen_port, subsession.listen_protocol));

        Some(subsession)
    }

    /// Route an inbound message to a subsession.
    ///
    /// Tried in order: exact `(port, protocol)`, `(port, 0)`, `(0, protocol)`
    /// and `(0, 0)`; no match means the message is dropped. Streaming
    /// traffic never selects a raw subsession, wildcards included.
    pub fn route(&self, port: u16, protocol: u8) -> Option<&Subsession> {
        [
            (port, protocol),
            (port, 0u8),
            (0u16, protocol),
            (0u16, 0u8),
        ]
        .iter()
        .filter_map(|key| self.subsessions.get(self.routes.get(key)?))
        .find(|subsession| {
            protocol != PROTOCOL_STREAMING || !core::matches!(subsession.style, SessionStyle::Raw)
        })
    }

    /// Get a subsession by nickname.
    pub fn get(&self, nickname: &str) -> Option<&Subsession> {
        self.subsessions.get(nickname)
    }

    /// Nicknames of all registered subsessions.
    pub fn nicknames(&self) -> Vec<Arc<str>> {
        self.subsessions.keys().cloned().collect()
    }

    /// Number of registered subsessions.
    pub fn len(&self) -> usize {
        self.subsessions.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.subsessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subsession(nickname: &str, style: SessionStyle, port: u16, protocol: u8) -> Subsession {
        Subsession {
            nickname: Arc::from(nickname),
            style,
            listen_port: port,
            listen_protocol: protocol,
        }
    }

    #[test]
    fn exact_match_beats_wildcards() {
        let mut table = SubsessionTable::new();
        table.insert(subsession("default", SessionStyle::Datagram, 0, 0)).unwrap();
        table.insert(subsession("exact", SessionStyle::Datagram, 7000, 17)).unwrap();
        table.insert(subsession("port-wild", SessionStyle::Datagram, 7000, 0)).unwrap();

        assert_eq!(table.route(7000, 17).unwrap().nickname.as_ref(), "exact");
        assert_eq!(table.route(7000, 19).unwrap().nickname.as_ref(), "port-wild");
        assert_eq!(table.route(9999, 19).unwrap().nickname.as_ref(), "default");
    }

    #[test]
    fn protocol_wildcard_beats_default() {
        let mut table = SubsessionTable::new();
        table.insert(subsession("default", SessionStyle::Datagram, 0, 0)).unwrap();
        table.insert(subsession("proto-wild", SessionStyle::Raw, 0, 18)).unwrap();

        assert_eq!(table.route(1234, 18).unwrap().nickname.as_ref(), "proto-wild");
    }

    #[test]
    fn no_match_drops() {
        let mut table = SubsessionTable::new();
        table.insert(subsession("exact", SessionStyle::Datagram, 7000, 17)).unwrap();

        assert!(table.route(7001, 17).is_none());
    }

    #[test]
    fn duplicate_route_rejected() {
        let mut table = SubsessionTable::new();
        table.insert(subsession("first", SessionStyle::Datagram, 7000, 17)).unwrap();

        assert_eq!(
            table.insert(subsession("second", SessionStyle::Datagram2, 7000, 17)).unwrap_err(),
            SessionError::DuplicateRoute,
        );
    }

    #[test]
    fn nested_primary_rejected() {
        let mut table = SubsessionTable::new();

        assert_eq!(
            table.insert(subsession("inner", SessionStyle::Primary, 0, 0)).unwrap_err(),
            SessionError::NestedPrimary,
        );
    }

    #[test]
    fn raw_cannot_listen_on_streaming_protocol() {
        let mut table = SubsessionTable::new();

        assert_eq!(
            table.insert(subsession("raw", SessionStyle::Raw, 0, 6)).unwrap_err(),
            SessionError::StreamingToRaw,
        );
    }

    #[test]
    fn streaming_never_routes_to_raw_wildcard() {
        let mut table = SubsessionTable::new();
        table.insert(subsession("raw-default", SessionStyle::Raw, 0, 0)).unwrap();

        // protocol 6 would match the wildcard but the target is raw
        assert!(table.route(0, 6).is_none());

        table.insert(subsession("stream", SessionStyle::Stream, 0, 6)).unwrap();
        assert_eq!(table.route(0, 6).unwrap().nickname.as_ref(), "stream");
    }

    #[test]
    fn removing_default_leaves_slot_empty() {
        let mut table = SubsessionTable::new();
        table.insert(subsession("default", SessionStyle::Datagram, 0, 0)).unwrap();
        table.insert(subsession("exact", SessionStyle::Datagram, 7000, 17)).unwrap();

        table.remove("default").unwrap();

        assert!(table.route(1, 17).is_none());
        assert_eq!(table.route(7000, 17).unwrap().nickname.as_ref(), "exact");
    }

    #[test]
    fn remove_unknown_is_none() {
        let mut table = SubsessionTable::new();

        assert!(table.remove("ghost").is_none());
    }
}
