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

//! Global session registry.
//!
//! Enforces global uniqueness of nicknames (subsessions included) and of
//! destination hashes (top-level sessions only). The registry never closes a
//! router session while holding its lock: `remove()`/`drain()` hand the
//! entry back so the caller can close it afterwards, which keeps close
//! callbacks that touch the registry from deadlocking.

use crate::{error::RegistryError, primitives::DestinationId, router::RouterSession};

use hashbrown::HashMap;
use spin::RwLock;

use alloc::{sync::Arc, vec::Vec};

use super::{SessionStatus, SessionStyle};

/// Logging target for the file.
const LOG_TARGET: &str = "gangway::sam::registry";

/// A registered session.
#[derive(Clone)]
pub struct SessionEntry {
    /// Nickname.
    pub nickname: Arc<str>,

    /// Style.
    pub style: SessionStyle,

    /// Destination hash, absent for subsessions which share their parent's
    /// destination.
    pub destination_id: Option<DestinationId>,

    /// Insertion sequence number, the clock behind most-recent-by-style.
    pub seq: u64,

    /// Lifecycle status.
    pub status: SessionStatus,

    /// Router-side session handle, attached on activation.
    pub router: Option<Arc<dyn RouterSession>>,

    /// Parent nickname, for subsessions.
    ///
    /// Commands targeting a subsession are dispatched to the parent's event
    /// loop.
    pub parent: Option<Arc<str>>,
}

/// Inner, lock-protected tables.
struct RegistryInner {
    /// Nickname → session.
    sessions: HashMap<Arc<str>, SessionEntry>,

    /// Destination hash → nickname.
    destinations: HashMap<DestinationId, Arc<str>>,

    /// Next insertion sequence number.
    next_seq: u64,
}

/// Global session registry.
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Create a new, empty [`SessionRegistry`].
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                destinations: HashMap::new(),
                next_seq: 0u64,
            }),
        }
    }

    /// Reserve `nickname` (and `destination_id`, for top-level sessions)
    /// for a session that is still being created.
    ///
    /// Uniqueness is enforced at reservation time so that two concurrent
    /// `SESSION CREATE`s cannot both pass the check.
    pub fn reserve(
        &self,
        nickname: &str,
        style: SessionStyle,
        destination_id: Option<DestinationId>,
    ) -> Result<Arc<str>, RegistryError> {
        let mut inner = self.inner.write();

        if inner.sessions.contains_key(nickname) {
            return Err(RegistryError::DuplicateNickname);
        }

        if let Some(destination_id) = &destination_id {
            if inner.destinations.contains_key(destination_id) {
                return Err(RegistryError::DuplicateDestination);
            }
        }

        let nickname: Arc<str> = Arc::from(nickname);
        let seq = inner.next_seq;
        inner.next_seq += 1;

        if let Some(destination_id) = destination_id {
            inner.destinations.insert(destination_id, Arc::clone(&nickname));
        }
        inner.sessions.insert(
            Arc::clone(&nickname),
            SessionEntry {
                nickname: Arc::clone(&nickname),
                style,
                destination_id,
                seq,
                status: SessionStatus::Creating,
                router: None,
                parent: None,
            },
        );

        Ok(nickname)
    }

    /// Reserve `nickname` for a subsession of `parent`.
    ///
    /// Subsessions share their parent's destination, so only nickname
    /// uniqueness is enforced.
    pub fn reserve_subsession(
        &self,
        nickname: &str,
        style: SessionStyle,
        parent: Arc<str>,
    ) -> Result<Arc<str>, RegistryError> {
        let reserved = self.reserve(nickname, style, None)?;

        if let Some(entry) = self.inner.write().sessions.get_mut(&reserved) {
            entry.parent = Some(parent);
        }

        Ok(reserved)
    }

    /// Activate a reserved session, attaching its router handle.
    ///
    /// The `Creating → Active` transition happens exactly once; any other
    /// starting state is a bug.
    pub fn activate(
        &self,
        nickname: &str,
        router: Arc<dyn RouterSession>,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let entry =
            inner.sessions.get_mut(nickname).ok_or(RegistryError::NicknameDoesntExist)?;

        debug_assert!(core::matches!(entry.status, SessionStatus::Creating));
        entry.status = SessionStatus::Active;
        entry.router = Some(router);

        Ok(())
    }

    /// Mark a session as closing.
    pub fn mark_closing(&self, nickname: &str) {
        if let Some(entry) = self.inner.write().sessions.get_mut(nickname) {
            entry.status = SessionStatus::Closing;
        }
    }

    /// Remove a session from both tables.
    ///
    /// Returns the entry so the caller can close the router handle outside
    /// the lock. Idempotent: removing an unknown nickname returns `None`.
    pub fn remove(&self, nickname: &str) -> Option<SessionEntry> {
        let mut inner = self.inner.write();
        let mut entry = inner.sessions.remove(nickname)?;

        if let Some(destination_id) = &entry.destination_id {
            inner.destinations.remove(destination_id);
        }
        entry.status = SessionStatus::Closed;

        Some(entry)
    }

    /// Remove every session, returning the entries for out-of-lock closing.
    pub fn drain(&self) -> Vec<SessionEntry> {
        let mut inner = self.inner.write();
        inner.destinations.clear();

        inner
            .sessions
            .drain()
            .map(|(_, mut entry)| {
                entry.status = SessionStatus::Closed;
                entry
            })
            .collect()
    }

    /// Look up a session by nickname.
    pub fn lookup(&self, nickname: &str) -> Option<SessionEntry> {
        self.inner.read().sessions.get(nickname).cloned()
    }

    /// Look up a top-level session by destination hash.
    pub fn lookup_by_hash(&self, destination_id: &DestinationId) -> Option<SessionEntry> {
        let inner = self.inner.read();
        let nickname = inner.destinations.get(destination_id)?;

        inner.sessions.get(nickname).cloned()
    }

    /// Most recently created active session of `style`.
    pub fn most_recent_by_style(&self, style: SessionStyle) -> Option<SessionEntry> {
        self.inner
            .read()
            .sessions
            .values()
            .filter(|entry| {
                entry.style == style && core::matches!(entry.status, SessionStatus::Active)
            })
            .max_by_key(|entry| entry.seq)
            .cloned()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().sessions.is_empty()
    }
}

/// Close the router handles of drained entries.
///
/// Split out of [`SessionRegistry::drain()`] so closing happens with no lock
/// held.
pub fn close_entries(entries: Vec<SessionEntry>) {
    for entry in entries {
        tracing::debug!(
            target: LOG_TARGET,
            nickname = %entry.nickname,
            "closing session",
        );

        if let Some(router) = entry.router {
            router.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::base64_encode,
        primitives::{tests::make_private_blob, Destination},
        router::OutboundDatagram,
    };
    use futures::future::BoxFuture;

    struct DummySession;

    impl RouterSession for DummySession {
        fn destination_b64(&self) -> alloc::string::String {
            alloc::string::String::new()
        }

        fn wait_for_tunnels(&self) -> BoxFuture<'static, crate::Result<()>> {
            alloc::boxed::Box::pin(async { Ok(()) })
        }

        fn send_datagram(&self, _: OutboundDatagram) -> crate::Result<()> {
            Ok(())
        }

        fn close(&self) {}
    }

    fn destination_id(fill: u8) -> DestinationId {
        Destination::from_private_b64(&base64_encode(make_private_blob(fill))).unwrap().id()
    }

    #[test]
    fn duplicate_nickname_rejected() {
        let registry = SessionRegistry::new();

        registry.reserve("first", SessionStyle::Stream, Some(destination_id(1))).unwrap();
        assert_eq!(
            registry
                .reserve("first", SessionStyle::Datagram, Some(destination_id(2)))
                .unwrap_err(),
            RegistryError::DuplicateNickname,
        );
    }

    #[test]
    fn duplicate_destination_rejected() {
        let registry = SessionRegistry::new();

        registry.reserve("first", SessionStyle::Stream, Some(destination_id(1))).unwrap();
        assert_eq!(
            registry
                .reserve("second", SessionStyle::Stream, Some(destination_id(1)))
                .unwrap_err(),
            RegistryError::DuplicateDestination,
        );
    }

    #[test]
    fn subsessions_skip_destination_check() {
        let registry = SessionRegistry::new();

        registry.reserve("parent", SessionStyle::Primary, Some(destination_id(1))).unwrap();
        registry.reserve("sub-1", SessionStyle::Stream, None).unwrap();
        registry.reserve("sub-2", SessionStyle::Raw, None).unwrap();

        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn remove_frees_both_keys() {
        let registry = SessionRegistry::new();

        registry.reserve("first", SessionStyle::Stream, Some(destination_id(1))).unwrap();
        let entry = registry.remove("first").unwrap();
        assert!(core::matches!(entry.status, SessionStatus::Closed));

        // both the nickname and the destination are available again
        registry.reserve("first", SessionStyle::Stream, Some(destination_id(1))).unwrap();
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = SessionRegistry::new();

        registry.reserve("first", SessionStyle::Stream, Some(destination_id(1))).unwrap();
        assert!(registry.remove("first").is_some());
        assert!(registry.remove("first").is_none());
    }

    #[test]
    fn most_recent_by_style_tracks_insertion_order() {
        let registry = SessionRegistry::new();

        for (nickname, fill) in [("a", 1u8), ("b", 2u8), ("c", 3u8)] {
            registry.reserve(nickname, SessionStyle::Datagram, Some(destination_id(fill))).unwrap();
            registry.activate(nickname, Arc::new(DummySession)).unwrap();
        }
        registry.reserve("stream", SessionStyle::Stream, Some(destination_id(4))).unwrap();
        registry.activate("stream", Arc::new(DummySession)).unwrap();

        assert_eq!(
            registry.most_recent_by_style(SessionStyle::Datagram).unwrap().nickname.as_ref(),
            "c",
        );

        // removal re-exposes the previous session
        registry.remove("c");
        assert_eq!(
            registry.most_recent_by_style(SessionStyle::Datagram).unwrap().nickname.as_ref(),
            "b",
        );
    }

    #[test]
    fn most_recent_ignores_pending_sessions() {
        let registry = SessionRegistry::new();

        registry.reserve("ready", SessionStyle::Raw, Some(destination_id(1))).unwrap();
        registry.activate("ready", Arc::new(DummySession)).unwrap();
        registry.reserve("pending", SessionStyle::Raw, Some(destination_id(2))).unwrap();

        assert_eq!(
            registry.most_recent_by_style(SessionStyle::Raw).unwrap().nickname.as_ref(),
            "ready",
        );
    }

    #[test]
    fn lookup_by_hash() {
        let registry = SessionRegistry::new();
        let id = destination_id(7);

        registry.reserve("first", SessionStyle::Stream, Some(id)).unwrap();
        assert_eq!(registry.lookup_by_hash(&id).unwrap().nickname.as_ref(), "first");
        assert!(registry.lookup_by_hash(&destination_id(8)).is_none());
    }

    #[test]
    fn drain_clears_everything() {
        let registry = SessionRegistry::new();

        registry.reserve("a", SessionStyle::Stream, Some(destination_id(1))).unwrap();
        registry.reserve("b", SessionStyle::Raw, Some(destination_id(2))).unwrap();

        let entries = registry.drain();
        assert_eq!(entries.len(), 2);
        assert!(registry.is_empty());

        close_entries(entries);
    }
}
