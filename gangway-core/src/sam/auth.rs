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

//! Control-channel authentication store.
//!
//! A runtime-mutable set of user/password pairs plus a "required" flag,
//! checked during `HELLO VERSION` and mutated by `AUTH` commands. No bound
//! session is needed for any of the operations.

use hashbrown::HashMap;
use spin::Mutex;

use alloc::string::{String, ToString};

/// Authentication store error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Empty username.
    EmptyUser,

    /// User already exists.
    UserExists,

    /// User doesn't exist.
    UnknownUser,
}

impl core::fmt::Display for AuthError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::EmptyUser => write!(f, "empty username"),
            Self::UserExists => write!(f, "user already exists"),
            Self::UnknownUser => write!(f, "user doesn't exist"),
        }
    }
}

/// Inner, lock-protected state.
struct AuthStoreInner {
    /// Whether `HELLO VERSION` must carry valid credentials.
    required: bool,

    /// User → password.
    credentials: HashMap<String, String>,
}

/// Authentication store.
pub struct AuthStore {
    inner: Mutex<AuthStoreInner>,
}

impl AuthStore {
    /// Create a new [`AuthStore`].
    pub fn new(required: bool) -> Self {
        Self {
            inner: Mutex::new(AuthStoreInner {
                required,
                credentials: HashMap::new(),
            }),
        }
    }

    /// Whether authentication is currently required.
    pub fn required(&self) -> bool {
        self.inner.lock().required
    }

    /// Start requiring authentication on new handshakes.
    pub fn enable(&self) {
        self.inner.lock().required = true;
    }

    /// Stop requiring authentication.
    pub fn disable(&self) {
        self.inner.lock().required = false;
    }

    /// Add a user. Usernames must be non-empty and unique.
    pub fn add(&self, user: &str, password: &str) -> Result<(), AuthError> {
        if user.is_empty() {
            return Err(AuthError::EmptyUser);
        }

        let mut inner = self.inner.lock();

        if inner.credentials.contains_key(user) {
            return Err(AuthError::UserExists);
        }
        inner.credentials.insert(user.to_string(), password.to_string());

        Ok(())
    }

    /// Remove a user.
    pub fn remove(&self, user: &str) -> Result<(), AuthError> {
        self.inner
            .lock()
            .credentials
            .remove(user)
            .map(|_| ())
            .ok_or(AuthError::UnknownUser)
    }

    /// Verify handshake credentials.
    ///
    /// Always succeeds when authentication is disabled. Comparison is
    /// byte-for-byte.
    pub fn verify(&self, user: Option<&str>, password: Option<&str>) -> bool {
        let inner = self.inner.lock();

        if !inner.required {
            return true;
        }

        let (Some(user), Some(password)) = (user, password) else {
            return false;
        };

        inner
            .credentials
            .get(user)
            .map(|stored| stored.as_bytes() == password.as_bytes())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_store_accepts_anything() {
        let store = AuthStore::new(false);

        assert!(store.verify(None, None));
        assert!(store.verify(Some("user"), Some("wrong")));
    }

    #[test]
    fn required_credentials() {
        let store = AuthStore::new(false);
        store.add("alice", "sesame").unwrap();
        store.enable();

        assert!(!store.verify(None, None));
        assert!(!store.verify(Some("alice"), None));
        assert!(!store.verify(Some("alice"), Some("wrong")));
        assert!(!store.verify(Some("bob"), Some("sesame")));
        assert!(store.verify(Some("alice"), Some("sesame")));
    }

    #[test]
    fn disable_at_runtime() {
        let store = AuthStore::new(true);
        assert!(!store.verify(None, None));

        store.disable();
        assert!(store.verify(None, None));
    }

    #[test]
    fn empty_username_rejected() {
        let store = AuthStore::new(false);

        assert_eq!(store.add("", "password"), Err(AuthError::EmptyUser));
    }

    #[test]
    fn duplicate_user_rejected() {
        let store = AuthStore::new(false);
        store.add("alice", "one").unwrap();

        assert_eq!(store.add("alice", "two"), Err(AuthError::UserExists));
    }

    #[test]
    fn remove_unknown_user() {
        let store = AuthStore::new(false);

        assert_eq!(store.remove("ghost"), Err(AuthError::UnknownUser));
    }

    #[test]
    fn password_comparison_is_exact() {
        let store = AuthStore::new(true);
        store.add("alice", "päss").unwrap();

        assert!(store.verify(Some("alice"), Some("päss")));
        assert!(!store.verify(Some("alice"), Some("pass")));
    }
}
