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

use core::fmt;

/// SAM protocol version, `major.minor`.
///
/// Versions compare lexicographically component-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SamVersion {
    /// Major version.
    major: u16,

    /// Minor version.
    minor: u16,
}

impl SamVersion {
    /// v3.0, the default client minimum.
    pub const V30: Self = Self { major: 3, minor: 0 };

    /// v3.2, the version that introduced port fields in forwarded headers.
    pub const V32: Self = Self { major: 3, minor: 2 };

    /// v3.3, the default maximum.
    pub const V33: Self = Self { major: 3, minor: 3 };

    /// Parse `major.minor` with non-negative integer components.
    pub fn parse(input: &str) -> Option<Self> {
        let (major, minor) = input.split_once('.')?;

        if major.is_empty()
            || minor.is_empty()
            || !major.bytes().all(|byte| byte.is_ascii_digit())
            || !minor.bytes().all(|byte| byte.is_ascii_digit())
        {
            return None;
        }

        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }

    /// Whether forwarded datagram headers carry port/protocol fields.
    pub fn supports_ports(&self) -> bool {
        self >= &Self::V32
    }

    /// Whether any number of concurrent `STREAM ACCEPT`s is permitted.
    pub fn supports_concurrent_accepts(&self) -> bool {
        self >= &Self::V32
    }

    /// Negotiate a version from the client's and server's `[min, max]` ranges.
    ///
    /// The overlap is `[max(min_c, min_s), min(max_c, max_s)]`; an empty
    /// overlap yields `None`, otherwise the overlap's maximum is selected.
    /// Callers are expected to have rejected `min > max` ranges beforehand.
    pub fn negotiate(
        client_min: SamVersion,
        client_max: SamVersion,
        server_min: SamVersion,
        server_max: SamVersion,
    ) -> Option<SamVersion> {
        let low = client_min.max(server_min);
        let high = client_max.min(server_max);

        (low <= high).then_some(high)
    }
}

impl fmt::Display for SamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid() {
        assert_eq!(SamVersion::parse("3.1"), Some(SamVersion { major: 3, minor: 1 }));
        assert_eq!(SamVersion::parse("0.0"), Some(SamVersion { major: 0, minor: 0 }));
        assert_eq!(SamVersion::parse("3.10"), Some(SamVersion { major: 3, minor: 10 }));
    }

    #[test]
    fn parse_invalid() {
        for input in ["3", "3.", ".1", "3.1.2", "3.x", "-3.1", "+3.1", "3.1 ", ""] {
            assert!(SamVersion::parse(input).is_none(), "accepted {input:?}");
        }
    }

    #[test]
    fn ordering_is_component_wise() {
        assert!(SamVersion::parse("3.10").unwrap() > SamVersion::parse("3.9").unwrap());
        assert!(SamVersion::parse("2.9").unwrap() < SamVersion::parse("3.0").unwrap());
    }

    #[test]
    fn negotiate_picks_overlap_maximum() {
        assert_eq!(
            SamVersion::negotiate(
                SamVersion::parse("3.1").unwrap(),
                SamVersion::V33,
                SamVersion::V30,
                SamVersion::V33,
            ),
            Some(SamVersion::V33),
        );

        assert_eq!(
            SamVersion::negotiate(
                SamVersion::V30,
                SamVersion::parse("3.1").unwrap(),
                SamVersion::V30,
                SamVersion::V33,
            ),
            Some(SamVersion::parse("3.1").unwrap()),
        );
    }

    #[test]
    fn negotiate_empty_overlap() {
        assert_eq!(
            SamVersion::negotiate(
                SamVersion::parse("2.0").unwrap(),
                SamVersion::parse("2.9").unwrap(),
                SamVersion::V30,
                SamVersion::V33,
            ),
            None,
        );
    }

    #[test]
    fn negotiation_never_exceeds_either_bound() {
        let client_max = SamVersion::parse("3.1").unwrap();
        let negotiated = SamVersion::negotiate(
            SamVersion::V30,
            client_max,
            SamVersion::V30,
            SamVersion::V33,
        )
        .unwrap();

        assert!(negotiated <= client_max);
        assert!(negotiated <= SamVersion::V33);
    }

    #[test]
    fn port_gating() {
        assert!(!SamVersion::parse("3.1").unwrap().supports_ports());
        assert!(SamVersion::V32.supports_ports());
        assert!(SamVersion::V33.supports_ports());
    }
}
