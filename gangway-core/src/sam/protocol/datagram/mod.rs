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

//! Datagram plane.
//!
//! Client-to-network datagrams arrive on the shared UDP ingress socket with a
//! `3.x <nickname> <destination> [options]` header line; network-to-client
//! datagrams are framed per style and either written to the session's control
//! socket or forwarded as single UDP packets to a client-chosen address.

use crate::{
    crypto::base64_encode,
    error::SessionError,
    router::{DatagramSource, DatagramStyle, InboundDatagram, SendOptions, FORBIDDEN_RAW_PROTOCOLS},
    sam::version::SamVersion,
};

use bytes::{BufMut, BytesMut};
use hashbrown::HashSet;

use alloc::{
    collections::VecDeque,
    string::{String, ToString},
    vec::Vec,
};
use core::net::SocketAddr;

/// Logging target for the file.
const LOG_TARGET: &str = "gangway::sam::datagram";

/// Maximum size of one UDP packet on the ingress socket.
pub const MAX_UDP_PACKET: usize = 65536;

/// Maximum network payload for repliable datagram styles.
pub const MAX_DATAGRAM_PAYLOAD: usize = 31744;

/// Maximum network payload for raw datagrams.
pub const MAX_RAW_PAYLOAD: usize = 32768;

/// Bound of a session's receive queue; overflow drops the oldest entry.
pub const RECEIVE_QUEUE_SIZE: usize = 256;

/// Parsed ingress header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramHeader {
    /// Session nickname.
    pub nickname: String,

    /// Target destination, Base64.
    pub destination: String,

    /// Send options.
    pub options: SendOptions,
}

impl DatagramHeader {
    /// Parse the header line and payload out of an ingress packet.
    ///
    /// Returns `None` on any malformation; the UDP plane is best-effort and
    /// the packet is dropped silently.
    pub fn parse(packet: &[u8]) -> Option<(Self, &[u8])> {
        if packet.len() > MAX_UDP_PACKET {
            return None;
        }

        let header_end = packet.iter().position(|byte| byte == &b'\n')?;
        let header = core::str::from_utf8(&packet[..header_end]).ok()?;
        let payload = &packet[header_end + 1..];

        let mut tokens = header.split_ascii_whitespace();

        // only 3.x headers are recognized
        let version = tokens.next()?;
        if !version.starts_with("3.") || SamVersion::parse(version).is_none() {
            return None;
        }

        let nickname = tokens.next()?.to_string();
        let destination = tokens.next()?.to_string();
        let mut options = SendOptions::default();

        for token in tokens {
            let (key, value) = token.split_once('=')?;

            match key {
                "FROM_PORT" => options.from_port = value.parse().ok()?,
                "TO_PORT" => options.to_port = value.parse().ok()?,
                "PROTOCOL" => options.protocol = Some(value.parse().ok()?),
                "SEND_TAGS" => options.send_tags = Some(value.parse().ok()?),
                "TAG_THRESHOLD" => options.tag_threshold = Some(value.parse().ok()?),
                "EXPIRES" => options.expires = Some(value.parse().ok()?),
                "SEND_LEASESET" => options.send_leaseset = Some(value.parse().ok()?),
                // unknown options are ignored, not fatal
                _ => {}
            }
        }

        Some((
            Self {
                nickname,
                destination,
                options,
            },
            payload,
        ))
    }
}

/// Validate an outbound payload against the style's limits.
pub fn validate_send(
    style: DatagramStyle,
    payload_len: usize,
    protocol: Option<u8>,
) -> Result<(), SessionError> {
    let max = match style {
        DatagramStyle::Raw => MAX_RAW_PAYLOAD,
        _ => MAX_DATAGRAM_PAYLOAD,
    };

    if payload_len > max {
        return Err(SessionError::DatagramTooLarge);
    }

    if let Some(protocol) = protocol {
        match style {
            DatagramStyle::Raw =>
                if FORBIDDEN_RAW_PROTOCOLS.contains(&protocol) {
                    return Err(SessionError::DisallowedProtocol(protocol));
                },
            // non-raw styles have fixed protocol numbers
            style =>
                if protocol != style.protocol() {
                    return Err(SessionError::DisallowedProtocol(protocol));
                },
        }
    }

    Ok(())
}

/// `DESTINATION=` value for an inbound source.
///
/// Hash sources are rendered as the 44-character Base64 of the 32-byte hash;
/// clients round-trip them through Base32 and a naming lookup to obtain a
/// repliable destination.
fn source_value(source: &DatagramSource) -> Option<String> {
    match source {
        DatagramSource::Destination(destination) => Some(destination.clone()),
        DatagramSource::Hash(hash) => Some(base64_encode(hash)),
        DatagramSource::Anonymous => None,
    }
}

/// Frame an inbound datagram for control-socket delivery.
///
/// Port and protocol fields are emitted only for sessions negotiated at 3.2
/// or higher.
pub fn frame_control(datagram: &InboundDatagram, version: SamVersion) -> Vec<u8> {
    let header = match source_value(&datagram.source) {
        Some(source) => {
            let mut header = alloc::format!(
                "DATAGRAM RECEIVED DESTINATION={source} SIZE={}",
                datagram.payload.len(),
            );
            if version.supports_ports() {
                header.push_str(&alloc::format!(
                    " FROM_PORT={} TO_PORT={}",
                    datagram.from_port, datagram.to_port,
                ));
            }
            header
        }
        None => {
            let mut header = alloc::format!("RAW RECEIVED SIZE={}", datagram.payload.len());
            if version.supports_ports() {
                header.push_str(&alloc::format!(
                    " FROM_PORT={} TO_PORT={} PROTOCOL={}",
                    datagram.from_port, datagram.to_port, datagram.protocol,
                ));
            }
            header
        }
    };

    let mut out = BytesMut::with_capacity(header.len() + 1 + datagram.payload.len());
    out.put_slice(header.as_bytes());
    out.put_u8(b'\n');
    out.put_slice(&datagram.payload);

    out.to_vec()
}

/// Frame an inbound datagram as the body of one forwarded UDP packet.
///
/// Repliable styles lead with the source line; raw datagrams carry the
/// payload alone unless the session asked for headers.
pub fn frame_forward(
    datagram: &InboundDatagram,
    version: SamVersion,
    raw_header: bool,
) -> Vec<u8> {
    match source_value(&datagram.source) {
        Some(source) => {
            let mut header = source;
            if version.supports_ports() {
                header.push_str(&alloc::format!(
                    " FROM_PORT={} TO_PORT={}",
                    datagram.from_port, datagram.to_port,
                ));
            }

            let mut out = BytesMut::with_capacity(header.len() + 1 + datagram.payload.len());
            out.put_slice(header.as_bytes());
            out.put_u8(b'\n');
            out.put_slice(&datagram.payload);

            out.to_vec()
        }
        None if raw_header && version.supports_ports() => {
            let header = alloc::format!(
                "FROM_PORT={} TO_PORT={} PROTOCOL={}",
                datagram.from_port, datagram.to_port, datagram.protocol,
            );

            let mut out = BytesMut::with_capacity(header.len() + 1 + datagram.payload.len());
            out.put_slice(header.as_bytes());
            out.put_u8(b'\n');
            out.put_slice(&datagram.payload);

            out.to_vec()
        }
        None => datagram.payload.clone(),
    }
}

/// A framed datagram queued towards one client.
#[derive(Debug, Default, Clone)]
pub struct ForwardedDatagram {
    /// Local UDP target, `None` only for recycled channel slots.
    pub target: Option<SocketAddr>,

    /// Packet body.
    pub payload: Vec<u8>,
}

/// Per-(sub)session datagram state.
pub struct DatagramState {
    /// Style of the session.
    pub style: DatagramStyle,

    /// Default raw protocol number.
    pub protocol: u8,

    /// Whether forwarded raw packets carry a header line.
    pub header_enabled: bool,

    /// UDP forward target; `None` selects control-socket delivery.
    pub forward: Option<SocketAddr>,

    /// Framed datagrams awaiting delivery.
    queue: VecDeque<ForwardedDatagram>,

    /// Replay nonces seen by a replay-protected session.
    nonces: Option<HashSet<u64>>,

    /// Datagrams dropped due to overflow, replay or delivery failure.
    dropped: u64,
}

impl DatagramState {
    /// Create datagram state for a session of `style`.
    pub fn new(
        style: DatagramStyle,
        protocol: u8,
        header_enabled: bool,
        forward: Option<SocketAddr>,
    ) -> Self {
        Self {
            style,
            protocol,
            header_enabled,
            forward,
            queue: VecDeque::new(),
            nonces: core::matches!(style, DatagramStyle::Datagram2).then(HashSet::new),
            dropped: 0u64,
        }
    }

    /// Queue an inbound datagram for delivery, framing it for the session's
    /// delivery mode.
    ///
    /// Replayed datagrams are dropped here; queue overflow drops the oldest
    /// entry and bumps the loss counter.
    pub fn push(&mut self, datagram: &InboundDatagram, version: SamVersion) {
        if let (Some(nonces), Some(nonce)) = (&mut self.nonces, datagram.nonce) {
            if !nonces.insert(nonce) {
                tracing::debug!(
                    target: LOG_TARGET,
                    ?nonce,
                    "replayed datagram dropped",
                );
                self.dropped += 1;
                return;
            }
        }

        let (target, payload) = match self.forward {
            Some(target) => (
                Some(target),
                frame_forward(datagram, version, self.header_enabled),
            ),
            None => (None, frame_control(datagram, version)),
        };

        if self.queue.len() == RECEIVE_QUEUE_SIZE {
            self.queue.pop_front();
            self.dropped += 1;
        }
        self.queue.push_back(ForwardedDatagram { target, payload });
    }

    /// Take the next framed datagram, if any.
    pub fn pop(&mut self) -> Option<ForwardedDatagram> {
        self.queue.pop_front()
    }

    /// Put back a datagram that could not be delivered right now.
    pub fn push_front(&mut self, datagram: ForwardedDatagram) {
        self.queue.push_front(datagram);
    }

    /// Record a delivery failure.
    pub fn record_drop(&mut self) {
        self.dropped += 1;
    }

    /// Datagrams lost to overflow, replay or delivery failure.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::PROTOCOL_RAW;
    use alloc::vec;

    fn inbound(source: DatagramSource, payload: &[u8]) -> InboundDatagram {
        InboundDatagram {
            protocol: PROTOCOL_RAW,
            from_port: 10,
            to_port: 20,
            source,
            nonce: None,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn parse_ingress_header() {
        let packet = b"3.3 nick DEST64 FROM_PORT=1 TO_PORT=2 SEND_TAGS=8\nhello";
        let (header, payload) = DatagramHeader::parse(packet).unwrap();

        assert_eq!(header.nickname, "nick");
        assert_eq!(header.destination, "DEST64");
        assert_eq!(header.options.from_port, 1);
        assert_eq!(header.options.to_port, 2);
        assert_eq!(header.options.send_tags, Some(8));
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn parse_ingress_minimal() {
        let (header, payload) = DatagramHeader::parse(b"3.0 nick DEST64\npayload").unwrap();

        assert_eq!(header.options, SendOptions::default());
        assert_eq!(header.nickname, "nick");
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn parse_ingress_rejects_malformed() {
        // no header terminator
        assert!(DatagramHeader::parse(b"3.3 nick DEST64 no newline").is_none());
        // wrong version
        assert!(DatagramHeader::parse(b"2.0 nick DEST64\npayload").is_none());
        assert!(DatagramHeader::parse(b"3.x nick DEST64\npayload").is_none());
        // missing fields
        assert!(DatagramHeader::parse(b"3.3 nick\npayload").is_none());
        // malformed option value
        assert!(DatagramHeader::parse(b"3.3 nick DEST64 FROM_PORT=abc\np").is_none());
    }

    #[test]
    fn ingress_payload_may_be_empty() {
        let (_, payload) = DatagramHeader::parse(b"3.3 nick DEST64\n").unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn size_limits_per_style() {
        assert!(validate_send(DatagramStyle::Raw, MAX_RAW_PAYLOAD, None).is_ok());
        assert!(validate_send(DatagramStyle::Raw, MAX_RAW_PAYLOAD + 1, None).is_err());

        assert!(validate_send(DatagramStyle::Datagram, MAX_DATAGRAM_PAYLOAD, None).is_ok());
        assert_eq!(
            validate_send(DatagramStyle::Datagram, MAX_RAW_PAYLOAD, None),
            Err(SessionError::DatagramTooLarge),
        );
        assert_eq!(
            validate_send(DatagramStyle::Datagram2, MAX_RAW_PAYLOAD, None),
            Err(SessionError::DatagramTooLarge),
        );
    }

    #[test]
    fn forbidden_raw_protocols() {
        for protocol in FORBIDDEN_RAW_PROTOCOLS {
            assert_eq!(
                validate_send(DatagramStyle::Raw, 16, Some(protocol)),
                Err(SessionError::DisallowedProtocol(protocol)),
            );
        }

        assert!(validate_send(DatagramStyle::Raw, 16, Some(PROTOCOL_RAW)).is_ok());
        assert!(validate_send(DatagramStyle::Raw, 16, Some(250)).is_ok());
    }

    #[test]
    fn control_framing_with_ports() {
        let datagram = inbound(DatagramSource::Destination("SRC64".to_string()), b"HI");
        let framed = frame_control(&datagram, SamVersion::V32);

        assert_eq!(
            framed,
            b"DATAGRAM RECEIVED DESTINATION=SRC64 SIZE=2 FROM_PORT=10 TO_PORT=20\nHI".to_vec(),
        );
    }

    #[test]
    fn control_framing_pre_32_omits_ports() {
        let datagram = inbound(DatagramSource::Destination("SRC64".to_string()), b"HI");
        let framed = frame_control(&datagram, SamVersion::parse("3.1").unwrap());

        assert_eq!(framed, b"DATAGRAM RECEIVED DESTINATION=SRC64 SIZE=2\nHI".to_vec());
    }

    #[test]
    fn control_framing_raw() {
        let datagram = inbound(DatagramSource::Anonymous, b"HI");
        let framed = frame_control(&datagram, SamVersion::V33);

        assert_eq!(
            framed,
            b"RAW RECEIVED SIZE=2 FROM_PORT=10 TO_PORT=20 PROTOCOL=18\nHI".to_vec(),
        );
    }

    #[test]
    fn control_framing_hash_source() {
        let datagram = inbound(DatagramSource::Hash([0u8; 32]), b"HI");
        let framed = frame_control(&datagram, SamVersion::parse("3.1").unwrap());

        let header_end = framed.iter().position(|b| b == &b'\n').unwrap();
        let header = core::str::from_utf8(&framed[..header_end]).unwrap();
        let destination = header
            .split_ascii_whitespace()
            .find_map(|token| token.strip_prefix("DESTINATION="))
            .unwrap();

        // 32-byte hash renders as 44 base64 characters
        assert_eq!(destination.len(), 44);
    }

    #[test]
    fn forward_framing_matches_wire_example() {
        let datagram = inbound(DatagramSource::Destination("D".to_string()), b"HI");
        let framed = frame_forward(&datagram, SamVersion::V32, false);

        assert_eq!(framed, b"D FROM_PORT=10 TO_PORT=20\nHI".to_vec());
    }

    #[test]
    fn forward_framing_raw_modes() {
        let datagram = inbound(DatagramSource::Anonymous, b"HI");

        assert_eq!(frame_forward(&datagram, SamVersion::V33, false), b"HI".to_vec());
        assert_eq!(
            frame_forward(&datagram, SamVersion::V33, true),
            b"FROM_PORT=10 TO_PORT=20 PROTOCOL=18\nHI".to_vec(),
        );
    }

    #[test]
    fn queue_overflow_drops_oldest() {
        let mut state = DatagramState::new(DatagramStyle::Datagram, 17, false, None);

        for i in 0..RECEIVE_QUEUE_SIZE + 3 {
            let datagram = inbound(
                DatagramSource::Destination("SRC".to_string()),
                alloc::format!("{i}").as_bytes(),
            );
            state.push(&datagram, SamVersion::V33);
        }

        assert_eq!(state.dropped(), 3);

        // the oldest three were discarded
        let first = state.pop().unwrap();
        assert!(first.payload.ends_with(b"\n3"));
    }

    #[test]
    fn replayed_nonce_dropped() {
        let mut state = DatagramState::new(DatagramStyle::Datagram2, 19, false, None);

        let mut datagram = inbound(DatagramSource::Destination("SRC".to_string()), b"HI");
        datagram.nonce = Some(42);

        state.push(&datagram, SamVersion::V33);
        state.push(&datagram, SamVersion::V33);

        assert_eq!(state.dropped(), 1);
        assert!(state.pop().is_some());
        assert!(state.pop().is_none());
    }

    #[test]
    fn forward_target_attached() {
        let target: SocketAddr = "127.0.0.1:7777".parse().unwrap();
        let mut state = DatagramState::new(DatagramStyle::Raw, 18, false, Some(target));

        state.push(&inbound(DatagramSource::Anonymous, b"HI"), SamVersion::V33);

        let queued = state.pop().unwrap();
        assert_eq!(queued.target, Some(target));
        assert_eq!(queued.payload, vec![b'H', b'I']);
    }
}
