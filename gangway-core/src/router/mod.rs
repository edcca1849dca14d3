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

//! Router capabilities.
//!
//! The anonymity router itself is an external collaborator: key generation,
//! tunnel construction, end-to-end encryption and destination lookup all
//! happen behind [`RouterClient`] and [`StreamTransport`]. The bridge core
//! only drives these interfaces.

use crate::{
    error::{PeerError, QueryError},
    primitives::{Destination, DestinationId, SignatureType},
    runtime::{AsyncRead, AsyncWrite},
};

use futures::future::BoxFuture;
use futures_channel::mpsc;
use hashbrown::HashMap;

use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};

/// I2CP protocol number for streaming.
pub const PROTOCOL_STREAMING: u8 = 6;

/// I2CP protocol number for repliable datagrams.
pub const PROTOCOL_DATAGRAM: u8 = 17;

/// Default I2CP protocol number for raw datagrams.
pub const PROTOCOL_RAW: u8 = 18;

/// I2CP protocol number for replay-protected datagrams.
pub const PROTOCOL_DATAGRAM2: u8 = 19;

/// I2CP protocol number for hash-sourced datagrams.
pub const PROTOCOL_DATAGRAM3: u8 = 20;

/// Protocol numbers a raw session must not use.
pub const FORBIDDEN_RAW_PROTOCOLS: [u8; 4] = [6, 17, 19, 20];

/// Datagram style of a single send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramStyle {
    /// Signed repliable datagram.
    Datagram,

    /// Signed repliable datagram with replay protection.
    Datagram2,

    /// Repliable but unauthenticated datagram; the source is a 32-byte hash.
    Datagram3,

    /// Anonymous raw datagram.
    Raw,
}

impl DatagramStyle {
    /// Default I2CP protocol number of the style.
    pub fn protocol(&self) -> u8 {
        match self {
            Self::Datagram => PROTOCOL_DATAGRAM,
            Self::Datagram2 => PROTOCOL_DATAGRAM2,
            Self::Datagram3 => PROTOCOL_DATAGRAM3,
            Self::Raw => PROTOCOL_RAW,
        }
    }
}

/// Pass-through send options, SAM 3.3.
///
/// Defaults are router-dependent; `None` leaves the choice to the router.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SendOptions {
    /// Source port.
    pub from_port: u16,

    /// Destination port.
    pub to_port: u16,

    /// Raw protocol number override.
    pub protocol: Option<u8>,

    /// Number of session tags to send.
    pub send_tags: Option<u16>,

    /// Low tag threshold.
    pub tag_threshold: Option<u16>,

    /// Expiration, seconds since the Unix epoch.
    pub expires: Option<u32>,

    /// Whether to bundle the lease set.
    pub send_leaseset: Option<bool>,
}

/// Outbound datagram handed to the router.
pub struct OutboundDatagram {
    /// Style of this send.
    pub style: DatagramStyle,

    /// Target destination.
    pub target: Destination,

    /// Send options.
    pub options: SendOptions,

    /// Payload, header line already stripped.
    pub payload: Vec<u8>,
}

/// Source identity of an inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatagramSource {
    /// Full repliable source destination, Base64.
    Destination(String),

    /// 32-byte source hash (hash-sourced datagrams).
    Hash([u8; 32]),

    /// No source (raw datagrams).
    Anonymous,
}

/// Inbound message delivered by the router for one session.
#[derive(Debug, Clone)]
pub struct InboundDatagram {
    /// I2CP protocol number.
    pub protocol: u8,

    /// Source port.
    pub from_port: u16,

    /// Destination port.
    pub to_port: u16,

    /// Source identity.
    pub source: DatagramSource,

    /// Replay-protection nonce, replay-protected datagrams only.
    pub nonce: Option<u64>,

    /// Payload.
    pub payload: Vec<u8>,
}

/// Receiver for a session's inbound traffic feed.
pub type InboundReceiver = mpsc::Receiver<InboundDatagram>;

/// Sender counterpart of [`InboundReceiver`], held by router implementations.
pub type InboundSender = mpsc::Sender<InboundDatagram>;

/// Configuration passed to the router when opening a session.
pub struct RouterSessionConfig {
    /// Destination of the session, private keys included.
    pub destination: Destination,

    /// Raw session options (`i2cp.*`, `streaming.*`, `inbound.*`,
    /// `outbound.*`), passed through uninterpreted.
    pub options: HashMap<String, String>,
}

/// An open session on the router: the I2CP handle.
pub trait RouterSession: Send + Sync {
    /// Base64 form of the session's destination.
    fn destination_b64(&self) -> String;

    /// Wait until the router has built the session's tunnels.
    ///
    /// Deadline enforcement is the caller's responsibility.
    fn wait_for_tunnels(&self) -> BoxFuture<'static, crate::Result<()>>;

    /// Send a datagram towards `datagram.target`.
    fn send_datagram(&self, datagram: OutboundDatagram) -> crate::Result<()>;

    /// Close the session and discard its tunnels. Idempotent.
    fn close(&self);
}

/// Result of opening a router session.
pub struct RouterHandle {
    /// The session handle.
    pub session: Arc<dyn RouterSession>,

    /// Inbound traffic feed for the session.
    pub inbound: InboundReceiver,
}

/// Client side of the anonymity router.
pub trait RouterClient: Send + Sync + 'static {
    /// Open a session owning `config.destination`.
    fn create_session(
        &self,
        nickname: Arc<str>,
        config: RouterSessionConfig,
    ) -> BoxFuture<'static, crate::Result<RouterHandle>>;

    /// Resolve `name` (`*.i2p` or `*.b32.i2p`) into a Base64 destination.
    ///
    /// Deadline enforcement is the caller's responsibility.
    fn lookup(&self, name: String) -> BoxFuture<'static, core::result::Result<String, QueryError>>;

    /// Generate a fresh destination, returning `(public, private)` Base64.
    fn generate_destination(
        &self,
        signature_type: SignatureType,
    ) -> crate::Result<(String, String)>;
}

/// Owned duplex byte pipe over an established virtual stream.
pub trait I2pDuplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> I2pDuplex for T {}

/// Boxed virtual stream.
pub type I2pStream = Box<dyn I2pDuplex>;

/// Inbound virtual stream returned by [`StreamTransport::accept()`].
pub struct InboundStream {
    /// The stream.
    pub stream: I2pStream,

    /// Base64 destination of the remote peer.
    pub peer: String,

    /// Source port.
    pub from_port: u16,

    /// Destination port.
    pub to_port: u16,
}

/// Virtual stream transport over an established session.
pub trait StreamTransport: Send + Sync + 'static {
    /// Open an outbound stream from `session` to `target`.
    fn dial(
        &self,
        session: Arc<dyn RouterSession>,
        target: DestinationId,
        from_port: u16,
        to_port: u16,
    ) -> BoxFuture<'static, core::result::Result<I2pStream, PeerError>>;

    /// Wait for the next inbound stream on `session`.
    ///
    /// May be called concurrently; each call yields a distinct stream.
    fn accept(
        &self,
        session: Arc<dyn RouterSession>,
    ) -> BoxFuture<'static, core::result::Result<InboundStream, PeerError>>;
}
