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

//! Active sessions.
//!
//! A [`SamSession`] is the event loop of one bound session: it owns the
//! control socket, the router-side session handle and the style state, and it
//! serves the stream listeners and the datagram plane for the session and,
//! for primary sessions, for every subsession.

use crate::{
    error::{Error, PeerError, QueryError, ResultCode},
    primitives::{Destination, DestinationId},
    router::{
        DatagramStyle, InboundDatagram, InboundStream, I2pStream, RouterClient, RouterSession,
        SendOptions, StreamTransport, PROTOCOL_STREAMING,
    },
    runtime::{JoinSet, Runtime},
    sam::{
        dispatch::{CommandKind, CommandRouter},
        naming::{self, DestinationCache, LookupOutcome},
        parser::Command,
        protocol::{
            datagram::{self, DatagramState, ForwardedDatagram},
            streaming::{
                connect_forward_target, run_forward_relay, run_relay, AcceptWaiter,
                ExpiredWaiter, ForwardConfig, StreamListener,
            },
        },
        response::Response,
        socket::SamSocket,
        version::SamVersion,
        NAMING_LOOKUP_TIMEOUT,
    },
    util::with_deadline,
};

use futures::StreamExt;
use hashbrown::HashMap;
use thingbuf::mpsc::{Receiver, Sender};

use alloc::{
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};
use core::{
    future::Future,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

pub mod primary;
pub mod registry;

use primary::{Subsession, SubsessionTable};
use registry::SessionRegistry;

/// Logging target for the file.
const LOG_TARGET: &str = "gangway::sam::session";

/// Default deadline for an outbound stream dial.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Session style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStyle {
    /// Reliable virtual streams.
    Stream,

    /// Signed repliable datagrams.
    Datagram,

    /// Anonymous raw datagrams.
    Raw,

    /// Signed repliable datagrams with replay protection.
    Datagram2,

    /// Repliable datagrams whose source is a 32-byte hash.
    Datagram3,

    /// Multiplexer fanning subsessions out over one destination.
    Primary,
}

impl SessionStyle {
    /// Parse the `STYLE=` value.
    pub fn parse(style: &str) -> Option<Self> {
        match style {
            "STREAM" => Some(Self::Stream),
            "DATAGRAM" => Some(Self::Datagram),
            "RAW" => Some(Self::Raw),
            "DATAGRAM2" => Some(Self::Datagram2),
            "DATAGRAM3" => Some(Self::Datagram3),
            "PRIMARY" => Some(Self::Primary),
            _ => None,
        }
    }

    /// Wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "STREAM",
            Self::Datagram => "DATAGRAM",
            Self::Raw => "RAW",
            Self::Datagram2 => "DATAGRAM2",
            Self::Datagram3 => "DATAGRAM3",
            Self::Primary => "PRIMARY",
        }
    }

    /// The datagram style of this session style, if it has one.
    pub fn datagram_style(&self) -> Option<DatagramStyle> {
        match self {
            Self::Datagram => Some(DatagramStyle::Datagram),
            Self::Datagram2 => Some(DatagramStyle::Datagram2),
            Self::Datagram3 => Some(DatagramStyle::Datagram3),
            Self::Raw => Some(DatagramStyle::Raw),
            Self::Stream | Self::Primary => None,
        }
    }
}

impl core::fmt::Display for SessionStyle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle status.
///
/// `Creating → Active` happens exactly once, on activation; close is
/// idempotent and always passes through `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Being created; tunnels not ready.
    Creating,

    /// Ready for use.
    Active,

    /// Tearing down.
    Closing,

    /// Fully closed.
    Closed,
}

/// Recycling strategy for [`SamSessionCommand`].
#[derive(Default, Clone)]
pub struct SamSessionCommandRecycle(());

impl<R: Runtime> thingbuf::Recycle<SamSessionCommand<R>> for SamSessionCommandRecycle {
    fn new_element(&self) -> SamSessionCommand<R> {
        SamSessionCommand::Dummy
    }

    fn recycle(&self, element: &mut SamSessionCommand<R>) {
        *element = SamSessionCommand::Dummy;
    }
}

/// Commands dispatched to an active session by the server.
pub enum SamSessionCommand<R: Runtime> {
    /// Open an outbound stream.
    Connect {
        /// Target (sub)session nickname.
        session_id: Arc<str>,

        /// Socket the command arrived on; hijacked on success.
        socket: SamSocket<R>,

        /// Resolved remote destination.
        target: DestinationId,

        /// Source port.
        from_port: u16,

        /// Destination port.
        to_port: u16,

        /// Whether status lines are suppressed.
        silent: bool,

        /// Negotiated version of the commanding connection.
        version: SamVersion,
    },

    /// Park a socket waiting for an inbound stream.
    Accept {
        /// Target (sub)session nickname.
        session_id: Arc<str>,

        /// Socket the command arrived on.
        socket: SamSocket<R>,

        /// Whether the peer line is suppressed.
        silent: bool,

        /// Negotiated version of the commanding connection.
        version: SamVersion,
    },

    /// Register a persistent forward.
    Forward {
        /// Target (sub)session nickname.
        session_id: Arc<str>,

        /// Socket the command arrived on; held open for the forward's
        /// lifetime.
        socket: SamSocket<R>,

        /// Local target.
        target: SocketAddr,

        /// Whether the local connection is TLS-wrapped.
        ssl: bool,

        /// Whether peer lines are suppressed.
        silent: bool,

        /// Negotiated version of the commanding connection.
        version: SamVersion,
    },

    /// Send a datagram that arrived on the UDP ingress socket.
    SendDatagram {
        /// Target (sub)session nickname.
        session_id: Arc<str>,

        /// Target destination, Base64.
        destination: String,

        /// Send options from the ingress header.
        options: SendOptions,

        /// Payload.
        payload: Vec<u8>,
    },

    /// Dummy event, never dispatched.
    Dummy,
}

impl<R: Runtime> Default for SamSessionCommand<R> {
    fn default() -> Self {
        Self::Dummy
    }
}

/// Everything an activated session needs to run.
pub struct SamSessionContext<R: Runtime> {
    /// Nickname.
    pub nickname: Arc<str>,

    /// Style.
    pub style: SessionStyle,

    /// Destination owned by the session.
    pub destination: Destination,

    /// Negotiated version of the creating connection.
    pub version: SamVersion,

    /// Raw session options.
    pub options: HashMap<String, String>,

    /// Control socket; its closure ends the session.
    pub socket: SamSocket<R>,

    /// Router-side session handle.
    pub router_session: Arc<dyn RouterSession>,

    /// Inbound traffic feed.
    pub inbound: crate::router::InboundReceiver,

    /// RX channel for commands dispatched by the server.
    pub receiver: Receiver<SamSessionCommand<R>, SamSessionCommandRecycle>,

    /// Global session registry.
    pub registry: Arc<SessionRegistry>,

    /// Router capability, for naming lookups on the bound socket.
    pub router_client: Arc<dyn RouterClient>,

    /// Stream transport capability.
    pub stream_transport: Arc<dyn StreamTransport>,

    /// TX channel towards the server's UDP forwarder.
    pub datagram_tx: Sender<ForwardedDatagram>,

    /// Shared destination parse cache.
    pub destination_cache: Arc<DestinationCache>,

    /// Command routing table.
    pub command_router: Arc<CommandRouter>,
}

/// Outcome of an outbound dial.
struct DialOutcome<R: Runtime> {
    /// Socket to hijack or answer.
    socket: SamSocket<R>,

    /// Whether status lines are suppressed.
    silent: bool,

    /// Result of the dial.
    result: Result<I2pStream, PeerError>,
}

/// In-progress payload read for a control-socket `DATAGRAM SEND`/`RAW SEND`.
struct PendingSend {
    /// Style of the send.
    style: DatagramStyle,

    /// Target destination, Base64.
    destination: String,

    /// Send options parsed from the command.
    options: SendOptions,

    /// Payload buffer, `SIZE=` bytes.
    buffer: Vec<u8>,

    /// Bytes read so far.
    filled: usize,
}

/// Per-(sub)session forward target parsed from session options.
fn forward_target(options: &HashMap<String, String>) -> Option<SocketAddr> {
    let port = options.get("PORT")?.parse::<u16>().ok()?;
    let host = options
        .get("HOST")
        .and_then(|host| host.parse::<IpAddr>().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    Some(SocketAddr::new(host, port))
}

/// Resolve the most recent session of `style` and send one datagram through
/// it.
///
/// Control-socket sends act on the most recently created session of the
/// matching style on the whole server, not on the session bound to the
/// issuing connection.
pub fn send_control_datagram(
    registry: &SessionRegistry,
    cache: &DestinationCache,
    style: DatagramStyle,
    destination: &str,
    options: SendOptions,
    payload: Vec<u8>,
) -> crate::Result<()> {
    datagram::validate_send(style, payload.len(), options.protocol)?;

    let session_style = match style {
        DatagramStyle::Datagram => SessionStyle::Datagram,
        DatagramStyle::Datagram2 => SessionStyle::Datagram2,
        DatagramStyle::Datagram3 => SessionStyle::Datagram3,
        DatagramStyle::Raw => SessionStyle::Raw,
    };
    let entry = registry
        .most_recent_by_style(session_style)
        .ok_or(Error::Registry(crate::error::RegistryError::NicknameDoesntExist))?;
    let router = entry.router.ok_or(Error::InvalidState)?;

    let target = cache.parse(destination)?;

    router.send_datagram(crate::router::OutboundDatagram {
        style,
        target,
        options,
        payload,
    })
}

/// Runtime state of one (sub)session entry.
struct EntryState<R: Runtime> {
    /// Stream listener, for stream-style entries.
    listener: Option<StreamListener<R>>,

    /// Datagram state, for datagram-style entries.
    datagram: Option<DatagramState>,
}

impl<R: Runtime> EntryState<R> {
    /// Build the runtime state for a (sub)session of `style`.
    fn new(style: SessionStyle, options: &HashMap<String, String>) -> Self {
        match style.datagram_style() {
            Some(datagram_style) => {
                let protocol = options
                    .get("PROTOCOL")
                    .and_then(|protocol| protocol.parse::<u8>().ok())
                    .unwrap_or(datagram_style.protocol());
                let header_enabled = options
                    .get("HEADER")
                    .map(|header| header.parse::<bool>().unwrap_or(false))
                    .unwrap_or(false);

                Self {
                    listener: None,
                    datagram: Some(DatagramState::new(
                        datagram_style,
                        protocol,
                        header_enabled,
                        forward_target(options),
                    )),
                }
            }
            None => Self {
                listener: core::matches!(style, SessionStyle::Stream)
                    .then(|| StreamListener::Inactive),
                datagram: None,
            },
        }
    }
}

/// An active session.
pub struct SamSession<R: Runtime> {
    /// Nickname.
    nickname: Arc<str>,

    /// Style.
    style: SessionStyle,

    /// Destination owned by the session.
    destination: Destination,

    /// Negotiated version of the creating connection.
    version: SamVersion,

    /// Dial deadline.
    connect_timeout: Duration,

    /// Accept deadline, if the session configured one.
    accept_timeout: Option<Duration>,

    /// Control socket; `None` once teardown has begun.
    socket: Option<SamSocket<R>>,

    /// Router-side session handle.
    router_session: Arc<dyn RouterSession>,

    /// Inbound traffic feed.
    inbound: crate::router::InboundReceiver,

    /// Commands dispatched by the server.
    receiver: Receiver<SamSessionCommand<R>, SamSessionCommandRecycle>,

    /// Global registry.
    registry: Arc<SessionRegistry>,

    /// Router capability.
    router_client: Arc<dyn RouterClient>,

    /// Stream transport capability.
    stream_transport: Arc<dyn StreamTransport>,

    /// TX channel towards the server's UDP forwarder.
    datagram_tx: Sender<ForwardedDatagram>,

    /// Shared destination parse cache.
    destination_cache: Arc<DestinationCache>,

    /// Command routing table.
    command_router: Arc<CommandRouter>,

    /// Subsession table; empty unless the session is primary.
    table: SubsessionTable,

    /// Per-(sub)session runtime state, own nickname included.
    entries: HashMap<Arc<str>, EntryState<R>>,

    /// Whether a transport accept is outstanding.
    accept_outstanding: bool,

    /// Outstanding transport accepts.
    accepts: R::JoinSet<Result<InboundStream, PeerError>>,

    /// Outstanding dials.
    dials: R::JoinSet<DialOutcome<R>>,

    /// Running relays; dropped wholesale on teardown.
    relays: R::JoinSet<()>,

    /// Pending naming lookups on the bound socket.
    lookups: R::JoinSet<(String, Result<String, QueryError>)>,

    /// Payload read in progress for a control-socket send.
    pending_send: Option<PendingSend>,
}

impl<R: Runtime> SamSession<R> {
    /// Create a new [`SamSession`] from an activated context.
    pub fn new(context: SamSessionContext<R>) -> Self {
        let SamSessionContext {
            nickname,
            style,
            destination,
            version,
            options,
            socket,
            router_session,
            inbound,
            receiver,
            registry,
            router_client,
            stream_transport,
            datagram_tx,
            destination_cache,
            command_router,
        } = context;

        tracing::info!(
            target: LOG_TARGET,
            %nickname,
            %style,
            destination_id = %destination.id(),
            "start active session",
        );

        let connect_timeout = options
            .get("i2p.streaming.connectTimeout")
            .and_then(|timeout| timeout.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        // accepts block indefinitely unless the session opts into a deadline
        let accept_timeout = options
            .get("i2p.streaming.acceptTimeout")
            .and_then(|timeout| timeout.parse::<u64>().ok())
            .map(Duration::from_millis);

        let mut entries = HashMap::new();
        entries.insert(Arc::clone(&nickname), EntryState::new(style, &options));

        Self {
            nickname,
            style,
            destination,
            version,
            connect_timeout,
            accept_timeout,
            socket: Some(socket),
            router_session,
            inbound,
            receiver,
            registry,
            router_client,
            stream_transport,
            datagram_tx,
            destination_cache,
            command_router,
            table: SubsessionTable::new(),
            entries,
            accept_outstanding: false,
            accepts: R::join_set(),
            dials: R::join_set(),
            relays: R::join_set(),
            lookups: R::join_set(),
            pending_send: None,
        }
    }

    /// Queue `response` on the control socket.
    fn respond(&mut self, response: Response) {
        if let Some(socket) = &mut self.socket {
            socket.send_message(response.into_bytes());
        }
    }

    /// Whether any listener could consume an inbound stream.
    fn has_active_listener(&self) -> bool {
        self.entries
            .values()
            .any(|entry| entry.listener.as_ref().map(StreamListener::is_active).unwrap_or(false))
    }

    /// Keep exactly one transport accept outstanding while listeners exist.
    fn maybe_start_accept(&mut self) {
        if self.accept_outstanding || !self.has_active_listener() {
            return;
        }

        self.accepts.push(
            self.stream_transport.accept(Arc::clone(&self.router_session)),
        );
        self.accept_outstanding = true;
    }

    /// The peer line sent ahead of relayed bytes on accept and forward.
    fn peer_line(version: SamVersion, stream: &InboundStream) -> Vec<u8> {
        let mut line = stream.peer.clone();
        if version.supports_ports() {
            line.push_str(&alloc::format!(
                " FROM_PORT={} TO_PORT={}",
                stream.from_port, stream.to_port,
            ));
        }
        line.push('\n');

        line.into_bytes()
    }

    /// Nickname of the (sub)session an inbound stream belongs to.
    fn route_stream(&self, stream: &InboundStream) -> Option<Arc<str>> {
        match self.style {
            SessionStyle::Primary => self
                .table
                .route(stream.to_port, PROTOCOL_STREAMING)
                .map(|subsession| Arc::clone(&subsession.nickname)),
            _ => Some(Arc::clone(&self.nickname)),
        }
    }

    /// Hand an inbound stream to the listener registered for it.
    fn on_inbound_stream(&mut self, stream: InboundStream) {
        let Some(nickname) = self.route_stream(&stream) else {
            tracing::debug!(
                target: LOG_TARGET,
                nickname = %self.nickname,
                to_port = ?stream.to_port,
                "no route for inbound stream, dropping",
            );
            return;
        };

        let Some(listener) =
            self.entries.get_mut(&nickname).and_then(|entry| entry.listener.as_mut())
        else {
            tracing::debug!(
                target: LOG_TARGET,
                %nickname,
                "inbound stream for a non-stream entry, dropping",
            );
            return;
        };

        if let Some(waiter) = listener.take_waiter() {
            let mut responses = Vec::new();
            if !waiter.silent {
                responses.push(
                    Response::new("STREAM")
                        .with_action("STATUS")
                        .with_result(ResultCode::Ok)
                        .into_bytes(),
                );
                responses.push(Self::peer_line(waiter.version, &stream));
            }

            self.relays.push(run_relay::<R>(waiter.socket, responses, stream.stream));
            return;
        }

        if let StreamListener::Forward(config) = listener {
            let target = config.target;
            let ssl = config.ssl;
            let peer_line =
                (!config.silent).then(|| Self::peer_line(config.version, &stream));

            self.relays.push(async move {
                match connect_forward_target::<R>(target, ssl).await {
                    Some(local) => run_forward_relay::<R>(local, peer_line, stream.stream).await,
                    // local side refused; the inbound stream is rejected by
                    // dropping it
                    None => drop(stream.stream),
                }
            });
            return;
        }

        tracing::debug!(
            target: LOG_TARGET,
            %nickname,
            "inbound stream with no listener, dropping",
        );
    }

    /// Handle `STREAM CONNECT` dispatched by the server.
    fn on_connect(
        &mut self,
        session_id: Arc<str>,
        socket: SamSocket<R>,
        target: DestinationId,
        from_port: u16,
        to_port: u16,
        silent: bool,
        _version: SamVersion,
    ) {
        // connect is valid only towards stream-style entries
        let is_stream = self
            .entries
            .get(&session_id)
            .map(|entry| entry.listener.is_some())
            .unwrap_or(false);

        if !is_stream {
            tracing::warn!(
                target: LOG_TARGET,
                nickname = %session_id,
                "stream connect on a non-stream session",
            );

            Self::reject_stream_socket(&mut self.relays, socket, silent, ResultCode::I2pError);
            return;
        }

        if target == self.destination.id() {
            Self::reject_stream_socket(
                &mut self.relays,
                socket,
                silent,
                ResultCode::CantReachPeer,
            );
            return;
        }

        let dial = self.stream_transport.dial(
            Arc::clone(&self.router_session),
            target,
            from_port,
            to_port,
        );
        let connect_timeout = self.connect_timeout;

        self.dials.push(async move {
            let result = match with_deadline::<R, _>(connect_timeout, dial).await {
                Ok(result) => result,
                Err(_) => Err(PeerError::Timeout),
            };

            DialOutcome {
                socket,
                silent,
                result,
            }
        });
    }

    /// Answer a stream request socket with `result` and drop it, honoring
    /// silent mode.
    fn reject_stream_socket(
        relays: &mut R::JoinSet<()>,
        mut socket: SamSocket<R>,
        silent: bool,
        result: ResultCode,
    ) {
        if silent {
            // silent failures close the socket without a response line
            return;
        }

        relays.push(async move {
            let _ = socket
                .send_message_blocking(
                    Response::new("STREAM")
                        .with_action("STATUS")
                        .with_result(result)
                        .into_bytes(),
                )
                .await;
        });
    }

    /// Handle `STREAM ACCEPT` dispatched by the server.
    fn on_accept(
        &mut self,
        session_id: Arc<str>,
        socket: SamSocket<R>,
        silent: bool,
        version: SamVersion,
    ) {
        let Some(listener) =
            self.entries.get_mut(&session_id).and_then(|entry| entry.listener.as_mut())
        else {
            Self::reject_stream_socket(&mut self.relays, socket, silent, ResultCode::I2pError);
            return;
        };

        if let Err(error) = listener.can_accept(version) {
            tracing::debug!(
                target: LOG_TARGET,
                nickname = %session_id,
                ?error,
                "accept rejected",
            );

            Self::reject_stream_socket(
                &mut self.relays,
                socket,
                silent,
                Error::Session(error).result_code(),
            );
            return;
        }

        let timer = self.accept_timeout.map(R::timer);
        let listener = self
            .entries
            .get_mut(&session_id)
            .and_then(|entry| entry.listener.as_mut())
            .expect("listener to exist");
        let _ = listener.register_accept(AcceptWaiter {
            socket,
            silent,
            version,
            timer,
        });

        self.maybe_start_accept();
    }

    /// Handle `STREAM FORWARD` dispatched by the server.
    fn on_forward(
        &mut self,
        session_id: Arc<str>,
        mut socket: SamSocket<R>,
        target: SocketAddr,
        ssl: bool,
        silent: bool,
        version: SamVersion,
    ) {
        let Some(listener) =
            self.entries.get_mut(&session_id).and_then(|entry| entry.listener.as_mut())
        else {
            Self::reject_stream_socket(&mut self.relays, socket, silent, ResultCode::I2pError);
            return;
        };

        if let Err(error) = listener.can_forward() {
            tracing::debug!(
                target: LOG_TARGET,
                nickname = %session_id,
                ?error,
                "forward rejected",
            );

            Self::reject_stream_socket(
                &mut self.relays,
                socket,
                silent,
                Error::Session(error).result_code(),
            );
            return;
        }

        // the ok reply is queued before the socket parks inside the forward
        if !silent {
            socket.send_message(
                Response::new("STREAM")
                    .with_action("STATUS")
                    .with_result(ResultCode::Ok)
                    .into_bytes(),
            );
        }

        let listener = self
            .entries
            .get_mut(&session_id)
            .and_then(|entry| entry.listener.as_mut())
            .expect("listener to exist");
        let _ = listener.register_forward(ForwardConfig {
            socket,
            target,
            ssl,
            silent,
            version,
        });

        self.maybe_start_accept();
    }

    /// Handle a datagram received on the UDP ingress socket.
    fn on_send_datagram(
        &mut self,
        session_id: Arc<str>,
        destination: String,
        options: SendOptions,
        payload: Vec<u8>,
    ) {
        let Some(state) =
            self.entries.get(&session_id).and_then(|entry| entry.datagram.as_ref())
        else {
            tracing::debug!(
                target: LOG_TARGET,
                nickname = %session_id,
                "datagram send on a non-datagram session, dropping",
            );
            return;
        };
        let style = state.style;

        if let Err(error) =
            datagram::validate_send(style, payload.len(), options.protocol)
        {
            tracing::debug!(
                target: LOG_TARGET,
                nickname = %session_id,
                ?error,
                "dropping invalid outbound datagram",
            );
            return;
        }

        let target = match self.destination_cache.parse(&destination) {
            Ok(target) => target,
            Err(error) => {
                tracing::debug!(
                    target: LOG_TARGET,
                    nickname = %session_id,
                    ?error,
                    "malformed target destination, dropping datagram",
                );
                return;
            }
        };

        if let Err(error) = self.router_session.send_datagram(crate::router::OutboundDatagram {
            style,
            target,
            options,
            payload,
        }) {
            tracing::debug!(
                target: LOG_TARGET,
                nickname = %session_id,
                ?error,
                "router rejected outbound datagram",
            );
        }
    }

    /// Route an inbound datagram to a (sub)session receive queue.
    fn on_inbound_datagram(&mut self, datagram: InboundDatagram) {
        if datagram.protocol == PROTOCOL_STREAMING {
            // streaming payloads are the transport's concern
            return;
        }

        let nickname = match self.style {
            SessionStyle::Primary =>
                match self.table.route(datagram.to_port, datagram.protocol) {
                    Some(subsession) => Arc::clone(&subsession.nickname),
                    None => {
                        tracing::trace!(
                            target: LOG_TARGET,
                            nickname = %self.nickname,
                            to_port = ?datagram.to_port,
                            protocol = ?datagram.protocol,
                            "no route for inbound datagram, dropping",
                        );
                        return;
                    }
                },
            _ => Arc::clone(&self.nickname),
        };

        let version = self.version;
        match self.entries.get_mut(&nickname).and_then(|entry| entry.datagram.as_mut()) {
            Some(state) => state.push(&datagram, version),
            None => tracing::trace!(
                target: LOG_TARGET,
                %nickname,
                "inbound datagram for a non-datagram entry, dropping",
            ),
        }
    }

    /// Handle `SESSION ADD`.
    fn on_session_add(&mut self, command: &Command) {
        if !core::matches!(self.style, SessionStyle::Primary) {
            self.respond(
                Response::new("SESSION")
                    .with_action("STATUS")
                    .with_result(ResultCode::I2pError)
                    .with_message("session is not primary"),
            );
            return;
        }

        let (Some(nickname), Some(style)) = (command.get("ID"), command.get("STYLE")) else {
            self.respond(
                Response::new("SESSION")
                    .with_action("STATUS")
                    .with_result(ResultCode::I2pError)
                    .with_message("ID and STYLE are required"),
            );
            return;
        };
        let nickname = nickname.to_string();

        let Some(style) = SessionStyle::parse(style) else {
            self.respond(
                Response::new("SESSION")
                    .with_action("STATUS")
                    .with_result(ResultCode::I2pError)
                    .with_message("unsupported session style"),
            );
            return;
        };

        let (Ok(listen_port), Ok(listen_protocol)) = (
            command.get_parsed::<u16>("LISTEN_PORT"),
            command.get_parsed::<u8>("LISTEN_PROTOCOL"),
        ) else {
            self.respond(
                Response::new("SESSION")
                    .with_action("STATUS")
                    .with_result(ResultCode::I2pError)
                    .with_message("malformed listen port or protocol"),
            );
            return;
        };
        let listen_port = listen_port.unwrap_or(0u16);
        let listen_protocol = listen_protocol
            .unwrap_or_else(|| style.datagram_style().map(|s| s.protocol()).unwrap_or(PROTOCOL_STREAMING));

        // global nickname uniqueness first, the routing table second; the
        // reservation is rolled back if the table rejects the subsession
        let reserved = match self.registry.reserve_subsession(
            &nickname,
            style,
            Arc::clone(&self.nickname),
        ) {
            Ok(reserved) => reserved,
            Err(error) => {
                self.respond(
                    Response::new("SESSION")
                        .with_action("STATUS")
                        .with_result(Error::Registry(error).result_code()),
                );
                return;
            }
        };

        if let Err(error) = self.table.insert(Subsession {
            nickname: Arc::clone(&reserved),
            style,
            listen_port,
            listen_protocol,
        }) {
            self.registry.remove(&reserved);
            let message = alloc::format!("{error}");
            self.respond(
                Response::new("SESSION")
                    .with_action("STATUS")
                    .with_result(Error::Session(error).result_code())
                    .with_message(&message),
            );
            return;
        }

        if let Err(error) = self.registry.activate(&reserved, Arc::clone(&self.router_session)) {
            self.table.remove(&reserved);
            self.registry.remove(&reserved);
            self.respond(
                Response::new("SESSION")
                    .with_action("STATUS")
                    .with_result(Error::Registry(error).result_code()),
            );
            return;
        }

        let options = command.options.clone();
        self.entries.insert(Arc::clone(&reserved), EntryState::new(style, &options));

        tracing::info!(
            target: LOG_TARGET,
            parent = %self.nickname,
            subsession = %reserved,
            %style,
            ?listen_port,
            ?listen_protocol,
            "subsession added",
        );

        self.respond(
            Response::new("SESSION")
                .with_action("STATUS")
                .with_result(ResultCode::Ok)
                .with_option("ID", &nickname),
        );
    }

    /// Handle `SESSION REMOVE`.
    fn on_session_remove(&mut self, command: &Command) {
        let Some(nickname) = command.get("ID") else {
            self.respond(
                Response::new("SESSION")
                    .with_action("STATUS")
                    .with_result(ResultCode::I2pError)
                    .with_message("ID is required"),
            );
            return;
        };

        match self.table.remove(nickname) {
            Some(subsession) => {
                self.registry.remove(&subsession.nickname);
                self.entries.remove(&subsession.nickname);

                tracing::info!(
                    target: LOG_TARGET,
                    parent = %self.nickname,
                    subsession = %subsession.nickname,
                    "subsession removed",
                );

                self.respond(
                    Response::new("SESSION")
                        .with_action("STATUS")
                        .with_result(ResultCode::Ok)
                        .with_option("ID", nickname),
                );
            }
            None => self.respond(
                Response::new("SESSION")
                    .with_action("STATUS")
                    .with_result(ResultCode::InvalidId),
            ),
        }
    }

    /// Handle `NAMING LOOKUP` on the bound socket.
    fn on_naming_lookup(&mut self, command: &Command) {
        match naming::lookup(command, Some(&self.destination)) {
            LookupOutcome::Reply(response) => self.respond(response),
            LookupOutcome::Deferred { name } => {
                let lookup = self.router_client.lookup(name.clone());

                self.lookups.push(async move {
                    let result =
                        match with_deadline::<R, _>(NAMING_LOOKUP_TIMEOUT, lookup).await {
                            Ok(result) => result,
                            Err(_) => Err(QueryError::Timeout),
                        };

                    (name, result)
                });
            }
        }
    }

    /// Handle a control-socket `DATAGRAM SEND`/`RAW SEND` header line.
    ///
    /// The payload follows the line; reading it is resumed from `poll()`.
    fn on_control_send(&mut self, command: &Command, style: DatagramStyle) {
        let verb = match style {
            DatagramStyle::Raw => "RAW",
            _ => "DATAGRAM",
        };

        let (Some(destination), Ok(Some(size))) =
            (command.get("DESTINATION"), command.get_parsed::<usize>("SIZE"))
        else {
            self.respond(
                Response::new(verb)
                    .with_action("STATUS")
                    .with_result(ResultCode::I2pError)
                    .with_message("DESTINATION and SIZE are required"),
            );
            return;
        };

        let mut options = SendOptions::default();
        options.from_port = command.get_parsed::<u16>("FROM_PORT").ok().flatten().unwrap_or(0);
        options.to_port = command.get_parsed::<u16>("TO_PORT").ok().flatten().unwrap_or(0);
        options.protocol = command.get_parsed::<u8>("PROTOCOL").ok().flatten();
        options.send_tags = command.get_parsed::<u16>("SEND_TAGS").ok().flatten();
        options.tag_threshold = command.get_parsed::<u16>("TAG_THRESHOLD").ok().flatten();
        options.expires = command.get_parsed::<u32>("EXPIRES").ok().flatten();
        options.send_leaseset = command.get_parsed::<bool>("SEND_LEASESET").ok().flatten();

        if size > datagram::MAX_RAW_PAYLOAD {
            self.respond(
                Response::new(verb)
                    .with_action("STATUS")
                    .with_result(ResultCode::I2pError)
                    .with_message("datagram exceeds maximum size"),
            );
            return;
        }

        self.pending_send = Some(PendingSend {
            style,
            destination: destination.to_string(),
            options,
            buffer: alloc::vec![0u8; size],
            filled: 0usize,
        });
    }

    /// Complete a control-socket send once its payload has been read.
    fn finish_control_send(&mut self, send: PendingSend) {
        let verb = match send.style {
            DatagramStyle::Raw => "RAW",
            _ => "DATAGRAM",
        };

        if let Err(error) = send_control_datagram(
            &self.registry,
            &self.destination_cache,
            send.style,
            &send.destination,
            send.options,
            send.buffer,
        ) {
            tracing::debug!(
                target: LOG_TARGET,
                nickname = %self.nickname,
                ?error,
                "control-socket send failed",
            );

            self.respond(
                Response::new(verb)
                    .with_action("STATUS")
                    .with_result(error.result_code())
                    .with_message(&alloc::format!("{error}")),
            );
        }
    }

    /// Handle one command read from the bound control socket.
    ///
    /// Returns `true` when the session should shut down.
    fn on_command(&mut self, command: Command) -> bool {
        let kind = self.command_router.route(&command);

        match kind {
            Some(CommandKind::Ping) => {
                let mut line = String::from("PONG");
                if let Some(payload) = &command.payload {
                    line.push(' ');
                    line.push_str(payload);
                }
                line.push('\n');

                if let Some(socket) = &mut self.socket {
                    socket.send_message(line.into_bytes());
                }
            }
            // unsolicited, the connection-phase keepalive owns ping state
            Some(CommandKind::Pong) => {}
            Some(CommandKind::Quit) => {
                self.respond(
                    Response::new("SESSION")
                        .with_action("STATUS")
                        .with_result(ResultCode::Ok)
                        .with_message("closing"),
                );
                return true;
            }
            Some(CommandKind::Help) => {
                let response = self.command_router.help();
                self.respond(response);
            }
            Some(CommandKind::NamingLookup) => self.on_naming_lookup(&command),
            Some(CommandKind::DestGenerate) => {
                let response = naming::generate(&*self.router_client, &command);
                self.respond(response);
            }
            Some(CommandKind::SessionAdd) => self.on_session_add(&command),
            Some(CommandKind::SessionRemove) => self.on_session_remove(&command),
            Some(CommandKind::DatagramSend) =>
                self.on_control_send(&command, DatagramStyle::Datagram),
            Some(CommandKind::RawSend) => self.on_control_send(&command, DatagramStyle::Raw),
            Some(CommandKind::HelloVersion) => self.respond(
                Response::new("HELLO")
                    .with_action("REPLY")
                    .with_result(ResultCode::I2pError)
                    .with_message("handshake already completed"),
            ),
            Some(CommandKind::SessionCreate) => self.respond(
                Response::new("SESSION")
                    .with_action("STATUS")
                    .with_result(ResultCode::I2pError)
                    .with_message("session already bound"),
            ),
            Some(
                CommandKind::StreamConnect
                | CommandKind::StreamAccept
                | CommandKind::StreamForward,
            ) => self.respond(
                Response::new("STREAM")
                    .with_action("STATUS")
                    .with_result(ResultCode::I2pError)
                    .with_message("stream commands require their own connection"),
            ),
            Some(
                CommandKind::AuthEnable
                | CommandKind::AuthDisable
                | CommandKind::AuthAdd
                | CommandKind::AuthRemove,
            ) => self.respond(
                Response::new("AUTH")
                    .with_action("STATUS")
                    .with_result(ResultCode::I2pError)
                    .with_message("auth commands are not valid on a bound connection"),
            ),
            None => {
                let response = self.command_router.unknown_command(&command);
                self.respond(response);
            }
        }

        false
    }

    /// Tear the session down: close subsessions, deregister, release the
    /// router handle.
    fn teardown(&mut self) {
        tracing::info!(
            target: LOG_TARGET,
            nickname = %self.nickname,
            "session closing",
        );

        self.registry.mark_closing(&self.nickname);

        for nickname in self.table.nicknames() {
            self.table.remove(&nickname);
            self.registry.remove(&nickname);
        }

        self.registry.remove(&self.nickname);
        // the registry lock is no longer held; closing the router session is
        // safe even if it re-enters the registry
        self.router_session.close();
        self.socket = None;
    }
}

impl<R: Runtime> Future for SamSession<R> {
    type Output = Arc<str>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        loop {
            match this.receiver.poll_recv(cx) {
                Poll::Pending => break,
                Poll::Ready(None) => {
                    this.teardown();
                    return Poll::Ready(Arc::clone(&this.nickname));
                }
                Poll::Ready(Some(command)) => match command {
                    SamSessionCommand::Connect {
                        session_id,
                        socket,
                        target,
                        from_port,
                        to_port,
                        silent,
                        version,
                    } => this.on_connect(
                        session_id, socket, target, from_port, to_port, silent, version,
                    ),
                    SamSessionCommand::Accept {
                        session_id,
                        socket,
                        silent,
                        version,
                    } => this.on_accept(session_id, socket, silent, version),
                    SamSessionCommand::Forward {
                        session_id,
                        socket,
                        target,
                        ssl,
                        silent,
                        version,
                    } => this.on_forward(session_id, socket, target, ssl, silent, version),
                    SamSessionCommand::SendDatagram {
                        session_id,
                        destination,
                        options,
                        payload,
                    } => this.on_send_datagram(session_id, destination, options, payload),
                    SamSessionCommand::Dummy => unreachable!(),
                },
            }
        }

        loop {
            match this.inbound.poll_next_unpin(cx) {
                Poll::Pending => break,
                Poll::Ready(None) => {
                    tracing::info!(
                        target: LOG_TARGET,
                        nickname = %this.nickname,
                        "router session closed, shutting down",
                    );

                    this.teardown();
                    return Poll::Ready(Arc::clone(&this.nickname));
                }
                Poll::Ready(Some(datagram)) => this.on_inbound_datagram(datagram),
            }
        }

        loop {
            match this.accepts.poll_next_unpin(cx) {
                Poll::Pending => break,
                Poll::Ready(None) => break,
                Poll::Ready(Some(result)) => {
                    this.accept_outstanding = false;

                    match result {
                        Ok(stream) => this.on_inbound_stream(stream),
                        Err(error) => tracing::debug!(
                            target: LOG_TARGET,
                            nickname = %this.nickname,
                            ?error,
                            "transport accept failed",
                        ),
                    }
                }
            }
        }

        loop {
            match this.dials.poll_next_unpin(cx) {
                Poll::Pending | Poll::Ready(None) => break,
                Poll::Ready(Some(DialOutcome {
                    socket,
                    silent,
                    result,
                })) => match result {
                    Ok(stream) => {
                        let responses = match silent {
                            true => Vec::new(),
                            false => alloc::vec![Response::new("STREAM")
                                .with_action("STATUS")
                                .with_result(ResultCode::Ok)
                                .into_bytes()],
                        };

                        this.relays.push(run_relay::<R>(socket, responses, stream));
                    }
                    Err(error) => {
                        tracing::debug!(
                            target: LOG_TARGET,
                            nickname = %this.nickname,
                            ?error,
                            "outbound stream failed",
                        );

                        Self::reject_stream_socket(
                            &mut this.relays,
                            socket,
                            silent,
                            Error::Peer(error).result_code(),
                        );
                    }
                },
            }
        }

        // reap finished relays
        while let Poll::Ready(Some(())) = this.relays.poll_next_unpin(cx) {}

        loop {
            match this.lookups.poll_next_unpin(cx) {
                Poll::Pending | Poll::Ready(None) => break,
                Poll::Ready(Some((name, result))) => {
                    let response = naming::lookup_reply(&name, &result);
                    this.respond(response);
                }
            }
        }

        // drive parked accept sockets and their deadlines
        let mut expired = Vec::new();
        for entry in this.entries.values_mut() {
            if let Some(listener) = entry.listener.as_mut() {
                expired.append(&mut listener.poll(cx));
            }
        }
        for waiter in expired {
            if let ExpiredWaiter::TimedOut(waiter) = waiter {
                Self::reject_stream_socket(
                    &mut this.relays,
                    waiter.socket,
                    waiter.silent,
                    ResultCode::Timeout,
                );
            }
        }
        this.maybe_start_accept();

        // flush receive queues towards their delivery targets
        for entry in this.entries.values_mut() {
            let Some(state) = entry.datagram.as_mut() else {
                continue;
            };

            while let Some(queued) = state.pop() {
                match queued.target {
                    Some(_) => {
                        if let Err(error) = this.datagram_tx.try_send(queued.clone()) {
                            match crate::error::ChannelError::from(error) {
                                crate::error::ChannelError::Full => {
                                    state.push_front(queued);
                                }
                                _ => state.record_drop(),
                            }
                            break;
                        }
                    }
                    None => match &mut this.socket {
                        Some(socket) => socket.send_message(queued.payload),
                        None => {
                            state.record_drop();
                            break;
                        }
                    },
                }
            }
        }

        // payload of a control-socket send in progress
        if let Some(mut send) = this.pending_send.take() {
            if let Some(socket) = &mut this.socket {
                match socket.poll_read_exact(cx, &mut send.buffer, &mut send.filled) {
                    Poll::Pending => this.pending_send = Some(send),
                    Poll::Ready(Err(_)) => {
                        this.teardown();
                        return Poll::Ready(Arc::clone(&this.nickname));
                    }
                    Poll::Ready(Ok(())) => this.finish_control_send(send),
                }
            }
        }

        loop {
            if this.pending_send.is_some() {
                // command processing is serial; the payload read finishes
                // before the next command is parsed
                break;
            }

            let event = match &mut this.socket {
                None => break,
                Some(socket) => socket.poll_next_unpin(cx),
            };

            match event {
                Poll::Pending => break,
                Poll::Ready(None) => {
                    tracing::info!(
                        target: LOG_TARGET,
                        nickname = %this.nickname,
                        "control socket closed, destroying session",
                    );

                    this.teardown();
                    return Poll::Ready(Arc::clone(&this.nickname));
                }
                Poll::Ready(Some(Err(error))) => {
                    this.respond(
                        Response::new("ERROR")
                            .with_action("STATUS")
                            .with_result(ResultCode::I2pError)
                            .with_message(&alloc::format!("{error}")),
                    );
                }
                Poll::Ready(Some(Ok(command))) =>
                    if this.on_command(command) {
                        this.teardown();
                        return Poll::Ready(Arc::clone(&this.nickname));
                    },
            }
        }

        Poll::Pending
    }
}
