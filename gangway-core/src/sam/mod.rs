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

//! SAMv3 server implementation.
//!
//! https://geti2p.net/en/docs/api/samv3

use crate::{
    config::BridgeConfig,
    error::{ConnectionError, Error},
    router::{RouterClient, StreamTransport},
    runtime::{
        Counter as _, Gauge as _, JoinSet, MetricType, MetricsHandle as _, Runtime, TcpListener,
        UdpSocket,
    },
    sam::{
        auth::AuthStore,
        connection::{ConnectionKind, SamConnection},
        dispatch::CommandRouter,
        naming::DestinationCache,
        protocol::datagram::{DatagramHeader, ForwardedDatagram, MAX_UDP_PACKET},
        session::{
            registry::{close_entries, SessionRegistry},
            SamSession, SamSessionCommand, SamSessionCommandRecycle,
        },
        socket::SamSocket,
    },
    shutdown::ShutdownSignal,
};

use futures::{FutureExt, StreamExt};
use hashbrown::HashMap;
use thingbuf::mpsc::{channel, Receiver, Sender};

use alloc::{sync::Arc, vec, vec::Vec};
use core::{
    future::Future,
    mem,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

pub(crate) mod auth;
pub(crate) mod connection;
pub(crate) mod dispatch;
pub(crate) mod naming;
pub(crate) mod parser;
pub(crate) mod protocol;
pub(crate) mod response;
pub(crate) mod session;
pub(crate) mod socket;
pub(crate) mod version;

/// Logging target for the file.
const LOG_TARGET: &str = "gangway::sam";

/// Maximum length of one command line, terminator included.
pub const MAX_LINE_LENGTH: usize = 65536;

/// Session command channel size.
pub(crate) const COMMAND_CHANNEL_SIZE: usize = 256;

/// Size of the channel feeding the UDP forwarder.
pub(crate) const DATAGRAM_CHANNEL_SIZE: usize = 1024;

/// Deadline for router-side name lookups.
pub(crate) const NAMING_LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Gauge tracking live sessions.
const GAUGE_ACTIVE_SESSIONS: &str = "gangway_active_sessions";

/// Counter tracking datagrams the UDP plane dropped.
const COUNTER_DROPPED_DATAGRAMS: &str = "gangway_dropped_datagrams";

/// Metrics registered by the server.
pub(crate) fn register_metrics(mut metrics: Vec<MetricType>) -> Vec<MetricType> {
    metrics.push(MetricType::Gauge {
        name: GAUGE_ACTIVE_SESSIONS,
        description: "number of live sessions",
    });
    metrics.push(MetricType::Counter {
        name: COUNTER_DROPPED_DATAGRAMS,
        description: "datagrams dropped by the udp plane",
    });

    metrics
}

/// Active sessions: their futures and command channels.
struct SessionContext<R: Runtime> {
    /// Session futures.
    futures: R::JoinSet<Arc<str>>,

    /// TX channels of the sessions, keyed by top-level nickname.
    senders: HashMap<Arc<str>, Sender<SamSessionCommand<R>, SamSessionCommandRecycle>>,
}

impl<R: Runtime> SessionContext<R> {
    /// Create new [`SessionContext`].
    fn new() -> Self {
        Self {
            futures: R::join_set(),
            senders: HashMap::new(),
        }
    }

    /// Insert a new session.
    fn insert(
        &mut self,
        nickname: Arc<str>,
        sender: Sender<SamSessionCommand<R>, SamSessionCommandRecycle>,
        future: impl Future<Output = Arc<str>> + Send + 'static,
    ) {
        self.senders.insert(nickname, sender);
        self.futures.push(future);
    }

    /// Dispatch `command` to the session event loop identified by `routing`.
    fn dispatch(
        &self,
        routing: &Arc<str>,
        command: SamSessionCommand<R>,
    ) -> Result<(), crate::error::ChannelError> {
        self.senders
            .get(routing)
            .ok_or(crate::error::ChannelError::DoesntExist)?
            .try_send(command)
            .map_err(From::from)
    }
}

/// UDP forwarder write state.
enum DatagramWriterState {
    /// Read the next forwarded datagram off the channel.
    GetMessage,

    /// Write the current datagram.
    WriteMessage {
        /// Client address.
        target: SocketAddr,

        /// Packet body.
        datagram: Vec<u8>,
    },
}

/// Server lifecycle state.
enum ServerState<R: Runtime> {
    /// Serving.
    Running,

    /// Shutdown requested; draining sessions until the deadline.
    ShuttingDown {
        /// Forced-exit deadline.
        deadline: R::Timer,
    },
}

/// SAMv3 server.
pub struct SamServer<R: Runtime> {
    /// Active sessions.
    active_sessions: SessionContext<R>,

    /// Authentication store.
    auth: Arc<AuthStore>,

    /// Command routing table.
    command_router: Arc<CommandRouter>,

    /// Server configuration.
    config: Arc<BridgeConfig>,

    /// Shared destination parse cache.
    destination_cache: Arc<DestinationCache>,

    /// RX channel of datagrams to forward to clients.
    datagram_rx: Receiver<ForwardedDatagram>,

    /// TX side, cloned into connections and sessions.
    datagram_tx: Sender<ForwardedDatagram>,

    /// UDP forwarder write state.
    datagram_writer_state: DatagramWriterState,

    /// TCP listener.
    listener: R::TcpListener,

    /// Metrics handle.
    metrics: R::MetricsHandle,

    /// Connections being handshaked or executing pre-session commands.
    pending_connections: R::JoinSet<Option<ConnectionKind<R>>>,

    /// UDP ingress read buffer.
    read_buffer: Vec<u8>,

    /// Global session registry.
    registry: Arc<SessionRegistry>,

    /// Router capability.
    router_client: Arc<dyn RouterClient>,

    /// Shutdown signal; consumed when it fires.
    shutdown: Option<ShutdownSignal>,

    /// Lifecycle state.
    state: ServerState<R>,

    /// Stream transport capability.
    stream_transport: Arc<dyn StreamTransport>,

    /// Shared UDP socket: client-to-network ingress and forwarded delivery.
    udp_socket: R::UdpSocket,
}

impl<R: Runtime> SamServer<R> {
    /// Create a new [`SamServer`], binding both sockets.
    pub async fn new(
        config: BridgeConfig,
        router_client: Arc<dyn RouterClient>,
        stream_transport: Arc<dyn StreamTransport>,
        shutdown: ShutdownSignal,
    ) -> crate::Result<Self> {
        config.validate()?;

        let host = config.host.parse::<IpAddr>().expect("validated address");

        let listener = R::TcpListener::bind(SocketAddr::new(host, config.tcp_port))
            .await
            .ok_or(Error::Connection(ConnectionError::BindFailure))?;
        let udp_socket = R::UdpSocket::bind(SocketAddr::new(host, config.udp_port))
            .await
            .ok_or(Error::Connection(ConnectionError::BindFailure))?;

        tracing::info!(
            target: LOG_TARGET,
            host = %config.host,
            tcp_port = ?listener.local_address().map(|address| address.port()),
            udp_port = ?udp_socket.local_address().map(|address| address.port()),
            "starting sam server",
        );

        let (datagram_tx, datagram_rx) = channel(DATAGRAM_CHANNEL_SIZE);
        let metrics = R::register_metrics(register_metrics(Vec::new()), None);

        Ok(Self {
            active_sessions: SessionContext::new(),
            auth: Arc::new(AuthStore::new(config.auth_required)),
            command_router: Arc::new(Self::build_command_router(&config)),
            config: Arc::new(config),
            destination_cache: Arc::new(DestinationCache::new()),
            datagram_rx,
            datagram_tx,
            datagram_writer_state: DatagramWriterState::GetMessage,
            listener,
            metrics,
            pending_connections: R::join_set(),
            read_buffer: vec![0u8; MAX_UDP_PACKET],
            registry: Arc::new(SessionRegistry::new()),
            router_client,
            shutdown: Some(shutdown),
            state: ServerState::Running,
            stream_transport,
            udp_socket,
        })
    }

    /// Build the command routing table, applying the embedder's registrar
    /// hook if one was configured.
    fn build_command_router(config: &BridgeConfig) -> CommandRouter {
        let mut router = CommandRouter::new();

        if let Some(registrar) = config.registrar {
            registrar(&mut router);
        }

        router
    }

    /// Address of the control listener.
    pub fn tcp_local_address(&self) -> Option<SocketAddr> {
        self.listener.local_address()
    }

    /// Address of the UDP ingress socket.
    pub fn udp_local_address(&self) -> Option<SocketAddr> {
        self.udp_socket.local_address()
    }

    /// Handle one packet from the UDP ingress socket.
    ///
    /// The plane is best-effort: malformed headers, unknown nicknames and
    /// style mismatches drop the packet silently.
    fn on_ingress_packet(&mut self, nread: usize) {
        let Some((header, payload)) = DatagramHeader::parse(&self.read_buffer[..nread]) else {
            tracing::trace!(
                target: LOG_TARGET,
                "malformed ingress datagram, dropping",
            );
            self.metrics.counter(COUNTER_DROPPED_DATAGRAMS).increment(1);
            return;
        };

        let Some(entry) = self.registry.lookup(&header.nickname) else {
            tracing::trace!(
                target: LOG_TARGET,
                nickname = %header.nickname,
                "ingress datagram for unknown session, dropping",
            );
            self.metrics.counter(COUNTER_DROPPED_DATAGRAMS).increment(1);
            return;
        };

        if entry.style.datagram_style().is_none() {
            tracing::trace!(
                target: LOG_TARGET,
                nickname = %header.nickname,
                style = %entry.style,
                "ingress datagram for a non-datagram session, dropping",
            );
            self.metrics.counter(COUNTER_DROPPED_DATAGRAMS).increment(1);
            return;
        }

        let routing = entry.parent.clone().unwrap_or_else(|| Arc::clone(&entry.nickname));
        let command = SamSessionCommand::SendDatagram {
            session_id: Arc::clone(&entry.nickname),
            destination: header.destination,
            options: header.options,
            payload: payload.to_vec(),
        };

        if let Err(error) = self.active_sessions.dispatch(&routing, command) {
            tracing::trace!(
                target: LOG_TARGET,
                nickname = %entry.nickname,
                ?error,
                "failed to dispatch ingress datagram, dropping",
            );
            self.metrics.counter(COUNTER_DROPPED_DATAGRAMS).increment(1);
        }
    }

    /// Begin shutting down: stop accepting, drop pending connections and
    /// close every session through the registry.
    fn start_shutdown(&mut self) {
        tracing::info!(
            target: LOG_TARGET,
            active_sessions = ?self.registry.len(),
            "shutting down",
        );

        self.pending_connections = R::join_set();
        close_entries(self.registry.drain());
        self.state = ServerState::ShuttingDown {
            deadline: R::timer(self.config.shutdown_timeout),
        };
    }
}

impl<R: Runtime> Future for SamServer<R> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);

        if core::matches!(this.state, ServerState::Running) {
            let shutdown_requested = match &mut this.shutdown {
                Some(shutdown) => shutdown.poll_unpin(cx).is_ready(),
                None => false,
            };

            if shutdown_requested {
                this.shutdown = None;
                this.start_shutdown();
            }
        }

        if let ServerState::ShuttingDown { deadline } = &mut this.state {
            let deadline_passed = deadline.poll_unpin(cx).is_ready();

            if deadline_passed || this.active_sessions.futures.is_empty() {
                tracing::info!(
                    target: LOG_TARGET,
                    "server stopped",
                );
                return Poll::Ready(());
            }
        }

        if core::matches!(this.state, ServerState::Running) {
            loop {
                match this.listener.poll_accept(cx) {
                    Poll::Pending => break,
                    Poll::Ready(None) => return Poll::Ready(()),
                    Poll::Ready(Some((stream, address))) => {
                        tracing::debug!(
                            target: LOG_TARGET,
                            ?address,
                            "inbound connection",
                        );

                        this.pending_connections.push(
                            SamConnection::<R>::new(
                                SamSocket::new(stream),
                                Arc::clone(&this.config),
                                Arc::clone(&this.command_router),
                                Arc::clone(&this.registry),
                                Arc::clone(&this.auth),
                                Arc::clone(&this.router_client),
                                Arc::clone(&this.stream_transport),
                                Arc::clone(&this.destination_cache),
                                this.datagram_tx.clone(),
                            )
                            .run(),
                        );
                    }
                }
            }
        }

        loop {
            match Pin::new(&mut this.udp_socket).poll_recv_from(cx, &mut this.read_buffer) {
                Poll::Pending => break,
                Poll::Ready(None) => return Poll::Ready(()),
                Poll::Ready(Some((nread, _))) => this.on_ingress_packet(nread),
            }
        }

        loop {
            match mem::replace(
                &mut this.datagram_writer_state,
                DatagramWriterState::GetMessage,
            ) {
                DatagramWriterState::GetMessage => match this.datagram_rx.poll_recv(cx) {
                    Poll::Pending => break,
                    Poll::Ready(None) => return Poll::Ready(()),
                    Poll::Ready(Some(ForwardedDatagram { target, payload })) => {
                        let Some(target) = target else {
                            continue;
                        };

                        this.datagram_writer_state = DatagramWriterState::WriteMessage {
                            target,
                            datagram: payload,
                        };
                    }
                },
                DatagramWriterState::WriteMessage { target, datagram } =>
                    match Pin::new(&mut this.udp_socket).poll_send_to(cx, &datagram, target) {
                        Poll::Pending => {
                            this.datagram_writer_state =
                                DatagramWriterState::WriteMessage { target, datagram };
                            break;
                        }
                        Poll::Ready(Some(_)) => {}
                        Poll::Ready(None) => {
                            tracing::debug!(
                                target: LOG_TARGET,
                                ?target,
                                "failed to forward datagram",
                            );
                            this.metrics.counter(COUNTER_DROPPED_DATAGRAMS).increment(1);
                        }
                    },
            }
        }

        loop {
            match this.pending_connections.poll_next_unpin(cx) {
                Poll::Pending | Poll::Ready(None) => break,
                // connection closed without handing anything over
                Poll::Ready(Some(None)) => {}
                Poll::Ready(Some(Some(ConnectionKind::Session { context, sender }))) => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        nickname = %context.nickname,
                        "session activated",
                    );

                    this.metrics.gauge(GAUGE_ACTIVE_SESSIONS).increment(1);
                    this.active_sessions.insert(
                        Arc::clone(&context.nickname),
                        sender,
                        SamSession::new(context),
                    );
                }
                Poll::Ready(Some(Some(ConnectionKind::Command { routing, command }))) => {
                    if let Err(error) = this.active_sessions.dispatch(&routing, command) {
                        // the socket travelled inside the command; dropping
                        // it closes the client connection
                        tracing::debug!(
                            target: LOG_TARGET,
                            %routing,
                            ?error,
                            "failed to dispatch stream command",
                        );
                    }
                }
            }
        }

        loop {
            match this.active_sessions.futures.poll_next_unpin(cx) {
                Poll::Pending | Poll::Ready(None) => break,
                Poll::Ready(Some(nickname)) => {
                    tracing::info!(
                        target: LOG_TARGET,
                        %nickname,
                        "session terminated",
                    );

                    this.metrics.gauge(GAUGE_ACTIVE_SESSIONS).decrement(1);
                    this.active_sessions.senders.remove(&nickname);

                    if core::matches!(this.state, ServerState::ShuttingDown { .. })
                        && this.active_sessions.futures.is_empty()
                    {
                        tracing::info!(
                            target: LOG_TARGET,
                            "server stopped",
                        );
                        return Poll::Ready(());
                    }
                }
            }
        }

        Poll::Pending
    }
}
