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

//! Per-connection state machine.
//!
//! A connection moves `New → Ready` on a successful `HELLO VERSION` and
//! `Ready → SessionBound` on a successful `SESSION CREATE`; stream commands
//! hand the socket over to the session they target. Everything before that
//! hand-over, handshake and command deadlines, keepalive, authentication and
//! the session-independent commands, lives here.

use crate::{
    config::BridgeConfig,
    error::{ConnectionError, Error, QueryError, ResultCode},
    primitives::{Destination, DestinationId, SignatureType},
    router::{RouterClient, RouterSessionConfig, StreamTransport},
    runtime::Runtime,
    sam::{
        auth::AuthStore,
        dispatch::{CommandKind, CommandRouter},
        naming::{self, DestinationCache, LookupOutcome},
        parser::Command,
        protocol::datagram::MAX_RAW_PAYLOAD,
        response::Response,
        session::{
            registry::SessionRegistry, send_control_datagram, SamSessionCommand,
            SamSessionCommandRecycle, SamSessionContext, SessionStyle,
        },
        socket::SamSocket,
        version::SamVersion,
        COMMAND_CHANNEL_SIZE, NAMING_LOOKUP_TIMEOUT,
    },
    util::with_deadline,
};

use futures::{
    future::{select, Either},
    StreamExt,
};
use hashbrown::HashMap;
use thingbuf::mpsc::{with_recycle, Sender};

use alloc::{
    string::{String, ToString},
    sync::Arc,
};
use core::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::protocol::datagram::ForwardedDatagram;
use crate::router::DatagramStyle;

/// Logging target for the file.
const LOG_TARGET: &str = "gangway::sam::connection";

/// What a finished connection hands back to the server.
pub enum ConnectionKind<R: Runtime> {
    /// A session was created and activated on this connection.
    Session {
        /// Context for the session's event loop.
        context: SamSessionContext<R>,

        /// TX channel for dispatching commands to the session.
        sender: Sender<SamSessionCommand<R>, SamSessionCommandRecycle>,
    },

    /// A stream command targeting an existing session; the socket travels
    /// inside the command.
    Command {
        /// Nickname of the session owning the event loop (the parent, for
        /// subsessions).
        routing: Arc<str>,

        /// The command.
        command: SamSessionCommand<R>,
    },
}

/// Control flow of one handled command.
enum Step {
    /// Keep reading commands.
    Continue,

    /// Close the connection.
    Close,
}

/// A SAM connection before it is bound to or consumed by a session.
pub struct SamConnection<R: Runtime> {
    /// Socket.
    socket: SamSocket<R>,

    /// Server configuration.
    config: Arc<BridgeConfig>,

    /// Command routing table.
    command_router: Arc<CommandRouter>,

    /// Global session registry.
    registry: Arc<SessionRegistry>,

    /// Authentication store.
    auth: Arc<AuthStore>,

    /// Router capability.
    router_client: Arc<dyn RouterClient>,

    /// Stream transport capability.
    stream_transport: Arc<dyn StreamTransport>,

    /// Shared destination parse cache.
    destination_cache: Arc<DestinationCache>,

    /// TX channel towards the server's UDP forwarder, handed to sessions.
    datagram_tx: Sender<ForwardedDatagram>,

    /// Payload of the last server-initiated `PING` still awaiting its echo.
    pending_ping: Option<String>,
}

impl<R: Runtime> SamConnection<R> {
    /// Create a new [`SamConnection`] for an accepted socket.
    pub fn new(
        socket: SamSocket<R>,
        config: Arc<BridgeConfig>,
        command_router: Arc<CommandRouter>,
        registry: Arc<SessionRegistry>,
        auth: Arc<AuthStore>,
        router_client: Arc<dyn RouterClient>,
        stream_transport: Arc<dyn StreamTransport>,
        destination_cache: Arc<DestinationCache>,
        datagram_tx: Sender<ForwardedDatagram>,
    ) -> Self {
        Self {
            socket,
            config,
            command_router,
            registry,
            auth,
            router_client,
            stream_transport,
            destination_cache,
            datagram_tx,
            pending_ping: None,
        }
    }

    /// Send `response` and wait for it to hit the socket.
    async fn respond(&mut self, response: Response) -> crate::Result<()> {
        self.socket.send_message_blocking(response.into_bytes()).await
    }

    /// Run the connection to completion.
    pub async fn run(mut self) -> Option<ConnectionKind<R>> {
        let version = self.handshake().await?;

        loop {
            let Some(command) = self.next_command(version).await else {
                return None;
            };

            match self.command_router.route(&command) {
                Some(CommandKind::SessionCreate) =>
                    if let Some(parts) = self.create_session(&command).await {
                        let (sender, receiver) = with_recycle(
                            COMMAND_CHANNEL_SIZE,
                            SamSessionCommandRecycle::default(),
                        );

                        return Some(ConnectionKind::Session {
                            context: SamSessionContext {
                                nickname: parts.nickname,
                                style: parts.style,
                                destination: parts.destination,
                                version,
                                options: parts.options,
                                socket: self.socket,
                                router_session: parts.router_session,
                                inbound: parts.inbound,
                                receiver,
                                registry: self.registry,
                                router_client: self.router_client,
                                stream_transport: self.stream_transport,
                                datagram_tx: self.datagram_tx,
                                destination_cache: self.destination_cache,
                                command_router: self.command_router,
                            },
                            sender,
                        });
                    },
                Some(
                    kind @ (CommandKind::StreamConnect
                    | CommandKind::StreamAccept
                    | CommandKind::StreamForward),
                ) => match self.stream_request(&command, kind, version).await {
                    StreamStep::Continue => {}
                    StreamStep::Close => return None,
                    StreamStep::Dispatch(dispatch) => {
                        let DispatchParams {
                            routing,
                            session_id,
                            target,
                            from_port,
                            to_port,
                            forward_target,
                            ssl,
                            silent,
                        } = dispatch;
                        let socket = self.socket;

                        let command = match kind {
                            CommandKind::StreamConnect => SamSessionCommand::Connect {
                                session_id,
                                socket,
                                target: target.expect("target to exist"),
                                from_port,
                                to_port,
                                silent,
                                version,
                            },
                            CommandKind::StreamAccept => SamSessionCommand::Accept {
                                session_id,
                                socket,
                                silent,
                                version,
                            },
                            CommandKind::StreamForward => SamSessionCommand::Forward {
                                session_id,
                                socket,
                                target: forward_target.expect("forward target to exist"),
                                ssl,
                                silent,
                                version,
                            },
                            _ => unreachable!(),
                        };

                        return Some(ConnectionKind::Command { routing, command });
                    }
                },
                kind => match self.handle_simple(&command, kind).await {
                    Step::Continue => {}
                    Step::Close => return None,
                },
            }
        }
    }

    /// Run the handshake: wait for a successful `HELLO VERSION` within the
    /// handshake deadline.
    ///
    /// The deadline spans the whole handshake, retries after `NOVERSION`
    /// included.
    async fn handshake(&mut self) -> Option<SamVersion> {
        let mut deadline = R::timer(self.config.handshake_timeout);

        loop {
            let command = match select(self.socket.next(), &mut deadline).await {
                Either::Right(((), _)) => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        error = %ConnectionError::HandshakeTimeout,
                        "closing connection",
                    );
                    return None;
                }
                Either::Left((None, _)) => return None,
                Either::Left((Some(Err(error)), _)) => {
                    // parse errors during the handshake are fatal
                    let _ = self
                        .respond(
                            Response::new("HELLO")
                                .with_action("REPLY")
                                .with_result(ResultCode::I2pError)
                                .with_message(&alloc::format!("{error}")),
                        )
                        .await;
                    return None;
                }
                Either::Left((Some(Ok(command)), _)) => command,
            };

            if !core::matches!(
                self.command_router.route(&command),
                Some(CommandKind::HelloVersion)
            ) {
                let _ = self
                    .respond(
                        Response::new(&command.verb)
                            .with_action("STATUS")
                            .with_result(ResultCode::I2pError)
                            .with_message("handshake missing"),
                    )
                    .await;
                return None;
            }

            match self.negotiate(&command).await {
                Ok(Some(version)) => return Some(version),
                // no overlap was reported; the client may retry
                Ok(None) => continue,
                Err(()) => return None,
            }
        }
    }

    /// Negotiate the version for one `HELLO VERSION`.
    ///
    /// `Ok(Some(_))` moves the connection to ready, `Ok(None)` keeps waiting
    /// after a `NOVERSION` reply, `Err(())` closes.
    async fn negotiate(&mut self, command: &Command) -> Result<Option<SamVersion>, ()> {
        let client_min = command.get("MIN").map(SamVersion::parse);
        let client_max = command.get("MAX").map(SamVersion::parse);

        let (client_min, client_max) = match (client_min, client_max) {
            (Some(None), _) | (_, Some(None)) => {
                let _ = self
                    .respond(
                        Response::new("HELLO")
                            .with_action("REPLY")
                            .with_result(ResultCode::I2pError)
                            .with_message("invalid version"),
                    )
                    .await;
                return Err(());
            }
            (min, max) => (
                min.flatten().unwrap_or(SamVersion::V30),
                max.flatten().unwrap_or(SamVersion::V33),
            ),
        };

        if client_min > client_max {
            let _ = self
                .respond(
                    Response::new("HELLO")
                        .with_action("REPLY")
                        .with_result(ResultCode::I2pError)
                        .with_message("MIN greater than MAX"),
                )
                .await;
            return Err(());
        }

        if !self.auth.verify(command.get("USER"), command.get("PASSWORD")) {
            let _ = self
                .respond(
                    Response::new("HELLO")
                        .with_action("REPLY")
                        .with_result(ResultCode::I2pError)
                        .with_message("authentication failed"),
                )
                .await;
            return Err(());
        }

        match SamVersion::negotiate(
            client_min,
            client_max,
            self.config.min_version,
            self.config.max_version,
        ) {
            Some(version) => {
                tracing::debug!(
                    target: LOG_TARGET,
                    %version,
                    "handshake complete",
                );

                if self
                    .respond(
                        Response::new("HELLO")
                            .with_action("REPLY")
                            .with_result(ResultCode::Ok)
                            .with_version(version),
                    )
                    .await
                    .is_err()
                {
                    return Err(());
                }

                Ok(Some(version))
            }
            None => {
                if self
                    .respond(
                        Response::new("HELLO")
                            .with_action("REPLY")
                            .with_result(ResultCode::NoVersion),
                    )
                    .await
                    .is_err()
                {
                    return Err(());
                }

                Ok(None)
            }
        }
    }

    /// Read the next command, driving the idle deadline and the keepalive
    /// exchange.
    ///
    /// `PING`/`PONG` and parse errors are absorbed here; anything else is
    /// returned to the caller. `None` means the connection is done.
    async fn next_command(&mut self, _version: SamVersion) -> Option<Command> {
        loop {
            let timeout = match (&self.pending_ping, self.config.keepalive_interval) {
                (Some(_), _) => self.config.pong_timeout,
                (None, Some(interval)) if interval < self.config.command_timeout => interval,
                (None, _) => self.config.command_timeout,
            };

            let command = match with_deadline::<R, _>(timeout, self.socket.next()).await {
                Err(_) => match (&self.pending_ping, self.config.keepalive_interval) {
                    (Some(_), _) => {
                        tracing::debug!(
                            target: LOG_TARGET,
                            error = %ConnectionError::KeepAliveTimeout,
                            "closing connection",
                        );
                        return None;
                    }
                    (None, Some(interval)) if interval < self.config.command_timeout => {
                        let token = alloc::format!(
                            "{}",
                            R::time_since_epoch().as_millis(),
                        );
                        let mut line = String::from("PING ");
                        line.push_str(&token);
                        line.push('\n');

                        if self.socket.send_message_blocking(line.into_bytes()).await.is_err() {
                            return None;
                        }
                        self.pending_ping = Some(token);
                        continue;
                    }
                    _ => {
                        tracing::debug!(
                            target: LOG_TARGET,
                            error = %ConnectionError::CommandTimeout,
                            "closing connection",
                        );
                        return None;
                    }
                },
                Ok(None) => return None,
                Ok(Some(Err(error))) => {
                    if self
                        .respond(
                            Response::new("ERROR")
                                .with_action("STATUS")
                                .with_result(ResultCode::I2pError)
                                .with_message(&alloc::format!("{error}")),
                        )
                        .await
                        .is_err()
                    {
                        return None;
                    }
                    continue;
                }
                Ok(Some(Ok(command))) => command,
            };

            match self.command_router.route(&command) {
                Some(CommandKind::Ping) => {
                    let mut line = String::from("PONG");
                    if let Some(payload) = &command.payload {
                        line.push(' ');
                        line.push_str(payload);
                    }
                    line.push('\n');

                    if self.socket.send_message_blocking(line.into_bytes()).await.is_err() {
                        return None;
                    }
                }
                Some(CommandKind::Pong) => {
                    // an unsolicited or mismatched pong does not clear the
                    // outstanding ping
                    if self.pending_ping.as_deref() == command.payload.as_deref() {
                        self.pending_ping = None;
                    }
                }
                _ => return Some(command),
            }
        }
    }

    /// Handle the session-independent commands.
    async fn handle_simple(&mut self, command: &Command, kind: Option<CommandKind>) -> Step {
        let response = match kind {
            Some(CommandKind::HelloVersion) => Response::new("HELLO")
                .with_action("REPLY")
                .with_result(ResultCode::I2pError)
                .with_message("handshake already completed"),
            Some(CommandKind::Quit) => {
                let _ = self
                    .respond(
                        Response::new("SESSION")
                            .with_action("STATUS")
                            .with_result(ResultCode::Ok)
                            .with_message("closing"),
                    )
                    .await;
                return Step::Close;
            }
            Some(CommandKind::Help) => self.command_router.help(),
            Some(CommandKind::NamingLookup) => match naming::lookup(command, None) {
                LookupOutcome::Reply(response) => response,
                LookupOutcome::Deferred { name } => {
                    let result = match with_deadline::<R, _>(
                        NAMING_LOOKUP_TIMEOUT,
                        self.router_client.lookup(name.clone()),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(QueryError::Timeout),
                    };

                    naming::lookup_reply(&name, &result)
                }
            },
            Some(CommandKind::DestGenerate) => naming::generate(&*self.router_client, command),
            Some(CommandKind::AuthEnable) => {
                self.auth.enable();
                Response::new("AUTH").with_action("STATUS").with_result(ResultCode::Ok)
            }
            Some(CommandKind::AuthDisable) => {
                self.auth.disable();
                Response::new("AUTH").with_action("STATUS").with_result(ResultCode::Ok)
            }
            Some(CommandKind::AuthAdd) => {
                match (command.get("USER"), command.get("PASSWORD")) {
                    (Some(user), Some(password)) => match self.auth.add(user, password) {
                        Ok(()) => Response::new("AUTH")
                            .with_action("STATUS")
                            .with_result(ResultCode::Ok),
                        Err(error) => Response::new("AUTH")
                            .with_action("STATUS")
                            .with_result(ResultCode::I2pError)
                            .with_message(&alloc::format!("{error}")),
                    },
                    _ => Response::new("AUTH")
                        .with_action("STATUS")
                        .with_result(ResultCode::I2pError)
                        .with_message("USER and PASSWORD are required"),
                }
            }
            Some(CommandKind::AuthRemove) => match command.get("USER") {
                Some(user) => match self.auth.remove(user) {
                    Ok(()) =>
                        Response::new("AUTH").with_action("STATUS").with_result(ResultCode::Ok),
                    Err(error) => Response::new("AUTH")
                        .with_action("STATUS")
                        .with_result(ResultCode::I2pError)
                        .with_message(&alloc::format!("{error}")),
                },
                None => Response::new("AUTH")
                    .with_action("STATUS")
                    .with_result(ResultCode::I2pError)
                    .with_message("USER is required"),
            },
            Some(CommandKind::DatagramSend) =>
                match self.control_send(command, DatagramStyle::Datagram).await {
                    Ok(response) => match response {
                        Some(response) => response,
                        None => return Step::Continue,
                    },
                    Err(()) => return Step::Close,
                },
            Some(CommandKind::RawSend) =>
                match self.control_send(command, DatagramStyle::Raw).await {
                    Ok(response) => match response {
                        Some(response) => response,
                        None => return Step::Continue,
                    },
                    Err(()) => return Step::Close,
                },
            Some(CommandKind::SessionAdd | CommandKind::SessionRemove) => Response::new("SESSION")
                .with_action("STATUS")
                .with_result(ResultCode::I2pError)
                .with_message("no primary session on this connection"),
            // session create and the stream commands are handled by the
            // caller
            Some(
                CommandKind::SessionCreate
                | CommandKind::StreamConnect
                | CommandKind::StreamAccept
                | CommandKind::StreamForward
                | CommandKind::Ping
                | CommandKind::Pong,
            ) => return Step::Continue,
            None => self.command_router.unknown_command(command),
        };

        match self.respond(response).await {
            Ok(()) => Step::Continue,
            Err(_) => Step::Close,
        }
    }

    /// Handle a control-socket `DATAGRAM SEND`/`RAW SEND`.
    ///
    /// The payload bytes follow the command line. `Ok(None)` means the send
    /// was accepted and no reply is due.
    async fn control_send(
        &mut self,
        command: &Command,
        style: DatagramStyle,
    ) -> Result<Option<Response>, ()> {
        let verb = match style {
            DatagramStyle::Raw => "RAW",
            _ => "DATAGRAM",
        };

        let (Some(destination), Ok(Some(size))) =
            (command.get("DESTINATION"), command.get_parsed::<usize>("SIZE"))
        else {
            return Ok(Some(
                Response::new(verb)
                    .with_action("STATUS")
                    .with_result(ResultCode::I2pError)
                    .with_message("DESTINATION and SIZE are required"),
            ));
        };

        if size > MAX_RAW_PAYLOAD {
            return Ok(Some(
                Response::new(verb)
                    .with_action("STATUS")
                    .with_result(ResultCode::I2pError)
                    .with_message("datagram exceeds maximum size"),
            ));
        }

        // the payload is part of the command; it falls under the idle deadline
        let mut payload = alloc::vec![0u8; size];
        match with_deadline::<R, _>(
            self.config.command_timeout,
            self.socket.read_exact(&mut payload),
        )
        .await
        {
            Ok(Ok(())) => {}
            _ => return Err(()),
        }

        let options = crate::router::SendOptions {
            from_port: command.get_parsed::<u16>("FROM_PORT").ok().flatten().unwrap_or(0),
            to_port: command.get_parsed::<u16>("TO_PORT").ok().flatten().unwrap_or(0),
            protocol: command.get_parsed::<u8>("PROTOCOL").ok().flatten(),
            send_tags: command.get_parsed::<u16>("SEND_TAGS").ok().flatten(),
            tag_threshold: command.get_parsed::<u16>("TAG_THRESHOLD").ok().flatten(),
            expires: command.get_parsed::<u32>("EXPIRES").ok().flatten(),
            send_leaseset: command.get_parsed::<bool>("SEND_LEASESET").ok().flatten(),
        };

        match send_control_datagram(
            &self.registry,
            &self.destination_cache,
            style,
            destination,
            options,
            payload,
        ) {
            Ok(()) => Ok(None),
            Err(error) => {
                tracing::debug!(
                    target: LOG_TARGET,
                    ?error,
                    "control-socket send failed",
                );

                Ok(Some(
                    Response::new(verb)
                        .with_action("STATUS")
                        .with_result(error.result_code())
                        .with_message(&alloc::format!("{error}")),
                ))
            }
        }
    }

    /// Handle `SESSION CREATE` end to end.
    ///
    /// Reserves the nickname and destination, opens the router session,
    /// blocks on tunnel readiness within the build deadline and activates the
    /// session. Failures are answered on the socket and leave the connection
    /// usable.
    async fn create_session(&mut self, command: &Command) -> Option<SessionParts<R>> {
        macro_rules! fail {
            ($result:expr, $message:expr) => {{
                let response = Response::new("SESSION")
                    .with_action("STATUS")
                    .with_result($result)
                    .with_message($message);

                return match self.respond(response).await {
                    Ok(()) => None,
                    // socket is gone; the caller will observe the closure
                    Err(_) => None,
                };
            }};
        }

        let Some(nickname) = command.get("ID") else {
            fail!(ResultCode::I2pError, "ID is required");
        };
        let Some(style) = command.get("STYLE").and_then(SessionStyle::parse) else {
            fail!(ResultCode::I2pError, "unsupported session style");
        };

        // raw sessions may pre-configure a protocol number; forbidden values
        // are rejected at create time as well as at send time
        if core::matches!(style, SessionStyle::Raw) {
            match command.get_parsed::<u8>("PROTOCOL") {
                Ok(Some(protocol))
                    if crate::router::FORBIDDEN_RAW_PROTOCOLS.contains(&protocol) =>
                    fail!(ResultCode::I2pError, "protocol not allowed"),
                Ok(_) => {}
                Err(()) => fail!(ResultCode::I2pError, "malformed protocol"),
            }
        }

        let destination = match command.get("DESTINATION") {
            None => fail!(ResultCode::I2pError, "DESTINATION is required"),
            Some("TRANSIENT") => {
                let signature_type = match command.get_parsed::<u16>("SIGNATURE_TYPE") {
                    Ok(None) => SignatureType::ED25519,
                    Ok(Some(value)) if SignatureType::new(value) == SignatureType::ED25519 =>
                        SignatureType::ED25519,
                    Ok(Some(_)) => fail!(ResultCode::InvalidKey, "unsupported signature type"),
                    Err(()) => fail!(ResultCode::InvalidKey, "malformed signature type"),
                };

                match self
                    .router_client
                    .generate_destination(signature_type)
                    .and_then(|(_, private)| {
                        Destination::from_private_b64(&private).map_err(Error::Destination)
                    }) {
                    Ok(destination) => destination,
                    Err(error) => {
                        tracing::warn!(
                            target: LOG_TARGET,
                            ?error,
                            "failed to generate transient destination",
                        );
                        fail!(ResultCode::I2pError, "destination generation failed");
                    }
                }
            }
            Some(private) => match Destination::from_private_b64(private) {
                Ok(destination) => destination,
                Err(error) => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        ?error,
                        "malformed destination in session create",
                    );
                    fail!(ResultCode::InvalidKey, "malformed destination");
                }
            },
        };

        let reserved =
            match self.registry.reserve(nickname, style, Some(destination.id())) {
                Ok(reserved) => reserved,
                Err(error) => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        %nickname,
                        %error,
                        "session create rejected",
                    );

                    let response = Response::new("SESSION")
                        .with_action("STATUS")
                        .with_result(Error::Registry(error).result_code());
                    let _ = self.respond(response).await;
                    return None;
                }
            };

        tracing::info!(
            target: LOG_TARGET,
            nickname = %reserved,
            %style,
            destination_id = %destination.id(),
            "start constructing new session",
        );

        let handle = match with_deadline::<R, _>(self.config.tunnel_build_timeout, async {
            let handle = self
                .router_client
                .create_session(
                    Arc::clone(&reserved),
                    RouterSessionConfig {
                        destination: destination.clone(),
                        options: command.options.clone(),
                    },
                )
                .await?;

            handle.session.wait_for_tunnels().await?;

            Ok::<_, Error>(handle)
        })
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(error)) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    nickname = %reserved,
                    ?error,
                    "failed to open router session",
                );

                self.registry.remove(&reserved);
                fail!(ResultCode::I2pError, &alloc::format!("{error}"));
            }
            Err(_) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    nickname = %reserved,
                    "tunnel build deadline exceeded",
                );

                // the partial session is closed before the error is reported
                if let Some(entry) = self.registry.remove(&reserved) {
                    if let Some(router) = entry.router {
                        router.close();
                    }
                }
                fail!(ResultCode::I2pError, "tunnel build timed out");
            }
        };

        if let Err(error) =
            self.registry.activate(&reserved, Arc::clone(&handle.session))
        {
            handle.session.close();
            self.registry.remove(&reserved);
            fail!(
                Error::Registry(error).result_code(),
                "session activation failed"
            );
        }

        let private = destination.to_private_b64().expect("private destination");
        if self
            .respond(
                Response::new("SESSION")
                    .with_action("STATUS")
                    .with_result(ResultCode::Ok)
                    .with_option("DESTINATION", &private),
            )
            .await
            .is_err()
        {
            // client went away right at activation; unwind the session
            if let Some(entry) = self.registry.remove(&reserved) {
                if let Some(router) = entry.router {
                    router.close();
                }
            }
            return None;
        }

        Some(SessionParts {
            nickname: reserved,
            style,
            destination,
            options: command.options.clone(),
            router_session: handle.session,
            inbound: handle.inbound,
            _runtime: core::marker::PhantomData,
        })
    }

    /// Validate a stream command and resolve its target.
    async fn stream_request(
        &mut self,
        command: &Command,
        kind: CommandKind,
        _version: SamVersion,
    ) -> StreamStep {
        let silent = command.get_true("SILENT");

        macro_rules! fail {
            ($result:expr, $message:expr) => {{
                // silent failures close the socket without a response line
                if silent {
                    return StreamStep::Close;
                }

                let response = Response::new("STREAM")
                    .with_action("STATUS")
                    .with_result($result)
                    .with_message($message);
                return match self.respond(response).await {
                    Ok(()) => StreamStep::Continue,
                    Err(_) => StreamStep::Close,
                };
            }};
        }

        let Some(session_id) = command.get("ID") else {
            fail!(ResultCode::I2pError, "ID is required");
        };

        let Some(entry) = self.registry.lookup(session_id) else {
            fail!(ResultCode::InvalidId, "unknown session");
        };
        let routing = entry.parent.clone().unwrap_or_else(|| Arc::clone(&entry.nickname));
        let session_id = Arc::clone(&entry.nickname);

        let mut params = DispatchParams {
            routing,
            session_id,
            target: None,
            from_port: 0,
            to_port: 0,
            forward_target: None,
            ssl: false,
            silent,
        };

        match kind {
            CommandKind::StreamConnect => {
                let Some(destination) = command.get("DESTINATION") else {
                    fail!(ResultCode::I2pError, "DESTINATION is required");
                };

                let (Ok(from_port), Ok(to_port)) = (
                    command.get_parsed::<u16>("FROM_PORT"),
                    command.get_parsed::<u16>("TO_PORT"),
                ) else {
                    fail!(ResultCode::I2pError, "malformed port");
                };
                params.from_port = from_port.unwrap_or(0);
                params.to_port = to_port.unwrap_or(0);

                params.target = match self.resolve_stream_target(destination).await {
                    Ok(target) => Some(target),
                    Err(error) => {
                        tracing::debug!(
                            target: LOG_TARGET,
                            %destination,
                            ?error,
                            "failed to resolve stream target",
                        );

                        // connect failures report INVALID_KEY for names that
                        // do not resolve, TIMEOUT for expired lookups
                        let code = match &error {
                            Error::Query(QueryError::Timeout) => ResultCode::Timeout,
                            Error::Query(_) => ResultCode::InvalidKey,
                            error => error.result_code(),
                        };
                        fail!(code, "unresolvable destination");
                    }
                };
            }
            CommandKind::StreamAccept => {}
            CommandKind::StreamForward => {
                let Ok(Some(port)) = command.get_parsed::<u16>("PORT") else {
                    fail!(ResultCode::I2pError, "PORT is required");
                };

                let host = match command.get("HOST") {
                    None => IpAddr::V4(Ipv4Addr::LOCALHOST),
                    Some(host) => match host.parse::<IpAddr>() {
                        Ok(host) => host,
                        Err(_) => fail!(ResultCode::I2pError, "malformed host"),
                    },
                };

                params.forward_target = Some(SocketAddr::new(host, port));
                params.ssl = command.get_true("SSL");
            }
            _ => unreachable!(),
        }

        StreamStep::Dispatch(params)
    }

    /// Resolve a `STREAM CONNECT` destination token.
    ///
    /// Accepts a full Base64 destination, a `.b32.i2p` address or a `.i2p`
    /// host name; the latter two go through the router.
    async fn resolve_stream_target(&mut self, token: &str) -> crate::Result<DestinationId> {
        if token.to_lowercase().ends_with(".i2p") {
            let resolved = match with_deadline::<R, _>(
                NAMING_LOOKUP_TIMEOUT,
                self.router_client.lookup(token.to_string()),
            )
            .await
            {
                Ok(Ok(resolved)) => resolved,
                Ok(Err(error)) => return Err(Error::Query(error)),
                Err(_) => return Err(Error::Query(QueryError::Timeout)),
            };

            return Ok(self.destination_cache.parse(&resolved)?.id());
        }

        Ok(self.destination_cache.parse(token)?.id())
    }
}

/// The pieces of a freshly activated session the connection hands to its
/// event loop.
struct SessionParts<R: Runtime> {
    /// Nickname.
    nickname: Arc<str>,

    /// Style.
    style: SessionStyle,

    /// Destination.
    destination: Destination,

    /// Session options.
    options: HashMap<String, String>,

    /// Router-side session handle.
    router_session: Arc<dyn crate::router::RouterSession>,

    /// Inbound traffic feed.
    inbound: crate::router::InboundReceiver,

    /// Runtime marker.
    _runtime: core::marker::PhantomData<R>,
}

/// Control flow of a handled stream command.
enum StreamStep {
    /// Keep reading commands.
    Continue,

    /// Close the connection.
    Close,

    /// Hand the socket to the target session.
    Dispatch(DispatchParams),
}

/// Parameters of a dispatched stream command.
struct DispatchParams {
    /// Event-loop routing key.
    routing: Arc<str>,

    /// Target (sub)session nickname.
    session_id: Arc<str>,

    /// Resolved connect target.
    target: Option<DestinationId>,

    /// Source port.
    from_port: u16,

    /// Destination port.
    to_port: u16,

    /// Forward target.
    forward_target: Option<SocketAddr>,

    /// Whether the forward's local side is TLS-wrapped.
    ssl: bool,

    /// Whether status lines are suppressed.
    silent: bool,
}
