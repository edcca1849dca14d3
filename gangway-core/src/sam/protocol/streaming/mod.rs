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

//! Stream subsystem.
//!
//! Listener state for `STREAM ACCEPT` and `STREAM FORWARD`, and the relay
//! future that carries a hijacked control socket after a stream opens. The
//! hijack is enforced by construction: building a relay consumes the
//! [`SamSocket`], so no further commands can be parsed from it.

use crate::{
    error::SessionError,
    router::I2pStream,
    runtime::{AsyncRead, AsyncWrite, Runtime, TcpStream as _},
    sam::{socket::SamSocket, version::SamVersion},
    util::{poll_copy, AsyncWriteExt, CopyState},
};

use futures::{future::{select, Either}, FutureExt, StreamExt};

use alloc::{collections::VecDeque, vec::Vec};
use core::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

/// Logging target for the file.
const LOG_TARGET: &str = "gangway::sam::streaming";

/// Hard deadline for the local side of a forward to accept a connection.
///
/// An inbound stream whose local target does not accept within this window
/// is rejected rather than left to block the acceptor.
pub const FORWARD_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// A client socket parked in `STREAM ACCEPT`.
pub struct AcceptWaiter<R: Runtime> {
    /// The accepting client's socket.
    pub socket: SamSocket<R>,

    /// Whether the client asked for a silent accept.
    pub silent: bool,

    /// Negotiated version of the accepting connection.
    pub version: SamVersion,

    /// Accept deadline, if the client supplied one.
    pub timer: Option<R::Timer>,
}

/// Persistent forward registration.
pub struct ForwardConfig<R: Runtime> {
    /// Socket the forward was registered on; kept open, its closure cancels
    /// the forward.
    pub socket: SamSocket<R>,

    /// Local target accepting the forwarded streams.
    pub target: SocketAddr,

    /// Whether the local connection is TLS-wrapped.
    pub ssl: bool,

    /// Whether peer destination lines are suppressed.
    pub silent: bool,

    /// Negotiated version of the registering connection.
    pub version: SamVersion,
}

/// Listener state of one stream (sub)session.
///
/// Accept and forward are mutually exclusive at any instant.
pub enum StreamListener<R: Runtime> {
    /// No listener registered.
    Inactive,

    /// One or more parked `STREAM ACCEPT` sockets.
    Ephemeral {
        /// Waiters, oldest first.
        waiters: VecDeque<AcceptWaiter<R>>,
    },

    /// A persistent forward.
    Forward(ForwardConfig<R>),
}

/// A waiter that left the queue without a peer.
pub enum ExpiredWaiter<R: Runtime> {
    /// Accept deadline elapsed.
    TimedOut(AcceptWaiter<R>),

    /// Client closed the socket or broke protocol while parked.
    Gone,
}

impl<R: Runtime> StreamListener<R> {
    /// Number of pending accepts.
    pub fn pending_accepts(&self) -> usize {
        match self {
            Self::Ephemeral { waiters } => waiters.len(),
            _ => 0,
        }
    }

    /// Whether any listener is registered.
    pub fn is_active(&self) -> bool {
        !core::matches!(self, Self::Inactive)
    }

    /// Whether an accept from a connection negotiated at `version` would be
    /// admitted.
    ///
    /// Checked before the socket is moved into a waiter so rejections can
    /// still be answered on it.
    pub fn can_accept(&self, version: SamVersion) -> Result<(), SessionError> {
        match self {
            Self::Forward(_) => Err(SessionError::ListenerConflict),
            Self::Ephemeral { waiters }
                if !version.supports_concurrent_accepts() && !waiters.is_empty() =>
                Err(SessionError::AlreadyAccepting),
            _ => Ok(()),
        }
    }

    /// Whether a forward registration would be admitted.
    pub fn can_forward(&self) -> Result<(), SessionError> {
        match self {
            Self::Inactive => Ok(()),
            Self::Ephemeral { waiters } if waiters.is_empty() => Ok(()),
            _ => Err(SessionError::ListenerConflict),
        }
    }

    /// Park an accepting socket.
    ///
    /// Pre-3.2 connections allow a single outstanding accept; later versions
    /// allow any number. A configured forward always conflicts.
    pub fn register_accept(&mut self, waiter: AcceptWaiter<R>) -> Result<(), SessionError> {
        match self {
            Self::Forward(_) => Err(SessionError::ListenerConflict),
            Self::Ephemeral { waiters } => {
                if !waiter.version.supports_concurrent_accepts() && !waiters.is_empty() {
                    return Err(SessionError::AlreadyAccepting);
                }

                waiters.push_back(waiter);
                Ok(())
            }
            Self::Inactive => {
                let mut waiters = VecDeque::new();
                waiters.push_back(waiter);
                *self = Self::Ephemeral { waiters };

                Ok(())
            }
        }
    }

    /// Register a persistent forward.
    ///
    /// Conflicts with pending accepts and with an existing forward.
    pub fn register_forward(&mut self, config: ForwardConfig<R>) -> Result<(), SessionError> {
        match self {
            Self::Inactive => {
                *self = Self::Forward(config);
                Ok(())
            }
            Self::Ephemeral { waiters } if waiters.is_empty() => {
                *self = Self::Forward(config);
                Ok(())
            }
            _ => Err(SessionError::ListenerConflict),
        }
    }

    /// Take the next accept waiter, for an inbound stream that just arrived.
    pub fn take_waiter(&mut self) -> Option<AcceptWaiter<R>> {
        match self {
            Self::Ephemeral { waiters } => {
                let waiter = waiters.pop_front();
                if waiters.is_empty() {
                    *self = Self::Inactive;
                }

                waiter
            }
            _ => None,
        }
    }

    /// Drive the parked sockets and deadlines.
    ///
    /// Waiters whose client went away are discarded; waiters whose deadline
    /// fired are handed back so the caller can answer with `TIMEOUT`. A
    /// forward whose socket closed deactivates the listener.
    pub fn poll(&mut self, cx: &mut Context<'_>) -> Vec<ExpiredWaiter<R>> {
        let mut expired = Vec::new();

        match self {
            Self::Inactive => {}
            Self::Ephemeral { waiters } => {
                let mut index = 0usize;

                while index < waiters.len() {
                    let waiter = &mut waiters[index];

                    // a parked socket must stay quiet; any activity, command
                    // or closure alike, unparks and discards it
                    match waiter.socket.poll_next_unpin(cx) {
                        Poll::Ready(_) => {
                            tracing::debug!(
                                target: LOG_TARGET,
                                "accepting client went away",
                            );
                            waiters.remove(index);
                            expired.push(ExpiredWaiter::Gone);
                            continue;
                        }
                        Poll::Pending => {}
                    }

                    if let Some(timer) = &mut waiter.timer {
                        if timer.poll_unpin(cx).is_ready() {
                            let waiter = waiters.remove(index).expect("waiter to exist");
                            expired.push(ExpiredWaiter::TimedOut(waiter));
                            continue;
                        }
                    }

                    index += 1;
                }

                if waiters.is_empty() {
                    *self = Self::Inactive;
                }
            }
            Self::Forward(config) =>
                if let Poll::Ready(_) = config.socket.poll_next_unpin(cx) {
                    tracing::debug!(
                        target: LOG_TARGET,
                        "forward socket closed, cancelling forward",
                    );
                    *self = Self::Inactive;
                },
        }

        expired
    }
}

/// Local side of a forwarded stream.
pub enum LocalStream<R: Runtime> {
    /// Plain TCP.
    Plain(R::TcpStream),

    /// TLS-wrapped TCP.
    Tls(R::TlsStream),
}

impl<R: Runtime> AsyncRead for LocalStream<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<crate::Result<usize>> {
        match Pin::into_inner(self) {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl<R: Runtime> AsyncWrite for LocalStream<R> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<crate::Result<usize>> {
        match Pin::into_inner(self) {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<crate::Result<()>> {
        match Pin::into_inner(self) {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<crate::Result<()>> {
        match Pin::into_inner(self) {
            Self::Plain(stream) => Pin::new(stream).poll_close(cx),
            Self::Tls(stream) => Pin::new(stream).poll_close(cx),
        }
    }
}

/// Connect to the local side of a forward within the hard deadline.
pub async fn connect_forward_target<R: Runtime>(
    target: SocketAddr,
    ssl: bool,
) -> Option<LocalStream<R>> {
    let connect = async move {
        match ssl {
            false => R::TcpStream::connect(target).await.map(LocalStream::Plain),
            true => R::connect_tls(target).await.map(LocalStream::Tls),
        }
    };
    futures::pin_mut!(connect);

    match select(connect, R::timer(FORWARD_CONNECT_TIMEOUT)).await {
        Either::Left((stream, _)) => stream,
        Either::Right(((), _)) => {
            tracing::debug!(
                target: LOG_TARGET,
                ?target,
                "local forward target did not accept in time",
            );

            None
        }
    }
}

/// Byte relay between a hijacked client socket and a virtual stream.
///
/// Runs until either side closes. Bytes the client sent past the hijacking
/// command are flushed to the stream first.
pub struct StreamRelay<C> {
    /// Client side.
    client: C,

    /// Virtual stream side.
    stream: I2pStream,

    /// Client bytes read past the hijacking command.
    leftover: Vec<u8>,

    /// Flush offset into `leftover`.
    leftover_offset: usize,

    /// Client → stream state.
    client_to_stream: CopyState,

    /// Stream → client state.
    stream_to_client: CopyState,
}

impl<C: AsyncRead + AsyncWrite + Unpin> StreamRelay<C> {
    /// Create a new [`StreamRelay`].
    pub fn new(client: C, leftover: Vec<u8>, stream: I2pStream) -> Self {
        Self {
            client,
            stream,
            leftover,
            leftover_offset: 0usize,
            client_to_stream: CopyState::new(),
            stream_to_client: CopyState::new(),
        }
    }
}

impl<C: AsyncRead + AsyncWrite + Unpin> Future for StreamRelay<C> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        while this.leftover_offset < this.leftover.len() {
            match Pin::new(&mut this.stream).poll_write(cx, &this.leftover[this.leftover_offset..])
            {
                Poll::Pending => break,
                Poll::Ready(Err(_)) | Poll::Ready(Ok(0)) => return Poll::Ready(()),
                Poll::Ready(Ok(nwritten)) => this.leftover_offset += nwritten,
            }
        }

        if this.leftover_offset == this.leftover.len() {
            if let Poll::Ready(_) =
                poll_copy(&mut this.client_to_stream, &mut this.client, &mut this.stream, cx)
            {
                return Poll::Ready(());
            }
        }

        if let Poll::Ready(_) =
            poll_copy(&mut this.stream_to_client, &mut this.stream, &mut this.client, cx)
        {
            return Poll::Ready(());
        }

        Poll::Pending
    }
}

/// Relay task for an accepted or connected stream: flush the status lines,
/// hijack the socket and run the relay to completion.
pub async fn run_relay<R: Runtime>(
    mut socket: SamSocket<R>,
    responses: Vec<Vec<u8>>,
    stream: I2pStream,
) {
    for response in responses {
        if socket.send_message_blocking(response).await.is_err() {
            return;
        }
    }

    let (client, leftover) = socket.into_parts();
    StreamRelay::new(client, leftover, stream).await
}

/// Relay task for a forwarded inbound stream.
pub async fn run_forward_relay<R: Runtime>(
    local: LocalStream<R>,
    peer_line: Option<Vec<u8>>,
    stream: I2pStream,
) {
    let mut local = local;

    // the peer line, when not silenced, leads the forwarded byte stream
    if let Some(line) = peer_line {
        if local.write_all(&line).await.is_err() {
            return;
        }
    }

    StreamRelay::new(local, Vec::new(), stream).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::{MockRuntime, MockTcpStream};
    use tokio::{
        io::{AsyncReadExt as _, AsyncWriteExt as _},
        net::TcpListener,
    };

    async fn socket_pair() -> (tokio::net::TcpStream, SamSocket<MockRuntime>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(listener.accept(), MockTcpStream::connect(address));

        (client.unwrap().0, SamSocket::new(server.unwrap()))
    }

    fn waiter(socket: SamSocket<MockRuntime>, version: SamVersion) -> AcceptWaiter<MockRuntime> {
        AcceptWaiter {
            socket,
            silent: false,
            version,
            timer: None,
        }
    }

    #[tokio::test]
    async fn single_accept_before_32() {
        let (_client1, socket1) = socket_pair().await;
        let (_client2, socket2) = socket_pair().await;
        let version = SamVersion::parse("3.1").unwrap();

        let mut listener = StreamListener::<MockRuntime>::Inactive;
        listener.register_accept(waiter(socket1, version)).unwrap();

        match listener.register_accept(waiter(socket2, version)) {
            Err(SessionError::AlreadyAccepting) => {}
            result => panic!("unexpected result: {:?}", result.is_ok()),
        }
    }

    #[tokio::test]
    async fn concurrent_accepts_from_32() {
        let (_client1, socket1) = socket_pair().await;
        let (_client2, socket2) = socket_pair().await;

        let mut listener = StreamListener::<MockRuntime>::Inactive;
        listener.register_accept(waiter(socket1, SamVersion::V32)).unwrap();
        listener.register_accept(waiter(socket2, SamVersion::V32)).unwrap();

        assert_eq!(listener.pending_accepts(), 2);
    }

    #[tokio::test]
    async fn forward_conflicts_with_accept() {
        let (_client1, socket1) = socket_pair().await;
        let (_client2, socket2) = socket_pair().await;

        let mut listener = StreamListener::<MockRuntime>::Inactive;
        listener.register_accept(waiter(socket1, SamVersion::V33)).unwrap();

        let forward = ForwardConfig {
            socket: socket2,
            target: "127.0.0.1:8080".parse().unwrap(),
            ssl: false,
            silent: false,
            version: SamVersion::V33,
        };
        match listener.register_forward(forward) {
            Err(SessionError::ListenerConflict) => {}
            result => panic!("unexpected result: {:?}", result.is_ok()),
        }
    }

    #[tokio::test]
    async fn accept_conflicts_with_forward() {
        let (_client1, socket1) = socket_pair().await;
        let (_client2, socket2) = socket_pair().await;

        let mut listener = StreamListener::<MockRuntime>::Inactive;
        listener
            .register_forward(ForwardConfig {
                socket: socket1,
                target: "127.0.0.1:8080".parse().unwrap(),
                ssl: false,
                silent: false,
                version: SamVersion::V33,
            })
            .unwrap();

        match listener.register_accept(waiter(socket2, SamVersion::V33)) {
            Err(SessionError::ListenerConflict) => {}
            result => panic!("unexpected result: {:?}", result.is_ok()),
        }
    }

    #[tokio::test]
    async fn closed_waiter_is_discarded() {
        let (client, socket) = socket_pair().await;

        let mut listener = StreamListener::<MockRuntime>::Inactive;
        listener.register_accept(waiter(socket, SamVersion::V33)).unwrap();

        drop(client);

        futures::future::poll_fn(|cx| {
            // polling may need a few passes for the closure to surface
            let _ = listener.poll(cx);
            match listener.pending_accepts() {
                0 => Poll::Ready(()),
                _ => Poll::Pending,
            }
        })
        .await;

        assert!(!listener.is_active());
    }

    #[tokio::test]
    async fn accept_deadline_fires() {
        let (_client, socket) = socket_pair().await;

        let mut listener = StreamListener::<MockRuntime>::Inactive;
        listener
            .register_accept(AcceptWaiter {
                socket,
                silent: false,
                version: SamVersion::V33,
                timer: Some(MockRuntime::timer(Duration::from_millis(50))),
            })
            .unwrap();

        let expired = futures::future::poll_fn(|cx| {
            let expired = listener.poll(cx);
            match expired.is_empty() {
                true => Poll::Pending,
                false => Poll::Ready(expired),
            }
        })
        .await;

        assert!(core::matches!(expired.as_slice(), [ExpiredWaiter::TimedOut(_)]));
    }

    #[tokio::test]
    async fn relay_forwards_both_directions_and_leftover() {
        let (mut client, server_socket) = socket_pair().await;

        // i2p side simulated with a plain socket pair
        let (mut peer, i2p_side) = socket_pair().await;
        let (i2p_stream, _) = i2p_side.into_parts();

        let (server_stream, _) = server_socket.into_parts();
        let relay = StreamRelay::new(
            server_stream,
            b"leftover ".to_vec(),
            alloc::boxed::Box::new(i2p_stream),
        );
        let handle = tokio::spawn(relay);

        client.write_all(b"from client").await.unwrap();

        let mut buffer = vec![0u8; 20];
        peer.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"leftover from client");

        peer.write_all(b"from peer").await.unwrap();
        let mut buffer = vec![0u8; 9];
        client.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"from peer");

        // closing one side ends the relay
        drop(peer);
        handle.await.unwrap();
    }
}
