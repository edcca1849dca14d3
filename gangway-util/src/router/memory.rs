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

//! In-process loopback router.
//!
//! [`MemoryRouter`] implements the router and stream-transport capabilities
//! entirely in memory: destinations it issues exist only inside the process,
//! lookups resolve only locally and virtual streams are duplex pipes. It
//! exists for local development and for the end-to-end tests, which drive a
//! full bridge against it over real sockets.

use gangway_core::{
    crypto::{base32_decode, base64_decode, base64_encode},
    error::{PeerError, QueryError},
    primitives::{Destination, DestinationId, SignatureType},
    router::{
        DatagramSource, DatagramStyle, I2pStream, InboundDatagram, InboundSender, InboundStream,
        OutboundDatagram, RouterClient, RouterHandle, RouterSession, RouterSessionConfig,
        StreamTransport,
    },
};

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tokio::sync::mpsc as tokio_mpsc;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::runtime::tokio::IoCompat;

/// Logging target for the file.
const LOG_TARGET: &str = "gangway::router::memory";

/// Capacity of a session's inbound datagram feed.
const INBOUND_CHANNEL_SIZE: usize = 64;

/// Capacity of a destination's inbound stream queue.
const STREAM_CHANNEL_SIZE: usize = 64;

/// Buffer size of one virtual stream direction.
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// A destination registered with the loopback router.
struct LocalDestination {
    /// Public Base64 form.
    public_b64: String,

    /// Feed towards the owning session.
    inbound: InboundSender,

    /// Inbound virtual stream hand-off.
    stream_tx: tokio_mpsc::Sender<InboundStream>,

    /// Accept side of the stream hand-off.
    stream_rx: Arc<tokio::sync::Mutex<tokio_mpsc::Receiver<InboundStream>>>,
}

/// Shared router state.
struct RouterInner {
    /// Live destinations.
    destinations: RwLock<HashMap<DestinationId, Arc<LocalDestination>>>,

    /// Host names registered for lookup.
    names: RwLock<HashMap<String, String>>,

    /// Artificial tunnel build delay, for exercising readiness gating.
    tunnel_build_delay: Duration,
}

/// In-process loopback router.
pub struct MemoryRouter {
    inner: Arc<RouterInner>,
}

impl Default for MemoryRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRouter {
    /// Create a new [`MemoryRouter`].
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RouterInner {
                destinations: RwLock::new(HashMap::new()),
                names: RwLock::new(HashMap::new()),
                tunnel_build_delay: Duration::ZERO,
            }),
        }
    }

    /// Create a router whose sessions take `delay` to become tunnel-ready.
    pub fn with_tunnel_build_delay(delay: Duration) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                destinations: RwLock::new(HashMap::new()),
                names: RwLock::new(HashMap::new()),
                tunnel_build_delay: delay,
            }),
        }
    }

    /// Register `name` to resolve to `destination_b64`.
    pub fn register_name(&self, name: &str, destination_b64: &str) {
        self.inner.names.write().insert(name.to_string(), destination_b64.to_string());
    }

    /// Build a private-key blob with fresh random key material.
    fn make_private_blob() -> Vec<u8> {
        let mut rng = rand::thread_rng();

        // keys-and-cert block: public key, signing key block, key
        // certificate for ed25519 + ecies-x25519
        let mut blob = vec![0u8; 256 + 128];
        rng.fill_bytes(&mut blob);
        blob.push(5u8);
        blob.extend(4u16.to_be_bytes());
        blob.extend(7u16.to_be_bytes());
        blob.extend(4u16.to_be_bytes());

        // encryption and signing private keys
        let mut keys = vec![0u8; 64];
        rng.fill_bytes(&mut keys);
        // an all-zero signing key would read as an offline-signature marker
        keys[32] |= 0x01;
        blob.extend(keys);

        blob
    }
}

/// A session opened on the loopback router.
struct MemorySession {
    /// Destination ID of the session.
    destination_id: DestinationId,

    /// Public Base64 form of the session's destination.
    public_b64: String,

    /// Router state.
    router: Arc<RouterInner>,

    /// Tunnel build delay.
    tunnel_build_delay: Duration,

    /// Set once the session has been closed.
    closed: AtomicBool,
}

impl RouterSession for MemorySession {
    fn destination_b64(&self) -> String {
        self.public_b64.clone()
    }

    fn wait_for_tunnels(&self) -> BoxFuture<'static, gangway_core::Result<()>> {
        let delay = self.tunnel_build_delay;

        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            Ok(())
        })
    }

    fn send_datagram(&self, datagram: OutboundDatagram) -> gangway_core::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(gangway_core::Error::InvalidState);
        }

        let target = self
            .router
            .destinations
            .read()
            .get(&datagram.target.id())
            .cloned()
            .ok_or(gangway_core::Error::Peer(PeerError::NotFound))?;

        let source = match datagram.style {
            DatagramStyle::Datagram | DatagramStyle::Datagram2 =>
                DatagramSource::Destination(self.public_b64.clone()),
            DatagramStyle::Datagram3 => DatagramSource::Hash(*self.destination_id.as_bytes()),
            DatagramStyle::Raw => DatagramSource::Anonymous,
        };
        let nonce = matches!(datagram.style, DatagramStyle::Datagram2)
            .then(|| rand::thread_rng().next_u64());
        let protocol = datagram.options.protocol.unwrap_or(datagram.style.protocol());

        let inbound = InboundDatagram {
            protocol,
            from_port: datagram.options.from_port,
            to_port: datagram.options.to_port,
            source,
            nonce,
            payload: datagram.payload,
        };

        // best-effort, like the real datagram plane
        let mut sender = target.inbound.clone();
        if let Err(error) = sender.try_send(inbound) {
            tracing::debug!(
                target: LOG_TARGET,
                ?error,
                "inbound feed full, dropping datagram",
            );
        }

        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.router.destinations.write().remove(&self.destination_id);
    }
}

impl RouterClient for MemoryRouter {
    fn create_session(
        &self,
        nickname: Arc<str>,
        config: RouterSessionConfig,
    ) -> BoxFuture<'static, gangway_core::Result<RouterHandle>> {
        let inner = Arc::clone(&self.inner);

        Box::pin(async move {
            let destination_id = config.destination.id();
            let public_b64 = config.destination.to_public_b64();

            let (inbound_tx, inbound_rx) = futures_channel::mpsc::channel(INBOUND_CHANNEL_SIZE);
            let (stream_tx, stream_rx) = tokio_mpsc::channel(STREAM_CHANNEL_SIZE);

            inner.destinations.write().insert(
                destination_id,
                Arc::new(LocalDestination {
                    public_b64: public_b64.clone(),
                    inbound: inbound_tx,
                    stream_tx,
                    stream_rx: Arc::new(tokio::sync::Mutex::new(stream_rx)),
                }),
            );

            tracing::debug!(
                target: LOG_TARGET,
                %nickname,
                %destination_id,
                "session opened",
            );

            let session = Arc::new(MemorySession {
                destination_id,
                public_b64,
                router: Arc::clone(&inner),
                tunnel_build_delay: inner.tunnel_build_delay,
                closed: AtomicBool::new(false),
            });

            Ok(RouterHandle {
                session,
                inbound: inbound_rx,
            })
        })
    }

    fn lookup(&self, name: String) -> BoxFuture<'static, Result<String, QueryError>> {
        let inner = Arc::clone(&self.inner);

        Box::pin(async move {
            if let Some(destination) = inner.names.read().get(&name) {
                return Ok(destination.clone());
            }

            // b32 addresses resolve against the live destination table
            if let Some(label) = name.strip_suffix(".b32.i2p") {
                let decoded = base32_decode(label).ok_or(QueryError::InvalidName)?;
                if decoded.len() != 32 {
                    return Err(QueryError::InvalidName);
                }

                let destination_id = DestinationId::from_serialized(&decoded);
                return inner
                    .destinations
                    .read()
                    .get(&destination_id)
                    .map(|destination| destination.public_b64.clone())
                    .ok_or(QueryError::KeyNotFound);
            }

            Err(QueryError::KeyNotFound)
        })
    }

    fn generate_destination(
        &self,
        signature_type: SignatureType,
    ) -> gangway_core::Result<(String, String)> {
        if signature_type != SignatureType::ED25519 {
            return Err(gangway_core::Error::Destination(
                gangway_core::error::DestinationError::UnsupportedSignatureType(
                    signature_type.as_u16(),
                ),
            ));
        }

        let blob = Self::make_private_blob();
        let destination = Destination::from_private_b64(&base64_encode(&blob))
            .expect("generated blob to parse");

        Ok((destination.to_public_b64(), base64_encode(&blob)))
    }
}

/// Find the local destination a session handle belongs to.
fn local_destination(
    inner: &RouterInner,
    session: &Arc<dyn RouterSession>,
) -> Option<Arc<LocalDestination>> {
    let serialized = base64_decode(session.destination_b64())?;
    if serialized.len() < 32 {
        return None;
    }

    inner.destinations.read().get(&DestinationId::from_serialized(&serialized)).cloned()
}

impl StreamTransport for MemoryRouter {
    fn dial(
        &self,
        session: Arc<dyn RouterSession>,
        target: DestinationId,
        from_port: u16,
        to_port: u16,
    ) -> BoxFuture<'static, Result<I2pStream, PeerError>> {
        let inner = Arc::clone(&self.inner);

        Box::pin(async move {
            let peer = local_destination(&inner, &session)
                .ok_or(PeerError::Unreachable)?
                .public_b64
                .clone();
            let target = inner
                .destinations
                .read()
                .get(&target)
                .cloned()
                .ok_or(PeerError::NotFound)?;

            let (dialer, acceptor) = tokio::io::duplex(STREAM_BUFFER_SIZE);

            target
                .stream_tx
                .send(InboundStream {
                    stream: Box::new(IoCompat::new(acceptor)),
                    peer,
                    from_port,
                    to_port,
                })
                .await
                .map_err(|_| PeerError::Unreachable)?;

            Ok(Box::new(IoCompat::new(dialer)) as I2pStream)
        })
    }

    fn accept(
        &self,
        session: Arc<dyn RouterSession>,
    ) -> BoxFuture<'static, Result<InboundStream, PeerError>> {
        let inner = Arc::clone(&self.inner);

        Box::pin(async move {
            let destination =
                local_destination(&inner, &session).ok_or(PeerError::Unreachable)?;

            let stream_rx = Arc::clone(&destination.stream_rx);
            drop(destination);

            let mut stream_rx = stream_rx.lock().await;
            stream_rx.recv().await.ok_or(PeerError::Unreachable)
        })
    }
}

/// Convenience pair: one [`MemoryRouter`] shared by both capabilities.
pub fn memory_router() -> (Arc<dyn RouterClient>, Arc<dyn StreamTransport>, Arc<MemoryRouter>) {
    let router = Arc::new(MemoryRouter::new());

    (
        Arc::clone(&router) as Arc<dyn RouterClient>,
        Arc::clone(&router) as Arc<dyn StreamTransport>,
        router,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use gangway_core::router::SendOptions;
    use futures::StreamExt;

    fn make_destination(router: &MemoryRouter) -> Destination {
        let (_, private) = router.generate_destination(SignatureType::ED25519).unwrap();
        Destination::from_private_b64(&private).unwrap()
    }

    #[tokio::test]
    async fn generated_destinations_parse() {
        let router = MemoryRouter::new();
        let (public, private) = router.generate_destination(SignatureType::ED25519).unwrap();

        let destination = Destination::from_private_b64(&private).unwrap();
        assert_eq!(destination.to_public_b64(), public);
        assert!(destination.offline_signature().is_none());
        assert!(public.len() >= 516);
    }

    #[tokio::test]
    async fn datagram_between_sessions() {
        let router = MemoryRouter::new();

        let sender_dest = make_destination(&router);
        let receiver_dest = make_destination(&router);

        let sender = router
            .create_session(
                Arc::from("sender"),
                RouterSessionConfig {
                    destination: sender_dest,
                    options: Default::default(),
                },
            )
            .await
            .unwrap();
        let mut receiver = router
            .create_session(
                Arc::from("receiver"),
                RouterSessionConfig {
                    destination: receiver_dest.clone(),
                    options: Default::default(),
                },
            )
            .await
            .unwrap();

        sender
            .session
            .send_datagram(OutboundDatagram {
                style: DatagramStyle::Datagram,
                target: receiver_dest,
                options: SendOptions {
                    from_port: 7,
                    to_port: 9,
                    ..Default::default()
                },
                payload: b"hello".to_vec(),
            })
            .unwrap();

        let datagram = receiver.inbound.next().await.unwrap();
        assert_eq!(datagram.payload, b"hello");
        assert_eq!(datagram.from_port, 7);
        assert_eq!(datagram.to_port, 9);
        assert!(matches!(datagram.source, DatagramSource::Destination(_)));
    }

    #[tokio::test]
    async fn streams_between_sessions() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let router = MemoryRouter::new();
        let dialer_dest = make_destination(&router);
        let acceptor_dest = make_destination(&router);
        let acceptor_id = acceptor_dest.id();

        let dialer = router
            .create_session(
                Arc::from("dialer"),
                RouterSessionConfig {
                    destination: dialer_dest,
                    options: Default::default(),
                },
            )
            .await
            .unwrap();
        let acceptor = router
            .create_session(
                Arc::from("acceptor"),
                RouterSessionConfig {
                    destination: acceptor_dest,
                    options: Default::default(),
                },
            )
            .await
            .unwrap();

        let accept = router.accept(Arc::clone(&acceptor.session));
        let dial = router.dial(Arc::clone(&dialer.session), acceptor_id, 1, 2);

        let (accepted, dialed) = tokio::join!(accept, dial);
        let inbound = accepted.unwrap();
        let outbound = dialed.unwrap();

        assert_eq!(inbound.peer, dialer.session.destination_b64());
        assert_eq!(inbound.from_port, 1);
        assert_eq!(inbound.to_port, 2);

        // byte-level round trip through compat wrappers
        let mut outbound = tokio_util::compat::FuturesAsyncReadCompatExt::compat(
            StreamIo(outbound),
        );
        let mut inbound = tokio_util::compat::FuturesAsyncReadCompatExt::compat(
            StreamIo(inbound.stream),
        );

        tokio::io::AsyncWriteExt::write_all(&mut outbound, b"ping").await.unwrap();
        let mut buffer = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut inbound, &mut buffer).await.unwrap();
        assert_eq!(&buffer, b"ping");

        inbound.write_all(b"pong").await.unwrap();
        outbound.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"pong");
    }

    #[tokio::test]
    async fn lookup_registered_name() {
        let router = MemoryRouter::new();
        let destination = make_destination(&router);
        router.register_name("host.i2p", &destination.to_public_b64());

        let resolved = router.lookup("host.i2p".to_string()).await.unwrap();
        assert_eq!(resolved, destination.to_public_b64());

        assert_eq!(
            router.lookup("missing.i2p".to_string()).await.unwrap_err(),
            QueryError::KeyNotFound,
        );
    }

    #[tokio::test]
    async fn closed_session_unreachable() {
        let router = MemoryRouter::new();
        let destination = make_destination(&router);

        let handle = router
            .create_session(
                Arc::from("session"),
                RouterSessionConfig {
                    destination: destination.clone(),
                    options: Default::default(),
                },
            )
            .await
            .unwrap();

        handle.session.close();

        let other = make_destination(&router);
        let sender = router
            .create_session(
                Arc::from("other"),
                RouterSessionConfig {
                    destination: other,
                    options: Default::default(),
                },
            )
            .await
            .unwrap();

        let result = sender.session.send_datagram(OutboundDatagram {
            style: DatagramStyle::Raw,
            target: destination,
            options: SendOptions::default(),
            payload: b"x".to_vec(),
        });
        assert!(result.is_err());
    }

    /// Adapter exposing an [`I2pStream`] as a futures I/O object for tests.
    struct StreamIo(I2pStream);

    impl futures::AsyncRead for StreamIo {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut [u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            match gangway_core::runtime::AsyncRead::poll_read(
                std::pin::Pin::new(&mut *self.0),
                cx,
                buf,
            ) {
                std::task::Poll::Pending => std::task::Poll::Pending,
                std::task::Poll::Ready(Ok(nread)) => std::task::Poll::Ready(Ok(nread)),
                std::task::Poll::Ready(Err(_)) => std::task::Poll::Ready(Err(
                    std::io::Error::new(std::io::ErrorKind::Other, "stream closed"),
                )),
            }
        }
    }

    impl futures::AsyncWrite for StreamIo {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            match gangway_core::runtime::AsyncWrite::poll_write(
                std::pin::Pin::new(&mut *self.0),
                cx,
                buf,
            ) {
                std::task::Poll::Pending => std::task::Poll::Pending,
                std::task::Poll::Ready(Ok(nwritten)) => std::task::Poll::Ready(Ok(nwritten)),
                std::task::Poll::Ready(Err(_)) => std::task::Poll::Ready(Err(
                    std::io::Error::new(std::io::ErrorKind::Other, "stream closed"),
                )),
            }
        }

        fn poll_flush(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            match gangway_core::runtime::AsyncWrite::poll_flush(
                std::pin::Pin::new(&mut *self.0),
                cx,
            ) {
                std::task::Poll::Pending => std::task::Poll::Pending,
                std::task::Poll::Ready(Ok(())) => std::task::Poll::Ready(Ok(())),
                std::task::Poll::Ready(Err(_)) => std::task::Poll::Ready(Err(
                    std::io::Error::new(std::io::ErrorKind::Other, "stream closed"),
                )),
            }
        }

        fn poll_close(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            match gangway_core::runtime::AsyncWrite::poll_close(
                std::pin::Pin::new(&mut *self.0),
                cx,
            ) {
                std::task::Poll::Pending => std::task::Poll::Pending,
                std::task::Poll::Ready(Ok(())) => std::task::Poll::Ready(Ok(())),
                std::task::Poll::Ready(Err(_)) => std::task::Poll::Ready(Err(
                    std::io::Error::new(std::io::ErrorKind::Other, "stream closed"),
                )),
            }
        }
    }
}
