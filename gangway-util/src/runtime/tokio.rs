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

//! Tokio-backed [`Runtime`] implementation.

use gangway_core::runtime::{
    AsyncRead, AsyncWrite, Counter, Gauge, Instant as InstantT, JoinSet, MetricType,
    MetricsHandle, Runtime as RuntimeT, TcpListener, TcpStream, UdpSocket,
};

use futures::Stream;
use rand_core::{CryptoRng, RngCore};
use tokio::{io::ReadBuf, net, task, time::Sleep};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};

#[cfg(feature = "metrics")]
use metrics::{counter, describe_counter, describe_gauge, gauge};
#[cfg(feature = "metrics")]
use metrics_exporter_prometheus::PrometheusBuilder;

use std::{
    future::Future,
    net::SocketAddr,
    pin::{pin, Pin},
    task::{Context, Poll, Waker},
    time::{Duration, Instant, SystemTime},
};

/// Logging target for the file.
const LOG_TARGET: &str = "gangway::runtime::tokio";

#[derive(Default, Clone)]
pub struct Runtime {}

impl Runtime {
    pub fn new() -> Self {
        Self {}
    }
}

/// Adapter between a Tokio I/O object and the core's I/O traits.
pub struct IoCompat<T>(Compat<T>);

impl<T> IoCompat<T>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    pub fn new(io: T) -> Self {
        let io = TokioAsyncReadCompatExt::compat(io).into_inner();
        let io = TokioAsyncWriteCompatExt::compat_write(io);

        Self(io)
    }
}

impl<T> AsyncRead for IoCompat<T>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    #[inline]
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<gangway_core::Result<usize>> {
        let pinned = pin!(&mut self.0);

        match futures::ready!(futures::AsyncRead::poll_read(pinned, cx, buf)) {
            Ok(nread) => Poll::Ready(Ok(nread)),
            Err(_) => Poll::Ready(Err(gangway_core::error::Error::Connection(
                gangway_core::error::ConnectionError::SocketClosed,
            ))),
        }
    }
}

impl<T> AsyncWrite for IoCompat<T>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    #[inline]
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<gangway_core::Result<usize>> {
        let pinned = pin!(&mut self.0);

        match futures::ready!(futures::AsyncWrite::poll_write(pinned, cx, buf)) {
            Ok(nwritten) => Poll::Ready(Ok(nwritten)),
            Err(_) => Poll::Ready(Err(gangway_core::error::Error::Connection(
                gangway_core::error::ConnectionError::SocketClosed,
            ))),
        }
    }

    #[inline]
    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<gangway_core::Result<()>> {
        let pinned = pin!(&mut self.0);

        match futures::ready!(futures::AsyncWrite::poll_flush(pinned, cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(_) => Poll::Ready(Err(gangway_core::error::Error::Connection(
                gangway_core::error::ConnectionError::SocketClosed,
            ))),
        }
    }

    #[inline]
    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<gangway_core::Result<()>> {
        let pinned = pin!(&mut self.0);

        match futures::ready!(futures::AsyncWrite::poll_close(pinned, cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(_) => Poll::Ready(Err(gangway_core::error::Error::Connection(
                gangway_core::error::ConnectionError::SocketClosed,
            ))),
        }
    }
}

/// TCP stream type of the Tokio runtime.
pub type TokioTcpStream = IoCompat<net::TcpStream>;

/// TLS stream type of the Tokio runtime.
pub type TokioTlsStream = IoCompat<tokio_native_tls::TlsStream<net::TcpStream>>;

impl TcpStream for TokioTcpStream {
    fn connect(address: SocketAddr) -> impl Future<Output = Option<Self>> + Send {
        async move {
            match tokio::time::timeout(
                Duration::from_secs(10),
                net::TcpStream::connect(address),
            )
            .await
            {
                Err(_) => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        ?address,
                        "timeout while dialing address",
                    );
                    None
                }
                Ok(Err(error)) => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        ?address,
                        error = ?error.kind(),
                        "failed to connect",
                    );
                    None
                }
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true).ok()?;

                    Some(IoCompat::new(stream))
                }
            }
        }
    }
}

pub struct TokioTcpListener(net::TcpListener);

impl TcpListener<TokioTcpStream> for TokioTcpListener {
    async fn bind(address: SocketAddr) -> Option<Self> {
        net::TcpListener::bind(&address)
            .await
            .map_err(|error| {
                tracing::debug!(
                    target: LOG_TARGET,
                    ?address,
                    error = ?error.kind(),
                    "failed to bind",
                );
            })
            .ok()
            .map(TokioTcpListener)
    }

    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Option<(TokioTcpStream, SocketAddr)>> {
        loop {
            match futures::ready!(self.0.poll_accept(cx)) {
                Err(_) => return Poll::Ready(None),
                Ok((stream, address)) => match stream.set_nodelay(true) {
                    Err(error) => {
                        tracing::debug!(
                            target: LOG_TARGET,
                            ?error,
                            "failed to configure `TCP_NODELAY` for inbound connection",
                        );
                        continue;
                    }
                    Ok(()) => return Poll::Ready(Some((IoCompat::new(stream), address))),
                },
            }
        }
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.0.local_addr().ok()
    }
}

pub struct TokioUdpSocket(net::UdpSocket);

impl UdpSocket for TokioUdpSocket {
    fn bind(address: SocketAddr) -> impl Future<Output = Option<Self>> {
        async move { net::UdpSocket::bind(address).await.ok().map(Self) }
    }

    #[inline]
    fn poll_send_to(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
        target: SocketAddr,
    ) -> Poll<Option<usize>> {
        Poll::Ready(futures::ready!(self.0.poll_send_to(cx, buf, target)).ok())
    }

    #[inline]
    fn poll_recv_from(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Option<(usize, SocketAddr)>> {
        let mut buf = ReadBuf::new(buf);

        match futures::ready!(self.0.poll_recv_from(cx, &mut buf)) {
            Err(_) => Poll::Ready(None),
            Ok(from) => {
                let nread = buf.filled().len();
                Poll::Ready(Some((nread, from)))
            }
        }
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.0.local_addr().ok()
    }
}

pub struct TokioJoinSet<T>(task::JoinSet<T>, Option<Waker>);

impl<T: Send + 'static> JoinSet<T> for TokioJoinSet<T> {
    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn push<F>(&mut self, future: F)
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send,
    {
        let _ = self.0.spawn(future);

        if let Some(waker) = self.1.take() {
            waker.wake_by_ref();
        }
    }
}

impl<T: Send + 'static> Stream for TokioJoinSet<T> {
    type Item = T;

    #[inline]
    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.0.poll_join_next(cx) {
            Poll::Pending | Poll::Ready(None) => {
                self.1 = Some(cx.waker().clone());
                Poll::Pending
            }
            Poll::Ready(Some(Err(_))) => Poll::Ready(None),
            Poll::Ready(Some(Ok(value))) => Poll::Ready(Some(value)),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TokioInstant(Instant);

impl InstantT for TokioInstant {
    #[inline]
    fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}

#[derive(Clone)]
#[allow(unused)]
struct TokioMetricsCounter(&'static str);

impl Counter for TokioMetricsCounter {
    #[cfg(feature = "metrics")]
    #[inline]
    fn increment(&mut self, value: usize) {
        counter!(self.0).increment(value as u64);
    }

    #[cfg(not(feature = "metrics"))]
    fn increment(&mut self, _: usize) {}
}

#[derive(Clone)]
#[allow(unused)]
struct TokioMetricsGauge(&'static str);

impl Gauge for TokioMetricsGauge {
    #[cfg(feature = "metrics")]
    #[inline]
    fn increment(&mut self, value: usize) {
        gauge!(self.0).increment(value as f64);
    }

    #[cfg(feature = "metrics")]
    #[inline]
    fn decrement(&mut self, value: usize) {
        gauge!(self.0).decrement(value as f64);
    }

    #[cfg(not(feature = "metrics"))]
    fn increment(&mut self, _: usize) {}

    #[cfg(not(feature = "metrics"))]
    fn decrement(&mut self, _: usize) {}
}

#[derive(Clone)]
pub struct TokioMetricsHandle;

impl MetricsHandle for TokioMetricsHandle {
    #[inline]
    fn counter(&self, name: &'static str) -> impl Counter {
        TokioMetricsCounter(name)
    }

    #[inline]
    fn gauge(&self, name: &'static str) -> impl Gauge {
        TokioMetricsGauge(name)
    }
}

impl RuntimeT for Runtime {
    type TcpStream = TokioTcpStream;
    type TlsStream = TokioTlsStream;
    type UdpSocket = TokioUdpSocket;
    type TcpListener = TokioTcpListener;
    type JoinSet<T: Send + 'static> = TokioJoinSet<T>;
    type MetricsHandle = TokioMetricsHandle;
    type Instant = TokioInstant;
    type Timer = Pin<Box<Sleep>>;

    #[inline]
    fn spawn<F>(future: F)
    where
        F: Future + Send + 'static,
        F::Output: Send,
    {
        tokio::spawn(future);
    }

    fn connect_tls(address: SocketAddr) -> impl Future<Output = Option<Self::TlsStream>> + Send {
        async move {
            let stream = match tokio::time::timeout(
                Duration::from_secs(10),
                net::TcpStream::connect(address),
            )
            .await
            {
                Ok(Ok(stream)) => stream,
                _ => return None,
            };
            stream.set_nodelay(true).ok()?;

            // the target is a local, operator-configured endpoint; its
            // certificate is commonly self-signed
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .ok()?;
            let connector = tokio_native_tls::TlsConnector::from(connector);

            match connector.connect(&address.ip().to_string(), stream).await {
                Ok(stream) => Some(IoCompat::new(stream)),
                Err(error) => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        ?address,
                        ?error,
                        "tls handshake with forward target failed",
                    );
                    None
                }
            }
        }
    }

    #[inline]
    fn time_since_epoch() -> Duration {
        SystemTime::now().duration_since(std::time::UNIX_EPOCH).expect("to succeed")
    }

    #[inline]
    fn now() -> Self::Instant {
        TokioInstant(Instant::now())
    }

    #[inline]
    fn rng() -> impl RngCore + CryptoRng {
        rand_core::OsRng
    }

    #[inline]
    fn join_set<T: Send + 'static>() -> Self::JoinSet<T> {
        TokioJoinSet(task::JoinSet::<T>::new(), None)
    }

    #[cfg(feature = "metrics")]
    fn register_metrics(metrics: Vec<MetricType>, port: Option<u16>) -> Self::MetricsHandle {
        if metrics.is_empty() {
            return TokioMetricsHandle {};
        }

        let address = format!("127.0.0.1:{}", port.unwrap_or(12842));
        let builder = PrometheusBuilder::new()
            .with_http_listener(address.parse::<SocketAddr>().expect("valid address"));

        tracing::info!(
            target: LOG_TARGET,
            ?address,
            "starting prometheus server",
        );

        for metric in &metrics {
            match metric {
                MetricType::Counter { name, description } => describe_counter!(*name, *description),
                MetricType::Gauge { name, description } => describe_gauge!(*name, *description),
            }
        }

        builder.install().expect("to succeed");

        TokioMetricsHandle {}
    }

    #[cfg(not(feature = "metrics"))]
    fn register_metrics(_: Vec<MetricType>, _: Option<u16>) -> Self::MetricsHandle {
        TokioMetricsHandle {}
    }

    #[inline]
    fn timer(duration: Duration) -> Self::Timer {
        Box::pin(tokio::time::sleep(duration))
    }

    #[inline]
    async fn delay(duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
