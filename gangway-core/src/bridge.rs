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

//! Embeddable bridge lifecycle.
//!
//! [`Bridge::new()`] wires the server to its capabilities, [`Bridge::start()`]
//! runs it in the background and [`BridgeHandle`] stops it without blocking.
//! Embedders that want to own the event loop can poll the [`Bridge`] future
//! themselves instead of starting it.

use crate::{
    config::BridgeConfig,
    router::{RouterClient, StreamTransport},
    runtime::Runtime,
    sam::SamServer,
    shutdown::{shutdown_channel, ShutdownHandle},
};

use futures_channel::oneshot;

use alloc::sync::Arc;
use core::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

/// The bridge: a [`SamServer`] plus exit signalling.
pub struct Bridge<R: Runtime> {
    /// The server.
    server: SamServer<R>,

    /// Fired when the server future returns.
    exit: Option<oneshot::Sender<()>>,
}

/// Handle to a created bridge.
pub struct BridgeHandle {
    /// Shutdown handle.
    shutdown: ShutdownHandle,

    /// Fires when the server has stopped.
    exit: oneshot::Receiver<()>,

    /// Address of the control listener.
    tcp_address: Option<SocketAddr>,

    /// Address of the UDP ingress socket.
    udp_address: Option<SocketAddr>,
}

impl BridgeHandle {
    /// Request shutdown. Non-blocking and idempotent.
    pub fn stop(&mut self) {
        self.shutdown.shutdown();
    }

    /// Wait until the server has stopped.
    pub async fn stopped(self) {
        let _ = self.exit.await;
    }

    /// Address of the control listener.
    pub fn tcp_address(&self) -> Option<SocketAddr> {
        self.tcp_address
    }

    /// Address of the UDP ingress socket.
    pub fn udp_address(&self) -> Option<SocketAddr> {
        self.udp_address
    }
}

impl<R: Runtime> Bridge<R> {
    /// Create a bridge, binding its sockets.
    pub async fn new(
        config: BridgeConfig,
        router_client: Arc<dyn RouterClient>,
        stream_transport: Arc<dyn StreamTransport>,
    ) -> crate::Result<(Self, BridgeHandle)> {
        let (shutdown, signal) = shutdown_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let server =
            SamServer::<R>::new(config, router_client, stream_transport, signal).await?;

        let handle = BridgeHandle {
            shutdown,
            exit: exit_rx,
            tcp_address: server.tcp_local_address(),
            udp_address: server.udp_local_address(),
        };

        Ok((
            Self {
                server,
                exit: Some(exit_tx),
            },
            handle,
        ))
    }

    /// Run the bridge in the background.
    pub fn start(self) {
        R::spawn(self);
    }
}

impl<R: Runtime> Future for Bridge<R> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);

        match Pin::new(&mut this.server).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => {
                if let Some(exit) = this.exit.take() {
                    let _ = exit.send(());
                }

                Poll::Ready(())
            }
        }
    }
}
