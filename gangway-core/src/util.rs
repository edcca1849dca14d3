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

use crate::{
    error::ConnectionError,
    runtime::{AsyncRead, AsyncWrite, Runtime},
    Error,
};

use futures::future::{select, Either};

use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

/// Run `future` against a deadline.
///
/// Returns [`Error::Timeout`] if the timer fires first.
pub async fn with_deadline<R: Runtime, F: Future>(
    deadline: Duration,
    future: F,
) -> crate::Result<F::Output> {
    futures::pin_mut!(future);

    match select(future, R::timer(deadline)).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(((), _)) => Err(Error::Timeout),
    }
}

pub trait AsyncWriteExt: AsyncWrite {
    fn write_all(&mut self, buffer: &[u8]) -> impl Future<Output = crate::Result<()>>;
    fn close(&mut self) -> impl Future<Output = crate::Result<()>>;
}

pub struct WriteAll<'a, T> {
    inner: &'a mut T,
    buffer: &'a [u8],
}

impl<'a, T: AsyncWrite + Unpin> WriteAll<'a, T> {
    fn new(inner: &'a mut T, buffer: &'a [u8]) -> Self {
        Self { inner, buffer }
    }
}

impl<T: AsyncWrite + Unpin> Future for WriteAll<'_, T> {
    type Output = crate::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut stream = Pin::new(&mut *this.inner);

        while !this.buffer.is_empty() {
            let n = match stream.as_mut().poll_write(cx, this.buffer) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                Poll::Ready(Ok(nwritten)) => nwritten,
            };

            {
                let (_, rest) = core::mem::take(&mut this.buffer).split_at(n);
                this.buffer = rest;
            }
            if n == 0 {
                return Poll::Ready(Err(Error::Connection(ConnectionError::SocketClosed)));
            }
        }

        Poll::Ready(Ok(()))
    }
}

pub struct Close<'a, T> {
    inner: &'a mut T,
}

impl<'a, T: AsyncWrite + Unpin> Close<'a, T> {
    fn new(inner: &'a mut T) -> Self {
        Self { inner }
    }
}

impl<T: AsyncWrite + Unpin> Future for Close<'_, T> {
    type Output = crate::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut *self.inner).poll_close(cx)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWriteExt for T {
    fn write_all(&mut self, buffer: &[u8]) -> impl Future<Output = crate::Result<()>> {
        async move { WriteAll::new(self, buffer).await }
    }

    fn close(&mut self) -> impl Future<Output = crate::Result<()>> {
        Close::new(self)
    }
}

/// State of one copy direction of a byte relay.
pub(crate) enum CopyState {
    /// Read the next chunk.
    Reading {
        /// Scratch buffer.
        buffer: alloc::vec::Vec<u8>,
    },

    /// Flush a partially written chunk.
    Writing {
        /// Scratch buffer.
        buffer: alloc::vec::Vec<u8>,

        /// Bytes of `buffer` that carry data.
        filled: usize,

        /// Write offset.
        offset: usize,
    },

    /// Source reached EOF.
    Done,
}

impl CopyState {
    /// Fresh direction state with an empty scratch buffer.
    pub(crate) fn new() -> Self {
        CopyState::Reading {
            buffer: alloc::vec![0u8; 8192],
        }
    }
}

/// Drive one copy direction, reading from `src` and writing to `dst`.
///
/// Returns `Ready` when the direction has finished, either on EOF or error.
pub(crate) fn poll_copy<S, D>(
    state: &mut CopyState,
    src: &mut S,
    dst: &mut D,
    cx: &mut Context<'_>,
) -> Poll<crate::Result<()>>
where
    S: AsyncRead + Unpin,
    D: AsyncWrite + Unpin,
{
    loop {
        match core::mem::replace(state, CopyState::Done) {
            CopyState::Reading { mut buffer } => {
                match Pin::new(&mut *src).poll_read(cx, &mut buffer) {
                    Poll::Pending => {
                        *state = CopyState::Reading { buffer };
                        return Poll::Pending;
                    }
                    Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                    Poll::Ready(Ok(0)) => return Poll::Ready(Ok(())),
                    Poll::Ready(Ok(nread)) => {
                        *state = CopyState::Writing {
                            buffer,
                            filled: nread,
                            offset: 0usize,
                        };
                    }
                }
            }
            CopyState::Writing {
                buffer,
                filled,
                offset,
            } => match Pin::new(&mut *dst).poll_write(cx, &buffer[offset..filled]) {
                Poll::Pending => {
                    *state = CopyState::Writing {
                        buffer,
                        filled,
                        offset,
                    };
                    return Poll::Pending;
                }
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                Poll::Ready(Ok(0)) =>
                    return Poll::Ready(Err(Error::Connection(ConnectionError::SocketClosed))),
                Poll::Ready(Ok(nwritten)) =>
                    if offset + nwritten == filled {
                        *state = CopyState::Reading { buffer };
                    } else {
                        *state = CopyState::Writing {
                            buffer,
                            filled,
                            offset: offset + nwritten,
                        };
                    },
            },
            CopyState::Done => return Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
#[allow(unused)]
pub fn init_logger() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "trace");
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
