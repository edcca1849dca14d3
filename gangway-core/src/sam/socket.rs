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
    error::ProtocolError,
    runtime::{AsyncRead, AsyncWrite, Runtime},
    sam::{parser::Command, MAX_LINE_LENGTH},
    util::AsyncWriteExt,
};

use futures::Stream;

use alloc::{collections::VecDeque, vec, vec::Vec};
use core::{
    mem,
    pin::Pin,
    task::{Context, Poll},
};

/// Logging target for the file.
const LOG_TARGET: &str = "gangway::sam::socket";

/// Write state.
enum WriteState {
    /// Read next outbound message from message buffer.
    GetMessage,

    /// Send message.
    SendMessage {
        /// Write offset.
        offset: usize,

        /// Response line, potentially partially written.
        message: Vec<u8>,
    },

    /// [`WriteState`] has been poisoned due to a bug.
    Poisoned,
}

/// Control-channel socket.
///
/// Reads `\n`-delimited command lines from the TCP stream and parses them
/// into [`Command`]s; queues response lines for writing. The stream ends on
/// socket closure, all other failures surface as per-line parse errors so
/// the connection can decide between responding and closing.
pub struct SamSocket<R: Runtime> {
    /// Pending outbound messages.
    pending_messages: VecDeque<Vec<u8>>,

    /// Read buffer, sized to the maximum line length.
    read_buffer: Vec<u8>,

    /// Number of valid bytes at the head of `read_buffer`.
    read_offset: usize,

    /// TCP stream.
    stream: R::TcpStream,

    /// Write state.
    write_state: WriteState,
}

impl<R: Runtime> SamSocket<R> {
    /// Create new [`SamSocket`] from an accepted TCP stream.
    pub fn new(stream: R::TcpStream) -> Self {
        Self {
            pending_messages: VecDeque::new(),
            read_buffer: vec![0u8; MAX_LINE_LENGTH],
            read_offset: 0usize,
            stream,
            write_state: WriteState::GetMessage,
        }
    }

    /// Queue `message` for delivery to the client.
    pub fn send_message(&mut self, message: Vec<u8>) {
        self.pending_messages.push_back(message);
    }

    /// Send `message` to the client and block until it has been written.
    pub async fn send_message_blocking(&mut self, message: Vec<u8>) -> crate::Result<()> {
        self.stream.write_all(&message).await
    }

    /// Deconstruct the socket for the hijack transition.
    ///
    /// Returns the TCP stream and any bytes the client sent past the last
    /// parsed command; a relay must forward those first. Queued but unwritten
    /// response lines are dropped, callers are expected to have flushed them.
    pub fn into_parts(self) -> (R::TcpStream, Vec<u8>) {
        let leftover = self.read_buffer[..self.read_offset].to_vec();

        (self.stream, leftover)
    }

    /// Read exactly `buffer.len()` payload bytes, consuming buffered bytes
    /// first.
    ///
    /// Used for the byte payload following `DATAGRAM SEND`/`RAW SEND` lines.
    /// `filled` tracks progress across polls.
    pub fn poll_read_exact(
        &mut self,
        cx: &mut Context<'_>,
        buffer: &mut [u8],
        filled: &mut usize,
    ) -> Poll<crate::Result<()>> {
        while *filled < buffer.len() {
            if self.read_offset > 0 {
                let take = core::cmp::min(self.read_offset, buffer.len() - *filled);
                buffer[*filled..*filled + take].copy_from_slice(&self.read_buffer[..take]);
                self.read_buffer.copy_within(take..self.read_offset, 0);
                self.read_offset -= take;
                *filled += take;
                continue;
            }

            match Pin::new(&mut self.stream).poll_read(cx, &mut buffer[*filled..]) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                Poll::Ready(Ok(0)) =>
                    return Poll::Ready(Err(crate::Error::Connection(
                        crate::error::ConnectionError::SocketClosed,
                    ))),
                Poll::Ready(Ok(nread)) => *filled += nread,
            }
        }

        Poll::Ready(Ok(()))
    }

    /// Read exactly `buffer.len()` payload bytes.
    pub async fn read_exact(&mut self, buffer: &mut [u8]) -> crate::Result<()> {
        let mut filled = 0usize;

        futures::future::poll_fn(|cx| {
            let socket = &mut *self;
            socket.poll_read_exact(cx, buffer, &mut filled)
        })
        .await
    }

    /// Take the next buffered line out of the read buffer, if one is
    /// complete.
    fn take_line(&mut self) -> Option<Result<Command, ProtocolError>> {
        let pos = self.read_buffer[..self.read_offset].iter().position(|byte| byte == &b'\n')?;

        let result = match core::str::from_utf8(&self.read_buffer[..pos]) {
            Ok(line) => Command::parse(line),
            Err(_) => Err(ProtocolError::InvalidUtf8),
        };

        // consume the line and its terminator, keeping any pipelined bytes
        self.read_buffer.copy_within(pos + 1..self.read_offset, 0);
        self.read_offset -= pos + 1;

        Some(result)
    }
}

impl<R: Runtime> Stream for SamSocket<R> {
    type Item = Result<Command, ProtocolError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        // flush queued responses before reading further commands so replies
        // are not delayed behind a quiet peer
        loop {
            match mem::replace(&mut this.write_state, WriteState::Poisoned) {
                WriteState::GetMessage => match this.pending_messages.pop_front() {
                    None => {
                        this.write_state = WriteState::GetMessage;
                        break;
                    }
                    Some(message) => {
                        this.write_state = WriteState::SendMessage {
                            offset: 0usize,
                            message,
                        };
                    }
                },
                WriteState::SendMessage { offset, message } =>
                    match Pin::new(&mut this.stream).poll_write(cx, &message[offset..]) {
                        Poll::Pending => {
                            this.write_state = WriteState::SendMessage { offset, message };
                            break;
                        }
                        Poll::Ready(Err(_)) | Poll::Ready(Ok(0)) => {
                            tracing::debug!(
                                target: LOG_TARGET,
                                "write failure, closing socket",
                            );

                            return Poll::Ready(None);
                        }
                        Poll::Ready(Ok(nwritten)) => match nwritten + offset == message.len() {
                            true => {
                                this.write_state = WriteState::GetMessage;
                            }
                            false => {
                                this.write_state = WriteState::SendMessage {
                                    offset: offset + nwritten,
                                    message,
                                };
                            }
                        },
                    },
                WriteState::Poisoned => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        "write state is poisoned",
                    );
                    debug_assert!(false);
                    return Poll::Ready(None);
                }
            }
        }

        loop {
            if let Some(result) = this.take_line() {
                return Poll::Ready(Some(result));
            }

            if this.read_offset == this.read_buffer.len() {
                // no line terminator within the maximum line length
                this.read_offset = 0;
                return Poll::Ready(Some(Err(ProtocolError::LineTooLong)));
            }

            match Pin::new(&mut this.stream).poll_read(cx, &mut this.read_buffer[this.read_offset..])
            {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(error)) => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        ?error,
                        "socket read error",
                    );

                    return Poll::Ready(None);
                }
                Poll::Ready(Ok(0)) => return Poll::Ready(None),
                Poll::Ready(Ok(nread)) => {
                    this.read_offset += nread;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{mock::MockRuntime, TcpStream as _};
    use futures::StreamExt;
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    async fn socket_pair() -> (tokio::net::TcpStream, SamSocket<MockRuntime>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (stream1, stream2) = tokio::join!(
            listener.accept(),
            crate::runtime::mock::MockTcpStream::connect(address)
        );

        (stream1.unwrap().0, SamSocket::new(stream2.unwrap()))
    }

    #[tokio::test]
    async fn read_command() {
        let (mut client, mut socket) = socket_pair().await;

        client.write_all(b"HELLO VERSION MIN=3.0 MAX=3.3\n").await.unwrap();

        let command = socket.next().await.unwrap().unwrap();
        assert_eq!(command.verb, "HELLO");
        assert_eq!(command.action.as_deref(), Some("VERSION"));
        assert_eq!(socket.read_offset, 0);
    }

    #[tokio::test]
    async fn pipelined_commands() {
        let (mut client, mut socket) = socket_pair().await;

        client.write_all(b"HELLO VERSION\nPING hello\n").await.unwrap();

        let first = socket.next().await.unwrap().unwrap();
        assert_eq!(first.verb, "HELLO");

        let second = socket.next().await.unwrap().unwrap();
        assert_eq!(second.verb, "PING");
        assert_eq!(second.payload.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn parse_error_keeps_socket_open() {
        let (mut client, mut socket) = socket_pair().await;

        client.write_all(b"NAMING LOOKUP NAME=\"unclosed\nPING\n").await.unwrap();

        match socket.next().await.unwrap() {
            Err(ProtocolError::UnclosedQuote) => {}
            result => panic!("unexpected result: {result:?}"),
        }

        let command = socket.next().await.unwrap().unwrap();
        assert_eq!(command.verb, "PING");
    }

    #[tokio::test]
    async fn invalid_utf8() {
        let (mut client, mut socket) = socket_pair().await;

        client.write_all(b"PING \xff\xfe\n").await.unwrap();

        match socket.next().await.unwrap() {
            Err(ProtocolError::InvalidUtf8) => {}
            result => panic!("unexpected result: {result:?}"),
        }
    }

    #[tokio::test]
    async fn line_of_max_length_accepted() {
        let (mut client, mut socket) = socket_pair().await;

        // command + padding option, exactly `MAX_LINE_LENGTH` bytes with the
        // terminator included
        let mut line = Vec::from(&b"PING "[..]);
        line.resize(MAX_LINE_LENGTH - 1, b'x');
        line.push(b'\n');
        client.write_all(&line).await.unwrap();

        let command = socket.next().await.unwrap().unwrap();
        assert_eq!(command.verb, "PING");
    }

    #[tokio::test]
    async fn line_over_max_length_rejected() {
        let (mut client, mut socket) = socket_pair().await;

        let mut line = Vec::from(&b"PING "[..]);
        line.resize(MAX_LINE_LENGTH, b'x');
        line.push(b'\n');
        client.write_all(&line).await.unwrap();

        match socket.next().await.unwrap() {
            Err(ProtocolError::LineTooLong) => {}
            result => panic!("unexpected result: {result:?}"),
        }
    }

    #[tokio::test]
    async fn socket_close_ends_stream() {
        let (client, mut socket) = socket_pair().await;

        drop(client);
        assert!(socket.next().await.is_none());
    }

    #[tokio::test]
    async fn queued_messages_are_flushed() {
        let (mut client, mut socket) = socket_pair().await;

        socket.send_message(b"HELLO REPLY RESULT=OK VERSION=3.3\n".to_vec());

        // polling the socket drives the write state machine
        client.write_all(b"PING\n").await.unwrap();
        let _ = socket.next().await.unwrap().unwrap();

        let mut buffer = vec![0u8; 64];
        let nread = tokio::io::AsyncReadExt::read(&mut client, &mut buffer).await.unwrap();
        assert_eq!(&buffer[..nread], b"HELLO REPLY RESULT=OK VERSION=3.3\n");
    }
}
