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

use alloc::string::String;
use core::fmt;

/// Result code sent to the client on the `RESULT=` key of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Operation succeeded.
    Ok,

    /// Version negotiation found no overlap.
    NoVersion,

    /// Generic error, accompanied by `MESSAGE=`.
    I2pError,

    /// Malformed destination or key material.
    InvalidKey,

    /// Unknown session nickname.
    InvalidId,

    /// Name lookup miss.
    KeyNotFound,

    /// Remote peer doesn't exist.
    PeerNotFound,

    /// Remote peer's lease set was not found.
    LeaseSetNotFound,

    /// Remote peer could not be contacted.
    CantReachPeer,

    /// Deadline exceeded.
    Timeout,

    /// Session nickname already in use.
    DuplicatedId,

    /// Destination already in use by another session.
    DuplicatedDest,

    /// Second concurrent `STREAM ACCEPT` on a pre-3.2 session.
    AlreadyAccepting,
}

impl ResultCode {
    /// String form used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NoVersion => "NOVERSION",
            Self::I2pError => "I2P_ERROR",
            Self::InvalidKey => "INVALID_KEY",
            Self::InvalidId => "INVALID_ID",
            Self::KeyNotFound => "KEY_NOT_FOUND",
            Self::PeerNotFound => "PEER_NOT_FOUND",
            Self::LeaseSetNotFound => "LEASESET_NOT_FOUND",
            Self::CantReachPeer => "CANT_REACH_PEER",
            Self::Timeout => "TIMEOUT",
            Self::DuplicatedId => "DUPLICATED_ID",
            Self::DuplicatedDest => "DUPLICATED_DEST",
            Self::AlreadyAccepting => "ALREADY_ACCEPTING",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command parsing error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Empty command line.
    EmptyCommand,

    /// Quoted value was not terminated before end of line.
    UnclosedQuote,

    /// Line ended with a bare backslash.
    TrailingBackslash,

    /// Escape sequence other than `\"` or `\\` inside a quoted value.
    InvalidEscape,

    /// Line contained invalid UTF-8.
    InvalidUtf8,

    /// Line exceeded the maximum line length.
    LineTooLong,

    /// `KEY=VALUE` option was malformed.
    InvalidOption,

    /// No handler for the command.
    UnknownCommand,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyCommand => write!(f, "empty command line"),
            Self::UnclosedQuote => write!(f, "unclosed quote"),
            Self::TrailingBackslash => write!(f, "trailing backslash"),
            Self::InvalidEscape => write!(f, "invalid escape sequence"),
            Self::InvalidUtf8 => write!(f, "invalid utf-8"),
            Self::LineTooLong => write!(f, "line too long"),
            Self::InvalidOption => write!(f, "malformed option"),
            Self::UnknownCommand => write!(f, "unknown command"),
        }
    }
}

/// Connection error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Socket closed.
    SocketClosed,

    /// Failed to bind to socket.
    BindFailure,

    /// Client did not complete the handshake in time.
    HandshakeTimeout,

    /// No command received within the idle deadline.
    CommandTimeout,

    /// `PONG` was not received in time for a server-initiated `PING`.
    KeepAliveTimeout,

    /// Second `HELLO VERSION` on an already-handshaked connection.
    DuplicateHandshake,

    /// Command received before `HELLO VERSION`.
    HandshakeMissing,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SocketClosed => write!(f, "socket closed"),
            Self::BindFailure => write!(f, "failed to bind to socket"),
            Self::HandshakeTimeout => write!(f, "handshake timeout"),
            Self::CommandTimeout => write!(f, "command timeout"),
            Self::KeepAliveTimeout => write!(f, "keep-alive timeout"),
            Self::DuplicateHandshake => write!(f, "duplicate handshake"),
            Self::HandshakeMissing => write!(f, "handshake missing"),
        }
    }
}

/// Session registry error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Nickname already in use by a live session or subsession.
    DuplicateNickname,

    /// Destination already in use by a live session.
    DuplicateDestination,

    /// Nickname doesn't name a live session.
    NicknameDoesntExist,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateNickname => write!(f, "nickname already exists"),
            Self::DuplicateDestination => write!(f, "destination already in use"),
            Self::NicknameDoesntExist => write!(f, "nickname doesn't exist"),
        }
    }
}

/// Destination parsing error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationError {
    /// Input was not valid I2P Base64.
    InvalidEncoding,

    /// Decoded blob is too short to contain a destination.
    NotEnoughBytes,

    /// Signature type is not supported.
    UnsupportedSignatureType(u16),

    /// Blob structure is invalid.
    Malformed,
}

impl fmt::Display for DestinationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEncoding => write!(f, "invalid base64 encoding"),
            Self::NotEnoughBytes => write!(f, "not enough bytes"),
            Self::UnsupportedSignatureType(sig_type) =>
                write!(f, "unsupported signature type ({sig_type})"),
            Self::Malformed => write!(f, "malformed destination"),
        }
    }
}

/// Name lookup error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Name is not known to the router.
    KeyNotFound,

    /// Lookup did not finish before the deadline.
    Timeout,

    /// Name was syntactically invalid.
    InvalidName,

    /// Router-side failure, with a human-readable reason.
    Router(String),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyNotFound => write!(f, "key not found"),
            Self::Timeout => write!(f, "lookup timed out"),
            Self::InvalidName => write!(f, "invalid name"),
            Self::Router(reason) => write!(f, "router failure: {reason}"),
        }
    }
}

/// Remote peer error, reported by the stream transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Peer exists but could not be contacted.
    Unreachable,

    /// Peer doesn't exist.
    NotFound,

    /// Peer's lease set was not found.
    LeaseSetNotFound,

    /// Dial or accept did not finish before the deadline.
    Timeout,
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable => write!(f, "peer unreachable"),
            Self::NotFound => write!(f, "peer not found"),
            Self::LeaseSetNotFound => write!(f, "lease set not found"),
            Self::Timeout => write!(f, "peer operation timed out"),
        }
    }
}

/// Session-level error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Second concurrent `STREAM ACCEPT` on a session negotiated below 3.2.
    AlreadyAccepting,

    /// `STREAM ACCEPT` while a forward is configured, or vice versa.
    ListenerConflict,

    /// Command not valid for the session's style.
    WrongStyle,

    /// Protocol number not allowed for the operation.
    DisallowedProtocol(u8),

    /// Duplicate `(port, protocol)` route in a primary session.
    DuplicateRoute,

    /// Streaming protocol routed towards a raw subsession.
    StreamingToRaw,

    /// Subsession operation on a session that is not primary.
    NotPrimary,

    /// Primary-only operation attempted with a primary style argument.
    NestedPrimary,

    /// Datagram exceeds the maximum size for its style.
    DatagramTooLarge,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyAccepting => write!(f, "accept already pending"),
            Self::ListenerConflict => write!(f, "accept and forward are mutually exclusive"),
            Self::WrongStyle => write!(f, "operation not supported by session style"),
            Self::DisallowedProtocol(protocol) => write!(f, "protocol {protocol} not allowed"),
            Self::DuplicateRoute => write!(f, "duplicate (port, protocol) route"),
            Self::StreamingToRaw => write!(f, "streaming protocol cannot route to raw"),
            Self::NotPrimary => write!(f, "session is not primary"),
            Self::NestedPrimary => write!(f, "subsession cannot be primary"),
            Self::DatagramTooLarge => write!(f, "datagram exceeds maximum size"),
        }
    }
}

/// Channel error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Channel is full.
    Full,

    /// Channel is closed.
    Closed,

    /// Channel doesn't exist.
    DoesntExist,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "channel full"),
            Self::Closed => write!(f, "channel closed"),
            Self::DoesntExist => write!(f, "channel doesn't exist"),
        }
    }
}

impl<T> From<thingbuf::mpsc::errors::TrySendError<T>> for ChannelError {
    fn from(value: thingbuf::mpsc::errors::TrySendError<T>) -> Self {
        match value {
            thingbuf::mpsc::errors::TrySendError::Full(_) => ChannelError::Full,
            thingbuf::mpsc::errors::TrySendError::Closed(_) => ChannelError::Closed,
            _ => unreachable!(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Protocol(ProtocolError),
    Connection(ConnectionError),
    Registry(RegistryError),
    Destination(DestinationError),
    Query(QueryError),
    Peer(PeerError),
    Session(SessionError),
    Channel(ChannelError),
    Router(String),
    Timeout,
    InvalidState,
    EssentialTaskClosed,

    /// Out-of-band unwind for `SILENT=true` failure paths.
    ///
    /// Not a regular error: the connection is closed without a response and
    /// the condition is never logged at error level.
    SilentClose,
}

impl Error {
    /// Map the error to the result code reported to the client.
    ///
    /// [`Error::SilentClose`] never reaches a response line; its mapping here
    /// exists only so the conversion is total.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::Registry(RegistryError::DuplicateNickname) => ResultCode::DuplicatedId,
            Self::Registry(RegistryError::DuplicateDestination) => ResultCode::DuplicatedDest,
            Self::Registry(RegistryError::NicknameDoesntExist) => ResultCode::InvalidId,
            Self::Destination(_) => ResultCode::InvalidKey,
            Self::Query(QueryError::KeyNotFound) => ResultCode::KeyNotFound,
            Self::Query(QueryError::Timeout) => ResultCode::Timeout,
            Self::Query(_) => ResultCode::InvalidKey,
            Self::Peer(PeerError::Unreachable) => ResultCode::CantReachPeer,
            Self::Peer(PeerError::NotFound) => ResultCode::PeerNotFound,
            Self::Peer(PeerError::LeaseSetNotFound) => ResultCode::LeaseSetNotFound,
            Self::Peer(PeerError::Timeout) => ResultCode::Timeout,
            Self::Session(SessionError::AlreadyAccepting) => ResultCode::AlreadyAccepting,
            Self::Timeout => ResultCode::Timeout,
            _ => ResultCode::I2pError,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(error) => write!(f, "protocol error: {error}"),
            Self::Connection(error) => write!(f, "connection error: {error}"),
            Self::Registry(error) => write!(f, "registry error: {error}"),
            Self::Destination(error) => write!(f, "destination error: {error}"),
            Self::Query(error) => write!(f, "query error: {error}"),
            Self::Peer(error) => write!(f, "peer error: {error}"),
            Self::Session(error) => write!(f, "session error: {error}"),
            Self::Channel(error) => write!(f, "channel error: {error}"),
            Self::Router(reason) => write!(f, "router error: {reason}"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::EssentialTaskClosed => write!(f, "essential task closed"),
            Self::SilentClose => write!(f, "silent close"),
        }
    }
}

impl core::error::Error for Error {}

impl From<ProtocolError> for Error {
    fn from(value: ProtocolError) -> Self {
        Error::Protocol(value)
    }
}

impl From<ConnectionError> for Error {
    fn from(value: ConnectionError) -> Self {
        Error::Connection(value)
    }
}

impl From<RegistryError> for Error {
    fn from(value: RegistryError) -> Self {
        Error::Registry(value)
    }
}

impl From<DestinationError> for Error {
    fn from(value: DestinationError) -> Self {
        Error::Destination(value)
    }
}

impl From<QueryError> for Error {
    fn from(value: QueryError) -> Self {
        Error::Query(value)
    }
}

impl From<PeerError> for Error {
    fn from(value: PeerError) -> Self {
        Error::Peer(value)
    }
}

impl From<SessionError> for Error {
    fn from(value: SessionError) -> Self {
        Error::Session(value)
    }
}

impl From<ChannelError> for Error {
    fn from(value: ChannelError) -> Self {
        Error::Channel(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_mapping() {
        assert_eq!(
            Error::Registry(RegistryError::DuplicateNickname).result_code(),
            ResultCode::DuplicatedId
        );
        assert_eq!(
            Error::Registry(RegistryError::DuplicateDestination).result_code(),
            ResultCode::DuplicatedDest
        );
        assert_eq!(
            Error::Registry(RegistryError::NicknameDoesntExist).result_code(),
            ResultCode::InvalidId
        );
        assert_eq!(
            Error::Destination(DestinationError::Malformed).result_code(),
            ResultCode::InvalidKey
        );
        assert_eq!(
            Error::Query(QueryError::KeyNotFound).result_code(),
            ResultCode::KeyNotFound
        );
        assert_eq!(
            Error::Peer(PeerError::Unreachable).result_code(),
            ResultCode::CantReachPeer
        );
        assert_eq!(
            Error::Session(SessionError::AlreadyAccepting).result_code(),
            ResultCode::AlreadyAccepting
        );
        assert_eq!(Error::Timeout.result_code(), ResultCode::Timeout);
        assert_eq!(
            Error::Router(alloc::string::String::from("tunnel build failure")).result_code(),
            ResultCode::I2pError
        );
    }
}
