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

use crate::sam::{dispatch::CommandRouter, version::SamVersion};

use alloc::string::{String, ToString};
use core::time::Duration;

/// Hook invoked on the command routing table before the server starts.
///
/// Embedders use it to remap, remove or add handling for commands, e.g. to
/// install a custom unknown-command fallback.
pub type HandlerRegistrar = fn(&mut CommandRouter);

/// Bridge configuration.
///
/// Defaults follow the conventional SAM deployment: control listener on
/// `7656`, datagram ingress on `7655`, versions `3.0` through `3.3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Control listener port.
    pub tcp_port: u16,

    /// Datagram ingress port.
    pub udp_port: u16,

    /// Listen address for both sockets.
    pub host: String,

    /// Lowest protocol version offered.
    pub min_version: SamVersion,

    /// Highest protocol version offered.
    pub max_version: SamVersion,

    /// Whether `HELLO VERSION` must carry valid credentials.
    pub auth_required: bool,

    /// Deadline for completing the handshake.
    pub handshake_timeout: Duration,

    /// Idle deadline between commands.
    pub command_timeout: Duration,

    /// Deadline for answering a server-initiated `PING`.
    pub pong_timeout: Duration,

    /// Idle interval after which the server pings the client; `None`
    /// disables server-initiated keepalive.
    pub keepalive_interval: Option<Duration>,

    /// Deadline for the router to build a new session's tunnels.
    pub tunnel_build_timeout: Duration,

    /// Grace period given to live connections on shutdown.
    pub shutdown_timeout: Duration,

    /// Command-table hook applied before the server starts.
    pub registrar: Option<HandlerRegistrar>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tcp_port: 7656u16,
            udp_port: 7655u16,
            host: "127.0.0.1".to_string(),
            min_version: SamVersion::V30,
            max_version: SamVersion::V33,
            auth_required: false,
            handshake_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(30),
            keepalive_interval: None,
            tunnel_build_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            registrar: None,
        }
    }
}

impl BridgeConfig {
    /// Create a config with the standard defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the control listener port. Port `0` binds an ephemeral port.
    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self
    }

    /// Set the datagram ingress port. Port `0` binds an ephemeral port.
    pub fn with_udp_port(mut self, port: u16) -> Self {
        self.udp_port = port;
        self
    }

    /// Set the listen address.
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Set the offered version range.
    pub fn with_versions(mut self, min: SamVersion, max: SamVersion) -> Self {
        self.min_version = min;
        self.max_version = max;
        self
    }

    /// Require authentication on new handshakes.
    pub fn with_auth_required(mut self, required: bool) -> Self {
        self.auth_required = required;
        self
    }

    /// Enable server-initiated keepalive pings.
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    /// Install a command-table hook.
    pub fn with_registrar(mut self, registrar: HandlerRegistrar) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.min_version > self.max_version {
            return Err(crate::Error::InvalidState);
        }
        if self.host.parse::<core::net::IpAddr>().is_err() {
            return Err(crate::Error::InvalidState);
        }

        Ok(())
    }
}
