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

use crate::cli::Arguments;

use anyhow::Context;
use gangway_core::BridgeConfig;
use serde::Deserialize;

use std::path::Path;

/// On-disk configuration.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    /// Control listener port.
    pub tcp_port: Option<u16>,

    /// Datagram ingress port.
    pub udp_port: Option<u16>,

    /// Listen address.
    pub host: Option<String>,

    /// Whether handshakes require authentication.
    pub auth: Option<bool>,

    /// Logging targets.
    pub log: Option<String>,

    /// Host names pre-registered with the loopback router.
    #[serde(default)]
    pub names: Vec<NameEntry>,
}

/// One pre-registered name.
#[derive(Debug, Deserialize)]
pub struct NameEntry {
    /// Host name, e.g. `service.i2p`.
    pub name: String,

    /// Base64 destination it resolves to.
    pub destination: String,
}

impl FileConfig {
    /// Load the configuration from `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))
    }
}

/// Merge the configuration file and command line into a [`BridgeConfig`].
///
/// Command-line arguments win over the file.
pub fn merge(file: &FileConfig, arguments: &Arguments) -> BridgeConfig {
    let mut config = BridgeConfig::new();

    if let Some(port) = arguments.tcp_port.or(file.tcp_port) {
        config = config.with_tcp_port(port);
    }
    if let Some(port) = arguments.udp_port.or(file.udp_port) {
        config = config.with_udp_port(port);
    }
    if let Some(host) = arguments.host.as_ref().or(file.host.as_ref()) {
        config = config.with_host(host);
    }
    if arguments.auth.unwrap_or(false) || file.auth.unwrap_or(false) {
        config = config.with_auth_required(true);
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_file_config() {
        let config: FileConfig = toml::from_str(
            r#"
            tcp_port = 17656
            udp_port = 17655
            host = "0.0.0.0"
            auth = true

            [[names]]
            name = "service.i2p"
            destination = "AAAA"
            "#,
        )
        .unwrap();

        assert_eq!(config.tcp_port, Some(17656));
        assert_eq!(config.udp_port, Some(17655));
        assert_eq!(config.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(config.auth, Some(true));
        assert_eq!(config.names.len(), 1);
    }

    #[test]
    fn empty_file_config() {
        let config: FileConfig = toml::from_str("").unwrap();

        assert!(config.tcp_port.is_none());
        assert!(config.names.is_empty());
    }
}
