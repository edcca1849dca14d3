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

use clap::Parser;

use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about = "SAMv3 bridge over an in-process loopback router")]
pub struct Arguments {
    /// Path to a TOML configuration file
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Control listener port
    #[arg(long, value_name = "PORT")]
    pub tcp_port: Option<u16>,

    /// Datagram ingress port
    #[arg(long, value_name = "PORT")]
    pub udp_port: Option<u16>,

    /// Listen address for both sockets
    #[arg(long, value_name = "ADDRESS")]
    pub host: Option<String>,

    /// Logging targets
    ///
    /// By default, INFO is enabled for all logging targets
    ///
    /// Example:
    ///   -lgangway::sam=debug,gangway::sam::streaming=trace
    #[arg(short, long)]
    pub log: Option<String>,

    /// Require authentication on the control channel
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub auth: Option<bool>,
}
