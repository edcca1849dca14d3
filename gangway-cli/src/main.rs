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

//! `gangway` — a SAMv3 bridge.
//!
//! Runs the bridge over the built-in loopback router: destinations live
//! inside this process, which is what local development and client testing
//! need. Production deployments embed `gangway-core` against a real router
//! capability instead.

use anyhow::Context;
use clap::Parser;
use gangway_core::Bridge;
use gangway_util::{router::memory::MemoryRouter, runtime::tokio::Runtime};

use std::sync::Arc;

mod cli;
mod config;
mod logger;

/// Logging target for the file.
const LOG_TARGET: &str = "gangway";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let arguments = cli::Arguments::parse();

    let file = match &arguments.config {
        Some(path) => config::FileConfig::load(path)?,
        None => config::FileConfig::default(),
    };

    logger::init_logger(arguments.log.clone().or_else(|| file.log.clone()));

    let bridge_config = config::merge(&file, &arguments);

    let router = Arc::new(MemoryRouter::new());
    for entry in &file.names {
        router.register_name(&entry.name, &entry.destination);
    }

    let (bridge, mut handle) = Bridge::<Runtime>::new(
        bridge_config,
        Arc::clone(&router) as Arc<dyn gangway_core::router::RouterClient>,
        router as Arc<dyn gangway_core::router::StreamTransport>,
    )
    .await
    .context("failed to start bridge")?;

    tracing::info!(
        target: LOG_TARGET,
        tcp = ?handle.tcp_address(),
        udp = ?handle.udp_address(),
        "bridge running",
    );

    bridge.start();

    tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;

    tracing::info!(
        target: LOG_TARGET,
        "shutdown requested",
    );

    handle.stop();
    handle.stopped().await;

    Ok(())
}
