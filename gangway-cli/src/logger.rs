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

use tracing::Level;
use tracing_subscriber::filter::{LevelFilter, Targets};

use std::str::FromStr;

/// Parse a string of logging targets into [`Targets`].
///
/// INFO is enabled by default. The format is a comma-separated list of
/// `target[=level]` entries, e.g.
/// `gangway::sam=debug,gangway::sam::streaming=trace`.
pub(super) fn parse_log_targets(log: Option<String>) -> Targets {
    let mut targets = Targets::new().with_target("", Level::INFO);

    let Some(log) = log else {
        return targets;
    };

    for entry in log.split(',') {
        let mut split = entry.split('=');
        let Some(target) = split.next() else {
            continue;
        };

        let level = split
            .next()
            .and_then(|level| LevelFilter::from_str(level).ok())
            .unwrap_or(LevelFilter::TRACE);

        targets = targets.with_target(target, level);
    }

    targets
}

/// Install the global subscriber.
pub fn init_logger(log: Option<String>) {
    use tracing_subscriber::prelude::*;

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(parse_log_targets(log))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_info() {
        let targets = parse_log_targets(None);

        assert!(targets.would_enable("anything", &Level::INFO));
        assert!(!targets.would_enable("anything", &Level::DEBUG));
    }

    #[test]
    fn explicit_levels() {
        let targets =
            parse_log_targets(Some("gangway::sam=debug,gangway::sam::streaming".to_string()));

        let targets = targets.into_iter().collect::<Vec<_>>();
        assert!(targets
            .iter()
            .any(|(target, level)| target == "gangway::sam" && *level == LevelFilter::DEBUG));
        assert!(targets.iter().any(
            |(target, level)| target == "gangway::sam::streaming" && *level == LevelFilter::TRACE
        ));
    }
}
